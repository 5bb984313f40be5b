//! Decoding of dense grid predictions into sparse box lists.

use crate::{common::*, config::GridConfig, utils::TensorExt as _};

/// Detections of a single sample in normalized image coordinates.
#[derive(Debug, TensorLike)]
pub struct Detections {
    /// Boxes in `[x1, y1, x2, y2]` order, shape `[n, 4]`.
    pub boxes: Tensor,
    /// Class ids, shape `[n]`.
    pub labels: Tensor,
    /// Objectness of the box slot, shape `[n]`.
    pub confidences: Tensor,
    /// Score of the winning class of the cell, shape `[n]`.
    pub class_scores: Tensor,
}

impl Detections {
    pub fn empty(device: Device) -> Self {
        Self {
            boxes: Tensor::zeros(&[0, 4], (Kind::Float, device)),
            labels: Tensor::zeros(&[0], (Kind::Int64, device)),
            confidences: Tensor::zeros(&[0], (Kind::Float, device)),
            class_scores: Tensor::zeros(&[0], (Kind::Float, device)),
        }
    }

    pub fn len(&self) -> usize {
        self.labels.size()[0] as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn device(&self) -> Device {
        self.boxes.device()
    }

    /// Product of confidence and class score.
    pub fn probabilities(&self) -> Tensor {
        &self.confidences * &self.class_scores
    }

    pub fn index_select(&self, indexes: &Tensor) -> Self {
        Self {
            boxes: self.boxes.index_select(0, indexes),
            labels: self.labels.index_select(0, indexes),
            confidences: self.confidences.index_select(0, indexes),
            class_scores: self.class_scores.index_select(0, indexes),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PredictionDecoderInit {
    pub grid: GridConfig,
    pub confidence_threshold: R64,
    pub probability_threshold: R64,
}

impl PredictionDecoderInit {
    pub fn build(self) -> Result<PredictionDecoder> {
        let Self {
            grid,
            confidence_threshold,
            probability_threshold,
        } = self;

        grid.validate()?;
        ensure!(
            (0.0..=1.0).contains(&confidence_threshold.raw()),
            "confidence_threshold must be in range [0, 1]"
        );
        ensure!(
            (0.0..=1.0).contains(&probability_threshold.raw()),
            "probability_threshold must be in range [0, 1]"
        );

        Ok(PredictionDecoder {
            grid,
            confidence_threshold,
            probability_threshold,
        })
    }
}

/// Turns a `[S, S, 5B + C]` grid into a list of detections.
#[derive(Debug, Clone)]
pub struct PredictionDecoder {
    grid: GridConfig,
    confidence_threshold: R64,
    probability_threshold: R64,
}

impl PredictionDecoder {
    pub fn grid(&self) -> &GridConfig {
        &self.grid
    }

    pub fn decode(&self, grid: &Tensor) -> Result<Detections> {
        let expect = self.grid.shape();
        ensure!(
            grid.size() == expect,
            "grid must have shape {:?}, but get {:?}",
            expect,
            grid.size()
        );

        let GridConfig {
            grid_size,
            boxes_per_cell,
            num_classes,
        } = self.grid;
        let num_entries = self.grid.num_entries();
        let class_offset = self.grid.class_offset();
        let cell_size = self.grid.cell_size();
        let confidence_threshold = self.confidence_threshold.raw();
        let probability_threshold = self.probability_threshold.raw();
        let device = grid.device();

        let values = grid.to_f32_vec();

        // i walks along x, j along y. The tensor is laid out as [j][i].
        let (boxes, labels, confidences, class_scores) = iproduct!(0..grid_size, 0..grid_size)
            .flat_map(|(i, j)| {
                let cell = &values[(j * grid_size + i) * num_entries..][..num_entries];

                // the first maximum wins on ties
                let (label, class_score) = cell[class_offset..(class_offset + num_classes)]
                    .iter()
                    .copied()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |(best, best_score), (index, score)| {
                        if score > best_score {
                            (index, score)
                        } else {
                            (best, best_score)
                        }
                    });

                (0..boxes_per_cell).filter_map(move |slot| {
                    let entry = &cell[5 * slot..(5 * slot + 5)];
                    let confidence = entry[4];
                    if (confidence as f64) < confidence_threshold {
                        return None;
                    }
                    let probability = confidence * class_score;
                    if (probability as f64) < probability_threshold {
                        return None;
                    }

                    let cx = (entry[0] as f64 + i as f64) * cell_size;
                    let cy = (entry[1] as f64 + j as f64) * cell_size;
                    let (w, h) = (entry[2] as f64, entry[3] as f64);
                    let xyxy = [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]
                        .map(|v| v as f32);

                    Some((xyxy, label as i64, confidence, class_score))
                })
            })
            .unzip_n_vec();

        if labels.is_empty() {
            return Ok(Detections::empty(device));
        }

        Ok(Detections {
            boxes: Tensor::of_slice(&boxes.concat()).view([-1, 4]).to_device(device),
            labels: Tensor::of_slice(&labels).to_device(device),
            confidences: Tensor::of_slice(&confidences).to_device(device),
            class_scores: Tensor::of_slice(&class_scores).to_device(device),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::TargetEncoder;

    fn host_boxes(detections: &Detections) -> Result<Vec<TLBR<f32>>> {
        detections
            .boxes
            .to_f32_vec()
            .chunks(4)
            .map(|xyxy| TLBR::try_from_xyxy([xyxy[0], xyxy[1], xyxy[2], xyxy[3]]))
            .collect()
    }

    fn decoder(threshold: f64) -> PredictionDecoder {
        PredictionDecoderInit {
            grid: GridConfig::default(),
            confidence_threshold: r64(threshold),
            probability_threshold: r64(threshold),
        }
        .build()
        .unwrap()
    }

    #[test]
    fn encode_decode_round_trip() -> Result<()> {
        let encoder = TargetEncoder::new(GridConfig::default(), Default::default())?;
        let decoder = decoder(0.0);

        let samples = [
            [0.23f32, 0.16, 0.43, 0.26],
            [0.61, 0.70, 0.68, 0.93],
            [0.01, 0.02, 0.05, 0.04],
        ];

        for (label, xyxy) in samples.iter().enumerate() {
            let orig = TLBR::try_from_xyxy(*xyxy)?;
            let target = encoder.encode_boxes(&[orig], &[label as i64])?;
            let detections = decoder.decode(&target)?;

            // zero thresholds keep every slot of every cell
            assert_eq!(detections.len(), 16 * 16 * 2);

            let labels = detections.labels.to_i64_vec();
            let best = izip!(host_boxes(&detections)?, labels)
                .filter(|(_, found)| *found == label as i64)
                .map(|(rect, _)| rect.iou_with(&orig))
                .fold(0.0, f32::max);
            assert!(best > 0.99, "best iou {} for {:?}", best, xyxy);
        }
        Ok(())
    }

    #[test]
    fn probability_filter() -> Result<()> {
        let encoder = TargetEncoder::new(GridConfig::default(), Default::default())?;
        let rect = TLBR::try_from_xyxy([0.30, 0.30, 0.40, 0.40])?;
        let target = encoder.encode_boxes(&[rect], &[5])?;

        let detections = decoder(0.5).decode(&target)?;
        assert_eq!(detections.len(), 2);
        assert_eq!(detections.labels.to_i64_vec(), vec![5, 5]);
        host_boxes(&detections)?
            .iter()
            .for_each(|found| assert!(found.iou_with(&rect) > 0.99));
        assert_abs_diff_eq!(
            detections.probabilities().to_f32_vec()[0],
            1.0,
            epsilon = 1e-6
        );
        Ok(())
    }

    #[test]
    fn empty_detections_are_typed() -> Result<()> {
        let grid = Tensor::zeros(&[16, 16, 20], FLOAT_CPU);
        let detections = decoder(0.1).decode(&grid)?;
        assert!(detections.is_empty());
        assert_eq!(detections.boxes.size(), vec![0, 4]);
        assert_eq!(detections.labels.kind(), Kind::Int64);
        assert_eq!(detections.confidences.size(), vec![0]);
        assert_eq!(detections.class_scores.size(), vec![0]);
        Ok(())
    }

    #[test]
    fn transposed_cell_convention() -> Result<()> {
        let mut values = vec![0f32; 16 * 16 * 20];
        // row j = 2, column i = 9
        let cell = &mut values[(2 * 16 + 9) * 20..][..20];
        cell[..5].copy_from_slice(&[0.5, 0.5, 0.05, 0.05, 0.9]);
        cell[10 + 1] = 0.8;
        cell[10 + 6] = 0.8;
        let grid = Tensor::of_slice(&values).view([16, 16, 20]);

        let detections = decoder(0.1).decode(&grid)?;
        assert_eq!(detections.len(), 1);
        // first maximum wins
        assert_eq!(detections.labels.to_i64_vec(), vec![1]);

        let rect = host_boxes(&detections)?[0];
        assert_abs_diff_eq!(rect.cx(), 9.5 / 16.0, epsilon = 1e-6);
        assert_abs_diff_eq!(rect.cy(), 2.5 / 16.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn reject_misshaped_grid() {
        let grid = Tensor::zeros(&[16, 16, 19], FLOAT_CPU);
        assert!(decoder(0.1).decode(&grid).is_err());
    }
}
