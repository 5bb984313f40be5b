//! Per-class greedy non-maximum suppression.

use crate::{common::*, decode::Detections, iou::iou_matrix, utils::TensorExt as _};

/// Visits boxes in descending score order and keeps a box unless its IoU
/// with an already kept box exceeds `iou_threshold`. Equal scores keep the
/// original order.
fn greedy_suppression<F>(scores: &[f64], iou_threshold: f64, iou: F) -> Vec<usize>
where
    F: Fn(usize, usize) -> f64,
{
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&lhs, &rhs| scores[rhs].total_cmp(&scores[lhs]));

    let mut keep: Vec<usize> = vec![];
    for index in order {
        let suppressed = keep.iter().any(|&kept| iou(kept, index) > iou_threshold);
        if !suppressed {
            keep.push(index);
        }
    }
    keep
}

/// Runs NMS on `[n, 4]` xyxy boxes with `[n]` scores and returns the kept
/// indexes as an Int64 tensor on the device of `boxes`.
pub fn nms(boxes: &Tensor, scores: &Tensor, iou_threshold: f64) -> Result<Tensor> {
    let (num_boxes, entries) = boxes.size2()?;
    ensure!(
        entries == 4,
        "boxes must have shape [n, 4], but get {:?}",
        boxes.size()
    );
    ensure!(
        scores.size() == [num_boxes],
        "expect {} scores, but get shape {:?}",
        num_boxes,
        scores.size()
    );

    let ious = tch::no_grad(|| iou_matrix(boxes, boxes))?.to_f32_vec();
    let scores: Vec<f64> = scores.to_f32_vec().into_iter().map(|s| s as f64).collect();
    let num_boxes = num_boxes as usize;

    let keep: Vec<i64> = greedy_suppression(&scores, iou_threshold, |lhs, rhs| {
        ious[lhs * num_boxes + rhs] as f64
    })
    .into_iter()
    .map(|index| index as i64)
    .collect();

    Ok(Tensor::of_slice(&keep).to_device(boxes.device()))
}

#[derive(Debug, Clone)]
pub struct NonMaxSuppressionInit {
    pub iou_threshold: R64,
}

impl Default for NonMaxSuppressionInit {
    fn default() -> Self {
        Self {
            iou_threshold: r64(0.4),
        }
    }
}

impl NonMaxSuppressionInit {
    pub fn build(self) -> Result<NonMaxSuppression> {
        let Self { iou_threshold } = self;
        ensure!(
            (0.0..=1.0).contains(&iou_threshold.raw()),
            "iou_threshold must be in range [0, 1]"
        );
        Ok(NonMaxSuppression { iou_threshold })
    }
}

/// Suppresses overlapping detections independently for each class, ranked
/// by objectness confidence.
#[derive(Debug, Clone)]
pub struct NonMaxSuppression {
    iou_threshold: R64,
}

impl NonMaxSuppression {
    pub fn forward(&self, detections: &Detections) -> Result<Detections> {
        if detections.is_empty() {
            return Ok(Detections::empty(detections.device()));
        }

        let iou_threshold = self.iou_threshold.raw();
        let device = detections.device();
        let labels = detections.labels.to_i64_vec();

        // group by class in ascending class order
        let groups = labels
            .iter()
            .enumerate()
            .map(|(index, &label)| (label, index as i64))
            .into_group_map()
            .into_iter()
            .sorted_by_key(|(label, _)| *label);

        let mut keep: Vec<i64> = vec![];
        for (_, members) in groups {
            let members = Tensor::of_slice(&members).to_device(device);
            let kept = nms(
                &detections.boxes.index_select(0, &members),
                &detections.confidences.index_select(0, &members),
                iou_threshold,
            )?;
            keep.extend(members.index_select(0, &kept).to_i64_vec());
        }

        let keep = Tensor::of_slice(&keep).to_device(detections.device());
        Ok(detections.index_select(&keep))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    fn random_boxes(rng: &mut impl Rng, count: usize) -> Tensor {
        let values: Vec<f32> = (0..count)
            .flat_map(|_| {
                let x1 = rng.gen_range(0.0..0.6);
                let y1 = rng.gen_range(0.0..0.6);
                let w = rng.gen_range(0.01..0.4);
                let h = rng.gen_range(0.01..0.4);
                [x1, y1, x1 + w, y1 + h]
            })
            .collect();
        Tensor::of_slice(&values).view([count as i64, 4])
    }

    #[test]
    fn threshold_one_keeps_all() -> Result<()> {
        let mut rng = rand::thread_rng();
        let boxes = random_boxes(&mut rng, 50);
        let scores: Vec<f32> = (0..50).map(|_| rng.gen_range(0.0..1.0)).collect();

        let mut keep = nms(&boxes, &Tensor::of_slice(&scores), 1.0)?.to_i64_vec();
        keep.sort_unstable();
        assert_eq!(keep, (0..50).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn threshold_zero_keeps_top_of_overlapping_boxes() -> Result<()> {
        let boxes = Tensor::of_slice(&[
            0.10f32, 0.10, 0.30, 0.30, //
            0.15, 0.15, 0.35, 0.35, //
            0.20, 0.20, 0.40, 0.40, //
            0.12, 0.12, 0.32, 0.32,
        ])
        .view([4, 4]);
        let scores = Tensor::of_slice(&[0.3f32, 0.9, 0.5, 0.7]);

        let keep = nms(&boxes, &scores, 0.0)?;
        assert_eq!(keep.to_i64_vec(), vec![1]);

        // a non-overlapping box survives
        let boxes = Tensor::cat(
            &[boxes, Tensor::of_slice(&[0.7f32, 0.7, 0.8, 0.8]).view([1, 4])],
            0,
        );
        let scores = Tensor::of_slice(&[0.3f32, 0.9, 0.5, 0.7, 0.1]);
        let keep = nms(&boxes, &scores, 0.0)?;
        assert_eq!(keep.to_i64_vec(), vec![1, 4]);
        Ok(())
    }

    #[test]
    fn equal_scores_keep_original_order() -> Result<()> {
        let boxes = Tensor::of_slice(&[
            0.6f32, 0.6, 0.7, 0.7, //
            0.1, 0.1, 0.2, 0.2, //
            0.1, 0.1, 0.2, 0.2,
        ])
        .view([3, 4]);
        let scores = Tensor::of_slice(&[0.5f32, 0.5, 0.5]);
        assert_eq!(nms(&boxes, &scores, 0.5)?.to_i64_vec(), vec![0, 1]);
        Ok(())
    }

    #[test]
    fn suppression_is_per_class() -> Result<()> {
        let boxes = Tensor::of_slice(&[
            0.1f32, 0.1, 0.3, 0.3, //
            0.1, 0.1, 0.3, 0.3, //
            0.11, 0.11, 0.31, 0.31,
        ])
        .view([3, 4]);
        let detections = Detections {
            boxes,
            labels: Tensor::of_slice(&[2i64, 0, 2]),
            confidences: Tensor::of_slice(&[0.6f32, 0.4, 0.8]),
            class_scores: Tensor::of_slice(&[1f32, 1.0, 1.0]),
        };

        let nms = NonMaxSuppressionInit::default().build()?;
        let kept = nms.forward(&detections)?;
        assert_eq!(kept.labels.to_i64_vec(), vec![0, 2]);
        assert_abs_diff_eq!(kept.confidences.to_f32_vec()[1], 0.8);

        let empty = nms.forward(&Detections::empty(Device::Cpu))?;
        assert!(empty.is_empty());
        assert_eq!(empty.boxes.size(), vec![0, 4]);
        Ok(())
    }
}
