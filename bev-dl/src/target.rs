//! Encoding of ground truth boxes into dense grid targets.

use crate::{common::*, config::GridConfig, frame::PhysicalFrame, utils::TensorExt as _};

/// Ground truth of one sample in the physical frame.
#[derive(Debug, TensorLike)]
pub struct GroundTruth {
    /// Box polygons in shape `[n, 2, 4]`. Row 0 holds x, row 1 holds y.
    pub polygons: Tensor,
    /// Category ids in shape `[n]`.
    pub categories: Tensor,
}

/// Maps ground truth boxes and labels to `[S, S, 5B + C]` grid tensors.
///
/// All `B` box slots of an occupied cell receive the same box. The slot
/// responsible for the box is decided later by the loss function. When two
/// boxes fall into the same cell, the later one replaces the earlier one.
#[derive(Debug, Clone)]
pub struct TargetEncoder {
    grid: GridConfig,
    frame: PhysicalFrame,
}

impl TargetEncoder {
    pub fn new(grid: GridConfig, frame: PhysicalFrame) -> Result<Self> {
        grid.validate()?;
        Ok(Self { grid, frame })
    }

    pub fn grid(&self) -> &GridConfig {
        &self.grid
    }

    /// Cell index along one axis for a normalized center coordinate.
    ///
    /// A center lying exactly on a cell boundary belongs to the cell with the
    /// lower index. The result is clamped into the grid.
    pub fn cell_index(&self, center: f32) -> usize {
        let last = self.grid.grid_size as i64 - 1;
        let index = (center / self.cell_size()).ceil() as i64 - 1;
        index.clamp(0, last) as usize
    }

    fn cell_size(&self) -> f32 {
        self.grid.cell_size() as f32
    }

    /// Encodes normalized `[n, 4]` xyxy boxes with `[n]` class labels.
    ///
    /// Box geometry is computed in single precision. The returned tensor is
    /// a float tensor on the device of `boxes`.
    pub fn encode(&self, boxes: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let num_boxes = match boxes.size().as_slice() {
            &[num, 4] => num,
            shape => bail!(
                "invalid ground truth: boxes must have shape [n, 4], but get {:?}",
                shape
            ),
        };
        ensure!(
            labels.dim() == 1 && labels.size()[0] == num_boxes,
            "invalid ground truth: {} boxes but labels have shape {:?}",
            num_boxes,
            labels.size()
        );

        let rects: Vec<TLBR<f32>> = boxes
            .to_f32_vec()
            .chunks(4)
            .map(|xyxy| {
                let xyxy = [xyxy[0], xyxy[1], xyxy[2], xyxy[3]];
                TLBR::try_from_xyxy(xyxy)
                    .with_context(|| format!("invalid ground truth: malformed box {:?}", xyxy))
            })
            .collect::<Result<_>>()?;
        let labels = labels.to_i64_vec();

        Ok(self.encode_boxes(&rects, &labels)?.to_device(boxes.device()))
    }

    /// Encodes normalized boxes with class labels into a CPU grid tensor.
    pub fn encode_boxes(&self, boxes: &[TLBR<f32>], labels: &[i64]) -> Result<Tensor> {
        let GridConfig {
            grid_size,
            boxes_per_cell,
            num_classes,
        } = self.grid;
        let num_entries = self.grid.num_entries();
        let cell_size = self.cell_size();

        ensure!(
            boxes.len() == labels.len(),
            "invalid ground truth: {} boxes but {} labels",
            boxes.len(),
            labels.len()
        );
        if let Some(&label) = labels
            .iter()
            .find(|&&label| label < 0 || label >= num_classes as i64)
        {
            bail!(
                "invalid ground truth: class id {} is out of range [0, {})",
                label,
                num_classes
            );
        }

        let mut target = vec![0f32; grid_size * grid_size * num_entries];
        let mut occupied = HashSet::new();

        for (rect, &label) in izip!(boxes, labels) {
            let (cx, cy, w, h) = (rect.cx(), rect.cy(), rect.w(), rect.h());

            let i = self.cell_index(cx);
            let j = self.cell_index(cy);
            let offset_x = (cx - i as f32 * cell_size) / cell_size;
            let offset_y = (cy - j as f32 * cell_size) / cell_size;

            if !occupied.insert((j, i)) {
                warn!(
                    "ground truth boxes collide in cell (j={}, i={}), the later box is kept",
                    j, i
                );
            }

            let cell = &mut target[(j * grid_size + i) * num_entries..][..num_entries];
            cell.iter_mut().for_each(|value| *value = 0.0);

            for slot in 0..boxes_per_cell {
                let entry = &mut cell[5 * slot..(5 * slot + 5)];
                entry.copy_from_slice(&[offset_x, offset_y, w, h, 1.0]);
            }
            cell[self.grid.class_offset() + label as usize] = 1.0;
        }

        let [s1, s2, n] = self.grid.shape();
        Ok(Tensor::of_slice(&target).view([s1, s2, n]))
    }

    /// Encodes a batch of physical-frame ground truth into `[N, S, S, 5B + C]`.
    pub fn encode_ground_truth(&self, samples: &[GroundTruth]) -> Result<Tensor> {
        ensure!(!samples.is_empty(), "at least one sample is required");

        let targets: Vec<Tensor> = samples
            .iter()
            .enumerate()
            .map(|(index, sample)| {
                let GroundTruth {
                    polygons,
                    categories,
                } = sample;
                let boxes = self.frame.physical_to_normalized(polygons)?;
                self.encode(&boxes, categories)
                    .with_context(|| format!("failed to encode sample {}", index))
            })
            .collect::<Result<_>>()?;

        Ok(Tensor::stack(&targets, 0))
    }
}
