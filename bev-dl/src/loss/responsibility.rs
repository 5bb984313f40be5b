//! Selection of the box slot that answers for the ground truth of a cell.

use crate::{common::*, config::GridConfig, iou::paired_iou, utils::TensorExt as _};

/// The outcome of responsibility assignment in one object cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Responsibility {
    /// Index of the responsible box slot.
    pub slot: usize,
    /// IoU between the responsible slot and the ground truth box.
    pub iou: f64,
}

/// Picks the slot with the highest IoU against the ground truth.
///
/// Ties go to the lowest slot index. NaN candidates never win. When no
/// candidate is comparable, slot 0 is returned with IoU 0.
pub fn assign_responsibility(ious: &[f64]) -> Responsibility {
    ious.iter().copied().enumerate().fold(
        Responsibility { slot: 0, iou: 0.0 },
        |best, (slot, iou)| {
            if iou > best.iou {
                Responsibility { slot, iou }
            } else {
                best
            }
        },
    )
}

/// Builds xyxy boxes used for matching from `[.., 5]` slot entries.
///
/// Centers are the cell offsets scaled by `1/S`. The cell origin is left out
/// because predictions and ground truth of one cell share it, so the IoU is
/// unaffected. Sizes are clamped at zero.
pub fn matching_boxes(entries: &Tensor, grid: &GridConfig) -> Tensor {
    let cell_size = grid.cell_size();
    let cx = entries.select(-1, 0) * cell_size;
    let cy = entries.select(-1, 1) * cell_size;
    let half_w = entries.select(-1, 2).clamp_min(0.0) / 2.0;
    let half_h = entries.select(-1, 3).clamp_min(0.0) / 2.0;
    Tensor::stack(&[&cx - &half_w, &cy - &half_h, &cx + &half_w, &cy + &half_h], -1)
}

/// Assigns responsibility for every object cell.
///
/// `pred_slots` is `[K, B, 5]` and `target_slot` is `[K, 5]`, both detached
/// from the graph by this function.
pub fn assign_cells(
    pred_slots: &Tensor,
    target_slot: &Tensor,
    grid: &GridConfig,
) -> Result<Vec<Responsibility>> {
    let (num_cells, num_slots, _) = pred_slots.size3()?;
    ensure!(
        num_slots == grid.boxes_per_cell as i64,
        "expect {} box slots, but get {}",
        grid.boxes_per_cell,
        num_slots
    );
    if num_cells == 0 {
        return Ok(vec![]);
    }

    let ious = tch::no_grad(|| -> Result<_> {
        let pred_boxes = matching_boxes(&pred_slots.detach(), grid);
        let target_boxes = matching_boxes(&target_slot.detach(), grid).unsqueeze(1);
        paired_iou(&pred_boxes, &target_boxes)
    })?
    .to_f32_vec();

    let responsibilities = ious
        .chunks(num_slots as usize)
        .map(|row| {
            let row: Vec<f64> = row.iter().map(|&iou| iou as f64).collect();
            assign_responsibility(&row)
        })
        .collect();
    Ok(responsibilities)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_iou_wins() {
        let picked = assign_responsibility(&[0.2, 0.7, 0.4]);
        assert_eq!(picked, Responsibility { slot: 1, iou: 0.7 });
    }

    #[test]
    fn ties_go_to_lowest_slot() {
        let picked = assign_responsibility(&[0.5, 0.5]);
        assert_eq!(picked.slot, 0);

        let picked = assign_responsibility(&[0.0, 0.0]);
        assert_eq!(picked, Responsibility { slot: 0, iou: 0.0 });

        let picked = assign_responsibility(&[f64::NAN, 0.3]);
        assert_eq!(picked.slot, 1);
    }

    #[test]
    fn assign_per_cell() -> Result<()> {
        let grid = GridConfig::default();
        let pred = Tensor::of_slice(&[
            // cell 0: slot 1 matches exactly
            0.9f32, 0.9, 0.05, 0.05, 0.2, //
            0.5, 0.5, 0.2, 0.3, 0.7, //
            // cell 1: both slots miss
            0.0, 0.0, 0.01, 0.01, 0.1, //
            0.0, 0.0, 0.01, 0.01, 0.1,
        ])
        .view([2, 2, 5]);
        let target = Tensor::of_slice(&[
            0.5f32, 0.5, 0.2, 0.3, 1.0, //
            0.9, 0.9, 0.02, 0.02, 1.0,
        ])
        .view([2, 5]);

        let assigned = assign_cells(&pred, &target, &grid)?;
        assert_eq!(assigned.len(), 2);
        assert_eq!(assigned[0].slot, 1);
        assert_abs_diff_eq!(assigned[0].iou, 1.0, epsilon = 1e-6);
        assert_eq!(assigned[1], Responsibility { slot: 0, iou: 0.0 });
        Ok(())
    }
}
