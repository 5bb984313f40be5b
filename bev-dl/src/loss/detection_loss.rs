//! The responsibility-assignment detection loss.

use super::{assign_cells, L2Loss};
use crate::{
    common::*,
    config::{GridConfig, LossConfig},
    profiling::Timing,
    utils::{index_tensor, TensorExt as _},
};

/// Lower bound on widths and heights before the square root, which keeps
/// its gradient finite.
const SIZE_FLOOR: f64 = 1e-12;

#[derive(Debug, Clone)]
pub struct DetectionLossInit {
    pub grid: GridConfig,
    pub lambda_coord: R64,
    pub lambda_noobj: R64,
}

impl DetectionLossInit {
    pub fn new(grid: GridConfig, loss: &LossConfig) -> Self {
        Self {
            grid,
            lambda_coord: loss.lambda_coord,
            lambda_noobj: loss.lambda_noobj,
        }
    }

    pub fn build(self) -> Result<DetectionLoss> {
        let Self {
            grid,
            lambda_coord,
            lambda_noobj,
        } = self;

        grid.validate()?;
        ensure!(lambda_coord >= 0.0, "lambda_coord must be non-negative");
        ensure!(lambda_noobj >= 0.0, "lambda_noobj must be non-negative");

        Ok(DetectionLoss {
            grid,
            lambda_coord: lambda_coord.raw(),
            lambda_noobj: lambda_noobj.raw(),
            l2: L2Loss,
        })
    }
}

impl Default for DetectionLossInit {
    fn default() -> Self {
        Self::new(GridConfig::default(), &LossConfig::default())
    }
}

/// The loss terms of one pass, each averaged over the batch.
///
/// The components are unweighted. `total` combines them as
/// `lambda_coord * (xy + wh) + obj + lambda_noobj * noobj + class`.
#[derive(Debug, TensorLike)]
pub struct DetectionLossOutput {
    pub total: Tensor,
    pub xy: Tensor,
    pub wh: Tensor,
    pub obj: Tensor,
    pub noobj: Tensor,
    pub class: Tensor,
}

/// Flat cell indexes of a `[N * S * S, 5B + C]` target, split by whether the
/// cell holds a ground truth box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellPartition {
    pub object: Vec<i64>,
    pub no_object: Vec<i64>,
}

impl CellPartition {
    pub fn new(target_cells: &Tensor, grid: &GridConfig) -> Result<Self> {
        let (_num_cells, num_entries) = target_cells.size2()?;
        ensure!(
            num_entries == grid.num_entries() as i64,
            "expect {} entries per cell, but get {}",
            grid.num_entries(),
            num_entries
        );

        let columns = index_tensor(&grid.objectness_columns(), target_cells.device());
        let objectness = tch::no_grad(|| {
            let (objectness, _) = target_cells.index_select(1, &columns).max_dim(1, false);
            objectness
        })
        .to_f32_vec();

        let (object, no_object): (Vec<_>, Vec<_>) = objectness
            .into_iter()
            .enumerate()
            .map(|(index, value)| (index as i64, value))
            .partition(|&(_, value)| value > 0.0);

        Ok(Self {
            object: object.into_iter().map(|(index, _)| index).collect(),
            no_object: no_object.into_iter().map(|(index, _)| index).collect(),
        })
    }
}

#[derive(Debug)]
pub struct DetectionLoss {
    grid: GridConfig,
    lambda_coord: f64,
    lambda_noobj: f64,
    l2: L2Loss,
}

impl DetectionLoss {
    /// Computes the loss of `[N, S, S, 5B + C]` predictions against targets
    /// of the same shape.
    pub fn forward(&self, prediction: &Tensor, target: &Tensor) -> Result<DetectionLossOutput> {
        let mut timing = Timing::new("detection_loss");

        let [s1, s2, num_entries] = self.grid.shape();
        let batch_size = match prediction.size().as_slice() {
            &[n, h, w, e] if h == s1 && w == s2 && e == num_entries => n,
            shape => bail!(
                "prediction must have shape [N, {}, {}, {}], but get {:?}",
                s1,
                s2,
                num_entries,
                shape
            ),
        };
        ensure!(
            prediction.size() == target.size(),
            "prediction and target shapes differ, {:?} vs {:?}",
            prediction.size(),
            target.size()
        );
        ensure!(batch_size > 0, "batch must not be empty");

        let device = prediction.device();
        let pred_cells = prediction.view([-1, num_entries]);
        let target_cells = target
            .to_device(device)
            .to_kind(prediction.kind())
            .view([-1, num_entries]);

        let partition = CellPartition::new(&target_cells, &self.grid)?;
        debug!(
            "{} object cells and {} no-object cells in batch of {}",
            partition.object.len(),
            partition.no_object.len(),
            batch_size
        );
        timing.set_record("partition");

        let noobj = self.no_object_loss(&pred_cells, &target_cells, &partition.no_object);
        let [xy, wh, obj, class] = self.object_loss(&pred_cells, &target_cells, &partition.object)?;
        timing.set_record("terms");

        let [xy, wh, obj, noobj, class] =
            [xy, wh, obj, noobj, class].map(|loss| loss / batch_size as f64);
        let total =
            (&xy + &wh) * self.lambda_coord + &obj + &noobj * self.lambda_noobj + &class;

        timing.set_record("combine");
        timing.report();

        Ok(DetectionLossOutput {
            total,
            xy,
            wh,
            obj,
            noobj,
            class,
        })
    }

    /// Squared error of all objectness entries of empty cells.
    fn no_object_loss(&self, pred_cells: &Tensor, target_cells: &Tensor, cells: &[i64]) -> Tensor {
        let device = pred_cells.device();
        let cells = index_tensor(cells, device);
        let columns = index_tensor(&self.grid.objectness_columns(), device);

        let pred = pred_cells.index_select(0, &cells).index_select(1, &columns);
        let target = target_cells.index_select(0, &cells).index_select(1, &columns);
        self.l2.forward(&pred, &target)
    }

    /// Returns the xy, wh, objectness and class terms of occupied cells.
    fn object_loss(
        &self,
        pred_cells: &Tensor,
        target_cells: &Tensor,
        cells: &[i64],
    ) -> Result<[Tensor; 4]> {
        let device = pred_cells.device();
        let GridConfig {
            boxes_per_cell,
            num_classes,
            ..
        } = self.grid;
        let boxes_per_cell = boxes_per_cell as i64;
        let class_offset = self.grid.class_offset() as i64;

        if cells.is_empty() {
            let zero = || Tensor::zeros(&[], (Kind::Float, device));
            return Ok([zero(), zero(), zero(), zero()]);
        }
        let num_cells = cells.len() as i64;

        let cells = index_tensor(cells, device);
        let pred = pred_cells.index_select(0, &cells);
        let target = target_cells.index_select(0, &cells);

        // every slot of an occupied target cell holds the same box
        let pred_slots = pred
            .narrow(1, 0, 5 * boxes_per_cell)
            .view([num_cells, boxes_per_cell, 5]);
        let target_slot = target.narrow(1, 0, 5);

        let responsibilities = assign_cells(&pred_slots, &target_slot, &self.grid)?;
        let (slots, ious): (Vec<i64>, Vec<f32>) = responsibilities
            .iter()
            .map(|resp| (resp.slot as i64, resp.iou as f32))
            .unzip();

        let slot_index = index_tensor(&slots, device)
            .view([num_cells, 1, 1])
            .expand(&[num_cells, 1, 5], false);
        let responsible = pred_slots.gather(1, &slot_index, false).squeeze_dim(1);

        let xy = self
            .l2
            .forward(&responsible.narrow(1, 0, 2), &target_slot.narrow(1, 0, 2));
        let wh = self.l2.forward(
            &responsible.narrow(1, 2, 2).clamp_min(SIZE_FLOOR).sqrt(),
            &target_slot.narrow(1, 2, 2).clamp_min(SIZE_FLOOR).sqrt(),
        );

        // the confidence is trained towards the achieved IoU
        let achieved_iou = Tensor::of_slice(&ious)
            .to_device(device)
            .to_kind(responsible.kind());
        let obj = self.l2.forward(&responsible.select(1, 4), &achieved_iou);

        let class = self.l2.forward(
            &pred.narrow(1, class_offset, num_classes as i64),
            &target.narrow(1, class_offset, num_classes as i64),
        );

        Ok([xy, wh, obj, class])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    /// A target with one object in cell (j = 3, i = 5).
    fn single_object_target() -> Tensor {
        let mut values = vec![0f32; 16 * 16 * 20];
        let cell = &mut values[(3 * 16 + 5) * 20..][..20];
        for slot in 0..2 {
            cell[5 * slot..5 * slot + 5].copy_from_slice(&[0.1, 0.1, 0.2, 0.3, 1.0]);
        }
        cell[10 + 4] = 1.0;
        Tensor::of_slice(&values).view([1, 16, 16, 20])
    }

    fn value(tensor: &Tensor) -> f64 {
        tensor.double_value(&[])
    }

    #[test]
    fn perfect_prediction_has_zero_loss() -> Result<()> {
        let loss_fn = DetectionLossInit::default().build()?;
        let target = single_object_target();
        let output = loss_fn.forward(&target, &target)?;

        assert_eq!(value(&output.total), 0.0);
        assert_eq!(value(&output.xy), 0.0);
        assert_eq!(value(&output.wh), 0.0);
        assert_eq!(value(&output.obj), 0.0);
        assert_eq!(value(&output.noobj), 0.0);
        assert_eq!(value(&output.class), 0.0);
        Ok(())
    }

    #[test]
    fn partition_of_single_object() -> Result<()> {
        let grid = GridConfig::default();
        let target = single_object_target().view([-1, 20]);
        let partition = CellPartition::new(&target, &grid)?;
        assert_eq!(partition.object, vec![3 * 16 + 5]);
        assert_eq!(partition.no_object.len(), 16 * 16 - 1);
        Ok(())
    }

    #[test]
    fn loss_is_positive_for_imperfect_predictions() -> Result<()> {
        let loss_fn = DetectionLossInit::default().build()?;
        let target = Tensor::cat(&[single_object_target(), single_object_target()], 0);
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..4 {
            let values: Vec<f32> = (0..2 * 16 * 16 * 20).map(|_| rng.gen()).collect();
            let pred = Tensor::of_slice(&values).view([2, 16, 16, 20]);
            let output = loss_fn.forward(&pred, &target)?;

            assert!(value(&output.total) > 0.0);
            for term in [&output.xy, &output.wh, &output.obj, &output.noobj, &output.class] {
                assert!(value(term) >= 0.0);
            }
        }
        Ok(())
    }

    #[test]
    fn objectness_target_is_achieved_iou() -> Result<()> {
        let loss_fn = DetectionLossInit::default().build()?;
        let target = single_object_target();

        // slot 0 is shifted by half the box width, which is 1.6 in offset
        // units, and slot 1 is a tiny box
        let mut values = Vec::<f32>::from(&target.view([-1]));
        let cell = &mut values[(3 * 16 + 5) * 20..][..20];
        cell[..5].copy_from_slice(&[1.7, 0.1, 0.2, 0.3, 1.0]);
        cell[5..10].copy_from_slice(&[0.9, 0.9, 0.01, 0.01, 0.5]);
        let pred = Tensor::of_slice(&values).view([1, 16, 16, 20]);

        let output = loss_fn.forward(&pred, &target)?;
        let expect_iou = 1.0 / 3.0;
        assert_abs_diff_eq!(value(&output.obj), (1.0f64 - expect_iou).powi(2), epsilon = 1e-4);
        // slot 1 is neither responsible nor counted as empty
        assert_abs_diff_eq!(value(&output.noobj), 0.0);
        assert_abs_diff_eq!(value(&output.class), 0.0);
        Ok(())
    }

    #[test]
    fn empty_targets_produce_finite_loss() -> Result<()> {
        let loss_fn = DetectionLossInit::default().build()?;
        let target = Tensor::zeros(&[2, 16, 16, 20], FLOAT_CPU);
        let pred = Tensor::full(&[2, 16, 16, 20], 0.5, FLOAT_CPU);

        let output = loss_fn.forward(&pred, &target)?;
        assert_eq!(value(&output.xy), 0.0);
        assert_eq!(value(&output.obj), 0.0);
        // 2 slots * 256 cells * 0.25 per sample
        assert_abs_diff_eq!(value(&output.noobj), 128.0, epsilon = 1e-3);
        assert_abs_diff_eq!(value(&output.total), 64.0, epsilon = 1e-3);
        Ok(())
    }

    #[test]
    fn gradient_flows_to_prediction() -> Result<()> {
        let loss_fn = DetectionLossInit::default().build()?;
        let target = single_object_target();
        let pred = (Tensor::rand(&[1, 16, 16, 20], FLOAT_CPU) * 0.5 - 0.1).set_requires_grad(true);

        let output = loss_fn.forward(&pred, &target)?;
        output.total.backward();

        let grad = pred.grad();
        assert!(!bool::from(grad.isnan().any()));
        assert!(value(&grad.abs().sum(Kind::Float)) > 0.0);
        Ok(())
    }

    #[test]
    fn every_cell_occupied_has_no_empty_cell_loss() -> Result<()> {
        let loss_fn = DetectionLossInit::default().build()?;

        let mut values = vec![0f32; 16 * 16 * 20];
        values.chunks_mut(20).for_each(|cell| {
            for slot in 0..2 {
                cell[5 * slot..5 * slot + 5].copy_from_slice(&[0.5, 0.5, 0.1, 0.1, 1.0]);
            }
            cell[10] = 1.0;
        });
        let target = Tensor::of_slice(&values).view([1, 16, 16, 20]);

        let partition = CellPartition::new(&target.view([-1, 20]), &GridConfig::default())?;
        assert_eq!(partition.object.len(), 16 * 16);
        assert!(partition.no_object.is_empty());

        let mut rng = StdRng::seed_from_u64(3);
        let values: Vec<f32> = (0..16 * 16 * 20).map(|_| rng.gen()).collect();
        let pred = Tensor::of_slice(&values).view([1, 16, 16, 20]);

        let output = loss_fn.forward(&pred, &target)?;
        assert_eq!(value(&output.noobj), 0.0);
        assert!(value(&output.total).is_finite());
        assert!(value(&output.total) > 0.0);
        Ok(())
    }

    #[test]
    fn degenerate_boxes_keep_loss_finite() -> Result<()> {
        let loss_fn = DetectionLossInit::default().build()?;

        // zero-sized boxes in both the target and the prediction
        let mut values = vec![0f32; 16 * 16 * 20];
        let cell = &mut values[(3 * 16 + 5) * 20..][..20];
        for slot in 0..2 {
            cell[5 * slot..5 * slot + 5].copy_from_slice(&[0.4, 0.6, 0.0, 0.0, 1.0]);
        }
        cell[10 + 4] = 1.0;
        let target = Tensor::of_slice(&values).view([1, 16, 16, 20]);

        let cell = &mut values[(3 * 16 + 5) * 20..][..20];
        for slot in 0..2 {
            cell[5 * slot..5 * slot + 5].copy_from_slice(&[0.3, 0.5, 0.0, 0.0, 0.5]);
        }
        let pred = Tensor::of_slice(&values)
            .view([1, 16, 16, 20])
            .set_requires_grad(true);

        let output = loss_fn.forward(&pred, &target)?;
        for term in [
            &output.total,
            &output.xy,
            &output.wh,
            &output.obj,
            &output.noobj,
            &output.class,
        ] {
            assert!(value(term).is_finite());
        }
        // the empty boxes overlap nothing, so the confidence target is 0
        assert_abs_diff_eq!(value(&output.obj), 0.25, epsilon = 1e-6);
        assert_abs_diff_eq!(value(&output.wh), 0.0);

        output.total.backward();
        let grad = pred.grad();
        assert!(!bool::from(grad.isnan().any()));
        assert!(value(&grad.abs().sum(Kind::Float)).is_finite());
        Ok(())
    }

    #[test]
    fn reject_mismatched_shapes() -> Result<()> {
        let loss_fn = DetectionLossInit::default().build()?;
        let target = single_object_target();
        let pred = Tensor::zeros(&[1, 16, 16, 19], FLOAT_CPU);
        assert!(loss_fn.forward(&pred, &target).is_err());
        assert!(loss_fn
            .forward(&Tensor::zeros(&[2, 16, 16, 20], FLOAT_CPU), &target)
            .is_err());
        Ok(())
    }
}
