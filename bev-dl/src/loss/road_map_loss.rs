use crate::common::*;

/// Binary cross entropy between predicted and target occupancy maps.
///
/// The mean elementwise loss is divided by the batch size once more.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoadMapLoss;

impl RoadMapLoss {
    /// Takes `[N, H, W]` probabilities and targets in `[0, 1]`.
    pub fn forward(&self, input: &Tensor, target: &Tensor) -> Result<Tensor> {
        let (batch_size, _height, _width) = input.size3()?;
        ensure!(
            input.size() == target.size(),
            "road map and target shapes differ, {:?} vs {:?}",
            input.size(),
            target.size()
        );
        ensure!(batch_size > 0, "batch must not be empty");
        debug_assert!(
            bool::from(target.ge(0.0).logical_and(&target.le(1.0)).all()),
            "target values must be in range of [0.0, 1.0]"
        );

        let target = target.to_device(input.device()).to_kind(input.kind());
        let loss = input.binary_cross_entropy::<Tensor>(&target, None, Reduction::Mean);
        Ok(loss / batch_size as f64)
    }
}
