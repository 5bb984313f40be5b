use super::{BOTTLENECK_CHANNELS, BOTTLENECK_SIDE};
use crate::{common::*, config::GridConfig};

/// Side of the pooled feature map: conv k3 then pool k2 with stride 1.
const POOLED_SIDE: i64 = BOTTLENECK_SIDE - 2 - 1;

/// The detection decoder producing `[N, S, S, 5B + C]` grids.
#[derive(Debug, Clone)]
pub struct YoloDecoderInit {
    pub in_features: usize,
    pub grid: GridConfig,
    pub batch_norm: bool,
}

impl YoloDecoderInit {
    pub fn build<'p, P>(self, path: P) -> Result<YoloDecoder>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self {
            in_features,
            grid,
            batch_norm,
        } = self;
        ensure!(in_features > 0, "in_features must be positive");
        grid.validate()?;

        let bottleneck = BOTTLENECK_CHANNELS * BOTTLENECK_SIDE * BOTTLENECK_SIDE;
        let pooled = BOTTLENECK_CHANNELS * POOLED_SIDE * POOLED_SIDE;
        let [s1, s2, num_entries] = grid.shape();

        let linear1 = nn::linear(
            path / "linear1",
            in_features as i64,
            bottleneck,
            Default::default(),
        );
        let conv = nn::conv2d(
            path / "conv",
            BOTTLENECK_CHANNELS,
            BOTTLENECK_CHANNELS,
            3,
            Default::default(),
        );
        let linear2 = nn::linear(
            path / "linear2",
            pooled,
            s1 * s2 * num_entries,
            Default::default(),
        );
        let (bn1, bn2) = if batch_norm {
            (
                Some(nn::batch_norm1d(path / "bn1", bottleneck, Default::default())),
                Some(nn::batch_norm2d(
                    path / "bn2",
                    BOTTLENECK_CHANNELS,
                    Default::default(),
                )),
            )
        } else {
            (None, None)
        };

        Ok(YoloDecoder {
            linear1,
            bn1,
            conv,
            bn2,
            linear2,
            grid,
        })
    }
}

#[derive(Debug)]
pub struct YoloDecoder {
    linear1: nn::Linear,
    bn1: Option<nn::BatchNorm>,
    conv: nn::Conv2D,
    bn2: Option<nn::BatchNorm>,
    linear2: nn::Linear,
    grid: GridConfig,
}

impl YoloDecoder {
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let Self {
            linear1,
            bn1,
            conv,
            bn2,
            linear2,
            grid,
        } = self;
        let [s1, s2, num_entries] = grid.shape();

        let xs = xs.apply(linear1);
        let xs = match bn1 {
            Some(bn) => xs.apply_t(bn, train),
            None => xs,
        };
        let xs = xs
            .relu()
            .view([-1, BOTTLENECK_CHANNELS, BOTTLENECK_SIDE, BOTTLENECK_SIDE])
            .apply(conv);
        let xs = match bn2 {
            Some(bn) => xs.apply_t(bn, train),
            None => xs,
        };

        xs.relu()
            .max_pool2d(&[2, 2], &[1, 1], &[0, 0], &[1, 1], false)
            .view([-1, BOTTLENECK_CHANNELS * POOLED_SIDE * POOLED_SIDE])
            .apply(linear2)
            .sigmoid()
            .view([-1, s1, s2, num_entries])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_output_in_unit_range() -> Result<()> {
        for batch_norm in [false, true] {
            let vs = nn::VarStore::new(Device::Cpu);
            let decoder = YoloDecoderInit {
                in_features: 40,
                grid: GridConfig::default(),
                batch_norm,
            }
            .build(vs.root())?;

            let grid = decoder.forward_t(&Tensor::randn(&[3, 40], FLOAT_CPU), true);
            assert_eq!(grid.size(), vec![3, 16, 16, 20]);
            assert!(bool::from(grid.ge(0.0).logical_and(&grid.le(1.0)).all()));
        }
        Ok(())
    }
}
