use super::{BOTTLENECK_CHANNELS, BOTTLENECK_SIDE};
use crate::common::*;

/// Side length of the produced road map.
pub const ROADMAP_SIZE: i64 = 800;

/// Upsampling factor between the second and third deconvolution.
const UPSAMPLE_SCALE: i64 = 4;

/// The road map decoder producing `[N, 800, 800]` occupancy probabilities.
///
/// 15 -> 46 -> 100 -> 400 -> 802 -> 800 along each side.
#[derive(Debug, Clone)]
pub struct RoadMapDecoderInit {
    pub in_features: usize,
}

impl RoadMapDecoderInit {
    pub fn build<'p, P>(self, path: P) -> Result<RoadMapDecoder>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self { in_features } = self;
        ensure!(in_features > 0, "in_features must be positive");

        let deconv = |name: &str, k: i64, stride: i64| {
            nn::conv_transpose2d(
                path / name,
                BOTTLENECK_CHANNELS,
                BOTTLENECK_CHANNELS,
                k,
                nn::ConvTransposeConfig {
                    stride,
                    ..Default::default()
                },
            )
        };

        Ok(RoadMapDecoder {
            linear: nn::linear(
                path / "linear",
                in_features as i64,
                BOTTLENECK_CHANNELS * BOTTLENECK_SIDE * BOTTLENECK_SIDE,
                Default::default(),
            ),
            deconv1: deconv("deconv1", 4, 3),
            deconv2: deconv("deconv2", 10, 2),
            deconv3: deconv("deconv3", 4, 2),
            conv: nn::conv2d(path / "conv", BOTTLENECK_CHANNELS, 1, 3, Default::default()),
        })
    }
}

#[derive(Debug)]
pub struct RoadMapDecoder {
    linear: nn::Linear,
    deconv1: nn::ConvTranspose2D,
    deconv2: nn::ConvTranspose2D,
    deconv3: nn::ConvTranspose2D,
    conv: nn::Conv2D,
}

impl RoadMapDecoder {
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = xs
            .apply(&self.linear)
            .relu()
            .view([-1, BOTTLENECK_CHANNELS, BOTTLENECK_SIDE, BOTTLENECK_SIDE])
            .apply(&self.deconv1)
            .relu()
            .apply(&self.deconv2)
            .relu();

        let (_, _, height, width) = xs.size4()?;
        let xs = xs
            .upsample_nearest2d(
                &[height * UPSAMPLE_SCALE, width * UPSAMPLE_SCALE],
                None,
                None,
            )
            .apply(&self.deconv3)
            .relu()
            .apply(&self.conv)
            .sigmoid()
            .squeeze_dim(1);

        Ok(xs)
    }
}
