use crate::common::*;

/// The pretext convolutional encoder applied to each camera view.
#[derive(Debug, Clone)]
pub struct EncoderInit {
    /// Output channels of the first convolution. The second one has half.
    pub num_features: usize,
    pub image_height: usize,
    pub image_width: usize,
}

impl EncoderInit {
    /// Length of the flattened encoding of one view.
    pub fn hidden_size(&self) -> Result<usize> {
        let Self {
            num_features,
            image_height,
            image_width,
        } = *self;
        ensure!(num_features >= 2, "num_features must be at least 2");

        // conv k5, pool 2, conv k5, pool 2
        let side = |size: usize| -> Result<usize> {
            let size = size
                .checked_sub(4)
                .map(|size| size / 2)
                .and_then(|size| size.checked_sub(4))
                .map(|size| size / 2)
                .filter(|&size| size > 0)
                .ok_or_else(|| format_err!("image size {} is too small for the encoder", size))?;
            Ok(size)
        };

        Ok(num_features / 2 * side(image_height)? * side(image_width)?)
    }

    pub fn build<'p, P>(self, path: P) -> Result<Encoder>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let hidden_size = self.hidden_size()?;
        let Self {
            num_features,
            image_height,
            image_width,
        } = self;

        let conv1 = nn::conv2d(path / "conv1", 3, num_features as i64, 5, Default::default());
        let conv2 = nn::conv2d(
            path / "conv2",
            num_features as i64,
            (num_features / 2) as i64,
            5,
            Default::default(),
        );

        Ok(Encoder {
            conv1,
            conv2,
            hidden_size: hidden_size as i64,
            image_size: [image_height as i64, image_width as i64],
        })
    }
}

#[derive(Debug)]
pub struct Encoder {
    conv1: nn::Conv2D,
    conv2: nn::Conv2D,
    hidden_size: i64,
    image_size: [i64; 2],
}

impl Encoder {
    pub fn hidden_size(&self) -> usize {
        self.hidden_size as usize
    }

    /// Encodes `[N, 3, H, W]` images into `[N, hidden]` vectors.
    pub fn forward(&self, images: &Tensor) -> Result<Tensor> {
        let [height, width] = self.image_size;
        match images.size().as_slice() {
            &[_, 3, h, w] if h == height && w == width => (),
            shape => bail!(
                "images must have shape [N, 3, {}, {}], but get {:?}",
                height,
                width,
                shape
            ),
        }

        let xs = images
            .apply(&self.conv1)
            .relu()
            .max_pool2d(&[2, 2], &[2, 2], &[0, 0], &[1, 1], false)
            .apply(&self.conv2)
            .relu()
            .max_pool2d(&[2, 2], &[2, 2], &[0, 0], &[1, 1], false);

        Ok(xs.view([-1, self.hidden_size]))
    }

    /// Encodes `[N, V, 3, H, W]` view stacks into `[N, V, hidden]`.
    ///
    /// All views share the same weights.
    pub fn forward_views(&self, images: &Tensor) -> Result<Tensor> {
        let (batch_size, num_views, channels, height, width) = images.size5()?;
        let xs = self.forward(&images.reshape(&[batch_size * num_views, channels, height, width]))?;
        Ok(xs.view([batch_size, num_views, self.hidden_size]))
    }
}
