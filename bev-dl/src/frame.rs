//! Conversions between the bird's-eye-view physical frame and normalized
//! image coordinates.
//!
//! Physical polygons are stored as `[n, 2, 4]` tensors: row 0 holds the x
//! coordinates of the four corners, row 1 the y coordinates. Normalized boxes
//! are `[n, 4]` tensors in `[x1, y1, x2, y2]` order.

use crate::{common::*, config::FrameConfig};

/// Corner order of emitted polygons, clockwise from the top-left corner.
const CLOCKWISE_ORDER: [i64; 4] = [0, 2, 3, 1];

#[derive(Debug, Clone, CopyGetters)]
pub struct PhysicalFrame {
    #[getset(get_copy = "pub")]
    origin_x: f64,
    #[getset(get_copy = "pub")]
    origin_y: f64,
    #[getset(get_copy = "pub")]
    width: f64,
    #[getset(get_copy = "pub")]
    height: f64,
}

impl PhysicalFrame {
    pub fn new(config: &FrameConfig) -> Result<Self> {
        config.validate()?;
        let FrameConfig {
            origin_x,
            origin_y,
            width,
            height,
        } = *config;

        Ok(Self {
            origin_x: origin_x.raw(),
            origin_y: origin_y.raw(),
            width: width.raw(),
            height: height.raw(),
        })
    }

    /// The affine map from physical coordinates to normalized image
    /// coordinates: translate the origin to zero, flip y, then divide by
    /// the frame extent.
    pub fn to_normalized(&self) -> Transform<f64> {
        let shift = Transform {
            sx: 1.0,
            sy: 1.0,
            tx: -self.origin_x,
            ty: -self.origin_y,
        };
        let flip = Transform {
            sx: 1.0,
            sy: -1.0,
            tx: 0.0,
            ty: 0.0,
        };
        let scale = Transform {
            sx: 1.0 / self.width,
            sy: 1.0 / self.height,
            tx: 0.0,
            ty: 0.0,
        };
        &scale * &(&flip * &shift)
    }

    /// The inverse of [`to_normalized`](Self::to_normalized).
    pub fn to_physical(&self) -> Transform<f64> {
        self.to_normalized().inverse()
    }

    /// Physical `[min, max]` extent along x.
    pub fn x_bounds(&self) -> (f64, f64) {
        (self.origin_x, self.origin_x + self.width)
    }

    /// Physical `[min, max]` extent along y.
    pub fn y_bounds(&self) -> (f64, f64) {
        (self.origin_y - self.height, self.origin_y)
    }

    /// Converts physical polygons `[n, 2, 4]` to normalized boxes `[n, 4]`.
    ///
    /// Each box is the min/max envelope of the polygon corners after the
    /// frame transform. Values are not clipped.
    pub fn physical_to_normalized(&self, polygons: &Tensor) -> Result<Tensor> {
        let (_num, rows, corners) = polygons
            .size3()
            .map_err(|_| format_err!("invalid ground truth: polygons must have shape [n, 2, 4]"))?;
        ensure!(
            rows == 2 && corners == 4,
            "invalid ground truth: polygons must have shape [n, 2, 4], but get {:?}",
            polygons.size()
        );

        let Transform { sx, sy, tx, ty } = self.to_normalized();
        let xs = polygons.select(1, 0).to_kind(Kind::Float) * sx + tx;
        let ys = polygons.select(1, 1).to_kind(Kind::Float) * sy + ty;

        let (x1, _) = xs.min_dim(1, false);
        let (x2, _) = xs.max_dim(1, false);
        let (y1, _) = ys.min_dim(1, false);
        let (y2, _) = ys.max_dim(1, false);

        Ok(Tensor::stack(&[x1, y1, x2, y2], 1))
    }

    /// Converts normalized boxes `[n, 4]` to physical polygons `[n, 2, 4]`.
    ///
    /// The corners are clipped to the frame bounds and ordered clockwise
    /// from the top-left corner. Degenerate boxes produce degenerate
    /// polygons.
    pub fn normalized_to_physical(&self, boxes: &Tensor) -> Result<Tensor> {
        let (num_boxes, entries) = boxes.size2()?;
        ensure!(
            entries == 4,
            "boxes must have shape [n, 4], but get {:?}",
            boxes.size()
        );
        let device = boxes.device();

        if num_boxes == 0 {
            return Ok(Tensor::zeros(&[0, 2, 4], (Kind::Float, device)));
        }

        let boxes = boxes.to_kind(Kind::Float);
        let x1 = boxes.select(1, 0);
        let y1 = boxes.select(1, 1);
        let x2 = boxes.select(1, 2);
        let y2 = boxes.select(1, 3);

        let cx = (&x1 + &x2) / 2.0;
        let cy = (&y1 + &y2) / 2.0;
        let half_w = (&x2 - &x1) / 2.0;
        let half_h = (&y2 - &y1) / 2.0;

        let left = &cx - &half_w;
        let right = &cx + &half_w;
        let top = &cy - &half_h;
        let bottom = &cy + &half_h;

        let Transform { sx, sy, tx, ty } = self.to_physical();
        let xs = Tensor::stack(&[&left, &right, &left, &right], 1) * sx + tx;
        let ys = Tensor::stack(&[&top, &bottom, &bottom, &top], 1) * sy + ty;

        let (x_min, x_max) = self.x_bounds();
        let (y_min, y_max) = self.y_bounds();
        let xs = xs.clamp(x_min, x_max);
        let ys = ys.clamp(y_min, y_max);

        let order = Tensor::of_slice(&CLOCKWISE_ORDER).to_device(device);
        let polygons = Tensor::stack(&[xs, ys], 1).index_select(2, &order);

        Ok(polygons)
    }
}

impl Default for PhysicalFrame {
    fn default() -> Self {
        let FrameConfig {
            origin_x,
            origin_y,
            width,
            height,
        } = FrameConfig::default();

        Self {
            origin_x: origin_x.raw(),
            origin_y: origin_y.raw(),
            width: width.raw(),
            height: height.raw(),
        }
    }
}
