use crate::common::*;

/// Per-axis affine map `v' = v * s + t`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Transform<T> {
    pub sy: T,
    pub sx: T,
    pub ty: T,
    pub tx: T,
}

impl<T> Transform<T>
where
    T: Copy + Num + Neg<Output = T>,
{
    pub fn inverse(&self) -> Self {
        let sy = T::one() / self.sy;
        let sx = T::one() / self.sx;
        let ty = -self.ty / self.sy;
        let tx = -self.tx / self.sx;

        Self { sy, sx, ty, tx }
    }
}

/// Composition: `(a * b)` applies `b` first, then `a`.
impl<T> Mul<&Transform<T>> for &Transform<T>
where
    T: Copy + Num,
{
    type Output = Transform<T>;

    fn mul(self, rhs: &Transform<T>) -> Self::Output {
        Transform {
            sx: self.sx * rhs.sx,
            sy: self.sy * rhs.sy,
            tx: rhs.tx * self.sx + self.tx,
            ty: rhs.ty * self.sy + self.ty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn rect_transform_inverse() {
        let orig = Transform {
            sx: 2.0,
            sy: -2.0,
            tx: 1.0,
            ty: 1.0,
        };
        assert_eq!(orig.inverse().inverse(), orig);
    }

    #[test]
    fn composition_applies_rhs_first() {
        let shift = Transform {
            sx: 1.0,
            sy: 1.0,
            tx: 40.0,
            ty: -40.0,
        };
        let flip = Transform {
            sx: 1.0,
            sy: -1.0,
            tx: 0.0,
            ty: 0.0,
        };
        let composed = &flip * &shift;

        // y' = -(y - 40)
        assert_abs_diff_eq!(composed.sy, -1.0);
        assert_abs_diff_eq!(composed.ty, 40.0);
        assert_abs_diff_eq!(composed.sx, 1.0);
        assert_abs_diff_eq!(composed.tx, 40.0);

        let back = &composed.inverse() * &composed;
        assert_abs_diff_eq!(back.sy, 1.0);
        assert_abs_diff_eq!(back.ty, 0.0);
    }
}
