//! Pairwise intersection over union on box tensors.

use crate::common::*;

/// Computes the IoU of xyxy boxes paired along the last dimension.
///
/// `lhs` and `rhs` are broadcast against each other, so `[K, B, 4]` and
/// `[K, 1, 4]` give a `[K, B]` result. Pairs whose union has no area get
/// IoU 0. The result is differentiable with respect to both inputs.
pub fn paired_iou(lhs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
    let lhs_size = lhs.size();
    let rhs_size = rhs.size();
    ensure!(
        lhs_size.last() == Some(&4) && rhs_size.last() == Some(&4),
        "boxes must have 4 entries in the last dimension, but get {:?} and {:?}",
        lhs_size,
        rhs_size
    );

    let coord = |boxes: &Tensor, index: i64| boxes.select(-1, index);
    let (l_x1, l_y1, l_x2, l_y2) = (coord(lhs, 0), coord(lhs, 1), coord(lhs, 2), coord(lhs, 3));
    let (r_x1, r_y1, r_x2, r_y2) = (coord(rhs, 0), coord(rhs, 1), coord(rhs, 2), coord(rhs, 3));

    let inter_w = (l_x2.minimum(&r_x2) - l_x1.maximum(&r_x1)).clamp_min(0.0);
    let inter_h = (l_y2.minimum(&r_y2) - l_y1.maximum(&r_y1)).clamp_min(0.0);
    let inter = inter_w * inter_h;

    let lhs_area = (&l_x2 - &l_x1).clamp_min(0.0) * (&l_y2 - &l_y1).clamp_min(0.0);
    let rhs_area = (&r_x2 - &r_x1).clamp_min(0.0) * (&r_y2 - &r_y1).clamp_min(0.0);
    let union = lhs_area + rhs_area - &inter;

    // replace empty unions by 1 so the masked quotient stays finite
    let valid = union.gt(0.0).to_kind(Kind::Float);
    let invalid = union.le(0.0).to_kind(Kind::Float);
    let iou = inter * &valid / (union + invalid);

    Ok(iou)
}

/// Computes the `[N, M]` IoU matrix of `[N, 4]` and `[M, 4]` xyxy boxes.
pub fn iou_matrix(lhs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
    let (num_lhs, lhs_entries) = lhs.size2()?;
    let (num_rhs, rhs_entries) = rhs.size2()?;
    ensure!(
        lhs_entries == 4 && rhs_entries == 4,
        "boxes must have shape [n, 4], but get {:?} and {:?}",
        lhs.size(),
        rhs.size()
    );

    paired_iou(&lhs.view([num_lhs, 1, 4]), &rhs.view([1, num_rhs, 4]))
}
