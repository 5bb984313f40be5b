use crate::common::*;

/// Combines the detection and road map losses as `yolo + weight * road_map`.
pub fn joint_loss(detection_loss: &Tensor, road_map_loss: &Tensor, weight: f64) -> Tensor {
    detection_loss + road_map_loss * weight
}
