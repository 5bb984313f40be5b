//! Joint bird's-eye-view object detection and road map segmentation.

mod common;
pub mod config;
pub mod decode;
pub mod frame;
pub mod inference;
pub mod iou;
pub mod loss;
pub mod model;
pub mod nms;
pub mod profiling;
pub mod target;
pub mod utils;
pub mod weights;

pub use config::Config;
pub use model::{JointModel, JointOutput};
