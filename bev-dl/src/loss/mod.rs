//! Loss functions of the detection and road map branches.

mod detection_loss;
mod joint;
mod l2_loss;
mod responsibility;
mod road_map_loss;

pub use detection_loss::*;
pub use joint::*;
pub use l2_loss::*;
pub use responsibility::*;
pub use road_map_loss::*;
