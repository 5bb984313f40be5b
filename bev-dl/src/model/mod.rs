//! The multi-view encoder, its decoders, and the joint model wiring them.

mod encoder;
mod joint;
mod road_map_decoder;
mod shared_decoder;
mod yolo_decoder;

pub use encoder::*;
pub use joint::*;
pub use road_map_decoder::*;
pub use shared_decoder::*;
pub use yolo_decoder::*;

/// Channels of the feature map every decoder starts from.
const BOTTLENECK_CHANNELS: i64 = 2;
/// Side length of the feature map every decoder starts from.
const BOTTLENECK_SIDE: i64 = 15;
