//! Configuration format of the perception model.

use crate::common::*;

/// The main configuration.
///
/// Every section falls back to its defaults, so a partial file is valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub grid: GridConfig,
    pub frame: FrameConfig,
    pub model: ModelConfig,
    pub loss: LossConfig,
    pub inference: InferenceConfig,
}

impl Config {
    /// Loads a JSON5 configuration file.
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        let config: Self = json5::from_str(&text)
            .with_context(|| format!("failed to parse config file '{}'", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.grid.validate()?;
        self.frame.validate()?;
        self.model.validate()?;
        self.loss.validate()?;
        self.inference.validate()?;
        Ok(())
    }
}

/// Layout of the detection grid tensor `[S, S, 5B + C]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Number of cells per side, `S`.
    pub grid_size: usize,
    /// Number of box slots per cell, `B`.
    pub boxes_per_cell: usize,
    /// Number of object classes, `C`.
    pub num_classes: usize,
}

impl GridConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.grid_size > 0, "grid_size must be positive");
        ensure!(self.boxes_per_cell > 0, "boxes_per_cell must be positive");
        ensure!(self.num_classes > 0, "num_classes must be positive");
        Ok(())
    }

    /// Number of entries per cell, `5B + C`.
    pub fn num_entries(&self) -> usize {
        5 * self.boxes_per_cell + self.num_classes
    }

    /// Offset of the class distribution within a cell.
    pub fn class_offset(&self) -> usize {
        5 * self.boxes_per_cell
    }

    /// Side length of a cell in normalized image units.
    pub fn cell_size(&self) -> f64 {
        1.0 / self.grid_size as f64
    }

    /// Column indexes of the objectness entries of all box slots.
    pub fn objectness_columns(&self) -> Vec<i64> {
        (0..self.boxes_per_cell)
            .map(|slot| (5 * slot + 4) as i64)
            .collect()
    }

    /// Expected shape of a single-sample grid tensor.
    pub fn shape(&self) -> [i64; 3] {
        let s = self.grid_size as i64;
        [s, s, self.num_entries() as i64]
    }
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            grid_size: 16,
            boxes_per_cell: 2,
            num_classes: 10,
        }
    }
}

/// The bird's-eye-view physical frame.
///
/// The image-space origin sits at the physical point `(origin_x, origin_y)`,
/// the top-left corner of the frame. Physical y grows upwards while image y
/// grows downwards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    pub origin_x: R64,
    pub origin_y: R64,
    pub width: R64,
    pub height: R64,
}

impl FrameConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.width > 0.0, "frame width must be positive");
        ensure!(self.height > 0.0, "frame height must be positive");
        Ok(())
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            origin_x: r64(-40.0),
            origin_y: r64(40.0),
            width: r64(80.0),
            height: r64(80.0),
        }
    }
}

/// The joint model architecture options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Number of camera views per sample.
    pub num_views: usize,
    pub image_height: usize,
    pub image_width: usize,
    /// Output channels of the first encoder convolution.
    pub encoder_features: usize,
    /// Inserts batch normalization into the detection decoder.
    pub batch_norm: bool,
    /// Mixes view encodings with self-attention before detection decoding.
    pub shared_decoder: bool,
    pub attention_heads: usize,
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.num_views > 0, "num_views must be positive");
        ensure!(
            self.encoder_features >= 2,
            "encoder_features must be at least 2"
        );
        ensure!(self.attention_heads > 0, "attention_heads must be positive");

        // two 5x5 convolutions each followed by 2x2 pooling
        let min_side = 16;
        ensure!(
            self.image_height >= min_side && self.image_width >= min_side,
            "image size must be at least {}x{}",
            min_side,
            min_side
        );
        Ok(())
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_views: 6,
            image_height: 256,
            image_width: 306,
            encoder_features: 6,
            batch_norm: false,
            shared_decoder: false,
            attention_heads: 1,
        }
    }
}

/// Loss weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    /// Weight of the box location and size terms.
    pub lambda_coord: R64,
    /// Weight of the objectness term of empty cells.
    pub lambda_noobj: R64,
    /// Weight of the road map loss in the joint loss.
    pub roadmap_weight: R64,
}

impl LossConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.lambda_coord >= 0.0, "lambda_coord must be non-negative");
        ensure!(self.lambda_noobj >= 0.0, "lambda_noobj must be non-negative");
        ensure!(
            self.roadmap_weight >= 0.0,
            "roadmap_weight must be non-negative"
        );
        Ok(())
    }
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            lambda_coord: r64(5.0),
            lambda_noobj: r64(0.5),
            roadmap_weight: r64(20.0),
        }
    }
}

/// Detection post-processing thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub confidence_threshold: R64,
    pub probability_threshold: R64,
    pub nms_iou_threshold: R64,
}

impl InferenceConfig {
    pub fn validate(&self) -> Result<()> {
        let unit = r64(0.0)..=r64(1.0);
        ensure!(
            unit.contains(&self.confidence_threshold),
            "confidence_threshold must be in range [0, 1]"
        );
        ensure!(
            unit.contains(&self.probability_threshold),
            "probability_threshold must be in range [0, 1]"
        );
        ensure!(
            unit.contains(&self.nms_iou_threshold),
            "nms_iou_threshold must be in range [0, 1]"
        );
        Ok(())
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: r64(0.1),
            probability_threshold: r64(0.1),
            nms_iou_threshold: r64(0.4),
        }
    }
}
