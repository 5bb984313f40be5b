//! Ground-truth free post-processing from grids to physical detections.

use crate::{
    common::*,
    config::{Config, GridConfig},
    decode::{PredictionDecoder, PredictionDecoderInit},
    frame::PhysicalFrame,
    nms::{NonMaxSuppression, NonMaxSuppressionInit},
    profiling::Timing,
};

/// Detections of one sample in the physical frame.
#[derive(Debug, TensorLike)]
pub struct PhysicalDetections {
    /// Clockwise corners from the top-left in shape `[n, 2, 4]`.
    pub polygons: Tensor,
    /// Class ids, shape `[n]`.
    pub labels: Tensor,
    /// Confidence times class score, shape `[n]`.
    pub scores: Tensor,
}

impl PhysicalDetections {
    pub fn len(&self) -> usize {
        self.labels.size()[0] as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct YoloInferenceInit {
    pub grid: GridConfig,
    pub frame: PhysicalFrame,
    pub confidence_threshold: R64,
    pub probability_threshold: R64,
    pub nms_iou_threshold: R64,
}

impl YoloInferenceInit {
    pub fn new(config: &Config) -> Result<Self> {
        let Config {
            grid,
            frame,
            inference,
            ..
        } = config;

        Ok(Self {
            grid: *grid,
            frame: PhysicalFrame::new(frame)?,
            confidence_threshold: inference.confidence_threshold,
            probability_threshold: inference.probability_threshold,
            nms_iou_threshold: inference.nms_iou_threshold,
        })
    }

    pub fn build(self) -> Result<YoloInference> {
        let Self {
            grid,
            frame,
            confidence_threshold,
            probability_threshold,
            nms_iou_threshold,
        } = self;

        let decoder = PredictionDecoderInit {
            grid,
            confidence_threshold,
            probability_threshold,
        }
        .build()?;
        let nms = NonMaxSuppressionInit {
            iou_threshold: nms_iou_threshold,
        }
        .build()?;

        Ok(YoloInference {
            decoder,
            nms,
            frame,
        })
    }
}

#[derive(Debug, Clone)]
pub struct YoloInference {
    decoder: PredictionDecoder,
    nms: NonMaxSuppression,
    frame: PhysicalFrame,
}

impl YoloInference {
    /// Decodes, suppresses and maps a `[S, S, 5B + C]` grid to the physical
    /// frame.
    ///
    /// Kept boxes are grouped by ascending class id and ranked by confidence
    /// within each class.
    pub fn forward_single(&self, grid: &Tensor) -> Result<PhysicalDetections> {
        tch::no_grad(|| -> Result<_> {
            let detections = self.decoder.decode(grid)?;
            let kept = self.nms.forward(&detections)?;
            debug!(
                "{} detections decoded, {} kept after nms",
                detections.len(),
                kept.len()
            );

            Ok(PhysicalDetections {
                polygons: self.frame.normalized_to_physical(&kept.boxes)?,
                scores: kept.probabilities(),
                labels: kept.labels,
            })
        })
    }

    /// Runs [`forward_single`](Self::forward_single) on every sample of a
    /// `[N, S, S, 5B + C]` batch.
    pub fn forward(&self, grids: &Tensor) -> Result<Vec<PhysicalDetections>> {
        let mut timing = Timing::new("inference");
        let (batch_size, _, _, _) = grids.size4()?;

        let output = (0..batch_size)
            .map(|index| self.forward_single(&grids.select(0, index)))
            .collect::<Result<Vec<_>>>()?;

        timing.set_record("decode_nms");
        timing.report();
        Ok(output)
    }
}
