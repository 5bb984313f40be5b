use super::{
    Encoder, EncoderInit, RoadMapDecoder, RoadMapDecoderInit, SharedDecoder, SharedDecoderInit,
    YoloDecoder, YoloDecoderInit,
};
use crate::{
    common::*,
    config::Config,
    inference::{PhysicalDetections, YoloInference, YoloInferenceInit},
    loss::{joint_loss, DetectionLoss, DetectionLossInit, DetectionLossOutput, RoadMapLoss},
    weights::ENCODER_NAMESPACE,
};

/// Everything produced by a joint forward pass.
#[derive(Debug)]
pub struct JointOutput {
    /// Post-processed detections per sample in the physical frame.
    pub detections: Vec<PhysicalDetections>,
    /// Raw `[N, S, S, 5B + C]` detection grid.
    pub grid: Tensor,
    pub detection_loss: Option<DetectionLossOutput>,
    /// `[N, 800, 800]` occupancy probabilities.
    pub road_map: Tensor,
    pub road_map_loss: Option<Tensor>,
}

/// The shared encoder with a detection branch and a road map branch.
#[derive(Debug)]
pub struct JointModel {
    num_views: i64,
    roadmap_weight: f64,
    encoder: Encoder,
    shared_decoder: Option<SharedDecoder>,
    yolo_decoder: YoloDecoder,
    road_map_decoder: RoadMapDecoder,
    detection_loss: DetectionLoss,
    road_map_loss: RoadMapLoss,
    inference: YoloInference,
}

impl JointModel {
    pub fn new<'p, P>(path: P, config: &Config) -> Result<Self>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        config.validate()?;
        let Config {
            grid, model, loss, ..
        } = config;

        let encoder = EncoderInit {
            num_features: model.encoder_features,
            image_height: model.image_height,
            image_width: model.image_width,
        }
        .build(path / ENCODER_NAMESPACE)?;
        let hidden_size = encoder.hidden_size();
        let in_features = model.num_views * hidden_size;

        let shared_decoder = model
            .shared_decoder
            .then(|| {
                SharedDecoderInit {
                    dim: hidden_size,
                    heads: model.attention_heads,
                }
                .build(path / "shared_decoder")
            })
            .transpose()?;
        let yolo_decoder = YoloDecoderInit {
            in_features,
            grid: *grid,
            batch_norm: model.batch_norm,
        }
        .build(path / "yolo_decoder")?;
        let road_map_decoder = RoadMapDecoderInit { in_features }.build(path / "rm_decoder")?;

        let detection_loss = DetectionLossInit::new(*grid, loss).build()?;
        let inference = YoloInferenceInit::new(config)?.build()?;

        info!(
            "joint model with {} views, encoder hidden size {}, batch norm {}, shared decoder {}",
            model.num_views, hidden_size, model.batch_norm, model.shared_decoder
        );

        Ok(Self {
            num_views: model.num_views as i64,
            roadmap_weight: loss.roadmap_weight.raw(),
            encoder,
            shared_decoder,
            yolo_decoder,
            road_map_decoder,
            detection_loss,
            road_map_loss: RoadMapLoss,
            inference,
        })
    }

    /// Encodes `[N, V, 3, H, W]` images into `[N, V, hidden]`.
    pub fn encode_views(&self, images: &Tensor) -> Result<Tensor> {
        ensure!(
            images.dim() == 5 && images.size()[1] == self.num_views,
            "images must have shape [N, {}, 3, H, W], but get {:?}",
            self.num_views,
            images.size()
        );
        self.encoder.forward_views(images)
    }

    /// Concatenated view features for the detection branch.
    fn detection_features(&self, views: &Tensor) -> Result<Tensor> {
        let batch_size = views.size()[0];
        let features = match &self.shared_decoder {
            Some(decoder) => decoder.forward(views)?,
            None => views.shallow_clone(),
        };
        Ok(features.reshape(&[batch_size, -1]))
    }

    /// Concatenated view features for the road map branch.
    fn road_map_features(&self, views: &Tensor) -> Tensor {
        let batch_size = views.size()[0];
        views.reshape(&[batch_size, -1])
    }

    pub fn forward_t(
        &self,
        images: &Tensor,
        detection_targets: Option<&Tensor>,
        road_map_targets: Option<&Tensor>,
        train: bool,
    ) -> Result<JointOutput> {
        let views = self.encode_views(images)?;

        let grid = self
            .yolo_decoder
            .forward_t(&self.detection_features(&views)?, train);
        let detection_loss = detection_targets
            .map(|targets| self.detection_loss.forward(&grid, targets))
            .transpose()?;
        let detections = self.inference.forward(&grid)?;

        let road_map = self
            .road_map_decoder
            .forward(&self.road_map_features(&views))?;
        let road_map_loss = road_map_targets
            .map(|targets| self.road_map_loss.forward(&road_map, targets))
            .transpose()?;

        Ok(JointOutput {
            detections,
            grid,
            detection_loss,
            road_map,
            road_map_loss,
        })
    }

    /// Combines both losses of a pass with the configured road map weight.
    pub fn total_loss(&self, output: &JointOutput) -> Result<Tensor> {
        let detection_loss = output
            .detection_loss
            .as_ref()
            .ok_or_else(|| format_err!("the pass has no detection loss"))?;
        let road_map_loss = output
            .road_map_loss
            .as_ref()
            .ok_or_else(|| format_err!("the pass has no road map loss"))?;
        Ok(joint_loss(
            &detection_loss.total,
            road_map_loss,
            self.roadmap_weight,
        ))
    }

    /// Detections in the physical frame without ground truth.
    pub fn detect(&self, images: &Tensor) -> Result<Vec<PhysicalDetections>> {
        tch::no_grad(|| {
            let views = self.encode_views(images)?;
            let grid = self
                .yolo_decoder
                .forward_t(&self.detection_features(&views)?, false);
            self.inference.forward(&grid)
        })
    }

    /// `[N, 800, 800]` road map probabilities.
    pub fn road_map(&self, images: &Tensor) -> Result<Tensor> {
        tch::no_grad(|| {
            let views = self.encode_views(images)?;
            self.road_map_decoder
                .forward(&self.road_map_features(&views))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;

    fn small_config(shared_decoder: bool) -> Config {
        Config {
            model: ModelConfig {
                num_views: 2,
                image_height: 32,
                image_width: 32,
                encoder_features: 2,
                shared_decoder,
                attention_heads: 2,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn forward_shapes() -> Result<()> {
        for shared_decoder in [false, true] {
            let vs = nn::VarStore::new(Device::Cpu);
            let model = JointModel::new(vs.root(), &small_config(shared_decoder))?;

            let images = Tensor::rand(&[1, 2, 3, 32, 32], FLOAT_CPU);
            let output = model.forward_t(&images, None, None, false)?;
            assert_eq!(output.grid.size(), vec![1, 16, 16, 20]);
            assert_eq!(output.road_map.size(), vec![1, 800, 800]);
            assert_eq!(output.detections.len(), 1);
            assert!(output.detection_loss.is_none());
            assert!(output.road_map_loss.is_none());
            assert!(model.total_loss(&output).is_err());
        }
        Ok(())
    }

    #[test]
    fn reject_wrong_view_count() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = JointModel::new(vs.root(), &small_config(false))?;
        let images = Tensor::rand(&[1, 3, 3, 32, 32], FLOAT_CPU);
        assert!(model.detect(&images).is_err());
        Ok(())
    }

    #[test]
    fn variables_live_in_named_branches() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let _model = JointModel::new(vs.root(), &small_config(true))?;

        let names: HashSet<String> = vs
            .variables()
            .into_keys()
            .map(|name| name.split('.').next().unwrap_or_default().to_string())
            .collect();
        let expect: HashSet<String> = ["encoder", "shared_decoder", "yolo_decoder", "rm_decoder"]
            .iter()
            .map(|name| name.to_string())
            .collect();
        assert_eq!(names, expect);
        Ok(())
    }
}
