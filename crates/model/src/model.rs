use candle_core::{Error, Result, Tensor, Var};
use candle_nn::{linear, Activation, Linear, Module, VarBuilder, VarMap};

use crate::{
    config::ModelConfig,
    state::{BatchInputs, ModelOutput, StateDict},
    traits::TrainableModel,
};

/// Prefix shared by every parameter of the pretrained sensor encoder.
pub const BACKBONE_PREFIX: &str = "pt_encoder_backbone";
const PROJECTOR_PREFIX: &str = "llm.projector";
const HEAD_PREFIX: &str = "score";

/// Sensor encoder backbone followed by a projection and a classification head.
///
/// Accepts `sensor_values` shaped `(batch, channels)` or
/// `(batch, steps, channels)` and produces logits with the same leading
/// dimensions and a trailing `num_labels` axis.
pub struct SensorClassifier {
    config: ModelConfig,
    varmap: VarMap,
    names: Vec<String>,
    encoder_in: Linear,
    encoder_out: Linear,
    projector: Linear,
    head: Linear,
}

impl SensorClassifier {
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, config.dtype, &config.device);
        let mut names = Vec::new();

        let backbone = vb.pp(BACKBONE_PREFIX);
        let encoder_in = linear(
            config.sensor_channels,
            config.encoder_hidden_dim,
            backbone.pp("input_proj"),
        )?;
        register(&mut names, &format!("{BACKBONE_PREFIX}.input_proj"));
        let encoder_out = linear(
            config.encoder_hidden_dim,
            config.encoder_hidden_dim,
            backbone.pp("output_proj"),
        )?;
        register(&mut names, &format!("{BACKBONE_PREFIX}.output_proj"));

        let projector = linear(
            config.encoder_hidden_dim,
            config.hidden_dim,
            vb.pp(PROJECTOR_PREFIX),
        )?;
        register(&mut names, PROJECTOR_PREFIX);
        let head = linear(config.hidden_dim, config.num_labels, vb.pp(HEAD_PREFIX))?;
        register(&mut names, HEAD_PREFIX);

        Ok(Self {
            config,
            varmap,
            names,
            encoder_in,
            encoder_out,
            projector,
            head,
        })
    }

    /// Runs only the backbone, returning sensor embeddings.
    pub fn encode(&self, sensor_values: &Tensor) -> Result<Tensor> {
        let dims = sensor_values.dims();
        if !(dims.len() == 2 || dims.len() == 3) {
            return Err(Error::Msg(format!(
                "sensor_values expected [batch, channels] or [batch, steps, channels] got {:?}",
                dims
            )));
        }
        let channels = dims[dims.len() - 1];
        if channels != self.config.sensor_channels {
            return Err(Error::Msg(format!(
                "sensor_values carry {} channels but the encoder expects {}",
                channels, self.config.sensor_channels
            )));
        }
        let xs = sensor_values.to_dtype(self.config.dtype)?;
        let hidden = Activation::Gelu.forward(&self.encoder_in.forward(&xs)?)?;
        self.encoder_out.forward(&hidden)
    }
}

impl TrainableModel for SensorClassifier {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn state_dict(&self) -> Result<StateDict> {
        let params = self.parameters();
        let mut dict = StateDict::with_capacity(params.len());
        for (name, var) in params {
            dict.insert(name, var.as_tensor().copy()?);
        }
        Ok(dict)
    }

    fn forward(&self, inputs: &BatchInputs) -> Result<ModelOutput> {
        let sensor_values = inputs.get(BatchInputs::SENSOR_VALUES).ok_or_else(|| {
            Error::Msg(format!(
                "forward requires a `{}` input",
                BatchInputs::SENSOR_VALUES
            ))
        })?;
        let embeddings = self.encode(sensor_values)?;
        let hidden = Activation::Gelu.forward(&self.projector.forward(&embeddings)?)?;
        let logits = self.head.forward(&hidden)?;
        Ok(ModelOutput::new(logits).with_hidden_states(hidden))
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        // A panic elsewhere while holding the lock leaves the map itself intact.
        let data = self
            .varmap
            .data()
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        self.names
            .iter()
            .filter_map(|name| data.get(name).map(|var| (name.clone(), var.clone())))
            .collect()
    }
}

fn register(names: &mut Vec<String>, prefix: &str) {
    names.push(format!("{prefix}.weight"));
    names.push(format!("{prefix}.bias"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn tiny() -> SensorClassifier {
        SensorClassifier::new(ModelConfig {
            sensor_channels: 3,
            encoder_hidden_dim: 6,
            hidden_dim: 4,
            num_labels: 2,
            dtype: DType::F32,
            device: Device::Cpu,
        })
        .unwrap()
    }

    #[test]
    fn parameters_follow_declaration_order() {
        let names: Vec<_> = tiny().parameters().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec![
                "pt_encoder_backbone.input_proj.weight",
                "pt_encoder_backbone.input_proj.bias",
                "pt_encoder_backbone.output_proj.weight",
                "pt_encoder_backbone.output_proj.bias",
                "llm.projector.weight",
                "llm.projector.bias",
                "score.weight",
                "score.bias",
            ]
        );
    }

    #[test]
    fn encode_rejects_wrong_channel_count() {
        let model = tiny();
        let xs = Tensor::zeros((2, 5), DType::F32, &Device::Cpu).unwrap();
        assert!(model.encode(&xs).is_err());
    }

    #[test]
    fn parameters_survive_a_poisoned_varmap() {
        let model = tiny();
        std::thread::scope(|scope| {
            let holder = scope.spawn(|| {
                let _guard = model.varmap.data().lock().unwrap();
                panic!("panic while holding the varmap lock");
            });
            assert!(holder.join().is_err());
        });
        assert!(model.varmap.data().is_poisoned());

        assert_eq!(model.parameters().len(), 8);
        assert_eq!(model.state_dict().unwrap().len(), 8);
    }

    #[test]
    fn state_dict_is_a_detached_copy() {
        let model = tiny();
        let before = model.state_dict().unwrap();
        let (_, var) = &model.parameters()[6];
        var.set(&var.as_tensor().ones_like().unwrap()).unwrap();

        let snapshot = before.get("score.weight").unwrap();
        let sum = snapshot.sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(sum != (snapshot.elem_count() as f32));
    }
}
