use candle_core::{Device, Result, Var};

use crate::{BatchInputs, ModelConfig, ModelOutput, StateDict};

/// Capabilities the trainer needs from a model.
///
/// Containers used for distributed execution expose the model they wrap
/// through [`TrainableModel::inner`]; leaf models return `None`.
pub trait TrainableModel: Send + Sync {
    fn config(&self) -> &ModelConfig;

    fn device(&self) -> &Device {
        &self.config().device
    }

    /// The wrapped model, if this value is a container.
    fn inner(&self) -> Option<&dyn TrainableModel> {
        None
    }

    /// Snapshot of every parameter keyed by dotted path.
    fn state_dict(&self) -> Result<StateDict>;

    fn forward(&self, inputs: &BatchInputs) -> Result<ModelOutput>;

    /// Named handles to every parameter, in declaration order.
    fn parameters(&self) -> Vec<(String, Var)>;
}
