use candle_core::{Result, Var};

use crate::{BatchInputs, ModelConfig, ModelOutput, StateDict, TrainableModel};

const MODULE_PREFIX: &str = "module";

/// Data-parallel container holding a full replica of the wrapped model.
///
/// Snapshots taken through the container carry a `module.` prefix, the same
/// way replicated checkpoints look when they are saved without unwrapping.
pub struct Replicated<M> {
    module: M,
}

impl<M: TrainableModel> Replicated<M> {
    pub fn new(module: M) -> Self {
        Self { module }
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    pub fn into_inner(self) -> M {
        self.module
    }
}

impl<M: TrainableModel> TrainableModel for Replicated<M> {
    fn config(&self) -> &ModelConfig {
        self.module.config()
    }

    fn inner(&self) -> Option<&dyn TrainableModel> {
        Some(&self.module)
    }

    fn state_dict(&self) -> Result<StateDict> {
        Ok(self
            .module
            .state_dict()?
            .into_iter()
            .map(|(name, tensor)| (format!("{MODULE_PREFIX}.{name}"), tensor))
            .collect())
    }

    fn forward(&self, inputs: &BatchInputs) -> Result<ModelOutput> {
        self.module.forward(inputs)
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        self.module.parameters()
    }
}

/// Follows [`TrainableModel::inner`] until reaching a model that wraps nothing.
pub fn unwrap_model(model: &dyn TrainableModel) -> &dyn TrainableModel {
    let mut current = model;
    while let Some(inner) = current.inner() {
        current = inner;
    }
    current
}

/// Number of containers around the innermost model.
pub fn unwrap_depth(model: &dyn TrainableModel) -> usize {
    let mut depth = 0;
    let mut current = model;
    while let Some(inner) = current.inner() {
        current = inner;
        depth += 1;
    }
    depth
}
