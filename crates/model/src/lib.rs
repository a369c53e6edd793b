//! Sensor classification model and the capability trait the trainer drives.

pub mod config;
pub mod model;
pub mod state;
pub mod traits;
pub mod wrap;

pub use config::{ModelConfig, ModelConfigRecord};
pub use model::{SensorClassifier, BACKBONE_PREFIX};
pub use state::{BatchInputs, ModelOutput, StateDict};
pub use traits::TrainableModel;
pub use wrap::{unwrap_depth, unwrap_model, Replicated};
