pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distributed;
pub mod error;
pub mod filter;
pub mod hub;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod trainer;

pub use checkpoint::{CheckpointDescriptor, CheckpointManifest};
pub use config::{
    CheckpointConfig, HubConfig, LossConfig, LossKind, ShardingMode, TrainingConfig,
};
pub use data::{BlockingDataLoader, DataBatch, DataLoader, SensorDataLoader, SensorDataset};
pub use distributed::{
    FullStateDictPolicy, FullStateDictScope, ProcessGroup, ShardedModel, SingleProcessGroup,
    StateDictType, ThreadGroup,
};
pub use error::TrainingError;
pub use filter::StateDictFilter;
pub use hub::{HubPublisher, LocalMirrorPublisher, PublishedCommit};
pub use loss::{
    build_loss, ComputeLoss, CrossEntropyLoss, DefaultLoss, LossMetrics, LossOutput, LossResult,
    WeightedCrossEntropy,
};
pub use trainer::{
    ModelHandle, SensorTrainer, TrainOutcome, Trainer, WeightedLossTrainer,
};
