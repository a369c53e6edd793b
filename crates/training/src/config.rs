use candle_core::{DType, Device};
use model::{ModelConfig, BACKBONE_PREFIX};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::TrainingError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub output_dir: PathBuf,
    #[serde(default)]
    pub model: ModelSection,
    #[serde(default)]
    pub data: Option<DataConfig>,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub loss: LossConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    /// Minimal configuration writing into `output_dir`, every other section defaulted.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            model: ModelSection::default(),
            data: None,
            optimizer: OptimizerConfig::default(),
            loss: LossConfig::default(),
            checkpoint: CheckpointConfig::default(),
            hub: HubConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.output_dir.as_os_str().is_empty() {
            errors.push("output_dir must not be empty".to_string());
        }

        if self.model.sensor_channels == 0 {
            errors.push("model.sensor_channels must be greater than 0".to_string());
        }
        if self.model.encoder_hidden_dim == 0 {
            errors.push("model.encoder_hidden_dim must be greater than 0".to_string());
        }
        if self.model.hidden_dim == 0 {
            errors.push("model.hidden_dim must be greater than 0".to_string());
        }
        if self.model.num_labels < 2 {
            errors.push("model.num_labels must be at least 2".to_string());
        }

        if let Some(data) = &self.data {
            if data.batch_size == 0 {
                errors.push("data.batch_size must be greater than 0".to_string());
            }
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }
        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }
        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }
        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if let Some(weights) = &self.loss.class_weights {
            if weights.len() != self.model.num_labels {
                errors.push(format!(
                    "loss.class_weights has {} entries but model.num_labels is {}",
                    weights.len(),
                    self.model.num_labels
                ));
            }
            if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
                errors.push("loss.class_weights must be finite and >= 0".to_string());
            }
        }

        if self
            .checkpoint
            .exclude
            .iter()
            .any(|marker| marker.is_empty())
        {
            errors.push("checkpoint.exclude entries must not be empty".to_string());
        }
        if let Some(0) = self.checkpoint.save_steps {
            errors.push("checkpoint.save_steps must be greater than 0".to_string());
        }
        if let Some(0) = self.checkpoint.save_total_limit {
            errors.push("checkpoint.save_total_limit must be greater than 0".to_string());
        }

        if self.hub.push_to_hub {
            if self.hub.model_id.as_deref().map_or(true, str::is_empty) {
                errors.push("hub.model_id is required when hub.push_to_hub is set".to_string());
            }
            if self.hub.directory.is_none() {
                errors.push("hub.directory is required when hub.push_to_hub is set".to_string());
            }
        }

        if self.runtime.logging_steps == 0 {
            errors.push("runtime.logging_steps must be greater than 0".to_string());
        }
        if let Some(0) = self.runtime.max_steps {
            errors.push("runtime.max_steps must be greater than 0".to_string());
        }
        if self.runtime.num_train_epochs == 0 {
            errors.push("runtime.num_train_epochs must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.output_dir, base);
        if let Some(data) = self.data.as_mut() {
            data.apply_base_path(base);
        }
        if let Some(dir) = self.hub.directory.as_mut() {
            absolutize_in_place(dir, base);
        }
        if let Some(dir) = self.runtime.logging.tensorboard.as_mut() {
            absolutize_in_place(dir, base);
        }
    }

    pub fn resolve_model_config(&self, device: &Device) -> Result<ModelConfig, TrainingError> {
        let config = ModelConfig {
            sensor_channels: self.model.sensor_channels,
            encoder_hidden_dim: self.model.encoder_hidden_dim,
            hidden_dim: self.model.hidden_dim,
            num_labels: self.model.num_labels,
            dtype: precision_to_dtype(self.runtime.precision),
            device: device.clone(),
        };
        config.validate().map_err(|err| {
            TrainingError::initialization(format!("failed to build model config: {}", err))
        })?;
        Ok(config)
    }

    pub fn is_full_shard(&self) -> bool {
        self.runtime.sharding == ShardingMode::FullShard
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSection {
    #[serde(default = "default_sensor_channels")]
    pub sensor_channels: usize,
    #[serde(default = "default_encoder_hidden_dim")]
    pub encoder_hidden_dim: usize,
    #[serde(default = "default_hidden_dim")]
    pub hidden_dim: usize,
    #[serde(default = "default_num_labels")]
    pub num_labels: usize,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            sensor_channels: default_sensor_channels(),
            encoder_hidden_dim: default_encoder_hidden_dim(),
            hidden_dim: default_hidden_dim(),
            num_labels: default_num_labels(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub train_file: PathBuf,
    #[serde(default)]
    pub eval_file: Option<PathBuf>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_true")]
    pub shuffle: bool,
}

impl DataConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.train_file, base);
        if let Some(eval) = self.eval_file.as_mut() {
            absolutize_in_place(eval, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            weight_decay: 0.0,
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    #[default]
    CrossEntropy,
    WeightedCrossEntropy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossConfig {
    #[serde(default)]
    pub kind: LossKind,
    #[serde(default)]
    pub class_weights: Option<Vec<f32>>,
    #[serde(default = "default_ignore_index")]
    pub ignore_index: Option<i64>,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            kind: LossKind::default(),
            class_weights: None,
            ignore_index: default_ignore_index(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Parameters whose name contains any of these markers are left out of saved weights.
    #[serde(default = "default_checkpoint_exclude")]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub save_steps: Option<usize>,
    #[serde(default)]
    pub save_total_limit: Option<usize>,
    /// Keep excluded parameters out of the optimizer as well.
    #[serde(default = "default_true")]
    pub freeze_backbone: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            exclude: default_checkpoint_exclude(),
            save_steps: None,
            save_total_limit: None,
            freeze_backbone: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub push_to_hub: bool,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub precision: Precision,
    #[serde(default)]
    pub sharding: ShardingMode,
    #[serde(default)]
    pub max_steps: Option<usize>,
    #[serde(default = "default_num_train_epochs")]
    pub num_train_epochs: usize,
    #[serde(default = "default_logging_steps")]
    pub logging_steps: usize,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            precision: Precision::default(),
            sharding: ShardingMode::default(),
            max_steps: None,
            num_train_epochs: default_num_train_epochs(),
            logging_steps: default_logging_steps(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard: Option<PathBuf>,
    #[serde(default = "default_tensorboard_flush_every_n")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: true,
            tensorboard: None,
            tensorboard_flush_every_n: default_tensorboard_flush_every_n(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShardingMode {
    #[default]
    None,
    FullShard,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Fp32,
    Fp16,
    Bf16,
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_sensor_channels() -> usize {
    3
}

fn default_encoder_hidden_dim() -> usize {
    64
}

fn default_hidden_dim() -> usize {
    32
}

fn default_num_labels() -> usize {
    2
}

fn default_batch_size() -> usize {
    8
}

fn default_true() -> bool {
    true
}

fn default_learning_rate() -> f64 {
    1e-3
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_ignore_index() -> Option<i64> {
    Some(-100)
}

fn default_checkpoint_exclude() -> Vec<String> {
    vec![BACKBONE_PREFIX.to_string()]
}

fn default_seed() -> u64 {
    42
}

fn default_num_train_epochs() -> usize {
    1
}

fn default_logging_steps() -> usize {
    10
}

fn default_tensorboard_flush_every_n() -> usize {
    10
}

fn precision_to_dtype(precision: Precision) -> DType {
    match precision {
        Precision::Fp32 => DType::F32,
        Precision::Fp16 => DType::F16,
        Precision::Bf16 => DType::BF16,
    }
}
