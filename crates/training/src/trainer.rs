use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use candle_core::Var;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use model::{unwrap_depth, unwrap_model, StateDict, TrainableModel};

use crate::{
    checkpoint::{self, CheckpointDescriptor, SaveRequest},
    data::{BlockingDataLoader, DataBatch, DataLoader},
    distributed::{FullStateDictPolicy, ProcessGroup, ShardedModel, SingleProcessGroup},
    filter::StateDictFilter,
    hub::{HubPublisher, LocalMirrorPublisher, PublishedCommit, MODEL_SAVE_COMMIT_MESSAGE},
    logging::{Logger, LoggingSettings},
    loss::{build_loss, ComputeLoss, DefaultLoss, WeightedCrossEntropy},
    metrics::{EvaluationMetrics, EvaluationSummary, TrainingMetrics},
    TrainingConfig, TrainingError,
};

/// The model a trainer drives: a plain (possibly wrapped) module, or a
/// fully-sharded container whose full state must be gathered collectively.
pub enum ModelHandle {
    Local(Box<dyn TrainableModel>),
    Sharded(ShardedModel),
}

impl ModelHandle {
    pub fn local<M: TrainableModel + 'static>(model: M) -> Self {
        Self::Local(Box::new(model))
    }

    pub fn as_model(&self) -> &dyn TrainableModel {
        match self {
            Self::Local(model) => model.as_ref(),
            Self::Sharded(model) => model,
        }
    }

    pub fn is_sharded(&self) -> bool {
        matches!(self, Self::Sharded(_))
    }
}

impl From<ShardedModel> for ModelHandle {
    fn from(model: ShardedModel) -> Self {
        Self::Sharded(model)
    }
}

/// How a call to [`Trainer::train_with_shutdown`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainOutcome {
    pub global_step: usize,
    pub steps_run: usize,
    pub interrupted: bool,
}

/// Training driver parameterised by its loss strategy.
///
/// Saving always goes through [`Trainer::save_model`], which handles the
/// collective gather for sharded models, and [`Trainer::save`], which drops
/// the filtered parameters before writing.
pub struct Trainer<L: ComputeLoss = Box<dyn ComputeLoss>> {
    args: TrainingConfig,
    model: ModelHandle,
    loss: L,
    filter: StateDictFilter,
    group: Arc<dyn ProcessGroup>,
    publisher: Option<Box<dyn HubPublisher>>,
    optimizer: Option<AdamW>,
    global_step: usize,
    metrics: TrainingMetrics,
    logger: Logger,
}

/// Trainer with the unweighted cross entropy.
pub type SensorTrainer = Trainer<DefaultLoss>;

/// Trainer whose loss weights each class.
pub type WeightedLossTrainer = Trainer<WeightedCrossEntropy>;

impl Trainer<Box<dyn ComputeLoss>> {
    /// Picks the loss strategy named in `args.loss`.
    pub fn from_config(args: TrainingConfig, model: ModelHandle) -> Result<Self, TrainingError> {
        let loss = build_loss(&args.loss)?;
        Self::new(args, model, loss)
    }
}

impl Trainer<DefaultLoss> {
    pub fn sensor(args: TrainingConfig, model: ModelHandle) -> Result<Self, TrainingError> {
        let loss = DefaultLoss::new(args.loss.ignore_index);
        Self::new(args, model, loss)
    }
}

impl Trainer<WeightedCrossEntropy> {
    /// Fails before touching the model when `class_weights` is `None`.
    pub fn weighted(
        args: TrainingConfig,
        model: ModelHandle,
        class_weights: Option<Vec<f32>>,
    ) -> Result<Self, TrainingError> {
        let loss = WeightedCrossEntropy::new(class_weights)?.with_ignore_index(args.loss.ignore_index);
        Self::new(args, model, loss)
    }
}

impl<L: ComputeLoss> Trainer<L> {
    pub fn new(args: TrainingConfig, model: ModelHandle, loss: L) -> Result<Self, TrainingError> {
        args.validate()?;

        if args.is_full_shard() != model.is_sharded() {
            return Err(TrainingError::initialization(format!(
                "runtime.sharding is {:?} but the trainer was given a {} model",
                args.runtime.sharding,
                if model.is_sharded() { "sharded" } else { "local" }
            )));
        }

        let group: Arc<dyn ProcessGroup> = match &model {
            ModelHandle::Sharded(sharded) => Arc::clone(sharded.group()),
            ModelHandle::Local(_) => Arc::new(SingleProcessGroup),
        };

        let mut logging = LoggingSettings::from_config(&args.runtime.logging);
        if !group.is_coordinator() {
            logging.tensorboard_dir = None;
        }
        let logger = Logger::new(logging)?;

        let publisher = LocalMirrorPublisher::from_config(&args.hub)
            .map(|publisher| Box::new(publisher) as Box<dyn HubPublisher>);
        let filter = StateDictFilter::excluding(args.checkpoint.exclude.iter().cloned());

        let inner = model.as_model();
        tracing::info!(
            rank = group.rank(),
            world_size = group.world_size(),
            wrapping_depth = unwrap_depth(inner),
            device = ?inner.device(),
            exclude = ?filter.markers(),
            "trainer ready"
        );

        Ok(Self {
            args,
            model,
            loss,
            filter,
            group,
            publisher,
            optimizer: None,
            global_step: 0,
            metrics: TrainingMetrics::new(),
            logger,
        })
    }

    /// Replaces the group of a local model, e.g. to run several replicas.
    pub fn with_process_group(mut self, group: Arc<dyn ProcessGroup>) -> Result<Self, TrainingError> {
        if self.model.is_sharded() {
            return Err(TrainingError::initialization(
                "a sharded model already carries its own process group",
            ));
        }
        self.group = group;
        Ok(self)
    }

    pub fn with_publisher(mut self, publisher: Box<dyn HubPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_state_dict_filter(mut self, filter: StateDictFilter) -> Self {
        self.filter = filter;
        self.optimizer = None;
        self
    }

    pub fn args(&self) -> &TrainingConfig {
        &self.args
    }

    /// The model as handed to the trainer, wrappers included.
    pub fn model(&self) -> &dyn TrainableModel {
        self.model.as_model()
    }

    pub fn loss(&self) -> &L {
        &self.loss
    }

    pub fn filter(&self) -> &StateDictFilter {
        &self.filter
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    /// Whether this process writes files.
    pub fn should_save(&self) -> bool {
        self.group.is_coordinator()
    }

    /// Writes the filtered weights plus configuration into `output_dir`
    /// (default `args.output_dir`).
    ///
    /// Without an explicit `state_dict`, the innermost model is snapshotted.
    pub fn save(
        &self,
        output_dir: Option<&Path>,
        state_dict: Option<StateDict>,
    ) -> Result<CheckpointDescriptor, TrainingError> {
        let output_dir = output_dir.unwrap_or(&self.args.output_dir);
        let model = unwrap_model(self.model.as_model());
        let state_dict = match state_dict {
            Some(state_dict) => state_dict,
            None => model.state_dict()?,
        };

        let excluded = self.filter.excluded_keys(&state_dict);
        let state_dict = self.filter.apply(state_dict);
        tracing::debug!(
            kept = state_dict.len(),
            excluded = excluded.len(),
            "filtered state dict"
        );

        checkpoint::write_model_artifacts(SaveRequest {
            output_dir,
            state_dict: &state_dict,
            excluded,
            model_config: model.config(),
            args: &self.args,
            global_step: self.global_step,
        })
    }

    /// Saves the model and, unless `internal_call`, publishes it when
    /// `hub.push_to_hub` is set.
    ///
    /// Under `full_shard` every rank must call this: the full state is
    /// gathered inside a collective scope, then only the coordinator writes.
    pub fn save_model(&self, output_dir: Option<&Path>, internal_call: bool) -> Result<(), TrainingError> {
        match &self.model {
            ModelHandle::Sharded(sharded) if self.args.is_full_shard() => {
                let scope = sharded.full_state_dict_scope(FullStateDictPolicy::default())?;
                let collected = scope.collect();
                drop(scope);
                let state_dict = collected?;
                if self.should_save() {
                    self.save(output_dir, Some(state_dict))?;
                }
            }
            _ => {
                if self.should_save() {
                    self.save(output_dir, None)?;
                }
            }
        }

        if self.args.hub.push_to_hub && !internal_call {
            self.push_to_hub(output_dir)?;
        }
        Ok(())
    }

    /// Publishes the contents of `output_dir` from the coordinator.
    pub fn push_to_hub(&self, output_dir: Option<&Path>) -> Result<Option<PublishedCommit>, TrainingError> {
        if !self.should_save() {
            return Ok(None);
        }
        let Some(publisher) = self.publisher.as_ref() else {
            return Err(TrainingError::runtime(
                "hub.push_to_hub is set but no publisher is configured",
            ));
        };
        let folder = output_dir.unwrap_or(&self.args.output_dir);
        publisher.publish(folder, MODEL_SAVE_COMMIT_MESSAGE).map(Some)
    }

    pub fn train<D: DataLoader>(
        &mut self,
        loader: &mut BlockingDataLoader<D>,
    ) -> Result<TrainOutcome, TrainingError> {
        self.train_with_shutdown(loader, || false)
    }

    pub fn train_with_shutdown<D, F>(
        &mut self,
        loader: &mut BlockingDataLoader<D>,
        should_stop: F,
    ) -> Result<TrainOutcome, TrainingError>
    where
        D: DataLoader,
        F: FnMut() -> bool,
    {
        let mut optimizer = match self.optimizer.take() {
            Some(optimizer) => optimizer,
            None => self.build_optimizer()?,
        };
        let outcome = self.run_loop(&mut optimizer, loader, should_stop);
        self.optimizer = Some(optimizer);
        self.logger.flush();
        outcome
    }

    fn run_loop<D, F>(
        &mut self,
        optimizer: &mut AdamW,
        loader: &mut BlockingDataLoader<D>,
        mut should_stop: F,
    ) -> Result<TrainOutcome, TrainingError>
    where
        D: DataLoader,
        F: FnMut() -> bool,
    {
        let start_step = self.global_step;
        let mut interrupted = false;

        loop {
            if should_stop() {
                interrupted = true;
                break;
            }
            if let Some(limit) = self.args.runtime.max_steps {
                if self.global_step >= limit {
                    break;
                }
            }

            let Some(batch) = loader.next_batch()? else {
                break;
            };
            let DataBatch {
                mut inputs,
                batch_size,
                epoch,
            } = batch;
            if epoch >= self.args.runtime.num_train_epochs {
                break;
            }

            let result = self
                .loss
                .compute_loss(self.model.as_model(), &mut inputs, false)?;
            let average_loss = result.metrics.average_loss() as f64;
            if !average_loss.is_finite() {
                return Err(TrainingError::runtime(format!(
                    "loss became non-finite at step {}",
                    self.global_step + 1
                )));
            }
            optimizer.backward_step(&result.loss)?;
            self.global_step += 1;

            let snapshot = self.metrics.record_step(
                batch_size as u64,
                average_loss,
                result.metrics.accuracy() as f64,
            );
            if self.global_step % self.args.runtime.logging_steps == 0 || self.global_step == 1 {
                self.logger
                    .log_training_step(self.global_step, optimizer.learning_rate(), &snapshot);
            }

            if let Some(every) = self.args.checkpoint.save_steps {
                if self.global_step % every == 0 {
                    self.save_checkpoint()?;
                }
            }
        }

        if interrupted {
            tracing::warn!(step = self.global_step, "training interrupted");
        }

        Ok(TrainOutcome {
            global_step: self.global_step,
            steps_run: self.global_step - start_step,
            interrupted,
        })
    }

    /// Periodic save into `checkpoint-<step>`; never published.
    fn save_checkpoint(&self) -> Result<PathBuf, TrainingError> {
        let directory = self
            .args
            .output_dir
            .join(checkpoint::checkpoint_dir_name(self.global_step));
        self.save_model(Some(&directory), true)?;
        if self.should_save() {
            checkpoint::rotate_checkpoints(
                &self.args.output_dir,
                self.args.checkpoint.save_total_limit,
            )?;
        }
        Ok(directory)
    }

    /// Average loss and accuracy over every batch of `loader`, without
    /// updating parameters.
    pub fn evaluate<D: DataLoader>(
        &mut self,
        loader: &mut BlockingDataLoader<D>,
    ) -> Result<EvaluationSummary, TrainingError> {
        let mut metrics = EvaluationMetrics::default();
        while let Some(batch) = loader.next_batch()? {
            let DataBatch { mut inputs, .. } = batch;
            let result = self
                .loss
                .compute_loss(self.model.as_model(), &mut inputs, false)?;
            metrics.update(
                result.metrics.average_loss() as f64,
                result.metrics.total_samples() as u64,
                result.metrics.correct_samples() as u64,
            );
        }
        let summary = metrics
            .finalize()
            .ok_or_else(|| TrainingError::runtime("evaluation produced no samples"))?;
        self.logger.log_evaluation(self.global_step, &summary);
        self.logger.flush();
        Ok(summary)
    }

    /// Loads the newest `checkpoint-<step>` under `output_dir`, if any.
    ///
    /// Parameters left out at save time keep their current values.
    pub fn resume_from_latest(&mut self) -> Result<Option<CheckpointDescriptor>, TrainingError> {
        let Some(descriptor) = checkpoint::latest_checkpoint(&self.args.output_dir)? else {
            return Ok(None);
        };
        self.resume_from_path(&descriptor.directory).map(Some)
    }

    pub fn resume_from_path(&mut self, directory: &Path) -> Result<CheckpointDescriptor, TrainingError> {
        let loaded = checkpoint::load_checkpoint(directory)?;
        let model = unwrap_model(self.model.as_model());
        let applied = checkpoint::apply_state_dict(model, &loaded.state_dict, &self.filter)?;
        self.global_step = loaded.manifest.global_step;
        tracing::info!(
            dir = %directory.display(),
            step = self.global_step,
            tensors = applied,
            "resumed from checkpoint"
        );
        Ok(CheckpointDescriptor {
            directory: directory.to_path_buf(),
            manifest: loaded.manifest,
        })
    }

    fn build_optimizer(&self) -> Result<AdamW, TrainingError> {
        let freeze = self.args.checkpoint.freeze_backbone;
        let model = unwrap_model(self.model.as_model());
        let mut frozen = 0usize;
        let vars: Vec<Var> = model
            .parameters()
            .into_iter()
            .filter_map(|(name, var)| {
                if freeze && self.filter.excludes(&name) {
                    frozen += 1;
                    None
                } else {
                    Some(var)
                }
            })
            .collect();
        if vars.is_empty() {
            return Err(TrainingError::initialization(
                "model has no trainable parameters",
            ));
        }
        tracing::info!(trainable = vars.len(), frozen, "optimizer tracks parameters");

        let options = &self.args.optimizer;
        let params = ParamsAdamW {
            lr: options.learning_rate,
            beta1: options.beta1,
            beta2: options.beta2,
            eps: options.epsilon,
            weight_decay: options.weight_decay,
        };
        Ok(AdamW::new(vars, params)?)
    }
}
