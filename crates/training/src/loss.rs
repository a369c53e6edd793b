use candle_core::{DType, Tensor, D};
use candle_nn::ops;
use model::{BatchInputs, ModelOutput, TrainableModel};

use crate::{
    config::{LossConfig, LossKind},
    TrainingError,
};

/// Cross entropy over `(N, num_labels)` logits with optional per-class
/// weights and ignore-index handling.
///
/// With weights `w`, the reduction is the weighted mean
/// `sum_i w[y_i] * nll_i / sum_i w[y_i]` over the non-ignored rows.
#[derive(Debug, Clone)]
pub struct CrossEntropyLoss {
    class_weights: Option<Vec<f32>>,
    ignore_index: Option<i64>,
}

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_class_weights(mut self, weights: Vec<f32>) -> Result<Self, TrainingError> {
        if weights.is_empty() {
            return Err(TrainingError::initialization(
                "class weights must contain one entry per label",
            ));
        }
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(TrainingError::initialization(
                "class weights must be finite and non-negative",
            ));
        }
        self.class_weights = Some(weights);
        Ok(self)
    }

    pub fn with_ignore_index(mut self, ignore_index: Option<i64>) -> Self {
        self.ignore_index = ignore_index;
        self
    }

    pub fn class_weights(&self) -> Option<&[f32]> {
        self.class_weights.as_deref()
    }

    pub fn compute(
        &self,
        logits: &Tensor,
        labels: &Tensor,
        num_labels: usize,
    ) -> Result<LossOutput, TrainingError> {
        if num_labels == 0 {
            return Err(TrainingError::runtime(
                "num_labels must be greater than zero",
            ));
        }
        let device = logits.device();
        let dtype = logits.dtype();

        let logits_flat = logits.reshape(((), num_labels))?;
        let rows = logits_flat.dim(0)?;
        let labels_flat = labels.flatten_all()?;
        if labels_flat.dim(0)? != rows {
            return Err(TrainingError::runtime(format!(
                "labels hold {} entries but logits flatten to {} rows of {} labels",
                labels_flat.dim(0)?,
                rows,
                num_labels
            )));
        }
        if rows == 0 {
            return Err(TrainingError::runtime(
                "no samples available for loss computation",
            ));
        }

        let labels_flat = match labels_flat.dtype() {
            DType::I64 => labels_flat,
            DType::U32 | DType::U8 => labels_flat.to_dtype(DType::I64)?,
            other => {
                return Err(TrainingError::runtime(format!(
                    "unsupported label dtype {:?} for cross entropy",
                    other
                )))
            }
        };
        let labels_flat = labels_flat.to_device(device)?;

        let valid = match self.ignore_index {
            Some(ignore_index) => labels_flat.ne(ignore_index)?,
            None => Tensor::ones((rows,), DType::U8, device)?,
        };
        let targets = valid
            .where_cond(&labels_flat, &labels_flat.zeros_like()?)?
            .to_dtype(DType::U32)?;

        let max_label = targets.max(0)?.to_scalar::<u32>()? as usize;
        if max_label >= num_labels {
            return Err(TrainingError::runtime(format!(
                "label {} is out of range for {} classes",
                max_label, num_labels
            )));
        }

        let mask = valid.to_dtype(dtype)?;
        let sample_weights = match &self.class_weights {
            Some(weights) => {
                if weights.len() != num_labels {
                    return Err(TrainingError::runtime(format!(
                        "{} class weights supplied for {} labels",
                        weights.len(),
                        num_labels
                    )));
                }
                let weights = Tensor::from_slice(weights.as_slice(), (weights.len(),), device)?
                    .to_dtype(dtype)?;
                weights.index_select(&targets, 0)?.mul(&mask)?
            }
            None => mask.clone(),
        };

        let total_weight = sample_weights.sum_all()?;
        if total_weight.to_dtype(DType::F32)?.to_scalar::<f32>()? <= 0.0 {
            return Err(TrainingError::runtime(
                "total sample weight is zero: every label is either ignored or has a class weight of 0",
            ));
        }

        let log_probs = ops::log_softmax(&logits_flat, D::Minus1)?;
        let nll = log_probs
            .gather(&targets.unsqueeze(1)?, 1)?
            .squeeze(1)?
            .neg()?;
        let loss = nll.mul(&sample_weights)?.sum_all()?.div(&total_weight)?;
        let average_loss = loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;

        let predictions = logits_flat.argmax(D::Minus1)?;
        let correct = predictions
            .eq(&targets)?
            .to_dtype(DType::F32)?
            .mul(&valid.to_dtype(DType::F32)?)?
            .sum_all()?
            .to_scalar::<f32>()?
            .round() as usize;
        let total_samples = valid
            .to_dtype(DType::F32)?
            .sum_all()?
            .to_scalar::<f32>()?
            .round() as usize;

        Ok(LossOutput {
            loss,
            metrics: LossMetrics {
                average_loss,
                total_samples,
                correct_samples: correct,
            },
        })
    }
}

impl Default for CrossEntropyLoss {
    fn default() -> Self {
        Self {
            class_weights: None,
            ignore_index: Some(-100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

#[derive(Debug, Clone)]
pub struct LossMetrics {
    average_loss: f32,
    total_samples: usize,
    correct_samples: usize,
}

impl LossMetrics {
    pub fn average_loss(&self) -> f32 {
        self.average_loss
    }

    pub fn total_samples(&self) -> usize {
        self.total_samples
    }

    pub fn correct_samples(&self) -> usize {
        self.correct_samples
    }

    pub fn accuracy(&self) -> f32 {
        if self.total_samples == 0 {
            0.0
        } else {
            self.correct_samples as f32 / self.total_samples as f32
        }
    }
}

/// Loss together with the forward outputs when the caller asked for them.
#[derive(Debug, Clone)]
pub struct LossResult {
    pub loss: Tensor,
    pub metrics: LossMetrics,
    pub outputs: Option<ModelOutput>,
}

/// Strategy the trainer calls once per batch.
///
/// Implementations remove the `labels` field from `inputs` before running
/// the forward pass.
pub trait ComputeLoss: Send + Sync {
    fn compute_loss(
        &self,
        model: &dyn TrainableModel,
        inputs: &mut BatchInputs,
        return_outputs: bool,
    ) -> Result<LossResult, TrainingError>;
}

impl<T: ComputeLoss + ?Sized> ComputeLoss for Box<T> {
    fn compute_loss(
        &self,
        model: &dyn TrainableModel,
        inputs: &mut BatchInputs,
        return_outputs: bool,
    ) -> Result<LossResult, TrainingError> {
        (**self).compute_loss(model, inputs, return_outputs)
    }
}

/// Unweighted cross entropy, the trainer's default.
#[derive(Debug, Clone, Default)]
pub struct DefaultLoss {
    criterion: CrossEntropyLoss,
}

impl DefaultLoss {
    pub fn new(ignore_index: Option<i64>) -> Self {
        Self {
            criterion: CrossEntropyLoss::new().with_ignore_index(ignore_index),
        }
    }
}

impl ComputeLoss for DefaultLoss {
    fn compute_loss(
        &self,
        model: &dyn TrainableModel,
        inputs: &mut BatchInputs,
        return_outputs: bool,
    ) -> Result<LossResult, TrainingError> {
        forward_and_score(&self.criterion, model, inputs, return_outputs)
    }
}

/// Cross entropy weighted per class to counter label imbalance.
#[derive(Debug, Clone)]
pub struct WeightedCrossEntropy {
    criterion: CrossEntropyLoss,
}

impl WeightedCrossEntropy {
    /// Fails when no weights are supplied; the weights are fixed afterwards.
    pub fn new(class_weights: Option<Vec<f32>>) -> Result<Self, TrainingError> {
        let Some(weights) = class_weights else {
            return Err(TrainingError::initialization(
                "class_weights for the weighted cross entropy trainer is None",
            ));
        };
        tracing::info!(class_weights = ?weights, "weighted cross entropy configured");
        Ok(Self {
            criterion: CrossEntropyLoss::new().with_class_weights(weights)?,
        })
    }

    pub fn with_ignore_index(mut self, ignore_index: Option<i64>) -> Self {
        self.criterion = self.criterion.with_ignore_index(ignore_index);
        self
    }

    pub fn class_weights(&self) -> &[f32] {
        self.criterion.class_weights().unwrap_or_default()
    }
}

impl ComputeLoss for WeightedCrossEntropy {
    fn compute_loss(
        &self,
        model: &dyn TrainableModel,
        inputs: &mut BatchInputs,
        return_outputs: bool,
    ) -> Result<LossResult, TrainingError> {
        if self.criterion.class_weights().is_none() {
            return Err(TrainingError::runtime("class weights are missing"));
        }
        forward_and_score(&self.criterion, model, inputs, return_outputs)
    }
}

/// Builds the loss strategy named by the configuration.
pub fn build_loss(config: &LossConfig) -> Result<Box<dyn ComputeLoss>, TrainingError> {
    match config.kind {
        LossKind::CrossEntropy => Ok(Box::new(DefaultLoss::new(config.ignore_index))),
        LossKind::WeightedCrossEntropy => Ok(Box::new(
            WeightedCrossEntropy::new(config.class_weights.clone())?
                .with_ignore_index(config.ignore_index),
        )),
    }
}

fn forward_and_score(
    criterion: &CrossEntropyLoss,
    model: &dyn TrainableModel,
    inputs: &mut BatchInputs,
    return_outputs: bool,
) -> Result<LossResult, TrainingError> {
    let labels = inputs.take(BatchInputs::LABELS).ok_or_else(|| {
        TrainingError::runtime(format!(
            "batch is missing the `{}` field",
            BatchInputs::LABELS
        ))
    })?;

    let outputs = model.forward(inputs)?;
    let logits = outputs
        .logits()
        .ok_or_else(|| TrainingError::runtime("model output does not contain logits"))?;

    let LossOutput { loss, metrics } =
        criterion.compute(logits, &labels, model.config().num_labels)?;

    Ok(LossResult {
        loss,
        metrics,
        outputs: return_outputs.then_some(outputs),
    })
}
