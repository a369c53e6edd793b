mod common;

use anyhow::Result;
use candle_core::{DType, Device, Tensor, Var};
use model::{BatchInputs, ModelConfig, ModelOutput, SensorClassifier, StateDict, TrainableModel};
use tempfile::tempdir;
use training::{
    ComputeLoss, ModelHandle, Trainer, TrainingConfig, TrainingError, WeightedCrossEntropy,
};

/// Returns the same logits whatever the input.
struct FixedLogits {
    config: ModelConfig,
    logits: Tensor,
}

impl TrainableModel for FixedLogits {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn state_dict(&self) -> candle_core::Result<StateDict> {
        Ok(StateDict::new())
    }

    fn forward(&self, _inputs: &BatchInputs) -> candle_core::Result<ModelOutput> {
        Ok(ModelOutput::new(self.logits.clone()))
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        Vec::new()
    }
}

/// Produces no logits at all.
struct Headless {
    config: ModelConfig,
}

impl TrainableModel for Headless {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn state_dict(&self) -> candle_core::Result<StateDict> {
        Ok(StateDict::new())
    }

    fn forward(&self, _inputs: &BatchInputs) -> candle_core::Result<ModelOutput> {
        Ok(ModelOutput::default())
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        Vec::new()
    }
}

fn fixed(logits: Tensor) -> FixedLogits {
    FixedLogits {
        config: common::tiny_config(2),
        logits,
    }
}

fn batch(labels: Tensor) -> BatchInputs {
    BatchInputs::new()
        .with_field(
            BatchInputs::SENSOR_VALUES,
            Tensor::zeros((2, 2), candle_core::DType::F32, &Device::Cpu).unwrap(),
        )
        .with_field(BatchInputs::LABELS, labels)
}

fn nll(correct: f32, other: f32) -> f32 {
    -(correct.exp() / (correct.exp() + other.exp())).ln()
}

fn scalar(tensor: &Tensor) -> f32 {
    tensor.to_scalar::<f32>().unwrap()
}

#[test]
fn class_weights_shift_the_loss() -> Result<()> {
    let model = fixed(Tensor::from_slice(
        &[2.0f32, 0.0, 0.0, 1.0],
        (2, 2),
        &Device::Cpu,
    )?);
    let labels = Tensor::from_slice(&[0i64, 1], (2,), &Device::Cpu)?;
    let nll0 = nll(2.0, 0.0);
    let nll1 = nll(1.0, 0.0);

    let favour_second = WeightedCrossEntropy::new(Some(vec![0.2, 0.8]))?;
    let favour_first = WeightedCrossEntropy::new(Some(vec![0.8, 0.2]))?;

    let a = favour_second.compute_loss(&model, &mut batch(labels.clone()), false)?;
    let b = favour_first.compute_loss(&model, &mut batch(labels), false)?;

    let expected_a = (0.2 * nll0 + 0.8 * nll1) / (0.2 + 0.8);
    let expected_b = (0.8 * nll0 + 0.2 * nll1) / (0.8 + 0.2);
    assert!((scalar(&a.loss) - expected_a).abs() < 1e-5);
    assert!((scalar(&b.loss) - expected_b).abs() < 1e-5);
    assert!(scalar(&a.loss) > scalar(&b.loss));
    Ok(())
}

#[test]
fn class_weights_follow_the_logits_dtype() -> Result<()> {
    let values = [1.0f32, 0.0, 0.5, 1.5, 2.0, -1.0, 0.0, 0.25];
    let labels = Tensor::from_slice(&[0i64, 1, 0, 1], (4,), &Device::Cpu)?;
    let rows = [(1.0, 0.0), (1.5, 0.5), (2.0, -1.0), (0.25, 0.0)];
    let labels_of_rows = [0usize, 1, 0, 1];
    let expected = |weights: [f64; 2]| {
        let (mut numerator, mut denominator) = (0.0f64, 0.0f64);
        for ((correct, other), label) in rows.iter().zip(labels_of_rows) {
            let nll = -(f64::exp(*correct) / (f64::exp(*correct) + f64::exp(*other))).ln();
            numerator += weights[label] * nll;
            denominator += weights[label];
        }
        numerator / denominator
    };

    for (dtype, tolerance) in [
        (DType::F32, 1e-5),
        (DType::F64, 1e-5),
        (DType::F16, 5e-3),
        (DType::BF16, 2e-2),
    ] {
        let logits = Tensor::from_slice(&values, (4, 2), &Device::Cpu)?.to_dtype(dtype)?;
        let model = fixed(logits);
        let mut losses = Vec::new();
        for weights in [[0.2, 0.8], [0.8, 0.2]] {
            let loss = WeightedCrossEntropy::new(Some(vec![weights[0] as f32, weights[1] as f32]))?;
            let mut inputs = BatchInputs::new().with_field(BatchInputs::LABELS, labels.clone());
            let result = loss.compute_loss(&model, &mut inputs, false)?;
            assert_eq!(result.loss.dtype(), dtype);

            let value = result.loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;
            assert!(
                (value - expected(weights)).abs() < tolerance,
                "{dtype:?} with {weights:?}: {value} vs {}",
                expected(weights)
            );
            losses.push(value);
        }
        assert!((losses[0] - losses[1]).abs() > tolerance, "{dtype:?} ignored the weights");
    }
    Ok(())
}

#[test]
fn weighted_mean_divides_by_selected_weights() -> Result<()> {
    let model = fixed(Tensor::from_slice(
        &[2.0f32, 0.0, 0.0, 1.0, 3.0, 0.0],
        (3, 2),
        &Device::Cpu,
    )?);
    let labels = Tensor::from_slice(&[0i64, 1, 0], (3,), &Device::Cpu)?;
    let loss = WeightedCrossEntropy::new(Some(vec![1.0, 3.0]))?;

    let mut inputs = BatchInputs::new().with_field(BatchInputs::LABELS, labels);
    let result = loss.compute_loss(&model, &mut inputs, false)?;

    let expected = (nll(2.0, 0.0) + 3.0 * nll(1.0, 0.0) + nll(3.0, 0.0)) / 5.0;
    assert!((scalar(&result.loss) - expected).abs() < 1e-5);
    Ok(())
}

#[test]
fn sequence_logits_flatten_to_rows() -> Result<()> {
    let values: Vec<f32> = (0..12).map(|v| (v as f32 * 0.37).sin()).collect();
    let logits_3d = Tensor::from_vec(values.clone(), (2, 3, 2), &Device::Cpu)?;
    let logits_2d = Tensor::from_vec(values, (6, 2), &Device::Cpu)?;
    let labels_2d = Tensor::from_slice(&[0i64, 1, 1, 0, -100, 1], (2, 3), &Device::Cpu)?;
    let labels_1d = labels_2d.flatten_all()?;
    let loss = WeightedCrossEntropy::new(Some(vec![0.3, 0.7]))?;

    let mut inputs = BatchInputs::new().with_field(BatchInputs::LABELS, labels_2d);
    let sequence = loss.compute_loss(&fixed(logits_3d), &mut inputs, true)?;
    let flat = loss.compute_loss(
        &fixed(logits_2d),
        &mut BatchInputs::new().with_field(BatchInputs::LABELS, labels_1d),
        false,
    )?;

    assert!((scalar(&sequence.loss) - scalar(&flat.loss)).abs() < 1e-6);
    assert_eq!(sequence.metrics.total_samples(), 5);
    assert!(!inputs.contains(BatchInputs::LABELS));
    let outputs = sequence.outputs.expect("outputs requested");
    assert_eq!(outputs.logits().unwrap().dims(), &[2, 3, 2]);
    assert!(flat.outputs.is_none());
    Ok(())
}

#[test]
fn labels_of_the_wrong_length_are_rejected() -> Result<()> {
    let model = fixed(Tensor::zeros((4, 2), candle_core::DType::F32, &Device::Cpu)?);
    let labels = Tensor::from_slice(&[0i64, 1, 1], (3,), &Device::Cpu)?;
    let loss = WeightedCrossEntropy::new(Some(vec![0.5, 0.5]))?;

    let err = loss
        .compute_loss(&model, &mut batch(labels), false)
        .unwrap_err();
    assert!(matches!(err, TrainingError::Runtime(_)));
    Ok(())
}

#[test]
fn missing_logits_and_labels_are_errors() -> Result<()> {
    let loss = WeightedCrossEntropy::new(Some(vec![0.5, 0.5]))?;
    let headless = Headless {
        config: common::tiny_config(2),
    };
    let labels = Tensor::from_slice(&[0i64, 1], (2,), &Device::Cpu)?;
    assert!(loss
        .compute_loss(&headless, &mut batch(labels), false)
        .is_err());

    let model = fixed(Tensor::zeros((2, 2), candle_core::DType::F32, &Device::Cpu)?);
    let mut unlabeled = BatchInputs::new();
    assert!(loss.compute_loss(&model, &mut unlabeled, false).is_err());
    Ok(())
}

#[test]
fn weighted_trainer_requires_class_weights() -> Result<()> {
    let tmp = tempdir()?;
    let mut args = TrainingConfig::new(tmp.path().join("out"));
    args.model.sensor_channels = 2;
    let model = SensorClassifier::new(args.resolve_model_config(&Device::Cpu)?)?;

    let err = Trainer::weighted(args.clone(), ModelHandle::local(model), None)
        .err()
        .expect("construction must fail");
    assert!(matches!(err, TrainingError::Initialization(_)));
    assert!(!args.output_dir.exists());

    let model = SensorClassifier::new(args.resolve_model_config(&Device::Cpu)?)?;
    let trainer = Trainer::weighted(args, ModelHandle::local(model), Some(vec![0.25, 0.75]))?;
    assert_eq!(trainer.loss().class_weights(), &[0.25, 0.75]);
    Ok(())
}
