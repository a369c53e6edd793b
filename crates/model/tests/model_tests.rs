use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use model::{
    unwrap_depth, unwrap_model, BatchInputs, ModelConfig, Replicated, SensorClassifier,
    TrainableModel,
};

fn build_config() -> ModelConfig {
    ModelConfig {
        sensor_channels: 3,
        encoder_hidden_dim: 8,
        hidden_dim: 6,
        num_labels: 4,
        dtype: DType::F32,
        device: Device::Cpu,
    }
}

#[test]
fn forward_produces_sequence_logits() -> Result<()> {
    let model = SensorClassifier::new(build_config())?;
    let sensors = Tensor::randn(0f32, 1.0, (2, 5, 3), &Device::Cpu)?;
    let inputs = BatchInputs::new().with_field(BatchInputs::SENSOR_VALUES, sensors);

    let output = model.forward(&inputs)?;
    let logits = output.logits().expect("logits");

    assert_eq!(logits.dims(), &[2, 5, 4]);
    assert_eq!(logits.dtype(), DType::F32);
    Ok(())
}

#[test]
fn forward_produces_sample_logits() -> Result<()> {
    let model = SensorClassifier::new(build_config())?;
    let sensors = Tensor::randn(0f32, 1.0, (7, 3), &Device::Cpu)?;
    let inputs = BatchInputs::new().with_field(BatchInputs::SENSOR_VALUES, sensors);

    let output = model.forward(&inputs)?;

    assert_eq!(output.logits().expect("logits").dims(), &[7, 4]);
    Ok(())
}

#[test]
fn forward_requires_sensor_values() -> Result<()> {
    let model = SensorClassifier::new(build_config())?;
    assert!(model.forward(&BatchInputs::new()).is_err());
    Ok(())
}

#[test]
fn unwrap_reaches_innermost_model_at_every_depth() -> Result<()> {
    let leaf = SensorClassifier::new(build_config())?;
    assert_eq!(unwrap_depth(&leaf), 0);
    assert!(unwrap_model(&leaf).inner().is_none());

    let once = Replicated::new(SensorClassifier::new(build_config())?);
    assert_eq!(unwrap_depth(&once), 1);

    let thrice = Replicated::new(Replicated::new(Replicated::new(SensorClassifier::new(
        build_config(),
    )?)));
    assert_eq!(unwrap_depth(&thrice), 3);

    let innermost = unwrap_model(&thrice);
    assert!(innermost.inner().is_none());
    let expected: *const SensorClassifier = thrice.module().module().module();
    let actual = innermost as *const dyn TrainableModel as *const SensorClassifier;
    assert_eq!(expected, actual);
    Ok(())
}

#[test]
fn container_snapshot_is_prefixed_but_unwrapped_snapshot_is_not() -> Result<()> {
    let wrapped = Replicated::new(SensorClassifier::new(build_config())?);

    let prefixed = wrapped.state_dict()?;
    assert!(prefixed.keys().all(|key| key.starts_with("module.")));

    let plain = unwrap_model(&wrapped).state_dict()?;
    assert!(plain.keys().all(|key| !key.starts_with("module.")));
    assert_eq!(plain.len(), prefixed.len());
    Ok(())
}
