#![allow(dead_code)]

use std::{collections::HashMap, path::Path};

use candle_core::{DType, Device, Tensor};
use model::{BatchInputs, ModelConfig};

pub fn tiny_config(sensor_channels: usize) -> ModelConfig {
    ModelConfig {
        sensor_channels,
        encoder_hidden_dim: 5,
        hidden_dim: 4,
        num_labels: 2,
        dtype: DType::F32,
        device: Device::Cpu,
    }
}

/// Two-channel readings labelled by which channel is larger.
pub fn separable_tensors(examples: usize) -> (Tensor, Tensor) {
    let mut values = Vec::with_capacity(examples * 2);
    let mut labels = Vec::with_capacity(examples);
    for i in 0..examples {
        let a = (i as f32 * 1.3).sin();
        let b = (i as f32 * 0.7).cos();
        values.push(a);
        values.push(b);
        labels.push(if a > b { 1i64 } else { 0 });
    }
    (
        Tensor::from_vec(values, (examples, 2), &Device::Cpu).unwrap(),
        Tensor::from_vec(labels, (examples,), &Device::Cpu).unwrap(),
    )
}

pub fn write_dataset(path: &Path, examples: usize) {
    let (values, labels) = separable_tensors(examples);
    let mut tensors = HashMap::new();
    tensors.insert(BatchInputs::SENSOR_VALUES.to_string(), values);
    tensors.insert(BatchInputs::LABELS.to_string(), labels);
    candle_core::safetensors::save(&tensors, path).unwrap();
}
