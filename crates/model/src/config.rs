use candle_core::{DType, Device, Error, Result};
use serde::{Deserialize, Serialize};

/// High-level configuration for assembling the sensor classifier.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub sensor_channels: usize,
    pub encoder_hidden_dim: usize,
    pub hidden_dim: usize,
    pub num_labels: usize,
    pub dtype: DType,
    pub device: Device,
}

impl ModelConfig {
    /// Validate structural invariants before any parameter is allocated.
    pub fn validate(&self) -> Result<()> {
        if self.sensor_channels == 0 {
            return Err(Error::Msg("sensor_channels must be greater than zero".into()));
        }
        if self.encoder_hidden_dim == 0 {
            return Err(Error::Msg(
                "encoder_hidden_dim must be greater than zero".into(),
            ));
        }
        if self.hidden_dim == 0 {
            return Err(Error::Msg("hidden_dim must be greater than zero".into()));
        }
        if self.num_labels < 2 {
            return Err(Error::Msg(format!(
                "num_labels must be at least 2 (got {})",
                self.num_labels
            )));
        }
        if !self.dtype.is_float() {
            return Err(Error::Msg(format!(
                "parameter dtype must be floating point (got {:?})",
                self.dtype
            )));
        }
        Ok(())
    }

    /// Serializable view written next to checkpoints as `config.json`.
    pub fn record(&self) -> ModelConfigRecord {
        ModelConfigRecord {
            architecture: "SensorClassifier".to_string(),
            sensor_channels: self.sensor_channels,
            encoder_hidden_dim: self.encoder_hidden_dim,
            hidden_dim: self.hidden_dim,
            num_labels: self.num_labels,
            dtype: self.dtype.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfigRecord {
    pub architecture: String,
    pub sensor_channels: usize,
    pub encoder_hidden_dim: usize,
    pub hidden_dim: usize,
    pub num_labels: usize,
    pub dtype: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ModelConfig {
        ModelConfig {
            sensor_channels: 3,
            encoder_hidden_dim: 8,
            hidden_dim: 4,
            num_labels: 2,
            dtype: DType::F32,
            device: Device::Cpu,
        }
    }

    #[test]
    fn rejects_single_label() {
        let mut cfg = config();
        cfg.num_labels = 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_integer_dtype() {
        let mut cfg = config();
        cfg.dtype = DType::U32;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn record_carries_dtype_name() {
        let record = config().record();
        assert_eq!(record.dtype, "f32");
        assert_eq!(record.num_labels, 2);
    }
}
