use std::path::Path;

use candle_core::{safetensors::load as load_safetensors, DType, Device, Tensor};
use futures::future::BoxFuture;
use model::BatchInputs;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::TrainingError;

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// Batch returned by dataset loaders.
#[derive(Debug)]
pub struct DataBatch {
    /// `sensor_values` and `labels`, ready for the loss strategy.
    pub inputs: BatchInputs,
    pub batch_size: usize,
    pub epoch: usize,
}

/// Asynchronous-compatible loader abstraction.
pub trait DataLoader: Send {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<DataBatch>>>;
}

/// Blocking adapter around an async-friendly loader.
pub struct BlockingDataLoader<L>
where
    L: DataLoader,
{
    inner: L,
}

impl<L> BlockingDataLoader<L>
where
    L: DataLoader,
{
    pub fn new(inner: L) -> Self {
        Self { inner }
    }

    pub fn next_batch(&mut self) -> Result<Option<DataBatch>> {
        futures::executor::block_on(self.inner.next_batch())
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }

    pub fn into_inner(self) -> L {
        self.inner
    }
}

/// Labeled sensor windows held in memory.
///
/// `sensor_values` is `(examples, channels)` or `(examples, steps, channels)`;
/// `labels` is `(examples,)` or `(examples, steps)` and stored as `i64`.
#[derive(Debug, Clone)]
pub struct SensorDataset {
    sensor_values: Tensor,
    labels: Tensor,
}

impl SensorDataset {
    pub fn new(sensor_values: Tensor, labels: Tensor) -> Result<Self> {
        let values_dims = sensor_values.dims().to_vec();
        let label_dims = labels.dims().to_vec();
        if !(values_dims.len() == 2 || values_dims.len() == 3) {
            return Err(TrainingError::initialization(format!(
                "sensor_values must have rank 2 or 3, got {:?}",
                values_dims
            )));
        }
        if label_dims.len() + 1 != values_dims.len()
            || label_dims[..] != values_dims[..values_dims.len() - 1]
        {
            return Err(TrainingError::initialization(format!(
                "labels {:?} do not line up with sensor_values {:?}",
                label_dims, values_dims
            )));
        }
        if values_dims[0] == 0 {
            return Err(TrainingError::initialization("sensor dataset is empty"));
        }
        let labels = labels.to_dtype(DType::I64)?;
        Ok(Self {
            sensor_values,
            labels,
        })
    }

    /// Reads the `sensor_values` and `labels` tensors from a safetensors file.
    pub fn from_safetensors(path: &Path, device: &Device) -> Result<Self> {
        let mut tensors = load_safetensors(path, device).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to read dataset {}: {err}",
                path.display()
            ))
        })?;
        let mut take = |name: &str| {
            tensors.remove(name).ok_or_else(|| {
                TrainingError::initialization(format!(
                    "dataset {} has no `{name}` tensor",
                    path.display()
                ))
            })
        };
        let sensor_values = take(BatchInputs::SENSOR_VALUES)?;
        let labels = take(BatchInputs::LABELS)?;
        Self::new(sensor_values, labels)
    }

    pub fn len(&self) -> usize {
        self.sensor_values.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sensor_channels(&self) -> usize {
        let dims = self.sensor_values.dims();
        dims[dims.len() - 1]
    }

    fn rows(&self, indices: &[u32]) -> Result<BatchInputs> {
        let index = Tensor::from_slice(indices, (indices.len(),), self.sensor_values.device())?;
        Ok(BatchInputs::new()
            .with_field(
                BatchInputs::SENSOR_VALUES,
                self.sensor_values.index_select(&index, 0)?,
            )
            .with_field(BatchInputs::LABELS, self.labels.index_select(&index, 0)?))
    }
}

/// Yields fixed-size batches for `epochs` passes over a [`SensorDataset`],
/// reshuffling each epoch with a seed derived from the run seed.
pub struct SensorDataLoader {
    dataset: SensorDataset,
    batch_size: usize,
    epochs: usize,
    shuffle: bool,
    seed: u64,
    epoch: usize,
    cursor: usize,
    order: Vec<u32>,
}

impl SensorDataLoader {
    pub fn new(
        dataset: SensorDataset,
        batch_size: usize,
        epochs: usize,
        shuffle: bool,
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        let mut loader = Self {
            dataset,
            batch_size,
            epochs,
            shuffle,
            seed,
            epoch: 0,
            cursor: 0,
            order: Vec::new(),
        };
        loader.prepare_epoch();
        Ok(loader)
    }

    pub fn dataset(&self) -> &SensorDataset {
        &self.dataset
    }

    pub fn batches_per_epoch(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    fn prepare_epoch(&mut self) {
        self.order = (0..self.dataset.len() as u32).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch as u64));
            self.order.shuffle(&mut rng);
        }
        self.cursor = 0;
        tracing::debug!(epoch = self.epoch, examples = self.order.len(), "epoch ready");
    }

    fn next_batch_sync(&mut self) -> Result<Option<DataBatch>> {
        if self.cursor >= self.order.len() {
            self.epoch += 1;
            if self.epoch >= self.epochs {
                return Ok(None);
            }
            self.prepare_epoch();
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = &self.order[self.cursor..end];
        let inputs = self.dataset.rows(indices)?;
        self.cursor = end;
        Ok(Some(DataBatch {
            inputs,
            batch_size: indices.len(),
            epoch: self.epoch,
        }))
    }
}

impl DataLoader for SensorDataLoader {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<DataBatch>>> {
        Box::pin(async move { self.next_batch_sync() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(n: usize) -> SensorDataset {
        let values: Vec<f32> = (0..n * 2).map(|v| v as f32).collect();
        let labels: Vec<i64> = (0..n as i64).collect();
        SensorDataset::new(
            Tensor::from_vec(values, (n, 2), &Device::Cpu).unwrap(),
            Tensor::from_vec(labels, (n,), &Device::Cpu).unwrap(),
        )
        .unwrap()
    }

    fn labels_of(batch: &DataBatch) -> Vec<i64> {
        batch
            .inputs
            .get(BatchInputs::LABELS)
            .unwrap()
            .to_vec1::<i64>()
            .unwrap()
    }

    #[test]
    fn visits_every_example_once_per_epoch() {
        let loader = SensorDataLoader::new(dataset(5), 2, 2, true, 7).unwrap();
        let mut loader = BlockingDataLoader::new(loader);
        let mut per_epoch = vec![Vec::new(), Vec::new()];
        let mut sizes = Vec::new();
        while let Some(batch) = loader.next_batch().unwrap() {
            sizes.push(batch.batch_size);
            per_epoch[batch.epoch].extend(labels_of(&batch));
        }
        assert_eq!(sizes, vec![2, 2, 1, 2, 2, 1]);
        assert_eq!(loader.inner().batches_per_epoch(), 3);
        for mut seen in per_epoch {
            seen.sort();
            assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        }
    }

    #[test]
    fn unshuffled_order_is_sequential() {
        let loader = SensorDataLoader::new(dataset(3), 3, 1, false, 0).unwrap();
        let mut loader = BlockingDataLoader::new(loader);
        let batch = loader.next_batch().unwrap().unwrap();
        assert_eq!(labels_of(&batch), vec![0, 1, 2]);
        assert!(loader.next_batch().unwrap().is_none());
    }

    #[test]
    fn rejects_mismatched_labels() {
        let values = Tensor::zeros((4, 2), DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::zeros((3,), DType::I64, &Device::Cpu).unwrap();
        assert!(SensorDataset::new(values, labels).is_err());
    }

    #[test]
    fn loads_from_safetensors() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("train.safetensors");
        let mut tensors = std::collections::HashMap::new();
        tensors.insert(
            BatchInputs::SENSOR_VALUES.to_string(),
            Tensor::zeros((4, 3, 2), DType::F32, &Device::Cpu).unwrap(),
        );
        tensors.insert(
            BatchInputs::LABELS.to_string(),
            Tensor::zeros((4, 3), DType::U32, &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let dataset = SensorDataset::from_safetensors(&path, &Device::Cpu).unwrap();
        assert_eq!(dataset.len(), 4);
        assert_eq!(dataset.sensor_channels(), 2);
    }
}
