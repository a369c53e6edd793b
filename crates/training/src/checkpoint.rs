use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{safetensors::load as load_safetensors, Device};
use hex::encode as hex_encode;
use model::{ModelConfig, StateDict, TrainableModel};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{filter::StateDictFilter, TrainingConfig, TrainingError};

pub const CHECKPOINT_VERSION: u32 = 1;
pub const CHECKPOINT_PREFIX: &str = "checkpoint-";
pub const MODEL_FILENAME: &str = "model.safetensors";
pub const CONFIG_FILENAME: &str = "config.json";
pub const TRAINING_ARGS_FILENAME: &str = "training_args.json";
pub const MANIFEST_FILENAME: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub config_sha256: String,
    pub global_step: usize,
    pub model: FileRecord,
    pub config: FileRecord,
    pub training_args: FileRecord,
    /// Saved tensor names in snapshot order.
    pub tensors: Vec<String>,
    /// Names the state-dict filter left out of `model`.
    pub excluded: Vec<String>,
}

impl CheckpointManifest {
    pub fn files(&self) -> [&FileRecord; 3] {
        [&self.model, &self.config, &self.training_args]
    }
}

pub struct SaveRequest<'a> {
    pub output_dir: &'a Path,
    pub state_dict: &'a StateDict,
    pub excluded: Vec<String>,
    pub model_config: &'a ModelConfig,
    pub args: &'a TrainingConfig,
    pub global_step: usize,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

pub struct LoadedCheckpoint {
    pub manifest: CheckpointManifest,
    pub state_dict: StateDict,
}

/// Writes weights, model config, training arguments and a manifest into
/// `request.output_dir`, replacing files of the same name.
pub fn write_model_artifacts(
    request: SaveRequest<'_>,
) -> Result<CheckpointDescriptor, TrainingError> {
    let output_dir = request.output_dir;
    fs::create_dir_all(output_dir).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create output directory {}: {err}",
            output_dir.display()
        ))
    })?;

    if request.state_dict.is_empty() {
        tracing::warn!(
            dir = %output_dir.display(),
            "writing a checkpoint without any tensors"
        );
    }

    let model_path = output_dir.join(MODEL_FILENAME);
    candle_core::safetensors::save(&request.state_dict.to_hashmap(), &model_path).map_err(
        |err| {
            TrainingError::runtime(format!(
                "failed to serialize model weights to {}: {err}",
                model_path.display()
            ))
        },
    )?;
    let model_record = file_record(&model_path)?;

    let config_path = output_dir.join(CONFIG_FILENAME);
    write_json(&config_path, &request.model_config.record())?;
    let config_record = file_record(&config_path)?;

    let args_path = output_dir.join(TRAINING_ARGS_FILENAME);
    write_json(&args_path, request.args)?;
    let args_record = file_record(&args_path)?;

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp: unix_timestamp(),
        config_sha256: fingerprint_config(request.args)?,
        global_step: request.global_step,
        model: model_record,
        config: config_record,
        training_args: args_record,
        tensors: request.state_dict.keys().map(str::to_string).collect(),
        excluded: request.excluded,
    };
    write_json(&output_dir.join(MANIFEST_FILENAME), &manifest)?;

    tracing::info!(
        dir = %output_dir.display(),
        tensors = manifest.tensors.len(),
        excluded = manifest.excluded.len(),
        "model saved"
    );

    Ok(CheckpointDescriptor {
        directory: output_dir.to_path_buf(),
        manifest,
    })
}

/// Newest `checkpoint-<step>` directory under `output_dir`, by step number.
pub fn latest_checkpoint(
    output_dir: &Path,
) -> Result<Option<CheckpointDescriptor>, TrainingError> {
    let Some((_, path)) = checkpoint_directories(output_dir)?.pop() else {
        return Ok(None);
    };
    let manifest = load_manifest(&path)?;
    Ok(Some(CheckpointDescriptor {
        directory: path,
        manifest,
    }))
}

/// Verifies every file against the manifest and loads the weights on CPU.
pub fn load_checkpoint(directory: &Path) -> Result<LoadedCheckpoint, TrainingError> {
    let manifest = load_manifest(directory)?;
    ensure_version_supported(manifest.version)?;

    for record in manifest.files() {
        validate_file(&directory.join(&record.filename), &record.sha256)?;
    }

    let model_path = directory.join(&manifest.model.filename);
    let mut tensors = load_safetensors(&model_path, &Device::Cpu)?;
    let mut state_dict = StateDict::with_capacity(manifest.tensors.len());
    for name in &manifest.tensors {
        let tensor = tensors.remove(name).ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint {} lists tensor {name} but the weights file lacks it",
                directory.display()
            ))
        })?;
        state_dict.insert(name.clone(), tensor);
    }
    if !tensors.is_empty() {
        return Err(TrainingError::runtime(format!(
            "weights file in {} holds tensors missing from the manifest",
            directory.display()
        )));
    }

    Ok(LoadedCheckpoint {
        manifest,
        state_dict,
    })
}

/// Copies `state` into the model's parameters.
///
/// Parameters absent from `state` are accepted only when `filter` would
/// have excluded them at save time; unknown entries are rejected.
pub fn apply_state_dict(
    model: &dyn TrainableModel,
    state: &StateDict,
    filter: &StateDictFilter,
) -> Result<usize, TrainingError> {
    let mut params_by_name: HashMap<_, _> = model.parameters().into_iter().collect();
    let device = model.device().clone();

    let mut applied = 0;
    for (name, tensor) in state.iter() {
        let var = params_by_name.remove(name).ok_or_else(|| {
            TrainingError::runtime(format!("checkpoint contains unknown parameter {name}"))
        })?;
        let desired_dtype = var.as_tensor().dtype();
        let tensor = tensor.to_device(&device)?.to_dtype(desired_dtype)?;
        var.set(&tensor)?;
        applied += 1;
    }

    let mut missing: Vec<_> = params_by_name
        .into_keys()
        .filter(|name| !filter.excludes(name))
        .collect();
    if !missing.is_empty() {
        missing.sort();
        return Err(TrainingError::runtime(format!(
            "checkpoint missing parameters: {}",
            missing.join(", ")
        )));
    }

    Ok(applied)
}

/// Deletes the oldest `checkpoint-<step>` directories beyond `limit`.
pub fn rotate_checkpoints(
    output_dir: &Path,
    limit: Option<usize>,
) -> Result<Vec<PathBuf>, TrainingError> {
    let Some(limit) = limit else {
        return Ok(Vec::new());
    };
    if limit == 0 {
        return Ok(Vec::new());
    }
    let mut dirs = checkpoint_directories(output_dir)?;
    let mut removed = Vec::new();
    while dirs.len() > limit {
        let (_, victim) = dirs.remove(0);
        fs::remove_dir_all(&victim).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to prune checkpoint {}: {err}",
                victim.display()
            ))
        })?;
        tracing::debug!(dir = %victim.display(), "pruned checkpoint");
        removed.push(victim);
    }
    Ok(removed)
}

pub fn checkpoint_dir_name(step: usize) -> String {
    format!("{CHECKPOINT_PREFIX}{step}")
}

/// `checkpoint-<step>` directories sorted by ascending step.
pub fn checkpoint_directories(base: &Path) -> Result<Vec<(usize, PathBuf)>, TrainingError> {
    let mut dirs = Vec::new();
    if !base.exists() {
        return Ok(dirs);
    }
    for entry in fs::read_dir(base).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to read checkpoint directory {}: {err}",
            base.display()
        ))
    })? {
        let entry = entry.map_err(|err| {
            TrainingError::runtime(format!("failed to read checkpoint entry: {err}"))
        })?;
        let file_type = entry.file_type().map_err(|err| {
            TrainingError::runtime(format!(
                "failed to inspect checkpoint entry {}: {err}",
                entry.path().display()
            ))
        })?;
        if !file_type.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let step = name
            .to_str()
            .and_then(|name| name.strip_prefix(CHECKPOINT_PREFIX))
            .and_then(|suffix| suffix.parse::<usize>().ok());
        if let Some(step) = step {
            dirs.push((step, entry.path()));
        }
    }
    dirs.sort();
    Ok(dirs)
}

pub fn load_manifest(directory: &Path) -> Result<CheckpointManifest, TrainingError> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(TrainingError::runtime(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    read_json(&manifest_path)
}

fn fingerprint_config(config: &TrainingConfig) -> Result<String, TrainingError> {
    let json = serde_json::to_vec(config)
        .map_err(|err| TrainingError::runtime(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256: sha,
        bytes,
    })
}

fn ensure_version_supported(version: u32) -> Result<(), TrainingError> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::runtime(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    Ok(())
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(TrainingError::runtime(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data).map_err(|err| {
        TrainingError::runtime(format!("failed to write {}: {err}", path.display()))
    })?;
    file.write_all(b"\n")
        .map_err(|err| TrainingError::runtime(format!("failed to write {}: {err}", path.display())))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Tensor};
    use model::SensorClassifier;

    fn model_config() -> ModelConfig {
        ModelConfig {
            sensor_channels: 2,
            encoder_hidden_dim: 4,
            hidden_dim: 3,
            num_labels: 2,
            dtype: DType::F32,
            device: Device::Cpu,
        }
    }

    fn save_step(dir: &Path, step: usize) -> CheckpointDescriptor {
        let args = TrainingConfig::new(dir);
        let mut state = StateDict::new();
        state.insert(
            "llm.w",
            Tensor::from_slice(&[1f32, 2.0, 3.0], (3,), &Device::Cpu).unwrap(),
        );
        write_model_artifacts(SaveRequest {
            output_dir: &dir.join(checkpoint_dir_name(step)),
            state_dict: &state,
            excluded: vec!["pt_encoder_backbone.w".into()],
            model_config: &model_config(),
            args: &args,
            global_step: step,
        })
        .unwrap()
    }

    #[test]
    fn round_trip_preserves_order_and_exclusions() {
        let tmp = tempfile::tempdir().unwrap();
        let descriptor = save_step(tmp.path(), 3);

        let loaded = load_checkpoint(&descriptor.directory).unwrap();
        assert_eq!(loaded.manifest.excluded, vec!["pt_encoder_backbone.w"]);
        assert_eq!(loaded.manifest.global_step, 3);
        let values = loaded
            .state_dict
            .get("llm.w")
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn tampered_weights_fail_validation() {
        let tmp = tempfile::tempdir().unwrap();
        let descriptor = save_step(tmp.path(), 1);
        let weights = descriptor.directory.join(MODEL_FILENAME);
        let mut bytes = fs::read(&weights).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&weights, bytes).unwrap();

        assert!(load_checkpoint(&descriptor.directory).is_err());
    }

    #[test]
    fn latest_uses_numeric_step_order_and_rotation_keeps_newest() {
        let tmp = tempfile::tempdir().unwrap();
        for step in [2, 10, 9] {
            save_step(tmp.path(), step);
        }
        fs::create_dir(tmp.path().join("checkpoint-final")).unwrap();

        let latest = latest_checkpoint(tmp.path()).unwrap().unwrap();
        assert_eq!(latest.manifest.global_step, 10);

        let removed = rotate_checkpoints(tmp.path(), Some(2)).unwrap();
        assert_eq!(removed, vec![tmp.path().join("checkpoint-2")]);
        let remaining: Vec<_> = checkpoint_directories(tmp.path())
            .unwrap()
            .into_iter()
            .map(|(step, _)| step)
            .collect();
        assert_eq!(remaining, vec![9, 10]);
    }

    #[test]
    fn apply_tolerates_excluded_but_rejects_unknown() {
        let model = SensorClassifier::new(model_config()).unwrap();
        let filter = StateDictFilter::sensor_backbone();
        let saved = filter.apply(model.state_dict().unwrap());

        let target = SensorClassifier::new(model_config()).unwrap();
        assert_eq!(apply_state_dict(&target, &saved, &filter).unwrap(), 4);

        let strict = StateDictFilter::keep_all();
        assert!(apply_state_dict(&target, &saved, &strict).is_err());

        let mut extra = saved.clone();
        extra.insert("llm.unknown", Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap());
        assert!(apply_state_dict(&target, &extra, &filter).is_err());
    }
}
