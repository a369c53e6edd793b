use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::{config::HubConfig, TrainingError};

/// Commit message attached to every publication of a saved model.
pub const MODEL_SAVE_COMMIT_MESSAGE: &str = "Model save";
pub const COMMIT_LOG_FILENAME: &str = "commits.jsonl";

/// Destination that receives the files of a saved model.
pub trait HubPublisher: Send + Sync {
    fn publish(&self, folder: &Path, commit_message: &str) -> Result<PublishedCommit, TrainingError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedCommit {
    pub model_id: String,
    pub message: String,
    pub files: Vec<String>,
    pub unix_timestamp: u64,
}

/// Publishes into `<root>/<model_id>/`. Each commit replaces the files of
/// the previous one, so the repository mirrors the latest saved folder, and
/// appends one JSON line to `commits.jsonl`.
#[derive(Debug, Clone)]
pub struct LocalMirrorPublisher {
    root: PathBuf,
    model_id: String,
}

impl LocalMirrorPublisher {
    pub fn new(root: impl Into<PathBuf>, model_id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            model_id: model_id.into(),
        }
    }

    /// `None` unless pushing is enabled and both a model id and a directory are set.
    pub fn from_config(config: &HubConfig) -> Option<Self> {
        if !config.push_to_hub {
            return None;
        }
        let model_id = config.model_id.as_ref()?;
        let root = config.directory.as_ref()?;
        Some(Self::new(root, model_id))
    }

    pub fn repository(&self) -> PathBuf {
        self.root.join(&self.model_id)
    }

    /// Commits recorded so far, oldest first.
    pub fn commits(&self) -> Result<Vec<PublishedCommit>, TrainingError> {
        let path = self.repository().join(COMMIT_LOG_FILENAME);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&path)?;
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|err| {
                    TrainingError::runtime(format!(
                        "corrupt commit log {}: {err}",
                        path.display()
                    ))
                })
            })
            .collect()
    }
}

impl HubPublisher for LocalMirrorPublisher {
    fn publish(&self, folder: &Path, commit_message: &str) -> Result<PublishedCommit, TrainingError> {
        let repository = self.repository();
        fs::create_dir_all(&repository).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create hub repository {}: {err}",
                repository.display()
            ))
        })?;
        remove_previous_files(&repository)?;

        let mut files = Vec::new();
        for entry in fs::read_dir(folder).map_err(|err| {
            TrainingError::runtime(format!("failed to read {}: {err}", folder.display()))
        })? {
            let entry = entry.map_err(|err| {
                TrainingError::runtime(format!("failed to read {}: {err}", folder.display()))
            })?;
            let name = entry.file_name();
            if !entry.path().is_file() || name == COMMIT_LOG_FILENAME {
                continue;
            }
            fs::copy(entry.path(), repository.join(&name)).map_err(|err| {
                TrainingError::runtime(format!(
                    "failed to publish {}: {err}",
                    entry.path().display()
                ))
            })?;
            files.push(name.to_string_lossy().into_owned());
        }
        files.sort();

        let commit = PublishedCommit {
            model_id: self.model_id.clone(),
            message: commit_message.to_string(),
            files,
            unix_timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        let mut line = serde_json::to_string(&commit)?;
        line.push('\n');
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(repository.join(COMMIT_LOG_FILENAME))
            .and_then(|mut log| log.write_all(line.as_bytes()))
            .map_err(|err| TrainingError::runtime(format!("failed to record commit: {err}")))?;

        tracing::info!(
            model_id = %self.model_id,
            files = commit.files.len(),
            message = commit_message,
            "published model"
        );
        Ok(commit)
    }
}

/// Deletes the files of the last commit, keeping the commit log.
fn remove_previous_files(repository: &Path) -> Result<(), TrainingError> {
    let unreadable = |err: std::io::Error| {
        TrainingError::runtime(format!("failed to read {}: {err}", repository.display()))
    };
    for entry in fs::read_dir(repository).map_err(unreadable)? {
        let entry = entry.map_err(unreadable)?;
        if entry.path().is_file() && entry.file_name() != COMMIT_LOG_FILENAME {
            fs::remove_file(entry.path()).map_err(|err| {
                TrainingError::runtime(format!(
                    "failed to remove stale {}: {err}",
                    entry.path().display()
                ))
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_copies_files_and_logs_commit() {
        let tmp = tempfile::tempdir().unwrap();
        let folder = tmp.path().join("out");
        fs::create_dir_all(folder.join("checkpoint-1")).unwrap();
        fs::write(folder.join("model.safetensors"), b"weights").unwrap();
        fs::write(folder.join("config.json"), b"{}").unwrap();

        let publisher = LocalMirrorPublisher::new(tmp.path().join("hub"), "org/sensor");
        publisher.publish(&folder, MODEL_SAVE_COMMIT_MESSAGE).unwrap();
        publisher.publish(&folder, "second").unwrap();

        let repo = publisher.repository();
        assert_eq!(fs::read(repo.join("model.safetensors")).unwrap(), b"weights");
        assert!(!repo.join("checkpoint-1").exists());
        let commits = publisher.commits().unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].message, "Model save");
        assert_eq!(commits[0].files, vec!["config.json", "model.safetensors"]);
    }

    #[test]
    fn republishing_drops_files_missing_from_the_new_folder() {
        let tmp = tempfile::tempdir().unwrap();
        let first = tmp.path().join("first");
        let second = tmp.path().join("second");
        fs::create_dir_all(&first).unwrap();
        fs::create_dir_all(&second).unwrap();
        fs::write(first.join("model.safetensors"), b"old").unwrap();
        fs::write(first.join("training_args.json"), b"{}").unwrap();
        fs::write(second.join("model.safetensors"), b"new").unwrap();

        let publisher = LocalMirrorPublisher::new(tmp.path().join("hub"), "org/sensor");
        publisher.publish(&first, MODEL_SAVE_COMMIT_MESSAGE).unwrap();
        let commit = publisher.publish(&second, MODEL_SAVE_COMMIT_MESSAGE).unwrap();

        let repo = publisher.repository();
        assert_eq!(commit.files, vec!["model.safetensors"]);
        assert_eq!(fs::read(repo.join("model.safetensors")).unwrap(), b"new");
        assert!(!repo.join("training_args.json").exists());
        assert_eq!(publisher.commits().unwrap().len(), 2);
    }

    #[test]
    fn from_config_requires_push_flag() {
        let mut config = HubConfig {
            push_to_hub: false,
            model_id: Some("m".into()),
            directory: Some(PathBuf::from("/tmp/hub")),
        };
        assert!(LocalMirrorPublisher::from_config(&config).is_none());
        config.push_to_hub = true;
        assert!(LocalMirrorPublisher::from_config(&config).is_some());
    }
}
