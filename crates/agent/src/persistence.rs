//! Checkpoints, emergency saves and recovery.
//!
//! A checkpoint is a full-retention summary artifact plus a small JSON
//! backup record pointing at it. Records are written atomically (temp file,
//! fsync, rename) and rotated so only the newest few remain. The emergency
//! path tries a checkpoint first and falls back to dumping the raw history.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::compressor::ContextCompressor;
use crate::error::AgentError;
use crate::session::Session;

pub const BACKUP_VERSION: u32 = 2;
pub const EMERGENCY_DUMP_FILE: &str = "EMERGENCY_RAW_DUMP.json";

const BACKUP_PREFIX: &str = "backup_iter";

/// Metadata describing one checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub backup_version: u32,
    pub timestamp: DateTime<Local>,
    pub iteration: u32,
    pub model: String,
    pub total_messages: usize,
    pub compression_ratio: f64,
    pub kept_recent: usize,
    pub summary_file: PathBuf,
    pub summary_tokens: u64,
    pub recovered_from: Option<PathBuf>,
}

/// A written checkpoint.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub backup_file: PathBuf,
    pub record: BackupRecord,
}

/// How the emergency path ended.
#[derive(Debug)]
pub enum EmergencyOutcome {
    Checkpointed(Checkpoint),
    /// The checkpoint failed; the raw history was dumped instead.
    RawDump { path: PathBuf, error: String },
    /// Nothing could be saved.
    Lost { error: String },
}

/// Write `content` to `path` so readers see either the old file or the
/// whole new one.
pub fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("checkpoint.json");
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

    let result = (|| {
        let mut file = std::fs::File::create(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
        std::fs::rename(&temp_path, path)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&temp_path);
    }
    result
}

/// `backup_iter<NNNNNN>_<YYYYmmdd_HHMMSS>_<model>.json`, where the model
/// part is the last `/`-separated segment of the model name.
pub fn backup_filename(iteration: u32, model: &str, at: DateTime<Local>) -> String {
    let model = model.rsplit('/').next().unwrap_or(model);
    format!(
        "{BACKUP_PREFIX}{iteration:06}_{}_{model}.json",
        at.format("%Y%m%d_%H%M%S")
    )
}

/// Read a recovery artifact, rejecting anything that cannot seed a run.
pub fn load_recovery(path: &Path) -> Result<String, AgentError> {
    if !path.exists() {
        return Err(AgentError::RecoveryNotFound {
            path: path.to_path_buf(),
        });
    }
    if !path.is_file() {
        return Err(AgentError::RecoveryNotAFile {
            path: path.to_path_buf(),
        });
    }
    let text = std::fs::read_to_string(path).map_err(|source| AgentError::RecoveryRead {
        path: path.to_path_buf(),
        source,
    })?;
    if text.trim().is_empty() {
        return Err(AgentError::RecoveryEmpty {
            path: path.to_path_buf(),
        });
    }
    info!(path = %path.display(), chars = text.chars().count(), "Loaded recovery context");
    Ok(text)
}

/// The seed user turn for a recovered run.
pub fn recovered_prompt(text: &str) -> String {
    format!("[RECOVERED CONTEXT]\n{text}\n[END]")
}

pub struct BackupManager {
    dir: PathBuf,
    keep_last: usize,
}

impl BackupManager {
    pub fn new(dir: impl Into<PathBuf>, keep_last: usize) -> Self {
        Self {
            dir: dir.into(),
            keep_last,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot the session and write a backup record for it.
    pub async fn checkpoint(
        &self,
        compressor: &ContextCompressor,
        session: &Session,
    ) -> Result<Checkpoint, AgentError> {
        let snapshot = compressor
            .snapshot(&session.messages, &session.project.artifact_dir())
            .await?;

        let now = Local::now();
        let record = BackupRecord {
            backup_version: BACKUP_VERSION,
            timestamp: now,
            iteration: session.iteration,
            model: session.model.clone(),
            total_messages: session.messages.len(),
            compression_ratio: snapshot.compression_ratio,
            kept_recent: session.messages.len(),
            summary_file: snapshot.summary_file,
            summary_tokens: snapshot.summary_tokens,
            recovered_from: session.recovered_from.clone(),
        };
        let backup_file = self
            .dir
            .join(backup_filename(session.iteration, &session.model, now));
        write_atomic(&backup_file, &serde_json::to_vec_pretty(&record)?)?;
        self.rotate();

        info!(
            iteration = session.iteration,
            backup = %backup_file.display(),
            summary = %record.summary_file.display(),
            ratio = record.compression_ratio,
            "Checkpoint written"
        );
        Ok(Checkpoint {
            backup_file,
            record,
        })
    }

    /// Delete all but the newest `keep_last` backup records by mtime.
    /// Failures are logged and ignored.
    pub fn rotate(&self) {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %self.dir.display(), error = %e, "Skipping backup rotation");
                return;
            }
        };

        let mut backups: Vec<(std::time::SystemTime, PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                name.starts_with(BACKUP_PREFIX) && name.ends_with(".json")
            })
            .filter_map(|entry| {
                let meta = entry.metadata().ok()?;
                if !meta.is_file() {
                    return None;
                }
                Some((meta.modified().ok()?, entry.path()))
            })
            .collect();

        backups.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, old) in backups.into_iter().skip(self.keep_last) {
            match std::fs::remove_file(&old) {
                Ok(()) => debug!(file = %old.display(), "Removed old backup"),
                Err(e) => warn!(file = %old.display(), error = %e, "Could not remove old backup"),
            }
        }
    }

    /// Dump the raw history as JSON.
    pub fn write_emergency_dump(&self, session: &Session) -> Result<PathBuf, AgentError> {
        let path = self.dir.join(EMERGENCY_DUMP_FILE);
        write_atomic(&path, &serde_json::to_vec_pretty(&session.messages)?)?;
        Ok(path)
    }

    /// Save whatever can be saved. Never fails.
    pub async fn emergency(
        &self,
        compressor: &ContextCompressor,
        session: &Session,
        reason: &str,
    ) -> EmergencyOutcome {
        warn!(reason, iteration = session.iteration, "Emergency checkpoint");

        let checkpoint_error = match self.checkpoint(compressor, session).await {
            Ok(checkpoint) => return EmergencyOutcome::Checkpointed(checkpoint),
            Err(e) => e.to_string(),
        };
        error!(error = %checkpoint_error, "Emergency checkpoint failed, dumping raw history");

        match self.write_emergency_dump(session) {
            Ok(path) => EmergencyOutcome::RawDump {
                path,
                error: checkpoint_error,
            },
            Err(e) => {
                error!(error = %e, "Raw history dump failed, context lost");
                EmergencyOutcome::Lost {
                    error: format!("{checkpoint_error}; raw dump failed: {e}"),
                }
            }
        }
    }
}
