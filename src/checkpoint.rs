use crate::batch::Batch;
use crate::config::CHECKPOINT_VERSION;
use crate::stats::IngestStats;
use anyhow::{Context, Result};
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

#[derive(Serialize, Deserialize, Clone, Default, Debug, PartialEq, Eq)]
pub struct CheckpointStats {
    pub records_seen: u64,
    pub records_skipped: u64,
    pub entities_committed: u64,
    pub relationships_committed: u64,
    pub flushes: u64,
    pub flush_retries: u64,
}

/// Identity of the dump a checkpoint was taken from.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SourceKey {
    pub path: String,
    /// Seconds since the epoch
    pub mtime: u64,
}

impl SourceKey {
    pub fn of(input_path: &str) -> Result<Self> {
        let mtime = fs::metadata(input_path)
            .and_then(|m| m.modified())
            .with_context(|| format!("Failed to read modification time of {input_path}"))?
            .duration_since(SystemTime::UNIX_EPOCH)
            .context("Modification time before the epoch")?
            .as_secs();
        Ok(Self {
            path: input_path.to_string(),
            mtime,
        })
    }
}

/// Progress through the dump as of the last committed batch.
#[derive(Serialize, Deserialize, Debug)]
pub struct Checkpoint {
    pub version: u32,
    pub source: SourceKey,
    /// Raw records fully accounted for by committed batches
    pub records_through: u64,
    pub batches_committed: u64,
    pub stats: CheckpointStats,
}

impl Checkpoint {
    fn mismatch(&self, key: &SourceKey) -> Option<&'static str> {
        if self.version != CHECKPOINT_VERSION {
            Some("format version")
        } else if self.source.path != key.path {
            Some("input path")
        } else if self.source.mtime != key.mtime {
            Some("input modification time")
        } else {
            None
        }
    }
}

pub fn checkpoint_path(checkpoint_dir: &Path) -> PathBuf {
    checkpoint_dir.join("checkpoint.bin")
}

fn read(path: &Path) -> Option<Checkpoint> {
    let limit = fs::metadata(path).map(|m| m.len()).unwrap_or(0) + 1024;
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) => {
            warn!(error = %e, "Checkpoint file is unreadable");
            return None;
        }
    };
    match bincode::DefaultOptions::new()
        .with_limit(limit)
        .deserialize_from(BufReader::new(file))
    {
        Ok(checkpoint) => Some(checkpoint),
        Err(e) => {
            warn!(error = %e, "Checkpoint file is corrupt");
            None
        }
    }
}

/// Returns `Ok(None)` when there is no checkpoint or it belongs to another input.
pub fn load_if_valid(input_path: &str, checkpoint_dir: &Path) -> Result<Option<Checkpoint>> {
    let path = checkpoint_path(checkpoint_dir);
    if !path.exists() {
        return Ok(None);
    }

    let key = SourceKey::of(input_path)?;
    let Some(checkpoint) = read(&path) else {
        return Ok(None);
    };
    if let Some(what) = checkpoint.mismatch(&key) {
        info!(mismatch = what, "Ignoring checkpoint taken from a different input");
        return Ok(None);
    }

    info!(
        records = checkpoint.records_through,
        entities = checkpoint.stats.entities_committed,
        "Loaded valid checkpoint"
    );
    Ok(Some(checkpoint))
}

pub fn clear(checkpoint_dir: &Path) -> Result<()> {
    let path = checkpoint_path(checkpoint_dir);
    if path.exists() {
        fs::remove_file(&path)
            .with_context(|| format!("Failed to remove checkpoint file: {:?}", path))?;
        info!("Checkpoint cleared");
    }
    Ok(())
}

pub struct CheckpointManager {
    checkpoint_dir: PathBuf,
    source: SourceKey,
}

impl CheckpointManager {
    pub fn new(input_path: &str, checkpoint_dir: &Path) -> Result<Self> {
        Ok(Self {
            checkpoint_dir: checkpoint_dir.to_path_buf(),
            source: SourceKey::of(input_path)?,
        })
    }

    /// Records `batch` as committed.
    ///
    /// Record counters come from the batch itself, since the producer has
    /// usually read further ahead by the time a flush is confirmed.
    pub fn save(&self, batch: &Batch, stats: &IngestStats) -> Result<()> {
        let mut snapshot = stats.to_checkpoint();
        snapshot.records_seen = batch.records_through;
        snapshot.records_skipped = batch.skipped_through;

        let checkpoint = Checkpoint {
            version: CHECKPOINT_VERSION,
            source: self.source.clone(),
            records_through: batch.records_through,
            batches_committed: batch.index + 1,
            stats: snapshot,
        };

        fs::create_dir_all(&self.checkpoint_dir)
            .with_context(|| format!("Failed to create directory: {:?}", self.checkpoint_dir))?;

        // Written aside and renamed over, so a crash never leaves a torn file.
        let target = checkpoint_path(&self.checkpoint_dir);
        let tmp_path = target.with_extension("bin.tmp");
        let mut writer = BufWriter::new(
            File::create(&tmp_path)
                .with_context(|| format!("Failed to create {:?}", tmp_path))?,
        );
        bincode::DefaultOptions::new()
            .serialize_into(&mut writer, &checkpoint)
            .context("Failed to serialize checkpoint")?;
        writer.flush().context("Failed to write checkpoint")?;
        drop(writer);
        fs::rename(&tmp_path, &target)
            .with_context(|| format!("Failed to move checkpoint into place: {:?}", target))?;

        debug!(
            records = checkpoint.records_through,
            batches = checkpoint.batches_committed,
            "Checkpoint saved"
        );
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        clear(&self.checkpoint_dir)
    }
}
