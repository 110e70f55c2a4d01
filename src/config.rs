use crate::error::IngestError;
use std::path::PathBuf;
use std::time::Duration;

/// Entities per batch submitted to the sink
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Total attempts per batch before the run fails
pub const DEFAULT_MAX_FLUSH_RETRIES: u32 = 3;

pub const DEFAULT_FLUSH_TIMEOUT_SECS: u64 = 60;

/// Longest the input may go without yielding a record
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 300;

/// First retry delay; doubles on each further attempt
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;

pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// Progress update interval (log every N records)
pub const PROGRESS_INTERVAL: u64 = 10_000;

/// Bump when the checkpoint layout changes
pub const CHECKPOINT_VERSION: u32 = 1;

pub const DEFAULT_BOLT_URI: &str = "bolt://localhost:7687";
pub const DEFAULT_NEO4J_USER: &str = "neo4j";

/// Bolt connection pool size
pub const DEFAULT_MAX_CONNECTIONS: usize = 16;

/// Bounded retries when opening the Bolt connection
pub const CONNECT_MAX_RETRIES: u32 = 30;
pub const CONNECT_RETRY_DELAY_SECS: u64 = 2;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub batch_size: usize,
    pub strict_mode: bool,
    pub max_flush_retries: u32,
    pub flush_timeout: Duration,
    pub read_timeout: Duration,
    pub retry_backoff: Duration,
    pub progress_interval: u64,
    /// Stop after this many raw records
    pub limit: Option<u64>,
    pub resume: bool,
    /// Where `checkpoint.bin` lives; `None` disables checkpointing
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            strict_mode: false,
            max_flush_retries: DEFAULT_MAX_FLUSH_RETRIES,
            flush_timeout: Duration::from_secs(DEFAULT_FLUSH_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            progress_interval: PROGRESS_INTERVAL,
            limit: None,
            resume: false,
            checkpoint_dir: None,
        }
    }
}

impl IngestConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.batch_size == 0 {
            return Err(IngestError::Config("batch size must be at least 1".into()));
        }
        if self.max_flush_retries == 0 {
            return Err(IngestError::Config(
                "max flush retries must be at least 1".into(),
            ));
        }
        if self.flush_timeout.is_zero() {
            return Err(IngestError::Config("flush timeout must be non-zero".into()));
        }
        if self.read_timeout.is_zero() {
            return Err(IngestError::Config("read timeout must be non-zero".into()));
        }
        if self.resume && self.checkpoint_dir.is_none() {
            return Err(IngestError::Config(
                "resume requires a checkpoint directory".into(),
            ));
        }
        Ok(())
    }

    /// Delay before attempt `attempt + 1`, given `attempt` failures so far.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.retry_backoff
            .saturating_mul(factor)
            .min(MAX_RETRY_BACKOFF)
    }
}
