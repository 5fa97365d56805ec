//! Configuration for the report queue.
//!
//! Loaded once at startup from an optional TOML file, then overridden by
//! command-line flags and environment variables. The resulting [`Config`] is
//! immutable and passed by reference to whatever needs it.
//!
//! ```toml
//! node_id = 3
//! persistent_store = "redis://127.0.0.1:6379"
//! remote_stores = ["redis://10.0.0.7:6379"]
//! id_encryption_key = "0123456789abcdef"
//! consumer_group = "report-processor"
//! metrics_addr = "127.0.0.1:8081"
//!
//! [retry]
//! max_attempts = 15
//! backoff_secs = 5
//! read_block_secs = 3600
//!
//! [log]
//! level = "info"
//! format = "console"
//! output = "stderr"
//! ```

use std::io;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::cipher::IdCipher;
use crate::logging::LogConfig;
use crate::pool::RetryPolicy;
use crate::queue::{DEFAULT_CONSUMER_GROUP, DEFAULT_READ_BLOCK, MAX_NODE_ID};

/// Errors that can occur when loading or validating configuration.
///
/// All of these are fatal at startup and never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The ID cipher key is not hex or has the wrong length.
    #[error("invalid ID encryption key: {0}")]
    InvalidKey(String),

    /// The node ID does not fit in the bits reserved for it.
    #[error("node ID out of range: {node_id} > {max}")]
    NodeIdOutOfRange { node_id: u32, max: u32 },

    /// A setting required by the requested operation is absent.
    #[error("missing required setting '{0}'")]
    MissingField(&'static str),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Retry settings for the worker pool, in config-file units.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetrySection {
    /// Entries delivered more than this many times are quarantined after the
    /// next failure.
    pub max_attempts: i64,

    /// Pause after a failed attempt before fetching again.
    pub backoff_secs: u64,

    /// Upper bound on a single blocking read for new entries.
    pub read_block_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        let policy = RetryPolicy::DEFAULT;
        RetrySection {
            max_attempts: policy.max_attempts,
            backoff_secs: policy.backoff.as_secs(),
            read_block_secs: DEFAULT_READ_BLOCK.as_secs(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identifier of this node for report ID allocation.
    pub node_id: u32,

    /// Address of the store this node writes to and reads from.
    pub persistent_store: Option<String>,

    /// Additional stores to consume reports from.
    pub remote_stores: Vec<String>,

    /// Hex-encoded key for obscuring report IDs.
    pub id_encryption_key: Option<String>,

    /// Consumer group (and member) name used on every store.
    pub consumer_group: String,

    /// Address to serve `/metrics` and `/health` on.
    pub metrics_addr: String,

    pub retry: RetrySection,

    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node_id: 1,
            persistent_store: None,
            remote_stores: Vec::new(),
            id_encryption_key: None,
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            metrics_addr: "127.0.0.1:8081".to_string(),
            retry: RetrySection::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Reads and parses a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parses configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Checks the node ID range and, if a key is set, that it is usable.
    ///
    /// Presence of settings only some commands need is checked by the
    /// `require_*` accessors.
    pub fn validate(&self) -> Result<()> {
        if self.node_id > MAX_NODE_ID {
            return Err(ConfigError::NodeIdOutOfRange {
                node_id: self.node_id,
                max: MAX_NODE_ID,
            });
        }
        if let Some(key) = &self.id_encryption_key {
            IdCipher::new(key)?;
        }
        Ok(())
    }

    /// Returns the primary store address or a `MissingField` error.
    pub fn require_store(&self) -> Result<&str> {
        self.persistent_store
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingField("persistent_store"))
    }

    /// Returns the ID cipher key or a `MissingField` error.
    pub fn require_key(&self) -> Result<&str> {
        self.id_encryption_key
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingField("id_encryption_key"))
    }

    /// Every store to consume from: the primary first, then the remotes.
    pub fn all_stores(&self) -> Result<Vec<String>> {
        let mut stores = vec![self.require_store()?.to_string()];
        stores.extend(self.remote_stores.iter().cloned());
        Ok(stores)
    }

    /// Retry policy for the worker pool.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_secs(self.retry.backoff_secs),
        )
    }

    /// Bound on a single blocking read.
    pub fn read_block(&self) -> Duration {
        Duration::from_secs(self.retry.read_block_secs)
    }
}
