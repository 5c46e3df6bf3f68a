//! Broker configuration.
//!
//! Loaded from JSON with `serde`; every field has a default so a config
//! file only needs to name what it changes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::file::TimedBufferConfig;
use crate::journal::JournalConfig;
use crate::settings::AddressSettings;
use crate::{Error, Result};

/// Which `SequentialFile` backend the journal uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalType {
    /// Positional file I/O.
    Nio,
    /// Memory-mapped files.
    Mapped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Write messages and bindings to disk.
    /// Default: true
    pub persistence_enabled: bool,

    pub journal_directory: PathBuf,
    pub bindings_directory: PathBuf,
    pub paging_directory: PathBuf,
    pub large_messages_directory: PathBuf,

    /// Default: true
    pub create_journal_dir: bool,
    /// Default: true
    pub create_bindings_dir: bool,

    /// Default: `Nio`
    pub journal_type: JournalType,

    /// Size of every journal file.
    /// Default: 10 MB
    pub journal_file_size: usize,

    /// Files kept in the pool.
    /// Default: 2
    pub journal_min_files: usize,

    pub journal_file_prefix: String,
    pub journal_file_extension: String,

    /// Wait for disk on commit/prepare/rollback.
    /// Default: true
    pub journal_sync_transactional: bool,

    /// Wait for disk on non-transactional writes.
    /// Default: false
    pub journal_sync_non_transactional: bool,

    /// Pending writes per flush before the buffer is forced out.
    /// Default: 500
    pub journal_max_io: usize,

    /// Default: 490 KB
    pub journal_buffer_size: usize,

    /// Timed buffer period in microseconds.
    /// Default: 3333
    pub journal_buffer_timeout_us: u64,

    /// Default: false
    pub journal_flush_on_sync: bool,

    /// Default: false
    pub journal_log_write_rates: bool,

    /// Reject sends to addresses not added as destinations.
    /// Default: false
    pub require_destinations: bool,

    pub node_id: String,

    /// Ids reserved per persisted ceiling of the id generator.
    /// Default: 10000
    pub id_cache_size: u64,

    /// Bodies above this size are stored as large messages.
    /// Default: 100 KB
    pub large_message_threshold: usize,

    /// Period of the expired-message scan; 0 disables it.
    /// Default: 30000
    pub message_expiry_scan_period_ms: u64,

    /// Time a notification listener may take before it is abandoned.
    /// Default: 5000
    pub notification_timeout_ms: u64,

    /// Default: 2
    pub notification_threads: usize,

    /// Address pattern to settings.
    pub address_settings: BTreeMap<String, AddressSettings>,
}

impl Default for Configuration {
    fn default() -> Self {
        let buffer = TimedBufferConfig::default();
        Self {
            persistence_enabled: true,
            journal_directory: PathBuf::from("data/journal"),
            bindings_directory: PathBuf::from("data/bindings"),
            paging_directory: PathBuf::from("data/paging"),
            large_messages_directory: PathBuf::from("data/large-messages"),
            create_journal_dir: true,
            create_bindings_dir: true,
            journal_type: JournalType::Nio,
            journal_file_size: 10 * 1024 * 1024,
            journal_min_files: 2,
            journal_file_prefix: "courier-data".to_string(),
            journal_file_extension: "cjr".to_string(),
            journal_sync_transactional: true,
            journal_sync_non_transactional: false,
            journal_max_io: buffer.max_io,
            journal_buffer_size: buffer.capacity,
            journal_buffer_timeout_us: buffer.timeout.as_micros() as u64,
            journal_flush_on_sync: false,
            journal_log_write_rates: false,
            require_destinations: false,
            node_id: "node-0".to_string(),
            id_cache_size: 10_000,
            large_message_threshold: 100 * 1024,
            message_expiry_scan_period_ms: 30_000,
            notification_timeout_ms: 5_000,
            notification_threads: 2,
            address_settings: BTreeMap::new(),
        }
    }
}

impl Configuration {
    /// A configuration rooted at `dir`, with every directory beneath it.
    pub fn with_data_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            journal_directory: dir.join("journal"),
            bindings_directory: dir.join("bindings"),
            paging_directory: dir.join("paging"),
            large_messages_directory: dir.join("large-messages"),
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|err| Error::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.journal_min_files < 2 {
            return Err(Error::Config("journal_min_files must be at least 2".into()));
        }
        if self.journal_file_size < 1024 {
            return Err(Error::Config("journal_file_size must be at least 1024".into()));
        }
        if self.journal_buffer_size == 0 || self.journal_buffer_size > self.journal_file_size {
            return Err(Error::Config(
                "journal_buffer_size must be between 1 and journal_file_size".into(),
            ));
        }
        if self.journal_max_io == 0 {
            return Err(Error::Config("journal_max_io must be positive".into()));
        }
        if self.notification_threads == 0 {
            return Err(Error::Config("notification_threads must be positive".into()));
        }
        if self.id_cache_size == 0 {
            return Err(Error::Config("id_cache_size must be positive".into()));
        }
        Ok(())
    }

    pub fn timed_buffer_config(&self) -> TimedBufferConfig {
        TimedBufferConfig {
            capacity: self.journal_buffer_size,
            timeout: Duration::from_micros(self.journal_buffer_timeout_us),
            flush_on_sync: self.journal_flush_on_sync,
            max_io: self.journal_max_io,
            log_rates: self.journal_log_write_rates,
        }
    }

    /// Settings for the message journal.
    pub fn journal_config(&self) -> JournalConfig {
        JournalConfig {
            file_size: self.journal_file_size,
            min_files: self.journal_min_files,
            file_prefix: self.journal_file_prefix.clone(),
            file_extension: self.journal_file_extension.clone(),
            buffer: self.timed_buffer_config(),
        }
    }

    /// Settings for the bindings journal: same shape, smaller files.
    pub fn bindings_journal_config(&self) -> JournalConfig {
        let file_size = (1024 * 1024).min(self.journal_file_size);
        let mut buffer = self.timed_buffer_config();
        buffer.capacity = buffer.capacity.min(file_size);
        JournalConfig {
            file_size,
            min_files: 2,
            file_prefix: "courier-bindings".to_string(),
            file_extension: "bindings".to_string(),
            buffer,
        }
    }
}
