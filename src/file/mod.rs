//! Sequential file abstraction used by the journal and paging.
//!
//! # Design
//!
//! - `SequentialFile` is a positional, append-mostly file handle
//! - `SequentialFileFactory` owns one directory and names files within it
//! - Two backends: positional `std::fs::File` I/O (`nio`) and `memmap2`
//!   mappings (`mapped`, fixed size)
//! - Completion is reported through `IoCallback`; `WaitCallback` turns a
//!   completion into a blocking wait
//! - `TimedBuffer` batches small writes and flushes them on a timer

mod mapped;
mod nio;
mod timed_buffer;

use std::path::Path;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::{Error, Result};

pub use mapped::{MappedSequentialFile, MappedSequentialFileFactory};
pub use nio::{NioSequentialFile, NioSequentialFileFactory};
pub use timed_buffer::{TimedBuffer, TimedBufferConfig};

/// A file written front to back at an explicit position.
pub trait SequentialFile: Send {
    fn name(&self) -> &str;

    fn open(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Zero `len` bytes starting at `position`, growing the file if needed.
    fn fill(&mut self, position: u64, len: u64) -> Result<()>;

    fn position(&self) -> u64;

    fn set_position(&mut self, position: u64) -> Result<()>;

    /// Write `bytes` at the current position and advance it. With `sync` the
    /// data is on stable storage when this returns.
    fn write(&mut self, bytes: &[u8], sync: bool) -> Result<()>;

    /// Read into `buf` from the current position, returning the bytes read.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn sync(&mut self) -> Result<()>;

    fn size(&self) -> Result<u64>;

    fn close(&mut self) -> Result<()>;
}

/// Creates, lists and deletes files inside a single directory.
pub trait SequentialFileFactory: Send + Sync {
    fn create_file(&self, name: &str) -> Box<dyn SequentialFile>;

    /// File names in the directory ending in `.{extension}`, sorted.
    fn list_files(&self, extension: &str) -> Result<Vec<String>>;

    fn delete_file(&self, name: &str) -> Result<()>;

    fn directory(&self) -> &Path;

    fn ensure_directory(&self, create_if_missing: bool) -> Result<()> {
        let dir = self.directory();
        if dir.is_dir() {
            return Ok(());
        }
        if !create_if_missing {
            return Err(Error::Config(format!(
                "directory {} does not exist",
                dir.display()
            )));
        }
        std::fs::create_dir_all(dir)?;
        Ok(())
    }
}

pub(crate) fn list_with_extension(dir: &Path, extension: &str) -> Result<Vec<String>> {
    let mut names = Vec::new();
    if !dir.is_dir() {
        return Ok(names);
    }
    let suffix = format!(".{extension}");
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if name.ends_with(&suffix) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Completion notification for an asynchronous write.
pub trait IoCallback: Send + Sync {
    fn done(&self);

    fn on_error(&self, message: &str);
}

/// An `IoCallback` that a caller can block on.
#[derive(Default)]
pub struct WaitCallback {
    outcome: Mutex<Option<std::result::Result<(), String>>>,
    cond: Condvar,
}

impl WaitCallback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the write completes, surfacing a write failure as
    /// `Error::Journal`.
    pub fn wait(&self) -> Result<()> {
        let mut guard = self
            .outcome
            .lock()
            .map_err(|_| Error::Corrupt("wait callback lock poisoned"))?;
        while guard.is_none() {
            guard = self
                .cond
                .wait(guard)
                .map_err(|_| Error::Corrupt("wait callback lock poisoned"))?;
        }
        match guard.take() {
            Some(Err(message)) => Err(Error::Journal(message)),
            _ => Ok(()),
        }
    }

    /// Like `wait`, returning `Ok(false)` if nothing completed in time.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let guard = self
            .outcome
            .lock()
            .map_err(|_| Error::Corrupt("wait callback lock poisoned"))?;
        let (mut guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |outcome| outcome.is_none())
            .map_err(|_| Error::Corrupt("wait callback lock poisoned"))?;
        match guard.take() {
            None => Ok(false),
            Some(Ok(())) => Ok(true),
            Some(Err(message)) => Err(Error::Journal(message)),
        }
    }

    fn complete(&self, outcome: std::result::Result<(), String>) {
        if let Ok(mut guard) = self.outcome.lock() {
            *guard = Some(outcome);
            self.cond.notify_all();
        }
    }
}

impl IoCallback for WaitCallback {
    fn done(&self) {
        self.complete(Ok(()));
    }

    fn on_error(&self, message: &str) {
        self.complete(Err(message.to_string()));
    }
}
