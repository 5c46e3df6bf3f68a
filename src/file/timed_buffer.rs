//! Write batching in front of a `SequentialFile`.
//!
//! # Design
//!
//! - Records are appended into an in-memory buffer bounded by `capacity`
//!   and by the bytes left in the current file (`limit`)
//! - A full buffer, a sync request with `flush_on_sync`, or `max_io` pending
//!   callbacks force an immediate flush
//! - A named timer thread parks on a condition variable while the buffer is
//!   empty; otherwise it wakes every `timeout` and flushes when no write
//!   arrived during the last period or a sync is pending
//! - Each flush is one positional write followed by the callbacks in
//!   submission order

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{info, warn};

use crate::file::{IoCallback, SequentialFile};
use crate::{Error, Result};

const RATE_LOG_INTERVAL: Duration = Duration::from_secs(2);

/// Tuning for a `TimedBuffer`.
#[derive(Debug, Clone)]
pub struct TimedBufferConfig {
    /// Maximum buffered bytes.
    pub capacity: usize,
    /// Timer period.
    pub timeout: Duration,
    /// Flush immediately when a sync write is added.
    pub flush_on_sync: bool,
    /// Flush once this many callbacks are pending.
    pub max_io: usize,
    /// Log bytes/flushes per second from the timer thread.
    pub log_rates: bool,
}

impl Default for TimedBufferConfig {
    fn default() -> Self {
        Self {
            capacity: 490 * 1024,
            timeout: Duration::from_micros(3_333),
            flush_on_sync: false,
            max_io: 500,
            log_rates: false,
        }
    }
}

struct BufferState {
    buffer: Vec<u8>,
    limit: usize,
    callbacks: Vec<Arc<dyn IoCallback>>,
    pending_sync: bool,
    sync_requested: bool,
    active: bool,
    file: Option<Box<dyn SequentialFile>>,
    file_size: u64,
    bytes_flushed: u64,
    flushes: u64,
}

struct Shared {
    config: TimedBufferConfig,
    state: Mutex<BufferState>,
    wakeup: Condvar,
    running: AtomicBool,
}

pub struct TimedBuffer {
    shared: Arc<Shared>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl TimedBuffer {
    pub fn new(config: TimedBufferConfig) -> Self {
        let capacity = config.capacity;
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(BufferState {
                    buffer: Vec::with_capacity(capacity),
                    limit: 0,
                    callbacks: Vec::new(),
                    pending_sync: false,
                    sync_requested: false,
                    active: false,
                    file: None,
                    file_size: 0,
                    bytes_flushed: 0,
                    flushes: 0,
                }),
                wakeup: Condvar::new(),
                running: AtomicBool::new(false),
            }),
            timer: Mutex::new(None),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.config.capacity
    }

    /// Start the timer thread.
    pub fn start(&self) -> Result<()> {
        let mut timer = self
            .timer
            .lock()
            .map_err(|_| Error::Corrupt("timed buffer lock poisoned"))?;
        if timer.is_some() {
            return Ok(());
        }
        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("journal-timed-buffer".to_string())
            .spawn(move || timer_loop(shared))?;
        *timer = Some(handle);
        Ok(())
    }

    /// Flush what is buffered and stop the timer thread.
    pub fn stop(&self) -> Result<()> {
        self.flush()?;
        self.shared.running.store(false, Ordering::SeqCst);
        {
            let _guard = self.lock()?;
            self.shared.wakeup.notify_all();
        }
        let handle = self
            .timer
            .lock()
            .map_err(|_| Error::Corrupt("timed buffer lock poisoned"))?
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        Ok(())
    }

    /// Swap the file the buffer writes into, flushing pending bytes into the
    /// old one first. Returns the previous file.
    pub fn set_file(
        &self,
        file: Option<Box<dyn SequentialFile>>,
    ) -> Result<Option<Box<dyn SequentialFile>>> {
        let mut state = self.lock()?;
        flush_locked(&mut state);
        let file_size = match &file {
            Some(f) => f.size()?,
            None => 0,
        };
        let previous = std::mem::replace(&mut state.file, file);
        state.file_size = file_size;
        state.limit = 0;
        Ok(previous)
    }

    /// Check whether `size` more bytes fit in the current file.
    ///
    /// Returns `Ok(false)` when the caller must move to the next file.
    ///
    /// # Errors
    ///
    /// - `Error::PayloadTooLarge`: the record can never fit in the buffer
    pub fn check_size(&self, size: usize) -> Result<bool> {
        if size > self.shared.config.capacity {
            return Err(Error::PayloadTooLarge);
        }
        let mut state = self.lock()?;
        if state.limit == 0 || state.buffer.len() + size > state.limit {
            flush_locked(&mut state);
            let remaining = match &state.file {
                Some(file) => state.file_size.saturating_sub(file.position()),
                None => 0,
            };
            if size as u64 > remaining {
                return Ok(false);
            }
            state.limit = (remaining as usize).min(self.shared.config.capacity);
        }
        Ok(true)
    }

    /// Append bytes previously admitted by `check_size`.
    pub fn add_bytes(
        &self,
        bytes: &[u8],
        sync: bool,
        callback: Option<Arc<dyn IoCallback>>,
    ) -> Result<()> {
        let config = &self.shared.config;
        let mut state = self.lock()?;
        if state.limit == 0 || state.buffer.len() + bytes.len() > state.limit {
            return Err(Error::illegal_state(
                "timed buffer write without a successful size check",
            ));
        }
        if state.buffer.is_empty() {
            self.shared.wakeup.notify_all();
        }
        state.buffer.extend_from_slice(bytes);
        if let Some(callback) = callback {
            state.callbacks.push(callback);
        }
        state.active = true;
        if sync {
            state.sync_requested = true;
            if config.flush_on_sync {
                flush_locked(&mut state);
                return Ok(());
            }
            state.pending_sync = true;
        }
        if state.buffer.len() == state.limit || state.callbacks.len() >= config.max_io {
            flush_locked(&mut state);
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        let mut state = self.lock()?;
        flush_locked(&mut state);
        Ok(())
    }

    /// Bytes waiting in memory.
    pub fn pending_bytes(&self) -> Result<usize> {
        Ok(self.lock()?.buffer.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, BufferState>> {
        self.shared
            .state
            .lock()
            .map_err(|_| Error::Corrupt("timed buffer lock poisoned"))
    }
}

impl Drop for TimedBuffer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn flush_locked(state: &mut BufferState) {
    if state.buffer.is_empty() {
        state.limit = 0;
        return;
    }
    let sync = state.sync_requested;
    let callbacks = std::mem::take(&mut state.callbacks);
    let outcome = match state.file.as_mut() {
        Some(file) => file.write(&state.buffer, sync),
        None => Err(Error::illegal_state("timed buffer has no file")),
    };
    match outcome {
        Ok(()) => {
            state.bytes_flushed += state.buffer.len() as u64;
            state.flushes += 1;
            for callback in &callbacks {
                callback.done();
            }
        }
        Err(err) => {
            let message = err.to_string();
            warn!("journal buffer flush failed: {message}");
            for callback in &callbacks {
                callback.on_error(&message);
            }
        }
    }
    state.buffer.clear();
    state.limit = 0;
    state.pending_sync = false;
    state.sync_requested = false;
}

fn timer_loop(shared: Arc<Shared>) {
    let clock = quanta::Clock::new();
    let mut last_report = clock.now();
    let mut last_bytes = 0u64;
    let mut last_flushes = 0u64;
    loop {
        {
            let Ok(mut state) = shared.state.lock() else {
                return;
            };
            while shared.running.load(Ordering::SeqCst) && state.buffer.is_empty() {
                state = match shared.wakeup.wait(state) {
                    Ok(state) => state,
                    Err(_) => return,
                };
            }
            if !shared.running.load(Ordering::SeqCst) {
                return;
            }
        }

        precise_sleep(shared.config.timeout);

        let Ok(mut state) = shared.state.lock() else {
            return;
        };
        if !state.active || state.pending_sync {
            flush_locked(&mut state);
        }
        state.active = false;

        if shared.config.log_rates {
            let elapsed = clock.now().duration_since(last_report);
            if elapsed >= RATE_LOG_INTERVAL {
                let secs = elapsed.as_secs_f64();
                let bytes = state.bytes_flushed - last_bytes;
                let flushes = state.flushes - last_flushes;
                info!(
                    "journal write rate: {:.0} bytes/s, {:.1} flushes/s",
                    bytes as f64 / secs,
                    flushes as f64 / secs
                );
                last_report = clock.now();
                last_bytes = state.bytes_flushed;
                last_flushes = state.flushes;
            }
        }
    }
}

#[cfg(unix)]
fn precise_sleep(timeout: Duration) {
    let mut request = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };
    let mut remaining = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    loop {
        let rc = unsafe { libc::nanosleep(&request, &mut remaining) };
        if rc == 0 {
            return;
        }
        if std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            return;
        }
        request = remaining;
    }
}

#[cfg(not(unix))]
fn precise_sleep(timeout: Duration) {
    thread::sleep(timeout);
}
