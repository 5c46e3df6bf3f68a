//! Management notifications with bounded-time listener dispatch.
//!
//! # Design
//!
//! - `send` never blocks the caller: notifications go through a channel to
//!   a dispatcher thread
//! - The dispatcher runs each listener call on a fixed pool of worker
//!   threads and waits at most `timeout` for it; a listener that overruns
//!   is abandoned with a warning and the dispatcher moves on
//! - An abandoned call keeps its worker until it returns, so a stuck
//!   listener can occupy at most the pool, never the broker's threads

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};

use crate::message::{PropertyValue, TypedProperties};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationType {
    BindingAdded,
    BindingRemoved,
    ConsumerCreated,
    ConsumerClosed,
    SecurityAuthenticationViolation,
    SecurityPermissionViolation,
    BridgeStarted,
    BridgeStopped,
    BroadcastGroupStarted,
    BroadcastGroupStopped,
}

#[derive(Debug, Clone)]
pub struct Notification {
    kind: NotificationType,
    timestamp: u64,
    properties: TypedProperties,
}

impl Notification {
    pub fn new(kind: NotificationType, timestamp: u64) -> Self {
        Self {
            kind,
            timestamp,
            properties: TypedProperties::new(),
        }
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.put(key, value);
        self
    }

    pub fn kind(&self) -> NotificationType {
        self.kind
    }

    /// Milliseconds since the epoch.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn properties(&self) -> &TypedProperties {
        &self.properties
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(PropertyValue::as_str)
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{}", self.kind, self.timestamp)
    }
}

pub trait NotificationListener: Send + Sync {
    fn on_notification(&self, notification: &Notification);
}

type Job = Box<dyn FnOnce() + Send>;

struct WorkerPool {
    jobs: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn new(size: usize) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(size);
        for n in 0..size.max(1) {
            let rx = Arc::clone(&rx);
            let handle = thread::Builder::new()
                .name(format!("notification-{n}"))
                .spawn(move || loop {
                    let job = match rx.lock() {
                        Ok(rx) => rx.recv(),
                        Err(_) => return,
                    };
                    match job {
                        Ok(job) => job(),
                        Err(_) => return,
                    }
                })?;
            workers.push(handle);
        }
        Ok(Self {
            jobs: Some(tx),
            workers,
        })
    }

    fn submit(&self, job: Job) -> bool {
        self.jobs.as_ref().map_or(false, |jobs| jobs.send(job).is_ok())
    }

    /// Close the job channel. Idle workers exit; abandoned calls finish on
    /// their own.
    fn close(&mut self) {
        self.jobs.take();
        self.workers.retain(|w| !w.is_finished());
    }
}

struct Shared {
    listeners: RwLock<Vec<Arc<dyn NotificationListener>>>,
    timeout: Duration,
    delivered: AtomicU64,
    abandoned: AtomicU64,
}

/// Fans notifications out to listeners off the caller's thread.
pub struct NotificationService {
    shared: Arc<Shared>,
    threads: usize,
    sender: Mutex<Option<Sender<Notification>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl NotificationService {
    pub fn new(timeout: Duration, threads: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                listeners: RwLock::new(Vec::new()),
                timeout,
                delivered: AtomicU64::new(0),
                abandoned: AtomicU64::new(0),
            }),
            threads: threads.max(1),
            sender: Mutex::new(None),
            dispatcher: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (tx, rx) = mpsc::channel();
        let pool = WorkerPool::new(self.threads)?;
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("notification-dispatch".to_string())
            .spawn(move || dispatch(shared, rx, pool))?;
        *self.sender.lock().map_err(Error::poisoned)? = Some(tx);
        *self.dispatcher.lock().map_err(Error::poisoned)? = Some(handle);
        Ok(())
    }

    /// Stop after dispatching what was already sent.
    pub fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.sender.lock().map_err(Error::poisoned)?.take();
        let handle = self.dispatcher.lock().map_err(Error::poisoned)?.take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        Ok(())
    }

    pub fn add_listener(&self, listener: Arc<dyn NotificationListener>) -> Result<()> {
        self.shared
            .listeners
            .write()
            .map_err(Error::poisoned)?
            .push(listener);
        Ok(())
    }

    pub fn remove_listener(&self, listener: &Arc<dyn NotificationListener>) -> Result<bool> {
        let mut listeners = self.shared.listeners.write().map_err(Error::poisoned)?;
        let before = listeners.len();
        listeners.retain(|l| {
            !std::ptr::eq(
                Arc::as_ptr(l) as *const (),
                Arc::as_ptr(listener) as *const (),
            )
        });
        Ok(listeners.len() != before)
    }

    /// Queue `notification` for dispatch. Dropped while the service is not
    /// running.
    pub fn send(&self, notification: Notification) {
        let Ok(sender) = self.sender.lock() else {
            return;
        };
        match sender.as_ref() {
            Some(sender) => {
                if sender.send(notification).is_err() {
                    debug!("notification dispatcher has exited");
                }
            }
            None => debug!("notification service stopped, dropping {notification}"),
        }
    }

    /// Listener calls that completed in time.
    pub fn delivered_count(&self) -> u64 {
        self.shared.delivered.load(Ordering::SeqCst)
    }

    /// Listener calls abandoned after the timeout.
    pub fn abandoned_count(&self) -> u64 {
        self.shared.abandoned.load(Ordering::SeqCst)
    }
}

impl Drop for NotificationService {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn dispatch(shared: Arc<Shared>, notifications: Receiver<Notification>, mut pool: WorkerPool) {
    while let Ok(notification) = notifications.recv() {
        let listeners = match shared.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(_) => break,
        };
        let notification = Arc::new(notification);
        for listener in listeners {
            let (done_tx, done_rx) = mpsc::channel();
            let job_notification = Arc::clone(&notification);
            let submitted = pool.submit(Box::new(move || {
                listener.on_notification(&job_notification);
                let _ = done_tx.send(());
            }));
            if !submitted {
                break;
            }
            match done_rx.recv_timeout(shared.timeout) {
                Ok(()) => {
                    shared.delivered.fetch_add(1, Ordering::SeqCst);
                }
                Err(RecvTimeoutError::Timeout) => {
                    shared.abandoned.fetch_add(1, Ordering::SeqCst);
                    warn!(
                        "notification listener did not handle {notification} within {:?}, abandoning it",
                        shared.timeout
                    );
                }
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("notification listener panicked handling {notification}");
                }
            }
        }
    }
    pool.close();
}
