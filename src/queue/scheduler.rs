use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::debug;

use crate::clock::Clock;
use crate::{Error, Result};

/// Longest the worker parks before re-reading the clock.
const MAX_PARK: Duration = Duration::from_millis(50);

type Job = Box<dyn FnOnce() + Send>;

struct Task {
    due: u64,
    seq: u64,
    job: Job,
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Task {}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Task {
    // Reversed: the heap pops the earliest task.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.due, other.seq).cmp(&(self.due, self.seq))
    }
}

struct Tasks {
    heap: BinaryHeap<Task>,
    next_seq: u64,
}

struct Shared {
    clock: Arc<dyn Clock>,
    tasks: Mutex<Tasks>,
    wakeup: Condvar,
    running: AtomicBool,
}

/// Runs jobs at wall-clock deadlines (milliseconds since the epoch) on a
/// single thread. Jobs due at the same time run in submission order.
pub struct ScheduledExecutor {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ScheduledExecutor {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(Shared {
                clock,
                tasks: Mutex::new(Tasks {
                    heap: BinaryHeap::new(),
                    next_seq: 0,
                }),
                wakeup: Condvar::new(),
                running: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().map_err(Error::poisoned)?;
        if worker.is_some() {
            return Ok(());
        }
        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("broker-scheduler".to_string())
            .spawn(move || run(shared))?;
        *worker = Some(handle);
        Ok(())
    }

    /// Stop the worker; pending jobs are dropped.
    pub fn stop(&self) -> Result<()> {
        self.shared.running.store(false, Ordering::SeqCst);
        {
            let mut tasks = self.shared.tasks.lock().map_err(Error::poisoned)?;
            tasks.heap.clear();
            self.shared.wakeup.notify_all();
        }
        let handle = self.worker.lock().map_err(Error::poisoned)?.take();
        // A job may drop the last owner of this executor on the worker itself.
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        Ok(())
    }

    pub fn schedule(&self, due_millis: u64, job: impl FnOnce() + Send + 'static) -> Result<()> {
        let mut tasks = self.shared.tasks.lock().map_err(Error::poisoned)?;
        let seq = tasks.next_seq;
        tasks.next_seq += 1;
        tasks.heap.push(Task {
            due: due_millis,
            seq,
            job: Box::new(job),
        });
        self.shared.wakeup.notify_all();
        Ok(())
    }

    pub fn pending(&self) -> Result<usize> {
        Ok(self.shared.tasks.lock().map_err(Error::poisoned)?.heap.len())
    }
}

impl Drop for ScheduledExecutor {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn run(shared: Arc<Shared>) {
    loop {
        let due = {
            let Ok(mut tasks) = shared.tasks.lock() else {
                return;
            };
            loop {
                if !shared.running.load(Ordering::SeqCst) {
                    return;
                }
                let now = shared.clock.now_millis();
                let mut due = Vec::new();
                while tasks.heap.peek().map_or(false, |t| t.due <= now) {
                    if let Some(task) = tasks.heap.pop() {
                        due.push(task.job);
                    }
                }
                if !due.is_empty() {
                    break due;
                }
                let park = tasks
                    .heap
                    .peek()
                    .map(|t| Duration::from_millis(t.due - now).min(MAX_PARK))
                    .unwrap_or(MAX_PARK);
                tasks = match shared.wakeup.wait_timeout(tasks, park) {
                    Ok((guard, _)) => guard,
                    Err(_) => return,
                };
            }
        };
        debug!("running {} scheduled jobs", due.len());
        for job in due {
            job();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use std::sync::mpsc;
    use std::time::Instant;

    #[test]
    fn jobs_run_in_deadline_order() {
        let clock = Arc::new(SystemClock);
        let executor = ScheduledExecutor::new(clock.clone());
        executor.start().unwrap();
        let (tx, rx) = mpsc::channel();
        let now = clock.now_millis();
        for (label, delay) in [("b", 60), ("a", 20), ("c", 100)] {
            let tx = tx.clone();
            executor
                .schedule(now + delay, move || {
                    let _ = tx.send(label);
                })
                .unwrap();
        }
        let started = Instant::now();
        let order: Vec<&str> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert!(started.elapsed() >= Duration::from_millis(90));
        executor.stop().unwrap();
    }

    #[test]
    fn manual_clock_drives_deadlines() {
        let clock = Arc::new(ManualClock::new(1_000));
        let executor = ScheduledExecutor::new(clock.clone());
        executor.start().unwrap();
        let (tx, rx) = mpsc::channel();
        executor
            .schedule(5_000, move || {
                let _ = tx.send(());
            })
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
        clock.advance_millis(4_000);
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(executor.pending().unwrap(), 0);
    }
}
