use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::codec::Reader;
use crate::journal::Journal;
use crate::{Error, Result};

use super::bindings_record::ID_COUNTER;

/// Hands out ids from an atomic counter and persists a ceiling `batch` ids
/// ahead before crossing the previous one.
///
/// The record holding the ceiling takes one of the ids itself, so it never
/// collides with a record written by a caller.
pub struct BatchingIdGenerator {
    counter: AtomicU64,
    ceiling: AtomicU64,
    batch: u64,
    journal: Option<Arc<Journal>>,
    /// Record id of the ceiling currently on disk.
    record: Mutex<Option<u64>>,
}

impl BatchingIdGenerator {
    pub fn new(batch: u64, journal: Option<Arc<Journal>>) -> Self {
        Self {
            counter: AtomicU64::new(1),
            ceiling: AtomicU64::new(if journal.is_some() { 0 } else { u64::MAX }),
            batch: batch.max(1),
            journal,
            record: Mutex::new(None),
        }
    }

    /// Never hand out an id below `next`.
    pub fn seed(&self, next: u64) {
        self.counter.fetch_max(next, Ordering::SeqCst);
    }

    /// Adopt ceiling records replayed from the bindings journal. Returns the
    /// highest ceiling; stale records are deleted.
    pub(crate) fn load_ceilings(&self, records: &[(u64, Vec<u8>)]) -> Result<u64> {
        let mut best: Option<(u64, u64)> = None;
        for (record_id, data) in records {
            let ceiling = Reader::new(data).u64()?;
            if best.map_or(true, |(_, c)| ceiling >= c) {
                best = Some((*record_id, ceiling));
            }
        }
        if let Some(journal) = &self.journal {
            for (record_id, _) in records {
                if Some(*record_id) != best.map(|(id, _)| id) {
                    journal.append_delete_record(*record_id, false)?;
                }
            }
        }
        let mut record = self.record.lock().map_err(Error::poisoned)?;
        let ceiling = match best {
            Some((record_id, ceiling)) => {
                *record = Some(record_id);
                ceiling
            }
            None => 0,
        };
        self.seed(ceiling);
        Ok(ceiling)
    }

    pub fn generate(&self) -> Result<u64> {
        loop {
            let id = self.counter.fetch_add(1, Ordering::SeqCst);
            if id < self.ceiling.load(Ordering::SeqCst) {
                return Ok(id);
            }
            let Some(journal) = &self.journal else {
                return Ok(id);
            };
            let mut record = self.record.lock().map_err(Error::poisoned)?;
            if id < self.ceiling.load(Ordering::SeqCst) {
                return Ok(id);
            }
            let ceiling = id.saturating_add(self.batch);
            journal.append_add_record(id, ID_COUNTER, &ceiling.to_le_bytes(), true)?;
            if let Some(old) = record.replace(id) {
                journal.append_delete_record(old, false)?;
            }
            self.ceiling.store(ceiling, Ordering::SeqCst);
            debug!("id ceiling raised to {ceiling}");
        }
    }

    /// The next id `generate` would try.
    pub fn peek(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}
