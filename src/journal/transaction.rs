use std::sync::{Arc, Mutex};

use crate::file::IoCallback;
use crate::journal::RecordInfo;

/// Remembers the first asynchronous write failure of a transaction.
#[derive(Default)]
pub(crate) struct TxFailure {
    message: Mutex<Option<String>>,
}

impl TxFailure {
    pub(crate) fn take(&self) -> Option<String> {
        self.message.lock().ok().and_then(|mut m| m.take())
    }
}

impl IoCallback for TxFailure {
    fn done(&self) {}

    fn on_error(&self, message: &str) {
        if let Ok(mut slot) = self.message.lock() {
            if slot.is_none() {
                *slot = Some(message.to_string());
            }
        }
    }
}

/// Bookkeeping for an open journal transaction.
///
/// Each file the transaction writes into receives one positive when first
/// touched; the commit or rollback record later adds the matching negative.
pub(crate) struct JournalTransaction {
    pub tx_id: u64,
    pending_files: Vec<u32>,
    counts: Vec<(u32, u32)>,
    pub adds: Vec<(u32, u64)>,
    pub updates: Vec<(u32, u64)>,
    pub deletes: Vec<(u32, u64)>,
    pub prepared: bool,
    pub failure: Arc<TxFailure>,
    /// Filled during replay only.
    pub records: Vec<RecordInfo>,
    pub records_to_delete: Vec<RecordInfo>,
    pub extra_data: Vec<u8>,
    pub healthy: bool,
}

impl JournalTransaction {
    pub fn new(tx_id: u64) -> Self {
        Self {
            tx_id,
            pending_files: Vec::new(),
            counts: Vec::new(),
            adds: Vec::new(),
            updates: Vec::new(),
            deletes: Vec::new(),
            prepared: false,
            failure: Arc::new(TxFailure::default()),
            records: Vec::new(),
            records_to_delete: Vec::new(),
            extra_data: Vec::new(),
            healthy: true,
        }
    }

    /// Register `file_id` as holding data for this transaction. Returns true
    /// the first time, when the caller must add the file's positive.
    pub fn touch(&mut self, file_id: u32) -> bool {
        if self.pending_files.contains(&file_id) {
            return false;
        }
        self.pending_files.push(file_id);
        true
    }

    /// Count one data record written into `file_id`.
    pub fn count_record(&mut self, file_id: u32) {
        match self.counts.iter_mut().find(|(f, _)| *f == file_id) {
            Some((_, count)) => *count += 1,
            None => self.counts.push((file_id, 1)),
        }
    }

    pub fn pending_files(&self) -> &[u32] {
        &self.pending_files
    }

    pub fn counts(&self) -> &[(u32, u32)] {
        &self.counts
    }

    pub fn count_in(&self, file_id: u32) -> u32 {
        self.counts
            .iter()
            .find(|(f, _)| *f == file_id)
            .map(|(_, c)| *c)
            .unwrap_or(0)
    }

    /// Check the counts carried by a prepare or commit record against what
    /// replay saw. Files that no longer exist were reclaimed and are skipped.
    pub fn matches_summary(&self, summary: &[(u32, u32)], existing: &dyn Fn(u32) -> bool) -> bool {
        for (file_id, expected) in summary {
            if existing(*file_id) && self.count_in(*file_id) != *expected {
                return false;
            }
        }
        self.counts
            .iter()
            .all(|(file_id, _)| summary.iter().any(|(f, _)| f == file_id))
    }
}
