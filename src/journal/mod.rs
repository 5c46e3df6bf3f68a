//! Append-only record journal over a pool of fixed-size files.
//!
//! # Design
//!
//! - Files are created at `file_size`, zero filled, and handed out from a
//!   free pool; a full file rolls to the next one
//! - Every record is framed and checksummed (see `record`); replay stops at
//!   the first torn or stale record of a file
//! - Transactions write their records eagerly and become visible only when
//!   the commit record is replayed; prepared transactions without an outcome
//!   are surfaced to the caller
//! - Files whose data is fully retired are recycled into the pool (or
//!   deleted once the pool holds `min_files`); see `reclaimer`
//! - All appends go through a `TimedBuffer`; a synchronous append blocks
//!   until its bytes are on disk
//!
//! A single mutex orders appends. The buffer's timer thread only takes the
//! buffer lock, which is always acquired after the journal lock.

pub mod reclaimer;
pub mod record;
mod transaction;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};

use crate::file::{
    IoCallback, SequentialFileFactory, TimedBuffer, TimedBufferConfig, WaitCallback,
};
use crate::{Error, Result};

use reclaimer::JournalFile;
use record::{
    decode_tx_summary, encode_record, encode_tx_summary, scan_file, FileHeader, RawRecord,
    RecordType, ScanEnd, FILE_HEADER_SIZE,
};
use transaction::JournalTransaction;

/// Journal tuning.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    pub file_size: usize,
    pub min_files: usize,
    pub file_prefix: String,
    pub file_extension: String,
    pub buffer: TimedBufferConfig,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            file_size: 10 * 1024 * 1024,
            min_files: 2,
            file_prefix: "courier-data".to_string(),
            file_extension: "cjr".to_string(),
            buffer: TimedBufferConfig::default(),
        }
    }
}

/// A live record (or an update to one) recovered by `load`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordInfo {
    pub id: u64,
    pub user_type: u8,
    pub data: Vec<u8>,
    pub is_update: bool,
}

/// A transaction that was prepared but never committed or rolled back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedTransactionInfo {
    pub tx_id: u64,
    /// Caller data written with the prepare record.
    pub extra_data: Vec<u8>,
    pub records: Vec<RecordInfo>,
    pub records_to_delete: Vec<RecordInfo>,
}

/// Result of replaying the journal.
#[derive(Debug, Default)]
pub struct LoadedJournal {
    pub records: Vec<RecordInfo>,
    pub prepared: Vec<PreparedTransactionInfo>,
    /// Highest record or transaction id seen.
    pub max_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Stopped,
    Started,
    Loaded,
}

struct JournalState {
    phase: Phase,
    data_files: Vec<JournalFile>,
    current: Option<JournalFile>,
    free_files: VecDeque<JournalFile>,
    records: HashMap<u64, Vec<u32>>,
    transactions: HashMap<u64, JournalTransaction>,
    next_file_id: u32,
    next_file_seq: u64,
}

impl JournalState {
    fn new() -> Self {
        Self {
            phase: Phase::Stopped,
            data_files: Vec::new(),
            current: None,
            free_files: VecDeque::new(),
            records: HashMap::new(),
            transactions: HashMap::new(),
            next_file_id: 1,
            next_file_seq: 1,
        }
    }

    fn file_mut(&mut self, file_id: u32) -> Option<&mut JournalFile> {
        if let Some(current) = self.current.as_mut() {
            if current.file_id == file_id {
                return Some(current);
            }
        }
        self.data_files.iter_mut().find(|f| f.file_id == file_id)
    }

    fn inc_pos(&mut self, file_id: u32) {
        if let Some(file) = self.file_mut(file_id) {
            file.inc_pos();
        }
    }

    fn inc_neg(&mut self, in_file: u32, against: u32) {
        if let Some(file) = self.file_mut(in_file) {
            file.inc_neg(against);
        }
    }

    fn apply_commit(&mut self, tx: &JournalTransaction, commit_file: u32) {
        for &(file_id, id) in &tx.adds {
            self.inc_pos(file_id);
            self.records.insert(id, vec![file_id]);
        }
        for &(file_id, id) in &tx.updates {
            if let Some(files) = self.records.get_mut(&id) {
                files.push(file_id);
                self.inc_pos(file_id);
            }
        }
        for &(file_id, id) in &tx.deletes {
            if let Some(files) = self.records.remove(&id) {
                for target in files {
                    self.inc_neg(file_id, target);
                }
            }
        }
        self.apply_rollback(tx, commit_file);
    }

    fn apply_rollback(&mut self, tx: &JournalTransaction, outcome_file: u32) {
        for &pending in tx.pending_files() {
            self.inc_neg(outcome_file, pending);
        }
    }

    fn forget(&mut self, tx: &JournalTransaction) {
        for &pending in tx.pending_files() {
            if let Some(file) = self.file_mut(pending) {
                file.dec_pos();
            }
        }
    }

    fn current_id(&self) -> Result<u32> {
        self.current
            .as_ref()
            .map(|f| f.file_id)
            .ok_or(Error::Corrupt("journal has no current file"))
    }
}

/// Live records in replay order, with deletes punched out.
#[derive(Default)]
struct Replayed {
    entries: Vec<Option<RecordInfo>>,
    index: HashMap<u64, Vec<usize>>,
}

impl Replayed {
    fn push(&mut self, info: RecordInfo) {
        self.index.entry(info.id).or_default().push(self.entries.len());
        self.entries.push(Some(info));
    }

    fn remove(&mut self, id: u64) {
        if let Some(slots) = self.index.remove(&id) {
            for slot in slots {
                self.entries[slot] = None;
            }
        }
    }

    fn into_records(self) -> Vec<RecordInfo> {
        self.entries.into_iter().flatten().collect()
    }
}

pub struct Journal {
    config: JournalConfig,
    factory: Arc<dyn SequentialFileFactory>,
    buffer: TimedBuffer,
    state: Mutex<JournalState>,
}

impl Journal {
    pub fn new(config: JournalConfig, factory: Arc<dyn SequentialFileFactory>) -> Result<Self> {
        if config.file_size <= FILE_HEADER_SIZE + record::RECORD_OVERHEAD {
            return Err(Error::Config("journal file size too small".into()));
        }
        if config.min_files < 2 {
            return Err(Error::Config("journal needs at least two files".into()));
        }
        let buffer = TimedBuffer::new(config.buffer.clone());
        Ok(Self {
            config,
            factory,
            buffer,
            state: Mutex::new(JournalState::new()),
        })
    }

    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    pub fn start(&self) -> Result<()> {
        let mut state = self.lock()?;
        if state.phase != Phase::Stopped {
            return Err(Error::illegal_state("journal already started"));
        }
        self.buffer.start()?;
        state.phase = Phase::Started;
        Ok(())
    }

    /// Replay every file, rebuild reclaim accounting and open the current
    /// file for appends.
    pub fn load(&self) -> Result<LoadedJournal> {
        let mut state = self.lock()?;
        match state.phase {
            Phase::Started => {}
            Phase::Stopped => return Err(Error::NotStarted),
            Phase::Loaded => return Err(Error::illegal_state("journal already loaded")),
        }

        let mut scanned = Vec::new();
        let mut free = Vec::new();
        let mut max_file_id = 0u32;
        for name in self.journal_file_names()? {
            let seq = self.parse_seq(&name).unwrap_or(0);
            state.next_file_seq = state.next_file_seq.max(seq + 1);
            let mut file = self.factory.create_file(&name);
            file.open()?;
            let result = scan_file(file.as_mut());
            file.close()?;
            let scan = result?;
            match scan.header {
                Some(header) => {
                    max_file_id = max_file_id.max(header.file_id);
                    if scan.records.is_empty() {
                        free.push(JournalFile::new(name, header.file_id));
                    } else {
                        scanned.push((JournalFile::new(name, header.file_id), scan));
                    }
                }
                None => free.push(JournalFile::new(name, 0)),
            }
        }
        state.next_file_id = max_file_id + 1;
        scanned.sort_by_key(|(file, _)| file.file_id);
        free.sort_by_key(|file| file.file_id);

        let existing: HashSet<u32> = scanned.iter().map(|(f, _)| f.file_id).collect();
        let exists = |id: u32| existing.contains(&id);
        state.data_files = scanned.iter().map(|(f, _)| f.clone()).collect();

        let mut replayed = Replayed::default();
        let mut max_id = 0u64;
        let mut tail = None;
        for (file, scan) in &scanned {
            for rec in &scan.records {
                max_id = max_id.max(rec.id).max(rec.tx_id);
                replay_record(&mut state, &mut replayed, rec, &exists)?;
            }
            tail = Some((file.name.clone(), scan.end_offset, scan.end, scan.size));
        }

        let mut prepared = Vec::new();
        let open: Vec<u64> = state.transactions.keys().copied().collect();
        for tx_id in open {
            let Some(tx) = state.transactions.remove(&tx_id) else {
                continue;
            };
            if tx.prepared && tx.healthy {
                prepared.push(PreparedTransactionInfo {
                    tx_id,
                    extra_data: tx.extra_data.clone(),
                    records: tx.records.clone(),
                    records_to_delete: tx.records_to_delete.clone(),
                });
                state.transactions.insert(tx_id, tx);
            } else {
                warn!("uncommitted transaction {tx_id} discarded during journal load");
                state.forget(&tx);
            }
        }
        prepared.sort_by_key(|p| p.tx_id);

        // The newest data file keeps receiving appends.
        match (tail, state.data_files.pop()) {
            (Some((name, end_offset, end, size)), Some(last)) => {
                let mut file = self.factory.create_file(&name);
                file.open()?;
                if end == ScanEnd::Torn {
                    warn!(
                        "torn record at offset {end_offset} of journal file {name}, truncating"
                    );
                    file.fill(end_offset, size.saturating_sub(end_offset))?;
                }
                file.set_position(end_offset)?;
                if let Some(mut old) = self.buffer.set_file(Some(file))? {
                    old.close()?;
                }
                state.current = Some(last);
            }
            (_, last) => {
                if let Some(last) = last {
                    state.data_files.push(last);
                }
                let next = if free.is_empty() {
                    self.create_file(&mut state)?
                } else {
                    free.remove(0)
                };
                self.open_as_current(&mut state, next)?;
            }
        }
        state.free_files = free.into();
        while state.data_files.len() + state.free_files.len() + 1 < self.config.min_files {
            let file = self.create_file(&mut state)?;
            state.free_files.push_back(file);
        }

        self.check_reclaim(&mut state)?;
        state.phase = Phase::Loaded;
        info!(
            "journal loaded: {} data files, {} free files, {} live records, {} prepared transactions",
            state.data_files.len() + 1,
            state.free_files.len(),
            state.records.len(),
            prepared.len()
        );
        Ok(LoadedJournal {
            records: replayed.into_records(),
            prepared,
            max_id,
        })
    }

    pub fn stop(&self) -> Result<()> {
        let mut state = self.lock()?;
        if state.phase == Phase::Stopped {
            return Ok(());
        }
        self.buffer.stop()?;
        if let Some(mut file) = self.buffer.set_file(None)? {
            file.close()?;
        }
        *state = JournalState::new();
        Ok(())
    }

    // ========================================================================
    // Non-transactional appends
    // ========================================================================

    pub fn append_add_record(&self, id: u64, user_type: u8, data: &[u8], sync: bool) -> Result<()> {
        let waiter = sync.then(|| Arc::new(WaitCallback::new()));
        {
            let mut state = self.lock_loaded()?;
            let file_id = self.append(
                &mut state,
                RecordType::Add,
                0,
                id,
                user_type,
                data,
                sync,
                as_callback(&waiter),
            )?;
            state.inc_pos(file_id);
            state.records.insert(id, vec![file_id]);
        }
        wait(waiter)
    }

    pub fn append_update_record(
        &self,
        id: u64,
        user_type: u8,
        data: &[u8],
        sync: bool,
    ) -> Result<()> {
        let waiter = sync.then(|| Arc::new(WaitCallback::new()));
        {
            let mut state = self.lock_loaded()?;
            if !state.records.contains_key(&id) {
                return Err(Error::IllegalState(format!("cannot update unknown record {id}")));
            }
            let file_id = self.append(
                &mut state,
                RecordType::Update,
                0,
                id,
                user_type,
                data,
                sync,
                as_callback(&waiter),
            )?;
            state.inc_pos(file_id);
            if let Some(files) = state.records.get_mut(&id) {
                files.push(file_id);
            }
        }
        wait(waiter)
    }

    pub fn append_delete_record(&self, id: u64, sync: bool) -> Result<()> {
        let waiter = sync.then(|| Arc::new(WaitCallback::new()));
        {
            let mut state = self.lock_loaded()?;
            if !state.records.contains_key(&id) {
                return Err(Error::IllegalState(format!("cannot delete unknown record {id}")));
            }
            let file_id = self.append(
                &mut state,
                RecordType::Delete,
                0,
                id,
                0,
                &[],
                sync,
                as_callback(&waiter),
            )?;
            if let Some(files) = state.records.remove(&id) {
                for target in files {
                    state.inc_neg(file_id, target);
                }
            }
        }
        wait(waiter)
    }

    // ========================================================================
    // Transactional appends
    // ========================================================================

    pub fn append_add_record_transactional(
        &self,
        tx_id: u64,
        id: u64,
        user_type: u8,
        data: &[u8],
    ) -> Result<()> {
        self.append_tx_data(RecordType::AddTx, tx_id, id, user_type, data)
    }

    pub fn append_update_record_transactional(
        &self,
        tx_id: u64,
        id: u64,
        user_type: u8,
        data: &[u8],
    ) -> Result<()> {
        self.append_tx_data(RecordType::UpdateTx, tx_id, id, user_type, data)
    }

    pub fn append_delete_record_transactional(&self, tx_id: u64, id: u64) -> Result<()> {
        self.append_tx_data(RecordType::DeleteTx, tx_id, id, 0, &[])
    }

    /// Write a prepare record carrying `extra_data` (typically an encoded
    /// xid). The transaction survives restarts until committed or rolled
    /// back.
    pub fn append_prepare_record(&self, tx_id: u64, extra_data: &[u8], sync: bool) -> Result<()> {
        let waiter = sync.then(|| Arc::new(WaitCallback::new()));
        let failure = {
            let mut state = self.lock_loaded()?;
            let mut tx = state
                .transactions
                .remove(&tx_id)
                .unwrap_or_else(|| JournalTransaction::new(tx_id));
            if tx.prepared {
                state.transactions.insert(tx_id, tx);
                return Err(Error::IllegalState(format!(
                    "transaction {tx_id} already prepared"
                )));
            }
            let body = encode_tx_summary(tx.counts(), extra_data);
            let appended = self.append(
                &mut state,
                RecordType::Prepare,
                tx_id,
                0,
                0,
                &body,
                sync,
                as_callback(&waiter),
            );
            let file_id = match appended {
                Ok(file_id) => file_id,
                Err(err) => {
                    state.transactions.insert(tx_id, tx);
                    return Err(err);
                }
            };
            if tx.touch(file_id) {
                state.inc_pos(file_id);
            }
            tx.prepared = true;
            let failure = Arc::clone(&tx.failure);
            state.transactions.insert(tx_id, tx);
            failure
        };
        wait(waiter)?;
        match failure.take() {
            Some(message) => Err(Error::Journal(message)),
            None => Ok(()),
        }
    }

    /// Append the commit record of `tx_id`. If the record, or any earlier
    /// record of the transaction, failed to reach the file, a rollback
    /// record is written in its place and the failure is returned.
    pub fn append_commit_record(&self, tx_id: u64, sync: bool) -> Result<()> {
        let waiter = sync.then(|| Arc::new(WaitCallback::new()));
        let (tx, commit_file) = {
            let mut state = self.lock_loaded()?;
            let tx = state
                .transactions
                .remove(&tx_id)
                .ok_or_else(|| Error::IllegalState(format!("cannot find transaction {tx_id}")))?;
            if let Some(message) = tx.failure.take() {
                let file_id =
                    self.append(&mut state, RecordType::Rollback, tx_id, 0, 0, &[], false, None)?;
                state.apply_rollback(&tx, file_id);
                return Err(Error::Journal(message));
            }
            let body = encode_tx_summary(tx.counts(), &[]);
            let file_id = self.append(
                &mut state,
                RecordType::Commit,
                tx_id,
                0,
                0,
                &body,
                sync,
                as_callback(&waiter),
            )?;
            (tx, file_id)
        };
        let outcome = wait(waiter);
        let mut state = self.lock_loaded()?;
        if let Err(err) = outcome {
            warn!("commit record of transaction {tx_id} was not written: {err}");
            let file_id =
                self.append(&mut state, RecordType::Rollback, tx_id, 0, 0, &[], false, None)?;
            state.apply_rollback(&tx, file_id);
            return Err(err);
        }
        state.apply_commit(&tx, commit_file);
        Ok(())
    }

    /// Append the rollback record of `tx_id`. A rollback that fails to reach
    /// the file leaves the transaction pending so it can be retried.
    pub fn append_rollback_record(&self, tx_id: u64, sync: bool) -> Result<()> {
        let waiter = sync.then(|| Arc::new(WaitCallback::new()));
        let (tx, rollback_file) = {
            let mut state = self.lock_loaded()?;
            let tx = state
                .transactions
                .remove(&tx_id)
                .ok_or_else(|| Error::IllegalState(format!("cannot find transaction {tx_id}")))?;
            let file_id = self.append(
                &mut state,
                RecordType::Rollback,
                tx_id,
                0,
                0,
                &[],
                sync,
                as_callback(&waiter),
            )?;
            (tx, file_id)
        };
        let outcome = wait(waiter);
        let mut state = self.lock_loaded()?;
        if let Err(err) = outcome {
            state.transactions.insert(tx_id, tx);
            return Err(err);
        }
        state.apply_rollback(&tx, rollback_file);
        Ok(())
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Files holding data, the current file included.
    pub fn data_file_count(&self) -> Result<usize> {
        let state = self.lock()?;
        Ok(state.data_files.len() + usize::from(state.current.is_some()))
    }

    pub fn free_file_count(&self) -> Result<usize> {
        Ok(self.lock()?.free_files.len())
    }

    pub fn live_record_count(&self) -> Result<usize> {
        Ok(self.lock()?.records.len())
    }

    pub fn open_transaction_count(&self) -> Result<usize> {
        Ok(self.lock()?.transactions.len())
    }

    /// Names of every journal file in the directory.
    pub fn file_names(&self) -> Result<Vec<String>> {
        self.journal_file_names()
    }

    /// Roll to the next file even if the current one has room.
    pub fn force_move_next_file(&self) -> Result<()> {
        let mut state = self.lock_loaded()?;
        self.move_next_file(&mut state)
    }

    pub fn flush(&self) -> Result<()> {
        self.buffer.flush()
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn lock(&self) -> Result<MutexGuard<'_, JournalState>> {
        self.state
            .lock()
            .map_err(|_| Error::Corrupt("journal lock poisoned"))
    }

    fn lock_loaded(&self) -> Result<MutexGuard<'_, JournalState>> {
        let state = self.lock()?;
        if state.phase != Phase::Loaded {
            return Err(Error::NotStarted);
        }
        Ok(state)
    }

    fn append_tx_data(
        &self,
        record_type: RecordType,
        tx_id: u64,
        id: u64,
        user_type: u8,
        data: &[u8],
    ) -> Result<()> {
        let mut state = self.lock_loaded()?;
        let mut tx = state
            .transactions
            .remove(&tx_id)
            .unwrap_or_else(|| JournalTransaction::new(tx_id));
        if tx.prepared {
            state.transactions.insert(tx_id, tx);
            return Err(Error::IllegalState(format!(
                "transaction {tx_id} is prepared"
            )));
        }
        let callback: Arc<dyn IoCallback> = tx.failure.clone();
        let appended = self.append(
            &mut state,
            record_type,
            tx_id,
            id,
            user_type,
            data,
            false,
            Some(callback),
        );
        let file_id = match appended {
            Ok(file_id) => file_id,
            Err(err) => {
                state.transactions.insert(tx_id, tx);
                return Err(err);
            }
        };
        if tx.touch(file_id) {
            state.inc_pos(file_id);
        }
        tx.count_record(file_id);
        match record_type {
            RecordType::AddTx => tx.adds.push((file_id, id)),
            RecordType::UpdateTx => tx.updates.push((file_id, id)),
            _ => tx.deletes.push((file_id, id)),
        }
        state.transactions.insert(tx_id, tx);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn append(
        &self,
        state: &mut JournalState,
        record_type: RecordType,
        tx_id: u64,
        id: u64,
        user_type: u8,
        body: &[u8],
        sync: bool,
        callback: Option<Arc<dyn IoCallback>>,
    ) -> Result<u32> {
        let size = RawRecord::encoded_len(body.len());
        if size > self.config.file_size - FILE_HEADER_SIZE {
            return Err(Error::PayloadTooLarge);
        }
        if !self.buffer.check_size(size)? {
            self.move_next_file(state)?;
            if !self.buffer.check_size(size)? {
                return Err(Error::PayloadTooLarge);
            }
        }
        let file_id = state.current_id()?;
        let bytes = encode_record(record_type, file_id, tx_id, id, user_type, body);
        self.buffer.add_bytes(&bytes, sync, callback)?;
        Ok(file_id)
    }

    fn move_next_file(&self, state: &mut JournalState) -> Result<()> {
        let current = state
            .current
            .take()
            .ok_or(Error::Corrupt("journal has no current file"))?;
        debug!("journal file {} is full, moving to the next file", current.name);
        state.data_files.push(current);
        let next = match state.free_files.pop_front() {
            Some(file) => file,
            None => self.create_file(state)?,
        };
        self.open_as_current(state, next)?;
        self.check_reclaim(state)
    }

    fn check_reclaim(&self, state: &mut JournalState) -> Result<()> {
        let current = state.current.take();
        let had_current = current.is_some();
        if let Some(current) = current {
            state.data_files.push(current);
        }
        reclaimer::scan(&mut state.data_files);
        if had_current {
            state.current = state.data_files.pop();
        }

        let (reclaimed, kept): (Vec<JournalFile>, Vec<JournalFile>) = std::mem::take(&mut state.data_files)
            .into_iter()
            .partition(JournalFile::can_reclaim);
        state.data_files = kept;
        for mut file in reclaimed {
            let total = state.data_files.len() + state.free_files.len() + 1;
            if total < self.config.min_files {
                let file_id = state.next_file_id;
                state.next_file_id += 1;
                self.write_header(&file.name, file_id)?;
                file.recycle(file_id);
                debug!("journal file {} recycled into the free pool", file.name);
                state.free_files.push_back(file);
            } else {
                debug!("journal file {} reclaimed and deleted", file.name);
                self.factory.delete_file(&file.name)?;
            }
        }
        Ok(())
    }

    fn create_file(&self, state: &mut JournalState) -> Result<JournalFile> {
        let seq = state.next_file_seq;
        state.next_file_seq += 1;
        let name = format!(
            "{}-{:09}.{}",
            self.config.file_prefix, seq, self.config.file_extension
        );
        let mut file = self.factory.create_file(&name);
        file.open()?;
        file.fill(0, self.config.file_size as u64)?;
        file.close()?;
        debug!("journal file {name} created");
        Ok(JournalFile::new(name, 0))
    }

    fn open_as_current(&self, state: &mut JournalState, mut next: JournalFile) -> Result<()> {
        let file_id = state.next_file_id;
        state.next_file_id += 1;
        next.recycle(file_id);
        let mut file = self.factory.create_file(&next.name);
        file.open()?;
        file.set_position(0)?;
        file.write(&FileHeader::new(file_id).to_bytes(), true)?;
        file.set_position(FILE_HEADER_SIZE as u64)?;
        if let Some(mut old) = self.buffer.set_file(Some(file))? {
            old.close()?;
        }
        state.current = Some(next);
        Ok(())
    }

    fn write_header(&self, name: &str, file_id: u32) -> Result<()> {
        let mut file = self.factory.create_file(name);
        file.open()?;
        file.set_position(0)?;
        file.write(&FileHeader::new(file_id).to_bytes(), true)?;
        file.close()
    }

    fn journal_file_names(&self) -> Result<Vec<String>> {
        let prefix = format!("{}-", self.config.file_prefix);
        Ok(self
            .factory
            .list_files(&self.config.file_extension)?
            .into_iter()
            .filter(|name| name.starts_with(&prefix))
            .collect())
    }

    fn parse_seq(&self, name: &str) -> Option<u64> {
        let stem = name
            .strip_prefix(&self.config.file_prefix)?
            .strip_prefix('-')?
            .strip_suffix(&self.config.file_extension)?
            .strip_suffix('.')?;
        stem.parse().ok()
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn as_callback(waiter: &Option<Arc<WaitCallback>>) -> Option<Arc<dyn IoCallback>> {
    waiter.as_ref().map(|w| Arc::clone(w) as Arc<dyn IoCallback>)
}

fn wait(waiter: Option<Arc<WaitCallback>>) -> Result<()> {
    match waiter {
        Some(waiter) => waiter.wait(),
        None => Ok(()),
    }
}

fn replay_record(
    state: &mut JournalState,
    replayed: &mut Replayed,
    rec: &RawRecord,
    exists: &dyn Fn(u32) -> bool,
) -> Result<()> {
    let file_id = rec.file_id;
    match rec.record_type {
        RecordType::Add => {
            state.inc_pos(file_id);
            state.records.insert(rec.id, vec![file_id]);
            replayed.remove(rec.id);
            replayed.push(record_info(rec, false));
        }
        RecordType::Update => {
            if let Some(files) = state.records.get_mut(&rec.id) {
                files.push(file_id);
                state.inc_pos(file_id);
                replayed.push(record_info(rec, true));
            }
        }
        RecordType::Delete => {
            if let Some(files) = state.records.remove(&rec.id) {
                for target in files {
                    state.inc_neg(file_id, target);
                }
                replayed.remove(rec.id);
            }
        }
        RecordType::AddTx | RecordType::UpdateTx | RecordType::DeleteTx => {
            let mut tx = state
                .transactions
                .remove(&rec.tx_id)
                .unwrap_or_else(|| JournalTransaction::new(rec.tx_id));
            if tx.touch(file_id) {
                state.inc_pos(file_id);
            }
            tx.count_record(file_id);
            match rec.record_type {
                RecordType::AddTx => {
                    tx.adds.push((file_id, rec.id));
                    tx.records.push(record_info(rec, false));
                }
                RecordType::UpdateTx => {
                    tx.updates.push((file_id, rec.id));
                    tx.records.push(record_info(rec, true));
                }
                _ => {
                    tx.deletes.push((file_id, rec.id));
                    tx.records_to_delete.push(record_info(rec, false));
                }
            }
            state.transactions.insert(rec.tx_id, tx);
        }
        RecordType::Prepare => {
            let (summary, extra) = decode_tx_summary(&rec.body)?;
            let mut tx = state
                .transactions
                .remove(&rec.tx_id)
                .unwrap_or_else(|| JournalTransaction::new(rec.tx_id));
            if tx.touch(file_id) {
                state.inc_pos(file_id);
            }
            if !tx.matches_summary(&summary, exists) {
                warn!(
                    "prepared transaction {} is missing records, it will be ignored",
                    rec.tx_id
                );
                tx.healthy = false;
            }
            tx.prepared = true;
            tx.extra_data = extra;
            state.transactions.insert(rec.tx_id, tx);
        }
        RecordType::Commit => {
            // Without buffered records the transaction's data was already
            // reclaimed.
            if let Some(tx) = state.transactions.remove(&rec.tx_id) {
                let (summary, _) = decode_tx_summary(&rec.body)?;
                if tx.healthy && tx.matches_summary(&summary, exists) {
                    state.apply_commit(&tx, file_id);
                    for info in &tx.records {
                        if !info.is_update {
                            replayed.remove(info.id);
                            replayed.push(info.clone());
                        } else if state.records.contains_key(&info.id) {
                            replayed.push(info.clone());
                        }
                    }
                    for info in &tx.records_to_delete {
                        replayed.remove(info.id);
                    }
                } else {
                    warn!(
                        "committed transaction {} is missing records, it will be discarded",
                        rec.tx_id
                    );
                    state.apply_rollback(&tx, file_id);
                }
            }
        }
        RecordType::Rollback => {
            if let Some(tx) = state.transactions.remove(&rec.tx_id) {
                state.apply_rollback(&tx, file_id);
            }
        }
    }
    Ok(())
}

fn record_info(rec: &RawRecord, is_update: bool) -> RecordInfo {
    RecordInfo {
        id: rec.id,
        user_type: rec.user_type,
        data: rec.body.clone(),
        is_update,
    }
}
