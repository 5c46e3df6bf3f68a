use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use super::bindings_record::{DESTINATION, ID_COUNTER, QUEUE_BINDING};
use super::message_record::{
    ACKNOWLEDGE_REF, ADD_MESSAGE, ADD_REF, LAST_PAGE, PAGE_TRANSACTION,
    SET_SCHEDULED_DELIVERY_TIME, UPDATE_DELIVERY_COUNT,
};
use super::{
    encode_delivery_count, encode_queue_id, encode_scheduled_time, large_message,
    BatchingIdGenerator, LargeMessageWriter, LastPageRecord, LoadedBindings, LoadedMessage,
    LoadedMessages, LoadedReference, PageTransactionInfo, PreparedTransaction, QueueBindingInfo,
    StorageManager,
};
use crate::codec::Reader;
use crate::config::{Configuration, JournalType};
use crate::file::{MappedSequentialFileFactory, NioSequentialFileFactory, SequentialFileFactory};
use crate::journal::{Journal, PreparedTransactionInfo, RecordInfo};
use crate::message::Message;
use crate::transaction::Xid;
use crate::{Error, Result};

/// Storage over a message journal and a bindings journal.
pub struct JournalStorageManager {
    messages: Arc<Journal>,
    bindings: Arc<Journal>,
    ids: BatchingIdGenerator,
    large_messages_directory: PathBuf,
    sync_transactional: bool,
    sync_non_transactional: bool,
    started: AtomicBool,
    /// Destination address to its record id in the bindings journal.
    destinations: Mutex<HashMap<String, u64>>,
    /// Large bodies to remove once their deleting transaction commits.
    pending_large_deletes: Mutex<HashMap<u64, Vec<u64>>>,
}

impl JournalStorageManager {
    /// Build both journals from `config`, creating directories when the
    /// matching create flag is set.
    pub fn new(config: &Configuration) -> Result<Self> {
        let message_files = file_factory(
            config,
            config.journal_directory.clone(),
            config.journal_file_size,
        );
        let binding_files = file_factory(
            config,
            config.bindings_directory.clone(),
            config.bindings_journal_config().file_size,
        );
        Self::with_file_factories(config, message_files, binding_files)
    }

    /// Like `new`, over caller supplied file factories for the message and
    /// bindings journals.
    pub fn with_file_factories(
        config: &Configuration,
        message_files: Arc<dyn SequentialFileFactory>,
        binding_files: Arc<dyn SequentialFileFactory>,
    ) -> Result<Self> {
        message_files.ensure_directory(config.create_journal_dir)?;
        binding_files.ensure_directory(config.create_bindings_dir)?;
        let bindings_config = config.bindings_journal_config();

        let messages = Arc::new(Journal::new(config.journal_config(), message_files)?);
        let bindings = Arc::new(Journal::new(bindings_config, binding_files)?);
        let ids = BatchingIdGenerator::new(config.id_cache_size, Some(Arc::clone(&bindings)));
        Ok(Self {
            messages,
            bindings,
            ids,
            large_messages_directory: config.large_messages_directory.clone(),
            sync_transactional: config.journal_sync_transactional,
            sync_non_transactional: config.journal_sync_non_transactional,
            started: AtomicBool::new(false),
            destinations: Mutex::new(HashMap::new()),
            pending_large_deletes: Mutex::new(HashMap::new()),
        })
    }

    pub fn message_journal(&self) -> &Journal {
        &self.messages
    }

    pub fn bindings_journal(&self) -> &Journal {
        &self.bindings
    }

    fn sync(&self) -> bool {
        self.sync_non_transactional
    }
}

fn file_factory(
    config: &Configuration,
    directory: PathBuf,
    file_size: usize,
) -> Arc<dyn SequentialFileFactory> {
    match config.journal_type {
        JournalType::Nio => Arc::new(NioSequentialFileFactory::new(directory)),
        JournalType::Mapped => Arc::new(MappedSequentialFileFactory::new(directory, file_size)),
    }
}

impl StorageManager for JournalStorageManager {
    fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.bindings.start()?;
        self.messages.start()?;
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.messages.stop()?;
        self.bindings.stop()
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn generate_unique_id(&self) -> Result<u64> {
        self.ids.generate()
    }

    // ========================================================================
    // Non-transactional
    // ========================================================================

    fn store_message(&self, message: &Message) -> Result<()> {
        self.messages
            .append_add_record(message.id(), ADD_MESSAGE, &message.encode(), self.sync())
    }

    fn store_reference(&self, queue_id: u64, message_id: u64) -> Result<()> {
        self.messages.append_update_record(
            message_id,
            ADD_REF,
            &encode_queue_id(queue_id),
            self.sync(),
        )
    }

    fn store_acknowledge(&self, queue_id: u64, message_id: u64) -> Result<()> {
        self.messages.append_update_record(
            message_id,
            ACKNOWLEDGE_REF,
            &encode_queue_id(queue_id),
            self.sync(),
        )
    }

    fn store_delete(&self, message_id: u64) -> Result<()> {
        self.messages.append_delete_record(message_id, self.sync())?;
        large_message::delete_body(&self.large_messages_directory, message_id)
    }

    fn update_delivery_count(&self, queue_id: u64, message_id: u64, count: u32) -> Result<()> {
        self.messages.append_update_record(
            message_id,
            UPDATE_DELIVERY_COUNT,
            &encode_delivery_count(queue_id, count),
            false,
        )
    }

    fn update_scheduled_delivery_time(
        &self,
        queue_id: u64,
        message_id: u64,
        time: u64,
    ) -> Result<()> {
        self.messages.append_update_record(
            message_id,
            SET_SCHEDULED_DELIVERY_TIME,
            &encode_scheduled_time(queue_id, time),
            self.sync(),
        )
    }

    // ========================================================================
    // Transactional
    // ========================================================================

    fn store_message_transactional(&self, tx_id: u64, message: &Message) -> Result<()> {
        self.messages.append_add_record_transactional(
            tx_id,
            message.id(),
            ADD_MESSAGE,
            &message.encode(),
        )
    }

    fn store_reference_transactional(
        &self,
        tx_id: u64,
        queue_id: u64,
        message_id: u64,
    ) -> Result<()> {
        self.messages.append_update_record_transactional(
            tx_id,
            message_id,
            ADD_REF,
            &encode_queue_id(queue_id),
        )
    }

    fn store_acknowledge_transactional(
        &self,
        tx_id: u64,
        queue_id: u64,
        message_id: u64,
    ) -> Result<()> {
        self.messages.append_update_record_transactional(
            tx_id,
            message_id,
            ACKNOWLEDGE_REF,
            &encode_queue_id(queue_id),
        )
    }

    fn store_delete_transactional(&self, tx_id: u64, message_id: u64) -> Result<()> {
        self.messages
            .append_delete_record_transactional(tx_id, message_id)?;
        self.pending_large_deletes
            .lock()
            .map_err(Error::poisoned)?
            .entry(tx_id)
            .or_default()
            .push(message_id);
        Ok(())
    }

    fn store_message_reference_scheduled_transactional(
        &self,
        tx_id: u64,
        queue_id: u64,
        message_id: u64,
        time: u64,
    ) -> Result<()> {
        self.messages.append_update_record_transactional(
            tx_id,
            message_id,
            SET_SCHEDULED_DELIVERY_TIME,
            &encode_scheduled_time(queue_id, time),
        )
    }

    fn store_page_transaction(&self, tx_id: u64, info: &PageTransactionInfo) -> Result<()> {
        self.messages.append_add_record_transactional(
            tx_id,
            info.record_id,
            PAGE_TRANSACTION,
            &info.encode(),
        )
    }

    fn delete_page_transaction(&self, tx_id: u64, record_id: u64) -> Result<()> {
        self.messages
            .append_delete_record_transactional(tx_id, record_id)
    }

    fn store_last_page(&self, tx_id: u64, record: &LastPageRecord) -> Result<()> {
        self.messages.append_add_record_transactional(
            tx_id,
            record.record_id,
            LAST_PAGE,
            &record.encode(),
        )
    }

    fn clear_last_page(&self, record_id: u64) -> Result<()> {
        self.messages.append_delete_record(record_id, self.sync())
    }

    fn prepare(&self, tx_id: u64, xid: &Xid) -> Result<()> {
        self.messages
            .append_prepare_record(tx_id, &xid.encode(), self.sync_transactional)
    }

    fn commit(&self, tx_id: u64) -> Result<()> {
        self.messages
            .append_commit_record(tx_id, self.sync_transactional)?;
        let deletes = self
            .pending_large_deletes
            .lock()
            .map_err(Error::poisoned)?
            .remove(&tx_id);
        for message_id in deletes.into_iter().flatten() {
            large_message::delete_body(&self.large_messages_directory, message_id)?;
        }
        Ok(())
    }

    fn rollback(&self, tx_id: u64) -> Result<()> {
        self.pending_large_deletes
            .lock()
            .map_err(Error::poisoned)?
            .remove(&tx_id);
        self.messages
            .append_rollback_record(tx_id, self.sync_transactional)
    }

    // ========================================================================
    // Bindings
    // ========================================================================

    fn add_queue_binding(&self, binding: &QueueBindingInfo) -> Result<()> {
        self.bindings
            .append_add_record(binding.id, QUEUE_BINDING, &binding.encode(), true)
    }

    fn delete_queue_binding(&self, binding_id: u64) -> Result<()> {
        self.bindings.append_delete_record(binding_id, true)
    }

    fn add_destination(&self, address: &str) -> Result<bool> {
        let mut destinations = self.destinations.lock().map_err(Error::poisoned)?;
        if destinations.contains_key(address) {
            return Ok(false);
        }
        let id = self.ids.generate()?;
        self.bindings
            .append_add_record(id, DESTINATION, address.as_bytes(), true)?;
        destinations.insert(address.to_string(), id);
        Ok(true)
    }

    fn delete_destination(&self, address: &str) -> Result<bool> {
        let mut destinations = self.destinations.lock().map_err(Error::poisoned)?;
        match destinations.remove(address) {
            Some(id) => {
                self.bindings.append_delete_record(id, true)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    fn load_bindings(&self) -> Result<LoadedBindings> {
        let loaded = self.bindings.load()?;
        self.ids.seed(loaded.max_id + 1);

        let mut out = LoadedBindings::default();
        let mut ceilings = Vec::new();
        let mut destinations = self.destinations.lock().map_err(Error::poisoned)?;
        for record in loaded.records {
            match record.user_type {
                QUEUE_BINDING => out
                    .queues
                    .push(QueueBindingInfo::decode(record.id, &record.data)?),
                DESTINATION => {
                    let address = String::from_utf8(record.data)
                        .map_err(|_| Error::Corrupt("destination is not utf-8"))?;
                    destinations.insert(address.clone(), record.id);
                    out.destinations.push(address);
                }
                ID_COUNTER => ceilings.push((record.id, record.data)),
                other => warn!("unknown bindings record type {other} for id {}", record.id),
            }
        }
        drop(destinations);
        self.ids.load_ceilings(&ceilings)?;
        info!(
            "loaded {} queue bindings and {} destinations",
            out.queues.len(),
            out.destinations.len()
        );
        Ok(out)
    }

    fn load_messages(&self) -> Result<LoadedMessages> {
        let loaded = self.messages.load()?;
        self.ids.seed(loaded.max_id + 1);

        let mut out = LoadedMessages::default();
        let mut index: HashMap<u64, usize> = HashMap::new();
        for record in &loaded.records {
            match record.user_type {
                ADD_MESSAGE if !record.is_update => {
                    let message = Message::decode(&record.data)?;
                    index.insert(record.id, out.messages.len());
                    out.messages.push(LoadedMessage {
                        message,
                        references: Vec::new(),
                    });
                }
                PAGE_TRANSACTION => out
                    .page_transactions
                    .push(PageTransactionInfo::decode(record.id, &record.data)?),
                LAST_PAGE => out
                    .last_pages
                    .push(LastPageRecord::decode(record.id, &record.data)?),
                _ => {
                    let Some(&slot) = index.get(&record.id) else {
                        warn!(
                            "record type {} for unknown message {}",
                            record.user_type, record.id
                        );
                        continue;
                    };
                    apply_reference_update(&mut out.messages[slot].references, record)?;
                }
            }
        }

        // Messages whose references are all gone.
        let (live, orphaned): (Vec<LoadedMessage>, Vec<LoadedMessage>) = out
            .messages
            .into_iter()
            .partition(|m| !m.references.is_empty());
        for orphan in &orphaned {
            debug!("deleting message {} with no references", orphan.message.id());
            self.store_delete(orphan.message.id())?;
        }
        out.messages = live;

        for info in loaded.prepared {
            out.prepared.push(prepared_transaction(info)?);
        }
        info!(
            "loaded {} messages, {} page transactions, {} prepared transactions",
            out.messages.len(),
            out.page_transactions.len(),
            out.prepared.len()
        );
        Ok(out)
    }

    // ========================================================================
    // Large messages
    // ========================================================================

    fn create_large_message(&self, mut message: Message) -> Result<LargeMessageWriter> {
        if message.id() == 0 {
            message.set_id(self.generate_unique_id()?);
        }
        LargeMessageWriter::create(&self.large_messages_directory, message)
    }

    fn read_large_message_body(&self, message_id: u64) -> Result<Vec<u8>> {
        large_message::read_body(&self.large_messages_directory, message_id)
    }

    fn delete_large_message(&self, message_id: u64) -> Result<()> {
        large_message::delete_body(&self.large_messages_directory, message_id)
    }
}

fn apply_reference_update(references: &mut Vec<LoadedReference>, record: &RecordInfo) -> Result<()> {
    let mut reader = Reader::new(&record.data);
    let queue_id = reader.u64()?;
    match record.user_type {
        ADD_REF => references.push(LoadedReference::new(queue_id)),
        ACKNOWLEDGE_REF => {
            if let Some(pos) = references.iter().position(|r| r.queue_id == queue_id) {
                references.remove(pos);
            }
        }
        UPDATE_DELIVERY_COUNT => {
            let count = reader.u32()?;
            if let Some(reference) = references.iter_mut().find(|r| r.queue_id == queue_id) {
                reference.delivery_count = count;
            }
        }
        SET_SCHEDULED_DELIVERY_TIME => {
            let time = reader.u64()?;
            if let Some(reference) = references.iter_mut().find(|r| r.queue_id == queue_id) {
                reference.scheduled_delivery_time = time;
            }
        }
        other => warn!("unknown message record type {other} for id {}", record.id),
    }
    Ok(())
}

fn prepared_transaction(info: PreparedTransactionInfo) -> Result<PreparedTransaction> {
    let xid = Xid::decode(&info.extra_data)?;
    let mut prepared = PreparedTransaction {
        tx_id: info.tx_id,
        xid,
        messages: Vec::new(),
        references: Vec::new(),
        acknowledgements: Vec::new(),
        page_transactions: Vec::new(),
    };
    let mut index: HashMap<u64, usize> = HashMap::new();
    for record in info.records {
        match record.user_type {
            ADD_MESSAGE if !record.is_update => {
                index.insert(record.id, prepared.messages.len());
                prepared.messages.push(LoadedMessage {
                    message: Message::decode(&record.data)?,
                    references: Vec::new(),
                });
            }
            PAGE_TRANSACTION => prepared
                .page_transactions
                .push(PageTransactionInfo::decode(record.id, &record.data)?),
            ADD_REF => {
                let queue_id = Reader::new(&record.data).u64()?;
                match index.get(&record.id) {
                    Some(&slot) => prepared.messages[slot]
                        .references
                        .push(LoadedReference::new(queue_id)),
                    None => prepared.references.push((queue_id, record.id)),
                }
            }
            ACKNOWLEDGE_REF => {
                let queue_id = Reader::new(&record.data).u64()?;
                prepared.acknowledgements.push((queue_id, record.id));
            }
            SET_SCHEDULED_DELIVERY_TIME => {
                if let Some(&slot) = index.get(&record.id) {
                    apply_reference_update(&mut prepared.messages[slot].references, &record)?;
                }
            }
            other => warn!(
                "unexpected record type {other} in prepared transaction {}",
                info.tx_id
            ),
        }
    }
    Ok(prepared)
}
