use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{
    large_message, BatchingIdGenerator, LargeMessageWriter, LastPageRecord, LoadedBindings,
    LoadedMessages, PageTransactionInfo, QueueBindingInfo, StorageManager,
};
use crate::message::Message;
use crate::transaction::Xid;
use crate::Result;

/// Storage for a broker with persistence disabled: every write is a no-op
/// and recovery finds nothing. Large message bodies still go to disk.
pub struct NullStorageManager {
    ids: BatchingIdGenerator,
    large_messages_directory: PathBuf,
    started: AtomicBool,
}

impl NullStorageManager {
    pub fn new(large_messages_directory: impl Into<PathBuf>) -> Self {
        Self {
            ids: BatchingIdGenerator::new(1, None),
            large_messages_directory: large_messages_directory.into(),
            started: AtomicBool::new(false),
        }
    }
}

impl Default for NullStorageManager {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("courier-large-messages"))
    }
}

impl StorageManager for NullStorageManager {
    fn start(&self) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn generate_unique_id(&self) -> Result<u64> {
        self.ids.generate()
    }

    fn store_message(&self, _message: &Message) -> Result<()> {
        Ok(())
    }

    fn store_reference(&self, _queue_id: u64, _message_id: u64) -> Result<()> {
        Ok(())
    }

    fn store_acknowledge(&self, _queue_id: u64, _message_id: u64) -> Result<()> {
        Ok(())
    }

    fn store_delete(&self, message_id: u64) -> Result<()> {
        large_message::delete_body(&self.large_messages_directory, message_id)
    }

    fn update_delivery_count(&self, _queue_id: u64, _message_id: u64, _count: u32) -> Result<()> {
        Ok(())
    }

    fn update_scheduled_delivery_time(
        &self,
        _queue_id: u64,
        _message_id: u64,
        _time: u64,
    ) -> Result<()> {
        Ok(())
    }

    fn store_message_transactional(&self, _tx_id: u64, _message: &Message) -> Result<()> {
        Ok(())
    }

    fn store_reference_transactional(
        &self,
        _tx_id: u64,
        _queue_id: u64,
        _message_id: u64,
    ) -> Result<()> {
        Ok(())
    }

    fn store_acknowledge_transactional(
        &self,
        _tx_id: u64,
        _queue_id: u64,
        _message_id: u64,
    ) -> Result<()> {
        Ok(())
    }

    fn store_delete_transactional(&self, _tx_id: u64, message_id: u64) -> Result<()> {
        large_message::delete_body(&self.large_messages_directory, message_id)
    }

    fn store_message_reference_scheduled_transactional(
        &self,
        _tx_id: u64,
        _queue_id: u64,
        _message_id: u64,
        _time: u64,
    ) -> Result<()> {
        Ok(())
    }

    fn store_page_transaction(&self, _tx_id: u64, _info: &PageTransactionInfo) -> Result<()> {
        Ok(())
    }

    fn delete_page_transaction(&self, _tx_id: u64, _record_id: u64) -> Result<()> {
        Ok(())
    }

    fn store_last_page(&self, _tx_id: u64, _record: &LastPageRecord) -> Result<()> {
        Ok(())
    }

    fn clear_last_page(&self, _record_id: u64) -> Result<()> {
        Ok(())
    }

    fn prepare(&self, _tx_id: u64, _xid: &Xid) -> Result<()> {
        Ok(())
    }

    fn commit(&self, _tx_id: u64) -> Result<()> {
        Ok(())
    }

    fn rollback(&self, _tx_id: u64) -> Result<()> {
        Ok(())
    }

    fn add_queue_binding(&self, _binding: &QueueBindingInfo) -> Result<()> {
        Ok(())
    }

    fn delete_queue_binding(&self, _binding_id: u64) -> Result<()> {
        Ok(())
    }

    fn add_destination(&self, _address: &str) -> Result<bool> {
        Ok(true)
    }

    fn delete_destination(&self, _address: &str) -> Result<bool> {
        Ok(true)
    }

    fn load_bindings(&self) -> Result<LoadedBindings> {
        Ok(LoadedBindings::default())
    }

    fn load_messages(&self) -> Result<LoadedMessages> {
        Ok(LoadedMessages::default())
    }

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
