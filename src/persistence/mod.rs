//! Storage manager: broker operations expressed as journal records.
//!
//! # Design
//!
//! - Two journals: messages (message bodies, references, acknowledgements,
//!   paging bookkeeping) and bindings (queues, destinations, id ceilings)
//! - A message is one add record; every durable queue holding it appends
//!   an update record, and acknowledgements append another
//! - The message record is deleted once its last durable reference is
//!   acknowledged; replay rebuilds the remaining references per queue
//! - Ids come from a batching generator whose reserved ceiling lives in the
//!   bindings journal, so ids never repeat across restarts
//! - `NullStorageManager` keeps the same surface when persistence is off

mod id_generator;
mod journal_storage;
mod large_message;
mod null_storage;

use crate::codec::{self, Reader};
use crate::message::Message;
use crate::transaction::Xid;
use crate::Result;

pub use id_generator::BatchingIdGenerator;
pub use journal_storage::JournalStorageManager;
pub use large_message::LargeMessageWriter;
pub use null_storage::NullStorageManager;

// ============================================================================
// Record types
// ============================================================================

/// User record types written into the bindings journal.
pub mod bindings_record {
    pub const QUEUE_BINDING: u8 = 21;
    pub const DESTINATION: u8 = 22;
    pub const ID_COUNTER: u8 = 23;
}

/// User record types written into the message journal.
pub mod message_record {
    pub const ADD_MESSAGE: u8 = 30;
    pub const ADD_REF: u8 = 31;
    pub const ACKNOWLEDGE_REF: u8 = 32;
    pub const UPDATE_DELIVERY_COUNT: u8 = 33;
    pub const SET_SCHEDULED_DELIVERY_TIME: u8 = 34;
    pub const PAGE_TRANSACTION: u8 = 35;
    pub const LAST_PAGE: u8 = 36;
}

// ============================================================================
// Persisted shapes
// ============================================================================

/// A durable queue as stored in the bindings journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBindingInfo {
    /// Record id; also the queue's persistence id.
    pub id: u64,
    pub address: String,
    pub queue_name: String,
    pub filter: Option<String>,
}

impl QueueBindingInfo {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        codec::put_str(&mut buf, &self.address);
        codec::put_str(&mut buf, &self.queue_name);
        match &self.filter {
            Some(filter) => {
                codec::put_bool(&mut buf, true);
                codec::put_str(&mut buf, filter);
            }
            None => codec::put_bool(&mut buf, false),
        }
        buf
    }

    pub(crate) fn decode(id: u64, bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let address = reader.string()?;
        let queue_name = reader.string()?;
        let filter = if reader.bool()? {
            Some(reader.string()?)
        } else {
            None
        };
        Ok(Self {
            id,
            address,
            queue_name,
            filter,
        })
    }
}

/// Bindings journal contents after replay.
#[derive(Debug, Default)]
pub struct LoadedBindings {
    pub queues: Vec<QueueBindingInfo>,
    pub destinations: Vec<String>,
}

/// A queue's hold on a recovered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedReference {
    pub queue_id: u64,
    pub delivery_count: u32,
    /// Milliseconds since the epoch; 0 when not scheduled.
    pub scheduled_delivery_time: u64,
}

impl LoadedReference {
    fn new(queue_id: u64) -> Self {
        Self {
            queue_id,
            delivery_count: 0,
            scheduled_delivery_time: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadedMessage {
    pub message: Message,
    pub references: Vec<LoadedReference>,
}

/// Guards messages paged inside a transaction: they may only be depaged
/// once this record is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTransactionInfo {
    pub record_id: u64,
    pub tx_id: u64,
    pub message_count: u32,
}

impl PageTransactionInfo {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12);
        codec::put_u64(&mut buf, self.tx_id);
        codec::put_u32(&mut buf, self.message_count);
        buf
    }

    pub(crate) fn decode(record_id: u64, bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        Ok(Self {
            record_id,
            tx_id: reader.u64()?,
            message_count: reader.u32()?,
        })
    }
}

/// Marks a page whose messages were committed back into queues; the page
/// file must not be depaged again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastPageRecord {
    pub record_id: u64,
    pub address: String,
    pub page_id: u32,
}

impl LastPageRecord {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        codec::put_str(&mut buf, &self.address);
        codec::put_u32(&mut buf, self.page_id);
        buf
    }

    pub(crate) fn decode(record_id: u64, bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        Ok(Self {
            record_id,
            address: reader.string()?,
            page_id: reader.u32()?,
        })
    }
}

/// A transaction recovered in the prepared state.
#[derive(Debug, Clone)]
pub struct PreparedTransaction {
    pub tx_id: u64,
    pub xid: Xid,
    /// Messages first stored by this transaction, with their references.
    pub messages: Vec<LoadedMessage>,
    /// References this transaction added to messages stored earlier,
    /// as `(queue id, message id)`.
    pub references: Vec<(u64, u64)>,
    /// References acknowledged by this transaction, as
    /// `(queue id, message id)`.
    pub acknowledgements: Vec<(u64, u64)>,
    pub page_transactions: Vec<PageTransactionInfo>,
}

/// Message journal contents after replay.
#[derive(Debug, Default)]
pub struct LoadedMessages {
    pub messages: Vec<LoadedMessage>,
    pub page_transactions: Vec<PageTransactionInfo>,
    pub last_pages: Vec<LastPageRecord>,
    pub prepared: Vec<PreparedTransaction>,
}

pub(crate) fn encode_queue_id(queue_id: u64) -> Vec<u8> {
    queue_id.to_le_bytes().to_vec()
}

pub(crate) fn encode_delivery_count(queue_id: u64, count: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12);
    codec::put_u64(&mut buf, queue_id);
    codec::put_u32(&mut buf, count);
    buf
}

pub(crate) fn encode_scheduled_time(queue_id: u64, time: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    codec::put_u64(&mut buf, queue_id);
    codec::put_u64(&mut buf, time);
    buf
}

// ============================================================================
// StorageManager
// ============================================================================

/// Durable operations used by queues, transactions and paging.
///
/// Non-transactional methods honour the configured non-transactional sync
/// flag; `prepare`, `commit` and `rollback` honour the transactional one.
pub trait StorageManager: Send + Sync {
    fn start(&self) -> Result<()>;

    fn stop(&self) -> Result<()>;

    fn is_started(&self) -> bool;

    /// A process-wide unique id that never repeats for this data directory.
    fn generate_unique_id(&self) -> Result<u64>;

    // Non-transactional

    fn store_message(&self, message: &Message) -> Result<()>;

    fn store_reference(&self, queue_id: u64, message_id: u64) -> Result<()>;

    fn store_acknowledge(&self, queue_id: u64, message_id: u64) -> Result<()>;

    fn store_delete(&self, message_id: u64) -> Result<()>;

    fn update_delivery_count(&self, queue_id: u64, message_id: u64, count: u32) -> Result<()>;

    fn update_scheduled_delivery_time(
        &self,
        queue_id: u64,
        message_id: u64,
        time: u64,
    ) -> Result<()>;

    // Transactional

    fn store_message_transactional(&self, tx_id: u64, message: &Message) -> Result<()>;

    fn store_reference_transactional(
        &self,
        tx_id: u64,
        queue_id: u64,
        message_id: u64,
    ) -> Result<()>;

    fn store_acknowledge_transactional(
        &self,
        tx_id: u64,
        queue_id: u64,
        message_id: u64,
    ) -> Result<()>;

    fn store_delete_transactional(&self, tx_id: u64, message_id: u64) -> Result<()>;

    fn store_message_reference_scheduled_transactional(
        &self,
        tx_id: u64,
        queue_id: u64,
        message_id: u64,
        time: u64,
    ) -> Result<()>;

    fn store_page_transaction(&self, tx_id: u64, info: &PageTransactionInfo) -> Result<()>;

    fn delete_page_transaction(&self, tx_id: u64, record_id: u64) -> Result<()>;

    fn store_last_page(&self, tx_id: u64, record: &LastPageRecord) -> Result<()>;

    fn clear_last_page(&self, record_id: u64) -> Result<()>;

    fn prepare(&self, tx_id: u64, xid: &Xid) -> Result<()>;

    fn commit(&self, tx_id: u64) -> Result<()>;

    fn rollback(&self, tx_id: u64) -> Result<()>;

    // Bindings

    fn add_queue_binding(&self, binding: &QueueBindingInfo) -> Result<()>;

    fn delete_queue_binding(&self, binding_id: u64) -> Result<()>;

    /// Returns `false` when the destination was already stored.
    fn add_destination(&self, address: &str) -> Result<bool>;

    /// Returns `false` when the destination was not stored.
    fn delete_destination(&self, address: &str) -> Result<bool>;

    // Recovery

    fn load_bindings(&self) -> Result<LoadedBindings>;

    fn load_messages(&self) -> Result<LoadedMessages>;

    // Large messages

    /// Open a body file for `message`, assigning it an id if it has none.
    fn create_large_message(&self, message: Message) -> Result<LargeMessageWriter>;

    fn read_large_message_body(&self, message_id: u64) -> Result<Vec<u8>>;

    fn delete_large_message(&self, message_id: u64) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_info_decodes_with_and_without_filter() {
        let info = QueueBindingInfo {
            id: 7,
            address: "orders".into(),
            queue_name: "orders.eu".into(),
            filter: Some("region = 'eu'".into()),
        };
        assert_eq!(QueueBindingInfo::decode(7, &info.encode()).unwrap(), info);

        let plain = QueueBindingInfo {
            filter: None,
            ..info
        };
        assert_eq!(QueueBindingInfo::decode(7, &plain.encode()).unwrap(), plain);
    }

    #[test]
    fn truncated_page_transaction_is_corrupt() {
        let info = PageTransactionInfo {
            record_id: 1,
            tx_id: 2,
            message_count: 3,
        };
        let bytes = info.encode();
        assert!(PageTransactionInfo::decode(1, &bytes[..6]).is_err());
    }
}
