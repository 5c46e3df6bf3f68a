use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use crate::message::{Message, MessageHandle};

use super::Queue;

/// Where a reference is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReferenceState {
    Available = 0,
    Scheduled = 1,
    Delivering = 2,
    Acknowledged = 3,
}

impl ReferenceState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ReferenceState::Scheduled,
            2 => ReferenceState::Delivering,
            3 => ReferenceState::Acknowledged,
            _ => ReferenceState::Available,
        }
    }
}

/// A queue's handle on a routed message.
pub struct MessageReference {
    message: MessageHandle,
    queue: Weak<Queue>,
    queue_id: u64,
    durable: bool,
    priority: AtomicU8,
    delivery_count: AtomicU32,
    /// Milliseconds since the epoch; 0 when not scheduled.
    scheduled_delivery_time: AtomicU64,
    state: AtomicU8,
}

impl MessageReference {
    /// Create a reference and count it against the message.
    pub(crate) fn new(message: MessageHandle, queue: &Arc<Queue>) -> Arc<Self> {
        let durable = message.is_durable() && queue.is_durable();
        message.increment_refs(durable);
        let scheduled = message.get_scheduled_delivery_time().unwrap_or(0);
        Arc::new(Self {
            priority: AtomicU8::new(message.get_priority()),
            message,
            queue: Arc::downgrade(queue),
            queue_id: queue.id(),
            durable,
            delivery_count: AtomicU32::new(0),
            scheduled_delivery_time: AtomicU64::new(scheduled),
            state: AtomicU8::new(ReferenceState::Available as u8),
        })
    }

    pub fn message(&self) -> &Message {
        self.message.message()
    }

    pub fn handle(&self) -> &MessageHandle {
        &self.message
    }

    pub fn message_id(&self) -> u64 {
        self.message.id()
    }

    pub fn queue(&self) -> Option<Arc<Queue>> {
        self.queue.upgrade()
    }

    pub fn queue_id(&self) -> u64 {
        self.queue_id
    }

    /// Both the message and its queue are durable.
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Priority within this queue; starts as the message's priority.
    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::SeqCst)
    }

    pub(crate) fn set_priority(&self, priority: u8) {
        self.priority
            .store(priority.min(crate::message::MAX_PRIORITY), Ordering::SeqCst);
    }

    pub fn delivery_count(&self) -> u32 {
        self.delivery_count.load(Ordering::SeqCst)
    }

    pub(crate) fn set_delivery_count(&self, count: u32) {
        self.delivery_count.store(count, Ordering::SeqCst);
    }

    /// Returns the new count.
    pub(crate) fn increment_delivery_count(&self) -> u32 {
        self.delivery_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn scheduled_delivery_time(&self) -> Option<u64> {
        match self.scheduled_delivery_time.load(Ordering::SeqCst) {
            0 => None,
            time => Some(time),
        }
    }

    pub(crate) fn set_scheduled_delivery_time(&self, time: Option<u64>) {
        self.scheduled_delivery_time
            .store(time.unwrap_or(0), Ordering::SeqCst);
    }

    pub fn state(&self) -> ReferenceState {
        ReferenceState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: ReferenceState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

impl fmt::Debug for MessageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageReference")
            .field("message_id", &self.message_id())
            .field("queue_id", &self.queue_id)
            .field("priority", &self.priority())
            .field("delivery_count", &self.delivery_count())
            .field("state", &self.state())
            .finish()
    }
}
