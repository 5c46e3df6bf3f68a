use std::sync::Arc;

use crate::filter::Filter;
use crate::message::Message;
use crate::queue::Queue;

/// A local queue bound to an address.
#[derive(Debug)]
pub struct Binding {
    queue: Arc<Queue>,
}

impl Binding {
    pub fn new(queue: Arc<Queue>) -> Self {
        Self { queue }
    }

    pub fn address(&self) -> &str {
        self.queue.address()
    }

    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub fn is_durable(&self) -> bool {
        self.queue.is_durable()
    }

    /// No filter matches everything.
    pub fn accepts(&self, message: &Message) -> bool {
        self.queue.filter().map_or(true, |f| f.matches(message))
    }
}

/// A queue on another node bound to an address. Never delivered to
/// locally.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteQueueBinding {
    pub node_id: String,
    pub address: String,
    pub queue_name: String,
    pub filter: Option<Filter>,
}

impl RemoteQueueBinding {
    pub fn new(
        node_id: impl Into<String>,
        address: impl Into<String>,
        queue_name: impl Into<String>,
        filter: Option<Filter>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            address: address.into(),
            queue_name: queue_name.into(),
            filter,
        }
    }
}
