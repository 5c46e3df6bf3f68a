use std::sync::Arc;

use super::MessageReference;
use crate::Result;

/// Answer to a delivery offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleStatus {
    /// The consumer took the reference.
    Handled,
    /// The consumer cannot take anything right now.
    Busy,
    /// The consumer's filter rejected this reference.
    NoMatch,
}

/// Receives references offered by a queue.
///
/// `handle` runs under the queue lock and must not block or call back into
/// the same queue. A consumer that returns an error is removed from the
/// queue.
pub trait Consumer: Send + Sync {
    fn handle(&self, reference: &Arc<MessageReference>) -> Result<HandleStatus>;
}

pub(crate) fn same_consumer(a: &Arc<dyn Consumer>, b: &Arc<dyn Consumer>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
