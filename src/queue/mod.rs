//! Queue engine: per-queue ordered delivery to consumers.
//!
//! # Design
//!
//! - Available references sit in a `PriorityLinkedList`, highest priority
//!   first and FIFO within a priority
//! - References scheduled for the future wait in a separate heap; when due
//!   they are put at the *front* of their priority band so a backlog cannot
//!   strand them
//! - Every add, promotion, cancellation and new consumer runs the delivery
//!   loop: the head-most reference is offered to consumers in the order
//!   chosen by the queue's `Distributor`; `Busy` from every consumer stops
//!   the loop, `NoMatch` skips to the next reference
//! - A handled reference leaves the deliverable set and counts as
//!   delivering until it is acknowledged or cancelled
//! - Cancelled references come back at the front with their delivery count
//!   incremented; past the address's max delivery attempts they go to the
//!   dead-letter address instead
//!
//! Consumers are offered references under the queue lock. Storage writes,
//! routing of dead-letter and expiry copies and notifications happen after
//! the lock is released.

mod consumer;
mod distributor;
mod priority_list;
mod reference;
mod scheduler;

use std::collections::BinaryHeap;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::filter::Filter;
use crate::message::{Message, MAX_PRIORITY};
use crate::notification::{Notification, NotificationType};
use crate::server::ServerContext;
use crate::settings::AddressSettings;
use crate::transaction::Transaction;
use crate::{Error, Result};

pub use consumer::{Consumer, HandleStatus};
pub use distributor::{Distribution, Distributor, DistributorFactory, DistributorRegistry};
pub use priority_list::{PriorityLinkedList, Scan};
pub use reference::{MessageReference, ReferenceState};
pub use scheduler::ScheduledExecutor;

use consumer::same_consumer;

/// Identity and routing attributes of a queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Persistence id (the binding record id for durable queues).
    pub id: u64,
    pub name: String,
    pub address: String,
    pub filter: Option<Filter>,
    pub durable: bool,
    pub temporary: bool,
}

struct ScheduledRef {
    time: u64,
    seq: u64,
    reference: Arc<MessageReference>,
}

impl PartialEq for ScheduledRef {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for ScheduledRef {}

impl PartialOrd for ScheduledRef {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledRef {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.time, other.seq).cmp(&(self.time, self.seq))
    }
}

struct QueueInner {
    messages: PriorityLinkedList<Arc<MessageReference>>,
    scheduled: BinaryHeap<ScheduledRef>,
    next_seq: u64,
    consumers: Vec<Arc<dyn Consumer>>,
    pos: usize,
}

impl QueueInner {
    fn push_scheduled(&mut self, time: u64, reference: Arc<MessageReference>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.scheduled.push(ScheduledRef {
            time,
            seq,
            reference,
        });
    }

    /// Remove the first available or scheduled reference for `message_id`.
    fn take(&mut self, message_id: u64) -> Option<Arc<MessageReference>> {
        if let Some(found) = self.messages.remove_where(|r| r.message_id() == message_id) {
            return Some(found);
        }
        let entries = std::mem::take(&mut self.scheduled).into_vec();
        let mut found = None;
        for entry in entries {
            if found.is_none() && entry.reference.message_id() == message_id {
                found = Some(entry.reference);
            } else {
                self.scheduled.push(entry);
            }
        }
        found
    }

    /// Remove every reference matching `pred`, available ones first.
    fn take_matching(
        &mut self,
        mut pred: impl FnMut(&MessageReference) -> bool,
    ) -> Vec<Arc<MessageReference>> {
        let mut taken = Vec::new();
        self.messages.scan(|r| {
            if pred(r) {
                taken.push(Arc::clone(r));
                Scan::Remove
            } else {
                Scan::Keep
            }
        });
        let mut entries = std::mem::take(&mut self.scheduled).into_sorted_vec();
        entries.reverse();
        for entry in entries {
            if pred(&entry.reference) {
                taken.push(entry.reference);
            } else {
                self.scheduled.push(entry);
            }
        }
        taken
    }
}

pub struct Queue {
    id: u64,
    name: String,
    address: String,
    filter: Option<Filter>,
    durable: bool,
    temporary: bool,
    distributor: Arc<dyn Distributor>,
    context: Weak<ServerContext>,
    me: Weak<Queue>,
    inner: Mutex<QueueInner>,
    delivering: AtomicUsize,
    size_bytes: AtomicI64,
    messages_added: AtomicU64,
}

impl Queue {
    pub fn new(
        config: QueueConfig,
        distributor: Arc<dyn Distributor>,
        context: Weak<ServerContext>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id: config.id,
            name: config.name,
            address: config.address,
            filter: config.filter,
            durable: config.durable,
            temporary: config.temporary,
            distributor,
            context,
            me: me.clone(),
            inner: Mutex::new(QueueInner {
                messages: PriorityLinkedList::new(usize::from(MAX_PRIORITY) + 1),
                scheduled: BinaryHeap::new(),
                next_seq: 0,
                consumers: Vec::new(),
                pos: 0,
            }),
            delivering: AtomicUsize::new(0),
            size_bytes: AtomicI64::new(0),
            messages_added: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    // ========================================================================
    // Enqueue and delivery
    // ========================================================================

    /// Enqueue at the back of the reference's priority band.
    pub fn add_last(&self, reference: Arc<MessageReference>) -> Result<()> {
        self.messages_added.fetch_add(1, Ordering::SeqCst);
        self.size_bytes
            .fetch_add(reference.message().encode_size() as i64, Ordering::SeqCst);
        self.enqueue(vec![reference], false)
    }

    /// Enqueue at the front of the reference's priority band.
    pub fn add_first(&self, reference: Arc<MessageReference>) -> Result<()> {
        self.enqueue(vec![reference], true)
    }

    /// Put references back at the front, keeping their relative order.
    pub fn add_list_first(&self, references: Vec<Arc<MessageReference>>) -> Result<()> {
        self.enqueue(references, true)
    }

    fn enqueue(&self, references: Vec<Arc<MessageReference>>, first: bool) -> Result<()> {
        let now = self.now();
        let mut promotions = Vec::new();
        let expired = {
            let mut inner = self.lock()?;
            let ordered: Box<dyn Iterator<Item = Arc<MessageReference>>> = if first {
                Box::new(references.into_iter().rev())
            } else {
                Box::new(references.into_iter())
            };
            for reference in ordered {
                match reference.scheduled_delivery_time() {
                    Some(time) if time > now => {
                        reference.set_state(ReferenceState::Scheduled);
                        inner.push_scheduled(time, reference);
                        promotions.push(time);
                    }
                    _ => {
                        reference.set_state(ReferenceState::Available);
                        let priority = reference.priority();
                        if first {
                            inner.messages.add_first(reference, priority);
                        } else {
                            inner.messages.add_last(reference, priority);
                        }
                    }
                }
            }
            self.deliver_locked(&mut inner, now)
        };
        for time in promotions {
            self.schedule_promotion(time)?;
        }
        self.expire_all(expired)
    }

    fn schedule_promotion(&self, time: u64) -> Result<()> {
        let Some(context) = self.context.upgrade() else {
            return Ok(());
        };
        let me = self.me.clone();
        context.scheduler().schedule(time, move || {
            if let Some(queue) = me.upgrade() {
                if let Err(err) = queue.promote_due() {
                    warn!("scheduled delivery on queue {} failed: {err}", queue.name);
                }
            }
        })
    }

    /// Move scheduled references whose time has come to the front of their
    /// priority band, then deliver. Returns how many were promoted.
    pub fn promote_due(&self) -> Result<usize> {
        let now = self.now();
        let (promoted, expired) = {
            let mut inner = self.lock()?;
            let mut promoted = 0;
            while inner.scheduled.peek().map_or(false, |s| s.time <= now) {
                if let Some(entry) = inner.scheduled.pop() {
                    let reference = entry.reference;
                    reference.set_state(ReferenceState::Available);
                    reference.set_scheduled_delivery_time(None);
                    let priority = reference.priority();
                    inner.messages.add_first(reference, priority);
                    promoted += 1;
                }
            }
            (promoted, self.deliver_locked(&mut inner, now))
        };
        if promoted > 0 {
            debug!("queue {} promoted {promoted} scheduled references", self.name);
        }
        self.expire_all(expired)?;
        Ok(promoted)
    }

    /// Run the delivery loop.
    pub fn deliver_now(&self) -> Result<()> {
        let now = self.now();
        let expired = {
            let mut inner = self.lock()?;
            self.deliver_locked(&mut inner, now)
        };
        self.expire_all(expired)
    }

    /// Offer available references in order. Returns the expired references
    /// it pulled out on the way.
    fn deliver_locked(&self, inner: &mut QueueInner, now: u64) -> Vec<Arc<MessageReference>> {
        let mut expired = Vec::new();
        let QueueInner {
            messages,
            consumers,
            pos,
            ..
        } = inner;
        if consumers.is_empty() {
            return expired;
        }
        messages.scan(|reference| {
            if reference.message().is_expired(now) {
                expired.push(Arc::clone(reference));
                return Scan::Remove;
            }
            if consumers.is_empty() {
                return Scan::Stop;
            }
            match self.offer(&mut *consumers, &mut *pos, reference) {
                HandleStatus::Handled => {
                    reference.set_state(ReferenceState::Delivering);
                    self.delivering.fetch_add(1, Ordering::SeqCst);
                    Scan::Remove
                }
                HandleStatus::Busy => Scan::Stop,
                HandleStatus::NoMatch => Scan::Keep,
            }
        });
        expired
    }

    fn offer(
        &self,
        consumers: &mut Vec<Arc<dyn Consumer>>,
        pos: &mut usize,
        reference: &Arc<MessageReference>,
    ) -> HandleStatus {
        if *pos >= consumers.len() {
            *pos = 0;
        }
        let start = *pos;
        let mut rejected = false;
        loop {
            let consumer = Arc::clone(&consumers[*pos]);
            let current = *pos;
            *pos = self.distributor.select(consumers.len(), *pos);
            match consumer.handle(reference) {
                Ok(HandleStatus::Handled) => return HandleStatus::Handled,
                Ok(HandleStatus::NoMatch) => rejected = true,
                Ok(HandleStatus::Busy) => {}
                Err(err) => {
                    warn!(
                        "removing consumer from queue {} after it failed to handle message {}: {err}",
                        self.name,
                        reference.message_id()
                    );
                    consumers.remove(current);
                    if *pos > current {
                        *pos -= 1;
                    }
                    if *pos >= consumers.len() {
                        *pos = 0;
                    }
                    return HandleStatus::Busy;
                }
            }
            if *pos == start {
                return if rejected {
                    HandleStatus::NoMatch
                } else {
                    HandleStatus::Busy
                };
            }
        }
    }

    // ========================================================================
    // Consumers
    // ========================================================================

    pub fn add_consumer(&self, consumer: Arc<dyn Consumer>) -> Result<()> {
        self.lock()?.consumers.push(consumer);
        self.notify(NotificationType::ConsumerCreated);
        self.deliver_now()
    }

    pub fn remove_consumer(&self, consumer: &Arc<dyn Consumer>) -> Result<bool> {
        let removed = {
            let mut inner = self.lock()?;
            let before = inner.consumers.len();
            inner.consumers.retain(|c| !same_consumer(c, consumer));
            if inner.pos >= inner.consumers.len() {
                inner.pos = 0;
            }
            inner.consumers.len() != before
        };
        if removed {
            self.notify(NotificationType::ConsumerClosed);
        }
        Ok(removed)
    }

    pub fn consumer_count(&self) -> Result<usize> {
        Ok(self.lock()?.consumers.len())
    }

    /// Take the head-most available reference without offering it.
    pub fn remove_first(&self) -> Result<Option<Arc<MessageReference>>> {
        Ok(self.lock()?.messages.remove_first())
    }

    // ========================================================================
    // Acknowledgement and cancellation
    // ========================================================================

    /// Acknowledge a delivered reference outside any transaction.
    pub fn acknowledge(&self, reference: &Arc<MessageReference>) -> Result<()> {
        if reference.is_durable() {
            let context = self.context()?;
            let storage = context.storage();
            storage.store_acknowledge(self.id, reference.message_id())?;
            if reference.handle().durable_ref_count() <= 1 {
                storage.store_delete(reference.message_id())?;
            }
        }
        self.reference_acknowledged(reference)
    }

    /// In-memory bookkeeping once an acknowledgement is durable.
    pub(crate) fn reference_acknowledged(&self, reference: &Arc<MessageReference>) -> Result<()> {
        reference.set_state(ReferenceState::Acknowledged);
        self.decrement_delivering();
        self.size_bytes
            .fetch_sub(reference.message().encode_size() as i64, Ordering::SeqCst);
        let remaining = reference.handle().decrement_refs(reference.is_durable());
        if remaining == 0 {
            if let Some(context) = self.context.upgrade() {
                let message = reference.message();
                if message.is_large() && !message.is_durable() {
                    context.storage().delete_large_message(message.id())?;
                }
                context.paging().message_done(message)?;
            }
        }
        Ok(())
    }

    /// Return delivered references after a rollback or a consumer close.
    ///
    /// Each delivery count is incremented; references over the address's
    /// max delivery attempts go to its dead-letter address, the rest are
    /// put back at the front (or rescheduled when a redelivery delay is
    /// configured).
    pub fn cancel_references(&self, references: Vec<Arc<MessageReference>>) -> Result<()> {
        if references.is_empty() {
            return Ok(());
        }
        let context = self.context.upgrade();
        let settings = self.settings()?;
        let max_attempts = settings.max_delivery_attempts();
        let delay = settings.redelivery_delay_ms();
        let now = self.now();

        let mut requeue = Vec::with_capacity(references.len());
        let mut dead = Vec::new();
        for reference in references {
            let count = reference.increment_delivery_count();
            let durable = reference.is_durable();
            if let (true, Some(context)) = (durable, &context) {
                context
                    .storage()
                    .update_delivery_count(self.id, reference.message_id(), count)?;
            }
            if max_attempts > 0 && count >= max_attempts {
                dead.push(reference);
                continue;
            }
            self.decrement_delivering();
            if delay > 0 {
                let time = now + delay;
                reference.set_scheduled_delivery_time(Some(time));
                if let (true, Some(context)) = (durable, &context) {
                    context.storage().update_scheduled_delivery_time(
                        self.id,
                        reference.message_id(),
                        time,
                    )?;
                }
            }
            requeue.push(reference);
        }
        if !requeue.is_empty() {
            self.enqueue(requeue, true)?;
        }
        for reference in dead {
            self.dead_letter(&reference)?;
        }
        Ok(())
    }

    // ========================================================================
    // Dead letters, expiry and moves
    // ========================================================================

    /// Route a copy of a delivering reference's message to the dead-letter
    /// address and acknowledge the original.
    fn dead_letter(&self, reference: &Arc<MessageReference>) -> Result<()> {
        let context = self.context()?;
        let settings = self.settings()?;
        match settings.dead_letter_address() {
            Some(address) => {
                let id = context.storage().generate_unique_id()?;
                let mut copy = reference.message().copy_for_dead_letter(id, &self.name);
                copy.set_address(address);
                debug!(
                    "message {} from queue {} sent to dead-letter address {address}",
                    reference.message_id(),
                    self.name
                );
                self.redirect(&context, reference, Some(copy))
            }
            None => {
                warn!(
                    "message {} on queue {} exceeded {} delivery attempts and there is no dead-letter address, dropping it",
                    reference.message_id(),
                    self.name,
                    settings.max_delivery_attempts()
                );
                self.redirect(&context, reference, None)
            }
        }
    }

    fn expire(&self, reference: &Arc<MessageReference>) -> Result<()> {
        let context = self.context()?;
        let settings = self.settings()?;
        match settings.expiry_address() {
            Some(address) => {
                let id = context.storage().generate_unique_id()?;
                let mut copy = reference.message().copy_for_expiry(id, &self.name);
                copy.set_address(address);
                self.redirect(&context, reference, Some(copy))
            }
            None => {
                warn!(
                    "message {} on queue {} expired and there is no expiry address, dropping it",
                    reference.message_id(),
                    self.name
                );
                self.redirect(&context, reference, None)
            }
        }
    }

    fn expire_all(&self, expired: Vec<Arc<MessageReference>>) -> Result<()> {
        for reference in expired {
            reference.set_state(ReferenceState::Delivering);
            self.delivering.fetch_add(1, Ordering::SeqCst);
            self.expire(&reference)?;
        }
        Ok(())
    }

    /// Acknowledge `reference` and route `copy` in one transaction.
    fn redirect(
        &self,
        context: &Arc<ServerContext>,
        reference: &Arc<MessageReference>,
        copy: Option<Message>,
    ) -> Result<()> {
        let mut tx = Transaction::new(context)?;
        if let Some(copy) = copy {
            let copy = copy_large_body(context, reference.message(), copy)?;
            tx.add_message(copy)?;
        }
        tx.add_acknowledgement(Arc::clone(reference))?;
        tx.commit()
    }

    // ========================================================================
    // Management
    // ========================================================================

    /// Available then scheduled references, optionally filtered.
    pub fn list(&self, filter: Option<&Filter>) -> Result<Vec<Arc<MessageReference>>> {
        let inner = self.lock()?;
        let mut scheduled: Vec<&ScheduledRef> = inner.scheduled.iter().collect();
        scheduled.sort_by_key(|s| (s.time, s.seq));
        Ok(inner
            .messages
            .iter()
            .chain(scheduled.into_iter().map(|s| &s.reference))
            .filter(|r| filter.map_or(true, |f| f.matches(r.message())))
            .cloned()
            .collect())
    }

    pub fn get_reference(&self, message_id: u64) -> Result<Option<Arc<MessageReference>>> {
        Ok(self
            .list(None)?
            .into_iter()
            .find(|r| r.message_id() == message_id))
    }

    /// Take the reference for `message_id` out of the queue. It counts as
    /// delivering until acknowledged or cancelled.
    pub fn remove_reference_with_id(
        &self,
        message_id: u64,
    ) -> Result<Option<Arc<MessageReference>>> {
        let taken = self.lock()?.take(message_id);
        if let Some(reference) = &taken {
            reference.set_state(ReferenceState::Delivering);
            self.delivering.fetch_add(1, Ordering::SeqCst);
        }
        Ok(taken)
    }

    pub fn delete_reference(&self, message_id: u64) -> Result<bool> {
        match self.remove_reference_with_id(message_id)? {
            Some(reference) => {
                self.acknowledge_all(vec![reference])?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn delete_all_references(&self) -> Result<usize> {
        self.delete_matching_references(None)
    }

    pub fn delete_matching_references(&self, filter: Option<&Filter>) -> Result<usize> {
        let taken = self
            .lock()?
            .take_matching(|r| filter.map_or(true, |f| f.matches(r.message())));
        for reference in &taken {
            reference.set_state(ReferenceState::Delivering);
            self.delivering.fetch_add(1, Ordering::SeqCst);
        }
        let count = taken.len();
        self.acknowledge_all(taken)?;
        Ok(count)
    }

    fn acknowledge_all(&self, references: Vec<Arc<MessageReference>>) -> Result<()> {
        if references.is_empty() {
            return Ok(());
        }
        let context = self.context()?;
        let mut tx = Transaction::new(&context)?;
        for reference in references {
            tx.add_acknowledgement(reference)?;
        }
        tx.commit()
    }

    pub fn expire_message(&self, message_id: u64) -> Result<bool> {
        match self.remove_reference_with_id(message_id)? {
            Some(reference) => {
                self.expire(&reference)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Expire every reference whose message has expired.
    pub fn expire_references(&self) -> Result<usize> {
        let now = self.now();
        let expired = self
            .lock()?
            .take_matching(|r| r.message().is_expired(now));
        let count = expired.len();
        self.expire_all(expired)?;
        Ok(count)
    }

    pub fn send_message_to_dead_letter(&self, message_id: u64) -> Result<bool> {
        match self.remove_reference_with_id(message_id)? {
            Some(reference) => {
                self.dead_letter(&reference)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Route a copy to `to_address` and acknowledge the original.
    pub fn move_message(&self, message_id: u64, to_address: &str) -> Result<bool> {
        let Some(reference) = self.remove_reference_with_id(message_id)? else {
            return Ok(false);
        };
        let context = self.context()?;
        let mut copy = reference.message().clone();
        copy.set_id(context.storage().generate_unique_id()?);
        copy.set_address(to_address);
        self.redirect(&context, &reference, Some(copy))?;
        Ok(true)
    }

    /// Re-queue an available reference at a new priority. The stored
    /// message keeps its original priority.
    pub fn change_message_priority(&self, message_id: u64, priority: u8) -> Result<bool> {
        let now = self.now();
        let expired = {
            let mut inner = self.lock()?;
            let Some(reference) = inner.messages.remove_where(|r| r.message_id() == message_id)
            else {
                return Ok(false);
            };
            reference.set_priority(priority);
            let priority = reference.priority();
            inner.messages.add_last(reference, priority);
            self.deliver_locked(&mut inner, now)
        };
        self.expire_all(expired)?;
        Ok(true)
    }

    // ========================================================================
    // Counters
    // ========================================================================

    /// Available, scheduled and delivering references.
    pub fn message_count(&self) -> Result<usize> {
        let inner = self.lock()?;
        Ok(inner.messages.len() + inner.scheduled.len() + self.delivering_count())
    }

    pub fn scheduled_count(&self) -> Result<usize> {
        Ok(self.lock()?.scheduled.len())
    }

    pub fn delivering_count(&self) -> usize {
        self.delivering.load(Ordering::SeqCst)
    }

    pub fn size_bytes(&self) -> i64 {
        self.size_bytes.load(Ordering::SeqCst)
    }

    pub fn messages_added(&self) -> u64 {
        self.messages_added.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn lock(&self) -> Result<MutexGuard<'_, QueueInner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Corrupt("queue lock poisoned"))
    }

    fn context(&self) -> Result<Arc<ServerContext>> {
        self.context.upgrade().ok_or_else(|| {
            Error::IllegalState(format!("queue {} is not attached to a server", self.name))
        })
    }

    fn settings(&self) -> Result<AddressSettings> {
        match self.context.upgrade() {
            Some(context) => context.address_settings().get_match(&self.address),
            None => Ok(AddressSettings::default()),
        }
    }

    fn now(&self) -> u64 {
        match self.context.upgrade() {
            Some(context) => context.clock().now_millis(),
            None => SystemClock.now_millis(),
        }
    }

    fn decrement_delivering(&self) {
        let _ = self
            .delivering
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    fn notify(&self, kind: NotificationType) {
        if let Some(context) = self.context.upgrade() {
            let notification = Notification::new(kind, context.clock().now_millis())
                .property("queue", self.name.as_str())
                .property("address", self.address.as_str());
            context.notifications().send(notification);
        }
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("address", &self.address)
            .field("durable", &self.durable)
            .finish()
    }
}

/// Large bodies live in a file per message id; a copy needs its own file.
fn copy_large_body(context: &ServerContext, original: &Message, copy: Message) -> Result<Message> {
    if !original.is_large() {
        return Ok(copy);
    }
    let storage = context.storage();
    let body = storage.read_large_message_body(original.id())?;
    let mut writer = storage.create_large_message(copy)?;
    writer.add_bytes(&body)?;
    writer.seal()
}

#[cfg(test)]
mod tests;
