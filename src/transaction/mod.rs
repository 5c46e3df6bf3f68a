//! Transactions: buffered sends and acknowledgements applied atomically.
//!
//! # Design
//!
//! - `add_message` routes immediately but only *creates* references; they
//!   are enqueued when the transaction commits
//! - `add_acknowledgement` takes a delivered reference; it is removed for
//!   good on commit and cancelled back to its queue on rollback
//! - Commit writes a single durable operation without a journal transaction
//!   and everything else inside one, then applies the in-memory effects
//! - XA transactions carry an `Xid`, must be prepared before commit and are
//!   held by the `ResourceManager` until resolved
//! - Synchronizations run in registration order around prepare, commit and
//!   rollback
//!
//! Messages for an address in paging mode are written to its page files
//! instead of being routed. Inside a journal transaction they are guarded
//! by a page-transaction record so they are only depaged once committed.

mod resource_manager;
mod xid;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use log::{debug, warn};

use crate::message::{Message, MessageHandle, ServerMessage};
use crate::paging::Admission;
use crate::persistence::PageTransactionInfo;
use crate::queue::{MessageReference, Queue};
use crate::server::ServerContext;
use crate::{Error, Result};

pub use resource_manager::{ResourceManager, SharedTransaction};
pub use xid::Xid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Prepared,
    Committed,
    RolledBack,
    Suspended,
    RollbackOnly,
}

/// Hooks around the transaction's lifecycle. All default to no-ops.
///
/// A `before_*` error aborts the operation: a failed `before_commit` rolls
/// the transaction back. `after_*` errors are logged.
pub trait TransactionSynchronization: Send + Sync {
    fn before_prepare(&self, _tx: &Transaction) -> Result<()> {
        Ok(())
    }

    fn before_commit(&self, _tx: &Transaction) -> Result<()> {
        Ok(())
    }

    fn after_commit(&self, _tx: &Transaction) -> Result<()> {
        Ok(())
    }

    fn before_rollback(&self, _tx: &Transaction) -> Result<()> {
        Ok(())
    }

    fn after_rollback(&self, _tx: &Transaction) -> Result<()> {
        Ok(())
    }
}

pub struct Transaction {
    id: u64,
    xid: Option<Xid>,
    state: TransactionState,
    context: Weak<ServerContext>,
    /// Routed messages in send order, with their references.
    routed: Vec<(MessageHandle, Vec<Arc<MessageReference>>)>,
    acknowledgements: Vec<Arc<MessageReference>>,
    paged: Vec<Message>,
    page_transaction: Option<PageTransactionInfo>,
    synchronizations: Vec<Arc<dyn TransactionSynchronization>>,
    /// Always write through a journal transaction, even for one operation.
    force_transactional: bool,
    persisted: bool,
    /// The journal holds records under this transaction's id.
    journal_open: bool,
    rollback_reason: Option<String>,
}

impl Transaction {
    /// A local transaction.
    pub fn new(context: &Arc<ServerContext>) -> Result<Self> {
        Ok(Self::with_id(
            context,
            context.storage().generate_unique_id()?,
            None,
        ))
    }

    /// A transaction branch of a global (XA) transaction.
    pub fn new_xa(context: &Arc<ServerContext>, xid: Xid) -> Result<Self> {
        let mut tx = Self::with_id(context, context.storage().generate_unique_id()?, Some(xid));
        tx.force_transactional = true;
        Ok(tx)
    }

    /// A prepared transaction rebuilt from the journal.
    pub(crate) fn recovered(context: &Arc<ServerContext>, tx_id: u64, xid: Xid) -> Self {
        let mut tx = Self::with_id(context, tx_id, Some(xid));
        tx.state = TransactionState::Prepared;
        tx.force_transactional = true;
        tx.persisted = true;
        tx.journal_open = true;
        tx
    }

    fn with_id(context: &Arc<ServerContext>, id: u64, xid: Option<Xid>) -> Self {
        Self {
            id,
            xid,
            state: TransactionState::Active,
            context: Arc::downgrade(context),
            routed: Vec::new(),
            acknowledgements: Vec::new(),
            paged: Vec::new(),
            page_transaction: None,
            synchronizations: Vec::new(),
            force_transactional: false,
            persisted: false,
            journal_open: false,
            rollback_reason: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn xid(&self) -> Option<&Xid> {
        self.xid.as_ref()
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn rollback_reason(&self) -> Option<&str> {
        self.rollback_reason.as_deref()
    }

    /// References waiting to be enqueued on commit.
    pub fn reference_count(&self) -> usize {
        self.routed.iter().map(|(_, refs)| refs.len()).sum()
    }

    pub fn acknowledgement_count(&self) -> usize {
        self.acknowledgements.len()
    }

    pub fn paged_count(&self) -> usize {
        self.paged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routed.is_empty() && self.acknowledgements.is_empty() && self.paged.is_empty()
    }

    pub fn add_synchronization(&mut self, synchronization: Arc<dyn TransactionSynchronization>) {
        self.synchronizations.push(synchronization);
    }

    // ========================================================================
    // Buffering
    // ========================================================================

    /// Route `message` to the queues bound to its address. The references
    /// become visible on commit. Assigns an id when the message has none.
    ///
    /// # Errors
    ///
    /// - `Error::AddressDoesNotExist`: destinations are required and the
    ///   address is unknown
    /// - `Error::AddressFull`: the address is full and blocks producers
    pub fn add_message(&mut self, mut message: Message) -> Result<()> {
        self.check_writable()?;
        let context = self.context()?;
        context.post_office().check_destination(message.address())?;
        if message.id() == 0 {
            message.set_id(context.storage().generate_unique_id()?);
        }
        match context.paging().admit(&message)? {
            Admission::Route => self.route(&context, message),
            Admission::Page => {
                self.paged.push(message);
                Ok(())
            }
            Admission::Drop => Ok(()),
        }
    }

    /// Route a message read back from a page file. Bypasses admission.
    pub(crate) fn add_depaged_message(&mut self, message: Message) -> Result<()> {
        self.check_writable()?;
        let context = self.context()?;
        self.route(&context, message)
    }

    fn route(&mut self, context: &ServerContext, message: Message) -> Result<()> {
        let handle = ServerMessage::new(message);
        let references = context.post_office().route(&handle)?;
        if references.is_empty() {
            debug!(
                "message {} to {} matched no queue",
                handle.id(),
                handle.address()
            );
            return Ok(());
        }
        self.routed.push((handle, references));
        Ok(())
    }

    /// Acknowledge a delivered reference when the transaction commits.
    pub fn add_acknowledgement(&mut self, reference: Arc<MessageReference>) -> Result<()> {
        self.check_writable()?;
        self.acknowledgements.push(reference);
        Ok(())
    }

    /// Rebuild a reference recorded by a prepared transaction.
    pub(crate) fn add_recovered_reference(&mut self, reference: Arc<MessageReference>) {
        let handle = Arc::clone(reference.handle());
        match self
            .routed
            .iter_mut()
            .find(|(h, _)| Arc::ptr_eq(h, &handle))
        {
            Some((_, refs)) => refs.push(reference),
            None => self.routed.push((handle, vec![reference])),
        }
    }

    pub(crate) fn add_recovered_acknowledgement(&mut self, reference: Arc<MessageReference>) {
        self.acknowledgements.push(reference);
    }

    pub(crate) fn set_page_transaction(&mut self, info: PageTransactionInfo) {
        self.page_transaction = Some(info);
    }

    /// Write through a journal transaction even for a single operation.
    pub(crate) fn force_transactional(&mut self) {
        self.force_transactional = true;
    }

    /// Records were appended under this id outside of `persist`.
    pub(crate) fn mark_journal_open(&mut self) {
        self.journal_open = true;
    }

    // ========================================================================
    // State transitions
    // ========================================================================

    pub fn suspend(&mut self) -> Result<()> {
        if self.state != TransactionState::Active {
            return Err(self.bad_state("suspend"));
        }
        self.state = TransactionState::Suspended;
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        if self.state != TransactionState::Suspended {
            return Err(self.bad_state("resume"));
        }
        self.state = TransactionState::Active;
        Ok(())
    }

    /// Any later commit rolls back instead.
    pub fn mark_rollback_only(&mut self, reason: impl Into<String>) {
        if matches!(
            self.state,
            TransactionState::Active | TransactionState::Suspended | TransactionState::Prepared
        ) {
            self.state = TransactionState::RollbackOnly;
            self.rollback_reason = Some(reason.into());
        }
    }

    /// First phase of two-phase commit.
    ///
    /// # Errors
    ///
    /// - `Error::IllegalState`: no xid, or not active
    /// - `Error::RollbackOnly`: the transaction was marked rollback only
    pub fn prepare(&mut self) -> Result<()> {
        let Some(xid) = self.xid.clone() else {
            return Err(Error::illegal_state(format!(
                "transaction {} has no xid and cannot be prepared",
                self.id
            )));
        };
        match self.state {
            TransactionState::Active => {}
            TransactionState::RollbackOnly => {
                return Err(Error::RollbackOnly(self.reason()));
            }
            _ => return Err(self.bad_state("prepare")),
        }
        let context = self.context()?;
        self.run_hooks("before_prepare", |s, tx| s.before_prepare(tx))?;
        let prepared = self
            .persist(&context)
            .and_then(|_| context.storage().prepare(self.id, &xid));
        if let Err(err) = prepared {
            warn!("prepare of transaction {} ({xid}) failed: {err}", self.id);
            self.abort(&context, true);
            return Err(err);
        }
        self.journal_open = true;
        self.state = TransactionState::Prepared;
        Ok(())
    }

    /// Persist and apply. A transaction marked rollback only is rolled back
    /// and `Error::RollbackOnly` returned.
    pub fn commit(&mut self) -> Result<()> {
        match self.state {
            TransactionState::Active | TransactionState::Prepared => {}
            TransactionState::RollbackOnly => {
                let reason = self.reason();
                self.rollback()?;
                return Err(Error::RollbackOnly(reason));
            }
            _ => return Err(self.bad_state("commit")),
        }
        if self.xid.is_some() && self.state != TransactionState::Prepared {
            return Err(Error::illegal_state(format!(
                "xa transaction {} must be prepared before commit",
                self.id
            )));
        }
        let context = self.context()?;
        if let Err(err) = self.run_hooks("before_commit", |s, tx| s.before_commit(tx)) {
            self.abort(&context, true);
            return Err(err);
        }
        if let Err(err) = self.persist(&context) {
            warn!("transaction {} failed to persist, rolling back: {err}", self.id);
            self.abort(&context, true);
            return Err(err);
        }
        if self.journal_open {
            if let Err(err) = context.storage().commit(self.id) {
                warn!("commit of transaction {} failed, rolling back: {err}", self.id);
                self.abort(&context, false);
                return Err(err);
            }
            self.journal_open = false;
        }
        self.apply(&context)?;
        self.state = TransactionState::Committed;
        self.run_after_hooks("after_commit", |s, tx| s.after_commit(tx));
        Ok(())
    }

    /// Discard sends and return acknowledged references to their queues
    /// with their delivery count incremented.
    pub fn rollback(&mut self) -> Result<()> {
        match self.state {
            TransactionState::Active
            | TransactionState::Prepared
            | TransactionState::RollbackOnly
            | TransactionState::Suspended => {}
            _ => return Err(self.bad_state("rollback")),
        }
        let context = self.context()?;
        self.run_hooks("before_rollback", |s, tx| s.before_rollback(tx))?;
        if self.journal_open {
            context.storage().rollback(self.id)?;
            self.journal_open = false;
        }
        self.undo()?;
        self.state = TransactionState::RolledBack;
        self.run_after_hooks("after_rollback", |s, tx| s.after_rollback(tx));
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// True when the work fits in one non-transactional journal record, so a
    /// crash can never leave part of it on disk.
    fn single_operation(&self) -> bool {
        if self.force_transactional
            || self.routed.len() + self.acknowledgements.len() + self.paged.len() != 1
        {
            return false;
        }
        if let Some((_, references)) = self.routed.first() {
            let mut durable = references.iter().filter(|r| r.is_durable());
            return match (durable.next(), durable.next()) {
                (None, _) => true,
                (Some(reference), None) => reference.scheduled_delivery_time().is_none(),
                _ => false,
            };
        }
        if let Some(reference) = self.acknowledgements.first() {
            return !reference.is_durable() || reference.handle().durable_ref_count() > 1;
        }
        true
    }

    fn persist(&mut self, context: &ServerContext) -> Result<()> {
        if self.persisted {
            return Ok(());
        }
        self.persisted = true;
        if self.single_operation() {
            self.persist_single(context)
        } else {
            self.persist_transactional(context)
        }
    }

    fn persist_single(&mut self, context: &ServerContext) -> Result<()> {
        let storage = context.storage();
        if let Some((handle, references)) = self.routed.first() {
            let durable: Vec<&Arc<MessageReference>> =
                references.iter().filter(|r| r.is_durable()).collect();
            if !durable.is_empty() {
                storage.store_message(handle.message())?;
                for reference in durable {
                    storage.store_reference(reference.queue_id(), handle.id())?;
                }
            }
        } else if let Some(reference) = self.acknowledgements.first() {
            if reference.is_durable() {
                storage.store_acknowledge(reference.queue_id(), reference.message_id())?;
                if reference.handle().durable_ref_count() <= 1 {
                    storage.store_delete(reference.message_id())?;
                }
            }
        } else if let Some(message) = self.paged.first() {
            context.paging().page(message, 0)?;
        }
        Ok(())
    }

    fn persist_transactional(&mut self, context: &ServerContext) -> Result<()> {
        let storage = context.storage();
        let tx_id = self.id;
        for (handle, references) in &self.routed {
            let mut stored = false;
            for reference in references.iter().filter(|r| r.is_durable()) {
                if !stored {
                    storage.store_message_transactional(tx_id, handle.message())?;
                    stored = true;
                }
                match reference.scheduled_delivery_time() {
                    Some(time) => storage.store_message_reference_scheduled_transactional(
                        tx_id,
                        reference.queue_id(),
                        handle.id(),
                        time,
                    )?,
                    None => storage.store_reference_transactional(
                        tx_id,
                        reference.queue_id(),
                        handle.id(),
                    )?,
                }
                self.journal_open = true;
            }
        }

        let mut acked: HashMap<u64, (usize, &Arc<MessageReference>)> = HashMap::new();
        for reference in self.acknowledgements.iter().filter(|r| r.is_durable()) {
            storage.store_acknowledge_transactional(
                tx_id,
                reference.queue_id(),
                reference.message_id(),
            )?;
            self.journal_open = true;
            acked
                .entry(reference.message_id())
                .or_insert((0, reference))
                .0 += 1;
        }
        for (message_id, (count, reference)) in acked {
            if reference.handle().durable_ref_count() <= count {
                storage.store_delete_transactional(tx_id, message_id)?;
            }
        }

        if !self.paged.is_empty() {
            for message in &self.paged {
                context.paging().page(message, tx_id)?;
            }
            let info = PageTransactionInfo {
                record_id: storage.generate_unique_id()?,
                tx_id,
                message_count: u32::try_from(self.paged.len()).unwrap_or(u32::MAX),
            };
            storage.store_page_transaction(tx_id, &info)?;
            self.journal_open = true;
            self.page_transaction = Some(info);
        }
        Ok(())
    }

    fn apply(&mut self, context: &ServerContext) -> Result<()> {
        for (handle, references) in std::mem::take(&mut self.routed) {
            context
                .paging()
                .add_size(handle.address(), handle.encode_size() as i64)?;
            for reference in references {
                match reference.queue() {
                    Some(queue) => queue.add_last(reference)?,
                    None => {
                        reference.handle().decrement_refs(reference.is_durable());
                    }
                }
            }
        }
        for reference in std::mem::take(&mut self.acknowledgements) {
            if let Some(queue) = reference.queue() {
                queue.reference_acknowledged(&reference)?;
            }
        }
        self.paged.clear();
        if let Some(info) = self.page_transaction.take() {
            context.paging().add_page_transaction(info)?;
        }
        Ok(())
    }

    fn undo(&mut self) -> Result<()> {
        for (_, references) in std::mem::take(&mut self.routed) {
            for reference in references {
                reference.handle().decrement_refs(reference.is_durable());
            }
        }
        self.paged.clear();
        self.page_transaction = None;

        let mut by_queue: Vec<(Arc<Queue>, Vec<Arc<MessageReference>>)> = Vec::new();
        for reference in std::mem::take(&mut self.acknowledgements) {
            let Some(queue) = reference.queue() else {
                continue;
            };
            match by_queue.iter_mut().find(|(q, _)| Arc::ptr_eq(q, &queue)) {
                Some((_, refs)) => refs.push(reference),
                None => by_queue.push((queue, vec![reference])),
            }
        }
        for (queue, references) in by_queue {
            queue.cancel_references(references)?;
        }
        Ok(())
    }

    /// Roll back after a failure, keeping the original error.
    fn abort(&mut self, context: &ServerContext, rollback_journal: bool) {
        if rollback_journal && self.journal_open {
            if let Err(err) = context.storage().rollback(self.id) {
                warn!("rollback of transaction {} failed: {err}", self.id);
            }
        }
        self.journal_open = false;
        if let Err(err) = self.undo() {
            warn!("undo of transaction {} failed: {err}", self.id);
        }
        self.state = TransactionState::RolledBack;
        self.run_after_hooks("after_rollback", |s, tx| s.after_rollback(tx));
    }

    fn run_hooks(
        &self,
        stage: &str,
        hook: impl Fn(&dyn TransactionSynchronization, &Transaction) -> Result<()>,
    ) -> Result<()> {
        for synchronization in &self.synchronizations {
            if let Err(err) = hook(synchronization.as_ref(), self) {
                debug!("{stage} hook of transaction {} failed: {err}", self.id);
                return Err(err);
            }
        }
        Ok(())
    }

    fn run_after_hooks(
        &self,
        stage: &str,
        hook: impl Fn(&dyn TransactionSynchronization, &Transaction) -> Result<()>,
    ) {
        for synchronization in &self.synchronizations {
            if let Err(err) = hook(synchronization.as_ref(), self) {
                warn!("{stage} hook of transaction {} failed: {err}", self.id);
            }
        }
    }

    fn check_writable(&self) -> Result<()> {
        match self.state {
            TransactionState::Active | TransactionState::RollbackOnly => Ok(()),
            _ => Err(self.bad_state("add work to")),
        }
    }

    fn bad_state(&self, action: &str) -> Error {
        Error::IllegalState(format!(
            "cannot {action} transaction {} in state {:?}",
            self.id, self.state
        ))
    }

    fn reason(&self) -> String {
        self.rollback_reason
            .clone()
            .unwrap_or_else(|| format!("transaction {}", self.id))
    }

    fn context(&self) -> Result<Arc<ServerContext>> {
        self.context
            .upgrade()
            .ok_or_else(|| Error::illegal_state("transaction outlived its server"))
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("xid", &self.xid)
            .field("state", &self.state)
            .field("references", &self.reference_count())
            .field("acknowledgements", &self.acknowledgements.len())
            .field("paged", &self.paged.len())
            .finish()
    }
}

#[cfg(test)]
mod tests;
