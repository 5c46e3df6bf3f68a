//! Broker assembly.
//!
//! # Design
//!
//! - `ServerContext` owns every broker-wide service and is handed to the
//!   components that need them as a `Weak` reference; there are no
//!   process-wide singletons, so several brokers can live in one process
//! - `Broker` drives the lifecycle: start replays storage into queues,
//!   recovers in-doubt transactions and then starts the background work
//!   (scheduler, expiry scan, notification dispatch)
//! - A broker is started at most once; stop releases files and threads

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::Configuration;
use crate::filter::Filter;
use crate::interceptor::InterceptorChain;
use crate::message::{Message, MessageHandle, ServerMessage};
use crate::notification::{Notification, NotificationService, NotificationType};
use crate::paging::PagingManager;
use crate::persistence::{
    JournalStorageManager, LargeMessageWriter, LoadedMessages, NullStorageManager, StorageManager,
};
use crate::postoffice::PostOffice;
use crate::queue::{DistributorRegistry, MessageReference, Queue, QueueConfig, ScheduledExecutor};
use crate::settings::{AddressSettings, HierarchicalRepository};
use crate::transaction::{ResourceManager, SharedTransaction, Transaction, Xid};
use crate::{Error, Result};

// ============================================================================
// Context
// ============================================================================

/// The services of one broker instance.
pub struct ServerContext {
    config: Configuration,
    storage: Arc<dyn StorageManager>,
    clock: Arc<dyn Clock>,
    scheduler: ScheduledExecutor,
    address_settings: HierarchicalRepository<AddressSettings>,
    post_office: PostOffice,
    paging: PagingManager,
    resource_manager: ResourceManager,
    notifications: NotificationService,
    distributors: DistributorRegistry,
    interceptors: InterceptorChain,
    started: AtomicBool,
}

impl ServerContext {
    pub fn builder() -> ServerContextBuilder {
        ServerContextBuilder::default()
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn StorageManager> {
        &self.storage
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn scheduler(&self) -> &ScheduledExecutor {
        &self.scheduler
    }

    pub fn address_settings(&self) -> &HierarchicalRepository<AddressSettings> {
        &self.address_settings
    }

    pub fn post_office(&self) -> &PostOffice {
        &self.post_office
    }

    pub fn paging(&self) -> &PagingManager {
        &self.paging
    }

    pub fn resource_manager(&self) -> &ResourceManager {
        &self.resource_manager
    }

    pub fn notifications(&self) -> &NotificationService {
        &self.notifications
    }

    pub fn distributors(&self) -> &DistributorRegistry {
        &self.distributors
    }

    pub fn interceptors(&self) -> &InterceptorChain {
        &self.interceptors
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Create a queue and bind it to `address`. Durable queues are
    /// persisted.
    ///
    /// # Errors
    ///
    /// - `Error::QueueExists`: a queue named `name` is already bound
    /// - `Error::InvalidFilter`: `filter` does not parse
    /// - `Error::Config`: the address's distribution policy is unknown
    pub fn create_queue(
        self: &Arc<Self>,
        address: &str,
        name: &str,
        filter: Option<&str>,
        durable: bool,
        temporary: bool,
    ) -> Result<Arc<Queue>> {
        if self.post_office.get_binding(name)?.is_some() {
            return Err(Error::QueueExists(name.to_string()));
        }
        let id = self.storage.generate_unique_id()?;
        let queue = self.new_queue(id, address, name, filter, durable && !temporary, temporary)?;
        self.post_office.add_binding(Arc::clone(&queue))?;
        Ok(queue)
    }

    fn new_queue(
        self: &Arc<Self>,
        id: u64,
        address: &str,
        name: &str,
        filter: Option<&str>,
        durable: bool,
        temporary: bool,
    ) -> Result<Arc<Queue>> {
        let filter = Filter::parse_optional(filter)?;
        let settings = self.address_settings.get_match(address)?;
        let distributor = self.distributors.create(settings.distribution_policy())?;
        Ok(Queue::new(
            QueueConfig {
                id,
                name: name.to_string(),
                address: address.to_string(),
                filter,
                durable,
                temporary,
            },
            distributor,
            Arc::downgrade(self),
        ))
    }

    /// Expire every expired reference on every queue.
    pub fn expire_all(&self) -> Result<usize> {
        let mut expired = 0;
        for queue in self.post_office.queues()? {
            expired += queue.expire_references()?;
        }
        Ok(expired)
    }
}

#[derive(Default)]
pub struct ServerContextBuilder {
    config: Option<Configuration>,
    storage: Option<Arc<dyn StorageManager>>,
    clock: Option<Arc<dyn Clock>>,
    distributors: Option<DistributorRegistry>,
    interceptors: Option<InterceptorChain>,
}

impl ServerContextBuilder {
    pub fn configuration(mut self, config: Configuration) -> Self {
        self.config = Some(config);
        self
    }

    /// Defaults to a `NullStorageManager`.
    pub fn storage(mut self, storage: Arc<dyn StorageManager>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn distributors(mut self, distributors: DistributorRegistry) -> Self {
        self.distributors = Some(distributors);
        self
    }

    pub fn interceptors(mut self, interceptors: InterceptorChain) -> Self {
        self.interceptors = Some(interceptors);
        self
    }

    pub fn build(self) -> Result<Arc<ServerContext>> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let address_settings = HierarchicalRepository::new(AddressSettings::default());
        for (pattern, settings) in &config.address_settings {
            address_settings.add_match(pattern, settings.clone())?;
        }
        let storage = self.storage.unwrap_or_else(|| {
            Arc::new(NullStorageManager::new(
                config.large_messages_directory.clone(),
            ))
        });
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let notifications = NotificationService::new(
            Duration::from_millis(config.notification_timeout_ms),
            config.notification_threads,
        );

        Ok(Arc::new_cyclic(|weak| ServerContext {
            post_office: PostOffice::new(
                weak.clone(),
                config.node_id.clone(),
                config.require_destinations,
            ),
            paging: PagingManager::new(weak.clone(), config.paging_directory.clone()),
            scheduler: ScheduledExecutor::new(Arc::clone(&clock)),
            storage,
            clock,
            address_settings,
            resource_manager: ResourceManager::new(),
            notifications,
            distributors: self.distributors.unwrap_or_default(),
            interceptors: self.interceptors.unwrap_or_default(),
            started: AtomicBool::new(false),
            config,
        }))
    }
}

// ============================================================================
// Broker
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Started,
    Stopped,
}

/// What `Broker::start` recovered from storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub queues: usize,
    pub destinations: usize,
    pub messages: usize,
    pub references: usize,
    pub page_transactions: usize,
    pub prepared_transactions: usize,
}

pub struct Broker {
    context: Arc<ServerContext>,
    lifecycle: Mutex<Lifecycle>,
    recovered: Mutex<RecoverySummary>,
}

impl Broker {
    /// A broker journaling to the configured directories, or keeping
    /// everything in memory when persistence is disabled.
    pub fn new(config: Configuration) -> Result<Self> {
        config.validate()?;
        let storage: Arc<dyn StorageManager> = if config.persistence_enabled {
            Arc::new(JournalStorageManager::new(&config)?)
        } else {
            Arc::new(NullStorageManager::new(
                config.large_messages_directory.clone(),
            ))
        };
        let context = ServerContext::builder()
            .configuration(config)
            .storage(storage)
            .build()?;
        Ok(Self::with_context(context))
    }

    pub fn with_context(context: Arc<ServerContext>) -> Self {
        Self {
            context,
            lifecycle: Mutex::new(Lifecycle::Created),
            recovered: Mutex::new(RecoverySummary::default()),
        }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    pub fn config(&self) -> &Configuration {
        self.context.config()
    }

    pub fn is_started(&self) -> bool {
        self.context.is_started()
    }

    /// Open storage and rebuild the broker's state from it.
    ///
    /// # Errors
    ///
    /// - `Error::IllegalState`: the broker was stopped
    /// - any storage or recovery error; the broker is then stopped
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().map_err(Error::poisoned)?;
        match *lifecycle {
            Lifecycle::Started => return Ok(()),
            Lifecycle::Stopped => {
                return Err(Error::illegal_state("a stopped broker cannot be restarted"))
            }
            Lifecycle::Created => {}
        }
        match self.recover() {
            Ok(summary) => {
                info!(
                    "broker {} started: {} queues, {} messages, {} prepared transactions recovered",
                    self.config().node_id,
                    summary.queues,
                    summary.messages,
                    summary.prepared_transactions
                );
                *self.recovered.lock().map_err(Error::poisoned)? = summary;
                *lifecycle = Lifecycle::Started;
                Ok(())
            }
            Err(err) => {
                warn!("broker start failed: {err}");
                *lifecycle = Lifecycle::Stopped;
                let _ = self.shutdown();
                Err(err)
            }
        }
    }

    pub fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().map_err(Error::poisoned)?;
        if *lifecycle != Lifecycle::Started {
            *lifecycle = Lifecycle::Stopped;
            return Ok(());
        }
        *lifecycle = Lifecycle::Stopped;
        self.shutdown()?;
        info!("broker {} stopped", self.config().node_id);
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        let context = &self.context;
        context.started.store(false, Ordering::SeqCst);
        context.scheduler().stop()?;
        context.paging().stop()?;
        context.notifications().stop()?;
        context.storage().stop()
    }

    /// What the last start recovered.
    pub fn recovery_summary(&self) -> Result<RecoverySummary> {
        Ok(self.recovered.lock().map_err(Error::poisoned)?.clone())
    }

    fn recover(&self) -> Result<RecoverySummary> {
        let context = &self.context;
        context.storage().start()?;
        context.notifications().start()?;
        context.paging().start()?;

        let mut summary = RecoverySummary::default();
        let queues = self.load_bindings(&mut summary)?;
        let loaded = context.storage().load_messages()?;
        self.load_messages(loaded, &queues, &mut summary)?;

        context.started.store(true, Ordering::SeqCst);
        context.scheduler().start()?;
        schedule_expiry_scan(context)?;
        for address in context.paging().addresses()? {
            if context.paging().is_paging(&address)? {
                let depaged = context.paging().check_depage(&address)?;
                debug!("depaged {depaged} messages to {address} on start");
            }
        }
        Ok(summary)
    }

    fn load_bindings(&self, summary: &mut RecoverySummary) -> Result<HashMap<u64, Arc<Queue>>> {
        let context = &self.context;
        let bindings = context.storage().load_bindings()?;
        for address in &bindings.destinations {
            context.post_office().restore_destination(address)?;
        }
        summary.destinations = bindings.destinations.len();

        let mut queues = HashMap::with_capacity(bindings.queues.len());
        for info in bindings.queues {
            let queue = context.new_queue(
                info.id,
                &info.address,
                &info.queue_name,
                info.filter.as_deref(),
                true,
                false,
            )?;
            context.post_office().restore_binding(Arc::clone(&queue))?;
            queues.insert(info.id, queue);
        }
        summary.queues = queues.len();
        Ok(queues)
    }

    fn load_messages(
        &self,
        loaded: LoadedMessages,
        queues: &HashMap<u64, Arc<Queue>>,
        summary: &mut RecoverySummary,
    ) -> Result<()> {
        let context = &self.context;
        let mut handles: HashMap<u64, MessageHandle> = HashMap::new();

        for message in loaded.messages {
            let handle = ServerMessage::new(message.message);
            let targets: Vec<_> = message
                .references
                .into_iter()
                .filter_map(|r| match queues.get(&r.queue_id) {
                    Some(queue) => Some((Arc::clone(queue), r)),
                    None => {
                        warn!(
                            "message {} references unknown queue {}",
                            handle.id(),
                            r.queue_id
                        );
                        None
                    }
                })
                .collect();
            if targets.is_empty() {
                continue;
            }
            context
                .paging()
                .add_size(handle.address(), handle.encode_size() as i64)?;
            for (queue, loaded_ref) in targets {
                let reference = MessageReference::new(Arc::clone(&handle), &queue);
                reference.set_delivery_count(loaded_ref.delivery_count);
                if loaded_ref.scheduled_delivery_time != 0 {
                    reference.set_scheduled_delivery_time(Some(loaded_ref.scheduled_delivery_time));
                }
                queue.add_last(reference)?;
                summary.references += 1;
            }
            summary.messages += 1;
            handles.insert(handle.id(), handle);
        }

        summary.page_transactions = loaded.page_transactions.len();
        for info in loaded.page_transactions {
            context.paging().add_page_transaction(info)?;
        }
        context.paging().recover_last_pages(loaded.last_pages)?;

        for prepared in loaded.prepared {
            let mut tx = Transaction::recovered(context, prepared.tx_id, prepared.xid);
            for message in prepared.messages {
                let handle = ServerMessage::new(message.message);
                for loaded_ref in message.references {
                    let Some(queue) = queues.get(&loaded_ref.queue_id) else {
                        continue;
                    };
                    let reference = MessageReference::new(Arc::clone(&handle), queue);
                    if loaded_ref.scheduled_delivery_time != 0 {
                        reference
                            .set_scheduled_delivery_time(Some(loaded_ref.scheduled_delivery_time));
                    }
                    tx.add_recovered_reference(reference);
                }
            }
            for (queue_id, message_id) in prepared.references {
                match (queues.get(&queue_id), handles.get(&message_id)) {
                    (Some(queue), Some(handle)) => {
                        tx.add_recovered_reference(MessageReference::new(Arc::clone(handle), queue))
                    }
                    _ => warn!(
                        "prepared transaction {} references unknown message {message_id} on queue {queue_id}",
                        prepared.tx_id
                    ),
                }
            }
            for (queue_id, message_id) in prepared.acknowledgements {
                let reference = match queues.get(&queue_id) {
                    Some(queue) => queue.remove_reference_with_id(message_id)?,
                    None => None,
                };
                match reference {
                    Some(reference) => tx.add_recovered_acknowledgement(reference),
                    None => warn!(
                        "prepared transaction {} acknowledges unknown message {message_id} on queue {queue_id}",
                        prepared.tx_id
                    ),
                }
            }
            if let Some(info) = prepared.page_transactions.into_iter().last() {
                tx.set_page_transaction(info);
            }
            context.resource_manager().put(tx)?;
            summary.prepared_transactions += 1;
        }
        Ok(())
    }

    // ========================================================================
    // Queues
    // ========================================================================

    pub fn create_queue(
        &self,
        address: &str,
        name: &str,
        filter: Option<&str>,
        durable: bool,
    ) -> Result<Arc<Queue>> {
        self.context
            .create_queue(address, name, filter, durable, false)
    }

    /// A non-durable queue that is never persisted.
    pub fn create_temporary_queue(
        &self,
        address: &str,
        name: &str,
        filter: Option<&str>,
    ) -> Result<Arc<Queue>> {
        self.context.create_queue(address, name, filter, false, true)
    }

    /// Unbind a queue and drop its messages.
    ///
    /// # Errors
    ///
    /// - `Error::QueueDoesNotExist`: no queue named `name`
    /// - `Error::IllegalState`: the queue still has consumers
    pub fn destroy_queue(&self, name: &str) -> Result<()> {
        let binding = self
            .context
            .post_office()
            .get_binding(name)?
            .ok_or_else(|| Error::QueueDoesNotExist(name.to_string()))?;
        let queue = binding.queue();
        if queue.consumer_count()? > 0 {
            return Err(Error::illegal_state(format!(
                "queue {name} has consumers"
            )));
        }
        let deleted = queue.delete_all_references()?;
        self.context.post_office().remove_binding(name)?;
        debug!("destroyed queue {name}, deleted {deleted} messages");
        Ok(())
    }

    pub fn queue(&self, name: &str) -> Result<Option<Arc<Queue>>> {
        Ok(self
            .context
            .post_office()
            .get_binding(name)?
            .map(|b| Arc::clone(b.queue())))
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Send one message outside of a transaction, through the interceptor
    /// chain. Bodies above the large message threshold are streamed to
    /// their own file.
    pub fn send(&self, message: Message) -> Result<()> {
        let context = &self.context;
        let mut message = self.maybe_large(message)?;
        let result = context.interceptors().invoke(&mut message, |message| {
            let mut tx = Transaction::new(context)?;
            tx.add_message(message.clone())?;
            tx.commit()
        });
        if let Err(Error::Security(reason)) = &result {
            context.notifications().send(
                Notification::new(
                    NotificationType::SecurityPermissionViolation,
                    context.clock().now_millis(),
                )
                .property("address", message.address())
                .property("reason", reason.as_str()),
            );
        }
        result
    }

    fn maybe_large(&self, message: Message) -> Result<Message> {
        if message.is_large() || message.body().len() <= self.config().large_message_threshold {
            return Ok(message);
        }
        let body = message.body().to_vec();
        let mut writer = self.create_large_message(message)?;
        writer.add_bytes(&body)?;
        writer.seal()
    }

    pub fn create_large_message(&self, message: Message) -> Result<LargeMessageWriter> {
        self.context.storage().create_large_message(message)
    }

    pub fn read_large_message_body(&self, message_id: u64) -> Result<Vec<u8>> {
        self.context.storage().read_large_message_body(message_id)
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub fn begin(&self) -> Result<Transaction> {
        Transaction::new(&self.context)
    }

    /// Start an XA branch and register it under `xid`.
    pub fn begin_xa(&self, xid: Xid) -> Result<SharedTransaction> {
        let tx = Transaction::new_xa(&self.context, xid)?;
        self.context.resource_manager().put(tx)
    }

    pub fn xa_prepare(&self, xid: &Xid) -> Result<()> {
        self.xa_transaction(xid)?
            .lock()
            .map_err(Error::poisoned)?
            .prepare()
    }

    /// Commit a prepared branch and forget it.
    pub fn xa_commit(&self, xid: &Xid) -> Result<()> {
        let tx = self.xa_transaction(xid)?;
        let result = tx.lock().map_err(Error::poisoned)?.commit();
        if result.is_ok() {
            self.context.resource_manager().remove(xid)?;
        }
        result
    }

    /// Roll a branch back. It stays registered if the rollback fails.
    pub fn xa_rollback(&self, xid: &Xid) -> Result<()> {
        let tx = self.xa_transaction(xid)?;
        let result = tx.lock().map_err(Error::poisoned)?.rollback();
        if result.is_ok() {
            self.context.resource_manager().remove(xid)?;
        }
        result
    }

    fn xa_transaction(&self, xid: &Xid) -> Result<SharedTransaction> {
        self.context
            .resource_manager()
            .get(xid)?
            .ok_or_else(|| Error::TransactionNotFound(xid.to_string()))
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn schedule_expiry_scan(context: &Arc<ServerContext>) -> Result<()> {
    let period = context.config().message_expiry_scan_period_ms;
    if period == 0 {
        return Ok(());
    }
    let weak = Arc::downgrade(context);
    context
        .scheduler()
        .schedule(context.clock().now_millis() + period, move || {
            let Some(context) = weak.upgrade() else {
                return;
            };
            if !context.is_started() {
                return;
            }
            match context.expire_all() {
                Ok(0) => {}
                Ok(expired) => debug!("expiry scan expired {expired} messages"),
                Err(err) => warn!("expiry scan failed: {err}"),
            }
            if let Err(err) = schedule_expiry_scan(&context) {
                warn!("could not reschedule expiry scan: {err}");
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::InterceptorChain;
    use crate::queue::{Consumer, HandleStatus};
    use tempfile::TempDir;

    struct Grab(Mutex<Vec<Arc<MessageReference>>>);

    impl Consumer for Grab {
        fn handle(&self, reference: &Arc<MessageReference>) -> Result<HandleStatus> {
            self.0.lock().unwrap().push(Arc::clone(reference));
            Ok(HandleStatus::Handled)
        }
    }

    fn config(dir: &TempDir) -> Configuration {
        let mut config = Configuration::with_data_dir(dir.path());
        config.journal_file_size = 64 * 1024;
        config.journal_buffer_size = 16 * 1024;
        config
    }

    #[test]
    fn durable_queue_and_messages_survive_restart() {
        let dir = TempDir::new().unwrap();
        {
            let broker = Broker::new(config(&dir)).unwrap();
            broker.start().unwrap();
            broker.create_queue("orders", "orders.q", None, true).unwrap();
            broker.create_queue("orders", "orders.tmp", None, false).unwrap();
            broker
                .send(Message::new("orders", "kept").durable(true))
                .unwrap();
            broker.send(Message::new("orders", "lost")).unwrap();
            broker.stop().unwrap();
        }
        let broker = Broker::new(config(&dir)).unwrap();
        broker.start().unwrap();
        let summary = broker.recovery_summary().unwrap();
        assert_eq!(summary.queues, 1);
        assert_eq!(summary.messages, 1);
        let queue = broker.queue("orders.q").unwrap().unwrap();
        assert_eq!(queue.message_count().unwrap(), 1);
        assert!(broker.queue("orders.tmp").unwrap().is_none());
    }

    #[test]
    fn stopped_broker_cannot_restart() {
        let dir = TempDir::new().unwrap();
        let broker = Broker::new(config(&dir)).unwrap();
        broker.start().unwrap();
        broker.start().unwrap();
        broker.stop().unwrap();
        assert!(matches!(broker.start(), Err(Error::IllegalState(_))));
    }

    #[test]
    fn destroy_queue_requires_no_consumers() {
        let mut config = Configuration::default();
        config.persistence_enabled = false;
        let context = ServerContext::builder().configuration(config).build().unwrap();
        let broker = Broker::with_context(context);
        broker.start().unwrap();
        let queue = broker.create_queue("a", "q", None, false).unwrap();
        broker.send(Message::new("a", "x")).unwrap();
        let consumer: Arc<dyn Consumer> = Arc::new(Grab(Mutex::new(Vec::new())));
        queue.add_consumer(Arc::clone(&consumer)).unwrap();
        assert!(matches!(
            broker.destroy_queue("q"),
            Err(Error::IllegalState(_))
        ));
        queue.remove_consumer(&consumer).unwrap();
        broker.destroy_queue("q").unwrap();
        assert!(broker.queue("q").unwrap().is_none());
        assert!(matches!(
            broker.destroy_queue("q"),
            Err(Error::QueueDoesNotExist(_))
        ));
    }

    #[test]
    fn interceptors_run_on_send() {
        let interceptors = InterceptorChain::builder()
            .with("tag", |message, next| {
                *message = message.clone().property("tagged", true);
                next.run(message)
            })
            .with("deny", |message, next| {
                if message.address() == "secret" {
                    return Err(Error::Security("secret is closed".into()));
                }
                next.run(message)
            })
            .build();
        let context = ServerContext::builder()
            .interceptors(interceptors)
            .build()
            .unwrap();
        let broker = Broker::with_context(context);
        let queue = broker.create_queue("open", "q", None, false).unwrap();
        broker.send(Message::new("open", "x")).unwrap();
        let reference = queue.remove_first().unwrap().unwrap();
        assert!(reference.message().properties().get("tagged").is_some());
        assert!(matches!(
            broker.send(Message::new("secret", "x")),
            Err(Error::Security(_))
        ));
    }

    #[test]
    fn big_bodies_become_large_messages() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.large_message_threshold = 16;
        let broker = Broker::new(config).unwrap();
        broker.start().unwrap();
        let queue = broker.create_queue("a", "q", None, true).unwrap();
        broker
            .send(Message::new("a", vec![7u8; 100]).durable(true))
            .unwrap();
        let reference = queue.remove_first().unwrap().unwrap();
        assert!(reference.message().is_large());
        assert_eq!(reference.message().body_size(), 100);
        let body = broker.read_large_message_body(reference.message_id()).unwrap();
        assert_eq!(body, vec![7u8; 100]);
        queue.acknowledge(&reference).unwrap();
        assert!(broker.read_large_message_body(reference.message_id()).is_err());
    }

    #[test]
    fn xa_branch_lifecycle() {
        let broker = Broker::with_context(ServerContext::builder().build().unwrap());
        let queue = broker.create_queue("a", "q", None, false).unwrap();
        let xid = Xid::new(1, vec![1, 2], vec![3]);
        let tx = broker.begin_xa(xid.clone()).unwrap();
        tx.lock().unwrap().add_message(Message::new("a", "x")).unwrap();
        assert!(matches!(
            broker.begin_xa(xid.clone()),
            Err(Error::XidExists(_))
        ));
        broker.xa_prepare(&xid).unwrap();
        assert_eq!(queue.message_count().unwrap(), 0);
        broker.xa_commit(&xid).unwrap();
        assert_eq!(queue.message_count().unwrap(), 1);
        assert!(matches!(
            broker.xa_commit(&xid),
            Err(Error::TransactionNotFound(_))
        ));
    }
}
