//! Post office: the address to queue binding table and the router.
//!
//! # Design
//!
//! - Bindings are held per address as an `Arc<Vec<_>>` swapped on change,
//!   so routing takes a snapshot and never holds the table lock while
//!   creating references
//! - A second map by queue name gives O(1) unbind
//! - Durable bindings and destinations are persisted through the storage
//!   manager; restored ones are re-inserted without writing again
//! - Remote bindings (queues on other nodes) are tracked for
//!   `is_bound_on_all_nodes` only; forwarding belongs to the clustering
//!   layer

mod binding;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};

use log::debug;

use crate::message::{Message, MessageHandle, ServerMessage};
use crate::notification::{Notification, NotificationType};
use crate::persistence::QueueBindingInfo;
use crate::queue::{MessageReference, Queue};
use crate::server::ServerContext;
use crate::{Error, Result};

pub use binding::{Binding, RemoteQueueBinding};

#[derive(Default)]
struct BindingTable {
    by_address: HashMap<String, Arc<Vec<Arc<Binding>>>>,
    by_name: HashMap<String, Arc<Binding>>,
    remote: HashMap<String, Vec<RemoteQueueBinding>>,
}

pub struct PostOffice {
    context: Weak<ServerContext>,
    node_id: String,
    require_destinations: bool,
    table: RwLock<BindingTable>,
    destinations: RwLock<HashSet<String>>,
}

impl PostOffice {
    pub fn new(
        context: Weak<ServerContext>,
        node_id: impl Into<String>,
        require_destinations: bool,
    ) -> Self {
        Self {
            context,
            node_id: node_id.into(),
            require_destinations,
            table: RwLock::new(BindingTable::default()),
            destinations: RwLock::new(HashSet::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    // ========================================================================
    // Bindings
    // ========================================================================

    /// Bind `queue` to its address, persisting the binding when the queue
    /// is durable.
    ///
    /// # Errors
    ///
    /// - `Error::QueueExists`: a queue with the same name is bound
    pub fn add_binding(&self, queue: Arc<Queue>) -> Result<Arc<Binding>> {
        self.insert_binding(queue, true)
    }

    /// Re-insert a binding loaded from storage.
    pub(crate) fn restore_binding(&self, queue: Arc<Queue>) -> Result<Arc<Binding>> {
        self.insert_binding(queue, false)
    }

    fn insert_binding(&self, queue: Arc<Queue>, persist: bool) -> Result<Arc<Binding>> {
        let binding = Arc::new(Binding::new(queue));
        {
            let mut table = self.table.write().map_err(Error::poisoned)?;
            if table.by_name.contains_key(binding.queue_name()) {
                return Err(Error::QueueExists(binding.queue_name().to_string()));
            }
            if persist && binding.is_durable() {
                let queue = binding.queue();
                self.context()?
                    .storage()
                    .add_queue_binding(&QueueBindingInfo {
                        id: queue.id(),
                        address: queue.address().to_string(),
                        queue_name: queue.name().to_string(),
                        filter: queue.filter().map(|f| f.expression().to_string()),
                    })?;
            }
            let entry = table
                .by_address
                .entry(binding.address().to_string())
                .or_default();
            let mut updated = Vec::with_capacity(entry.len() + 1);
            updated.extend(entry.iter().cloned());
            updated.push(Arc::clone(&binding));
            *entry = Arc::new(updated);
            table
                .by_name
                .insert(binding.queue_name().to_string(), Arc::clone(&binding));
        }
        debug!(
            "bound queue {} to address {}",
            binding.queue_name(),
            binding.address()
        );
        self.notify(NotificationType::BindingAdded, &binding);
        Ok(binding)
    }

    /// Unbind the queue named `queue_name`, deleting its persisted binding.
    ///
    /// # Errors
    ///
    /// - `Error::QueueDoesNotExist`: no queue with that name is bound
    pub fn remove_binding(&self, queue_name: &str) -> Result<Arc<Binding>> {
        let binding = {
            let mut table = self.table.write().map_err(Error::poisoned)?;
            let binding = table
                .by_name
                .get(queue_name)
                .cloned()
                .ok_or_else(|| Error::QueueDoesNotExist(queue_name.to_string()))?;
            if binding.is_durable() {
                self.context()?
                    .storage()
                    .delete_queue_binding(binding.queue().id())?;
            }
            table.by_name.remove(queue_name);
            let address = binding.address().to_string();
            let remaining: Vec<Arc<Binding>> = table
                .by_address
                .get(&address)
                .map(|list| {
                    list.iter()
                        .filter(|b| !Arc::ptr_eq(b, &binding))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            if remaining.is_empty() {
                table.by_address.remove(&address);
            } else {
                table.by_address.insert(address, Arc::new(remaining));
            }
            binding
        };
        self.notify(NotificationType::BindingRemoved, &binding);
        Ok(binding)
    }

    pub fn get_binding(&self, queue_name: &str) -> Result<Option<Arc<Binding>>> {
        Ok(self
            .table
            .read()
            .map_err(Error::poisoned)?
            .by_name
            .get(queue_name)
            .cloned())
    }

    pub fn bindings_for_address(&self, address: &str) -> Result<Arc<Vec<Arc<Binding>>>> {
        Ok(self
            .table
            .read()
            .map_err(Error::poisoned)?
            .by_address
            .get(address)
            .cloned()
            .unwrap_or_default())
    }

    pub fn queue_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .table
            .read()
            .map_err(Error::poisoned)?
            .by_name
            .keys()
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    /// Addresses with at least one local binding.
    pub fn addresses(&self) -> Result<Vec<String>> {
        let mut addresses: Vec<String> = self
            .table
            .read()
            .map_err(Error::poisoned)?
            .by_address
            .keys()
            .cloned()
            .collect();
        addresses.sort();
        Ok(addresses)
    }

    pub fn queues(&self) -> Result<Vec<Arc<Queue>>> {
        Ok(self
            .table
            .read()
            .map_err(Error::poisoned)?
            .by_name
            .values()
            .map(|b| Arc::clone(b.queue()))
            .collect())
    }

    // ========================================================================
    // Destinations
    // ========================================================================

    /// Allow routing to `address`. Returns false if it was already allowed.
    pub fn add_destination(&self, address: &str, durable: bool) -> Result<bool> {
        let mut destinations = self.destinations.write().map_err(Error::poisoned)?;
        if destinations.contains(address) {
            return Ok(false);
        }
        if durable {
            self.context()?.storage().add_destination(address)?;
        }
        destinations.insert(address.to_string());
        Ok(true)
    }

    pub fn remove_destination(&self, address: &str, durable: bool) -> Result<bool> {
        let mut destinations = self.destinations.write().map_err(Error::poisoned)?;
        if !destinations.remove(address) {
            return Ok(false);
        }
        if durable {
            self.context()?.storage().delete_destination(address)?;
        }
        Ok(true)
    }

    pub(crate) fn restore_destination(&self, address: &str) -> Result<()> {
        self.destinations
            .write()
            .map_err(Error::poisoned)?
            .insert(address.to_string());
        Ok(())
    }

    pub fn contains_destination(&self, address: &str) -> Result<bool> {
        Ok(self
            .destinations
            .read()
            .map_err(Error::poisoned)?
            .contains(address))
    }

    /// # Errors
    ///
    /// - `Error::AddressDoesNotExist`: destinations are required and the
    ///   address was never added
    pub fn check_destination(&self, address: &str) -> Result<()> {
        if self.require_destinations && !self.contains_destination(address)? {
            return Err(Error::AddressDoesNotExist(address.to_string()));
        }
        Ok(())
    }

    pub fn destinations(&self) -> Result<Vec<String>> {
        let mut all: Vec<String> = self
            .destinations
            .read()
            .map_err(Error::poisoned)?
            .iter()
            .cloned()
            .collect();
        all.sort();
        Ok(all)
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Create a reference on every local queue bound to the message's
    /// address whose filter accepts it. References are not enqueued.
    ///
    /// # Errors
    ///
    /// - `Error::AddressDoesNotExist`: destinations are required and the
    ///   address was never added
    pub fn route(&self, message: &MessageHandle) -> Result<Vec<Arc<MessageReference>>> {
        let address = message.address();
        self.check_destination(address)?;
        let bindings = self.bindings_for_address(address)?;
        Ok(bindings
            .iter()
            .filter(|b| b.accepts(message.message()))
            .map(|b| MessageReference::new(Arc::clone(message), b.queue()))
            .collect())
    }

    /// Deliver a message forwarded by another node to the local matching
    /// queues. Nothing is persisted. Returns the number of queues reached.
    pub fn route_from_cluster(&self, mut message: Message) -> Result<usize> {
        message.set_durable(false);
        if message.id() == 0 {
            message.set_id(self.context()?.storage().generate_unique_id()?);
        }
        let handle = ServerMessage::new(message);
        let references = self.route(&handle)?;
        let count = references.len();
        for reference in references {
            if let Some(queue) = reference.queue() {
                queue.add_last(reference)?;
            }
        }
        Ok(count)
    }

    // ========================================================================
    // Remote bindings
    // ========================================================================

    pub fn add_remote_binding(&self, binding: RemoteQueueBinding) -> Result<()> {
        let mut table = self.table.write().map_err(Error::poisoned)?;
        let list = table.remote.entry(binding.address.clone()).or_default();
        list.retain(|b| !(b.node_id == binding.node_id && b.queue_name == binding.queue_name));
        list.push(binding);
        Ok(())
    }

    pub fn remove_remote_binding(&self, node_id: &str, queue_name: &str) -> Result<bool> {
        let mut table = self.table.write().map_err(Error::poisoned)?;
        let mut removed = false;
        table.remote.retain(|_, list| {
            let before = list.len();
            list.retain(|b| !(b.node_id == node_id && b.queue_name == queue_name));
            removed |= list.len() != before;
            !list.is_empty()
        });
        Ok(removed)
    }

    pub fn remote_bindings_for_address(&self, address: &str) -> Result<Vec<RemoteQueueBinding>> {
        Ok(self
            .table
            .read()
            .map_err(Error::poisoned)?
            .remote
            .get(address)
            .cloned()
            .unwrap_or_default())
    }

    /// Every node in `nodes` has a queue bound to `address`; this node
    /// counts through its local bindings.
    pub fn is_bound_on_all_nodes(&self, address: &str, nodes: &[String]) -> Result<bool> {
        let table = self.table.read().map_err(Error::poisoned)?;
        let local = table
            .by_address
            .get(address)
            .map_or(false, |list| !list.is_empty());
        let remote = table.remote.get(address);
        Ok(nodes.iter().all(|node| {
            if *node == self.node_id {
                local
            } else {
                remote.map_or(false, |list| list.iter().any(|b| &b.node_id == node))
            }
        }))
    }

    fn context(&self) -> Result<Arc<ServerContext>> {
        self.context
            .upgrade()
            .ok_or_else(|| Error::illegal_state("post office outlived its server"))
    }

    fn notify(&self, kind: NotificationType, binding: &Binding) {
        if let Some(context) = self.context.upgrade() {
            context.notifications().send(
                Notification::new(kind, context.clock().now_millis())
                    .property("address", binding.address())
                    .property("queue", binding.queue_name()),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;

    fn context(require_destinations: bool) -> Arc<ServerContext> {
        let mut config = crate::config::Configuration::default();
        config.require_destinations = require_destinations;
        config.node_id = "node-a".to_string();
        ServerContext::builder().configuration(config).build().unwrap()
    }

    fn handle(address: &str, colour: &str) -> MessageHandle {
        let mut message = Message::new(address, "x").property("colour", colour);
        message.set_id(1);
        ServerMessage::new(message)
    }

    #[test]
    fn routes_by_filter() {
        let context = context(false);
        context.create_queue("a", "all", None, false, false).unwrap();
        context
            .create_queue("a", "red", Some("colour = 'red'"), false, false)
            .unwrap();
        context.create_queue("b", "other", None, false, false).unwrap();

        let post_office = context.post_office();
        let red = post_office.route(&handle("a", "red")).unwrap();
        let names: Vec<String> = red
            .iter()
            .map(|r| r.queue().unwrap().name().to_string())
            .collect();
        assert_eq!(names, vec!["all", "red"]);
        assert_eq!(post_office.route(&handle("a", "blue")).unwrap().len(), 1);
        assert!(post_office.route(&handle("nowhere", "red")).unwrap().is_empty());
        assert_eq!(post_office.addresses().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn duplicate_and_missing_queues() {
        let context = context(false);
        context.create_queue("a", "q", None, false, false).unwrap();
        assert!(matches!(
            context.create_queue("b", "q", None, false, false),
            Err(Error::QueueExists(_))
        ));
        let post_office = context.post_office();
        post_office.remove_binding("q").unwrap();
        assert!(matches!(
            post_office.remove_binding("q"),
            Err(Error::QueueDoesNotExist(_))
        ));
        assert!(post_office.bindings_for_address("a").unwrap().is_empty());
        assert!(post_office.addresses().unwrap().is_empty());
    }

    #[test]
    fn required_destinations_reject_unknown_addresses() {
        let context = context(true);
        let post_office = context.post_office();
        assert!(matches!(
            post_office.route(&handle("a", "red")),
            Err(Error::AddressDoesNotExist(_))
        ));
        assert!(post_office.add_destination("a", false).unwrap());
        assert!(!post_office.add_destination("a", false).unwrap());
        assert!(post_office.route(&handle("a", "red")).unwrap().is_empty());
        assert!(post_office.remove_destination("a", false).unwrap());
        assert!(!post_office.contains_destination("a").unwrap());
    }

    #[test]
    fn remote_bindings_count_towards_full_binding() {
        let context = context(false);
        let post_office = context.post_office();
        let nodes = vec!["node-a".to_string(), "node-b".to_string()];
        post_office
            .add_remote_binding(RemoteQueueBinding::new(
                "node-b",
                "a",
                "q-b",
                Filter::parse_optional(None).unwrap(),
            ))
            .unwrap();
        assert!(!post_office.is_bound_on_all_nodes("a", &nodes).unwrap());

        context.create_queue("a", "q-a", None, false, false).unwrap();
        assert!(post_office.is_bound_on_all_nodes("a", &nodes).unwrap());
        assert_eq!(post_office.remote_bindings_for_address("a").unwrap().len(), 1);

        assert!(post_office.remove_remote_binding("node-b", "q-b").unwrap());
        assert!(!post_office.is_bound_on_all_nodes("a", &nodes).unwrap());
        // remote bindings are never routed to
        assert_eq!(post_office.route(&handle("a", "red")).unwrap().len(), 1);
    }

    #[test]
    fn cluster_messages_are_enqueued_non_durably() {
        let context = context(false);
        let queue = context.create_queue("a", "q", None, true, false).unwrap();
        let reached = context
            .post_office()
            .route_from_cluster(Message::new("a", "remote").durable(true))
            .unwrap();
        assert_eq!(reached, 1);
        let listed = queue.list(None).unwrap();
        assert!(!listed[0].is_durable());
        assert!(!listed[0].message().is_durable());
    }
}
