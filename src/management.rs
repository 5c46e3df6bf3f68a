//! Typed management interfaces.
//!
//! Plain traits implemented by the core types; any remoting (HTTP, RPC)
//! belongs in an adapter that calls these.

use std::sync::Arc;

use crate::filter::Filter;
use crate::queue::Queue;
use crate::server::Broker;
use crate::transaction::Xid;
use crate::{Error, Result};

/// Management view of one queue. Filters are selector strings.
pub trait QueueControl: Send + Sync {
    fn name(&self) -> &str;
    fn address(&self) -> &str;
    fn filter_expression(&self) -> Option<&str>;
    fn is_durable(&self) -> bool;
    fn is_temporary(&self) -> bool;

    fn message_count(&self) -> Result<usize>;
    fn scheduled_count(&self) -> Result<usize>;
    fn delivering_count(&self) -> usize;
    fn consumer_count(&self) -> Result<usize>;
    fn messages_added(&self) -> u64;

    /// Ids of the messages matching `filter`, in delivery order.
    fn list_message_ids(&self, filter: Option<&str>) -> Result<Vec<u64>>;
    fn remove_message(&self, message_id: u64) -> Result<bool>;
    /// Returns the number removed.
    fn remove_messages(&self, filter: Option<&str>) -> Result<usize>;
    fn expire_message(&self, message_id: u64) -> Result<bool>;
    fn expire_messages(&self) -> Result<usize>;
    fn send_message_to_dead_letter(&self, message_id: u64) -> Result<bool>;
    fn move_message(&self, message_id: u64, to_address: &str) -> Result<bool>;
    fn change_message_priority(&self, message_id: u64, priority: u8) -> Result<bool>;
}

impl QueueControl for Queue {
    fn name(&self) -> &str {
        Queue::name(self)
    }

    fn address(&self) -> &str {
        Queue::address(self)
    }

    fn filter_expression(&self) -> Option<&str> {
        self.filter().map(Filter::expression)
    }

    fn is_durable(&self) -> bool {
        Queue::is_durable(self)
    }

    fn is_temporary(&self) -> bool {
        Queue::is_temporary(self)
    }

    fn message_count(&self) -> Result<usize> {
        Queue::message_count(self)
    }

    fn scheduled_count(&self) -> Result<usize> {
        Queue::scheduled_count(self)
    }

    fn delivering_count(&self) -> usize {
        Queue::delivering_count(self)
    }

    fn consumer_count(&self) -> Result<usize> {
        Queue::consumer_count(self)
    }

    fn messages_added(&self) -> u64 {
        Queue::messages_added(self)
    }

    fn list_message_ids(&self, filter: Option<&str>) -> Result<Vec<u64>> {
        let filter = Filter::parse_optional(filter)?;
        Ok(self
            .list(filter.as_ref())?
            .iter()
            .map(|r| r.message_id())
            .collect())
    }

    fn remove_message(&self, message_id: u64) -> Result<bool> {
        self.delete_reference(message_id)
    }

    fn remove_messages(&self, filter: Option<&str>) -> Result<usize> {
        let filter = Filter::parse_optional(filter)?;
        self.delete_matching_references(filter.as_ref())
    }

    fn expire_message(&self, message_id: u64) -> Result<bool> {
        Queue::expire_message(self, message_id)
    }

    fn expire_messages(&self) -> Result<usize> {
        self.expire_references()
    }

    fn send_message_to_dead_letter(&self, message_id: u64) -> Result<bool> {
        Queue::send_message_to_dead_letter(self, message_id)
    }

    fn move_message(&self, message_id: u64, to_address: &str) -> Result<bool> {
        Queue::move_message(self, message_id, to_address)
    }

    fn change_message_priority(&self, message_id: u64, priority: u8) -> Result<bool> {
        Queue::change_message_priority(self, message_id, priority)
    }
}

/// Management view of a broker.
pub trait ServerControl {
    fn node_id(&self) -> &str;
    fn is_started(&self) -> bool;

    fn queue_names(&self) -> Result<Vec<String>>;
    fn addresses(&self) -> Result<Vec<String>>;
    fn queue_control(&self, name: &str) -> Result<Arc<dyn QueueControl>>;
    fn create_queue(
        &self,
        address: &str,
        name: &str,
        filter: Option<&str>,
        durable: bool,
    ) -> Result<()>;
    fn destroy_queue(&self, name: &str) -> Result<()>;
    fn add_destination(&self, address: &str) -> Result<bool>;
    fn remove_destination(&self, address: &str) -> Result<bool>;

    /// In-doubt transactions, as displayed xids.
    fn prepared_transactions(&self) -> Result<Vec<Xid>>;
    fn commit_prepared_transaction(&self, xid: &Xid) -> Result<()>;
    fn rollback_prepared_transaction(&self, xid: &Xid) -> Result<()>;
    fn heuristic_committed_transactions(&self) -> Result<Vec<Xid>>;
    fn heuristic_rolled_back_transactions(&self) -> Result<Vec<Xid>>;

    fn is_paging(&self, address: &str) -> Result<bool>;
}

impl ServerControl for Broker {
    fn node_id(&self) -> &str {
        &self.config().node_id
    }

    fn is_started(&self) -> bool {
        Broker::is_started(self)
    }

    fn queue_names(&self) -> Result<Vec<String>> {
        self.context().post_office().queue_names()
    }

    fn addresses(&self) -> Result<Vec<String>> {
        self.context().post_office().addresses()
    }

    fn queue_control(&self, name: &str) -> Result<Arc<dyn QueueControl>> {
        let queue = self
            .queue(name)?
            .ok_or_else(|| Error::QueueDoesNotExist(name.to_string()))?;
        Ok(queue)
    }

    fn create_queue(
        &self,
        address: &str,
        name: &str,
        filter: Option<&str>,
        durable: bool,
    ) -> Result<()> {
        Broker::create_queue(self, address, name, filter, durable).map(|_| ())
    }

    fn destroy_queue(&self, name: &str) -> Result<()> {
        Broker::destroy_queue(self, name)
    }

    fn add_destination(&self, address: &str) -> Result<bool> {
        self.context().post_office().add_destination(address, true)
    }

    fn remove_destination(&self, address: &str) -> Result<bool> {
        self.context().post_office().remove_destination(address, true)
    }

    fn prepared_transactions(&self) -> Result<Vec<Xid>> {
        let mut xids = self.context().resource_manager().prepared_transactions()?;
        xids.sort_by_key(|xid| xid.to_string());
        Ok(xids)
    }

    fn commit_prepared_transaction(&self, xid: &Xid) -> Result<()> {
        self.context().resource_manager().commit_prepared(xid)
    }

    fn rollback_prepared_transaction(&self, xid: &Xid) -> Result<()> {
        self.context().resource_manager().rollback_prepared(xid)
    }

    fn heuristic_committed_transactions(&self) -> Result<Vec<Xid>> {
        self.context()
            .resource_manager()
            .heuristic_committed_transactions()
    }

    fn heuristic_rolled_back_transactions(&self) -> Result<Vec<Xid>> {
        self.context()
            .resource_manager()
            .heuristic_rolled_back_transactions()
    }

    fn is_paging(&self, address: &str) -> Result<bool> {
        self.context().paging().is_paging(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::message::Message;
    use crate::server::ServerContext;
    use tempfile::TempDir;

    fn broker(dir: &TempDir) -> Broker {
        let mut config = Configuration::with_data_dir(dir.path());
        config.journal_file_size = 64 * 1024;
        config.journal_buffer_size = 16 * 1024;
        Broker::new(config).unwrap()
    }

    #[test]
    fn queue_control_lists_and_removes() {
        let broker = Broker::with_context(ServerContext::builder().build().unwrap());
        ServerControl::create_queue(&broker, "a", "q", None, false).unwrap();
        for (n, colour) in ["red", "blue", "red"].iter().enumerate() {
            broker
                .send(Message::new("a", format!("m{n}")).property("colour", *colour))
                .unwrap();
        }
        let control = broker.queue_control("q").unwrap();
        assert_eq!(control.message_count().unwrap(), 3);
        assert_eq!(
            control
                .list_message_ids(Some("colour = 'red'"))
                .unwrap()
                .len(),
            2
        );
        assert_eq!(control.remove_messages(Some("colour = 'red'")).unwrap(), 2);
        assert_eq!(control.message_count().unwrap(), 1);
        assert!(matches!(
            control.list_message_ids(Some("colour =")),
            Err(Error::InvalidFilter { .. })
        ));
        assert!(matches!(
            broker.queue_control("missing"),
            Err(Error::QueueDoesNotExist(_))
        ));
    }

    #[test]
    fn in_doubt_transaction_is_recovered_and_committed() {
        let dir = TempDir::new().unwrap();
        let xid = Xid::new(3, b"global".to_vec(), b"branch".to_vec());
        {
            let broker = broker(&dir);
            broker.start().unwrap();
            broker.create_queue("a", "q", None, true).unwrap();
            let tx = broker.begin_xa(xid.clone()).unwrap();
            tx.lock()
                .unwrap()
                .add_message(Message::new("a", "in doubt").durable(true))
                .unwrap();
            broker.xa_prepare(&xid).unwrap();
            broker.stop().unwrap();
        }
        let broker = broker(&dir);
        broker.start().unwrap();
        assert_eq!(broker.prepared_transactions().unwrap(), vec![xid.clone()]);
        let control = broker.queue_control("q").unwrap();
        assert_eq!(control.message_count().unwrap(), 0);

        broker.commit_prepared_transaction(&xid).unwrap();
        assert_eq!(control.message_count().unwrap(), 1);
        assert!(broker.prepared_transactions().unwrap().is_empty());
        assert_eq!(
            broker.heuristic_committed_transactions().unwrap(),
            vec![xid.clone()]
        );
        assert!(matches!(
            broker.rollback_prepared_transaction(&xid),
            Err(Error::TransactionNotFound(_))
        ));
        assert!(!broker.is_paging("a").unwrap());
    }
}
