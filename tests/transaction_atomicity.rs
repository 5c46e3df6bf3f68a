use std::sync::{Arc, Mutex};

use courier::queue::{Consumer, HandleStatus, MessageReference};
use courier::{Broker, Configuration, Error, Message, Result, TransactionState};
use tempfile::{tempdir, TempDir};

struct Grab(Mutex<Vec<Arc<MessageReference>>>);

impl Grab {
    fn new() -> Arc<Self> {
        Arc::new(Self(Mutex::new(Vec::new())))
    }

    fn take(&self) -> Vec<Arc<MessageReference>> {
        std::mem::take(&mut *self.0.lock().expect("lock"))
    }
}

impl Consumer for Grab {
    fn handle(&self, reference: &Arc<MessageReference>) -> Result<HandleStatus> {
        self.0.lock().expect("lock").push(Arc::clone(reference));
        Ok(HandleStatus::Handled)
    }
}

fn broker(dir: &TempDir) -> Broker {
    let mut config = Configuration::with_data_dir(dir.path());
    config.journal_file_size = 128 * 1024;
    config.journal_buffer_size = 32 * 1024;
    let broker = Broker::new(config).expect("broker");
    broker.start().expect("start");
    broker
}

#[test]
fn commit_makes_adds_visible_and_acknowledgements_final() {
    let dir = tempdir().expect("tempdir");
    let broker = broker(&dir);
    let orders = broker.create_queue("orders", "orders.q", None, true).expect("queue");
    let audit = broker.create_queue("orders", "audit.q", None, true).expect("queue");
    for n in 0..3 {
        broker
            .send(Message::new("orders", format!("old-{n}")).durable(true))
            .expect("send");
    }
    let consumer = Grab::new();
    orders.add_consumer(consumer.clone()).expect("consumer");
    let delivered = consumer.take();
    assert_eq!(delivered.len(), 3);

    let mut tx = broker.begin().expect("begin");
    for n in 0..4 {
        tx.add_message(Message::new("orders", format!("new-{n}")).durable(true))
            .expect("add");
    }
    for reference in &delivered {
        tx.add_acknowledgement(Arc::clone(reference)).expect("ack");
    }
    // Nothing is visible before commit.
    assert_eq!(audit.message_count().expect("count"), 3);
    assert_eq!(orders.delivering_count(), 3);

    tx.commit().expect("commit");
    assert_eq!(tx.state(), TransactionState::Committed);
    assert_eq!(audit.message_count().expect("count"), 7);
    assert_eq!(consumer.take().len(), 4);
    assert_eq!(orders.delivering_count(), 4);
    assert_eq!(orders.message_count().expect("count"), 4);
}

#[test]
fn rollback_hides_adds_and_returns_acknowledged_references() {
    let dir = tempdir().expect("tempdir");
    let broker = broker(&dir);
    let queue = broker.create_queue("a", "a.q", None, true).expect("queue");
    for n in 0..2 {
        broker
            .send(Message::new("a", format!("m{n}")).durable(true))
            .expect("send");
    }
    let grab = Grab::new();
    let consumer: Arc<dyn Consumer> = grab.clone();
    queue.add_consumer(Arc::clone(&consumer)).expect("consumer");
    let delivered = grab.take();
    assert_eq!(delivered.len(), 2);
    queue.remove_consumer(&consumer).expect("remove");

    let mut tx = broker.begin().expect("begin");
    tx.add_message(Message::new("a", "never").durable(true)).expect("add");
    for reference in &delivered {
        tx.add_acknowledgement(Arc::clone(reference)).expect("ack");
    }
    tx.rollback().expect("rollback");
    assert_eq!(tx.state(), TransactionState::RolledBack);

    let ids: Vec<u64> = delivered.iter().map(|r| r.message_id()).collect();
    let mut seen = Vec::new();
    while let Some(reference) = queue.remove_first().expect("remove") {
        assert_eq!(reference.delivery_count(), 1);
        seen.push(reference.message_id());
    }
    assert_eq!(seen, ids);
}

#[test]
fn uncommitted_transaction_is_discarded_on_restart() {
    let dir = tempdir().expect("tempdir");
    {
        let broker = broker(&dir);
        broker.create_queue("a", "a.q", None, true).expect("queue");
        broker.send(Message::new("a", "committed").durable(true)).expect("send");
        let mut tx = broker.begin().expect("begin");
        tx.add_message(Message::new("a", "pending").durable(true)).expect("add");
        tx.add_message(Message::new("a", "pending too").durable(true)).expect("add");
        // Dropped without commit.
        drop(tx);
        broker.stop().expect("stop");
    }
    let broker = broker(&dir);
    let queue = broker.queue("a.q").expect("lookup").expect("queue");
    assert_eq!(queue.message_count().expect("count"), 1);
    let reference = queue.remove_first().expect("remove").expect("message");
    assert_eq!(reference.message().body(), b"committed");
}

#[test]
fn committing_twice_is_an_error() {
    let dir = tempdir().expect("tempdir");
    let broker = broker(&dir);
    broker.create_queue("a", "a.q", None, false).expect("queue");
    let mut tx = broker.begin().expect("begin");
    tx.add_message(Message::new("a", "x")).expect("add");
    tx.commit().expect("commit");
    assert!(matches!(tx.commit(), Err(Error::IllegalState(_))));
    assert!(matches!(
        tx.add_message(Message::new("a", "y")),
        Err(Error::IllegalState(_))
    ));
}
