use std::sync::{Arc, Mutex};

use super::*;
use crate::message::Message;
use crate::queue::{Consumer, HandleStatus};

struct Grab(Mutex<Vec<Arc<MessageReference>>>);

impl Consumer for Grab {
    fn handle(&self, reference: &Arc<MessageReference>) -> Result<HandleStatus> {
        self.0.lock().unwrap().push(Arc::clone(reference));
        Ok(HandleStatus::Handled)
    }
}

fn context() -> Arc<ServerContext> {
    ServerContext::builder().build().unwrap()
}

fn send(context: &Arc<ServerContext>, address: &str, bodies: &[&str]) {
    let mut tx = Transaction::new(context).unwrap();
    for body in bodies {
        tx.add_message(Message::new(address, *body)).unwrap();
    }
    tx.commit().unwrap();
}

fn xid(n: u8) -> Xid {
    Xid::new(7, vec![n; 4], vec![1])
}

#[test]
fn commit_applies_adds_and_acknowledgements() {
    let context = context();
    let queue = context.create_queue("a", "q", None, false, false).unwrap();
    send(&context, "a", &["one", "two"]);
    let grab = Arc::new(Grab(Mutex::new(Vec::new())));
    queue.add_consumer(grab.clone()).unwrap();
    let delivered = std::mem::take(&mut *grab.0.lock().unwrap());
    assert_eq!(delivered.len(), 2);

    let mut tx = Transaction::new(&context).unwrap();
    tx.add_message(Message::new("a", "three")).unwrap();
    for reference in &delivered {
        tx.add_acknowledgement(Arc::clone(reference)).unwrap();
    }
    assert_eq!(tx.reference_count(), 1);
    // nothing visible before commit
    assert_eq!(queue.messages_added(), 2);

    tx.commit().unwrap();
    assert_eq!(tx.state(), TransactionState::Committed);
    assert_eq!(queue.messages_added(), 3);
    assert_eq!(queue.delivering_count(), 1);
    assert!(delivered.iter().all(|r| r.handle().ref_count() == 0));
}

#[test]
fn rollback_discards_adds_and_redelivers_acknowledgements() {
    let context = context();
    let queue = context.create_queue("a", "q", None, false, false).unwrap();
    send(&context, "a", &["one"]);
    let grab = Arc::new(Grab(Mutex::new(Vec::new())));
    let consumer: Arc<dyn Consumer> = grab.clone();
    queue.add_consumer(Arc::clone(&consumer)).unwrap();
    let delivered = std::mem::take(&mut *grab.0.lock().unwrap());
    queue.remove_consumer(&consumer).unwrap();

    let mut tx = Transaction::new(&context).unwrap();
    tx.add_message(Message::new("a", "never")).unwrap();
    tx.add_acknowledgement(Arc::clone(&delivered[0])).unwrap();
    tx.rollback().unwrap();

    assert_eq!(tx.state(), TransactionState::RolledBack);
    let listed = queue.list(None).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].message().body(), b"one");
    assert_eq!(listed[0].delivery_count(), 1);
    assert_eq!(queue.delivering_count(), 0);
    assert!(matches!(tx.commit(), Err(Error::IllegalState(_))));
}

#[test]
fn prepare_requires_an_xid() {
    let context = context();
    let mut tx = Transaction::new(&context).unwrap();
    assert!(matches!(tx.prepare(), Err(Error::IllegalState(_))));
}

#[test]
fn xa_commit_before_prepare_fails_fast() {
    let context = context();
    context.create_queue("a", "q", None, false, false).unwrap();
    let mut tx = Transaction::new_xa(&context, xid(1)).unwrap();
    tx.add_message(Message::new("a", "x")).unwrap();
    assert!(matches!(tx.commit(), Err(Error::IllegalState(_))));
    assert_eq!(tx.state(), TransactionState::Active);

    tx.prepare().unwrap();
    assert_eq!(tx.state(), TransactionState::Prepared);
    assert!(matches!(tx.add_message(Message::new("a", "late")), Err(Error::IllegalState(_))));
    tx.commit().unwrap();
}

#[test]
fn rollback_only_commit_rolls_back() {
    let context = context();
    let queue = context.create_queue("a", "q", None, false, false).unwrap();
    let mut tx = Transaction::new(&context).unwrap();
    tx.add_message(Message::new("a", "x")).unwrap();
    tx.mark_rollback_only("consumer failed");

    match tx.commit() {
        Err(Error::RollbackOnly(reason)) => assert_eq!(reason, "consumer failed"),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(tx.state(), TransactionState::RolledBack);
    assert_eq!(queue.message_count().unwrap(), 0);
}

#[test]
fn suspend_and_resume() {
    let context = context();
    let mut tx = Transaction::new(&context).unwrap();
    tx.suspend().unwrap();
    assert!(matches!(tx.add_message(Message::new("a", "x")), Err(Error::IllegalState(_))));
    assert!(tx.suspend().is_err());
    tx.resume().unwrap();
    assert_eq!(tx.state(), TransactionState::Active);
}

struct Recorder {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

impl TransactionSynchronization for Recorder {
    fn before_commit(&self, tx: &Transaction) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        let seen = log.len();
        log.push(format!("{} before {} saw {seen}", self.name, tx.reference_count()));
        Ok(())
    }

    fn after_commit(&self, _tx: &Transaction) -> Result<()> {
        self.log.lock().unwrap().push(format!("{} after", self.name));
        Ok(())
    }

    fn after_rollback(&self, _tx: &Transaction) -> Result<()> {
        self.log.lock().unwrap().push(format!("{} rolled back", self.name));
        Ok(())
    }
}

#[test]
fn synchronizations_run_in_registration_order() {
    let context = context();
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut tx = Transaction::new(&context).unwrap();
    for name in ["first", "second"] {
        tx.add_synchronization(Arc::new(Recorder {
            name,
            log: Arc::clone(&log),
        }));
    }
    tx.commit().unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "first before 0 saw 0",
            "second before 0 saw 1",
            "first after",
            "second after"
        ]
    );

    let mut tx = Transaction::new(&context).unwrap();
    tx.add_synchronization(Arc::new(Recorder {
        name: "third",
        log: Arc::clone(&log),
    }));
    tx.rollback().unwrap();
    assert_eq!(log.lock().unwrap().last().unwrap(), "third rolled back");
}

struct Veto;

impl TransactionSynchronization for Veto {
    fn before_commit(&self, _tx: &Transaction) -> Result<()> {
        Err(Error::Security("not allowed".to_string()))
    }
}

#[test]
fn failing_before_commit_rolls_back() {
    let context = context();
    let queue = context.create_queue("a", "q", None, false, false).unwrap();
    let mut tx = Transaction::new(&context).unwrap();
    tx.add_message(Message::new("a", "x")).unwrap();
    tx.add_synchronization(Arc::new(Veto));
    assert!(matches!(tx.commit(), Err(Error::Security(_))));
    assert_eq!(tx.state(), TransactionState::RolledBack);
    assert_eq!(queue.message_count().unwrap(), 0);
}

#[test]
fn resource_manager_tracks_in_doubt_transactions() {
    let context = context();
    let queue = context.create_queue("a", "q", None, false, false).unwrap();
    let manager = ResourceManager::new();

    let mut tx = Transaction::new_xa(&context, xid(1)).unwrap();
    tx.add_message(Message::new("a", "x")).unwrap();
    tx.prepare().unwrap();
    manager.put(tx).unwrap();
    manager
        .put(Transaction::new_xa(&context, xid(2)).unwrap())
        .unwrap();

    assert!(matches!(
        manager.put(Transaction::new_xa(&context, xid(1)).unwrap()),
        Err(Error::XidExists(_))
    ));
    assert!(manager.put(Transaction::new(&context).unwrap()).is_err());
    assert_eq!(manager.prepared_transactions().unwrap(), vec![xid(1)]);
    assert!(matches!(
        manager.commit_prepared(&xid(2)),
        Err(Error::IllegalState(_))
    ));
    assert!(matches!(
        manager.rollback_prepared(&xid(9)),
        Err(Error::TransactionNotFound(_))
    ));

    manager.commit_prepared(&xid(1)).unwrap();
    assert_eq!(queue.message_count().unwrap(), 1);
    assert_eq!(manager.heuristic_committed_transactions().unwrap(), vec![xid(1)]);
    assert!(manager.get(&xid(1)).unwrap().is_none());
    assert_eq!(manager.len().unwrap(), 1);
}
