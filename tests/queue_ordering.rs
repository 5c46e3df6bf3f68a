use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use courier::queue::{Consumer, HandleStatus, MessageReference};
use courier::{Broker, Configuration, Message, Result, ServerContext};

struct Timed {
    received: Mutex<Vec<(u64, Instant)>>,
}

impl Consumer for Timed {
    fn handle(&self, reference: &Arc<MessageReference>) -> Result<HandleStatus> {
        self.received
            .lock()
            .expect("lock")
            .push((reference.message_id(), Instant::now()));
        Ok(HandleStatus::Handled)
    }
}

fn in_memory_broker() -> Broker {
    let mut config = Configuration::default();
    config.persistence_enabled = false;
    let context = ServerContext::builder()
        .configuration(config)
        .build()
        .expect("context");
    let broker = Broker::with_context(context);
    broker.start().expect("start");
    broker
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_millis() as u64
}

fn message(id: u64, priority: u8) -> Message {
    let mut message = Message::new("a", format!("m{id}")).priority(priority);
    message.set_id(id);
    message
}

#[test]
fn highest_priority_is_removed_first() {
    let broker = in_memory_broker();
    let queue = broker.create_queue("a", "q", None, false).expect("queue");
    for (id, priority) in [(1, 5), (2, 9), (3, 1)] {
        broker.send(message(id, priority)).expect("send");
    }
    let order: Vec<u8> = std::iter::from_fn(|| queue.remove_first().expect("remove"))
        .map(|r| r.priority())
        .collect();
    assert_eq!(order, vec![9, 5, 1]);
}

#[test]
fn equal_priorities_keep_send_order() {
    let broker = in_memory_broker();
    let queue = broker.create_queue("a", "q", None, false).expect("queue");
    for id in 1..=20 {
        broker.send(message(id, (id % 3) as u8 + 3)).expect("send");
    }
    let ids: Vec<u64> = std::iter::from_fn(|| queue.remove_first().expect("remove"))
        .map(|r| r.message_id())
        .collect();
    let mut expected: Vec<u64> = Vec::new();
    for priority in [5u8, 4, 3] {
        expected.extend((1..=20).filter(|id| (id % 3) as u8 + 3 == priority));
    }
    assert_eq!(ids, expected);
}

#[test]
fn scheduled_message_waits_for_its_deadline() {
    let broker = in_memory_broker();
    let queue = broker.create_queue("a", "q", None, false).expect("queue");
    let consumer = Arc::new(Timed {
        received: Mutex::new(Vec::new()),
    });
    queue.add_consumer(consumer.clone()).expect("consumer");

    let delay = Duration::from_millis(300);
    let sent_at = Instant::now();
    let deadline = now_millis() + delay.as_millis() as u64;
    broker
        .send(message(1, 4).scheduled_delivery_time(deadline))
        .expect("send");
    broker.send(message(2, 4)).expect("send");

    assert_eq!(queue.scheduled_count().expect("count"), 1);
    let wait_until = Instant::now() + Duration::from_secs(5);
    while consumer.received.lock().expect("lock").len() < 2 {
        assert!(Instant::now() < wait_until, "scheduled message never arrived");
        thread::sleep(Duration::from_millis(10));
    }

    let received = consumer.received.lock().expect("lock").clone();
    assert_eq!(received[0].0, 2);
    assert_eq!(received[1].0, 1);
    let waited = received[1].1.duration_since(sent_at);
    assert!(waited >= delay - Duration::from_millis(5), "delivered early: {waited:?}");
    assert!(waited < delay + Duration::from_secs(1), "delivered late: {waited:?}");
}

#[test]
fn promoted_messages_go_ahead_of_the_backlog() {
    let broker = in_memory_broker();
    let queue = broker.create_queue("a", "q", None, false).expect("queue");
    let due = now_millis() + 150;
    for id in 1..=3 {
        broker.send(message(id, 4)).expect("send");
    }
    broker
        .send(message(10, 4).scheduled_delivery_time(due))
        .expect("send");
    broker
        .send(message(11, 4).scheduled_delivery_time(due))
        .expect("send");

    let wait_until = Instant::now() + Duration::from_secs(5);
    while queue.scheduled_count().expect("count") > 0 {
        assert!(Instant::now() < wait_until, "scheduled messages never promoted");
        thread::sleep(Duration::from_millis(10));
    }
    let ids: Vec<u64> = std::iter::from_fn(|| queue.remove_first().expect("remove"))
        .map(|r| r.message_id())
        .collect();
    assert_eq!(ids.len(), 5);
    assert_eq!(&ids[2..], &[1, 2, 3]);
    let mut head = ids[..2].to_vec();
    head.sort_unstable();
    assert_eq!(head, vec![10, 11]);
}
