use std::sync::{Arc, Mutex, Weak};

use super::*;
use crate::clock::ManualClock;
use crate::message::{ServerMessage, HDR_ORIGINAL_QUEUE};
use crate::server::ServerContext;

const T0: u64 = 1_000_000;

struct CollectingConsumer {
    status: Mutex<HandleStatus>,
    received: Mutex<Vec<Arc<MessageReference>>>,
    accept: Box<dyn Fn(&Message) -> bool + Send + Sync>,
}

impl CollectingConsumer {
    fn new() -> Arc<Self> {
        Self::with_filter(|_| true)
    }

    fn with_filter(accept: impl Fn(&Message) -> bool + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(HandleStatus::Handled),
            received: Mutex::new(Vec::new()),
            accept: Box::new(accept),
        })
    }

    fn set_status(&self, status: HandleStatus) {
        *self.status.lock().unwrap() = status;
    }

    fn ids(&self) -> Vec<u64> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.message_id())
            .collect()
    }

    fn take(&self) -> Vec<Arc<MessageReference>> {
        std::mem::take(&mut *self.received.lock().unwrap())
    }
}

impl Consumer for CollectingConsumer {
    fn handle(&self, reference: &Arc<MessageReference>) -> Result<HandleStatus> {
        let status = *self.status.lock().unwrap();
        if status != HandleStatus::Handled {
            return Ok(status);
        }
        if !(self.accept)(reference.message()) {
            return Ok(HandleStatus::NoMatch);
        }
        self.received.lock().unwrap().push(Arc::clone(reference));
        Ok(HandleStatus::Handled)
    }
}

struct FailingConsumer;

impl Consumer for FailingConsumer {
    fn handle(&self, _reference: &Arc<MessageReference>) -> Result<HandleStatus> {
        Err(Error::illegal_state("consumer closed underneath"))
    }
}

fn detached_queue() -> Arc<Queue> {
    Queue::new(
        QueueConfig {
            id: 1,
            name: "q".to_string(),
            address: "a".to_string(),
            filter: None,
            durable: false,
            temporary: false,
        },
        Arc::new(Distribution::RoundRobin),
        Weak::new(),
    )
}

fn reference(queue: &Arc<Queue>, id: u64, priority: u8) -> Arc<MessageReference> {
    let mut message = Message::new(queue.address(), format!("m{id}")).priority(priority);
    message.set_id(id);
    MessageReference::new(ServerMessage::new(message), queue)
}

fn manual_context() -> (Arc<ServerContext>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(T0));
    let context = ServerContext::builder()
        .clock(clock.clone())
        .build()
        .unwrap();
    (context, clock)
}

fn drain_ids(queue: &Queue) -> Vec<u64> {
    let mut ids = Vec::new();
    while let Some(r) = queue.remove_first().unwrap() {
        ids.push(r.message_id());
    }
    ids
}

#[test]
fn higher_priority_is_removed_first() {
    let queue = detached_queue();
    queue.add_last(reference(&queue, 1, 5)).unwrap();
    queue.add_last(reference(&queue, 2, 9)).unwrap();
    queue.add_last(reference(&queue, 3, 1)).unwrap();
    queue.add_last(reference(&queue, 4, 5)).unwrap();

    assert_eq!(queue.messages_added(), 4);
    assert_eq!(drain_ids(&queue), vec![2, 1, 4, 3]);
}

#[test]
fn add_list_first_keeps_relative_order() {
    let queue = detached_queue();
    queue.add_last(reference(&queue, 1, 4)).unwrap();
    let back = vec![reference(&queue, 2, 4), reference(&queue, 3, 4)];
    queue.add_list_first(back).unwrap();
    assert_eq!(drain_ids(&queue), vec![2, 3, 1]);
}

fn add_scheduled_backlog(queue: &Arc<Queue>) {
    let at = |id: u64, delay: Option<u64>| {
        let r = reference(queue, id, 4);
        r.set_scheduled_delivery_time(delay.map(|d| T0 + d));
        r
    };
    queue.add_last(at(1, Some(7_000))).unwrap();
    queue.add_last(at(2, None)).unwrap();
    queue.add_last(at(3, None)).unwrap();
    queue.add_last(at(4, None)).unwrap();
    queue.add_last(at(5, Some(5_000))).unwrap();
    queue.add_last(at(6, Some(4_000))).unwrap();
    queue.add_last(at(7, Some(3_000))).unwrap();
    queue.add_last(at(8, Some(6_000))).unwrap();
}

#[test]
fn scheduled_references_jump_the_backlog_without_consumer() {
    let (context, clock) = manual_context();
    let queue = context.create_queue("a", "q", None, false, false).unwrap();
    add_scheduled_backlog(&queue);

    assert_eq!(queue.scheduled_count().unwrap(), 5);
    assert_eq!(queue.message_count().unwrap(), 8);
    assert_eq!(queue.promote_due().unwrap(), 0);

    for _ in 0..5 {
        clock.advance_millis(1_000);
        queue.promote_due().unwrap();
    }
    clock.advance_millis(2_000);
    queue.promote_due().unwrap();

    assert_eq!(queue.scheduled_count().unwrap(), 0);
    assert_eq!(drain_ids(&queue), vec![1, 8, 5, 6, 7, 2, 3, 4]);
}

#[test]
fn scheduled_references_reach_a_consumer_at_their_deadline() {
    let (context, clock) = manual_context();
    let queue = context.create_queue("a", "q", None, false, false).unwrap();
    let consumer = CollectingConsumer::new();
    queue.add_consumer(consumer.clone()).unwrap();
    add_scheduled_backlog(&queue);

    assert_eq!(consumer.ids(), vec![2, 3, 4]);
    clock.advance_millis(2_999);
    queue.promote_due().unwrap();
    assert_eq!(consumer.ids(), vec![2, 3, 4]);

    for _ in 0..5 {
        clock.advance_millis(1_000);
        queue.promote_due().unwrap();
    }
    assert_eq!(consumer.ids(), vec![2, 3, 4, 7, 6, 5, 8, 1]);
    assert_eq!(queue.delivering_count(), 8);
}

#[test]
fn round_robin_spreads_over_consumers() {
    let queue = detached_queue();
    let first = CollectingConsumer::new();
    let second = CollectingConsumer::new();
    queue.add_consumer(first.clone()).unwrap();
    queue.add_consumer(second.clone()).unwrap();
    for id in 1..=6 {
        queue.add_last(reference(&queue, id, 4)).unwrap();
    }
    assert_eq!(first.ids(), vec![1, 3, 5]);
    assert_eq!(second.ids(), vec![2, 4, 6]);
    assert_eq!(queue.delivering_count(), 6);
}

#[test]
fn busy_consumers_hold_messages_until_ready() {
    let queue = detached_queue();
    let consumer = CollectingConsumer::new();
    consumer.set_status(HandleStatus::Busy);
    queue.add_consumer(consumer.clone()).unwrap();
    queue.add_last(reference(&queue, 1, 4)).unwrap();
    queue.add_last(reference(&queue, 2, 4)).unwrap();
    assert!(consumer.ids().is_empty());

    consumer.set_status(HandleStatus::Handled);
    queue.deliver_now().unwrap();
    assert_eq!(consumer.ids(), vec![1, 2]);
}

#[test]
fn no_match_skips_to_later_references() {
    let queue = detached_queue();
    let evens = CollectingConsumer::with_filter(|m| m.id() % 2 == 0);
    queue.add_consumer(evens.clone()).unwrap();
    for id in 1..=4 {
        queue.add_last(reference(&queue, id, 4)).unwrap();
    }
    assert_eq!(evens.ids(), vec![2, 4]);
    assert_eq!(drain_ids(&queue), vec![1, 3]);
}

#[test]
fn failing_consumer_is_removed() {
    let queue = detached_queue();
    let healthy = CollectingConsumer::new();
    queue.add_consumer(Arc::new(FailingConsumer)).unwrap();
    queue.add_consumer(healthy.clone()).unwrap();
    queue.add_last(reference(&queue, 1, 4)).unwrap();
    queue.add_last(reference(&queue, 2, 4)).unwrap();

    assert_eq!(queue.consumer_count().unwrap(), 1);
    assert_eq!(healthy.ids(), vec![1, 2]);
}

#[test]
fn remove_consumer_by_identity() {
    let queue = detached_queue();
    let consumer: Arc<dyn Consumer> = CollectingConsumer::new();
    let other: Arc<dyn Consumer> = CollectingConsumer::new();
    queue.add_consumer(Arc::clone(&consumer)).unwrap();
    assert!(!queue.remove_consumer(&other).unwrap());
    assert!(queue.remove_consumer(&consumer).unwrap());
    assert_eq!(queue.consumer_count().unwrap(), 0);
}

#[test]
fn cancelled_references_return_to_the_front() {
    let (context, _clock) = manual_context();
    let queue = context.create_queue("a", "q", None, false, false).unwrap();
    let consumer = CollectingConsumer::new();
    queue.add_consumer(consumer.clone()).unwrap();
    queue.add_last(reference(&queue, 1, 4)).unwrap();
    queue.add_last(reference(&queue, 2, 4)).unwrap();

    consumer.set_status(HandleStatus::Busy);
    let delivered = consumer.take();
    queue.add_last(reference(&queue, 3, 4)).unwrap();
    queue.cancel_references(delivered).unwrap();

    assert_eq!(queue.delivering_count(), 0);
    let listed = queue.list(None).unwrap();
    let ids: Vec<u64> = listed.iter().map(|r| r.message_id()).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(listed[0].delivery_count(), 1);
    assert_eq!(listed[2].delivery_count(), 0);
}

#[test]
fn redelivery_delay_reschedules_cancelled_references() {
    let (context, clock) = manual_context();
    context
        .address_settings()
        .add_match(
            "a",
            AddressSettings {
                redelivery_delay_ms: Some(500),
                ..Default::default()
            },
        )
        .unwrap();
    let queue = context.create_queue("a", "q", None, false, false).unwrap();
    let consumer = CollectingConsumer::new();
    queue.add_consumer(consumer.clone()).unwrap();
    queue.add_last(reference(&queue, 1, 4)).unwrap();

    queue.cancel_references(consumer.take()).unwrap();
    assert_eq!(queue.scheduled_count().unwrap(), 1);
    assert!(consumer.ids().is_empty());

    clock.advance_millis(500);
    queue.promote_due().unwrap();
    assert_eq!(consumer.ids(), vec![1]);
}

#[test]
fn exhausted_deliveries_go_to_the_dead_letter_address() {
    let (context, _clock) = manual_context();
    context
        .address_settings()
        .add_match(
            "orders",
            AddressSettings {
                max_delivery_attempts: Some(2),
                dead_letter_address: Some("dla".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
    let queue = context
        .create_queue("orders", "orders.q", None, false, false)
        .unwrap();
    let dead = context.create_queue("dla", "dla.q", None, false, false).unwrap();
    let consumer = CollectingConsumer::new();
    queue.add_consumer(consumer.clone()).unwrap();

    let mut tx = Transaction::new(&context).unwrap();
    tx.add_message(Message::new("orders", "pay")).unwrap();
    tx.commit().unwrap();

    queue.cancel_references(consumer.take()).unwrap();
    assert_eq!(consumer.ids().len(), 1);
    queue.cancel_references(consumer.take()).unwrap();

    assert_eq!(queue.message_count().unwrap(), 0);
    let dead_refs = dead.list(None).unwrap();
    assert_eq!(dead_refs.len(), 1);
    let copy = dead_refs[0].message();
    assert_eq!(copy.body(), b"pay");
    assert_eq!(
        copy.properties()
            .get(HDR_ORIGINAL_QUEUE)
            .and_then(|v| v.as_str()),
        Some("orders.q")
    );
}

#[test]
fn expired_messages_are_moved_to_the_expiry_address() {
    let (context, _clock) = manual_context();
    context
        .address_settings()
        .add_match(
            "a",
            AddressSettings {
                expiry_address: Some("expired".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
    let queue = context.create_queue("a", "q", None, false, false).unwrap();
    let expiry = context
        .create_queue("expired", "expired.q", None, false, false)
        .unwrap();

    let mut tx = Transaction::new(&context).unwrap();
    tx.add_message(Message::new("a", "old").expiration(T0 - 1)).unwrap();
    tx.add_message(Message::new("a", "fresh").expiration(T0 + 60_000))
        .unwrap();
    tx.commit().unwrap();

    assert_eq!(queue.expire_references().unwrap(), 1);
    assert_eq!(queue.message_count().unwrap(), 1);
    assert_eq!(expiry.message_count().unwrap(), 1);
}

#[test]
fn expired_references_are_skipped_during_delivery() {
    let (context, _clock) = manual_context();
    let queue = context.create_queue("a", "q", None, false, false).unwrap();
    let mut tx = Transaction::new(&context).unwrap();
    tx.add_message(Message::new("a", "old").expiration(T0 - 1)).unwrap();
    tx.add_message(Message::new("a", "live")).unwrap();
    tx.commit().unwrap();

    let consumer = CollectingConsumer::new();
    queue.add_consumer(consumer.clone()).unwrap();
    let received = consumer.take();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].message().body(), b"live");
    assert_eq!(queue.delivering_count(), 1);
}

#[test]
fn management_operations() {
    let (context, _clock) = manual_context();
    let queue = context.create_queue("a", "q", None, false, false).unwrap();
    let moved = context.create_queue("b", "b.q", None, false, false).unwrap();

    let mut tx = Transaction::new(&context).unwrap();
    for (n, colour) in ["red", "blue", "red", "green"].iter().enumerate() {
        tx.add_message(Message::new("a", format!("m{n}")).property("colour", *colour))
            .unwrap();
    }
    tx.commit().unwrap();

    let ids: Vec<u64> = queue
        .list(None)
        .unwrap()
        .iter()
        .map(|r| r.message_id())
        .collect();
    assert_eq!(ids.len(), 4);

    let red = Filter::parse("colour = 'red'").unwrap();
    assert_eq!(queue.list(Some(&red)).unwrap().len(), 2);
    assert_eq!(queue.delete_matching_references(Some(&red)).unwrap(), 2);
    assert_eq!(queue.message_count().unwrap(), 2);

    assert!(queue.change_message_priority(ids[3], 9).unwrap());
    let head = queue.list(None).unwrap();
    assert_eq!(head[0].message_id(), ids[3]);
    assert_eq!(head[0].message().get_priority(), 4);

    assert!(queue.move_message(ids[1], "b").unwrap());
    assert!(!queue.move_message(ids[1], "b").unwrap());
    assert_eq!(moved.message_count().unwrap(), 1);

    assert!(queue.get_reference(ids[3]).unwrap().is_some());
    assert!(queue.delete_reference(ids[3]).unwrap());
    assert_eq!(queue.message_count().unwrap(), 0);
    assert_eq!(queue.delete_all_references().unwrap(), 0);
}

#[test]
fn acknowledge_releases_the_message() {
    let (context, _clock) = manual_context();
    let queue = context.create_queue("a", "q", None, false, false).unwrap();
    let consumer = CollectingConsumer::new();
    queue.add_consumer(consumer.clone()).unwrap();

    let mut tx = Transaction::new(&context).unwrap();
    tx.add_message(Message::new("a", "x")).unwrap();
    tx.commit().unwrap();

    let delivered = consumer.take();
    assert!(queue.size_bytes() > 0);
    queue.acknowledge(&delivered[0]).unwrap();
    assert_eq!(delivered[0].state(), ReferenceState::Acknowledged);
    assert_eq!(delivered[0].handle().ref_count(), 0);
    assert_eq!(queue.delivering_count(), 0);
    assert_eq!(queue.size_bytes(), 0);
}
