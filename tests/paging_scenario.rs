use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use courier::queue::{Consumer, HandleStatus, MessageReference};
use courier::{
    AddressFullPolicy, AddressSettings, Broker, Configuration, Error, Message, Result,
    ServerControl,
};
use tempfile::{tempdir, TempDir};

const BODY: [u8; 120] = [b'x'; 120];

struct Grab(Mutex<Vec<Arc<MessageReference>>>);

impl Consumer for Grab {
    fn handle(&self, reference: &Arc<MessageReference>) -> Result<HandleStatus> {
        self.0.lock().expect("lock").push(Arc::clone(reference));
        Ok(HandleStatus::Handled)
    }
}

fn config(dir: &TempDir, policy: AddressFullPolicy) -> Configuration {
    let mut config = Configuration::with_data_dir(dir.path());
    config.journal_file_size = 256 * 1024;
    config.journal_buffer_size = 32 * 1024;
    config.address_settings.insert(
        "A".to_string(),
        AddressSettings {
            max_size_bytes: Some(1000),
            address_full_policy: Some(policy),
            ..AddressSettings::default()
        },
    );
    config
}

fn broker(config: Configuration) -> Broker {
    let broker = Broker::new(config).expect("broker");
    broker.start().expect("start");
    broker
}

fn red(n: u32) -> Message {
    Message::new("A", BODY.to_vec())
        .durable(true)
        .property("colour", "red")
        .property("n", n as i64)
}

fn sequence(reference: &MessageReference) -> i64 {
    reference
        .message()
        .properties()
        .get("n")
        .and_then(|v| v.as_i64())
        .expect("sequence property")
}

/// Send until the address pages, then `extra` more. Returns the total sent.
fn fill(broker: &Broker, extra: u32) -> u32 {
    let mut sent = 0;
    while !broker.is_paging("A").expect("paging") {
        broker.send(red(sent)).expect("send");
        sent += 1;
        assert!(sent < 1000, "address never started paging");
    }
    for _ in 0..extra {
        broker.send(red(sent)).expect("send");
        sent += 1;
    }
    sent
}

/// Acknowledge whatever the consumer holds until `expected` distinct
/// messages were seen.
fn drain(queue: &courier::Queue, grab: &Grab, expected: u32) -> BTreeSet<i64> {
    let mut seen = BTreeSet::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while seen.len() < expected as usize {
        assert!(
            Instant::now() < deadline,
            "only {} of {expected} messages delivered",
            seen.len()
        );
        let batch = std::mem::take(&mut *grab.0.lock().expect("lock"));
        if batch.is_empty() {
            thread::sleep(Duration::from_millis(5));
            continue;
        }
        for reference in batch {
            assert!(seen.insert(sequence(&reference)), "delivered twice");
            queue.acknowledge(&reference).expect("ack");
        }
    }
    seen
}

#[test]
fn paged_messages_are_delivered_exactly_once_after_acks() {
    let dir = tempdir().expect("tempdir");
    let broker = broker(config(&dir, AddressFullPolicy::Page));
    let reds = broker
        .create_queue("A", "A.red", Some("colour = 'red'"), true)
        .expect("queue");
    let blues = broker
        .create_queue("A", "A.blue", Some("colour = 'blue'"), true)
        .expect("queue");

    let sent = fill(&broker, 20);
    let in_memory = reds.message_count().expect("count") as u32;
    assert!(in_memory < sent, "nothing was paged");

    let grab = Arc::new(Grab(Mutex::new(Vec::new())));
    reds.add_consumer(grab.clone()).expect("consumer");
    let seen = drain(&reds, &grab, sent);

    assert_eq!(seen, (0..sent as i64).collect());
    assert_eq!(reds.message_count().expect("count"), 0);
    assert_eq!(blues.message_count().expect("count"), 0);
    let deadline = Instant::now() + Duration::from_secs(5);
    while broker.is_paging("A").expect("paging") {
        assert!(Instant::now() < deadline, "address kept paging");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn paged_messages_survive_restart() {
    let dir = tempdir().expect("tempdir");
    let sent = {
        let broker = broker(config(&dir, AddressFullPolicy::Page));
        broker
            .create_queue("A", "A.red", Some("colour = 'red'"), true)
            .expect("queue");
        let sent = fill(&broker, 10);
        broker.stop().expect("stop");
        sent
    };

    let broker = broker(config(&dir, AddressFullPolicy::Page));
    assert!(broker.is_paging("A").expect("paging"));
    let reds = broker.queue("A.red").expect("lookup").expect("queue");
    let grab = Arc::new(Grab(Mutex::new(Vec::new())));
    reds.add_consumer(grab.clone()).expect("consumer");
    let seen = drain(&reds, &grab, sent);
    assert_eq!(seen, (0..sent as i64).collect());
}

#[test]
fn block_policy_refuses_sends_to_a_full_address() {
    let dir = tempdir().expect("tempdir");
    let broker = broker(config(&dir, AddressFullPolicy::Block));
    let reds = broker
        .create_queue("A", "A.red", Some("colour = 'red'"), true)
        .expect("queue");

    let mut sent = 0;
    let refused = loop {
        match broker.send(red(sent)) {
            Ok(()) => sent += 1,
            Err(err) => break err,
        }
        assert!(sent < 1000, "address never filled");
    };
    assert!(matches!(refused, Error::AddressFull(ref address) if address == "A"));
    assert!(!broker.is_paging("A").expect("paging"));
    assert_eq!(reds.message_count().expect("count"), sent as usize);

    // Room again once a message is consumed.
    let head = reds.remove_first().expect("remove").expect("message");
    reds.acknowledge(&head).expect("ack");
    broker.send(red(sent)).expect("send after ack");
}

#[test]
fn drop_policy_discards_sends_to_a_full_address() {
    let dir = tempdir().expect("tempdir");
    let broker = broker(config(&dir, AddressFullPolicy::Drop));
    let reds = broker
        .create_queue("A", "A.red", Some("colour = 'red'"), true)
        .expect("queue");
    for n in 0..50 {
        broker.send(red(n)).expect("send");
    }
    let kept = reds.message_count().expect("count");
    assert!(kept > 0 && kept < 50);
    assert!(!broker.is_paging("A").expect("paging"));
}

#[test]
fn rejected_and_unpaged_addresses_leave_no_paging_state() {
    let dir = tempdir().expect("tempdir");
    let mut config = config(&dir, AddressFullPolicy::Page);
    config.require_destinations = true;
    let paging_dir = config.paging_directory.clone();
    let broker = broker(config);

    for n in 0..50 {
        let refused = broker
            .send(Message::new(format!("typo.{n}"), "lost"))
            .expect_err("unknown address");
        assert!(matches!(refused, Error::AddressDoesNotExist(_)));
    }
    assert_eq!(
        broker.context().address_settings().cached_len().expect("cache"),
        0
    );

    broker
        .context()
        .post_office()
        .add_destination("A", true)
        .expect("destination");
    let reds = broker
        .create_queue("A", "A.red", Some("colour = 'red'"), true)
        .expect("queue");
    broker.send(red(0)).expect("send");
    assert_eq!(reds.message_count().expect("count"), 1);
    assert_eq!(
        std::fs::read_dir(&paging_dir).expect("paging dir").count(),
        0,
        "no store directory before paging starts"
    );

    fill(&broker, 1);
    assert!(paging_dir.join("A").is_dir());
}
