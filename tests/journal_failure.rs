use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use courier::file::{NioSequentialFileFactory, SequentialFile, SequentialFileFactory};
use courier::journal::record::{scan_file, RecordType};
use courier::persistence::JournalStorageManager;
use courier::{Broker, Configuration, Error, Message, Result, ServerContext, ServerControl, Xid};
use tempfile::{tempdir, TempDir};

/// File factory whose files fail the next `failures` writes.
struct FailingFiles {
    inner: NioSequentialFileFactory,
    failures: Arc<AtomicUsize>,
}

struct FailingFile {
    inner: Box<dyn SequentialFile>,
    failures: Arc<AtomicUsize>,
}

impl SequentialFile for FailingFile {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn open(&mut self) -> Result<()> {
        self.inner.open()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn fill(&mut self, position: u64, len: u64) -> Result<()> {
        self.inner.fill(position, len)
    }

    fn position(&self) -> u64 {
        self.inner.position()
    }

    fn set_position(&mut self, position: u64) -> Result<()> {
        self.inner.set_position(position)
    }

    fn write(&mut self, bytes: &[u8], sync: bool) -> Result<()> {
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(Error::Io(io::Error::new(io::ErrorKind::Other, "disk full")));
        }
        self.inner.write(bytes, sync)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.inner.read(buf)
    }

    fn sync(&mut self) -> Result<()> {
        self.inner.sync()
    }

    fn size(&self) -> Result<u64> {
        self.inner.size()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

impl SequentialFileFactory for FailingFiles {
    fn create_file(&self, name: &str) -> Box<dyn SequentialFile> {
        Box::new(FailingFile {
            inner: self.inner.create_file(name),
            failures: Arc::clone(&self.failures),
        })
    }

    fn list_files(&self, extension: &str) -> Result<Vec<String>> {
        self.inner.list_files(extension)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.inner.delete_file(name)
    }

    fn directory(&self) -> &Path {
        self.inner.directory()
    }
}

fn config(dir: &TempDir) -> Configuration {
    let mut config = Configuration::with_data_dir(dir.path());
    config.journal_file_size = 128 * 1024;
    config.journal_buffer_size = 32 * 1024;
    config.journal_sync_transactional = true;
    config.journal_sync_non_transactional = true;
    config
}

/// A started broker whose message journal fails the next `failures` writes.
fn start(dir: &TempDir, failures: &Arc<AtomicUsize>) -> Broker {
    let config = config(dir);
    let message_files = Arc::new(FailingFiles {
        inner: NioSequentialFileFactory::new(&config.journal_directory),
        failures: Arc::clone(failures),
    });
    let binding_files = Arc::new(NioSequentialFileFactory::new(&config.bindings_directory));
    let storage =
        JournalStorageManager::with_file_factories(&config, message_files, binding_files)
            .expect("storage");
    let context = ServerContext::builder()
        .configuration(config)
        .storage(Arc::new(storage))
        .build()
        .expect("context");
    let broker = Broker::with_context(context);
    broker.start().expect("start");
    broker
}

fn bodies(broker: &Broker, queue: &str) -> Vec<Vec<u8>> {
    broker
        .queue(queue)
        .expect("lookup")
        .expect("queue")
        .list(None)
        .expect("list")
        .iter()
        .map(|r| r.message().body().to_vec())
        .collect()
}

/// Outcome records (commit or rollback) written for `tx_id`.
fn outcomes(config: &Configuration, tx_id: u64) -> Vec<RecordType> {
    let factory = NioSequentialFileFactory::new(&config.journal_directory);
    let mut found = Vec::new();
    for name in factory
        .list_files(&config.journal_file_extension)
        .expect("list")
    {
        let mut file = factory.create_file(&name);
        file.open().expect("open");
        let scanned = scan_file(file.as_mut()).expect("scan");
        file.close().expect("close");
        found.extend(
            scanned
                .records
                .iter()
                .filter(|r| r.tx_id == tx_id)
                .filter(|r| matches!(r.record_type, RecordType::Commit | RecordType::Rollback))
                .map(|r| r.record_type),
        );
    }
    found
}

#[test]
fn failed_journal_write_rolls_the_commit_back() {
    let dir = tempdir().expect("tempdir");
    let failures = Arc::new(AtomicUsize::new(0));
    let broker = start(&dir, &failures);
    let queue = broker.create_queue("a", "a.q", None, true).expect("queue");
    broker.send(Message::new("a", "first").durable(true)).expect("send");
    let head = queue.remove_first().expect("remove").expect("message");
    assert_eq!(queue.message_count().expect("count"), 0);

    failures.store(1, Ordering::SeqCst);
    let mut tx = broker.begin().expect("begin");
    let tx_id = tx.id();
    tx.add_acknowledgement(head).expect("ack");
    tx.add_message(Message::new("a", "second").durable(true))
        .expect("add");
    let err = tx.commit().expect_err("commit must fail");
    assert!(matches!(err, Error::Journal(_)), "unexpected error {err:?}");

    // The acknowledged message is available again and the send was dropped.
    assert_eq!(bodies(&broker, "a.q"), vec![b"first".to_vec()]);
    assert_eq!(queue.message_count().expect("count"), 1);
    broker.stop().expect("stop");

    assert_eq!(outcomes(&config(&dir), tx_id), vec![RecordType::Rollback]);
    let broker = start(&dir, &failures);
    assert_eq!(bodies(&broker, "a.q"), vec![b"first".to_vec()]);
}

#[test]
fn failed_xa_rollback_keeps_the_branch_in_doubt() {
    let dir = tempdir().expect("tempdir");
    let failures = Arc::new(AtomicUsize::new(0));
    let broker = start(&dir, &failures);
    broker.create_queue("a", "a.q", None, true).expect("queue");
    let xid = Xid::new(1, b"gtx".to_vec(), b"b1".to_vec());
    let tx = broker.begin_xa(xid.clone()).expect("begin");
    tx.lock()
        .expect("lock")
        .add_message(Message::new("a", "maybe").durable(true))
        .expect("add");
    broker.xa_prepare(&xid).expect("prepare");

    failures.store(1, Ordering::SeqCst);
    let err = broker.xa_rollback(&xid).expect_err("rollback must fail");
    assert!(matches!(err, Error::Journal(_)), "unexpected error {err:?}");
    assert_eq!(broker.prepared_transactions().expect("xids"), vec![xid.clone()]);

    broker.xa_rollback(&xid).expect("rollback");
    assert!(broker.prepared_transactions().expect("xids").is_empty());
    assert!(bodies(&broker, "a.q").is_empty());
}
