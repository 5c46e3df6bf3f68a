//! Paging: spilling messages for full addresses to disk and bringing them
//! back.
//!
//! # Design
//!
//! - Each address has a `PagingStore` tracking the bytes of its routed,
//!   unreleased messages and owning its page files
//! - `admit` decides per message: route it, page it, drop it, or refuse it
//!   with `Error::AddressFull`, following the address-full policy
//! - Depaging reads the oldest page and routes its messages through the
//!   post office in one forced journal transaction that also records a
//!   last-page marker; the page file is deleted and the marker cleared only
//!   after that transaction commits
//! - Messages paged inside a transaction are skipped until their
//!   page-transaction record is known to be committed
//!
//! On restart a marker whose page file still exists means the page was
//! already delivered: the file is deleted without depaging it again.

mod page;
mod store;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use log::{debug, info, warn};

use crate::message::Message;
use crate::persistence::{LastPageRecord, PageTransactionInfo};
use crate::server::ServerContext;
use crate::settings::AddressFullPolicy;
use crate::transaction::{Transaction, TransactionSynchronization};
use crate::{Error, Result};

pub use page::PagedMessage;
pub use store::PagingStore;

/// What happens to a message sent to an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Route,
    Page,
    Drop,
}

struct PageTransactionEntry {
    info: PageTransactionInfo,
    /// Messages of the transaction not depaged yet.
    remaining: u32,
}

pub struct PagingManager {
    context: Weak<ServerContext>,
    directory: PathBuf,
    started: AtomicBool,
    stores: RwLock<HashMap<String, Arc<PagingStore>>>,
    page_transactions: Mutex<HashMap<u64, PageTransactionEntry>>,
    depage_lock: Mutex<()>,
}

impl PagingManager {
    pub fn new(context: Weak<ServerContext>, directory: impl Into<PathBuf>) -> Self {
        Self {
            context,
            directory: directory.into(),
            started: AtomicBool::new(false),
            stores: RwLock::new(HashMap::new()),
            page_transactions: Mutex::new(HashMap::new()),
            depage_lock: Mutex::new(()),
        }
    }

    /// Open the paging directory and recover the stores found in it.
    pub fn start(&self) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            return Ok(());
        }
        fs::create_dir_all(&self.directory)?;
        let mut recovered = 0;
        for entry in fs::read_dir(&self.directory)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(address) = entry.file_name().to_str().and_then(decode_address) else {
                warn!("ignoring unexpected paging directory {}", entry.path().display());
                continue;
            };
            self.open_store(&address)?;
            recovered += 1;
        }
        self.started.store(true, Ordering::SeqCst);
        debug!(
            "paging manager started in {} with {recovered} stores",
            self.directory.display()
        );
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let stores: Vec<Arc<PagingStore>> = self
            .stores
            .write()
            .map_err(Error::poisoned)?
            .drain()
            .map(|(_, store)| store)
            .collect();
        for store in stores {
            store.sync()?;
        }
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// The store for `address`, created on first use.
    ///
    /// # Errors
    ///
    /// - `Error::NotStarted`: the manager is not started
    pub fn get_page_store(&self, address: &str) -> Result<Arc<PagingStore>> {
        if !self.is_started() {
            return Err(Error::NotStarted);
        }
        if let Some(store) = self.stores.read().map_err(Error::poisoned)?.get(address) {
            return Ok(Arc::clone(store));
        }
        self.open_store(address)
    }

    fn open_store(&self, address: &str) -> Result<Arc<PagingStore>> {
        let mut stores = self.stores.write().map_err(Error::poisoned)?;
        if let Some(store) = stores.get(address) {
            return Ok(Arc::clone(store));
        }
        let settings = self.context()?.address_settings().get_match(address)?;
        let store = Arc::new(PagingStore::open(
            address,
            self.directory.join(encode_address(address)),
            settings.page_size_bytes(),
        )?);
        stores.insert(address.to_string(), Arc::clone(&store));
        Ok(store)
    }

    pub fn is_paging(&self, address: &str) -> Result<bool> {
        if !self.is_started() {
            return Ok(false);
        }
        Ok(self.get_page_store(address)?.is_paging())
    }

    /// Decide what to do with `message` given its address's size and
    /// full policy.
    ///
    /// # Errors
    ///
    /// - `Error::AddressFull`: the address is full and its policy blocks
    pub fn admit(&self, message: &Message) -> Result<Admission> {
        if !self.is_started() {
            return Ok(Admission::Route);
        }
        let address = message.address();
        let store = self.get_page_store(address)?;
        if store.is_paging() {
            return Ok(Admission::Page);
        }
        let settings = self.context()?.address_settings().get_match(address)?;
        let max = settings.max_size_bytes();
        if max < 0 || store.address_size() + message.encode_size() as i64 <= max {
            return Ok(Admission::Route);
        }
        match settings.address_full_policy() {
            AddressFullPolicy::Page => {
                store.start_paging();
                Ok(Admission::Page)
            }
            AddressFullPolicy::Drop => {
                warn!(
                    "address {address} is full ({} of {max} bytes), dropping message {}",
                    store.address_size(),
                    message.id()
                );
                Ok(Admission::Drop)
            }
            AddressFullPolicy::Block => Err(Error::AddressFull(address.to_string())),
        }
    }

    /// Append `message` to its address's current page.
    pub fn page(&self, message: &Message, tx_id: u64) -> Result<()> {
        let store = self.get_page_store(message.address())?;
        store.page(&PagedMessage {
            tx_id,
            scheduled_delivery_time: message.get_scheduled_delivery_time().unwrap_or(0),
            message: message.clone(),
        })?;
        if tx_id == 0 {
            store.sync()?;
        }
        Ok(())
    }

    pub fn add_size(&self, address: &str, delta: i64) -> Result<()> {
        if self.is_started() {
            self.get_page_store(address)?.add_size(delta);
        }
        Ok(())
    }

    /// The last reference to `message` is gone: release its bytes and
    /// schedule a depage if the address dropped below its limit.
    pub fn message_done(&self, message: &Message) -> Result<()> {
        if !self.is_started() {
            return Ok(());
        }
        let address = message.address();
        let store = self.get_page_store(address)?;
        store.add_size(-(message.encode_size() as i64));
        if store.is_paging() && self.below_limit(&store)? {
            let context = self.context()?;
            let weak = self.context.clone();
            let address = address.to_string();
            context
                .scheduler()
                .schedule(context.clock().now_millis(), move || {
                    if let Some(context) = weak.upgrade() {
                        if let Err(err) = context.paging().check_depage(&address) {
                            warn!("depage of {address} failed: {err}");
                        }
                    }
                })?;
        }
        Ok(())
    }

    fn below_limit(&self, store: &PagingStore) -> Result<bool> {
        let max = self
            .context()?
            .address_settings()
            .get_match(store.address())?
            .max_size_bytes();
        Ok(max < 0 || store.address_size() < max)
    }

    /// Depage until the address is full again or out of pages. Returns the
    /// number of messages routed.
    pub fn check_depage(&self, address: &str) -> Result<usize> {
        let store = self.get_page_store(address)?;
        let mut routed = 0;
        while store.is_paging() && self.below_limit(&store)? {
            match self.depage(address)? {
                Some(count) => routed += count,
                None => break,
            }
        }
        Ok(routed)
    }

    /// Depage the oldest page of `address`. Returns `None` when there is no
    /// page, or another depage is running.
    pub fn depage(&self, address: &str) -> Result<Option<usize>> {
        let Ok(_guard) = self.depage_lock.try_lock() else {
            return Ok(None);
        };
        let store = self.get_page_store(address)?;
        let Some(page_id) = store.first_page_id()? else {
            return Ok(None);
        };
        let entries = store.read_page(page_id)?;
        self.on_depage(page_id, &store, entries).map(Some)
    }

    /// Route a page's messages back into queues in one transaction.
    pub fn on_depage(
        &self,
        page_id: u32,
        store: &Arc<PagingStore>,
        entries: Vec<PagedMessage>,
    ) -> Result<usize> {
        let context = self.context()?;
        let storage = context.storage();
        let mut tx = Transaction::new(&context)?;
        tx.force_transactional();

        let record = LastPageRecord {
            record_id: storage.generate_unique_id()?,
            address: store.address().to_string(),
            page_id,
        };
        storage.store_last_page(tx.id(), &record)?;
        tx.mark_journal_open();

        let mut consumed: HashMap<u64, u32> = HashMap::new();
        let mut routed = 0;
        {
            let page_transactions = self.page_transactions.lock().map_err(Error::poisoned)?;
            for entry in entries {
                if entry.tx_id != 0 {
                    if !page_transactions.contains_key(&entry.tx_id) {
                        debug!(
                            "skipping paged message {} of uncommitted transaction {}",
                            entry.message.id(),
                            entry.tx_id
                        );
                        continue;
                    }
                    *consumed.entry(entry.tx_id).or_default() += 1;
                }
                tx.add_depaged_message(entry.message)?;
                routed += 1;
            }
            for (tx_id, count) in &consumed {
                if let Some(page_tx) = page_transactions.get(tx_id) {
                    if page_tx.remaining <= *count {
                        storage.delete_page_transaction(tx.id(), page_tx.info.record_id)?;
                    }
                }
            }
        }

        tx.add_synchronization(Arc::new(PageCompletion {
            store: Arc::clone(store),
            page_id,
            last_page_record: record.record_id,
            context: self.context.clone(),
        }));
        tx.commit()?;

        let mut page_transactions = self.page_transactions.lock().map_err(Error::poisoned)?;
        for (tx_id, count) in consumed {
            let done = match page_transactions.get_mut(&tx_id) {
                Some(entry) => {
                    entry.remaining = entry.remaining.saturating_sub(count);
                    entry.remaining == 0
                }
                None => false,
            };
            if done {
                page_transactions.remove(&tx_id);
            }
        }
        info!(
            "depaged {routed} messages from page {page_id} of address {}",
            store.address()
        );
        Ok(routed)
    }

    /// A committed transaction's paged messages may now be depaged.
    pub fn add_page_transaction(&self, info: PageTransactionInfo) -> Result<()> {
        self.page_transactions
            .lock()
            .map_err(Error::poisoned)?
            .insert(
                info.tx_id,
                PageTransactionEntry {
                    remaining: info.message_count,
                    info,
                },
            );
        Ok(())
    }

    pub fn page_transaction(&self, tx_id: u64) -> Result<Option<PageTransactionInfo>> {
        Ok(self
            .page_transactions
            .lock()
            .map_err(Error::poisoned)?
            .get(&tx_id)
            .map(|entry| entry.info))
    }

    /// Finish depages interrupted by a crash: a marked page that still
    /// exists was already delivered and is deleted.
    pub(crate) fn recover_last_pages(&self, records: Vec<LastPageRecord>) -> Result<()> {
        let context = self.context()?;
        for record in records {
            let store = self.get_page_store(&record.address)?;
            if store.has_page(record.page_id)? {
                info!(
                    "page {} of address {} was depaged before a crash, deleting it",
                    record.page_id, record.address
                );
                store.delete_page(record.page_id)?;
            }
            context.storage().clear_last_page(record.record_id)?;
        }
        Ok(())
    }

    /// Addresses with a store, sorted.
    pub fn addresses(&self) -> Result<Vec<String>> {
        let mut addresses: Vec<String> = self
            .stores
            .read()
            .map_err(Error::poisoned)?
            .keys()
            .cloned()
            .collect();
        addresses.sort();
        Ok(addresses)
    }

    fn context(&self) -> Result<Arc<ServerContext>> {
        self.context
            .upgrade()
            .ok_or_else(|| Error::illegal_state("paging manager outlived its server"))
    }
}

/// Deletes a depaged page and its marker once the depage commits.
struct PageCompletion {
    store: Arc<PagingStore>,
    page_id: u32,
    last_page_record: u64,
    context: Weak<ServerContext>,
}

impl TransactionSynchronization for PageCompletion {
    fn after_commit(&self, _tx: &Transaction) -> Result<()> {
        self.store.delete_page(self.page_id)?;
        if let Some(context) = self.context.upgrade() {
            context.storage().clear_last_page(self.last_page_record)?;
        }
        Ok(())
    }
}

/// Directory name for an address: bytes outside `[A-Za-z0-9._-]` are
/// percent-encoded.
fn encode_address(address: &str) -> String {
    let mut out = String::with_capacity(address.len());
    for byte in address.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn decode_address(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
