use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};

use log::{debug, info};

use super::page::{self, Page, PagedMessage};
use crate::{Error, Result};

struct StoreState {
    /// Page currently written to.
    current: Option<Page>,
    /// Page ids on disk, including the current one.
    pages: BTreeSet<u32>,
    next_page_id: u32,
}

/// Paging state of one address: its in-memory size and its page files.
pub struct PagingStore {
    address: String,
    directory: PathBuf,
    page_size_bytes: u64,
    address_size: AtomicI64,
    paging: AtomicBool,
    state: Mutex<StoreState>,
}

impl PagingStore {
    /// Open the store, picking up page files left by a previous run. An
    /// address with pages on disk starts out paging. The directory is only
    /// created once the first page is written.
    pub fn open(address: &str, directory: PathBuf, page_size_bytes: u64) -> Result<Self> {
        let pages: BTreeSet<u32> = if directory.is_dir() {
            page::list_pages(&directory)?.into_iter().collect()
        } else {
            BTreeSet::new()
        };
        let next_page_id = pages.iter().next_back().map_or(1, |last| last + 1);
        let paging = !pages.is_empty();
        if paging {
            info!(
                "address {address} recovered {} page files, paging",
                pages.len()
            );
        }
        Ok(Self {
            address: address.to_string(),
            directory,
            page_size_bytes: page_size_bytes.max(1),
            address_size: AtomicI64::new(0),
            paging: AtomicBool::new(paging),
            state: Mutex::new(StoreState {
                current: None,
                pages,
                next_page_id,
            }),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Bytes of routed messages not yet released.
    pub fn address_size(&self) -> i64 {
        self.address_size.load(Ordering::SeqCst)
    }

    /// Returns the new size.
    pub fn add_size(&self, delta: i64) -> i64 {
        self.address_size.fetch_add(delta, Ordering::SeqCst) + delta
    }

    pub fn is_paging(&self) -> bool {
        self.paging.load(Ordering::SeqCst)
    }

    /// Returns false if the store was already paging.
    pub fn start_paging(&self) -> bool {
        let started = !self.paging.swap(true, Ordering::SeqCst);
        if started {
            info!(
                "address {} is full at {} bytes, paging",
                self.address,
                self.address_size()
            );
        }
        started
    }

    pub fn page(&self, entry: &PagedMessage) -> Result<()> {
        let mut state = self.lock()?;
        if state.current.is_none() {
            let id = state.next_page_id;
            state.next_page_id += 1;
            fs::create_dir_all(&self.directory)?;
            state.current = Some(Page::open(&self.directory, id)?);
            state.pages.insert(id);
            debug!("address {} opened page {id}", self.address);
        }
        let roll = match state.current.as_mut() {
            Some(current) => {
                current.write(entry)?;
                current.size() >= self.page_size_bytes
            }
            None => false,
        };
        if roll {
            if let Some(mut full) = state.current.take() {
                full.sync()?;
                debug!("address {} closed page {}", self.address, full.id());
            }
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        if let Some(current) = self.lock()?.current.as_mut() {
            current.sync()?;
        }
        Ok(())
    }

    pub fn number_of_pages(&self) -> Result<usize> {
        Ok(self.lock()?.pages.len())
    }

    pub fn has_page(&self, page_id: u32) -> Result<bool> {
        Ok(self.lock()?.pages.contains(&page_id))
    }

    pub fn first_page_id(&self) -> Result<Option<u32>> {
        Ok(self.lock()?.pages.iter().next().copied())
    }

    /// Read a page's entries. If it is the page being written, it is closed
    /// first so later messages go to a new page.
    pub fn read_page(&self, page_id: u32) -> Result<Vec<PagedMessage>> {
        {
            let mut state = self.lock()?;
            if state.current.as_ref().map(Page::id) == Some(page_id) {
                if let Some(mut current) = state.current.take() {
                    current.sync()?;
                }
            }
        }
        page::read_page(&self.directory, page_id)
    }

    /// Delete a page file. Paging stops once no page is left.
    pub fn delete_page(&self, page_id: u32) -> Result<()> {
        let mut state = self.lock()?;
        if state.current.as_ref().map(Page::id) == Some(page_id) {
            state.current = None;
        }
        page::delete_page(&self.directory, page_id)?;
        state.pages.remove(&page_id);
        if state.pages.is_empty() && self.paging.swap(false, Ordering::SeqCst) {
            info!("address {} has no more pages, stopped paging", self.address);
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| Error::Corrupt("paging store lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use tempfile::TempDir;

    fn entry(body: &str) -> PagedMessage {
        PagedMessage {
            tx_id: 0,
            scheduled_delivery_time: 0,
            message: Message::new("a", body),
        }
    }

    #[test]
    fn rolls_pages_and_stops_paging_when_empty() {
        let dir = TempDir::new().unwrap();
        let store = PagingStore::open("a", dir.path().join("a"), 64).unwrap();
        assert!(!store.is_paging());
        assert!(store.start_paging());
        assert!(!store.start_paging());

        for n in 0..4 {
            store.page(&entry(&format!("message body {n} padded out"))).unwrap();
        }
        let pages = store.number_of_pages().unwrap();
        assert!(pages >= 2, "expected rolled pages, got {pages}");

        let mut read = 0;
        while let Some(id) = store.first_page_id().unwrap() {
            read += store.read_page(id).unwrap().len();
            store.delete_page(id).unwrap();
        }
        assert_eq!(read, 4);
        assert!(!store.is_paging());
    }

    #[test]
    fn recovers_pages_on_open() {
        let dir = TempDir::new().unwrap();
        {
            let store = PagingStore::open("a", dir.path().to_path_buf(), 1 << 20).unwrap();
            store.start_paging();
            store.page(&entry("kept")).unwrap();
            store.sync().unwrap();
        }
        let store = PagingStore::open("a", dir.path().to_path_buf(), 1 << 20).unwrap();
        assert!(store.is_paging());
        assert_eq!(store.first_page_id().unwrap(), Some(1));
        store.page(&entry("next")).unwrap();
        assert!(store.has_page(2).unwrap());
        assert_eq!(store.read_page(1).unwrap().len(), 1);
    }
}
