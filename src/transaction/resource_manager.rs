use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::info;

use super::{Transaction, TransactionState, Xid};
use crate::{Error, Result};

pub type SharedTransaction = Arc<Mutex<Transaction>>;

/// Registry of XA transaction branches, including in-doubt (prepared)
/// ones recovered from the journal.
#[derive(Default)]
pub struct ResourceManager {
    transactions: Mutex<HashMap<Xid, SharedTransaction>>,
    heuristic_committed: Mutex<Vec<Xid>>,
    heuristic_rolled_back: Mutex<Vec<Xid>>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an XA transaction under its xid.
    ///
    /// # Errors
    ///
    /// - `Error::IllegalState`: the transaction has no xid
    /// - `Error::XidExists`: the xid is already registered
    pub fn put(&self, tx: Transaction) -> Result<SharedTransaction> {
        let xid = tx
            .xid()
            .cloned()
            .ok_or_else(|| Error::illegal_state(format!("transaction {} has no xid", tx.id())))?;
        let mut transactions = self.transactions.lock().map_err(Error::poisoned)?;
        if transactions.contains_key(&xid) {
            return Err(Error::XidExists(xid.to_string()));
        }
        let shared = Arc::new(Mutex::new(tx));
        transactions.insert(xid, Arc::clone(&shared));
        Ok(shared)
    }

    pub fn get(&self, xid: &Xid) -> Result<Option<SharedTransaction>> {
        Ok(self
            .transactions
            .lock()
            .map_err(Error::poisoned)?
            .get(xid)
            .cloned())
    }

    pub fn remove(&self, xid: &Xid) -> Result<Option<SharedTransaction>> {
        Ok(self.transactions.lock().map_err(Error::poisoned)?.remove(xid))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.transactions.lock().map_err(Error::poisoned)?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Xids of in-doubt transactions.
    pub fn prepared_transactions(&self) -> Result<Vec<Xid>> {
        let transactions: Vec<(Xid, SharedTransaction)> = self
            .transactions
            .lock()
            .map_err(Error::poisoned)?
            .iter()
            .map(|(xid, tx)| (xid.clone(), Arc::clone(tx)))
            .collect();
        let mut prepared = Vec::new();
        for (xid, tx) in transactions {
            if tx.lock().map_err(Error::poisoned)?.state() == TransactionState::Prepared {
                prepared.push(xid);
            }
        }
        Ok(prepared)
    }

    /// Administrative commit of an in-doubt transaction.
    pub fn commit_prepared(&self, xid: &Xid) -> Result<()> {
        let tx = self.find_prepared(xid)?;
        tx.lock().map_err(Error::poisoned)?.commit()?;
        self.remove(xid)?;
        info!("heuristically committed transaction {xid}");
        self.heuristic_committed
            .lock()
            .map_err(Error::poisoned)?
            .push(xid.clone());
        Ok(())
    }

    /// Administrative rollback of an in-doubt transaction.
    pub fn rollback_prepared(&self, xid: &Xid) -> Result<()> {
        let tx = self.find_prepared(xid)?;
        tx.lock().map_err(Error::poisoned)?.rollback()?;
        self.remove(xid)?;
        info!("heuristically rolled back transaction {xid}");
        self.heuristic_rolled_back
            .lock()
            .map_err(Error::poisoned)?
            .push(xid.clone());
        Ok(())
    }

    pub fn heuristic_committed_transactions(&self) -> Result<Vec<Xid>> {
        Ok(self
            .heuristic_committed
            .lock()
            .map_err(Error::poisoned)?
            .clone())
    }

    pub fn heuristic_rolled_back_transactions(&self) -> Result<Vec<Xid>> {
        Ok(self
            .heuristic_rolled_back
            .lock()
            .map_err(Error::poisoned)?
            .clone())
    }

    /// The branch stays registered until its outcome is on disk.
    fn find_prepared(&self, xid: &Xid) -> Result<SharedTransaction> {
        let tx = self
            .transactions
            .lock()
            .map_err(Error::poisoned)?
            .get(xid)
            .cloned()
            .ok_or_else(|| Error::TransactionNotFound(xid.to_string()))?;
        if tx.lock().map_err(Error::poisoned)?.state() != TransactionState::Prepared {
            return Err(Error::illegal_state(format!(
                "transaction {xid} is not prepared"
            )));
        }
        Ok(tx)
    }
}
