use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::frame::Frame;

/// Open transactions of one connection, each an ordered buffer of frames.
#[derive(Debug, Default)]
pub struct TxStore {
    transactions: HashMap<String, Vec<Frame>>,
}

impl TxStore {
    pub fn new() -> TxStore {
        TxStore::default()
    }

    /// Forgets every open transaction.
    pub fn init(&mut self) {
        self.transactions.clear();
    }

    pub fn begin(&mut self, tx: &str) -> Result<()> {
        if self.transactions.contains_key(tx) {
            return Err(Error::TransactionInProgress(tx.to_owned()));
        }
        self.transactions.insert(tx.to_owned(), Vec::new());
        Ok(())
    }

    /// Buffers `frame` in `tx`, without its transaction header.
    pub fn add(&mut self, tx: &str, mut frame: Frame) -> Result<()> {
        let frames = self
            .transactions
            .get_mut(tx)
            .ok_or_else(|| Error::TransactionUnknown(tx.to_owned()))?;
        frame.headers.remove("transaction");
        frames.push(frame);
        Ok(())
    }

    /// Closes `tx` and hands back its frames in the order they were added.
    /// The transaction is gone whatever the caller then does with them.
    pub fn commit(&mut self, tx: &str) -> Result<Vec<Frame>> {
        self.transactions
            .remove(tx)
            .ok_or_else(|| Error::TransactionUnknown(tx.to_owned()))
    }

    pub fn abort(&mut self, tx: &str) -> Result<()> {
        self.transactions
            .remove(tx)
            .map(|_| ())
            .ok_or_else(|| Error::TransactionUnknown(tx.to_owned()))
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}
