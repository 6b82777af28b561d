//! Buffered write batches
//!
//! A [`Transaction`] records sets and deletes and replays them through the
//! store, in order, on [`Transaction::commit`]. It is a batching convenience,
//! not an atomic unit: if an operation fails mid-commit, the operations
//! before it stay applied and the error is returned.

use super::{SetOptions, Store};
use crate::KvError;
use crate::core::{Key, Payload};
use tracing::debug;

enum TxOp {
    Set {
        key: Key,
        payload: Payload,
        options: SetOptions,
    },
    Delete {
        key: Key,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Pending,
    Committed,
    RolledBack,
}

/// Command buffer over a [`Store`]
pub struct Transaction<'a> {
    store: &'a Store,
    ops: Vec<TxOp>,
    state: TxState,
}

impl<'a> Transaction<'a> {
    pub(super) fn new(store: &'a Store) -> Self {
        Self {
            store,
            ops: Vec::new(),
            state: TxState::Pending,
        }
    }

    /// Buffer a set with default options
    pub fn set(
        &mut self,
        key: impl Into<Key>,
        payload: impl Into<Payload>,
    ) -> crate::Result<&mut Self> {
        self.set_with(key, payload, SetOptions::default())
    }

    pub fn set_with(
        &mut self,
        key: impl Into<Key>,
        payload: impl Into<Payload>,
        options: SetOptions,
    ) -> crate::Result<&mut Self> {
        self.ensure_pending()?;
        self.ops.push(TxOp::Set {
            key: key.into(),
            payload: payload.into(),
            options,
        });
        Ok(self)
    }

    pub fn delete(&mut self, key: impl Into<Key>) -> crate::Result<&mut Self> {
        self.ensure_pending()?;
        self.ops.push(TxOp::Delete { key: key.into() });
        Ok(self)
    }

    /// Number of buffered operations
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn is_finalized(&self) -> bool {
        self.state != TxState::Pending
    }

    /// Replay the buffer through the store. Returns the number of operations applied.
    pub fn commit(&mut self) -> crate::Result<usize> {
        self.ensure_pending()?;
        self.state = TxState::Committed;

        let ops = std::mem::take(&mut self.ops);
        let total = ops.len();
        for (applied, op) in ops.into_iter().enumerate() {
            let result = match op {
                TxOp::Set {
                    key,
                    payload,
                    options,
                } => self.store.set_with(key, payload, options),
                TxOp::Delete { key } => self.store.delete(key).map(|_| ()),
            };
            if let Err(e) = result {
                return Err(KvError::Transaction(format!(
                    "commit failed after {applied} of {total} operations: {e}"
                )));
            }
        }

        debug!(operations = total, "Transaction committed");
        Ok(total)
    }

    /// Discard the buffer
    pub fn rollback(&mut self) -> crate::Result<()> {
        self.ensure_pending()?;
        self.state = TxState::RolledBack;
        let discarded = std::mem::take(&mut self.ops).len();
        debug!(discarded, "Transaction rolled back");
        Ok(())
    }

    fn ensure_pending(&self) -> crate::Result<()> {
        match self.state {
            TxState::Pending => Ok(()),
            TxState::Committed => Err(KvError::Transaction(
                "transaction already committed".to_string(),
            )),
            TxState::RolledBack => Err(KvError::Transaction(
                "transaction already rolled back".to_string(),
            )),
        }
    }
}
