//! Nested (child) write transactions.
//!
//! This engine gives every write transaction a single, flat dirty-page and
//! catalog space rather than forking a separate page directory per nesting
//! level, so a nested transaction is implemented as a savepoint: beginning
//! one records the parent's catalog, dirty-page set, and next-pgno cursor;
//! aborting restores them exactly; committing lets the (already-applied)
//! changes stand. This matches the table-descriptor-and-dbi_state copy the
//! nesting rule describes, without requiring a second page space.

use crate::error::{PageId, Result};
use crate::meta::DbInfo;
use crate::txn::{ModeData, Transaction, Write};
use std::collections::{HashMap, HashSet};

struct Savepoint {
    databases: HashMap<Option<String>, DbInfo>,
    dirty_pages: HashSet<PageId>,
    allocated_len: usize,
    next_pgno: PageId,
}

/// A nested transaction operating within a parent write transaction.
///
/// Dropping a `NestedTransaction` without calling [`commit`](Self::commit)
/// aborts it, mirroring [`Transaction`]'s own drop-aborts behavior.
pub struct NestedTransaction<'env, 'parent> {
    parent: &'parent mut Transaction<'env, Write>,
    savepoint: Option<Savepoint>,
}

impl<'env, 'parent> std::fmt::Debug for NestedTransaction<'env, 'parent> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NestedTransaction").finish_non_exhaustive()
    }
}

impl<'env, 'parent> NestedTransaction<'env, 'parent> {
    pub(crate) fn new(parent: &'parent mut Transaction<'env, Write>) -> Result<Self> {
        let databases = parent.data.databases.clone();
        let (dirty_pages, allocated_len, next_pgno) = match &parent.mode_data {
            ModeData::Write { dirty, next_pgno, .. } => {
                (dirty.pages.keys().copied().collect(), dirty.allocated.len(), *next_pgno)
            }
            ModeData::Read { .. } => {
                unreachable!("NestedTransaction::new always receives a write transaction")
            }
        };
        Ok(Self {
            parent,
            savepoint: Some(Savepoint { databases, dirty_pages, allocated_len, next_pgno }),
        })
    }

    /// Keep the nested transaction's changes. They were already applied
    /// directly against the parent's in-memory state as they happened, so
    /// this only retires the savepoint without touching anything.
    pub fn commit(mut self) -> Result<()> {
        self.savepoint = None;
        Ok(())
    }

    /// Roll the parent back to the state it was in when this nested
    /// transaction began.
    pub fn abort(mut self) {
        self.rollback();
    }

    fn rollback(&mut self) {
        let Some(savepoint) = self.savepoint.take() else { return };
        self.parent.data.databases = savepoint.databases;
        if let ModeData::Write { dirty, next_pgno, .. } = &mut self.parent.mode_data {
            dirty.pages.retain(|id, _| savepoint.dirty_pages.contains(id));
            dirty.allocated.truncate(savepoint.allocated_len);
            *next_pgno = savepoint.next_pgno;
        }
    }
}

impl<'env, 'parent> Drop for NestedTransaction<'env, 'parent> {
    fn drop(&mut self) {
        if self.savepoint.is_some() {
            self.rollback();
        }
    }
}

/// Extension trait adding nested-transaction support to a write [`Transaction`].
pub trait NestedTransactionExt<'env> {
    /// Begin a nested transaction scoped to the remainder of this one.
    fn begin_nested(&mut self) -> Result<NestedTransaction<'env, '_>>;
}

impl<'env> NestedTransactionExt<'env> for Transaction<'env, Write> {
    fn begin_nested(&mut self) -> Result<NestedTransaction<'env, '_>> {
        NestedTransaction::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::env::EnvBuilder;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn aborted_nested_txn_discards_its_writes() {
        let dir = TempDir::new().unwrap();
        let env = Arc::new(EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap());

        let db: Database<String, String> = {
            let mut txn = env.write_txn().unwrap();
            let db = env.create_database(&mut txn, None).unwrap();
            db.put(&mut txn, "outer".to_string(), "1".to_string()).unwrap();
            txn.commit().unwrap();
            db
        };

        {
            let mut txn = env.write_txn().unwrap();
            {
                let nested = txn.begin_nested().unwrap();
                db.put(&mut txn, "inner".to_string(), "2".to_string()).unwrap();
                nested.abort();
            }
            txn.commit().unwrap();
        }

        let txn = env.read_txn().unwrap();
        assert_eq!(db.get(&txn, &"outer".to_string()).unwrap(), Some("1".to_string()));
        assert_eq!(db.get(&txn, &"inner".to_string()).unwrap(), None);
    }

    #[test]
    fn committed_nested_txn_keeps_its_writes() {
        let dir = TempDir::new().unwrap();
        let env = Arc::new(EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap());

        let db: Database<String, String> = {
            let mut txn = env.write_txn().unwrap();
            let db = env.create_database(&mut txn, None).unwrap();
            txn.commit().unwrap();
            db
        };

        {
            let mut txn = env.write_txn().unwrap();
            {
                let nested = txn.begin_nested().unwrap();
                db.put(&mut txn, "a".to_string(), "1".to_string()).unwrap();
                nested.commit().unwrap();
            }
            txn.commit().unwrap();
        }

        let txn = env.read_txn().unwrap();
        assert_eq!(db.get(&txn, &"a".to_string()).unwrap(), Some("1".to_string()));
    }

    #[test]
    fn dropping_nested_txn_without_commit_aborts() {
        let dir = TempDir::new().unwrap();
        let env = Arc::new(EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap());

        let db: Database<String, String> = {
            let mut txn = env.write_txn().unwrap();
            let db = env.create_database(&mut txn, None).unwrap();
            txn.commit().unwrap();
            db
        };

        {
            let mut txn = env.write_txn().unwrap();
            {
                let _nested = txn.begin_nested().unwrap();
                db.put(&mut txn, "a".to_string(), "1".to_string()).unwrap();
            }
            txn.commit().unwrap();
        }

        let txn = env.read_txn().unwrap();
        assert_eq!(db.get(&txn, &"a".to_string()).unwrap(), None);
    }
}
