//! Named-table catalog and per-transaction dbi handle state.
//!
//! The catalog is the MAIN table itself: table names are keys, serialized
//! `DbInfo` tree descriptors are values. `DbiState` tracks, per write
//! transaction, how a table handle got into that transaction's view so
//! `commit` knows which `tree_t`s actually need a fresh `mod_txnid` and
//! `dbi_close` can reject stale handles left over from an earlier
//! `dbi_open` generation.

use crate::btree::BTree;
use crate::comparator::LexicographicComparator;
use crate::error::{Error, PageId, Result};
use crate::meta::DbInfo;
use crate::txn::{Transaction, Write};
use bitflags::bitflags;

bitflags! {
    /// Per-txn state bits for a bound table handle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DbiState: u8 {
        /// The handle resolves to a table that exists in this txn's view.
        const VALID = 0x01;
        /// The table's root was created during this txn (no prior commit
        /// had it in the catalog).
        const FRESH = 0x02;
        /// The table was opened with `CREATE` and did not previously exist.
        const CREAT = 0x04;
        /// The table's `tree_t` was modified by this txn and needs its
        /// `mod_txnid` bumped and the catalog entry rewritten at commit.
        const DIRTY = 0x08;
        /// The handle was resolved against a catalog generation older than
        /// the environment's current one; reads/writes through it are
        /// rejected with `BadDbi`.
        const STALE = 0x10;
    }
}

impl DbiState {
    /// State for a handle bound to a table unchanged since its last commit.
    pub fn carried_unchanged() -> Self {
        DbiState::VALID
    }

    /// State for a handle whose table root/tree_t changed in this txn.
    pub fn modified() -> Self {
        DbiState::VALID | DbiState::DIRTY
    }

    /// State for a table newly created by `dbi_open(..., CREATE)` in this txn.
    pub fn new_in_txn() -> Self {
        DbiState::FRESH | DbiState::CREAT | DbiState::DIRTY
    }

    /// State for a handle whose catalog generation is behind the live one.
    pub fn reopened_stale() -> Self {
        DbiState::VALID | DbiState::STALE
    }
}

/// Catalog of named tables, stored as entries in the MAIN table.
pub struct Catalog;

impl Catalog {
    /// Store a table's descriptor in the catalog.
    pub fn put_database(txn: &mut Transaction<'_, Write>, name: &str, info: &DbInfo) -> Result<()> {
        let main_db = *txn.db_info(None)?;

        let key = name.as_bytes();
        let value = Self::serialize_db_info(info);

        let mut root = main_db.root;
        let mut updated_info = main_db;
        BTree::<LexicographicComparator>::insert(txn, &mut root, &mut updated_info, key, &value)?;

        if root != main_db.root || updated_info.entries != main_db.entries {
            updated_info.root = root;
            txn.update_db_info(None, updated_info)?;
        }

        Ok(())
    }

    /// Look up a table's descriptor by name.
    pub fn get_database<M: crate::txn::mode::Mode>(txn: &Transaction<'_, M>, name: &str) -> Result<Option<DbInfo>> {
        let main_db = txn.db_info(None)?;

        if main_db.root == PageId(0) {
            return Ok(None);
        }

        let key = name.as_bytes();
        match BTree::<LexicographicComparator>::search(txn, main_db.root, key)? {
            Some(value) => Ok(Some(Self::deserialize_db_info(&value)?)),
            None => Ok(None),
        }
    }

    /// List every named table in the catalog.
    pub fn list_databases<M: crate::txn::mode::Mode>(txn: &Transaction<'_, M>) -> Result<Vec<(String, DbInfo)>> {
        let main_db = txn.db_info(None)?;

        if main_db.root == PageId(0) {
            return Ok(Vec::new());
        }

        let mut databases = Vec::new();
        let mut stack = vec![(main_db.root, 0)];

        while let Some((page_id, index)) = stack.pop() {
            let page = txn.get_page(page_id)?;

            if page.header.flags.contains(crate::page::PageFlags::LEAF) {
                for i in index..page.header.num_keys as usize {
                    let node = page.node(i)?;
                    let key = node.key()?;
                    let value = node.value()?;

                    if let Ok(name) = String::from_utf8(key.to_vec()) {
                        if let Ok(info) = Self::deserialize_db_info(&value) {
                            databases.push((name, info));
                        }
                    }
                }
            } else {
                for i in (index..page.header.num_keys as usize).rev() {
                    let node = page.node(i)?;
                    let child_id = node.page_number()?;
                    stack.push((child_id, 0));
                }
            }
        }

        Ok(databases)
    }

    /// Remove a table's entry from the catalog (does not free its pages;
    /// callers must walk and free the table's own tree first).
    pub fn remove_database(txn: &mut Transaction<'_, Write>, name: &str) -> Result<bool> {
        let main_db = *txn.db_info(None)?;

        if main_db.root == PageId(0) {
            return Ok(false);
        }

        let key = name.as_bytes();
        let mut root = main_db.root;
        let mut updated_info = main_db;
        let result = BTree::<LexicographicComparator>::delete(txn, &mut root, &mut updated_info, key)?;
        let deleted = result.is_some();

        if root != main_db.root || deleted {
            updated_info.root = root;
            txn.update_db_info(None, updated_info)?;
        }

        Ok(deleted)
    }

    /// Serialize a `DbInfo` tree descriptor to its on-disk catalog-value form.
    pub fn serialize_db_info(info: &DbInfo) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&info.flags.to_le_bytes());
        buf.extend_from_slice(&info.depth.to_le_bytes());
        buf.extend_from_slice(&info.branch_pages.to_le_bytes());
        buf.extend_from_slice(&info.leaf_pages.to_le_bytes());
        buf.extend_from_slice(&info.overflow_pages.to_le_bytes());
        buf.extend_from_slice(&info.entries.to_le_bytes());
        buf.extend_from_slice(&info.root.0.to_le_bytes());
        buf.extend_from_slice(&info.last_key_page.0.to_le_bytes());
        buf.extend_from_slice(&info.sequence.to_le_bytes());
        buf.extend_from_slice(&info.mod_txnid.0.to_le_bytes());
        buf.extend_from_slice(&info.dupfix_size.to_le_bytes());
        buf
    }

    /// Deserialize a `DbInfo` tree descriptor from its catalog-value form.
    pub fn deserialize_db_info(data: &[u8]) -> Result<DbInfo> {
        const LEN: usize = 4 + 4 + 8 + 8 + 8 + 8 + 8 + 8 + 8 + 8 + 2;
        if data.len() < LEN {
            return Err(Error::Decoding("invalid DbInfo catalog entry".into()));
        }

        let mut off = 0;
        let read_u32 = |data: &[u8], off: &mut usize| {
            let v = u32::from_le_bytes(data[*off..*off + 4].try_into().unwrap());
            *off += 4;
            v
        };
        let read_u64 = |data: &[u8], off: &mut usize| {
            let v = u64::from_le_bytes(data[*off..*off + 8].try_into().unwrap());
            *off += 8;
            v
        };
        let read_u16 = |data: &[u8], off: &mut usize| {
            let v = u16::from_le_bytes(data[*off..*off + 2].try_into().unwrap());
            *off += 2;
            v
        };

        let flags = read_u32(data, &mut off);
        let depth = read_u32(data, &mut off);
        let branch_pages = read_u64(data, &mut off);
        let leaf_pages = read_u64(data, &mut off);
        let overflow_pages = read_u64(data, &mut off);
        let entries = read_u64(data, &mut off);
        let root = PageId(read_u64(data, &mut off));
        let last_key_page = PageId(read_u64(data, &mut off));
        let sequence = read_u64(data, &mut off);
        let mod_txnid = crate::error::TransactionId(read_u64(data, &mut off));
        let dupfix_size = read_u16(data, &mut off);

        Ok(DbInfo {
            flags,
            depth,
            branch_pages,
            leaf_pages,
            overflow_pages,
            entries,
            root,
            last_key_page,
            sequence,
            mod_txnid,
            dupfix_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_info_round_trips_through_the_catalog_encoding() {
        let info = DbInfo {
            flags: 0x42,
            depth: 3,
            branch_pages: 100,
            leaf_pages: 500,
            overflow_pages: 10,
            entries: 1000,
            root: PageId(42),
            last_key_page: PageId(7),
            sequence: 9,
            mod_txnid: crate::error::TransactionId(55),
            dupfix_size: 8,
        };

        let serialized = Catalog::serialize_db_info(&info);
        let deserialized = Catalog::deserialize_db_info(&serialized).unwrap();

        assert_eq!(info.flags, deserialized.flags);
        assert_eq!(info.depth, deserialized.depth);
        assert_eq!(info.branch_pages, deserialized.branch_pages);
        assert_eq!(info.leaf_pages, deserialized.leaf_pages);
        assert_eq!(info.overflow_pages, deserialized.overflow_pages);
        assert_eq!(info.entries, deserialized.entries);
        assert_eq!(info.root, deserialized.root);
        assert_eq!(info.last_key_page, deserialized.last_key_page);
        assert_eq!(info.sequence, deserialized.sequence);
        assert_eq!(info.mod_txnid, deserialized.mod_txnid);
        assert_eq!(info.dupfix_size, deserialized.dupfix_size);
    }

    #[test]
    fn dbi_state_transitions_match_their_names() {
        assert_eq!(DbiState::new_in_txn(), DbiState::FRESH | DbiState::CREAT | DbiState::DIRTY);
        assert_eq!(DbiState::modified(), DbiState::VALID | DbiState::DIRTY);
        assert_eq!(DbiState::carried_unchanged(), DbiState::VALID);
        assert!(DbiState::reopened_stale().contains(DbiState::STALE));
    }
}
