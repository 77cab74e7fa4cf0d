//! DUPSORT: multiple sorted values per key.
//!
//! A key's value set goes through three representations as it grows:
//! a single value is stored inline with a marker byte; a second value
//! promotes the slot to an embedded subpage (a flat sorted run of values
//! packed directly into the node's value bytes, flag DUP); once the
//! subpage would exceed `leaf_nodemax / 4` it is promoted again to a
//! nested B+tree rooted at its own pgno (flag TREE|DUP). Demotion back to
//! a smaller representation on delete is not implemented: once a key
//! reaches a nested tree it stays one for its lifetime.

use crate::btree::BTree;
use crate::comparator::LexicographicComparator;
use crate::error::{Error, PageId, Result};
use crate::meta::DbInfo;
use crate::page::{PageFlags, PAGE_SIZE};
use crate::txn::{Transaction, Write};

/// Single value stored inline, no dup-set machinery needed yet.
const SINGLE_VALUE_MARKER: u8 = 0xFF;
/// Value is a `tree_t` describing a nested sub-tree of dup values.
const SUB_DB_MARKER: u8 = 0xFE;
/// Value is a flat sorted run of dup values packed into the node itself.
const SUBPAGE_MARKER: u8 = 0xFD;

/// Above this packed size a dup set is promoted from an embedded subpage
/// to a nested sub-tree. Mirrors `leaf_nodemax / 4`.
pub const SUBPAGE_MAX_SIZE: usize = PAGE_SIZE / 4;

/// Duplicate-sort operations over a DUPSORT-flagged table.
pub struct DupSort;

impl DupSort {
    /// Check if a database has duplicate sort enabled
    pub fn is_dupsort(flags: u32) -> bool {
        flags & crate::db::DatabaseFlags::DUP_SORT.bits() != 0
    }

    pub(crate) fn is_sub_db(value: &[u8]) -> bool {
        !value.is_empty() && value[0] == SUB_DB_MARKER && value.len() == 1 + std::mem::size_of::<DbInfo>()
    }

    fn is_subpage(value: &[u8]) -> bool {
        !value.is_empty() && value[0] == SUBPAGE_MARKER
    }

    pub(crate) fn is_single_value(value: &[u8]) -> bool {
        !value.is_empty() && value[0] == SINGLE_VALUE_MARKER
    }

    fn encode_single_value(value: &[u8]) -> Vec<u8> {
        let mut encoded = Vec::with_capacity(1 + value.len());
        encoded.push(SINGLE_VALUE_MARKER);
        encoded.extend_from_slice(value);
        encoded
    }

    pub(crate) fn decode_single_value(data: &[u8]) -> Result<&[u8]> {
        if Self::is_single_value(data) {
            Ok(&data[1..])
        } else {
            Err(Error::Custom("not a single dup value".into()))
        }
    }

    /// Pack a sorted, deduplicated run of values into an embedded subpage.
    fn encode_subpage(values: &[Vec<u8>]) -> Vec<u8> {
        let mut out = vec![SUBPAGE_MARKER];
        out.extend_from_slice(&(values.len() as u32).to_le_bytes());
        for v in values {
            out.extend_from_slice(&(v.len() as u32).to_le_bytes());
            out.extend_from_slice(v);
        }
        out
    }

    fn decode_subpage(data: &[u8]) -> Result<Vec<Vec<u8>>> {
        if !Self::is_subpage(data) || data.len() < 5 {
            return Err(Error::Corruption { details: "invalid dup subpage".into(), page_id: None });
        }
        let count = u32::from_le_bytes(data[1..5].try_into().unwrap()) as usize;
        let mut values = Vec::with_capacity(count);
        let mut off = 5usize;
        for _ in 0..count {
            if off + 4 > data.len() {
                return Err(Error::Corruption { details: "truncated dup subpage".into(), page_id: None });
            }
            let len = u32::from_le_bytes(data[off..off + 4].try_into().unwrap()) as usize;
            off += 4;
            if off + len > data.len() {
                return Err(Error::Corruption { details: "truncated dup subpage value".into(), page_id: None });
            }
            values.push(data[off..off + len].to_vec());
            off += len;
        }
        Ok(values)
    }

    fn insert_sorted_dedup(values: &mut Vec<Vec<u8>>, value: &[u8]) -> bool {
        match values.binary_search_by(|v| v.as_slice().cmp(value)) {
            Ok(_) => false,
            Err(pos) => {
                values.insert(pos, value.to_vec());
                true
            }
        }
    }

    fn remove_sorted(values: &mut Vec<Vec<u8>>, value: &[u8]) -> bool {
        match values.binary_search_by(|v| v.as_slice().cmp(value)) {
            Ok(pos) => {
                values.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    /// Migrate a subpage's contents into a freshly allocated nested tree.
    fn promote_subpage_to_tree(txn: &mut Transaction<'_, Write>, values: &[Vec<u8>]) -> Result<DbInfo> {
        let (sub_root, _) = txn.alloc_page(PageFlags::LEAF)?;
        let mut sub_db = DbInfo { flags: crate::db::DatabaseFlags::DUP_SORT.bits(), root: sub_root, ..Default::default() };
        let mut root = sub_db.root;
        for v in values {
            BTree::<LexicographicComparator>::insert(txn, &mut root, &mut sub_db, v, &[])?;
        }
        sub_db.root = root;
        Ok(sub_db)
    }

    /// Insert a duplicate value; returns `true` iff `key` was previously absent.
    pub fn insert(txn: &mut Transaction<'_, Write>, db_info: &mut DbInfo, key: &[u8], value: &[u8]) -> Result<bool> {
        let search_result =
            BTree::<LexicographicComparator>::search(txn as &Transaction<'_, Write>, db_info.root, key)?;
        match search_result {
            Some(existing_data) => {
                let existing_data = existing_data.into_owned();

                if Self::is_single_value(&existing_data) {
                    let existing_value = Self::decode_single_value(&existing_data)?.to_vec();
                    if existing_value == value {
                        return Ok(false);
                    }
                    let mut values = vec![existing_value, value.to_vec()];
                    values.sort();
                    let encoded = Self::encode_subpage(&values);
                    let final_encoded = if encoded.len() <= SUBPAGE_MAX_SIZE {
                        encoded
                    } else {
                        let sub_db = Self::promote_subpage_to_tree(txn, &values)?;
                        Self::encode_sub_db(&sub_db)
                    };
                    Self::replace_value(txn, db_info, key, &final_encoded)?;
                    Ok(false)
                } else if Self::is_subpage(&existing_data) {
                    let mut values = Self::decode_subpage(&existing_data)?;
                    if !Self::insert_sorted_dedup(&mut values, value) {
                        return Ok(false);
                    }
                    let encoded = Self::encode_subpage(&values);
                    let final_encoded = if encoded.len() <= SUBPAGE_MAX_SIZE {
                        encoded
                    } else {
                        let sub_db = Self::promote_subpage_to_tree(txn, &values)?;
                        Self::encode_sub_db(&sub_db)
                    };
                    Self::replace_value(txn, db_info, key, &final_encoded)?;
                    Ok(false)
                } else if Self::is_sub_db(&existing_data) {
                    let mut sub_db = Self::decode_sub_db(&existing_data)?;
                    let mut sub_root = sub_db.root;
                    BTree::<LexicographicComparator>::insert(txn, &mut sub_root, &mut sub_db, value, &[])?;
                    sub_db.root = sub_root;
                    let encoded = Self::encode_sub_db(&sub_db);
                    BTree::<LexicographicComparator>::update_value(txn, db_info.root, key, &encoded)?;
                    Ok(false)
                } else {
                    // Pre-existing plain value (DUPSORT newly enabled on a table
                    // that already had non-dup entries): treat it as dup #1.
                    let mut values = vec![existing_data, value.to_vec()];
                    values.sort();
                    values.dedup();
                    let encoded = Self::encode_subpage(&values);
                    Self::replace_value(txn, db_info, key, &encoded)?;
                    Ok(false)
                }
            }
            None => {
                let encoded = Self::encode_single_value(value);
                let mut root = db_info.root;
                BTree::<LexicographicComparator>::insert(txn, &mut root, db_info, key, &encoded)?;
                db_info.root = root;
                Ok(true)
            }
        }
    }

    fn replace_value(txn: &mut Transaction<'_, Write>, db_info: &mut DbInfo, key: &[u8], encoded: &[u8]) -> Result<()> {
        let mut root = db_info.root;
        BTree::<LexicographicComparator>::delete(txn, &mut root, db_info, key)?;
        BTree::<LexicographicComparator>::insert(txn, &mut root, db_info, key, encoded)?;
        db_info.root = root;
        Ok(())
    }

    /// Get all values for a key, in sorted order.
    pub fn get_all<'txn>(
        txn: &Transaction<'txn, impl crate::txn::mode::Mode>,
        root: PageId,
        key: &[u8],
    ) -> Result<Vec<Vec<u8>>> {
        match BTree::<LexicographicComparator>::search(txn, root, key)? {
            Some(value) => {
                if Self::is_single_value(&value) {
                    Ok(vec![Self::decode_single_value(&value)?.to_vec()])
                } else if Self::is_subpage(&value) {
                    Self::decode_subpage(&value)
                } else if Self::is_sub_db(&value) {
                    let sub_db = Self::decode_sub_db(&value)?;
                    let mut values = Vec::new();
                    let mut stack = vec![sub_db.root];
                    while let Some(page_id) = stack.pop() {
                        let page = txn.get_page(page_id)?;
                        if page.header.flags.contains(PageFlags::LEAF) {
                            for i in 0..page.header.num_keys as usize {
                                values.push(page.node(i)?.key()?.to_vec());
                            }
                        } else {
                            for i in (0..page.header.num_keys as usize).rev() {
                                stack.push(page.node(i)?.page_number()?);
                            }
                        }
                    }
                    Ok(values)
                } else {
                    Ok(vec![value.into_owned()])
                }
            }
            None => Ok(Vec::new()),
        }
    }

    /// Delete a specific value for a key.
    pub fn delete(txn: &mut Transaction<'_, Write>, db_info: &mut DbInfo, key: &[u8], value: &[u8]) -> Result<bool> {
        match BTree::<LexicographicComparator>::search(txn, db_info.root, key)? {
            Some(existing_value) => {
                if Self::is_single_value(&existing_value) {
                    if Self::decode_single_value(&existing_value)? == value {
                        let mut root = db_info.root;
                        BTree::<LexicographicComparator>::delete(txn, &mut root, db_info, key)?;
                        db_info.root = root;
                        Ok(true)
                    } else {
                        Ok(false)
                    }
                } else if Self::is_subpage(&existing_value) {
                    let mut values = Self::decode_subpage(&existing_value)?;
                    if !Self::remove_sorted(&mut values, value) {
                        return Ok(false);
                    }
                    match values.len() {
                        0 => {
                            let mut root = db_info.root;
                            BTree::<LexicographicComparator>::delete(txn, &mut root, db_info, key)?;
                            db_info.root = root;
                        }
                        1 => {
                            let encoded = Self::encode_single_value(&values[0]);
                            Self::replace_value(txn, db_info, key, &encoded)?;
                        }
                        _ => {
                            let encoded = Self::encode_subpage(&values);
                            BTree::<LexicographicComparator>::update_value(txn, db_info.root, key, &encoded)?;
                        }
                    }
                    Ok(true)
                } else if Self::is_sub_db(&existing_value) {
                    let mut sub_db = Self::decode_sub_db(&existing_value)?;
                    let mut sub_root = sub_db.root;
                    match BTree::<LexicographicComparator>::delete(txn, &mut sub_root, &mut sub_db, value)? {
                        Some(_) => {
                            sub_db.root = sub_root;
                            if sub_db.entries == 0 {
                                let mut root = db_info.root;
                                BTree::<LexicographicComparator>::delete(txn, &mut root, db_info, key)?;
                                db_info.root = root;
                            } else if sub_db.entries == 1 {
                                let page = txn.get_page(sub_db.root)?;
                                let remaining_value = if page.header.num_keys > 0 {
                                    page.node(0)?.key()?.to_vec()
                                } else {
                                    return Err(Error::Corruption {
                                        details: "sub-database has 1 entry but no keys".into(),
                                        page_id: Some(sub_db.root),
                                    });
                                };
                                Self::free_sub_db_pages(txn, sub_db.root)?;
                                let encoded = Self::encode_single_value(&remaining_value);
                                Self::replace_value(txn, db_info, key, &encoded)?;
                            } else {
                                let encoded = Self::encode_sub_db(&sub_db);
                                BTree::<LexicographicComparator>::update_value(txn, db_info.root, key, &encoded)?;
                            }
                            Ok(true)
                        }
                        None => Ok(false),
                    }
                } else if existing_value.as_ref() == value {
                    let mut root = db_info.root;
                    BTree::<LexicographicComparator>::delete(txn, &mut root, db_info, key)?;
                    db_info.root = root;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            None => Ok(false),
        }
    }

    /// Delete all values for a key.
    pub fn delete_all(txn: &mut Transaction<'_, Write>, db_info: &mut DbInfo, key: &[u8]) -> Result<bool> {
        let mut root = db_info.root;
        match BTree::<LexicographicComparator>::delete(txn, &mut root, db_info, key)? {
            Some(value) => {
                db_info.root = root;
                if Self::is_sub_db(&value) {
                    let sub_db = Self::decode_sub_db(&value)?;
                    Self::free_sub_db_pages(txn, sub_db.root)?;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn free_sub_db_pages(txn: &mut Transaction<'_, Write>, root: PageId) -> Result<()> {
        let mut stack = vec![root];
        while let Some(page_id) = stack.pop() {
            let page = txn.get_page(page_id)?;
            if !page.header.flags.contains(PageFlags::LEAF) {
                for i in 0..page.header.num_keys as usize {
                    stack.push(page.node(i)?.page_number()?);
                }
                if let Ok(leftmost) = crate::branch::BranchPage::get_leftmost_child(page) {
                    stack.push(leftmost);
                }
            }
            txn.free_page(page_id)?;
        }
        Ok(())
    }

    /// Count values for a key (1 for a non-dup key or a missing entry).
    pub fn count_values<'txn>(
        txn: &Transaction<'txn, impl crate::txn::mode::Mode>,
        root: PageId,
        key: &[u8],
    ) -> Result<usize> {
        match BTree::<LexicographicComparator>::search(txn, root, key)? {
            Some(value) => {
                if Self::is_single_value(&value) {
                    Ok(1)
                } else if Self::is_subpage(&value) {
                    Ok(Self::decode_subpage(&value)?.len())
                } else if Self::is_sub_db(&value) {
                    Ok(Self::decode_sub_db(&value)?.entries as usize)
                } else {
                    Ok(1)
                }
            }
            None => Ok(0),
        }
    }

    /// Whether a key's dup set is currently a nested tree (flag TREE|DUP)
    /// rather than a single value or embedded subpage.
    pub fn is_nested_tree(value: &[u8]) -> bool {
        Self::is_sub_db(value)
    }

    fn encode_sub_db(db_info: &DbInfo) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + std::mem::size_of::<DbInfo>());
        bytes.push(SUB_DB_MARKER);
        unsafe {
            let ptr = db_info as *const _ as *const u8;
            bytes.extend_from_slice(std::slice::from_raw_parts(ptr, std::mem::size_of::<DbInfo>()));
        }
        bytes
    }

    /// Decode sub-database info
    pub fn decode_sub_db(bytes: &[u8]) -> Result<DbInfo> {
        if bytes.len() != 1 + std::mem::size_of::<DbInfo>() || bytes[0] != SUB_DB_MARKER {
            return Err(Error::Corruption { details: "invalid sub-database info format".into(), page_id: None });
        }
        let mut db_info = DbInfo::default();
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr().add(1),
                &mut db_info as *mut _ as *mut u8,
                std::mem::size_of::<DbInfo>(),
            );
        }
        Ok(db_info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DatabaseFlags;
    use crate::env::EnvBuilder;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn insert_get_delete_round_trip() {
        let dir = TempDir::new().unwrap();
        let env = Arc::new(EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap());

        let mut txn = env.write_txn().unwrap();
        let mut db_info = DbInfo { flags: DatabaseFlags::DUP_SORT.bits(), root: PageId(3), ..Default::default() };

        assert!(DupSort::insert(&mut txn, &mut db_info, b"key1", b"value1").unwrap());
        assert!(!DupSort::insert(&mut txn, &mut db_info, b"key1", b"value2").unwrap());
        assert!(!DupSort::insert(&mut txn, &mut db_info, b"key1", b"value3").unwrap());

        let values = DupSort::get_all(&txn, db_info.root, b"key1").unwrap();
        assert_eq!(values.len(), 3);
        assert!(values.contains(&b"value1".to_vec()));
        assert!(values.contains(&b"value2".to_vec()));
        assert!(values.contains(&b"value3".to_vec()));
        assert_eq!(DupSort::count_values(&txn, db_info.root, b"key1").unwrap(), 3);

        assert!(DupSort::delete(&mut txn, &mut db_info, b"key1", b"value2").unwrap());
        let values = DupSort::get_all(&txn, db_info.root, b"key1").unwrap();
        assert_eq!(values.len(), 2);
        assert!(!values.contains(&b"value2".to_vec()));

        txn.commit().unwrap();
    }

    #[test]
    fn small_dup_set_stays_an_embedded_subpage() {
        let dir = TempDir::new().unwrap();
        let env = Arc::new(EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap());
        let mut txn = env.write_txn().unwrap();
        let mut db_info = DbInfo { flags: DatabaseFlags::DUP_SORT.bits(), root: PageId(3), ..Default::default() };

        for i in 0..3u64 {
            DupSort::insert(&mut txn, &mut db_info, b"k", &i.to_le_bytes()).unwrap();
        }

        let raw = BTree::<LexicographicComparator>::search(&txn, db_info.root, b"k").unwrap().unwrap();
        assert!(DupSort::is_subpage(&raw));
        assert!(!DupSort::is_nested_tree(&raw));
    }

    #[test]
    fn large_dup_set_promotes_to_nested_tree() {
        let dir = TempDir::new().unwrap();
        let env = Arc::new(EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap());
        let mut txn = env.write_txn().unwrap();
        let mut db_info = DbInfo { flags: DatabaseFlags::DUP_SORT.bits(), root: PageId(3), ..Default::default() };

        // Each value is large enough that a handful of them blows past
        // SUBPAGE_MAX_SIZE and forces promotion to a nested tree.
        let big_value = vec![0x7Au8; 512];
        for i in 0..20u8 {
            let mut v = big_value.clone();
            v[0] = i;
            DupSort::insert(&mut txn, &mut db_info, b"k", &v).unwrap();
        }

        let raw = BTree::<LexicographicComparator>::search(&txn, db_info.root, b"k").unwrap().unwrap();
        assert!(DupSort::is_nested_tree(&raw));
        assert_eq!(DupSort::count_values(&txn, db_info.root, b"k").unwrap(), 20);
    }
}
