//! Database cursor operations

use crate::comparator::{Comparator, LexicographicComparator};
use crate::db::Database;
use crate::dupsort::DupSort;
use crate::error::{Error, PageId, Result};
use crate::meta::DbInfo;
use crate::page::{PageFlags, SearchResult};
use crate::txn::{mode::Mode, Transaction};
use std::borrow::Cow;
use std::marker::PhantomData;

/// Movement primitive used by [`Cursor::scan`] to drive a cursor without the
/// caller needing to match on `first`/`last`/`next`/`prev` itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOp {
    /// Position at the first entry.
    First,
    /// Position at the last entry.
    Last,
    /// Advance to the next entry.
    Next,
    /// Step back to the previous entry.
    Prev,
}

/// Position in the B+Tree
#[derive(Debug, Clone)]
struct CursorPosition {
    /// Stack of pages from root to leaf
    pages: Vec<PageId>,
    /// Index within each page
    indices: Vec<usize>,
}

/// State for DUPSORT cursor operations
#[derive(Debug, Clone)]
struct DupCursorState {
    /// Sub-database info for the current key
    #[allow(dead_code)]
    sub_db: DbInfo,
    /// Position within the sub-database
    position: Option<CursorPosition>,
}

/// A database cursor for iteration
pub struct Cursor<'txn, K, V, C = LexicographicComparator> {
    /// Reference to the transaction (type-erased)
    txn: *const (),
    /// Transaction lifetime
    _txn_lifetime: PhantomData<&'txn ()>,
    /// Database name
    db_name: Option<String>,
    /// Database root (for modifications)
    db_root: PageId,
    /// Current position in the tree
    position: Option<CursorPosition>,
    /// DUPSORT: current duplicate cursor state
    dup_cursor: Option<DupCursorState>,
    /// Database flags (to check for DUPSORT)
    db_flags: u32,
    /// Whether this cursor is for a write transaction
    is_write: bool,
    /// Phantom data for types
    _phantom: PhantomData<(K, V, C)>,
}

impl<'txn, K, V, C: Comparator> Cursor<'txn, K, V, C> {
    /// Create a new cursor
    pub fn new<M: Mode, KT, VT>(
        txn: &'txn Transaction<'txn, M>,
        db: &'txn Database<KT, VT, C>,
    ) -> Result<Self>
    where
        KT: crate::db::Key,
        VT: crate::db::Value,
    {
        let db_info = txn.db_info(db.name())?;
        Ok(Self {
            txn: txn as *const _ as *const (),
            _txn_lifetime: PhantomData,
            db_name: db.name().map(|s| s.to_string()),
            db_root: db_info.root,
            position: None,
            dup_cursor: None,
            db_flags: db_info.flags,
            is_write: M::IS_WRITE,
            _phantom: PhantomData,
        })
    }

    /// Get the transaction reference
    fn txn<M: Mode>(&self) -> &'txn Transaction<'txn, M> {
        unsafe { &*(self.txn as *const Transaction<'txn, M>) }
    }

    /// Get a page based on transaction type
    fn get_page(&self, page_id: PageId) -> Result<&'txn crate::page::Page> {
        if self.is_write {
            let txn = unsafe { &*(self.txn as *const Transaction<'txn, crate::txn::Write>) };
            txn.get_page(page_id)
        } else {
            let txn = self.txn::<crate::txn::Read>();
            txn.get_page(page_id)
        }
    }

    /// Get a page without borrowing self
    fn get_page_raw(
        txn_ptr: *const (),
        is_write: bool,
        page_id: PageId,
    ) -> Result<&'txn crate::page::Page> {
        if is_write {
            let txn = unsafe { &*(txn_ptr as *const Transaction<'txn, crate::txn::Write>) };
            txn.get_page(page_id)
        } else {
            let txn = unsafe { &*(txn_ptr as *const Transaction<'txn, crate::txn::Read>) };
            txn.get_page(page_id)
        }
    }

    /// Get value from node, handling overflow pages
    fn get_node_value(&self, node: &crate::page::Node<'txn>) -> Result<Cow<'txn, [u8]>> {
        if let Some(overflow_id) = node.overflow_page()? {
            // Read from overflow pages
            let overflow_value = if self.is_write {
                let txn = unsafe { &*(self.txn as *const Transaction<'txn, crate::txn::Write>) };
                crate::overflow::read_overflow_value(txn, overflow_id)?
            } else {
                let txn = self.txn::<crate::txn::Read>();
                crate::overflow::read_overflow_value(txn, overflow_id)?
            };
            Ok(Cow::Owned(overflow_value))
        } else {
            node.value()
        }
    }

    /// Get the IO backend for prefetching
    #[cfg(unix)]
    fn get_io_backend(&self) -> Result<&'txn crate::io::MmapBackend> {
        let txn = self.txn::<crate::txn::Read>();
        let inner = txn.data.env.inner();
        inner
            .io
            .as_any()
            .downcast_ref::<crate::io::MmapBackend>()
            .ok_or(Error::InvalidOperation("IO backend doesn't support prefetching"))
    }

    /// Move to first entry (returns raw bytes)
    pub fn first_raw(&mut self) -> Result<Option<(&'txn [u8], Cow<'txn, [u8]>)>> {
        let txn = self.txn::<crate::txn::Read>();

        // Update db_root in case it changed (e.g., after delete)
        let db_info = txn.db_info(self.db_name.as_deref())?;
        self.db_root = db_info.root;

        // Navigate to the leftmost leaf
        let mut position = CursorPosition { pages: Vec::new(), indices: Vec::new() };

        let mut current_page_id = self.db_root;

        loop {
            let page = self.get_page(current_page_id)?;

            if page.header.num_keys == 0 {
                // Empty tree
                return Ok(None);
            }

            if page.header.flags.contains(PageFlags::LEAF) {
                // Found leaf, get first entry
                position.pages.push(current_page_id);
                position.indices.push(0);

                let node = page.node(0)?;
                let key = node.key()?;

                let value = self.get_node_value(&node)?;

                self.position = Some(position);
                return Ok(Some((key, value)));
            } else {
                // Branch page, use branch_v2 to get leftmost child
                // For branch pages, index -1 represents the leftmost child
                position.pages.push(current_page_id);
                position.indices.push(usize::MAX); // Use MAX to represent "before first key"

                current_page_id = crate::branch::BranchPage::get_leftmost_child(page)?;
            }
        }
    }

    /// Move to last entry (returns raw bytes)
    pub fn last_raw(&mut self) -> Result<Option<(&'txn [u8], Cow<'txn, [u8]>)>> {
        let txn = self.txn::<crate::txn::Read>();

        // Update db_root in case it changed (e.g., after delete)
        let db_info = txn.db_info(self.db_name.as_deref())?;
        self.db_root = db_info.root;

        // Navigate to the rightmost leaf
        let mut position = CursorPosition { pages: Vec::new(), indices: Vec::new() };

        let mut current_page_id = self.db_root;

        loop {
            let page = self.get_page(current_page_id)?;

            if page.header.num_keys == 0 {
                // Empty tree
                return Ok(None);
            }

            let last_idx = page.header.num_keys as usize - 1;
            position.pages.push(current_page_id);
            position.indices.push(last_idx);

            if page.header.flags.contains(PageFlags::LEAF) {
                // Found leaf, get last entry
                let node = page.node(last_idx)?;
                let key = node.key()?;

                let value = self.get_node_value(&node)?;

                self.position = Some(position);
                return Ok(Some((key, value)));
            } else {
                // Branch page, follow last child
                // In branch_v2, the last node's value is the last child
                let node = page.node(last_idx)?;
                current_page_id = node.page_number()?;
            }
        }
    }

    /// Move to next entry (returns raw bytes)
    pub fn next_raw(&mut self) -> Result<Option<(&'txn [u8], Cow<'txn, [u8]>)>> {
        if self.position.is_none() {
            return self.first_raw();
        }

        // Get necessary info before mutable borrow
        let (leaf_idx, leaf_page_id) = {
            let position = self.position.as_ref().unwrap();
            let leaf_idx = position.pages.len() - 1;
            let leaf_page_id = position.pages[leaf_idx];
            (leaf_idx, leaf_page_id)
        };

        let leaf_page = self.get_page(leaf_page_id)?;
        let leaf_num_keys = leaf_page.header.num_keys as usize;
        let leaf_next_pgno = leaf_page.header.next_pgno;
        let leaf_has_leaf_flag = leaf_page.header.flags.contains(PageFlags::LEAF);

        // Now we can mutably borrow position
        let position = self.position.as_mut().unwrap();
        position.indices[leaf_idx] += 1;

        if position.indices[leaf_idx] < leaf_num_keys {
            // Still have entries in current leaf
            let node = leaf_page.node(position.indices[leaf_idx])?;
            let key = node.key()?;

            // Check if value is in overflow pages
            let value = if let Some(overflow_id) = node.overflow_page()? {
                // Read from overflow pages
                let overflow_value = crate::overflow::read_overflow_value(
                    self.txn::<crate::txn::Read>(),
                    overflow_id,
                )?;
                Cow::Owned(overflow_value)
            } else {
                node.value()?
            };

            return Ok(Some((key, value)));
        }

        // Drop the mutable borrow before we need to borrow self again
        let _ = position;

        // Check if we can use leaf chaining for fast navigation
        if leaf_has_leaf_flag && leaf_next_pgno != 0 {
            // Use leaf chaining - much faster than tree traversal
            let next_page_id = PageId(leaf_next_pgno);

            // Prefetch the next few pages for sequential access
            #[cfg(unix)]
            if let Ok(io_backend) = self.get_io_backend() {
                // Prefetch next 4 pages
                let _ = io_backend.prefetch_pages(next_page_id, 4);
            }

            let next_page = self.get_page(next_page_id)?;

            if next_page.header.num_keys > 0 {
                // Update position to point to first entry in next leaf
                // Keep only the leaf level in our position stack for efficiency
                let position = self.position.as_mut().unwrap();
                position.pages.clear();
                position.indices.clear();
                position.pages.push(next_page_id);
                position.indices.push(0);

                let node = next_page.node(0)?;
                let key = node.key()?;
                let value = self.get_node_value(&node)?;
                return Ok(Some((key, value)));
            }
        }

        // Need to move to next leaf
        // Go up the tree until we find a branch we haven't exhausted
        let position = self.position.as_mut().unwrap();
        position.pages.pop();
        position.indices.pop();

        while !position.pages.is_empty() {
            let level = position.pages.len() - 1;
            let page_id = position.pages[level];

            // Get page first before incrementing
            let page = Self::get_page_raw(self.txn, self.is_write, page_id)?;

            if page.header.flags.contains(PageFlags::BRANCH) {
                // For branch pages, handle the special index for leftmost child
                if position.indices[level] == usize::MAX {
                    // Currently at leftmost child, move to first key's right child
                    position.indices[level] = 0;
                } else {
                    // Normal increment
                    position.indices[level] += 1;
                }

                if position.indices[level] < page.header.num_keys as usize {
                    // Found a branch with more children
                    let mut current_page_id =
                        crate::branch::BranchPage::get_child_at(page, position.indices[level])?;

                    loop {
                        let page = Self::get_page_raw(self.txn, self.is_write, current_page_id)?;

                        if page.header.flags.contains(PageFlags::LEAF) {
                            position.pages.push(current_page_id);
                            position.indices.push(0);

                            let node = page.node(0)?;
                            let key = node.key()?;
                            let value = self.get_node_value(&node)?;
                            return Ok(Some((key, value)));
                        } else {
                            // Branch page, use branch_v2 to get leftmost child
                            position.pages.push(current_page_id);
                            position.indices.push(usize::MAX); // Start at leftmost child

                            current_page_id = crate::branch::BranchPage::get_leftmost_child(page)?;
                        }
                    }
                }
            } else {
                // Leaf page - should not happen at non-leaf levels
                position.indices[level] += 1;
                if position.indices[level] < page.header.num_keys as usize {
                    let node = page.node(position.indices[level])?;
                    let key = node.key()?;
                    let value = self.get_node_value(&node)?;
                    return Ok(Some((key, value)));
                }
            }

            // This branch is exhausted, go up another level
            position.pages.pop();
            position.indices.pop();
        }

        // No more entries
        self.position = None;
        Ok(None)
    }

    /// Move to previous entry (returns raw bytes)
    pub fn prev_raw(&mut self) -> Result<Option<(&'txn [u8], Cow<'txn, [u8]>)>> {
        if self.position.is_none() {
            return self.last_raw();
        }

        // Get necessary info before mutable borrow
        let (leaf_idx, current_leaf_index, leaf_page_id) = {
            let position = self.position.as_ref().unwrap();
            let leaf_idx = position.pages.len() - 1;
            (leaf_idx, position.indices[leaf_idx], position.pages[leaf_idx])
        };

        if current_leaf_index > 0 {
            // Can move back in current leaf
            let position = self.position.as_mut().unwrap();
            position.indices[leaf_idx] -= 1;

            let leaf_page_id = position.pages[leaf_idx];
            let new_index = position.indices[leaf_idx];
            // Drop mutable borrow before calling get_page
            let _ = position;

            let leaf_page = self.get_page(leaf_page_id)?;
            let node = leaf_page.node(new_index)?;
            let key = node.key()?;
            let value = self.get_node_value(&node)?;
            return Ok(Some((key, value)));
        }

        // Check if we can use leaf chaining for fast navigation
        let leaf_page = self.get_page(leaf_page_id)?;
        if leaf_page.header.flags.contains(PageFlags::LEAF) && leaf_page.header.prev_pgno != 0 {
            // Use leaf chaining - much faster than tree traversal
            let prev_page_id = PageId(leaf_page.header.prev_pgno);
            let prev_page = self.get_page(prev_page_id)?;

            if prev_page.header.num_keys > 0 {
                // Update position to point to last entry in previous leaf
                let position = self.position.as_mut().unwrap();
                position.pages.clear();
                position.indices.clear();
                position.pages.push(prev_page_id);
                position.indices.push(prev_page.header.num_keys as usize - 1);

                let node = prev_page.node(prev_page.header.num_keys as usize - 1)?;
                let key = node.key()?;
                let value = self.get_node_value(&node)?;
                return Ok(Some((key, value)));
            }
        }

        let position = self.position.as_mut().unwrap();

        // Need to move to previous leaf
        // Go up the tree until we find a branch we can go left from
        position.pages.pop();
        position.indices.pop();

        while !position.pages.is_empty() {
            let level = position.pages.len() - 1;

            if position.indices[level] > 0 {
                position.indices[level] -= 1;

                // Navigate down to the rightmost leaf of this subtree
                let page_id = position.pages[level];
                let page = Self::get_page_raw(self.txn, self.is_write, page_id)?;
                let mut current_page_id = if page.header.flags.contains(PageFlags::BRANCH) {
                    // For branch pages, handle the special case when index is 0
                    if position.indices[level] == 0 {
                        // Use leftmost child
                        crate::branch::BranchPage::get_leftmost_child(page)?
                    } else {
                        // Get the child before this key
                        let node = page.node(position.indices[level] - 1)?;
                        node.page_number()?
                    }
                } else {
                    // For leaf pages (shouldn't happen here)
                    let node = page.node(position.indices[level])?;
                    node.page_number()?
                };

                loop {
                    let page = Self::get_page_raw(self.txn, self.is_write, current_page_id)?;
                    let last_idx = page.header.num_keys as usize - 1;
                    position.pages.push(current_page_id);
                    position.indices.push(last_idx);

                    if page.header.flags.contains(PageFlags::LEAF) {
                        let node = page.node(last_idx)?;
                        let key = node.key()?;
                        let value = self.get_node_value(&node)?;
                        return Ok(Some((key, value)));
                    } else {
                        let node = page.node(last_idx)?;
                        current_page_id = node.page_number()?;
                    }
                }
            }

            // Can't go left at this level, go up
            position.pages.pop();
            position.indices.pop();
        }

        // No more entries
        self.position = None;
        Ok(None)
    }

    /// Seek to a specific key (returns raw bytes)
    pub fn seek_raw(&mut self, key: &[u8]) -> Result<Option<(&'txn [u8], Cow<'txn, [u8]>)>> {
        // For write transactions, the db_root should already be updated via put()
        // Only update for read transactions
        if self.db_root.0 == 0 {
            let db_info = if self.is_write {
                let txn = unsafe { &*(self.txn as *const Transaction<'txn, crate::txn::Write>) };
                txn.db_info(self.db_name.as_deref())?
            } else {
                let txn = self.txn::<crate::txn::Read>();
                txn.db_info(self.db_name.as_deref())?
            };
            self.db_root = db_info.root;
        }

        let mut position = CursorPosition { pages: Vec::new(), indices: Vec::new() };

        let mut current_page_id = self.db_root;

        loop {
            let page = if self.is_write {
                let txn = unsafe { &*(self.txn as *const Transaction<'txn, crate::txn::Write>) };
                txn.get_page(current_page_id)?
            } else {
                let txn = self.txn::<crate::txn::Read>();
                txn.get_page(current_page_id)?
            };

            if page.header.num_keys == 0 {
                return Ok(None);
            }

            match page.search_key_with_comparator::<C>(key)? {
                SearchResult::Found { index } => {
                    position.pages.push(current_page_id);
                    position.indices.push(index);

                    if page.header.flags.contains(PageFlags::LEAF) {
                        let node = page.node(index)?;
                        let key = node.key()?;
                        let value = self.get_node_value(&node)?;
                        self.position = Some(position);
                        return Ok(Some((key, value)));
                    } else {
                        let node = page.node(index)?;
                        current_page_id = node.page_number()?;
                    }
                }
                SearchResult::NotFound { insert_pos } => {
                    if page.header.flags.contains(PageFlags::LEAF) {
                        // Key not found, position at insert position
                        position.pages.push(current_page_id);
                        position.indices.push(insert_pos);
                        self.position = Some(position);

                        // Return the key at insert position if it exists
                        if insert_pos < page.header.num_keys as usize {
                            let node = page.node(insert_pos)?;
                            let key = node.key()?;
                            let value = self.get_node_value(&node)?;
                            return Ok(Some((key, value)));
                        } else {
                            // We're past the last key, try next
                            return self.next_raw();
                        }
                    } else {
                        // Branch page, follow appropriate child
                        let child_index = if insert_pos > 0 { insert_pos - 1 } else { 0 };
                        position.pages.push(current_page_id);
                        position.indices.push(child_index);

                        if child_index < page.header.num_keys as usize {
                            let node = page.node(child_index)?;
                            current_page_id = node.page_number()?;
                        } else {
                            return Ok(None);
                        }
                    }
                }
            }
        }
    }

    /// Apply a [`CursorOp`] and return the raw entry at the resulting
    /// position, if any.
    fn apply_op(&mut self, op: CursorOp) -> Result<Option<(&'txn [u8], Cow<'txn, [u8]>)>> {
        match op {
            CursorOp::First => self.first_raw(),
            CursorOp::Last => self.last_raw(),
            CursorOp::Next => self.next_raw(),
            CursorOp::Prev => self.prev_raw(),
        }
    }

    /// Count of duplicate values at the current key: 1 for a non-DUPSORT
    /// table or a plain single-value entry, or the sub-tree's entry count
    /// once a key has been promoted to a nested tree.
    pub fn count(&self) -> Result<u64>
    where
        K: crate::db::Key,
        V: crate::db::Value,
    {
        if self.position.is_none() {
            return Ok(0);
        }
        if !self.is_dupsort() {
            return Ok(1);
        }
        let (_, value) = match self.get_current_raw()? {
            Some(kv) => kv,
            None => return Ok(0),
        };
        if DupSort::is_sub_db(&value) {
            let sub_db = DupSort::decode_sub_db(&value)?;
            Ok(sub_db.entries)
        } else {
            Ok(1)
        }
    }

    /// Total order between two cursors positioned in the same table. Both
    /// walk the same sorted tree, so comparing their current keys with the
    /// table's comparator gives the same order their position stacks would.
    pub fn compare(&self, other: &Self) -> Result<std::cmp::Ordering>
    where
        K: crate::db::Key,
        V: crate::db::Value,
    {
        let key_a = self
            .get_current_key()?
            .ok_or(Error::InvalidOperation("cursor has no current position"))?;
        let key_b = other
            .get_current_key()?
            .ok_or(Error::InvalidOperation("cursor has no current position"))?;
        Ok(C::compare(key_a, key_b))
    }

    /// Closed-form estimate of how many entries lie between two cursor
    /// positions, derived from the tree height and the branching factor at
    /// the level their position stacks diverge. Approximate by design — it
    /// exists for query planning, not exact range counts.
    pub fn estimate_distance(&self, other: &Self) -> Result<u64> {
        let pos_a = self
            .position
            .as_ref()
            .ok_or(Error::InvalidOperation("cursor has no current position"))?;
        let pos_b = other
            .position
            .as_ref()
            .ok_or(Error::InvalidOperation("cursor has no current position"))?;

        let common = pos_a.pages.len().min(pos_b.pages.len());
        let mut level = 0;
        while level < common && pos_a.pages[level] == pos_b.pages[level] {
            level += 1;
        }
        if level == 0 {
            // Different root page entirely (different tables) - no
            // meaningful estimate.
            return Err(Error::InvalidOperation("cursors do not share a root"));
        }
        if level == common {
            let last = common - 1;
            return Ok(pos_a.indices[last].abs_diff(pos_b.indices[last]) as u64);
        }

        let branch_page_id = pos_a.pages[level];
        let branch_page = self.get_page(branch_page_id)?;
        let fanout = (branch_page.header.num_keys as u64).max(1);

        let idx_a = *pos_a.indices.get(level).unwrap_or(&0) as u64;
        let idx_b = *pos_b.indices.get(level).unwrap_or(&0) as u64;
        let spread = idx_a.abs_diff(idx_b);

        let remaining_levels = pos_a.pages.len().saturating_sub(level + 1) as u32;
        Ok(spread.saturating_mul(fanout.saturating_pow(remaining_levels)))
    }

    /// Drive the cursor with `start_op` and then `turn_op` on every
    /// subsequent step, calling `predicate` on each raw entry visited.
    /// Stops as soon as `predicate` returns `true`, or when the cursor runs
    /// out of entries.
    pub fn scan<P>(&mut self, start_op: CursorOp, turn_op: CursorOp, mut predicate: P) -> Result<()>
    where
        P: FnMut(&[u8], &[u8]) -> bool,
    {
        let mut entry = self.apply_op(start_op)?;
        while let Some((key, value)) = entry {
            if predicate(key, value.as_ref()) {
                break;
            }
            entry = self.apply_op(turn_op)?;
        }
        Ok(())
    }
}

// Convenience methods for typed access
impl<'txn, K: crate::db::Key, V: crate::db::Value, C: Comparator> Cursor<'txn, K, V, C> {
    /// Move to first entry
    pub fn first(&mut self) -> Result<Option<(Vec<u8>, V)>> {
        match self.first_raw()? {
            Some((key, value)) => {
                let v = V::decode(&value)?;
                Ok(Some((key.to_vec(), v)))
            }
            None => Ok(None),
        }
    }

    /// Move to last entry
    pub fn last(&mut self) -> Result<Option<(Vec<u8>, V)>> {
        match self.last_raw()? {
            Some((key, value)) => {
                let v = V::decode(&value)?;
                Ok(Some((key.to_vec(), v)))
            }
            None => Ok(None),
        }
    }

    /// Move to next entry
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, V)>> {
        match self.next_raw()? {
            Some((key, value)) => {
                let v = V::decode(&value)?;
                Ok(Some((key.to_vec(), v)))
            }
            None => Ok(None),
        }
    }

    /// Move to previous entry
    pub fn prev(&mut self) -> Result<Option<(Vec<u8>, V)>> {
        match self.prev_raw()? {
            Some((key, value)) => {
                let v = V::decode(&value)?;
                Ok(Some((key.to_vec(), v)))
            }
            None => Ok(None),
        }
    }

    /// Seek to a specific key
    pub fn seek(&mut self, key: &K) -> Result<Option<(Vec<u8>, V)>> {
        let key_bytes = key.encode()?;
        match self.seek_raw(&key_bytes)? {
            Some((key, value)) => {
                let v = V::decode(&value)?;
                Ok(Some((key.to_vec(), v)))
            }
            None => Ok(None),
        }
    }

    /// Delete the current entry (requires a write transaction)
    pub fn delete(&mut self) -> Result<bool> {
        // We need to check if the transaction is a write transaction
        // For now, we'll try to get it as a write transaction and fail if it's not
        let txn = unsafe { &mut *(self.txn as *mut Transaction<'txn, crate::txn::Write>) };

        // Get current position
        let position = match &self.position {
            Some(pos) => pos,
            None => return Ok(false), // No current position
        };

        if position.pages.is_empty() {
            return Ok(false);
        }

        // Get the key at current position
        let current_key = {
            let leaf_page_id = position.pages[position.pages.len() - 1];
            let leaf_index = position.indices[position.indices.len() - 1];
            let page = self.get_page(leaf_page_id)?;

            if leaf_index >= page.header.num_keys as usize {
                return Ok(false); // Position is invalid
            }

            let node = page.node(leaf_index)?;
            node.key()?.to_vec()
        };

        // Get database info
        let db_info = txn.db_info(self.db_name.as_deref())?;
        let mut info = *db_info;
        let mut root = info.root;

        // Delete using B+Tree
        match crate::btree::BTree::<C>::delete(txn, &mut root, &mut info, &current_key)? {
            Some(_) => {
                // Update db info - root may have changed during delete
                info.root = root;
                self.db_root = root;

                // Update transaction's database info
                txn.update_db_info(self.db_name.as_deref(), info)?;

                // Invalidate cursor position as tree structure may have changed
                self.position = None;

                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Get the current key and value without moving the cursor
    pub fn current(&self) -> Result<Option<(Vec<u8>, V)>> {
        let position = match &self.position {
            Some(pos) => pos,
            None => return Ok(None),
        };

        if position.pages.is_empty() {
            return Ok(None);
        }

        let leaf_page_id = position.pages[position.pages.len() - 1];
        let leaf_index = position.indices[position.indices.len() - 1];

        // Get page based on transaction type
        let page = if self.is_write {
            // For write transactions, use the write transaction to see dirty pages
            let txn = unsafe { &*(self.txn as *const Transaction<'txn, crate::txn::Write>) };
            txn.get_page(leaf_page_id)?
        } else {
            // For read transactions, use read transaction
            let txn = self.txn::<crate::txn::Read>();
            txn.get_page(leaf_page_id)?
        };

        if leaf_index >= page.header.num_keys as usize {
            return Ok(None);
        }

        let node = page.node(leaf_index)?;
        let key = node.key()?.to_vec();
        let value = self.get_node_value(&node)?;
        let v = V::decode(&value)?;

        Ok(Some((key, v)))
    }

    /// Put a key-value pair at the current cursor position
    /// This requires a write transaction
    pub fn put(&mut self, key: &K, value: &V) -> Result<()> {
        // We need to check if the transaction is a write transaction
        let txn = unsafe { &mut *(self.txn as *mut Transaction<'txn, crate::txn::Write>) };

        let key_bytes = key.encode()?;
        let value_bytes = value.encode()?;

        // Get database info
        let db_info = txn.db_info(self.db_name.as_deref())?;
        let mut info = *db_info;
        let mut root = info.root;

        // Insert using B+Tree
        // Returns Some(old_value) if key was updated, None if inserted
        let _old_value =
            crate::btree::BTree::<C>::insert(txn, &mut root, &mut info, &key_bytes, &value_bytes)?;

        // Update db info - root may have changed during insert
        info.root = root;
        self.db_root = root;

        // Update transaction's database info
        txn.update_db_info(self.db_name.as_deref(), info)?;

        // Position cursor at the newly inserted key
        match self.seek_raw(&key_bytes)? {
            Some(_) => {
                // Successfully positioned at key
            }
            None => {
                // This shouldn't happen - we just inserted the key
                return Err(Error::Custom("Failed to position cursor at inserted key".into()));
            }
        }

        Ok(())
    }

    /// Put a key-value pair only if the key doesn't exist
    /// Returns true if inserted, false if key already exists
    pub fn put_no_overwrite(&mut self, key: &K, value: &V) -> Result<bool> {
        let key_bytes = key.encode()?;

        // First check if key exists
        match self.seek_raw(&key_bytes)? {
            Some((found_key, _)) if found_key == key_bytes => {
                // Key already exists
                Ok(false)
            }
            _ => {
                // Key doesn't exist, insert it
                self.put(key, value)?;
                Ok(true)
            }
        }
    }

    /// Update the value at the current cursor position
    /// Returns true if updated, false if cursor has no current position
    pub fn update(&mut self, value: &V) -> Result<bool> {
        let position = match &self.position {
            Some(pos) => pos,
            None => return Ok(false),
        };

        if position.pages.is_empty() {
            return Ok(false);
        }

        // Get current key
        let current_key = {
            let leaf_page_id = position.pages[position.pages.len() - 1];
            let leaf_index = position.indices[position.indices.len() - 1];
            let page = self.get_page(leaf_page_id)?;

            if leaf_index >= page.header.num_keys as usize {
                return Ok(false);
            }

            let node = page.node(leaf_index)?;
            node.key()?.to_vec()
        };

        // Get write transaction
        let txn = unsafe { &mut *(self.txn as *mut Transaction<'txn, crate::txn::Write>) };
        let value_bytes = value.encode()?;

        // Get database info
        let db_info = txn.db_info(self.db_name.as_deref())?;
        let mut info = *db_info;
        let mut root = info.root;

        // Update using B+Tree
        let old_value = crate::btree::BTree::<C>::insert(
            txn,
            &mut root,
            &mut info,
            &current_key,
            &value_bytes,
        )?;

        if old_value.is_some() {
            // Key was updated (as expected)
            // Update db info - root may have changed
            info.root = root;
            self.db_root = root;
            txn.update_db_info(self.db_name.as_deref(), info)?;

            // Reposition cursor at the same key
            self.seek_raw(&current_key)?;
            Ok(true)
        } else {
            // This shouldn't happen as we're updating an existing key
            Err(Error::Custom("Unexpected insert during update".into()))
        }
    }

    // ===== DUPSORT Operations =====

    /// Check if database has DUPSORT enabled
    fn is_dupsort(&self) -> bool {
        DupSort::is_dupsort(self.db_flags)
    }

    /// Get the first duplicate for the current key
    pub fn first_dup(&mut self) -> Result<Option<(&'txn [u8], Cow<'txn, [u8]>)>> {
        if !self.is_dupsort() {
            return Err(Error::InvalidOperation("Database does not have DUPSORT enabled"));
        }

        // Must be positioned on a key
        if self.position.is_none() {
            return Ok(None);
        }

        // Get current key-value
        let (key, value) = match self.get_current_raw()? {
            Some(kv) => kv,
            None => return Ok(None),
        };

        // Check if value is a single value with our optimization
        if DupSort::is_single_value(&value) {
            // Single value optimization - decode and return it
            let single_value = DupSort::decode_single_value(&value)?;
            Ok(Some((key, Cow::Owned(single_value.to_vec()))))
        } else if DupSort::is_sub_db(&value) {
            // It's a sub-database, navigate to first entry
            let sub_db = DupSort::decode_sub_db(&value)?;
            let mut dup_position = CursorPosition { pages: Vec::new(), indices: Vec::new() };

            // Navigate to first entry in sub-database
            let mut current_page_id = sub_db.root;
            loop {
                let page = self.get_page(current_page_id)?;

                if page.header.num_keys == 0 {
                    return Ok(None);
                }

                if page.header.flags.contains(PageFlags::LEAF) {
                    // Found leaf, get first entry
                    dup_position.pages.push(current_page_id);
                    dup_position.indices.push(0);

                    let node = page.node(0)?;
                    // In DUPSORT, duplicate values are stored as keys in the sub-database
                    let dup_value = node.key()?;

                    // Update dup cursor state
                    self.dup_cursor = Some(DupCursorState { sub_db, position: Some(dup_position) });

                    return Ok(Some((key, Cow::Borrowed(dup_value))));
                } else {
                    // Branch page, go to leftmost child
                    dup_position.pages.push(current_page_id);
                    dup_position.indices.push(usize::MAX);
                    current_page_id = crate::branch::BranchPage::get_leftmost_child(page)?;
                }
            }
        } else {
            // Legacy case - value stored directly
            Ok(Some((key, value)))
        }
    }

    /// Get the next duplicate for the current key
    pub fn next_dup(&mut self) -> Result<Option<(&'txn [u8], Cow<'txn, [u8]>)>> {
        if !self.is_dupsort() {
            return Err(Error::InvalidOperation("Database does not have DUPSORT enabled"));
        }

        // Must have active dup cursor
        if self.dup_cursor.is_none() {
            // No active dup cursor means we're either on a single value or haven't started
            return Ok(None);
        }

        // Work with the dup cursor
        let dup_state = self.dup_cursor.as_mut().unwrap();
        let dup_position = match &mut dup_state.position {
            Some(pos) => pos,
            None => return Ok(None),
        };

        let leaf_idx = dup_position.pages.len() - 1;
        let leaf_page_id = dup_position.pages[leaf_idx];
        dup_position.indices[leaf_idx] += 1;
        let next_index = dup_position.indices[leaf_idx];

        // Now check if we should continue (after releasing mutable borrow)
        let leaf_page = self.get_page(leaf_page_id)?;
        let should_continue = next_index < leaf_page.header.num_keys as usize;

        if should_continue {
            // Get current key
            let key = match self.get_current_key()? {
                Some(k) => k,
                None => return Ok(None),
            };

            // Get value from sub-database
            let leaf_page = self.get_page(leaf_page_id)?;
            let node = leaf_page.node(next_index)?;
            // In DUPSORT, duplicate values are stored as keys in the sub-database
            let dup_value = node.key()?;
            return Ok(Some((key, Cow::Borrowed(dup_value))));
        }

        // Need to move to next leaf in sub-database
        // This is similar to regular next() but within sub-database
        // For now, return None (complete implementation would traverse sub-tree)
        self.dup_cursor = None;
        Ok(None)
    }

    /// Get current key without value
    fn get_current_key(&self) -> Result<Option<&'txn [u8]>> {
        let position = match &self.position {
            Some(pos) => pos,
            None => return Ok(None),
        };

        if position.pages.is_empty() {
            return Ok(None);
        }

        let leaf_idx = position.pages.len() - 1;
        let leaf_page_id = position.pages[leaf_idx];
        let leaf_page = self.get_page(leaf_page_id)?;

        let node = leaf_page.node(position.indices[leaf_idx])?;
        Ok(Some(node.key()?))
    }

    /// Get current raw key-value without decoding
    fn get_current_raw(&self) -> Result<Option<(&'txn [u8], Cow<'txn, [u8]>)>> {
        let position = match &self.position {
            Some(pos) => pos,
            None => return Ok(None),
        };

        if position.pages.is_empty() {
            return Ok(None);
        }

        let leaf_idx = position.pages.len() - 1;
        let leaf_page_id = position.pages[leaf_idx];
        let leaf_page = self.get_page(leaf_page_id)?;

        let node = leaf_page.node(position.indices[leaf_idx])?;
        let key = node.key()?;
        let value = self.get_node_value(&node)?;

        Ok(Some((key, value)))
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
    fn test_cursor_iteration() {
        let dir = TempDir::new().unwrap();
        let env = Arc::new(EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap());

        // Create database and insert data
        let db: Database<String, String> = {
            let mut txn = env.write_txn().unwrap();
            let db = env.create_database(&mut txn, None).unwrap();

            db.put(&mut txn, "key1".to_string(), "value1".to_string()).unwrap();
            db.put(&mut txn, "key2".to_string(), "value2".to_string()).unwrap();
            db.put(&mut txn, "key3".to_string(), "value3".to_string()).unwrap();

            txn.commit().unwrap();
            db
        };

        // Test cursor iteration
        {
            let txn = env.read_txn().unwrap();
            let mut cursor = db.cursor(&txn).unwrap();

            // First
            let (key, value) = cursor.first().unwrap().unwrap();
            assert_eq!(key, b"key1");
            assert_eq!(value, "value1");

            // Next
            let (key, value) = cursor.next().unwrap().unwrap();
            assert_eq!(key, b"key2");
            assert_eq!(value, "value2");

            // Current
            let (key, value) = cursor.current().unwrap().unwrap();
            assert_eq!(key, b"key2");
            assert_eq!(value, "value2");

            // Last
            let (key, value) = cursor.last().unwrap().unwrap();
            assert_eq!(key, b"key3");
            assert_eq!(value, "value3");

            // Prev
            let (key, value) = cursor.prev().unwrap().unwrap();
            assert_eq!(key, b"key2");
            assert_eq!(value, "value2");
        }
    }

    #[test]
    fn test_cursor_seek() {
        let dir = TempDir::new().unwrap();
        let env = Arc::new(EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap());

        // Create database and insert data
        let db: Database<String, String> = {
            let mut txn = env.write_txn().unwrap();
            let db = env.create_database(&mut txn, None).unwrap();

            db.put(&mut txn, "key1".to_string(), "value1".to_string()).unwrap();
            db.put(&mut txn, "key3".to_string(), "value3".to_string()).unwrap();
            db.put(&mut txn, "key5".to_string(), "value5".to_string()).unwrap();

            txn.commit().unwrap();
            db
        };

        // Test cursor seek
        {
            let txn = env.read_txn().unwrap();
            let mut cursor = db.cursor(&txn).unwrap();

            // Seek to existing key
            let (key, value) = cursor.seek(&"key3".to_string()).unwrap().unwrap();
            assert_eq!(key, b"key3");
            assert_eq!(value, "value3");

            // Seek to non-existing key (should position at next key)
            let (key, value) = cursor.seek(&"key2".to_string()).unwrap().unwrap();
            assert_eq!(key, b"key3");
            assert_eq!(value, "value3");

            // Seek to key after all entries
            let result = cursor.seek(&"key9".to_string()).unwrap();
            assert!(result.is_none());
        }
    }

    #[test]
    fn test_cursor_delete() {
        let dir = TempDir::new().unwrap();
        let env = Arc::new(EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap());

        // Create database and insert data
        let db: Database<String, String> = {
            let mut txn = env.write_txn().unwrap();
            let db = env.create_database(&mut txn, None).unwrap();

            db.put(&mut txn, "key1".to_string(), "value1".to_string()).unwrap();
            db.put(&mut txn, "key2".to_string(), "value2".to_string()).unwrap();
            db.put(&mut txn, "key3".to_string(), "value3".to_string()).unwrap();
            db.put(&mut txn, "key4".to_string(), "value4".to_string()).unwrap();

            txn.commit().unwrap();
            db
        };

        // Test 1: Delete a single key using cursor
        {
            let mut txn = env.write_txn().unwrap();
            let mut cursor: Cursor<'_, String, String> = db.cursor(&mut txn).unwrap();

            // Move to key2
            cursor.seek(&"key2".to_string()).unwrap();

            // Verify we're at the right position
            let current = cursor.current().unwrap().unwrap();
            assert_eq!(current.0, b"key2");

            // Delete current position
            let deleted = cursor.delete().unwrap();
            assert!(deleted);

            txn.commit().unwrap();
        }

        // Verify first deletion
        {
            let txn = env.read_txn().unwrap();
            assert!(db.get(&txn, &"key1".to_string()).unwrap().is_some());
            assert!(db.get(&txn, &"key2".to_string()).unwrap().is_none());
            assert!(db.get(&txn, &"key3".to_string()).unwrap().is_some());
            assert!(db.get(&txn, &"key4".to_string()).unwrap().is_some());
        }

        // Test 2: Delete another key in a separate transaction
        {
            let mut txn = env.write_txn().unwrap();
            let mut cursor: Cursor<'_, String, String> = db.cursor(&mut txn).unwrap();

            // Move to key3
            cursor.seek(&"key3".to_string()).unwrap();

            // Verify we're at the right position
            let current = cursor.current().unwrap().unwrap();
            assert_eq!(current.0, b"key3");

            // Delete current position
            let deleted = cursor.delete().unwrap();
            assert!(deleted);

            txn.commit().unwrap();
        }

        // Verify both deletions
        {
            let txn = env.read_txn().unwrap();
            assert!(db.get(&txn, &"key1".to_string()).unwrap().is_some());
            assert!(db.get(&txn, &"key2".to_string()).unwrap().is_none());
            assert!(db.get(&txn, &"key3".to_string()).unwrap().is_none());
            assert!(db.get(&txn, &"key4".to_string()).unwrap().is_some());
        }
    }

    #[test]
    fn test_cursor_put() {
        let dir = TempDir::new().unwrap();
        let env = Arc::new(EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap());

        // Create database
        let db: Database<String, String> = {
            let mut txn = env.write_txn().unwrap();
            let db = env.create_database(&mut txn, None).unwrap();
            txn.commit().unwrap();
            db
        };

        // Test cursor put operations - simplified test
        {
            let mut txn = env.write_txn().unwrap();
            let mut cursor: Cursor<'_, String, String> = db.cursor(&mut txn).unwrap();

            // Put just one entry first
            cursor.put(&"key1".to_string(), &"value1".to_string()).unwrap();

            // Check if cursor is positioned correctly
            let current = cursor.current();
            assert!(current.is_ok(), "cursor.current() failed: {:?}", current.err());
            assert!(current.as_ref().unwrap().is_some(), "cursor.current() returned None");

            txn.commit().unwrap();
        }

        // Verify insertion
        {
            let txn = env.read_txn().unwrap();
            assert_eq!(db.get(&txn, &"key1".to_string()).unwrap(), Some("value1".to_string()));
        }
    }

    #[test]
    fn test_cursor_update() {
        let dir = TempDir::new().unwrap();
        let env = Arc::new(EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap());

        // Create database and insert initial data
        let db: Database<String, String> = {
            let mut txn = env.write_txn().unwrap();
            let db = env.create_database(&mut txn, None).unwrap();

            db.put(&mut txn, "key1".to_string(), "value1".to_string()).unwrap();
            db.put(&mut txn, "key2".to_string(), "value2".to_string()).unwrap();
            db.put(&mut txn, "key3".to_string(), "value3".to_string()).unwrap();

            txn.commit().unwrap();
            db
        };

        // Test cursor update
        {
            let mut txn = env.write_txn().unwrap();
            let mut cursor: Cursor<'_, String, String> = db.cursor(&mut txn).unwrap();

            // Position at key2
            cursor.seek(&"key2".to_string()).unwrap();

            // Update current position
            let updated = cursor.update(&"updated_value2".to_string()).unwrap();
            assert!(updated);

            // Verify cursor is still at key2
            let current = cursor.current().unwrap();
            assert!(current.is_some());
            let (key, value) = current.unwrap();
            assert_eq!(key, b"key2");
            assert_eq!(value, "updated_value2");

            // Try update with no position
            cursor.position = None;
            let updated = cursor.update(&"some_value".to_string()).unwrap();
            assert!(!updated);

            txn.commit().unwrap();
        }

        // Verify update
        {
            let txn = env.read_txn().unwrap();
            assert_eq!(db.get(&txn, &"key1".to_string()).unwrap(), Some("value1".to_string()));
            assert_eq!(
                db.get(&txn, &"key2".to_string()).unwrap(),
                Some("updated_value2".to_string())
            );
            assert_eq!(db.get(&txn, &"key3".to_string()).unwrap(), Some("value3".to_string()));
        }
    }

    #[test]
    fn test_cursor_count_non_dupsort_is_one() {
        let dir = TempDir::new().unwrap();
        let env = Arc::new(EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap());

        let db: Database<String, String> = {
            let mut txn = env.write_txn().unwrap();
            let db = env.create_database(&mut txn, None).unwrap();
            db.put(&mut txn, "key1".to_string(), "value1".to_string()).unwrap();
            txn.commit().unwrap();
            db
        };

        let txn = env.read_txn().unwrap();
        let mut cursor = db.cursor(&txn).unwrap();
        cursor.first().unwrap();
        assert_eq!(cursor.count().unwrap(), 1);
    }

    #[test]
    fn test_cursor_scan_collects_keys_in_order() {
        let dir = TempDir::new().unwrap();
        let env = Arc::new(EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap());

        let db: Database<String, String> = {
            let mut txn = env.write_txn().unwrap();
            let db = env.create_database(&mut txn, None).unwrap();
            for i in 0..5 {
                db.put(&mut txn, format!("key{i}"), format!("value{i}")).unwrap();
            }
            txn.commit().unwrap();
            db
        };

        let txn = env.read_txn().unwrap();
        let mut cursor: Cursor<'_, String, String> = db.cursor(&txn).unwrap();
        let mut seen = Vec::new();
        cursor
            .scan(CursorOp::First, CursorOp::Next, |key, _value| {
                seen.push(key.to_vec());
                false
            })
            .unwrap();
        assert_eq!(
            seen,
            vec![b"key0".to_vec(), b"key1".to_vec(), b"key2".to_vec(), b"key3".to_vec(), b"key4".to_vec()]
        );
    }

    #[test]
    fn test_cursor_scan_stops_when_predicate_returns_true() {
        let dir = TempDir::new().unwrap();
        let env = Arc::new(EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap());

        let db: Database<String, String> = {
            let mut txn = env.write_txn().unwrap();
            let db = env.create_database(&mut txn, None).unwrap();
            for i in 0..5 {
                db.put(&mut txn, format!("key{i}"), format!("value{i}")).unwrap();
            }
            txn.commit().unwrap();
            db
        };

        let txn = env.read_txn().unwrap();
        let mut cursor: Cursor<'_, String, String> = db.cursor(&txn).unwrap();
        let mut seen = Vec::new();
        cursor
            .scan(CursorOp::First, CursorOp::Next, |key, _value| {
                seen.push(key.to_vec());
                key == b"key2"
            })
            .unwrap();
        assert_eq!(seen, vec![b"key0".to_vec(), b"key1".to_vec(), b"key2".to_vec()]);
    }

    #[test]
    fn test_cursor_compare_orders_by_key() {
        let dir = TempDir::new().unwrap();
        let env = Arc::new(EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap());

        let db: Database<String, String> = {
            let mut txn = env.write_txn().unwrap();
            let db = env.create_database(&mut txn, None).unwrap();
            db.put(&mut txn, "key1".to_string(), "value1".to_string()).unwrap();
            db.put(&mut txn, "key2".to_string(), "value2".to_string()).unwrap();
            txn.commit().unwrap();
            db
        };

        let txn = env.read_txn().unwrap();
        let mut low: Cursor<'_, String, String> = db.cursor(&txn).unwrap();
        let mut high: Cursor<'_, String, String> = db.cursor(&txn).unwrap();
        low.seek(&"key1".to_string()).unwrap();
        high.seek(&"key2".to_string()).unwrap();
        assert_eq!(low.compare(&high).unwrap(), std::cmp::Ordering::Less);
        assert_eq!(high.compare(&low).unwrap(), std::cmp::Ordering::Greater);
    }
}
