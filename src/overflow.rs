//! Large-page storage for oversized values.
//!
//! A value bigger than the inline threshold is written into a single
//! contiguous run of pages. The leaf node holds only the head pgno; the
//! run's page count lives in the first page's header (`overflow` field) and
//! the total byte length is embedded in the first 8 bytes of that page's
//! data, so the value can be read back without the caller needing to carry
//! a size hint. The `_lmdb` variants accept the size/count already known to
//! the caller (from the referring node header) to skip that extra read.

use crate::error::{Error, PageId, Result};
use crate::page::{PageFlags, PAGE_SIZE};
use crate::txn::{mode::Mode, Transaction, Write};

/// Maximum value size that fits inline in a regular leaf node.
/// Mirrors `leaf_nodemax / 4`.
pub const MAX_INLINE_VALUE_SIZE: usize = PAGE_SIZE / 4;

const SIZE_PREFIX_LEN: usize = std::mem::size_of::<u64>();

fn data_per_page() -> usize {
    PAGE_SIZE - crate::page::PageHeader::SIZE
}

fn capacity_for(num_pages: usize) -> usize {
    num_pages * data_per_page() - SIZE_PREFIX_LEN
}

/// Whether a value of this size must be promoted to a large-page run.
pub fn needs_overflow(key_size: usize, value_size: usize) -> bool {
    key_size + value_size + crate::page::NodeHeader::SIZE > MAX_INLINE_VALUE_SIZE
}

/// Write a large value into a freshly allocated contiguous run of pages.
/// Returns the head pgno and the number of pages in the run.
pub fn write_overflow_value_lmdb<'txn>(
    txn: &mut Transaction<'txn, Write>,
    value: &[u8],
) -> Result<(PageId, u32)> {
    if value.is_empty() {
        return Err(Error::InvalidParameter("empty value for large page"));
    }

    let per_page = data_per_page();
    let num_pages = (value.len() + SIZE_PREFIX_LEN).div_ceil(per_page);
    let head = txn.alloc_pages_contiguous(num_pages, PageFlags::OVERFLOW)?;

    let mut written = 0usize;
    for i in 0..num_pages {
        let page_id = PageId(head.0 + i as u64);
        let page = txn.get_page_mut(page_id)?;
        page.header.overflow = num_pages as u32;

        if i == 0 {
            page.data[..SIZE_PREFIX_LEN].copy_from_slice(&(value.len() as u64).to_le_bytes());
            let chunk = std::cmp::min(per_page - SIZE_PREFIX_LEN, value.len());
            page.data[SIZE_PREFIX_LEN..SIZE_PREFIX_LEN + chunk].copy_from_slice(&value[..chunk]);
            written = chunk;
        } else {
            let chunk = std::cmp::min(per_page, value.len() - written);
            page.data[..chunk].copy_from_slice(&value[written..written + chunk]);
            written += chunk;
        }
    }

    Ok((head, num_pages as u32))
}

/// Write a large value, discarding the page-count result.
pub fn write_overflow_value<'txn>(txn: &mut Transaction<'txn, Write>, value: &[u8]) -> Result<PageId> {
    write_overflow_value_lmdb(txn, value).map(|(head, _)| head)
}

/// Read a large value back, using a page-count/size hint already known to
/// the caller (typically read off the referring node's header) to avoid an
/// extra lookup. Either hint may be omitted; the value embedded on the head
/// page is used as a fallback.
pub fn read_overflow_value_lmdb<'txn, M: Mode>(
    txn: &'txn Transaction<'txn, M>,
    head: PageId,
    count_hint: Option<u32>,
    size_hint: Option<usize>,
) -> Result<Vec<u8>> {
    let first_page = txn.get_page(head)?;
    if !first_page.header.flags.contains(PageFlags::OVERFLOW) {
        return Err(Error::Corruption { details: "expected a large page run".into(), page_id: Some(head) });
    }

    let num_pages = count_hint.unwrap_or(first_page.header.overflow) as usize;
    if num_pages == 0 {
        return Err(Error::Corruption {
            details: format!("large page run at {} has a zero page count", head.0),
            page_id: Some(head),
        });
    }

    let embedded_size = u64::from_le_bytes(first_page.data[..SIZE_PREFIX_LEN].try_into().unwrap()) as usize;
    let total_size = size_hint.unwrap_or(embedded_size);

    if total_size > capacity_for(num_pages) {
        return Err(Error::Corruption {
            details: format!("large page run at {} is too small for its stored value", head.0),
            page_id: Some(head),
        });
    }

    let per_page = data_per_page();
    let mut result = Vec::with_capacity(total_size);
    let mut remaining = total_size;
    for i in 0..num_pages {
        if remaining == 0 {
            break;
        }
        let page = if i == 0 { first_page } else { txn.get_page(PageId(head.0 + i as u64))? };
        if i == 0 {
            let chunk = std::cmp::min(per_page - SIZE_PREFIX_LEN, remaining);
            result.extend_from_slice(&page.data[SIZE_PREFIX_LEN..SIZE_PREFIX_LEN + chunk]);
            remaining -= chunk;
        } else {
            let chunk = std::cmp::min(per_page, remaining);
            result.extend_from_slice(&page.data[..chunk]);
            remaining -= chunk;
        }
    }

    Ok(result)
}

/// Read a large value back with no hints, recovering both the page count
/// and the byte length from the head page.
pub fn read_overflow_value<'txn, M: Mode>(txn: &'txn Transaction<'txn, M>, head: PageId) -> Result<Vec<u8>> {
    read_overflow_value_lmdb(txn, head, None, None)
}

/// Free every page in a large-page run, given the page count already known
/// to the caller.
pub fn free_overflow_chain_lmdb(txn: &mut Transaction<'_, Write>, head: PageId, count: u32) -> Result<()> {
    txn.free_pages(head, (count as usize).max(1))
}

/// Free every page in a large-page run, reading the page count off disk.
pub fn free_overflow_chain(txn: &mut Transaction<'_, Write>, head: PageId) -> Result<()> {
    let num_pages = {
        let page = txn.get_page(head)?;
        if !page.header.flags.contains(PageFlags::OVERFLOW) {
            return Err(Error::Corruption {
                details: "expected a large page run".into(),
                page_id: Some(head),
            });
        }
        page.header.overflow
    };
    free_overflow_chain_lmdb(txn, head, num_pages)
}

/// Copy a large-page run for copy-on-write, preserving contiguity.
pub fn copy_overflow_chain(txn: &mut Transaction<'_, Write>, old_head: PageId) -> Result<PageId> {
    let (num_pages, bytes): (usize, Vec<u8>) = {
        let old_first = txn.get_page(old_head)?;
        if !old_first.header.flags.contains(PageFlags::OVERFLOW) {
            return Err(Error::Corruption {
                details: "expected a large page run".into(),
                page_id: Some(old_head),
            });
        }
        let num_pages = old_first.header.overflow as usize;
        let mut bytes = Vec::with_capacity(num_pages * data_per_page());
        for i in 0..num_pages {
            let page = txn.get_page(PageId(old_head.0 + i as u64))?;
            bytes.extend_from_slice(&page.data);
        }
        (num_pages, bytes)
    };

    let new_head = txn.alloc_pages_contiguous(num_pages.max(1), PageFlags::OVERFLOW)?;
    let per_page = data_per_page();
    for i in 0..num_pages {
        let page = txn.get_page_mut(PageId(new_head.0 + i as u64))?;
        page.header.overflow = num_pages as u32;
        let start = i * per_page;
        let end = std::cmp::min(start + per_page, bytes.len());
        page.data[..end - start].copy_from_slice(&bytes[start..end]);
    }

    Ok(new_head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvBuilder;
    use tempfile::TempDir;

    #[test]
    fn large_value_round_trips_through_a_contiguous_run() {
        let dir = TempDir::new().unwrap();
        let env = EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap();

        let large_value = vec![0xAB; 10 * 1024];

        let mut txn = env.write_txn().unwrap();
        let head = write_overflow_value(&mut txn, &large_value).unwrap();
        let read_back = read_overflow_value(&txn, head).unwrap();
        assert_eq!(read_back, large_value);
        txn.commit().unwrap();

        let txn = env.read_txn().unwrap();
        let read_back = read_overflow_value(&txn, head).unwrap();
        assert_eq!(read_back, large_value);
    }

    #[test]
    fn large_value_run_is_contiguous() {
        let dir = TempDir::new().unwrap();
        let env = EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap();
        let large_value = vec![0x11; 3 * PAGE_SIZE];

        let mut txn = env.write_txn().unwrap();
        let (head, num_pages) = write_overflow_value_lmdb(&mut txn, &large_value).unwrap();
        assert!(num_pages >= 3);
        for i in 0..num_pages as u64 {
            let page = txn.get_page(PageId(head.0 + i)).unwrap();
            assert!(page.header.flags.contains(PageFlags::OVERFLOW));
        }
    }

    #[test]
    fn read_with_hints_matches_read_without_hints() {
        let dir = TempDir::new().unwrap();
        let env = EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap();
        let large_value = vec![0x42; 6000];

        let mut txn = env.write_txn().unwrap();
        let (head, count) = write_overflow_value_lmdb(&mut txn, &large_value).unwrap();
        let with_hints = read_overflow_value_lmdb(&txn, head, Some(count), Some(large_value.len())).unwrap();
        let without_hints = read_overflow_value(&txn, head).unwrap();
        assert_eq!(with_hints, large_value);
        assert_eq!(without_hints, large_value);
    }

    #[test]
    fn needs_overflow_threshold() {
        assert!(!needs_overflow(10, 100));
        assert!(!needs_overflow(100, 500));
        assert!(needs_overflow(100, 2000));
        assert!(needs_overflow(500, 1500));
    }
}
