//! Database integrity checker.
//!
//! Walks every table's page graph the same way [`crate::tree_utils`] does for
//! GC, fills in a `pagemap[pgno] -> table index`, and cross-checks the walk
//! against what the GC freelist believes is unused. A table's root is
//! revisited at most [`MAX_DEPTH`] branch levels deep; anything past that is
//! reported as a cycle rather than walked forever.

use crate::catalog::Catalog;
use crate::error::{PageId, Result};
use crate::meta::{META_PAGE_1, META_PAGE_2, META_PAGE_3};
use crate::page::PageFlags;
use crate::txn::Transaction;
use std::collections::HashMap;

/// Depth past which a table's branch structure is treated as cyclic rather
/// than legitimately deep.
const MAX_DEPTH: u32 = 42;

/// How serious a single finding is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Worth surfacing but does not indicate on-disk corruption (e.g. an
    /// unusually deep tree).
    Warning,
    /// The database is internally inconsistent.
    Error,
}

/// A single integrity finding.
#[derive(Debug, Clone)]
pub struct Finding {
    /// How serious this finding is.
    pub severity: Severity,
    /// Human-readable description.
    pub message: String,
    /// The page this finding is about, if any.
    pub page_id: Option<PageId>,
}

impl Finding {
    fn error(page_id: Option<PageId>, message: impl Into<String>) -> Self {
        Self { severity: Severity::Error, message: message.into(), page_id }
    }

    fn warning(page_id: Option<PageId>, message: impl Into<String>) -> Self {
        Self { severity: Severity::Warning, message: message.into(), page_id }
    }
}

/// Report produced by [`check_database`].
#[derive(Debug, Default)]
pub struct Report {
    /// Every finding, most examined first.
    pub findings: Vec<Finding>,
}

impl Report {
    /// No `Error`-severity finding was produced.
    pub fn is_clean(&self) -> bool {
        !self.findings.iter().any(|f| f.severity == Severity::Error)
    }
}

/// Walk every table reachable from the catalog plus the GC table itself,
/// and report any page reachability or bookkeeping inconsistency found.
///
/// This never mutates the database; it is safe to run against a read
/// transaction while other readers (and the one writer) are active, since
/// MVCC guarantees the snapshot it walks cannot change underneath it.
pub fn check_database<M: crate::txn::mode::Mode>(txn: &Transaction<'_, M>) -> Result<Report> {
    let mut report = Report::default();
    let mut pagemap: HashMap<PageId, i64> = HashMap::new();

    let mut tables: Vec<(i64, String, PageId)> = Vec::new();
    let main_db = txn.db_info(None)?;
    tables.push((-1, "main".to_string(), main_db.root));

    for (index, (name, info)) in Catalog::list_databases(txn)?.into_iter().enumerate() {
        tables.push((index as i64, name, info.root));
    }

    for (table_index, name, root) in &tables {
        if *root == PageId(0) {
            continue;
        }
        walk_table(txn, *root, *table_index, name, &mut pagemap, &mut report)?;
    }

    let meta = txn.data.env.inner().meta()?;
    if meta.free_db.root != PageId(0) {
        walk_table(txn, meta.free_db.root, -2, "gc", &mut pagemap, &mut report)?;
    }

    let freelist = crate::freelist::FreeList::load(txn, &meta.free_db).unwrap_or_default();
    for pgno in freelist.all_known_pages() {
        match pagemap.insert(pgno, -2) {
            Some(other) if other != -2 => {
                report.findings.push(Finding::error(
                    Some(pgno),
                    format!("page {} is both live (table {}) and on the GC freelist", pgno.0, other),
                ));
            }
            _ => {}
        }
    }

    let meta_pages = [META_PAGE_1, META_PAGE_2, META_PAGE_3];
    let last_pg = meta.last_pg.0;
    for pgno in 0..=last_pg {
        if meta_pages.contains(&PageId(pgno)) {
            continue;
        }
        if !pagemap.contains_key(&PageId(pgno)) {
            report.findings.push(Finding::warning(
                Some(PageId(pgno)),
                format!("page {} is below the high-water mark but neither reachable nor on the freelist", pgno),
            ));
        }
    }

    Ok(report)
}

fn walk_table<M: crate::txn::mode::Mode>(
    txn: &Transaction<'_, M>,
    root: PageId,
    table_index: i64,
    table_name: &str,
    pagemap: &mut HashMap<PageId, i64>,
    report: &mut Report,
) -> Result<()> {
    walk_page(txn, root, table_index, table_name, 0, pagemap, report)
}

fn walk_page<M: crate::txn::mode::Mode>(
    txn: &Transaction<'_, M>,
    page_id: PageId,
    table_index: i64,
    table_name: &str,
    depth: u32,
    pagemap: &mut HashMap<PageId, i64>,
    report: &mut Report,
) -> Result<()> {
    if depth > MAX_DEPTH {
        report.findings.push(Finding::error(
            Some(page_id),
            format!("table '{}' exceeds max walk depth ({}); likely a cycle", table_name, MAX_DEPTH),
        ));
        return Ok(());
    }

    if let Some(&owner) = pagemap.get(&page_id) {
        if owner != table_index {
            report.findings.push(Finding::error(
                Some(page_id),
                format!(
                    "page {} reachable from both table {} and table '{}'",
                    page_id.0, owner, table_name
                ),
            ));
        }
        return Ok(());
    }
    pagemap.insert(page_id, table_index);

    let page = txn.get_page(page_id)?;

    if page.header.flags.contains(PageFlags::BRANCH) {
        let leftmost = crate::branch::BranchPage::get_leftmost_child(page)?;
        walk_page(txn, leftmost, table_index, table_name, depth + 1, pagemap, report)?;

        for i in 0..page.header.num_keys as usize {
            let node = page.node(i)?;
            let child = node.page_number()?;
            walk_page(txn, child, table_index, table_name, depth + 1, pagemap, report)?;
        }
    } else if page.header.flags.contains(PageFlags::LEAF) {
        for i in 0..page.header.num_keys as usize {
            let node = page.node(i)?;
            if let Some(head) = node.overflow_page()? {
                walk_overflow_run(txn, head, table_index, table_name, pagemap, report)?;
            }
        }
    }

    Ok(())
}

fn walk_overflow_run<M: crate::txn::mode::Mode>(
    txn: &Transaction<'_, M>,
    head: PageId,
    table_index: i64,
    table_name: &str,
    pagemap: &mut HashMap<PageId, i64>,
    report: &mut Report,
) -> Result<()> {
    let first = txn.get_page(head)?;
    if !first.header.flags.contains(PageFlags::OVERFLOW) {
        report.findings.push(Finding::error(
            Some(head),
            format!("table '{}' leaf points at {} but it is not a large-page head", table_name, head.0),
        ));
        return Ok(());
    }

    let num_pages = first.header.overflow.max(1) as u64;
    for i in 0..num_pages {
        let pgno = PageId(head.0 + i);
        if let Some(&owner) = pagemap.get(&pgno) {
            if owner != table_index {
                report.findings.push(Finding::error(
                    Some(pgno),
                    format!(
                        "large-page run page {} reachable from both table {} and table '{}'",
                        pgno.0, owner, table_name
                    ),
                ));
                continue;
            }
        }
        pagemap.insert(pgno, table_index);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DatabaseFlags;
    use crate::env::EnvBuilder;
    use tempfile::TempDir;

    #[test]
    fn empty_database_is_clean() {
        let dir = TempDir::new().unwrap();
        let env = std::sync::Arc::new(EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap());

        let txn = env.read_txn().unwrap();
        let report = check_database(&txn).unwrap();
        assert!(report.is_clean(), "unexpected findings: {:?}", report.findings);
    }

    #[test]
    fn populated_tables_stay_clean() {
        let dir = TempDir::new().unwrap();
        let env = std::sync::Arc::new(EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap());

        {
            let mut txn = env.write_txn().unwrap();
            let db: crate::db::Database<String, String> =
                env.create_database_with_flags(&mut txn, Some("widgets"), DatabaseFlags::empty()).unwrap();
            for i in 0..200 {
                db.put(&mut txn, format!("key{i:04}"), "x".repeat(64)).unwrap();
            }
            txn.commit().unwrap();
        }

        let txn = env.read_txn().unwrap();
        let report = check_database(&txn).unwrap();
        assert!(report.is_clean(), "unexpected findings: {:?}", report.findings);
    }

    #[test]
    fn deleting_and_recreating_a_table_stays_clean() {
        let dir = TempDir::new().unwrap();
        let env = std::sync::Arc::new(EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap());

        {
            let mut txn = env.write_txn().unwrap();
            let db: crate::db::Database<String, String> =
                env.create_database(&mut txn, Some("scratch")).unwrap();
            db.put(&mut txn, "a".to_string(), "1".to_string()).unwrap();
            txn.commit().unwrap();
        }
        {
            let mut txn = env.write_txn().unwrap();
            env.drop_database(&mut txn, "scratch").unwrap();
            txn.commit().unwrap();
        }

        let txn = env.read_txn().unwrap();
        let report = check_database(&txn).unwrap();
        assert!(report.is_clean(), "unexpected findings: {:?}", report.findings);
    }
}
