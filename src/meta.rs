//! Meta page triplet and the troika that classifies it.
//!
//! The database keeps three meta pages at pgno 0, 1 and 2. Exactly one is
//! "head" (the one with the highest valid txnid), one is "steady" (the most
//! recent durably fsynced one) and the third is the rotation target for the
//! next commit. A meta page records its own commit twice, in `txnid_a`
//! before the body is written and in `txnid_b` after: `txnid_a == txnid_b`
//! is the torn-write fence.

use crate::error::{Error, PageId, Result, TransactionId};
use crate::page::{Page, PageFlags, PAGE_SIZE};
use static_assertions::const_assert;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};

/// Page numbers reserved for the meta triplet.
pub const META_PAGES: [PageId; 3] = [PageId(0), PageId(1), PageId(2)];

/// Page ID for meta slot 0.
pub const META_PAGE_1: PageId = META_PAGES[0];

/// Page ID for meta slot 1.
pub const META_PAGE_2: PageId = META_PAGES[1];

/// Page ID for meta slot 2.
pub const META_PAGE_3: PageId = META_PAGES[2];

/// Version of the on-disk meta format.
pub const DB_VERSION: u32 = 3;

/// Magic number identifying a data file (low 32 bits of the mdbx-style
/// `magic_and_version` constant, kept 32-bit here since the rest of the
/// struct is field-compatible with the earlier single-meta-page layout).
pub const MAGIC: u32 = 0x59659DBD;

/// Durability marker for a meta page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sign {
    /// No checksum recorded; page is not trusted as steady.
    None,
    /// Written but not confirmed durable (bootid mismatch after a crash).
    Weak,
    /// A steady checksum is present and matches the meta body.
    Steady(u32),
}

impl Sign {
    fn to_u64(self) -> u64 {
        match self {
            Sign::None => 0,
            Sign::Weak => 1,
            Sign::Steady(crc) => 2u64 + crc as u64,
        }
    }

    fn from_u64(v: u64) -> Self {
        match v {
            0 => Sign::None,
            1 => Sign::Weak,
            other => Sign::Steady((other - 2) as u32),
        }
    }
}

/// Database statistics surfaced to callers.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DbStats {
    /// Size of database in pages.
    pub psize: u32,
    /// Height of the tree.
    pub depth: u32,
    /// Number of internal pages.
    pub branch_pages: u64,
    /// Number of leaf pages.
    pub leaf_pages: u64,
    /// Number of large pages.
    pub overflow_pages: u64,
    /// Number of entries.
    pub entries: u64,
}

/// Tree descriptor (`tree_t`), stored in meta for GC and MAIN and as leaf
/// values in MAIN for user tables.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DbInfo {
    /// Database flags (e.g. INTEGERKEY, DUPSORT, DUPFIXED).
    pub flags: u32,
    /// Height of the tree (root-to-leaf edge count).
    pub depth: u32,
    /// Number of internal (branch) pages.
    pub branch_pages: u64,
    /// Number of leaf pages.
    pub leaf_pages: u64,
    /// Number of large (overflow) pages.
    pub overflow_pages: u64,
    /// Number of entries (key/value pairs, counting dup values).
    pub entries: u64,
    /// Root page number.
    pub root: PageId,
    /// Last key page for append optimization (0 = not cached).
    pub last_key_page: PageId,
    /// Monotonic per-table sequence counter.
    pub sequence: u64,
    /// Txnid of the last commit that modified this tree.
    pub mod_txnid: TransactionId,
    /// Uniform value size for a DUPFIXED table (0 if not dupfixed).
    pub dupfix_size: u16,
}

impl Default for DbInfo {
    fn default() -> Self {
        Self {
            flags: 0,
            depth: 0,
            branch_pages: 0,
            leaf_pages: 0,
            overflow_pages: 0,
            entries: 0,
            root: PageId(0),
            last_key_page: PageId(0),
            sequence: 0,
            mod_txnid: TransactionId(0),
            dupfix_size: 0,
        }
    }
}

/// A single meta page: one of the three rotating copies.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MetaPage {
    /// Magic number.
    pub magic: u32,
    /// Database format version.
    pub version: u32,
    /// Database-wide flags.
    pub flags: u32,
    /// Database page size.
    pub psize: u32,
    /// Max reader slots configured at env creation.
    pub maxreaders: u32,
    /// Number of named tables (kept for the lock-file ABI; unused by the
    /// in-process path).
    pub dbs: u32,
    /// Last allocated page number.
    pub last_pg: PageId,
    /// First half of the two-phase commit fence; equals the committed
    /// txnid when [`Self::is_torn`] is false.
    pub last_txnid: TransactionId,
    /// Total map size in bytes.
    pub mapsize: u64,
    /// Tree descriptor for the MAIN table.
    pub main_db: DbInfo,
    /// Tree descriptor for the GC / FREE_DBI table.
    pub free_db: DbInfo,
    /// User-settable canary quad, opaque to the engine.
    pub canary: [u64; 4],
    /// Durability marker, encoded.
    pub sign_raw: u64,
    /// Second half of the two-phase commit fence, written after the meta
    /// body so a crash between the two halves leaves `last_txnid !=
    /// txnid_b` and marks the meta torn.
    pub txnid_b: TransactionId,
    /// Cumulative count of pages retired as of this meta.
    pub pages_retired: u64,
    /// Boot id of the process that wrote this meta.
    pub bootid: u128,
}

impl MetaPage {
    /// Build a brand-new, empty meta page for txnid 0 (pre-first-commit).
    pub fn new() -> Self {
        Self {
            magic: MAGIC,
            version: DB_VERSION,
            flags: 0,
            psize: PAGE_SIZE as u32,
            maxreaders: 126,
            dbs: 2,
            last_pg: PageId(2),
            last_txnid: TransactionId(0),
            mapsize: 0,
            main_db: DbInfo::default(),
            free_db: DbInfo::default(),
            canary: [0; 4],
            sign_raw: Sign::None.to_u64(),
            txnid_b: TransactionId(0),
            pages_retired: 0,
            bootid: current_bootid(),
        }
    }

    /// Txnid recorded by this meta, valid only if [`Self::is_torn`] is
    /// false.
    pub fn txnid(&self) -> TransactionId {
        self.last_txnid
    }

    /// A meta is torn if its two-phase commit fence didn't land atomically,
    /// e.g. because of a crash between writing the body and `txnid_b`.
    pub fn is_torn(&self) -> bool {
        self.last_txnid != self.txnid_b
    }

    /// Mark both halves of the commit fence with the same txnid.
    pub fn set_txnid(&mut self, txnid: TransactionId) {
        self.last_txnid = txnid;
        self.txnid_b = txnid;
    }

    /// Durability marker, decoded from `sign_raw`.
    pub fn sign(&self) -> Sign {
        Sign::from_u64(self.sign_raw)
    }

    /// Mark this meta steady with the given checksum.
    pub fn set_sign(&mut self, sign: Sign) {
        self.sign_raw = sign.to_u64();
    }

    /// True if this meta is confirmed durable on disk.
    pub fn is_steady(&self) -> bool {
        matches!(self.sign(), Sign::Steady(_))
    }

    /// Validate format invariants; does not check txnid ordering across the
    /// triplet (see [`Troika::classify`] for that).
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(Error::Corruption {
                details: format!("invalid meta magic: 0x{:x}", self.magic),
                page_id: None,
            });
        }
        if self.version != DB_VERSION {
            return Err(Error::VersionMismatch { expected: DB_VERSION, found: self.version });
        }
        if self.psize as usize != PAGE_SIZE {
            return Err(Error::Corruption {
                details: format!("invalid page size: {}", self.psize),
                page_id: None,
            });
        }
        Ok(())
    }

    /// Serialize this meta into a fresh page at the given meta slot.
    pub fn to_page(&self, pgno: u64) -> Box<Page> {
        let mut page = Page::new(PageId(pgno), PageFlags::META);
        unsafe {
            let meta_ptr = page.data.as_mut_ptr() as *mut MetaPage;
            std::ptr::write_unaligned(meta_ptr, *self);
        }
        page
    }

    /// Read a meta page out of its on-disk representation.
    pub fn from_page(page: &Page) -> Result<Self> {
        if !page.header.flags.contains(PageFlags::META) {
            return Err(Error::InvalidPageType {
                expected: crate::error::PageType::Meta,
                found: page.header.page_type(),
            });
        }
        let meta = unsafe { std::ptr::read_unaligned(page.data.as_ptr() as *const MetaPage) };
        meta.validate()?;
        Ok(meta)
    }
}

impl Default for MetaPage {
    fn default() -> Self {
        Self::new()
    }
}

fn current_bootid() -> u128 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let pid = std::process::id() as u128;
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed) as u128;
    (pid << 64) | seq
}

/// Classification of the three meta slots, recomputed after every commit
/// and whenever an environment is opened.
#[derive(Debug, Clone, Copy)]
pub struct Troika {
    /// Txnid recorded by each of the three slots, in slot order.
    pub txnids: [TransactionId; 3],
    /// Index (0..3) of the slot with the highest valid (non-torn) txnid.
    pub recent: usize,
    /// Index of the most recent slot whose sign is steady, if any.
    pub steady: Option<usize>,
    /// Index of the slot that should receive the next commit.
    pub tail: usize,
}

impl Troika {
    /// Classify three meta pages already loaded from disk.
    pub fn classify(metas: &[MetaPage; 3]) -> Self {
        let txnids = [metas[0].txnid(), metas[1].txnid(), metas[2].txnid()];

        let mut recent = 0;
        for i in 1..3 {
            let recent_valid = !metas[recent].is_torn();
            let i_valid = !metas[i].is_torn();
            if i_valid && (!recent_valid || txnids[i] > txnids[recent]) {
                recent = i;
            }
        }

        let mut steady: Option<usize> = None;
        for i in 0..3 {
            if metas[i].is_steady() && !metas[i].is_torn() {
                steady = match steady {
                    Some(s) if txnids[s] >= txnids[i] => Some(s),
                    _ => Some(i),
                };
            }
        }

        let mut tail = 0;
        let mut tail_found = false;
        for i in 0..3 {
            if i == recent || Some(i) == steady {
                continue;
            }
            if !tail_found || txnids[i] < txnids[tail] {
                tail = i;
                tail_found = true;
            }
        }
        if !tail_found {
            // All three slots coincide (fresh database); rotate through 0,1,2.
            tail = (recent + 1) % 3;
        }

        Self { txnids, recent, steady, tail }
    }

    /// Pgno of the recent (head) meta slot.
    pub fn head_pgno(&self) -> PageId {
        META_PAGES[self.recent]
    }

    /// Pgno of the steady meta slot, if any is confirmed durable.
    pub fn steady_pgno(&self) -> Option<PageId> {
        self.steady.map(|i| META_PAGES[i])
    }

    /// Pgno the next commit should write into.
    pub fn tail_pgno(&self) -> PageId {
        META_PAGES[self.tail]
    }
}

const_assert!(size_of::<MetaPage>() < PAGE_SIZE - size_of::<crate::page::PageHeader>());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_page_fits_in_a_page() {
        assert!(size_of::<MetaPage>() < PAGE_SIZE - size_of::<crate::page::PageHeader>());
    }

    #[test]
    fn meta_page_validation() {
        let meta = MetaPage::new();
        assert!(meta.validate().is_ok());

        let mut bad = meta;
        bad.magic = 0xDEAD_BEEF;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn meta_page_roundtrips_through_a_page() {
        let mut meta = MetaPage::new();
        meta.set_txnid(TransactionId(7));
        let page = meta.to_page(0);
        assert!(page.header.flags.contains(PageFlags::META));

        let meta2 = MetaPage::from_page(&page).unwrap();
        assert_eq!(meta2.txnid(), TransactionId(7));
        assert!(!meta2.is_torn());
    }

    #[test]
    fn torn_meta_is_detected() {
        let mut meta = MetaPage::new();
        meta.last_txnid = TransactionId(5);
        meta.txnid_b = TransactionId(4);
        assert!(meta.is_torn());
    }

    #[test]
    fn troika_picks_highest_non_torn_as_recent() {
        let mut metas = [MetaPage::new(), MetaPage::new(), MetaPage::new()];
        metas[0].set_txnid(TransactionId(1));
        metas[0].set_sign(Sign::Steady(0));
        metas[1].set_txnid(TransactionId(3));
        metas[2].last_txnid = TransactionId(2);
        metas[2].txnid_b = TransactionId(1); // torn

        let troika = Troika::classify(&metas);
        assert_eq!(troika.recent, 1);
        assert_eq!(troika.steady, Some(0));
        assert_eq!(troika.tail, 2);
    }

    #[test]
    fn troika_rotates_through_fresh_triplet() {
        let metas = [MetaPage::new(), MetaPage::new(), MetaPage::new()];
        let troika = Troika::classify(&metas);
        assert_eq!(troika.recent, 0);
        assert_ne!(troika.tail, troika.recent);
    }
}
