//! Crate-wide error taxonomy.
//!
//! Every fallible path in the engine returns `Result<T>` built on this single
//! enum; the `?` operator is the only propagation mechanism. A write
//! transaction that hits a variant which leaves shared structures
//! inconsistent (`Corruption`, `BadSignature`) should be treated as poisoned
//! by its caller rather than retried.

use std::borrow::Cow;
use std::fmt;
use std::io;
use thiserror::Error;

/// The main error type for engine operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(String),

    /// Transaction conflict detected
    #[error("Transaction conflict: {0}")]
    Conflict(ConflictDetails),

    /// Database corruption detected
    #[error("Corruption detected: {details}")]
    Corruption {
        /// Description of the corruption
        details: String,
        /// Page where corruption was detected
        page_id: Option<PageId>,
    },

    /// Key not found in database
    #[error("Key not found")]
    KeyNotFound,

    /// Database is full
    #[error("Database full: current size is {current_size} bytes, max is {max_size} bytes")]
    DatabaseFull {
        /// Current database size
        current_size: u64,
        /// Maximum allowed size
        max_size: u64,
    },

    /// Invalid operation attempted
    #[error("Invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// Version mismatch
    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected version
        expected: u32,
        /// Found version
        found: u32,
    },

    /// Bad transaction
    #[error("Bad transaction")]
    BadTransaction,

    /// Invalid database
    #[error("Invalid database")]
    InvalidDatabase,

    /// Page not found
    #[error("Page {0} not found")]
    PageNotFound(PageId),

    /// Encoding error
    #[error("Encoding error: {0}")]
    Encoding(Cow<'static, str>),

    /// Decoding error
    #[error("Decoding error: {0}")]
    Decoding(Cow<'static, str>),

    /// Environment already open
    #[error("Environment already open")]
    EnvironmentAlreadyOpen,

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// The map is out of address space at its configured size; growing the
    /// file further would exceed `map_size`.
    #[error("map is full at the configured size")]
    MapFull,

    /// The environment's named-table slots are all taken.
    #[error("too many named tables open")]
    DbsFull,

    /// Reader table full
    #[error("Reader table full")]
    ReadersFull,

    /// Transaction too big
    #[error("Transaction too big: {size} bytes")]
    TxnFull {
        /// Size that was attempted
        size: usize,
    },

    /// A cursor's position stack would exceed its bounded depth.
    #[error("cursor stack is full")]
    CursorFull,

    /// A page cannot accept one more node at its current fill.
    #[error("page has no more space")]
    PageFull,

    /// The backing file could not be extended to satisfy an allocation.
    #[error("unable to extend the map to satisfy allocation")]
    UnableExtendMapsize,

    /// An operation flag combination is not valid for this table's mode.
    #[error("incompatible operation for this table's flags")]
    Incompatible,

    /// Cursor is not positioned
    #[error("Cursor is not positioned")]
    NotFound,

    /// Invalid page ID
    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),

    /// Invalid page type
    #[error("Invalid page type: expected {expected:?}, found {found:?}")]
    InvalidPageType {
        /// Expected page type
        expected: PageType,
        /// Found page type
        found: PageType,
    },

    /// Database corrupted
    #[error("Database corrupted")]
    Corrupted,

    /// The calling thread holds no claimed reader slot, or its slot was
    /// reclaimed by a dead-pid sweep before use.
    #[error("no reader slot bound to this thread")]
    BadReaderSlot,

    /// The value's length falls outside what this table accepts.
    #[error("bad value size")]
    BadValSize,

    /// The dbi handle is stale: it was invalidated by a later `dbi_open`
    /// sequence bump, or never valid in this environment.
    #[error("bad or stale table handle")]
    BadDbi,

    /// An internal consistency check failed outside the `Corruption` path
    /// (e.g. an assertion on bookkeeping state, not on-disk content).
    #[error("internal consistency problem: {0}")]
    Problem(Cow<'static, str>),

    /// The resource is held by another transaction or process right now;
    /// the caller may retry.
    #[error("resource busy")]
    Busy,

    /// A DUPSORT operation was attempted against more than one value where
    /// exactly one was required.
    #[error("key has multiple values")]
    MultiValue,

    /// A meta page's `sign` does not match its recomputed checksum.
    #[error("meta page signature mismatch")]
    BadSignature,

    /// No steady meta was found and the caller opened read-only, so the
    /// engine cannot roll back to recover; reopen read-write.
    #[error("recovery required but environment was opened read-only")]
    WannaRecovery,

    /// A key supplied to a fixed-comparator table does not match that
    /// comparator's expected encoding.
    #[error("key does not match table's key encoding")]
    KeyMismatch,

    /// A key or value exceeds the maximum this implementation can store.
    #[error("key or value too large")]
    TooLarge,

    /// A transaction or cursor was used from a thread other than the one
    /// that created it, and the table's mode forbids that.
    #[error("operation performed from the wrong thread")]
    ThreadMismatch,

    /// A nested write transaction overlaps its parent's uncommitted state
    /// in a way that is not permitted.
    #[error("overlapping transactions")]
    TxnOverlapping,

    /// The GC's reclaimed-page backlog was exhausted before the requested
    /// allocation could be satisfied.
    #[error("GC backlog depleted before allocation could be satisfied")]
    BacklogDepleted,

    /// Two GC records were produced for the same committing txnid.
    #[error("duplicated commit clock value")]
    DuplicatedClock,

    /// A table handle was dropped while still referenced by another open
    /// transaction.
    #[error("table handle still open elsewhere")]
    DanglingDbi,

    /// A parked reader slot was preempted by a writer before it could
    /// resume.
    #[error("reader slot was ousted by a writer")]
    Ousted,

    /// The oldest-reader computation observed a snapshot older than what
    /// GC already reclaimed; the reader must restart.
    #[error("reader snapshot fell behind reclaimed GC state")]
    MvccRetarded,

    /// Custom error
    #[error("{0}")]
    Custom(Cow<'static, str>),
}

/// Details about a transaction conflict
#[derive(Debug, Clone)]
pub struct ConflictDetails {
    /// The transaction that had the conflict
    pub txn_id: TransactionId,
    /// The page that was in conflict
    pub conflicting_page: PageId,
    /// The operation that caused the conflict
    pub operation: Operation,
}

impl fmt::Display for ConflictDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "transaction {} conflicted on page {} during {:?}",
            self.txn_id, self.conflicting_page, self.operation
        )
    }
}

/// Type of database operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Read operation
    Read,
    /// Write operation
    Write,
    /// Delete operation
    Delete,
    /// Cursor operation
    Cursor,
}

/// Page identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub u64);

impl PageId {
    /// Convert to byte offset in file
    pub fn to_offset(self, page_size: usize) -> u64 {
        self.0 * page_size as u64
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Page type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    /// Branch page (internal node)
    Branch,
    /// Leaf page (contains data)
    Leaf,
    /// Overflow page (for large data)
    Overflow,
    /// Meta page (database metadata)
    Meta,
    /// Free page
    Free,
}

/// Result type alias for zerodb operations
pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl Error {
    /// Best-effort classification of a raw OS error into this taxonomy, used
    /// when a syscall fails with an errno the caller wants to react to
    /// (e.g. treating `ENOSPC` as `MapFull` rather than a generic `Io`).
    pub fn from_os_error(err: &io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) if code == libc::ENOSPC => Error::MapFull,
            Some(code) if code == libc::EACCES => Error::Io("permission denied".to_string()),
            Some(code) if code == libc::EBUSY => Error::Busy,
            Some(code) if code == libc::EINVAL => Error::InvalidParameter("invalid parameter"),
            _ => Error::Io(err.to_string()),
        }
    }
}
