//! Reader slot management for MVCC
//!
//! This module manages reader slots to track active read transactions
//! and determine which pages can be safely recycled.

use crate::error::{Error, Result, TransactionId};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum number of readers
pub const MAX_READERS: usize = 126;

/// Sentinel `tid` value written by `txn_park`: the reader is parked and may
/// be preempted by a writer racing to reclaim its snapshot.
pub const TXN_PARKED: u64 = u64::MAX - 1;
/// Sentinel `tid` value a writer CASes into a parked slot to evict it.
pub const TXN_OUSTED: u64 = u64::MAX;

/// Reader slot information stored in shared memory
#[repr(C)]
#[derive(Debug)]
pub struct ReaderSlot {
    /// Process ID
    pub pid: AtomicU32,
    /// Thread ID
    pub tid: AtomicU64,
    /// Transaction ID being read
    pub txn_id: AtomicU64,
    /// Timestamp when slot was acquired (for stale reader detection)
    pub timestamp: AtomicU64,
    /// Highest pgno in use by this reader's snapshot, published after
    /// `txn_id` so an acquire-load of `txn_id` also observes this bound.
    pub snapshot_pages_used: AtomicU64,
    /// Count of pages retired (freed) as of this reader's snapshot.
    pub snapshot_pages_retired: AtomicU64,
}

impl ReaderSlot {
    /// Create a new empty reader slot
    pub fn new() -> Self {
        Self {
            pid: AtomicU32::new(0),
            tid: AtomicU64::new(0),
            txn_id: AtomicU64::new(0),
            timestamp: AtomicU64::new(0),
            snapshot_pages_used: AtomicU64::new(0),
            snapshot_pages_retired: AtomicU64::new(0),
        }
    }

    /// Publish this reader's snapshot bounds. Must be called after
    /// `txn_id` is stored so a concurrent reader of the slot that observes
    /// the new `txn_id` also observes a consistent page bound.
    pub fn publish_snapshot(&self, pages_used: u64, pages_retired: u64) {
        self.snapshot_pages_used.store(pages_used, Ordering::Release);
        self.snapshot_pages_retired.store(pages_retired, Ordering::Release);
    }

    /// Park this reader: swap `tid` for `TXN_PARKED` so a writer racing to
    /// reclaim pages may preempt it via `TXN_OUSTED`. Returns the previous
    /// `tid` so the caller can restore it on unpark.
    pub fn txn_park(&self) -> u64 {
        self.tid.swap(TXN_PARKED, Ordering::AcqRel)
    }

    /// Reverse a park. Returns `Err(())` if a writer preempted the slot
    /// with `TXN_OUSTED` in the meantime (the caller's transaction must
    /// abort).
    pub fn txn_unpark(&self, original_tid: u64) -> std::result::Result<(), ()> {
        match self.tid.compare_exchange(TXN_PARKED, original_tid, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Ok(()),
            Err(TXN_OUSTED) => Err(()),
            Err(_) => Ok(()),
        }
    }

    /// Attempt to oust a parked reader, claiming its slot for reclamation.
    /// Only succeeds if the slot is currently parked.
    pub fn try_oust(&self) -> bool {
        self.tid.compare_exchange(TXN_PARKED, TXN_OUSTED, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// Check if this slot is free
    pub fn is_free(&self) -> bool {
        self.pid.load(Ordering::Acquire) == 0
    }

    /// Try to acquire this slot
    pub fn try_acquire(&self, txn_id: TransactionId) -> bool {
        // Try to atomically set PID from 0 to current process ID
        let pid = std::process::id();
        let old_pid = self.pid.compare_exchange(0, pid, Ordering::AcqRel, Ordering::Acquire);

        if old_pid.is_ok() {
            // Successfully acquired the slot
            self.tid.store(thread_id(), Ordering::Release);
            self.timestamp.store(current_timestamp(), Ordering::Release);
            self.snapshot_pages_used.store(0, Ordering::Release);
            self.snapshot_pages_retired.store(0, Ordering::Release);
            // txn_id published last: publish_snapshot above is a no-op
            // placeholder until the caller reports real page bounds, but
            // txn_id is the field other readers gate on.
            self.txn_id.store(txn_id.0, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Release this slot
    pub fn release(&self) {
        // Clear transaction ID first to ensure readers see consistent state
        self.txn_id.store(0, Ordering::Release);
        self.tid.store(0, Ordering::Release);
        self.timestamp.store(0, Ordering::Release);
        self.snapshot_pages_used.store(0, Ordering::Release);
        self.snapshot_pages_retired.store(0, Ordering::Release);
        // Clear PID last to make slot available
        self.pid.store(0, Ordering::Release);
    }

    /// Check if this slot is stale (process died without releasing)
    pub fn is_stale(&self) -> bool {
        let pid = self.pid.load(Ordering::Acquire);
        if pid == 0 {
            return false;
        }

        // Check if process is still alive
        #[cfg(unix)]
        {
            unsafe {
                // Send signal 0 to check if process exists
                libc::kill(pid as i32, 0) != 0
            }
        }

        #[cfg(not(unix))]
        {
            // On non-Unix systems, use a timeout approach
            let timestamp = self.timestamp.load(Ordering::Acquire);
            let now = current_timestamp();
            // Consider stale after 5 minutes of inactivity
            now.saturating_sub(timestamp) > 300_000_000_000 // 5 minutes in nanoseconds
        }
    }
}

/// Reader table for managing all reader slots
pub struct ReaderTable {
    /// Array of reader slots
    slots: Vec<ReaderSlot>,
}

impl ReaderTable {
    /// Create a new reader table
    pub fn new(max_readers: usize) -> Self {
        let mut slots = Vec::with_capacity(max_readers);
        for _ in 0..max_readers {
            slots.push(ReaderSlot::new());
        }
        Self { slots }
    }

    /// Try to acquire a reader slot
    pub fn acquire(&self, txn_id: TransactionId) -> Result<usize> {
        // First pass: try to find a free slot
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.try_acquire(txn_id) {
                return Ok(i);
            }
        }

        // Second pass: check for stale slots
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.is_stale() {
                // Force release the stale slot
                slot.release();
                if slot.try_acquire(txn_id) {
                    return Ok(i);
                }
            }
        }

        Err(Error::ReadersFull)
    }

    /// Release a reader slot
    pub fn release(&self, slot_index: usize) {
        if let Some(slot) = self.slots.get(slot_index) {
            slot.release();
        }
    }

    /// Get the oldest active reader transaction ID
    pub fn oldest_reader(&self) -> Option<TransactionId> {
        let mut oldest = None;

        for slot in &self.slots {
            let txn_id = slot.txn_id.load(Ordering::Acquire);
            if txn_id > 0 {
                match oldest {
                    None => oldest = Some(TransactionId(txn_id)),
                    Some(TransactionId(old)) if txn_id < old => {
                        oldest = Some(TransactionId(txn_id));
                    }
                    _ => {}
                }
            }
        }

        oldest
    }

    /// Clean up stale reader slots
    pub fn cleanup_stale(&self) -> usize {
        let mut cleaned = 0;

        for slot in &self.slots {
            if slot.is_stale() {
                slot.release();
                cleaned += 1;
            }
        }

        cleaned
    }

    /// Get all active reader transaction IDs
    pub fn active_readers(&self) -> Vec<TransactionId> {
        let mut readers = Vec::new();

        for slot in &self.slots {
            let txn_id = slot.txn_id.load(Ordering::Acquire);
            if txn_id > 0 {
                readers.push(TransactionId(txn_id));
            }
        }

        readers
    }

    /// Get reader count
    pub fn reader_count(&self) -> usize {
        self.slots.iter().filter(|slot| !slot.is_free()).count()
    }

    /// Bind a slot for the calling thread, the same as `acquire` (kept as
    /// a separate name to mirror the bind/unbind pairing of park/unpark).
    pub fn bind_slot(&self, txn_id: TransactionId) -> Result<usize> {
        self.acquire(txn_id)
    }

    /// Record a reader's snapshot page bounds once it knows them (e.g.
    /// after reading the meta page it will use).
    pub fn publish_snapshot(&self, slot_index: usize, pages_used: u64, pages_retired: u64) {
        if let Some(slot) = self.slots.get(slot_index) {
            slot.publish_snapshot(pages_used, pages_retired);
        }
    }

    /// Lowest txnid across live readers, or `steady` if none are lagging
    /// behind it.
    pub fn snapshot_oldest(&self, steady: TransactionId) -> TransactionId {
        self.oldest_reader().map(|oldest| oldest.min(steady)).unwrap_or(steady)
    }

    /// Probe every slot's liveness and clear any whose owning process has
    /// died. Returns the number of slots cleared.
    pub fn cleanup_dead(&self) -> usize {
        self.cleanup_stale()
    }

    /// Park a reader slot so a writer may preempt it if it is blocking GC
    /// progress. Returns the original tid, needed to unpark later.
    pub fn park(&self, slot_index: usize) -> Option<u64> {
        self.slots.get(slot_index).map(|slot| slot.txn_park())
    }

    /// Reverse `park`. `Err(())` means a writer ousted the slot while
    /// parked; the caller's transaction must be treated as aborted.
    pub fn unpark(&self, slot_index: usize, original_tid: u64) -> std::result::Result<(), ()> {
        match self.slots.get(slot_index) {
            Some(slot) => slot.txn_unpark(original_tid),
            None => Ok(()),
        }
    }

    /// Repeatedly try to make room for a writer blocked behind a reader
    /// pinning an old snapshot ("the straggler"). Invokes `hsr_callback`
    /// for each attempt; stops retrying once the oldest reader has moved
    /// past `straggler` or the callback asks to give up.
    ///
    /// Callback contract (mirrors the reporting codes used elsewhere in
    /// this module): return `<0` to abort the whole operation with
    /// `Error::MapFull`, `1` to mean "writer should retry later", `2` to
    /// mean "the pid is dead, its slot was cleared", `0` to keep looping.
    pub fn kick_laggards<F>(&self, straggler: TransactionId, mut hsr_callback: F) -> Result<()>
    where
        F: FnMut(&ReaderInfo, TransactionId) -> i32,
    {
        loop {
            let laggard = self.enumerate_readers().into_iter().find(|r| r.txn_id <= straggler);

            let Some(laggard) = laggard else {
                return Ok(());
            };

            if laggard.is_stale {
                self.release(laggard.slot_index);
                continue;
            }

            match hsr_callback(&laggard, straggler) {
                code if code < 0 => return Err(Error::MapFull),
                1 => return Ok(()),
                2 => {
                    self.release(laggard.slot_index);
                }
                _ => continue,
            }
        }
    }

    /// Enumerate all active readers with detailed information
    pub fn enumerate_readers(&self) -> Vec<ReaderInfo> {
        let mut readers = Vec::new();

        for (slot_idx, slot) in self.slots.iter().enumerate() {
            let pid = slot.pid.load(Ordering::Acquire);
            if pid > 0 {
                readers.push(ReaderInfo {
                    slot_index: slot_idx,
                    pid,
                    tid: slot.tid.load(Ordering::Acquire),
                    txn_id: TransactionId(slot.txn_id.load(Ordering::Acquire)),
                    timestamp: slot.timestamp.load(Ordering::Acquire),
                    is_stale: slot.is_stale(),
                });
            }
        }

        readers
    }
}

/// Detailed information about an active reader
#[derive(Debug, Clone)]
pub struct ReaderInfo {
    /// Slot index
    pub slot_index: usize,
    /// Process ID
    pub pid: u32,
    /// Thread ID
    pub tid: u64,
    /// Transaction ID
    pub txn_id: TransactionId,
    /// Timestamp when acquired (nanoseconds since epoch)
    pub timestamp: u64,
    /// Whether this reader appears to be stale
    pub is_stale: bool,
}

impl ReaderInfo {
    /// Get age of this reader in seconds
    pub fn age_seconds(&self) -> u64 {
        let now = current_timestamp();
        (now.saturating_sub(self.timestamp)) / 1_000_000_000
    }
}

/// Get current thread ID
fn thread_id() -> u64 {
    #[cfg(unix)]
    {
        unsafe { libc::pthread_self() as u64 }
    }

    #[cfg(windows)]
    {
        unsafe { windows_sys::Win32::System::Threading::GetCurrentThreadId() as u64 }
    }

    #[cfg(not(any(unix, windows)))]
    {
        // Fallback: use thread local storage address as ID
        thread_local! {
            static THREAD_ID: u8 = 0;
        }
        THREAD_ID.with(|id| id as *const _ as u64)
    }
}

/// Get current timestamp in nanoseconds
fn current_timestamp() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64
}
