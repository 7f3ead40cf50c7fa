//! Per-transfer state: chunk ledger, counters, and congestion controller.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::Mutex;

use drift_core::{CongestionControl, Priority};

/// Lock-free transfer counters.
///
/// Every field is independently atomic; readers take a [`snapshot`] without
/// any lock. `completed` latches: once set it is never cleared. `paused` is
/// freely toggled.
///
/// [`snapshot`]: TransferStats::snapshot
#[derive(Debug, Default)]
pub struct TransferStats {
    bytes_sent: AtomicU64,
    bytes_acked: AtomicU64,
    chunks_sent: AtomicU32,
    chunks_acked: AtomicU32,
    retransmissions: AtomicU32,
    /// f64 bits of the current throughput estimate
    throughput_mbps: AtomicU64,
    completed: AtomicBool,
    paused: AtomicBool,
}

impl TransferStats {
    pub(crate) fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_acked(&self, bytes: u64) {
        self.bytes_acked.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn incr_chunks_sent(&self) {
        self.chunks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_chunks_acked(&self) {
        self.chunks_acked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_retransmissions(&self) {
        self.retransmissions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_throughput(&self, mbps: f64) {
        self.throughput_mbps.store(mbps.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn mark_completed(&self) {
        self.completed.store(true, Ordering::Relaxed);
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    /// Whether the transfer has fully completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Relaxed)
    }

    /// Whether the transfer is currently paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Take a consistent-enough point-in-time copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_acked: self.bytes_acked.load(Ordering::Relaxed),
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            chunks_acked: self.chunks_acked.load(Ordering::Relaxed),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
            throughput_mbps: f64::from_bits(self.throughput_mbps.load(Ordering::Relaxed)),
            completed: self.completed.load(Ordering::Relaxed),
            paused: self.paused.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of the transfer counters, as returned to callers.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatsSnapshot {
    /// Payload bytes handed to the wire, retransmissions included
    pub bytes_sent: u64,
    /// Payload bytes covered by acknowledged chunks
    pub bytes_acked: u64,
    /// DATA packets sent
    pub chunks_sent: u32,
    /// Distinct chunks acknowledged
    pub chunks_acked: u32,
    /// Chunks re-sent after a retransmission timeout
    pub retransmissions: u32,
    /// Controller throughput estimate
    pub throughput_mbps: f64,
    /// All chunks acknowledged
    pub completed: bool,
    /// Transfer paused
    pub paused: bool,
}

/// The per-chunk bookkeeping guarded by the context lock: which chunks are
/// acknowledged and when each was last transmitted.
#[derive(Debug)]
pub(crate) struct ChunkLedger {
    /// Bit `i` set iff chunk `i` has been acknowledged
    pub ack_bitmap: Vec<bool>,
    /// Most recent transmission instant per chunk; `None` if never sent
    pub send_times: Vec<Option<Instant>>,
}

impl ChunkLedger {
    pub(crate) fn new(total_chunks: u32) -> Self {
        Self {
            ack_bitmap: vec![false; total_chunks as usize],
            send_times: vec![None; total_chunks as usize],
        }
    }

    /// Highest acknowledged chunk index, if any.
    pub(crate) fn highest_acked(&self) -> Option<u32> {
        self.ack_bitmap
            .iter()
            .enumerate()
            .rev()
            .find(|(_, &acked)| acked)
            .map(|(i, _)| i as u32)
    }

    /// Lowest unacknowledged chunk index; `None` once everything is acked.
    pub(crate) fn lowest_unacked(&self) -> Option<u32> {
        self.ack_bitmap
            .iter()
            .position(|&acked| !acked)
            .map(|i| i as u32)
    }

    pub(crate) fn all_acked(&self) -> bool {
        self.ack_bitmap.iter().all(|&acked| acked)
    }
}

/// All state for one outbound transfer.
///
/// Shared by the engine map and every loop via `Arc`; the ledger is the only
/// part behind a lock. The acquisition order is always map lock before
/// context lock.
pub struct TransferContext {
    /// 64-bit transfer identifier
    pub file_id: u64,
    /// Source file path
    pub filepath: PathBuf,
    /// Total file size in bytes
    pub file_size: u64,
    /// Chunk payload size for this transfer
    pub chunk_size: usize,
    /// `ceil(file_size / chunk_size)`
    pub total_chunks: u32,
    /// Transfer priority
    pub priority: Priority,
    /// Destination endpoint
    pub remote: SocketAddr,
    /// Creation instant
    pub start_time: Instant,
    /// Lock-free counters
    pub stats: TransferStats,
    /// Owned congestion controller
    pub congestion: CongestionControl,
    pub(crate) ledger: Mutex<ChunkLedger>,
}

impl TransferContext {
    pub(crate) fn new(
        file_id: u64,
        filepath: PathBuf,
        file_size: u64,
        chunk_size: usize,
        priority: Priority,
        remote: SocketAddr,
    ) -> Self {
        let total_chunks = file_size.div_ceil(chunk_size as u64) as u32;

        Self {
            file_id,
            filepath,
            file_size,
            chunk_size,
            total_chunks,
            priority,
            remote,
            start_time: Instant::now(),
            stats: TransferStats::default(),
            congestion: CongestionControl::new(priority),
            ledger: Mutex::new(ChunkLedger::new(total_chunks)),
        }
    }

    /// Actual payload length of a chunk, accounting for the short final
    /// chunk.
    #[must_use]
    pub fn chunk_len(&self, index: u32) -> u64 {
        let offset = u64::from(index) * self.chunk_size as u64;
        (self.file_size - offset.min(self.file_size)).min(self.chunk_size as u64)
    }

    /// Whether `index` is the final chunk of the file.
    #[must_use]
    pub fn is_final_chunk(&self, index: u32) -> bool {
        index + 1 == self.total_chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(file_size: u64, chunk_size: usize) -> TransferContext {
        TransferContext::new(
            1,
            PathBuf::from("/tmp/unused"),
            file_size,
            chunk_size,
            Priority::Normal,
            "127.0.0.1:9090".parse().unwrap(),
        )
    }

    #[test]
    fn test_total_chunks() {
        assert_eq!(context(1000, 65_000).total_chunks, 1);
        assert_eq!(context(130_001, 65_000).total_chunks, 3);
        assert_eq!(context(65_000, 65_000).total_chunks, 1);
        assert_eq!(context(0, 65_000).total_chunks, 0);
    }

    #[test]
    fn test_chunk_len_short_tail() {
        let ctx = context(130_001, 65_000);
        assert_eq!(ctx.chunk_len(0), 65_000);
        assert_eq!(ctx.chunk_len(1), 65_000);
        assert_eq!(ctx.chunk_len(2), 1);
        assert!(ctx.is_final_chunk(2));
        assert!(!ctx.is_final_chunk(1));
    }

    #[test]
    fn test_ledger_bounds() {
        let mut ledger = ChunkLedger::new(5);
        assert_eq!(ledger.lowest_unacked(), Some(0));
        assert_eq!(ledger.highest_acked(), None);
        assert!(!ledger.all_acked());

        ledger.ack_bitmap[0] = true;
        ledger.ack_bitmap[2] = true;
        assert_eq!(ledger.lowest_unacked(), Some(1));
        assert_eq!(ledger.highest_acked(), Some(2));

        for bit in &mut ledger.ack_bitmap {
            *bit = true;
        }
        assert_eq!(ledger.lowest_unacked(), None);
        assert_eq!(ledger.highest_acked(), Some(4));
        assert!(ledger.all_acked());
    }

    #[test]
    fn test_empty_ledger_is_complete() {
        let ledger = ChunkLedger::new(0);
        assert!(ledger.all_acked());
        assert_eq!(ledger.lowest_unacked(), None);
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = TransferStats::default();
        stats.add_bytes_sent(100);
        stats.add_bytes_acked(50);
        stats.incr_chunks_sent();
        stats.incr_chunks_acked();
        stats.incr_retransmissions();
        stats.set_throughput(12.5);
        stats.set_paused(true);

        let snap = stats.snapshot();
        assert_eq!(snap.bytes_sent, 100);
        assert_eq!(snap.bytes_acked, 50);
        assert_eq!(snap.chunks_sent, 1);
        assert_eq!(snap.chunks_acked, 1);
        assert_eq!(snap.retransmissions, 1);
        assert!((snap.throughput_mbps - 12.5).abs() < f64::EPSILON);
        assert!(snap.paused);
        assert!(!snap.completed);
    }

    #[test]
    fn test_completed_latches() {
        let stats = TransferStats::default();
        stats.mark_completed();
        assert!(stats.is_completed());

        // Pause toggling never clears completion.
        stats.set_paused(true);
        stats.set_paused(false);
        assert!(stats.is_completed());
    }
}
