//! The transfer engine: admission, the four loops, and ACK dispatch.
//!
//! Four cooperating tasks drive every transfer:
//! - **sender** (10 ms tick): first transmission of every unacknowledged,
//!   not-yet-sent chunk inside the congestion window
//! - **receive pump**: drains decoded packets from the endpoint and applies
//!   ACKs
//! - **retransmit** (100 ms tick): re-sends chunks whose last transmission
//!   is older than the controller's RTO, counting each as a loss
//! - **telemetry** (1 s tick): publishes throughput, detects completion,
//!   clears checkpoints
//!
//! Lock discipline: the transfer map has one coarse mutex, held only to
//! enumerate or insert; each context's ledger has its own lock. Acquisition
//! order is always map, then context. Stats and the congestion window are
//! atomics, read without any lock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use drift_core::{Packet, PacketFlags, PacketType, Priority};
use drift_files::chunker;
use drift_files::integrity::xxhash32;
use drift_net::UdpEndpoint;

use crate::checkpoint::CheckpointStore;
use crate::context::{ChunkLedger, StatsSnapshot, TransferContext};
use crate::error::{EngineError, Result};
use crate::CHUNK_SIZE;

const SENDER_TICK: Duration = Duration::from_millis(10);
const RECEIVE_TICK: Duration = Duration::from_millis(100);
const RETRANSMIT_TICK: Duration = Duration::from_millis(100);
const TELEMETRY_TICK: Duration = Duration::from_secs(1);

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Local UDP bind address
    pub bind_addr: SocketAddr,
    /// Chunk payload size for new transfers
    pub chunk_size: usize,
    /// Directory for durable checkpoint records
    pub checkpoint_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            chunk_size: CHUNK_SIZE,
            checkpoint_dir: PathBuf::from("drift-state/checkpoints"),
        }
    }
}

/// State shared by the engine handle and its loops.
struct Inner {
    endpoint: UdpEndpoint,
    checkpoints: CheckpointStore,
    transfers: StdMutex<HashMap<String, Arc<TransferContext>>>,
    chunk_size: usize,
    running: AtomicBool,
}

/// The transfer engine.
///
/// Owns the endpoint, the checkpoint store, and the transfer map; spawns
/// the four loops at construction and joins them in [`stop`].
///
/// [`stop`]: TransferEngine::stop
pub struct TransferEngine {
    inner: Arc<Inner>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl TransferEngine {
    /// Bind the endpoint, open the checkpoint store, and start the loops.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound or the checkpoint
    /// directory cannot be created. A failed bind leaves the engine
    /// unusable; there is no partial construction.
    pub async fn new(config: EngineConfig) -> Result<Self> {
        let endpoint = UdpEndpoint::bind(config.bind_addr).await?;

        let checkpoints = CheckpointStore::new(config.checkpoint_dir);
        checkpoints.initialize().await?;

        let inner = Arc::new(Inner {
            endpoint,
            checkpoints,
            transfers: StdMutex::new(HashMap::new()),
            chunk_size: config.chunk_size,
            running: AtomicBool::new(true),
        });

        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        inner
            .endpoint
            .set_packet_callback(Arc::new(move |packet, source| {
                // Runs on the endpoint's receive task; hand off immediately.
                let _ = ack_tx.send((packet, source));
            }));

        let engine = Self {
            inner,
            tasks: tokio::sync::Mutex::new(Vec::new()),
        };
        engine.spawn_loops(ack_rx).await;

        info!(
            "transfer engine listening on {}",
            engine
                .inner
                .endpoint
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "<unknown>".into())
        );

        Ok(engine)
    }

    /// The engine endpoint's bound address.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot report its address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.endpoint.local_addr()?)
    }

    /// Admit a new transfer and return its id as a decimal string.
    ///
    /// The file must be openable now; its size fixes the chunk count for
    /// the life of the transfer.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::SourceFile`] if the file cannot be opened or
    /// stat'ed.
    pub fn start_transfer<P: AsRef<Path>>(
        &self,
        filepath: P,
        remote: SocketAddr,
        priority: Priority,
    ) -> Result<String> {
        let filepath = filepath.as_ref().to_path_buf();

        let file_size = std::fs::File::open(&filepath)
            .and_then(|f| f.metadata())
            .map(|m| m.len())
            .map_err(|source| EngineError::SourceFile {
                path: filepath.clone(),
                source,
            })?;

        let file_id: u64 = rand::random();
        let file_id_str = file_id.to_string();

        let ctx = Arc::new(TransferContext::new(
            file_id,
            filepath,
            file_size,
            self.inner.chunk_size,
            priority,
            remote,
        ));

        info!(
            "started transfer {file_id_str}: {} bytes in {} chunks to {remote}, priority {priority:?}",
            file_size, ctx.total_chunks
        );

        self.inner
            .transfers
            .lock()
            .expect("transfer map lock poisoned")
            .insert(file_id_str.clone(), ctx);

        Ok(file_id_str)
    }

    /// Pause a transfer and persist its progress.
    ///
    /// The checkpoint records the highest acknowledged chunk index at pause
    /// time. Checkpoint I/O failures are logged; in-memory progress stays
    /// authoritative for this process.
    pub async fn pause_transfer(&self, file_id: &str) {
        let Some(ctx) = self.inner.lookup(file_id) else {
            warn!("pause: unknown transfer {file_id}");
            return;
        };

        ctx.stats.set_paused(true);

        let last_chunk = ctx.ledger.lock().await.highest_acked().unwrap_or(0);
        if let Err(e) = self
            .inner
            .checkpoints
            .save(file_id, last_chunk, ctx.file_size)
            .await
        {
            warn!("checkpoint save for {file_id} failed: {e}");
        }

        info!("paused transfer {file_id} at chunk {last_chunk}");
    }

    /// Resume a paused transfer.
    ///
    /// Clears the paused flag only; the in-memory bitmap already holds this
    /// process's progress. The durable checkpoint exists for resumption
    /// across process restarts.
    pub fn resume_transfer(&self, file_id: &str) {
        let Some(ctx) = self.inner.lookup(file_id) else {
            warn!("resume: unknown transfer {file_id}");
            return;
        };

        ctx.stats.set_paused(false);
        info!("resumed transfer {file_id}");
    }

    /// Snapshot a transfer's counters; zeroed stats for an unknown id.
    #[must_use]
    pub fn get_stats(&self, file_id: &str) -> StatsSnapshot {
        self.inner
            .lookup(file_id)
            .map(|ctx| ctx.stats.snapshot())
            .unwrap_or_default()
    }

    /// Ids of every admitted transfer, completed ones included.
    #[must_use]
    pub fn list_transfers(&self) -> Vec<String> {
        self.inner
            .transfers
            .lock()
            .expect("transfer map lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Signal all loops to exit and join them.
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::Relaxed);
        self.inner.endpoint.close();

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }

        info!("transfer engine stopped");
    }

    async fn spawn_loops(&self, mut ack_rx: UnboundedReceiver<(Packet, SocketAddr)>) {
        let mut tasks = self.tasks.lock().await;

        let inner = Arc::clone(&self.inner);
        tasks.push(tokio::spawn(async move {
            let mut tick = time::interval(SENDER_TICK);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            while inner.running.load(Ordering::Relaxed) {
                tick.tick().await;
                inner.sender_pass().await;
            }
        }));

        let inner = Arc::clone(&self.inner);
        tasks.push(tokio::spawn(async move {
            let mut tick = time::interval(RECEIVE_TICK);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    received = ack_rx.recv() => match received {
                        Some((packet, source)) => inner.handle_packet(packet, source).await,
                        None => break,
                    },
                    _ = tick.tick() => {
                        if !inner.running.load(Ordering::Relaxed) {
                            break;
                        }
                    }
                }
            }
        }));

        let inner = Arc::clone(&self.inner);
        tasks.push(tokio::spawn(async move {
            let mut tick = time::interval(RETRANSMIT_TICK);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            while inner.running.load(Ordering::Relaxed) {
                tick.tick().await;
                inner.retransmit_pass().await;
            }
        }));

        let inner = Arc::clone(&self.inner);
        tasks.push(tokio::spawn(async move {
            let mut tick = time::interval(TELEMETRY_TICK);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            while inner.running.load(Ordering::Relaxed) {
                tick.tick().await;
                inner.telemetry_pass().await;
            }
        }));
    }
}

impl Inner {
    fn lookup(&self, file_id: &str) -> Option<Arc<TransferContext>> {
        self.transfers
            .lock()
            .expect("transfer map lock poisoned")
            .get(file_id)
            .cloned()
    }

    /// Snapshot the context set. The map lock is held only for the copy;
    /// per-context locks are taken afterwards (map before context, always).
    fn contexts(&self) -> Vec<Arc<TransferContext>> {
        self.transfers
            .lock()
            .expect("transfer map lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// One sender pass: first transmission of every unacknowledged, unsent
    /// chunk inside the window. Re-sends are the retransmit loop's job.
    async fn sender_pass(&self) {
        for ctx in self.contexts() {
            if ctx.stats.is_paused() || ctx.stats.is_completed() {
                continue;
            }

            let window = ctx.congestion.window_size();
            let mut ledger = ctx.ledger.lock().await;

            let Some(base) = ledger.lowest_unacked() else {
                continue;
            };

            for index in 0..ctx.total_chunks {
                let i = index as usize;
                if ledger.ack_bitmap[i] || ledger.send_times[i].is_some() {
                    continue;
                }
                if !chunk_in_window(base, window, index) {
                    continue;
                }
                self.send_chunk(&ctx, &mut ledger, index).await;
            }
        }
    }

    /// One retransmit pass: any unacknowledged chunk whose last send is
    /// older than the RTO counts as a loss and goes out again.
    async fn retransmit_pass(&self) {
        for ctx in self.contexts() {
            if ctx.stats.is_paused() || ctx.stats.is_completed() {
                continue;
            }

            let rto = ctx.congestion.retry_timeout();
            let mut ledger = ctx.ledger.lock().await;

            for index in 0..ctx.total_chunks {
                let i = index as usize;
                if ledger.ack_bitmap[i] {
                    continue;
                }
                let Some(sent_at) = ledger.send_times[i] else {
                    continue;
                };
                if sent_at.elapsed() <= rto {
                    continue;
                }

                debug!(
                    "retransmitting chunk {index} of {} (rto {:?})",
                    ctx.file_id, rto
                );
                ctx.congestion.on_loss();
                self.send_chunk(&ctx, &mut ledger, index).await;
                ctx.stats.incr_retransmissions();
            }
        }
    }

    /// One telemetry pass: publish throughput, detect completion, clear the
    /// checkpoint of a finished transfer.
    async fn telemetry_pass(&self) {
        for ctx in self.contexts() {
            if ctx.stats.is_completed() {
                continue;
            }

            ctx.stats.set_throughput(ctx.congestion.throughput_mbps());

            let done = ctx.ledger.lock().await.all_acked();
            if !done {
                continue;
            }

            ctx.stats.mark_completed();

            let file_id = ctx.file_id.to_string();
            if let Err(e) = self.checkpoints.clear(&file_id).await {
                warn!("checkpoint clear for {file_id} failed: {e}");
            }

            info!(
                "transfer {file_id} completed in {:.2}s",
                ctx.start_time.elapsed().as_secs_f64()
            );
        }
    }

    /// Apply one incoming packet. Non-ACK packets and unknown transfers are
    /// dropped; a duplicate ACK is a no-op. The first ACK for a chunk sets
    /// its bit exactly once and feeds the controller.
    async fn handle_packet(&self, packet: Packet, source: SocketAddr) {
        if packet.packet_type != PacketType::Ack {
            trace!(
                "ignoring {:?} packet from {source}",
                packet.packet_type
            );
            return;
        }

        let file_id = packet.file_id.to_string();
        let Some(ctx) = self.lookup(&file_id) else {
            trace!("ack for unknown transfer {file_id} from {source}");
            return;
        };

        let index = packet.seq_id;
        if index >= ctx.total_chunks {
            trace!("ack for out-of-range chunk {index} of {file_id}");
            return;
        }

        let mut ledger = ctx.ledger.lock().await;
        if ledger.ack_bitmap[index as usize] {
            return; // duplicate
        }
        ledger.ack_bitmap[index as usize] = true;

        ctx.stats.incr_chunks_acked();
        ctx.stats.add_bytes_acked(ctx.chunk_len(index));

        if let Some(sent_at) = ledger.send_times[index as usize] {
            ctx.congestion.update_rtt(sent_at.elapsed());
        }
        ctx.congestion.on_ack();
    }

    /// Read one chunk from disk and put it on the wire.
    ///
    /// A read failure is logged and skipped; the chunk stays
    /// unacknowledged, so the retransmit loop (or the next sender pass, if
    /// it was never stamped) retries it.
    async fn send_chunk(&self, ctx: &TransferContext, ledger: &mut ChunkLedger, index: u32) {
        let chunk = match chunker::read_chunk_at(&ctx.filepath, ctx.chunk_size, index) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(
                    "cannot read chunk {index} of {}: {e}",
                    ctx.filepath.display()
                );
                return;
            }
        };

        let mut flags = PacketFlags::new();
        if ctx.is_final_chunk(index) {
            flags = flags.with_final_chunk();
        }

        let payload_len = chunk.data.len() as u64;
        let packet = Packet::data(
            ctx.priority,
            index,
            ctx.file_id,
            ctx.file_size,
            xxhash32(&chunk.data, 0),
            flags,
            chunk.data,
        );

        self.endpoint.send_packet(&packet, ctx.remote).await;

        ledger.send_times[index as usize] = Some(Instant::now());
        ctx.stats.incr_chunks_sent();
        ctx.stats.add_bytes_sent(payload_len);
        ctx.congestion.record_sent(payload_len);
    }
}

/// Window membership: `base <= index < base + window`, where `base` is the
/// lowest unacknowledged index. The outer scan still walks every chunk, so
/// the window caps how many unacknowledged chunks are eligible per pass
/// rather than imposing strict go-back-N.
fn chunk_in_window(base: u32, window: u32, index: u32) -> bool {
    index >= base && u64::from(index) < u64::from(base) + u64::from(window)
}
