//! Receive-side server: reassembly and acknowledgment.
//!
//! Accepts DATA packets, verifies each payload checksum, writes accepted
//! chunks at their byte offset into an output file pre-sized to the
//! transfer's length, and replies with an ACK per accepted chunk. Duplicate
//! chunks are re-ACKed (the first ACK may have been lost) but written at
//! most once. Corrupt chunks are dropped without an ACK; the sender's
//! retransmission timeout recovers them.
//!
//! A file in flight is named `<file_id>.part`; on completion it is synced,
//! renamed to `<file_id>`, and its rolling digest is logged for end-to-end
//! comparison with the sender.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use drift_core::{Packet, PacketType};
use drift_files::chunker::FileReassembler;
use drift_files::integrity::{file_hash, verify_chunk};
use drift_net::UdpEndpoint;

use crate::error::Result;

const PUMP_TICK: Duration = Duration::from_millis(100);

/// Receive server construction parameters.
#[derive(Debug, Clone)]
pub struct ReceiveConfig {
    /// Local UDP bind address
    pub bind_addr: SocketAddr,
    /// Directory receiving assembled files
    pub output_dir: PathBuf,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            output_dir: PathBuf::from("received"),
        }
    }
}

/// In-flight reassembly state for one incoming file.
struct ReceiveSession {
    reassembler: FileReassembler,
    part_path: PathBuf,
    final_path: PathBuf,
    file_size: u64,
    /// Known once the FINAL_CHUNK packet has been seen
    total_chunks: Option<u32>,
}

struct Inner {
    endpoint: UdpEndpoint,
    sessions: tokio::sync::Mutex<HashMap<u64, ReceiveSession>>,
    output_dir: PathBuf,
    running: AtomicBool,
}

/// The receive-side server.
pub struct ReceiveServer {
    inner: Arc<Inner>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ReceiveServer {
    /// Bind the endpoint, create the output directory, and start accepting
    /// DATA packets.
    ///
    /// # Errors
    ///
    /// Returns an error if the output directory cannot be created or the
    /// socket cannot be bound.
    pub async fn bind(config: ReceiveConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.output_dir).await?;

        let endpoint = UdpEndpoint::bind(config.bind_addr).await?;

        let inner = Arc::new(Inner {
            endpoint,
            sessions: tokio::sync::Mutex::new(HashMap::new()),
            output_dir: config.output_dir,
            running: AtomicBool::new(true),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        inner
            .endpoint
            .set_packet_callback(Arc::new(move |packet, source| {
                let _ = tx.send((packet, source));
            }));

        let server = Self {
            inner: Arc::clone(&inner),
            task: tokio::sync::Mutex::new(Some(spawn_pump(inner, rx))),
        };

        info!(
            "receive server listening on {}",
            server
                .inner
                .endpoint
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "<unknown>".into())
        );

        Ok(server)
    }

    /// The server endpoint's bound address.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot report its address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.endpoint.local_addr()?)
    }

    /// Number of transfers currently being reassembled.
    pub async fn active_sessions(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    /// Stop accepting packets and join the pump task.
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::Relaxed);
        self.inner.endpoint.close();

        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }

        info!("receive server stopped");
    }
}

fn spawn_pump(
    inner: Arc<Inner>,
    mut rx: UnboundedReceiver<(Packet, SocketAddr)>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = time::interval(PUMP_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                received = rx.recv() => match received {
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
    })
}

impl Inner {
    async fn handle_packet(&self, packet: Packet, source: SocketAddr) {
        if packet.packet_type != PacketType::Data {
            trace!("ignoring {:?} packet from {source}", packet.packet_type);
            return;
        }
        if packet.data.is_empty() {
            trace!("dropping empty DATA packet from {source}");
            return;
        }
        if !verify_chunk(&packet.data, packet.checksum) {
            warn!(
                "checksum mismatch on chunk {} of {} from {source}, dropping",
                packet.seq_id, packet.file_id
            );
            return;
        }

        let file_id = packet.file_id;
        let index = packet.seq_id;
        let payload_len = packet.data.len() as u64;

        let mut sessions = self.sessions.lock().await;

        let session = match sessions.entry(file_id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let part_path = self.output_dir.join(format!("{file_id}.part"));
                let reassembler = match FileReassembler::new(&part_path, packet.file_size) {
                    Ok(reassembler) => reassembler,
                    Err(e) => {
                        warn!("cannot open {} for transfer {file_id}: {e}", part_path.display());
                        return;
                    }
                };
                info!(
                    "receiving transfer {file_id}: {} bytes into {}",
                    packet.file_size,
                    part_path.display()
                );
                entry.insert(ReceiveSession {
                    reassembler,
                    part_path,
                    final_path: self.output_dir.join(file_id.to_string()),
                    file_size: packet.file_size,
                    total_chunks: None,
                })
            }
        };

        if payload_len > session.file_size {
            warn!("chunk {index} of {file_id} larger than the whole file, dropping");
            return;
        }

        // The wire carries no chunk-size field: a non-final chunk is by
        // construction exactly one chunk long, and the final chunk ends at
        // the end of the file.
        let offset = if packet.flags.is_final_chunk() {
            session.total_chunks = Some(index + 1);
            session.file_size - payload_len
        } else {
            u64::from(index) * payload_len
        };

        if session.reassembler.has_chunk(index) {
            debug!("duplicate chunk {index} of {file_id}, re-acking");
        } else if let Err(e) = session.reassembler.write_chunk(index, offset, &packet.data) {
            warn!("write of chunk {index} of {file_id} failed: {e}");
            return; // no ACK: let the sender retry
        }

        let ack = Packet::ack(packet.priority, index, file_id, session.file_size);
        self.endpoint.send_packet(&ack, source).await;

        let complete = session
            .total_chunks
            .is_some_and(|total| session.reassembler.is_complete(total));
        if complete {
            self.finalize(&mut sessions, file_id);
        }
    }

    /// Sync, rename `.part` to its final name, and retire the session.
    fn finalize(&self, sessions: &mut HashMap<u64, ReceiveSession>, file_id: u64) {
        let Some(mut session) = sessions.remove(&file_id) else {
            return;
        };

        if let Err(e) = session.reassembler.sync() {
            warn!("sync of transfer {file_id} failed: {e}");
            sessions.insert(file_id, session);
            return;
        }

        if let Err(e) = std::fs::rename(&session.part_path, &session.final_path) {
            warn!("rename of transfer {file_id} failed: {e}");
            return;
        }

        let digest = file_hash(&session.final_path);
        info!(
            "received transfer {file_id}: {} bytes at {}, digest {digest}",
            session.file_size,
            session.final_path.display()
        );
    }
}
