//! End-to-end transfer tests over loopback UDP: a sender engine on one
//! ephemeral port, a receive server (or a scripted responder) on another.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

use drift_core::{Packet, PacketType, Priority};
use drift_engine::{
    CheckpointStore, EngineConfig, ReceiveConfig, ReceiveServer, TransferEngine,
};
use drift_files::integrity::file_hash;

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

async fn engine(dir: &TempDir, chunk_size: usize) -> TransferEngine {
    TransferEngine::new(EngineConfig {
        bind_addr: loopback(),
        chunk_size,
        checkpoint_dir: dir.path().join("checkpoints"),
    })
    .await
    .unwrap()
}

fn write_source(dir: &TempDir, len: usize) -> (PathBuf, Vec<u8>) {
    let data: Vec<u8> = (0..len).map(|i| ((i * 31 + 7) % 256) as u8).collect();
    let path = dir.path().join("source.bin");
    std::fs::write(&path, &data).unwrap();
    (path, data)
}

/// Poll the engine until the transfer reports completion.
async fn wait_for_completion(engine: &TransferEngine, file_id: &str) {
    timeout(Duration::from_secs(15), async {
        loop {
            if engine.get_stats(file_id).completed {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("transfer did not complete in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_chunk_file_end_to_end() {
    let dir = TempDir::new().unwrap();
    let (path, data) = write_source(&dir, 1000);

    let server = ReceiveServer::bind(ReceiveConfig {
        bind_addr: loopback(),
        output_dir: dir.path().join("out"),
    })
    .await
    .unwrap();

    let sender = engine(&dir, 65_000).await;
    let id = sender
        .start_transfer(&path, server.local_addr().unwrap(), Priority::Normal)
        .unwrap();

    wait_for_completion(&sender, &id).await;

    let stats = sender.get_stats(&id);
    assert_eq!(stats.chunks_acked, 1);
    assert_eq!(stats.bytes_acked, 1000);
    assert!(stats.completed);

    let assembled = std::fs::read(dir.path().join("out").join(&id)).unwrap();
    assert_eq!(assembled, data);

    sender.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multi_chunk_file_end_to_end() {
    let dir = TempDir::new().unwrap();
    let (path, data) = write_source(&dir, 10_000);

    let server = ReceiveServer::bind(ReceiveConfig {
        bind_addr: loopback(),
        output_dir: dir.path().join("out"),
    })
    .await
    .unwrap();

    let sender = engine(&dir, 4096).await;
    let id = sender
        .start_transfer(&path, server.local_addr().unwrap(), Priority::High)
        .unwrap();

    wait_for_completion(&sender, &id).await;

    let stats = sender.get_stats(&id);
    assert_eq!(stats.chunks_acked, 3);
    assert_eq!(stats.bytes_acked, 10_000);

    let out_path = dir.path().join("out").join(&id);
    assert_eq!(std::fs::read(&out_path).unwrap(), data);
    assert_eq!(file_hash(&out_path), file_hash(&path));

    // Completion removed any durable checkpoint.
    let store = CheckpointStore::new(dir.path().join("checkpoints"));
    assert_eq!(store.load(&id).await.unwrap(), None);

    sender.stop().await;
    server.stop().await;
}

/// Responder that acknowledges every DATA chunk except the first copy of
/// chunk 0, forcing one retransmission.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dropped_ack_recovers_via_retransmit() {
    let dir = TempDir::new().unwrap();
    let (path, _) = write_source(&dir, 1500);

    let responder = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let responder_addr = responder.local_addr().unwrap();

    let dropped_once = Arc::new(AtomicBool::new(false));
    {
        let responder = Arc::clone(&responder);
        let dropped_once = Arc::clone(&dropped_once);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 70_000];
            loop {
                let Ok((len, source)) = responder.recv_from(&mut buf).await else {
                    break;
                };
                let Ok(packet) = Packet::decode(&buf[..len]) else {
                    continue;
                };
                if packet.packet_type != PacketType::Data {
                    continue;
                }
                if packet.seq_id == 0 && !dropped_once.swap(true, Ordering::Relaxed) {
                    continue; // swallow the first copy of chunk 0
                }
                let ack = Packet::ack(
                    packet.priority,
                    packet.seq_id,
                    packet.file_id,
                    packet.file_size,
                );
                let _ = responder.send_to(&ack.encode(), source).await;
            }
        });
    }

    let sender = engine(&dir, 500).await;
    let id = sender
        .start_transfer(&path, responder_addr, Priority::Normal)
        .unwrap();

    wait_for_completion(&sender, &id).await;

    let stats = sender.get_stats(&id);
    assert_eq!(stats.chunks_acked, 3);
    assert_eq!(stats.bytes_acked, 1500);
    assert!(stats.retransmissions >= 1);

    sender.stop().await;
}

/// Pause with a sparse ACK pattern, verify the durable checkpoint, resume,
/// and let retransmission finish the job.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pause_then_resume_completes() {
    let dir = TempDir::new().unwrap();
    let (path, _) = write_source(&dir, 1000); // 5 chunks of 200

    let responder = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let responder_addr = responder.local_addr().unwrap();

    // Phase 1: acknowledge only chunks 0 and 2. Phase 2: everything.
    let ack_all = Arc::new(AtomicBool::new(false));
    {
        let responder = Arc::clone(&responder);
        let ack_all = Arc::clone(&ack_all);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 70_000];
            loop {
                let Ok((len, source)) = responder.recv_from(&mut buf).await else {
                    break;
                };
                let Ok(packet) = Packet::decode(&buf[..len]) else {
                    continue;
                };
                if packet.packet_type != PacketType::Data {
                    continue;
                }
                if !ack_all.load(Ordering::Relaxed) && !matches!(packet.seq_id, 0 | 2) {
                    continue;
                }
                let ack = Packet::ack(
                    packet.priority,
                    packet.seq_id,
                    packet.file_id,
                    packet.file_size,
                );
                let _ = responder.send_to(&ack.encode(), source).await;
            }
        });
    }

    let sender = engine(&dir, 200).await;
    let id = sender
        .start_transfer(&path, responder_addr, Priority::Normal)
        .unwrap();

    // Wait for the sparse ACKs to land.
    timeout(Duration::from_secs(10), async {
        while sender.get_stats(&id).chunks_acked < 2 {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("sparse acks did not arrive");

    sender.pause_transfer(&id).await;
    assert!(sender.get_stats(&id).paused);

    // The checkpoint holds the highest acknowledged index.
    let store = CheckpointStore::new(dir.path().join("checkpoints"));
    assert_eq!(store.load(&id).await.unwrap(), Some(2));

    // No progress while paused.
    let acked_at_pause = sender.get_stats(&id).chunks_acked;
    sleep(Duration::from_millis(300)).await;
    assert_eq!(sender.get_stats(&id).chunks_acked, acked_at_pause);

    ack_all.store(true, Ordering::Relaxed);
    sender.resume_transfer(&id);

    wait_for_completion(&sender, &id).await;

    let stats = sender.get_stats(&id);
    assert_eq!(stats.chunks_acked, 5);
    assert_eq!(stats.bytes_acked, 1000);

    sender.stop().await;
}

/// A short datagram is dropped at the endpoint without disturbing any
/// transfer state.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runt_datagram_is_ignored() {
    let dir = TempDir::new().unwrap();
    let (path, _) = write_source(&dir, 1000);

    let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let sender = engine(&dir, 500).await;
    let id = sender
        .start_transfer(&path, sink.local_addr().unwrap(), Priority::Normal)
        .unwrap();

    let before = sender.get_stats(&id);

    let prober = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    prober
        .send_to(&[0u8; 20], sender.local_addr().unwrap())
        .await
        .unwrap();

    sleep(Duration::from_millis(300)).await;

    let after = sender.get_stats(&id);
    assert_eq!(after.chunks_acked, before.chunks_acked);
    assert!(!after.completed);

    sender.stop().await;
}
