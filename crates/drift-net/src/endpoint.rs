//! Async UDP endpoint.
//!
//! One bound socket per endpoint. Receive is armed at bind time: a
//! background task decodes every datagram and invokes the registered
//! callback with `(packet, source)`. Datagrams that fail to decode are a
//! protocol anomaly and are dropped where they land.
//!
//! Sends are fire-and-forget: transport failures are logged, never
//! propagated; the reliability layer above recovers by retransmission.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use drift_core::{MAX_PACKET, Packet};

use crate::error::{NetError, Result};

/// Socket buffer size for sustained transfer (2 MiB)
const SOCKET_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// Callback invoked for every successfully decoded datagram.
pub type PacketCallback = Arc<dyn Fn(Packet, SocketAddr) + Send + Sync>;

/// Snapshot of endpoint transport counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStats {
    /// Bytes handed to the socket
    pub bytes_sent: u64,
    /// Bytes received from the socket
    pub bytes_received: u64,
    /// Datagrams sent
    pub packets_sent: u64,
    /// Datagrams received and decoded
    pub packets_received: u64,
    /// Failed sends
    pub send_errors: u64,
    /// Failed or undecodable receives
    pub recv_errors: u64,
}

#[derive(Default)]
struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
}

/// A bound UDP endpoint with asynchronous receive dispatch.
pub struct UdpEndpoint {
    socket: Arc<UdpSocket>,
    closed: Arc<AtomicBool>,
    callback: Arc<RwLock<Option<PacketCallback>>>,
    counters: Arc<Counters>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpEndpoint {
    /// Bind an endpoint and arm its receive pump.
    ///
    /// Send/receive buffers are sized up front so a sustained transfer does
    /// not drop at the socket.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::BindFailed`] if the socket cannot be created,
    /// configured, or bound.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };

        let raw = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
            .map_err(|e| NetError::BindFailed(e.to_string()))?;
        raw.set_recv_buffer_size(SOCKET_BUFFER_SIZE)
            .map_err(|e| NetError::BindFailed(e.to_string()))?;
        raw.set_send_buffer_size(SOCKET_BUFFER_SIZE)
            .map_err(|e| NetError::BindFailed(e.to_string()))?;
        raw.bind(&addr.into())
            .map_err(|e| NetError::BindFailed(e.to_string()))?;
        raw.set_nonblocking(true)
            .map_err(|e| NetError::BindFailed(e.to_string()))?;

        let std_socket: std::net::UdpSocket = raw.into();
        let socket = UdpSocket::from_std(std_socket)
            .map_err(|e| NetError::BindFailed(e.to_string()))?;

        let endpoint = Self {
            socket: Arc::new(socket),
            closed: Arc::new(AtomicBool::new(false)),
            callback: Arc::new(RwLock::new(None)),
            counters: Arc::new(Counters::default()),
            recv_task: Mutex::new(None),
        };
        endpoint.arm_receive();

        Ok(endpoint)
    }

    /// Register the callback invoked for every decoded datagram.
    ///
    /// Replaces any previous callback. The callback runs on the receive
    /// task and must not block.
    pub fn set_packet_callback(&self, callback: PacketCallback) {
        if let Ok(mut slot) = self.callback.write() {
            *slot = Some(callback);
        }
    }

    /// Encode and send a packet. Fire-and-forget: transport failures are
    /// logged and counted, not returned.
    pub async fn send_packet(&self, packet: &Packet, remote: SocketAddr) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }

        let buf = packet.encode();
        match self.socket.send_to(&buf, remote).await {
            Ok(sent) => {
                self.counters
                    .bytes_sent
                    .fetch_add(sent as u64, Ordering::Relaxed);
                self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                warn!("send to {remote} failed: {e}");
            }
        }
    }

    /// The locally bound address.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot report its address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(NetError::Io)
    }

    /// Current transport counters.
    #[must_use]
    pub fn stats(&self) -> EndpointStats {
        EndpointStats {
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.counters.packets_sent.load(Ordering::Relaxed),
            packets_received: self.counters.packets_received.load(Ordering::Relaxed),
            send_errors: self.counters.send_errors.load(Ordering::Relaxed),
            recv_errors: self.counters.recv_errors.load(Ordering::Relaxed),
        }
    }

    /// Whether the endpoint has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Close the endpoint and stop the receive pump.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        if let Ok(mut slot) = self.recv_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }

    fn arm_receive(&self) {
        let socket = Arc::clone(&self.socket);
        let closed = Arc::clone(&self.closed);
        let callback = Arc::clone(&self.callback);
        let counters = Arc::clone(&self.counters);

        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PACKET];

            loop {
                if closed.load(Ordering::Relaxed) {
                    break;
                }

                match socket.recv_from(&mut buf).await {
                    Ok((len, source)) => match Packet::decode(&buf[..len]) {
                        Ok(packet) => {
                            counters
                                .bytes_received
                                .fetch_add(len as u64, Ordering::Relaxed);
                            counters.packets_received.fetch_add(1, Ordering::Relaxed);

                            let cb = callback.read().ok().and_then(|slot| slot.clone());
                            if let Some(cb) = cb {
                                cb(packet, source);
                            }
                        }
                        Err(e) => {
                            counters.recv_errors.fetch_add(1, Ordering::Relaxed);
                            trace!("dropping undecodable datagram from {source}: {e}");
                        }
                    },
                    Err(e) => {
                        counters.recv_errors.fetch_add(1, Ordering::Relaxed);
                        warn!("recv failed: {e}");
                    }
                }
            }
        });

        if let Ok(mut slot) = self.recv_task.lock() {
            *slot = Some(task);
        }
    }
}

impl Drop for UdpEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_core::{PacketFlags, Priority};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    /// Endpoint whose callback forwards into an async channel.
    async fn tapped_endpoint() -> (
        UdpEndpoint,
        mpsc::UnboundedReceiver<(Packet, SocketAddr)>,
    ) {
        let endpoint = UdpEndpoint::bind(loopback()).await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        endpoint.set_packet_callback(Arc::new(move |packet, source| {
            let _ = tx.send((packet, source));
        }));
        (endpoint, rx)
    }

    #[tokio::test]
    async fn test_bind_ephemeral() {
        let endpoint = UdpEndpoint::bind(loopback()).await.unwrap();
        let addr = endpoint.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(addr.is_ipv4());
    }

    #[tokio::test]
    async fn test_send_recv_dispatch() {
        let (receiver, mut rx) = tapped_endpoint().await;
        let receiver_addr = receiver.local_addr().unwrap();

        let sender = UdpEndpoint::bind(loopback()).await.unwrap();
        let packet = Packet::data(
            Priority::High,
            3,
            99,
            1000,
            0xABCD,
            PacketFlags::new(),
            b"payload".to_vec(),
        );
        sender.send_packet(&packet, receiver_addr).await;

        let (received, source) = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timeout")
            .unwrap();
        assert_eq!(received, packet);
        assert_eq!(source, sender.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_short_datagram_dropped() {
        let (receiver, mut rx) = tapped_endpoint().await;
        let receiver_addr = receiver.local_addr().unwrap();

        // 20 bytes, shorter than the header: must never reach the callback.
        let raw = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        raw.send_to(&[0u8; 20], receiver_addr).await.unwrap();

        // Follow with a valid packet so the test has a positive signal.
        let sender = UdpEndpoint::bind(loopback()).await.unwrap();
        let valid = Packet::ack(Priority::Normal, 0, 1, 0);
        sender.send_packet(&valid, receiver_addr).await;

        let (first, _) = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timeout")
            .unwrap();
        assert_eq!(first, valid);
        assert!(rx.try_recv().is_err());
        assert_eq!(receiver.stats().recv_errors, 1);
        assert_eq!(receiver.stats().packets_received, 1);
    }

    #[tokio::test]
    async fn test_stats_count_sends() {
        let receiver = UdpEndpoint::bind(loopback()).await.unwrap();
        let sender = UdpEndpoint::bind(loopback()).await.unwrap();

        let packet = Packet::ack(Priority::Normal, 7, 42, 0);
        sender
            .send_packet(&packet, receiver.local_addr().unwrap())
            .await;

        let stats = sender.stats();
        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.bytes_sent, packet.total_size() as u64);
    }

    #[tokio::test]
    async fn test_send_after_close_is_noop() {
        let receiver = UdpEndpoint::bind(loopback()).await.unwrap();
        let sender = UdpEndpoint::bind(loopback()).await.unwrap();

        sender.close();
        assert!(sender.is_closed());

        sender
            .send_packet(
                &Packet::ack(Priority::Normal, 0, 1, 0),
                receiver.local_addr().unwrap(),
            )
            .await;

        assert_eq!(sender.stats().packets_sent, 0);
    }

    #[tokio::test]
    async fn test_callback_replacement() {
        let receiver = UdpEndpoint::bind(loopback()).await.unwrap();
        let receiver_addr = receiver.local_addr().unwrap();

        let (tx_old, mut rx_old) = mpsc::unbounded_channel();
        receiver.set_packet_callback(Arc::new(move |packet, _| {
            let _ = tx_old.send(packet);
        }));

        let (tx_new, mut rx_new) = mpsc::unbounded_channel();
        receiver.set_packet_callback(Arc::new(move |packet, _| {
            let _ = tx_new.send(packet);
        }));

        let sender = UdpEndpoint::bind(loopback()).await.unwrap();
        sender
            .send_packet(&Packet::ack(Priority::Normal, 1, 2, 0), receiver_addr)
            .await;

        assert!(timeout(Duration::from_secs(2), rx_new.recv())
            .await
            .expect("timeout")
            .is_some());
        assert!(rx_old.try_recv().is_err());
    }
}
