//! # Wire Transports
//!
//! A transport moves opaque, complete packets between addresses. Inbound
//! packets are pushed into the channel registered by the protocol that owns
//! the transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::{MixError, Result};

/// Moves packets between nodes.
#[async_trait]
pub trait MixTransport: Send + Sync {
    /// Transport name used to qualify directory addresses.
    fn name(&self) -> &str;

    /// Address other parties reach this transport at.
    fn addr(&self) -> String;

    /// Channel that receives every inbound packet.
    fn register_protocol(&self, inbound: mpsc::Sender<Vec<u8>>);

    /// Begin accepting packets.
    async fn start(&self) -> Result<()>;

    /// Send one packet to `addr`.
    async fn send(&self, addr: &str, packet: Vec<u8>) -> Result<()>;

    /// Stop accepting packets.
    async fn stop(&self) {}
}

/// In-process network connecting [`MemoryTransport`]s by name.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    endpoints: Arc<RwLock<HashMap<String, mpsc::Sender<Vec<u8>>>>>,
}

impl MemoryNetwork {
    /// Empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport reachable at `addr` on this network.
    pub fn transport(&self, addr: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            addr: addr.into(),
            inbound: Mutex::new(None),
            sent: AtomicU64::new(0),
        }
    }

    fn endpoint(&self, addr: &str) -> Option<mpsc::Sender<Vec<u8>>> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(addr)
            .cloned()
    }
}

/// Endpoint on a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    addr: String,
    inbound: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    sent: AtomicU64,
}

impl MemoryTransport {
    /// Number of packets sent through this endpoint.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MixTransport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    fn addr(&self) -> String {
        self.addr.clone()
    }

    fn register_protocol(&self, inbound: mpsc::Sender<Vec<u8>>) {
        *self.inbound.lock().unwrap_or_else(PoisonError::into_inner) = Some(inbound);
    }

    async fn start(&self) -> Result<()> {
        let inbound = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| MixError::ConfigError("no protocol registered".into()))?;

        let mut endpoints = self
            .network
            .endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if endpoints.contains_key(&self.addr) {
            return Err(MixError::NetworkError(format!("address {} in use", self.addr)));
        }
        endpoints.insert(self.addr.clone(), inbound);
        debug!(addr = %self.addr, "memory transport started");
        Ok(())
    }

    async fn send(&self, addr: &str, packet: Vec<u8>) -> Result<()> {
        let endpoint = self
            .network
            .endpoint(addr)
            .ok_or_else(|| MixError::NetworkError(format!("no endpoint at {}", addr)))?;
        endpoint
            .send(packet)
            .await
            .map_err(|_| MixError::NetworkError(format!("endpoint {} closed", addr)))?;
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.network
            .endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.addr);
    }
}

/// One UDP datagram per packet.
#[derive(Debug)]
pub struct UdpTransport {
    bind_addr: String,
    max_datagram: usize,
    socket: OnceLock<Arc<UdpSocket>>,
    inbound: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl UdpTransport {
    /// Transport that will bind `bind_addr` on start. Datagrams longer than
    /// `max_datagram` are truncated by the socket and then dropped by the
    /// packet codec.
    pub fn new(bind_addr: impl Into<String>, max_datagram: usize) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            max_datagram,
            socket: OnceLock::new(),
            inbound: Mutex::new(None),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    async fn recv_loop(
        socket: Arc<UdpSocket>,
        inbound: mpsc::Sender<Vec<u8>>,
        cancel: CancellationToken,
        max_datagram: usize,
    ) {
        // One spare byte so oversized datagrams stay detectably oversized.
        let mut buf = vec![0u8; max_datagram + 1];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        debug!(%from, len, "datagram received");
                        if inbound.send(buf[..len].to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("UDP receive error: {}", e),
                },
            }
        }
    }
}

#[async_trait]
impl MixTransport for UdpTransport {
    fn name(&self) -> &str {
        "udp"
    }

    fn addr(&self) -> String {
        self.socket
            .get()
            .and_then(|socket| socket.local_addr().ok())
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| self.bind_addr.clone())
    }

    fn register_protocol(&self, inbound: mpsc::Sender<Vec<u8>>) {
        *self.inbound.lock().unwrap_or_else(PoisonError::into_inner) = Some(inbound);
    }

    async fn start(&self) -> Result<()> {
        let inbound = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| MixError::ConfigError("no protocol registered".into()))?;

        let socket = UdpSocket::bind(&self.bind_addr)
            .await
            .map_err(|e| MixError::NetworkError(e.to_string()))?;
        let socket = Arc::new(socket);
        self.socket
            .set(socket.clone())
            .map_err(|_| MixError::ConfigError("transport already started".into()))?;

        debug!(addr = %self.addr(), "UDP transport started");
        self.tasks.spawn(Self::recv_loop(
            socket,
            inbound,
            self.cancel.clone(),
            self.max_datagram,
        ));
        Ok(())
    }

    async fn send(&self, addr: &str, packet: Vec<u8>) -> Result<()> {
        let socket = self
            .socket
            .get()
            .ok_or_else(|| MixError::NetworkError("transport not started".into()))?;
        socket
            .send_to(&packet, addr)
            .await
            .map_err(|e| MixError::NetworkError(format!("send to {} failed: {}", addr, e)))?;
        Ok(())
    }

    async fn stop(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}
