//! # Mix Node
//!
//! Glues the pieces of a mix together: inbound packets from the transport
//! are decoded and unwrapped, forwarded packets go through the mixing
//! strategy, replies go to their client and exit messages to the local
//! application.
//!
//! Packet-level failures never produce network traffic. They are logged and
//! counted, nothing more.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sphinxmix_crypto::{CryptoProvider, Curve25519Provider, KeyPair, PublicKey};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::hop::{unwrap_packet, UnwrapResult};
use crate::packet::{MixPacket, SphinxParams};
use crate::pki::{MixPki, NodeAddr};
use crate::replay::{MemoryReplayCache, ReplayCache};
use crate::scheduler::{Dispatch, MixScheduler, MixStrategy, Outbound, SchedulerStats};
use crate::transport::MixTransport;
use crate::{MixError, NodeId, NodeKind, Result};

/// Default capacity of the inbound packet queue.
pub const DEFAULT_INBOUND_QUEUE: usize = 1024;

/// Default number of packets unwrapped concurrently.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 256;

/// Mix node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixNodeConfig {
    /// This node's identifier.
    pub node_id: NodeId,
    /// Packet geometry.
    #[serde(default)]
    pub params: SphinxParams,
    /// Mixing strategy.
    #[serde(default)]
    pub strategy: MixStrategy,
    /// Send client replies through the mixing strategy instead of
    /// immediately.
    #[serde(default)]
    pub delay_client_delivery: bool,
    /// Capacity of the inbound packet queue.
    #[serde(default = "default_inbound_queue")]
    pub inbound_queue: usize,
    /// Packets processed at once. Further packets wait in the inbound queue.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_inbound_queue() -> usize {
    DEFAULT_INBOUND_QUEUE
}

fn default_max_in_flight() -> usize {
    DEFAULT_MAX_IN_FLIGHT
}

impl MixNodeConfig {
    /// Default configuration for `node_id`.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            params: SphinxParams::default(),
            strategy: MixStrategy::default(),
            delay_client_delivery: false,
            inbound_queue: DEFAULT_INBOUND_QUEUE,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }

    /// Parse a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| MixError::ConfigError(e.to_string()))
    }

    /// Reject unusable settings.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.kind() != Some(NodeKind::Mix) {
            return Err(MixError::ConfigError(format!(
                "{} is not a mix node identifier",
                self.node_id
            )));
        }
        if self.inbound_queue == 0 {
            return Err(MixError::ConfigError("inbound_queue must be positive".into()));
        }
        if self.max_in_flight == 0 {
            return Err(MixError::ConfigError("max_in_flight must be positive".into()));
        }
        self.params.validate()?;
        self.strategy.validate()
    }
}

/// Message a node delivered as the last hop of a forward route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitDelivery {
    /// Recipient the sender named.
    pub destination: NodeId,
    /// Cleartext message.
    pub payload: Vec<u8>,
}

/// Node counters.
#[derive(Debug, Clone, Default)]
pub struct NodeStats {
    /// Packets received.
    pub received: u64,
    /// Packets with the wrong length.
    pub malformed: u64,
    /// Packets failing authentication.
    pub integrity_failures: u64,
    /// Replayed packets.
    pub replays: u64,
    /// Other rejected packets.
    pub rejected: u64,
    /// Replies sent to clients.
    pub client_deliveries: u64,
    /// Messages delivered locally.
    pub exit_deliveries: u64,
    /// Mixing strategy counters.
    pub scheduler: SchedulerStats,
}

#[derive(Default)]
struct NodeCounters {
    received: AtomicU64,
    malformed: AtomicU64,
    integrity_failures: AtomicU64,
    replays: AtomicU64,
    rejected: AtomicU64,
    client_deliveries: AtomicU64,
    exit_deliveries: AtomicU64,
}

/// Sends released items to their next hop or client.
struct Forwarder {
    pki: Arc<dyn MixPki>,
    transport: Arc<dyn MixTransport>,
}

#[async_trait]
impl Dispatch for Forwarder {
    async fn dispatch(&self, outbound: Outbound) -> Result<()> {
        match outbound {
            Outbound::Mix {
                destination,
                packet,
            } => {
                let addr = self.pki.get_mix_addr(self.transport.name(), &destination)?;
                self.transport.send(&addr, packet.to_bytes()).await
            }
            Outbound::Client {
                client_id,
                message_tag,
                payload,
            } => {
                let addr = self.pki.get_client_addr(self.transport.name(), &client_id)?;
                let mut message = Vec::with_capacity(message_tag.len() + payload.len());
                message.extend_from_slice(&message_tag);
                message.extend_from_slice(&payload);
                self.transport.send(&addr, message).await
            }
        }
    }
}

struct NodeInner {
    config: MixNodeConfig,
    keys: KeyPair,
    crypto: Arc<dyn CryptoProvider>,
    replay_cache: Arc<dyn ReplayCache>,
    pki: Arc<dyn MixPki>,
    transport: Arc<dyn MixTransport>,
    forwarder: Arc<Forwarder>,
    scheduler: Box<dyn MixScheduler>,
    deliveries: Option<mpsc::Sender<ExitDelivery>>,
    counters: NodeCounters,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl NodeInner {
    async fn received(&self, raw: &[u8]) -> Result<()> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let result = self.process(raw).await;

        if let Err(e) = &result {
            let counter = match e {
                MixError::MalformedPacketError { .. } => &self.counters.malformed,
                MixError::IntegrityError => &self.counters.integrity_failures,
                MixError::ReplayError => &self.counters.replays,
                _ => &self.counters.rejected,
            };
            counter.fetch_add(1, Ordering::Relaxed);

            match e {
                MixError::ReplayError => warn!(node = %self.config.node_id, "replayed packet dropped"),
                other => debug!(node = %self.config.node_id, "packet dropped: {}", other),
            }
        }
        result
    }

    async fn process(&self, raw: &[u8]) -> Result<()> {
        let params = &self.config.params;
        let packet = MixPacket::from_bytes(params, raw)?;
        let result = unwrap_packet(
            self.crypto.as_ref(),
            params,
            self.replay_cache.as_ref(),
            self.keys.private_key(),
            &packet,
        )?;

        match result {
            UnwrapResult::NextHop {
                destination,
                packet,
            } => {
                self.scheduler.submit(Outbound::Mix {
                    destination,
                    packet,
                });
            }
            UnwrapResult::ClientDelivery {
                client_id,
                message_tag,
                payload,
            } => {
                let outbound = Outbound::Client {
                    client_id,
                    message_tag,
                    payload,
                };
                if self.config.delay_client_delivery {
                    self.scheduler.submit(outbound);
                } else {
                    self.forwarder.dispatch(outbound).await?;
                }
                self.counters.client_deliveries.fetch_add(1, Ordering::Relaxed);
            }
            UnwrapResult::ExitDelivery {
                destination,
                payload,
            } => {
                self.counters.exit_deliveries.fetch_add(1, Ordering::Relaxed);
                let Some(deliveries) = &self.deliveries else {
                    debug!(node = %self.config.node_id, "no delivery channel, message discarded");
                    return Ok(());
                };
                let delivery = ExitDelivery {
                    destination,
                    payload,
                };
                tokio::select! {
                    sent = deliveries.send(delivery) => sent.map_err(|_| MixError::Shutdown)?,
                    _ = self.cancel.cancelled() => return Err(MixError::Shutdown),
                }
            }
        }
        Ok(())
    }
}

/// A mix node.
#[derive(Clone)]
pub struct MixNode {
    inner: Arc<NodeInner>,
}

impl MixNode {
    /// Start building a node.
    pub fn builder(config: MixNodeConfig) -> MixNodeBuilder {
        MixNodeBuilder::new(config)
    }

    /// This node's identifier.
    pub fn id(&self) -> NodeId {
        self.inner.config.node_id
    }

    /// This node's public key.
    pub fn public_key(&self) -> &PublicKey {
        self.inner.keys.public_key()
    }

    /// Start the transport, publish this node in the directory, and begin
    /// processing inbound packets.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return Err(MixError::Shutdown);
        }

        let (tx, mut rx) = mpsc::channel(inner.config.inbound_queue);
        inner.transport.register_protocol(tx);
        inner.transport.start().await?;
        inner.pki.set(
            inner.config.node_id,
            *inner.keys.public_key(),
            NodeAddr::new(inner.transport.name(), inner.transport.addr()),
        )?;
        info!(
            node = %inner.config.node_id,
            addr = %inner.transport.addr(),
            "mix node started"
        );

        let node = self.inner.clone();
        let workers = Arc::new(Semaphore::new(inner.config.max_in_flight));
        self.inner.tasks.spawn(async move {
            loop {
                // Take a permit before reading so a busy node leaves packets
                // queued and the transport sees backpressure.
                let permit = tokio::select! {
                    _ = node.cancel.cancelled() => break,
                    permit = workers.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                tokio::select! {
                    _ = node.cancel.cancelled() => break,
                    raw = rx.recv() => match raw {
                        Some(raw) => {
                            let worker = node.clone();
                            node.tasks.spawn(async move {
                                let _ = worker.received(&raw).await;
                                drop(permit);
                            });
                        }
                        None => break,
                    },
                }
            }
            debug!(node = %node.config.node_id, "inbound loop stopped");
        });
        Ok(())
    }

    /// Process one raw packet as if it arrived from the transport.
    pub async fn received(&self, raw: &[u8]) -> Result<()> {
        self.inner.received(raw).await
    }

    /// Items held by the mixing strategy.
    pub fn pending(&self) -> usize {
        self.inner.scheduler.pending()
    }

    /// Wait for every scheduled release to fire.
    pub async fn drain(&self) {
        self.inner.scheduler.drain().await;
    }

    /// Current counters.
    pub fn stats(&self) -> NodeStats {
        let c = &self.inner.counters;
        NodeStats {
            received: c.received.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            integrity_failures: c.integrity_failures.load(Ordering::Relaxed),
            replays: c.replays.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            client_deliveries: c.client_deliveries.load(Ordering::Relaxed),
            exit_deliveries: c.exit_deliveries.load(Ordering::Relaxed),
            scheduler: self.inner.scheduler.stats(),
        }
    }

    /// Stop processing, cancel every unfired release and stop the
    /// transport. Idempotent.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.cancel.cancel();
        inner.scheduler.shutdown().await;
        inner.tasks.close();
        inner.tasks.wait().await;
        inner.transport.stop().await;
        info!(node = %inner.config.node_id, "mix node stopped");
    }
}

/// Builder for [`MixNode`].
pub struct MixNodeBuilder {
    config: MixNodeConfig,
    key_pair: Option<KeyPair>,
    crypto: Option<Arc<dyn CryptoProvider>>,
    replay_cache: Option<Arc<dyn ReplayCache>>,
    pki: Option<Arc<dyn MixPki>>,
    transport: Option<Arc<dyn MixTransport>>,
    deliveries: Option<mpsc::Sender<ExitDelivery>>,
}

impl MixNodeBuilder {
    /// Builder with `config` and nothing else set.
    pub fn new(config: MixNodeConfig) -> Self {
        Self {
            config,
            key_pair: None,
            crypto: None,
            replay_cache: None,
            pki: None,
            transport: None,
            deliveries: None,
        }
    }

    /// Use an existing key pair instead of generating one.
    pub fn key_pair(mut self, key_pair: KeyPair) -> Self {
        self.key_pair = Some(key_pair);
        self
    }

    /// Crypto provider (defaults to [`Curve25519Provider`]).
    pub fn crypto(mut self, crypto: Arc<dyn CryptoProvider>) -> Self {
        self.crypto = Some(crypto);
        self
    }

    /// Replay cache (defaults to an unbounded [`MemoryReplayCache`]).
    pub fn replay_cache(mut self, replay_cache: Arc<dyn ReplayCache>) -> Self {
        self.replay_cache = Some(replay_cache);
        self
    }

    /// Directory. Required.
    pub fn pki(mut self, pki: Arc<dyn MixPki>) -> Self {
        self.pki = Some(pki);
        self
    }

    /// Transport. Required.
    pub fn transport(mut self, transport: Arc<dyn MixTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Channel receiving exit deliveries. Without one they are discarded.
    pub fn deliveries(mut self, deliveries: mpsc::Sender<ExitDelivery>) -> Self {
        self.deliveries = Some(deliveries);
        self
    }

    /// Build the node.
    pub fn build(self) -> Result<MixNode> {
        self.config.validate()?;
        let pki = self
            .pki
            .ok_or_else(|| MixError::ConfigError("a PKI is required".into()))?;
        let transport = self
            .transport
            .ok_or_else(|| MixError::ConfigError("a transport is required".into()))?;

        let forwarder = Arc::new(Forwarder {
            pki: pki.clone(),
            transport: transport.clone(),
        });
        let scheduler = self.config.strategy.build(forwarder.clone())?;

        Ok(MixNode {
            inner: Arc::new(NodeInner {
                keys: self.key_pair.unwrap_or_else(|| KeyPair::generate(&mut OsRng)),
                crypto: self
                    .crypto
                    .unwrap_or_else(|| Arc::new(Curve25519Provider::new())),
                replay_cache: self
                    .replay_cache
                    .unwrap_or_else(|| Arc::new(MemoryReplayCache::new())),
                config: self.config,
                pki,
                transport,
                forwarder,
                scheduler,
                deliveries: self.deliveries,
                counters: NodeCounters::default(),
                tasks: TaskTracker::new(),
                cancel: CancellationToken::new(),
            }),
        })
    }
}
