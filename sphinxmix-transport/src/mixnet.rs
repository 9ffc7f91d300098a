//! # Mixnet Client
//!
//! Sends forward messages through the mix network and receives replies sent
//! through the client's own reply blocks.
//!
//! Every reply block the client creates registers its keys under a fresh
//! message tag. A reply is opened at most once: the tag is removed when the
//! reply decrypts, after which the tag is indistinguishable from one that
//! was never issued.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sphinxmix_crypto::{CryptoProvider, Curve25519Provider};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::node::DEFAULT_INBOUND_QUEUE;
use crate::packet::{SphinxParams, SECURITY_PARAMETER};
use crate::pki::{MixPki, NodeAddr};
use crate::route::{RouteDescriptor, RouteFactory};
use crate::sphinx::{
    create_forward_packet, create_reply_block, decrypt_reply, packet_from_reply_block,
    MessageTag, ReplyBlock, SurbKeys,
};
use crate::transport::MixTransport;
use crate::{MixError, NodeId, NodeKind, Result};

/// Configuration for the mix client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixClientConfig {
    /// Our client identifier.
    pub client_id: NodeId,
    /// Packet geometry.
    #[serde(default)]
    pub params: SphinxParams,
    /// Capacity of the inbound queue.
    #[serde(default = "default_inbound_queue")]
    pub inbound_queue: usize,
}

fn default_inbound_queue() -> usize {
    DEFAULT_INBOUND_QUEUE
}

impl MixClientConfig {
    /// Default configuration for `client_id`.
    pub fn new(client_id: NodeId) -> Self {
        Self {
            client_id,
            params: SphinxParams::default(),
            inbound_queue: DEFAULT_INBOUND_QUEUE,
        }
    }

    /// Parse a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| MixError::ConfigError(e.to_string()))
    }

    /// Reject unusable settings.
    pub fn validate(&self) -> Result<()> {
        if self.client_id.kind() != Some(NodeKind::Client) {
            return Err(MixError::ConfigError(format!(
                "{} is not a client identifier",
                self.client_id
            )));
        }
        if self.inbound_queue == 0 {
            return Err(MixError::ConfigError("inbound_queue must be positive".into()));
        }
        self.params.validate()
    }
}

/// A reply opened by the client.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Tag of the reply block the reply used.
    pub message_tag: MessageTag,
    /// Decrypted reply.
    pub payload: Vec<u8>,
    /// When it was opened.
    pub received_at: Instant,
}

/// Outstanding reply keys by message tag.
#[derive(Default)]
struct ReplyKeyStore {
    keys: Mutex<HashMap<MessageTag, SurbKeys>>,
}

impl ReplyKeyStore {
    fn insert(&self, tag: MessageTag, keys: SurbKeys) {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tag, keys);
    }

    fn take(&self, tag: &MessageTag) -> Option<SurbKeys> {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(tag)
    }

    fn len(&self) -> usize {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

struct ClientInner {
    config: MixClientConfig,
    crypto: Arc<dyn CryptoProvider>,
    pki: Arc<dyn MixPki>,
    transport: Arc<dyn MixTransport>,
    route_factory: Arc<dyn RouteFactory>,
    reply_keys: ReplyKeyStore,
    received: Option<mpsc::Sender<ReceivedMessage>>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl ClientInner {
    fn receive(&self, tag: &MessageTag, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let expected = self.config.params.delta_size();
        if ciphertext.len() != expected {
            return Err(MixError::MalformedPacketError {
                expected,
                actual: ciphertext.len(),
            });
        }

        // Taken before decrypting so two concurrent receives cannot both
        // succeed; put back if the ciphertext does not open.
        let keys = self.reply_keys.take(tag).ok_or(MixError::UnknownTagError)?;
        match decrypt_reply(self.crypto.as_ref(), &keys, ciphertext) {
            Ok(plaintext) => Ok(plaintext),
            Err(e) => {
                self.reply_keys.insert(*tag, keys);
                Err(e)
            }
        }
    }

    async fn handle_inbound(&self, raw: Vec<u8>) {
        if raw.len() < SECURITY_PARAMETER {
            debug!(len = raw.len(), "short client message dropped");
            return;
        }
        let (tag_bytes, ciphertext) = raw.split_at(SECURITY_PARAMETER);
        let mut tag: MessageTag = [0u8; SECURITY_PARAMETER];
        tag.copy_from_slice(tag_bytes);

        match self.receive(&tag, ciphertext) {
            Ok(payload) => {
                let Some(received) = &self.received else {
                    return;
                };
                let message = ReceivedMessage {
                    message_tag: tag,
                    payload,
                    received_at: Instant::now(),
                };
                tokio::select! {
                    _ = received.send(message) => {}
                    _ = self.cancel.cancelled() => {}
                }
            }
            Err(e) => debug!(client = %self.config.client_id, "reply dropped: {}", e),
        }
    }
}

/// The mixnet client.
#[derive(Clone)]
pub struct MixClient {
    inner: Arc<ClientInner>,
}

impl MixClient {
    /// Start building a client.
    pub fn builder(config: MixClientConfig) -> MixClientBuilder {
        MixClientBuilder::new(config)
    }

    /// Our client identifier.
    pub fn id(&self) -> NodeId {
        self.inner.config.client_id
    }

    /// Start the transport, publish our delivery address and begin opening
    /// inbound replies.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return Err(MixError::Shutdown);
        }

        let (tx, mut rx) = mpsc::channel(inner.config.inbound_queue);
        inner.transport.register_protocol(tx);
        inner.transport.start().await?;
        inner.pki.set_client_addr(
            inner.config.client_id,
            NodeAddr::new(inner.transport.name(), inner.transport.addr()),
        )?;
        info!(client = %inner.config.client_id, "mix client started");

        let client = self.inner.clone();
        self.inner.tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = client.cancel.cancelled() => break,
                    raw = rx.recv() => match raw {
                        Some(raw) => client.handle_inbound(raw).await,
                        None => break,
                    },
                }
            }
        });
        Ok(())
    }

    /// Wire bytes of a forward message along `route` to its last hop.
    pub fn forward_packet(&self, route: &RouteDescriptor, message: &[u8]) -> Result<Vec<u8>> {
        let inner = &self.inner;
        let path = route.resolve(inner.pki.as_ref())?;
        let packet = create_forward_packet(
            inner.crypto.as_ref(),
            &inner.config.params,
            &mut OsRng,
            &path,
            &route.last_hop(),
            message,
        )?;
        Ok(packet.to_bytes())
    }

    /// Send `message` along `route`.
    pub async fn send_on_route(&self, route: &RouteDescriptor, message: &[u8]) -> Result<()> {
        let bytes = self.forward_packet(route, message)?;
        let transport = &self.inner.transport;
        let addr = self
            .inner
            .pki
            .get_mix_addr(transport.name(), &route.first_hop())?;
        debug!(first_hop = %route.first_hop(), hops = route.len(), "sending forward message");
        transport.send(&addr, bytes).await
    }

    /// Send `message` to `destination` on a route from the route factory.
    pub async fn send(&self, destination: NodeId, message: &[u8]) -> Result<()> {
        let route = self.inner.route_factory.build_route(Some(destination))?;
        self.send_on_route(&route, message).await
    }

    /// Create a reply block whose reply travels `route` and then reaches us.
    pub fn create_reply_block(&self, route: &RouteDescriptor) -> Result<(ReplyBlock, MessageTag)> {
        let inner = &self.inner;
        let path = route.resolve(inner.pki.as_ref())?;
        let (block, tag, keys) = create_reply_block(
            inner.crypto.as_ref(),
            &inner.config.params,
            &mut OsRng,
            &path,
            &inner.config.client_id,
        )?;
        inner.reply_keys.insert(tag, keys);
        Ok((block, tag))
    }

    /// Open a reply delivered under `tag`. Each tag opens at most once.
    pub fn receive(&self, tag: &MessageTag, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.inner.receive(tag, ciphertext)
    }

    /// Send `message` through someone's reply block.
    pub async fn send_reply(&self, block: &ReplyBlock, message: &[u8]) -> Result<()> {
        let inner = &self.inner;
        let (first_hop, packet) =
            packet_from_reply_block(inner.crypto.as_ref(), &inner.config.params, block, message)?;
        let addr = inner.pki.get_mix_addr(inner.transport.name(), &first_hop)?;
        inner.transport.send(&addr, packet.to_bytes()).await
    }

    /// Reply blocks issued but not yet answered.
    pub fn outstanding_replies(&self) -> usize {
        self.inner.reply_keys.len()
    }

    /// Stop the inbound loop and the transport. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.transport.stop().await;
    }
}

/// Builder for [`MixClient`].
pub struct MixClientBuilder {
    config: MixClientConfig,
    crypto: Option<Arc<dyn CryptoProvider>>,
    pki: Option<Arc<dyn MixPki>>,
    transport: Option<Arc<dyn MixTransport>>,
    route_factory: Option<Arc<dyn RouteFactory>>,
    received: Option<mpsc::Sender<ReceivedMessage>>,
}

impl MixClientBuilder {
    /// Builder with `config` and nothing else set.
    pub fn new(config: MixClientConfig) -> Self {
        Self {
            config,
            crypto: None,
            pki: None,
            transport: None,
            route_factory: None,
            received: None,
        }
    }

    /// Crypto provider (defaults to [`Curve25519Provider`]).
    pub fn crypto(mut self, crypto: Arc<dyn CryptoProvider>) -> Self {
        self.crypto = Some(crypto);
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

    /// Route factory used by [`MixClient::send`]. Required.
    pub fn route_factory(mut self, route_factory: Arc<dyn RouteFactory>) -> Self {
        self.route_factory = Some(route_factory);
        self
    }

    /// Channel receiving opened replies.
    pub fn received(mut self, received: mpsc::Sender<ReceivedMessage>) -> Self {
        self.received = Some(received);
        self
    }

    /// Build the client.
    pub fn build(self) -> Result<MixClient> {
        self.config.validate()?;
        let missing = |what: &str| MixError::ConfigError(format!("{} is required", what));

        Ok(MixClient {
            inner: Arc::new(ClientInner {
                crypto: self
                    .crypto
                    .unwrap_or_else(|| Arc::new(Curve25519Provider::new())),
                pki: self.pki.ok_or_else(|| missing("a PKI"))?,
                transport: self.transport.ok_or_else(|| missing("a transport"))?,
                route_factory: self.route_factory.ok_or_else(|| missing("a route factory"))?,
                config: self.config,
                reply_keys: ReplyKeyStore::default(),
                received: self.received,
                tasks: TaskTracker::new(),
                cancel: CancellationToken::new(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hop::{unwrap_packet, UnwrapResult};
    use crate::packet::MixPacket;
    use crate::pki::MemoryPki;
    use crate::replay::MemoryReplayCache;
    use crate::route::CascadeRouteFactory;
    use crate::transport::MemoryNetwork;
    use sphinxmix_crypto::KeyPair;

    struct Setup {
        client: MixClient,
        route: RouteDescriptor,
        keys: Vec<KeyPair>,
    }

    fn setup(hops: usize) -> Setup {
        let params = SphinxParams::default();
        let pki = Arc::new(MemoryPki::new());
        let mut ids = Vec::new();
        let mut keys = Vec::new();
        for i in 0..hops {
            let id = NodeId::random_mix(&mut OsRng);
            let pair = KeyPair::generate(&mut OsRng);
            pki.set(id, *pair.public_key(), NodeAddr::new("memory", format!("mix-{}", i)))
                .unwrap();
            ids.push(id);
            keys.push(pair);
        }
        let route = RouteDescriptor::new(ids, &params).unwrap();

        let client = MixClient::builder(MixClientConfig::new(NodeId::random_client(&mut OsRng)))
            .pki(pki)
            .transport(Arc::new(MemoryNetwork::new().transport("client")))
            .route_factory(Arc::new(CascadeRouteFactory::new(route.clone())))
            .build()
            .unwrap();

        Setup { client, route, keys }
    }

    // Carry a packet through the route by hand; returns what the last hop emits.
    fn traverse(setup: &Setup, mut packet: MixPacket) -> UnwrapResult {
        let crypto = Curve25519Provider::new();
        let params = SphinxParams::default();
        for (i, keys) in setup.keys.iter().enumerate() {
            let result = unwrap_packet(&crypto, &params, &MemoryReplayCache::new(), keys.private_key(), &packet).unwrap();
            match result {
                UnwrapResult::NextHop { destination, packet: next } => {
                    assert_eq!(destination, setup.route.hops()[i + 1]);
                    packet = next;
                }
                last => return last,
            }
        }
        panic!("packet never left the route");
    }

    fn reply_payload(setup: &Setup, block: &ReplyBlock, message: &[u8]) -> (MessageTag, Vec<u8>) {
        let (_, packet) =
            packet_from_reply_block(&Curve25519Provider::new(), &SphinxParams::default(), block, message).unwrap();
        match traverse(setup, packet) {
            UnwrapResult::ClientDelivery {
                client_id,
                message_tag,
                payload,
            } => {
                assert_eq!(client_id, setup.client.id());
                (message_tag, payload)
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_forward_packet_reaches_last_hop() {
        let setup = setup(3);
        let bytes = setup.client.forward_packet(&setup.route, b"hello").unwrap();
        let packet = MixPacket::from_bytes(&SphinxParams::default(), &bytes).unwrap();

        match traverse(&setup, packet) {
            UnwrapResult::ExitDelivery { destination, payload } => {
                assert_eq!(destination, setup.route.last_hop());
                assert_eq!(payload, b"hello");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_reply_block_single_use() {
        let setup = setup(3);
        let (block, tag) = setup.client.create_reply_block(&setup.route).unwrap();
        assert_eq!(setup.client.outstanding_replies(), 1);

        let (delivered_tag, payload) = reply_payload(&setup, &block, b"pong");
        assert_eq!(delivered_tag, tag);

        assert_eq!(setup.client.receive(&tag, &payload).unwrap(), b"pong");
        assert_eq!(setup.client.outstanding_replies(), 0);

        let consumed = setup.client.receive(&tag, &payload).unwrap_err();
        let never_issued = setup.client.receive(&[0x5a; SECURITY_PARAMETER], &payload).unwrap_err();
        assert!(matches!(consumed, MixError::UnknownTagError));
        assert!(matches!(never_issued, MixError::UnknownTagError));
        assert_eq!(consumed.to_string(), never_issued.to_string());
    }

    #[test]
    fn test_failed_decrypt_keeps_tag() {
        let setup = setup(2);
        let (block, tag) = setup.client.create_reply_block(&setup.route).unwrap();
        let (_, payload) = reply_payload(&setup, &block, b"answer");

        let mut forged = payload.clone();
        forged[7] ^= 0xff;
        assert!(matches!(setup.client.receive(&tag, &forged), Err(MixError::IntegrityError)));
        assert_eq!(setup.client.outstanding_replies(), 1);

        assert_eq!(setup.client.receive(&tag, &payload).unwrap(), b"answer");
    }

    #[test]
    fn test_wrong_length_ciphertext() {
        let setup = setup(1);
        let (_block, tag) = setup.client.create_reply_block(&setup.route).unwrap();
        assert!(matches!(
            setup.client.receive(&tag, &[0u8; 40]),
            Err(MixError::MalformedPacketError { .. })
        ));
        assert_eq!(setup.client.outstanding_replies(), 1);
    }

    #[test]
    fn test_oversized_message() {
        let setup = setup(2);
        let message = vec![0u8; SphinxParams::default().payload_size];
        assert!(matches!(
            setup.client.forward_packet(&setup.route, &message),
            Err(MixError::PayloadTooLargeError { .. })
        ));
    }

    #[test]
    fn test_builder_requires_collaborators() {
        let config = MixClientConfig::new(NodeId::random_client(&mut OsRng));
        assert!(matches!(
            MixClient::builder(config).build(),
            Err(MixError::ConfigError(_))
        ));

        let mix_id = MixClientConfig::new(NodeId::random_mix(&mut OsRng));
        assert!(mix_id.validate().is_err());

        let parsed = MixClientConfig::from_json(
            r#"{"client_id": [240, 9, 9, 9, 9, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0], "inbound_queue": 16}"#,
        )
        .unwrap();
        assert_eq!(parsed.inbound_queue, 16);
        parsed.validate().unwrap();
    }
}
