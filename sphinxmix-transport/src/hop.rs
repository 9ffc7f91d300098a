//! # Hop Unwrap Engine
//!
//! What a mix does with one inbound packet: authenticate the header, record
//! the replay tag, strip one routing layer and one payload layer, and decide
//! where the result goes.
//!
//! Checks run in a fixed order. A packet that fails integrity never reaches
//! the replay cache, so forged packets cannot poison it.

use sphinxmix_crypto::{xor_in_place, CryptoError, CryptoProvider, PrivateKey};

use crate::packet::{MixPacket, SphinxParams, PAYLOAD_TAG_SIZE, SECURITY_PARAMETER};
use crate::replay::ReplayCache;
use crate::sphinx::{unpad_body, MessageTag, EXIT_MARKER};
use crate::{MixError, NodeId, Result, CLIENT_TAG, MIX_NODE_TAG, NODE_ID_SIZE};

/// Outcome of unwrapping one layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnwrapResult {
    /// Forward `packet` to the mix `destination`.
    NextHop {
        /// Next mix.
        destination: NodeId,
        /// Re-encrypted packet.
        packet: MixPacket,
    },
    /// Hand a reply to the client that made the reply block.
    ClientDelivery {
        /// Receiving client.
        client_id: NodeId,
        /// Tag selecting the client's reply keys.
        message_tag: MessageTag,
        /// Payload still wrapped under the client's keys.
        payload: Vec<u8>,
    },
    /// Deliver a cleartext message to its recipient.
    ExitDelivery {
        /// Recipient named by the sender.
        destination: NodeId,
        /// Cleartext message.
        payload: Vec<u8>,
    },
}

/// Unwrap one layer of `packet` with this node's private key.
pub fn unwrap_packet(
    crypto: &dyn CryptoProvider,
    params: &SphinxParams,
    replay_cache: &dyn ReplayCache,
    private_key: &PrivateKey,
    packet: &MixPacket,
) -> Result<UnwrapResult> {
    if !packet.matches(params) {
        return Err(MixError::MalformedPacketError {
            expected: params.packet_size(),
            actual: packet.alpha.len() + packet.beta.len() + packet.gamma.len() + packet.delta.len(),
        });
    }

    let secret = crypto
        .shared_secret(private_key, &packet.alpha)
        .map_err(|e| match e {
            CryptoError::NonContributory => MixError::IntegrityError,
            other => MixError::CryptoError(other),
        })?;
    let keys = crypto.derive_keys(&secret)?;

    if !crypto.verify_mac(&keys.header_mac, &packet.beta, &packet.gamma)? {
        return Err(MixError::IntegrityError);
    }

    if replay_cache.contains_and_insert(&keys.replay_tag) {
        return Err(MixError::ReplayError);
    }

    let k = SECURITY_PARAMETER;
    let beta_len = params.beta_size();
    let mut routing = Vec::with_capacity(beta_len + 2 * k);
    routing.extend_from_slice(&packet.beta);
    routing.extend_from_slice(&[0u8; 2 * SECURITY_PARAMETER]);
    let stream = crypto.stream(&keys.header_encryption, routing.len());
    xor_in_place(&mut routing, &stream);

    let mut delta = packet.delta.clone();
    crypto.sprp_decrypt(&keys.payload_encryption, &mut delta)?;

    let marker = &routing[..NODE_ID_SIZE];
    if marker == EXIT_MARKER {
        return exit_delivery(&delta);
    }

    match routing[0] {
        MIX_NODE_TAG => {
            let destination = NodeId::from_slice(marker).ok_or(MixError::InvalidRoutingError(routing[0]))?;
            let mut gamma = [0u8; SECURITY_PARAMETER];
            gamma.copy_from_slice(&routing[k..2 * k]);
            Ok(UnwrapResult::NextHop {
                destination,
                packet: MixPacket {
                    alpha: crypto.exp(&packet.alpha, &keys.blinding_factor),
                    beta: routing[2 * k..].to_vec(),
                    gamma,
                    delta,
                },
            })
        }
        CLIENT_TAG => {
            let client_id = NodeId::from_slice(marker).ok_or(MixError::InvalidRoutingError(routing[0]))?;
            let mut message_tag: MessageTag = [0u8; SECURITY_PARAMETER];
            message_tag.copy_from_slice(&routing[k..2 * k]);
            Ok(UnwrapResult::ClientDelivery {
                client_id,
                message_tag,
                payload: delta,
            })
        }
        other => Err(MixError::InvalidRoutingError(other)),
    }
}

fn exit_delivery(body: &[u8]) -> Result<UnwrapResult> {
    if body.len() < PAYLOAD_TAG_SIZE + NODE_ID_SIZE {
        return Err(MixError::InvalidPayloadError);
    }
    if body[..PAYLOAD_TAG_SIZE].iter().any(|&b| b != 0) {
        return Err(MixError::IntegrityError);
    }
    let rest = &body[PAYLOAD_TAG_SIZE..];
    let destination =
        NodeId::from_slice(&rest[..NODE_ID_SIZE]).ok_or(MixError::InvalidPayloadError)?;
    let payload = unpad_body(&rest[NODE_ID_SIZE..])?;
    Ok(UnwrapResult::ExitDelivery {
        destination,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::MemoryReplayCache;
    use crate::sphinx::{
        create_forward_packet, create_header, create_reply_block, decrypt_reply,
        packet_from_reply_block, PathHop,
    };
    use sphinxmix_crypto::{Curve25519Provider, KeyPair};

    struct TestNode {
        id: NodeId,
        keys: KeyPair,
        cache: MemoryReplayCache,
    }

    fn nodes(n: usize) -> Vec<TestNode> {
        let mut rng = rand::thread_rng();
        (0..n)
            .map(|_| TestNode {
                id: NodeId::random_mix(&mut rng),
                keys: KeyPair::generate(&mut rng),
                cache: MemoryReplayCache::new(),
            })
            .collect()
    }

    fn path_of(nodes: &[TestNode]) -> Vec<PathHop> {
        nodes
            .iter()
            .map(|n| PathHop {
                id: n.id,
                public_key: *n.keys.public_key(),
            })
            .collect()
    }

    fn unwrap_at(node: &TestNode, packet: &MixPacket) -> Result<UnwrapResult> {
        unwrap_packet(
            &Curve25519Provider::new(),
            &SphinxParams::default(),
            &node.cache,
            node.keys.private_key(),
            packet,
        )
    }

    #[test]
    fn test_forward_every_route_length() {
        let crypto = Curve25519Provider::new();
        let params = SphinxParams::default();
        let recipient = NodeId::random_mix(&mut rand::thread_rng());

        for hops in 1..=params.max_hops {
            let route = nodes(hops);
            let mut packet = create_forward_packet(
                &crypto,
                &params,
                &mut rand::thread_rng(),
                &path_of(&route),
                &recipient,
                b"the quick brown fox",
            )
            .unwrap();

            for (i, node) in route.iter().enumerate() {
                // Every hop sees a full-size packet on the wire.
                let wire = packet.to_bytes();
                assert_eq!(wire.len(), params.packet_size());
                packet = MixPacket::from_bytes(&params, &wire).unwrap();

                match unwrap_at(node, &packet).unwrap() {
                    UnwrapResult::NextHop { destination, packet: next } => {
                        assert!(i + 1 < hops, "hop {} of {} forwarded", i, hops);
                        assert_eq!(destination, route[i + 1].id);
                        packet = next;
                    }
                    UnwrapResult::ExitDelivery { destination, payload } => {
                        assert_eq!(i + 1, hops);
                        assert_eq!(destination, recipient);
                        assert_eq!(payload, b"the quick brown fox");
                    }
                    other => panic!("unexpected result: {:?}", other),
                }
            }
        }
    }

    #[test]
    fn test_replay_rejected() {
        let crypto = Curve25519Provider::new();
        let params = SphinxParams::default();
        let route = nodes(2);
        let packet = create_forward_packet(
            &crypto,
            &params,
            &mut rand::thread_rng(),
            &path_of(&route),
            &route[1].id,
            b"once",
        )
        .unwrap();

        assert!(unwrap_at(&route[0], &packet).is_ok());
        assert!(matches!(unwrap_at(&route[0], &packet), Err(MixError::ReplayError)));
    }

    #[test]
    fn test_tampered_header_does_not_touch_cache() {
        let crypto = Curve25519Provider::new();
        let params = SphinxParams::default();
        let route = nodes(2);
        let mut packet = create_forward_packet(
            &crypto,
            &params,
            &mut rand::thread_rng(),
            &path_of(&route),
            &route[1].id,
            b"tamper",
        )
        .unwrap();
        packet.beta[40] ^= 0x01;

        assert!(matches!(unwrap_at(&route[0], &packet), Err(MixError::IntegrityError)));
        assert_eq!(route[0].cache.len(), 0);

        // Same for a forged MAC.
        packet.beta[40] ^= 0x01;
        packet.gamma[0] ^= 0x80;
        assert!(matches!(unwrap_at(&route[0], &packet), Err(MixError::IntegrityError)));
        assert_eq!(route[0].cache.len(), 0);
    }

    #[test]
    fn test_wrong_node_key() {
        let crypto = Curve25519Provider::new();
        let params = SphinxParams::default();
        let route = nodes(1);
        let stranger = nodes(1);
        let packet = create_forward_packet(
            &crypto,
            &params,
            &mut rand::thread_rng(),
            &path_of(&route),
            &route[0].id,
            b"x",
        )
        .unwrap();

        assert!(matches!(unwrap_at(&stranger[0], &packet), Err(MixError::IntegrityError)));
    }

    #[test]
    fn test_low_order_alpha_is_integrity_failure() {
        let route = nodes(1);
        let params = SphinxParams::default();
        let packet = MixPacket {
            alpha: [0u8; 32],
            beta: vec![0u8; params.beta_size()],
            gamma: [0u8; 16],
            delta: vec![0u8; params.delta_size()],
        };
        assert!(matches!(unwrap_at(&route[0], &packet), Err(MixError::IntegrityError)));
    }

    #[test]
    fn test_tampered_payload_detected_at_exit() {
        let crypto = Curve25519Provider::new();
        let params = SphinxParams::default();
        let route = nodes(1);
        let mut packet = create_forward_packet(
            &crypto,
            &params,
            &mut rand::thread_rng(),
            &path_of(&route),
            &route[0].id,
            b"payload",
        )
        .unwrap();
        packet.delta[500] ^= 0x10;

        assert!(matches!(unwrap_at(&route[0], &packet), Err(MixError::IntegrityError)));
    }

    #[test]
    fn test_unknown_routing_marker() {
        let crypto = Curve25519Provider::new();
        let params = SphinxParams::default();
        let route = nodes(1);
        let (header, _keys) = create_header(
            &crypto,
            &params,
            &mut rand::thread_rng(),
            &path_of(&route),
            &[0x42; NODE_ID_SIZE],
            &[0u8; SECURITY_PARAMETER],
        )
        .unwrap();
        let packet = header.into_packet(vec![0u8; params.delta_size()]);

        assert!(matches!(
            unwrap_at(&route[0], &packet),
            Err(MixError::InvalidRoutingError(0x42))
        ));
    }

    #[test]
    fn test_malformed_packet_rejected_first() {
        let route = nodes(1);
        let packet = MixPacket {
            alpha: [0u8; 32],
            beta: vec![0u8; 3],
            gamma: [0u8; 16],
            delta: vec![],
        };
        assert!(matches!(
            unwrap_at(&route[0], &packet),
            Err(MixError::MalformedPacketError { .. })
        ));
    }

    #[test]
    fn test_reply_block_delivery() {
        let crypto = Curve25519Provider::new();
        let params = SphinxParams::default();
        let route = nodes(3);
        let client = NodeId::random_client(&mut rand::thread_rng());

        let (block, tag, keys) =
            create_reply_block(&crypto, &params, &mut rand::thread_rng(), &path_of(&route), &client).unwrap();
        let (first_hop, mut packet) = packet_from_reply_block(&crypto, &params, &block, b"pong").unwrap();
        assert_eq!(first_hop, route[0].id);

        for (i, node) in route.iter().enumerate() {
            match unwrap_at(node, &packet).unwrap() {
                UnwrapResult::NextHop { packet: next, .. } => packet = next,
                UnwrapResult::ClientDelivery {
                    client_id,
                    message_tag,
                    payload,
                } => {
                    assert_eq!(i, route.len() - 1);
                    assert_eq!(client_id, client);
                    assert_eq!(message_tag, tag);
                    assert_eq!(decrypt_reply(&crypto, &keys, &payload).unwrap(), b"pong");
                    return;
                }
                other => panic!("unexpected result: {:?}", other),
            }
        }
        panic!("reply never reached the client");
    }
}
