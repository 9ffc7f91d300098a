//! # Directory (PKI)
//!
//! Maps node identifiers to public keys and network addresses. The real
//! directory service lives outside this crate; [`MemoryPki`] is the shared
//! in-process directory used for tests and single-process deployments.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use sphinxmix_crypto::PublicKey;

use crate::{MixError, NodeId, Result};

/// A network address qualified by the transport that can reach it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddr {
    /// Transport name (e.g. `"udp"`).
    pub transport: String,
    /// Transport-specific address.
    pub address: String,
}

impl NodeAddr {
    /// Create an address.
    pub fn new(transport: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            transport: transport.into(),
            address: address.into(),
        }
    }
}

/// Directory of mix nodes and clients.
pub trait MixPki: Send + Sync {
    /// Publish a mix node. Fails if the identifier is already taken.
    fn set(&self, id: NodeId, public_key: PublicKey, addr: NodeAddr) -> Result<()>;

    /// Public key of a mix node.
    fn get(&self, id: &NodeId) -> Result<PublicKey>;

    /// All published mix node identifiers.
    fn identities(&self) -> Vec<NodeId>;

    /// Address of a mix node on `transport`.
    fn get_mix_addr(&self, transport: &str, id: &NodeId) -> Result<String>;

    /// Publish a client's delivery address.
    fn set_client_addr(&self, client_id: NodeId, addr: NodeAddr) -> Result<()>;

    /// Delivery address of a client on `transport`.
    fn get_client_addr(&self, transport: &str, client_id: &NodeId) -> Result<String>;

    /// Announce a new key for a node. Directories without rotation ignore it.
    fn rotate(&self, _id: &NodeId, _public_key: PublicKey) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct MixEntry {
    public_key: PublicKey,
    addr: NodeAddr,
}

/// In-memory directory.
#[derive(Debug, Default)]
pub struct MemoryPki {
    mixes: RwLock<BTreeMap<NodeId, MixEntry>>,
    clients: RwLock<BTreeMap<NodeId, NodeAddr>>,
}

impl MemoryPki {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_transport(addr: &NodeAddr, transport: &str) -> Result<String> {
    if addr.transport != transport {
        return Err(MixError::TransportMismatchError {
            expected: transport.to_string(),
            actual: addr.transport.clone(),
        });
    }
    Ok(addr.address.clone())
}

impl MixPki for MemoryPki {
    fn set(&self, id: NodeId, public_key: PublicKey, addr: NodeAddr) -> Result<()> {
        let mut mixes = self.mixes.write().unwrap_or_else(PoisonError::into_inner);
        if mixes.contains_key(&id) {
            return Err(MixError::PkiError(format!("node {} already published", id)));
        }
        mixes.insert(id, MixEntry { public_key, addr });
        Ok(())
    }

    fn get(&self, id: &NodeId) -> Result<PublicKey> {
        self.mixes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|entry| entry.public_key)
            .ok_or(MixError::UnknownNodeError(*id))
    }

    fn identities(&self) -> Vec<NodeId> {
        self.mixes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    fn get_mix_addr(&self, transport: &str, id: &NodeId) -> Result<String> {
        let mixes = self.mixes.read().unwrap_or_else(PoisonError::into_inner);
        let entry = mixes.get(id).ok_or(MixError::UnknownNodeError(*id))?;
        check_transport(&entry.addr, transport)
    }

    fn set_client_addr(&self, client_id: NodeId, addr: NodeAddr) -> Result<()> {
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(client_id, addr);
        Ok(())
    }

    fn get_client_addr(&self, transport: &str, client_id: &NodeId) -> Result<String> {
        let clients = self.clients.read().unwrap_or_else(PoisonError::into_inner);
        let addr = clients
            .get(client_id)
            .ok_or(MixError::UnknownClientError(*client_id))?;
        check_transport(addr, transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sphinxmix_crypto::KeyPair;

    #[test]
    fn test_set_and_get() {
        let pki = MemoryPki::new();
        let mut rng = rand::thread_rng();
        let id = NodeId::random_mix(&mut rng);
        let keys = KeyPair::generate(&mut rng);

        pki.set(id, *keys.public_key(), NodeAddr::new("memory", "mix-1")).unwrap();

        assert_eq!(pki.get(&id).unwrap(), *keys.public_key());
        assert_eq!(pki.identities(), vec![id]);
        assert_eq!(pki.get_mix_addr("memory", &id).unwrap(), "mix-1");
    }

    #[test]
    fn test_duplicate_rejected() {
        let pki = MemoryPki::new();
        let mut rng = rand::thread_rng();
        let id = NodeId::random_mix(&mut rng);
        let key = *KeyPair::generate(&mut rng).public_key();

        pki.set(id, key, NodeAddr::new("memory", "a")).unwrap();
        assert!(matches!(
            pki.set(id, key, NodeAddr::new("memory", "b")),
            Err(MixError::PkiError(_))
        ));
    }

    #[test]
    fn test_unknown_and_mismatched_lookups() {
        let pki = MemoryPki::new();
        let mut rng = rand::thread_rng();
        let id = NodeId::random_mix(&mut rng);
        let client = NodeId::random_client(&mut rng);

        assert!(matches!(pki.get(&id), Err(MixError::UnknownNodeError(_))));
        assert!(matches!(
            pki.get_client_addr("memory", &client),
            Err(MixError::UnknownClientError(_))
        ));

        pki.set_client_addr(client, NodeAddr::new("udp", "127.0.0.1:9")).unwrap();
        assert!(matches!(
            pki.get_client_addr("memory", &client),
            Err(MixError::TransportMismatchError { .. })
        ));
        assert_eq!(pki.get_client_addr("udp", &client).unwrap(), "127.0.0.1:9");
    }
}
