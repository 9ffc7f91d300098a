//! # Key Material
//!
//! Node and client key pairs. Private keys and shared secrets are wiped on
//! drop and never printed.

use std::fmt;

use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use x25519_dalek::StaticSecret;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{GroupElement, GROUP_ELEMENT_SIZE, SCALAR_SIZE};

/// A public key: a group element published through the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; GROUP_ELEMENT_SIZE]);

impl PublicKey {
    /// Wrap raw group element bytes.
    pub fn from_bytes(bytes: GroupElement) -> Self {
        Self(bytes)
    }

    /// Get the bytes of the public key.
    pub fn as_bytes(&self) -> &GroupElement {
        &self.0
    }
}

impl From<GroupElement> for PublicKey {
    fn from(bytes: GroupElement) -> Self {
        Self(bytes)
    }
}

/// A private scalar. Never leaves the owning process.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey([u8; SCALAR_SIZE]);

impl PrivateKey {
    /// Wrap raw scalar bytes.
    pub fn from_bytes(bytes: [u8; SCALAR_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the bytes of the private key.
    pub fn as_bytes(&self) -> &[u8; SCALAR_SIZE] {
        &self.0
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

/// Output of a Diffie-Hellman exchange between a hop and a sender.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; GROUP_ELEMENT_SIZE]);

impl SharedSecret {
    /// Wrap raw secret bytes.
    pub fn from_bytes(bytes: [u8; GROUP_ELEMENT_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the bytes of the secret.
    pub fn as_bytes(&self) -> &[u8; GROUP_ELEMENT_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// A node's or client's long-term key pair.
#[derive(Debug, Clone)]
pub struct KeyPair {
    public_key: PublicKey,
    private_key: PrivateKey,
}

impl KeyPair {
    /// Generate a fresh key pair.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = StaticSecret::random_from_rng(rng);
        let public = x25519_dalek::PublicKey::from(&secret);
        Self {
            public_key: PublicKey(public.to_bytes()),
            private_key: PrivateKey(secret.to_bytes()),
        }
    }

    /// Rebuild a key pair from a stored private key.
    pub fn from_private_key(private_key: PrivateKey) -> Self {
        let secret = StaticSecret::from(*private_key.as_bytes());
        let public = x25519_dalek::PublicKey::from(&secret);
        Self {
            public_key: PublicKey(public.to_bytes()),
            private_key,
        }
    }

    /// The public half.
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// The private half.
    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }
}
