//! # sphinxmix Crypto
//!
//! Cryptographic primitives behind the sphinxmix packet format.
//!
//! Packet processing never touches a primitive directly; it goes through the
//! [`CryptoProvider`] trait so that the group, KDF, MAC, stream cipher and
//! wide-block cipher can be swapped as a unit. The shipped provider is
//! [`Curve25519Provider`]:
//! - **X25519** for the group element carried in every header
//! - **HKDF-SHA256** for per-hop key derivation
//! - **HMAC-SHA256** (truncated) for header integrity
//! - **AES-128-CTR** as the header stream cipher
//! - **Lioness** as the payload wide-block cipher
//!
//! ## Safety
//!
//! This crate forbids all unsafe code.
//!
//! ## Example
//!
//! ```rust,ignore
//! use sphinxmix_crypto::{CryptoProvider, Curve25519Provider, KeyPair};
//!
//! let provider = Curve25519Provider::new();
//! let node = KeyPair::generate(&mut rand::thread_rng());
//!
//! // Sender side: ephemeral secret against the node's public key
//! let ephemeral = KeyPair::generate(&mut rand::thread_rng());
//! let sender = provider.exp(node.public_key().as_bytes(), ephemeral.private_key().as_bytes());
//!
//! // Node side: its own secret against the ephemeral element
//! let receiver = provider.shared_secret(node.private_key(), ephemeral.public_key().as_bytes()).unwrap();
//! assert_eq!(&sender, receiver.as_bytes());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod keys;
pub mod lioness;
pub mod provider;

pub use keys::{KeyPair, PrivateKey, PublicKey, SharedSecret};
pub use lioness::Lioness;
pub use provider::{CryptoProvider, Curve25519Provider, PacketKeys};

use thiserror::Error;

/// Size of a serialized group element (an X25519 point).
pub const GROUP_ELEMENT_SIZE: usize = 32;

/// Size of a scalar / private key.
pub const SCALAR_SIZE: usize = 32;

/// Size of the truncated header MAC.
pub const MAC_SIZE: usize = 16;

/// Size of a header MAC key.
pub const MAC_KEY_SIZE: usize = 32;

/// Size of a stream cipher key (AES-128 key followed by the counter IV).
pub const STREAM_KEY_SIZE: usize = 32;

/// Size of the full digest output.
pub const HASH_SIZE: usize = 32;

/// Size of a Lioness key (four 32-byte round keys).
pub const SPRP_KEY_SIZE: usize = 4 * HASH_SIZE;

/// Size of a replay tag.
pub const REPLAY_TAG_SIZE: usize = HASH_SIZE;

/// A serialized group element.
pub type GroupElement = [u8; GROUP_ELEMENT_SIZE];

/// Errors that can occur in sphinxmix cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The group element produced an all-zero shared secret (low-order point).
    #[error("Non-contributory group element")]
    NonContributory,

    /// Key derivation was asked for an impossible output length.
    #[error("Key derivation failed")]
    KeyDerivation,

    /// A MAC key had an unusable length.
    #[error("Invalid MAC key")]
    InvalidMacKey,

    /// The wide-block cipher was given a block it cannot process.
    #[error("Invalid block size: need more than {minimum} bytes, got {actual}")]
    InvalidBlockSize {
        /// Minimum exclusive block size.
        minimum: usize,
        /// Provided block size.
        actual: usize,
    },
}

/// Result type for crypto operations.
pub type Result<T> = std::result::Result<T, CryptoError>;

/// XOR `other` into `target` byte by byte, over the shorter of the two.
pub fn xor_in_place(target: &mut [u8], other: &[u8]) {
    for (t, o) in target.iter_mut().zip(other) {
        *t ^= o;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xor_in_place() {
        let mut a = [0x0fu8, 0xf0, 0xaa];
        xor_in_place(&mut a, &[0xff, 0xff]);
        assert_eq!(a, [0xf0, 0x0f, 0xaa]);
    }

    #[test]
    fn test_shared_secret_agreement() {
        let provider = Curve25519Provider::new();
        let mut rng = rand::thread_rng();
        let node = KeyPair::generate(&mut rng);
        let ephemeral = KeyPair::generate(&mut rng);

        let sender = provider.exp(node.public_key().as_bytes(), ephemeral.private_key().as_bytes());
        let receiver = provider
            .shared_secret(node.private_key(), ephemeral.public_key().as_bytes())
            .unwrap();

        assert_eq!(&sender, receiver.as_bytes());
    }
}
