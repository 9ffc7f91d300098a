//! # Crypto Provider
//!
//! The seam between packet processing and the primitives it needs. Header
//! construction and hop unwrapping only ever call through
//! [`CryptoProvider`]; [`Curve25519Provider`] is the implementation used by
//! default.

use std::fmt;

use aes::cipher::{KeyIvInit, StreamCipher};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use x25519_dalek::{StaticSecret, X25519_BASEPOINT_BYTES};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::lioness::Lioness;
use crate::{
    CryptoError, GroupElement, PrivateKey, Result, SharedSecret, MAC_KEY_SIZE, MAC_SIZE,
    REPLAY_TAG_SIZE, SCALAR_SIZE, SPRP_KEY_SIZE, STREAM_KEY_SIZE,
};

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

const LABEL_HEADER_MAC: &[u8] = b"sphinxmix-header-mac";
const LABEL_HEADER_STREAM: &[u8] = b"sphinxmix-header-stream";
const LABEL_PAYLOAD: &[u8] = b"sphinxmix-payload-sprp";
const LABEL_BLINDING: &[u8] = b"sphinxmix-blinding";
const LABEL_REPLAY: &[u8] = b"sphinxmix-replay-tag";

/// Keys derived from one hop's shared secret.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PacketKeys {
    /// Key for the header MAC (gamma).
    pub header_mac: [u8; MAC_KEY_SIZE],
    /// Key for the header stream cipher (rho).
    pub header_encryption: [u8; STREAM_KEY_SIZE],
    /// Key for the payload wide-block cipher (pi).
    pub payload_encryption: [u8; SPRP_KEY_SIZE],
    /// Scalar that blinds the group element for the next hop.
    pub blinding_factor: [u8; SCALAR_SIZE],
    /// Value recorded by the replay cache.
    pub replay_tag: [u8; REPLAY_TAG_SIZE],
}

impl fmt::Debug for PacketKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PacketKeys(..)")
    }
}

/// Primitives required to build and process Sphinx packets.
///
/// Implementations must be deterministic: the sender and every hop derive
/// the same values from the same inputs.
pub trait CryptoProvider: Send + Sync {
    /// The group generator.
    fn generator(&self) -> GroupElement;

    /// Raise `element` to `scalar`. Used both for public key derivation and
    /// for blinding.
    fn exp(&self, element: &GroupElement, scalar: &[u8; SCALAR_SIZE]) -> GroupElement;

    /// Node-side shared secret; rejects elements that do not contribute.
    fn shared_secret(&self, private_key: &PrivateKey, element: &GroupElement) -> Result<SharedSecret>;

    /// Expand a shared secret into the per-hop key set.
    fn derive_keys(&self, secret: &SharedSecret) -> Result<PacketKeys>;

    /// Truncated MAC over `data`.
    fn mac(&self, key: &[u8; MAC_KEY_SIZE], data: &[u8]) -> Result<[u8; MAC_SIZE]>;

    /// Constant-time MAC check.
    fn verify_mac(&self, key: &[u8; MAC_KEY_SIZE], data: &[u8], tag: &[u8; MAC_SIZE]) -> Result<bool> {
        let expected = self.mac(key, data)?;
        Ok(expected[..].ct_eq(&tag[..]).into())
    }

    /// `length` bytes of keystream.
    fn stream(&self, key: &[u8; STREAM_KEY_SIZE], length: usize) -> Vec<u8>;

    /// Wide-block encryption of `block` in place.
    fn sprp_encrypt(&self, key: &[u8; SPRP_KEY_SIZE], block: &mut [u8]) -> Result<()>;

    /// Wide-block decryption of `block` in place.
    fn sprp_decrypt(&self, key: &[u8; SPRP_KEY_SIZE], block: &mut [u8]) -> Result<()>;
}

/// X25519 / HKDF-SHA256 / HMAC-SHA256 / AES-128-CTR / Lioness.
#[derive(Debug, Clone, Copy, Default)]
pub struct Curve25519Provider;

impl Curve25519Provider {
    /// Create the provider.
    pub fn new() -> Self {
        Self
    }
}

impl CryptoProvider for Curve25519Provider {
    fn generator(&self) -> GroupElement {
        X25519_BASEPOINT_BYTES
    }

    fn exp(&self, element: &GroupElement, scalar: &[u8; SCALAR_SIZE]) -> GroupElement {
        x25519_dalek::x25519(*scalar, *element)
    }

    fn shared_secret(&self, private_key: &PrivateKey, element: &GroupElement) -> Result<SharedSecret> {
        let secret = StaticSecret::from(*private_key.as_bytes());
        let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(*element));
        if !shared.was_contributory() {
            return Err(CryptoError::NonContributory);
        }
        Ok(SharedSecret::from_bytes(*shared.as_bytes()))
    }

    fn derive_keys(&self, secret: &SharedSecret) -> Result<PacketKeys> {
        let hk = Hkdf::<Sha256>::new(None, secret.as_bytes());
        let mut keys = PacketKeys {
            header_mac: [0u8; MAC_KEY_SIZE],
            header_encryption: [0u8; STREAM_KEY_SIZE],
            payload_encryption: [0u8; SPRP_KEY_SIZE],
            blinding_factor: [0u8; SCALAR_SIZE],
            replay_tag: [0u8; REPLAY_TAG_SIZE],
        };

        hk.expand(LABEL_HEADER_MAC, &mut keys.header_mac)
            .map_err(|_| CryptoError::KeyDerivation)?;
        hk.expand(LABEL_HEADER_STREAM, &mut keys.header_encryption)
            .map_err(|_| CryptoError::KeyDerivation)?;
        hk.expand(LABEL_PAYLOAD, &mut keys.payload_encryption)
            .map_err(|_| CryptoError::KeyDerivation)?;
        hk.expand(LABEL_BLINDING, &mut keys.blinding_factor)
            .map_err(|_| CryptoError::KeyDerivation)?;
        hk.expand(LABEL_REPLAY, &mut keys.replay_tag)
            .map_err(|_| CryptoError::KeyDerivation)?;

        Ok(keys)
    }

    fn mac(&self, key: &[u8; MAC_KEY_SIZE], data: &[u8]) -> Result<[u8; MAC_SIZE]> {
        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| CryptoError::InvalidMacKey)?;
        mac.update(data);
        let digest = mac.finalize().into_bytes();

        let mut tag = [0u8; MAC_SIZE];
        tag.copy_from_slice(&digest[..MAC_SIZE]);
        Ok(tag)
    }

    fn stream(&self, key: &[u8; STREAM_KEY_SIZE], length: usize) -> Vec<u8> {
        let mut aes_key = [0u8; 16];
        let mut iv = [0u8; 16];
        aes_key.copy_from_slice(&key[..16]);
        iv.copy_from_slice(&key[16..]);

        let mut keystream = vec![0u8; length];
        let mut cipher = Aes128Ctr::new(&aes_key.into(), &iv.into());
        cipher.apply_keystream(&mut keystream);
        aes_key.zeroize();
        keystream
    }

    fn sprp_encrypt(&self, key: &[u8; SPRP_KEY_SIZE], block: &mut [u8]) -> Result<()> {
        Lioness::new(key).encrypt(block)
    }

    fn sprp_decrypt(&self, key: &[u8; SPRP_KEY_SIZE], block: &mut [u8]) -> Result<()> {
        Lioness::new(key).decrypt(block)
    }
}
