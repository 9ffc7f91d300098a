//! # Lioness Wide-Block Cipher
//!
//! A four-round unbalanced Feistel construction over a stream cipher and a
//! keyed hash (Anderson and Biham). Any change to any byte of the ciphertext
//! garbles the whole plaintext, which is what lets the final hop detect a
//! tampered payload by checking a block of zeros.
//!
//! The left half is [`HASH_SIZE`] bytes; the right half is the rest of the
//! block, so blocks must be strictly larger than [`HASH_SIZE`].

use aes::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{xor_in_place, CryptoError, Result, HASH_SIZE, SPRP_KEY_SIZE};

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// Lioness keyed with four independent round keys.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Lioness {
    k1: [u8; HASH_SIZE],
    k2: [u8; HASH_SIZE],
    k3: [u8; HASH_SIZE],
    k4: [u8; HASH_SIZE],
}

impl Lioness {
    /// Split a [`SPRP_KEY_SIZE`]-byte key into the four round keys.
    pub fn new(key: &[u8; SPRP_KEY_SIZE]) -> Self {
        let mut cipher = Self {
            k1: [0u8; HASH_SIZE],
            k2: [0u8; HASH_SIZE],
            k3: [0u8; HASH_SIZE],
            k4: [0u8; HASH_SIZE],
        };
        cipher.k1.copy_from_slice(&key[..HASH_SIZE]);
        cipher.k2.copy_from_slice(&key[HASH_SIZE..2 * HASH_SIZE]);
        cipher.k3.copy_from_slice(&key[2 * HASH_SIZE..3 * HASH_SIZE]);
        cipher.k4.copy_from_slice(&key[3 * HASH_SIZE..]);
        cipher
    }

    /// Encrypt `block` in place.
    pub fn encrypt(&self, block: &mut [u8]) -> Result<()> {
        check_block(block)?;
        let (left, right) = block.split_at_mut(HASH_SIZE);
        stream_round(&self.k1, left, right);
        hash_round(&self.k2, left, right)?;
        stream_round(&self.k3, left, right);
        hash_round(&self.k4, left, right)?;
        Ok(())
    }

    /// Decrypt `block` in place.
    pub fn decrypt(&self, block: &mut [u8]) -> Result<()> {
        check_block(block)?;
        let (left, right) = block.split_at_mut(HASH_SIZE);
        hash_round(&self.k4, left, right)?;
        stream_round(&self.k3, left, right);
        hash_round(&self.k2, left, right)?;
        stream_round(&self.k1, left, right);
        Ok(())
    }
}

fn check_block(block: &[u8]) -> Result<()> {
    if block.len() <= HASH_SIZE {
        return Err(CryptoError::InvalidBlockSize {
            minimum: HASH_SIZE,
            actual: block.len(),
        });
    }
    Ok(())
}

// R ^= S(L ^ K)
fn stream_round(key: &[u8; HASH_SIZE], left: &[u8], right: &mut [u8]) {
    let mut round_key = *key;
    xor_in_place(&mut round_key, left);
    let mut aes_key = [0u8; 16];
    let mut iv = [0u8; 16];
    aes_key.copy_from_slice(&round_key[..16]);
    iv.copy_from_slice(&round_key[16..]);
    let mut cipher = Aes128Ctr::new(&aes_key.into(), &iv.into());
    cipher.apply_keystream(right);
    round_key.zeroize();
    aes_key.zeroize();
}

// L ^= H_K(R)
fn hash_round(key: &[u8; HASH_SIZE], left: &mut [u8], right: &[u8]) -> Result<()> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| CryptoError::InvalidMacKey)?;
    mac.update(right);
    let digest = mac.finalize().into_bytes();
    xor_in_place(left, &digest);
    Ok(())
}
