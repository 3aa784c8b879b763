//! Per-peer stream cipher session: nonce-prefixed ChaCha20 frames with
//! monotonic anti-replay counters. There is no authentication tag; integrity
//! relies on the outer frame header and the counter check.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::identity::KEY_SIZE;

/// Nonce layout: 8 random IV bytes followed by a 4-byte little-endian counter.
pub const NONCE_SIZE: usize = 12;
const IV_SIZE: usize = 8;

/// Decrypt rejection reasons. Rejected frames leave the session untouched.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("frame shorter than nonce")]
    TooShort,
    #[error("frame counter not beyond the replay watermark")]
    Replay,
    #[error("encrypt counter exhausted, session must be rekeyed")]
    CounterExhausted,
}

/// Symmetric session state for one peer.
///
/// `encrypt_counter` is pre-incremented, so the first frame carries counter 1.
/// `decrypt_counter` only ever moves forward: a received counter must be
/// strictly greater than the watermark, which drops replays and anything
/// arriving out of order behind a frame already accepted.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct CipherSession {
    key: [u8; KEY_SIZE],
    encrypt_counter: u32,
    decrypt_counter: u32,
}

impl CipherSession {
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self {
            key,
            encrypt_counter: 0,
            decrypt_counter: 0,
        }
    }

    /// Install a new key and reset both counters.
    pub fn set_key(&mut self, key: [u8; KEY_SIZE]) {
        self.key = key;
        self.encrypt_counter = 0;
        self.decrypt_counter = 0;
    }

    pub fn encrypt_counter(&self) -> u32 {
        self.encrypt_counter
    }

    pub fn decrypt_counter(&self) -> u32 {
        self.decrypt_counter
    }

    /// Encrypt `plaintext` into `nonce || ciphertext`.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        if self.encrypt_counter == u32::MAX {
            return Err(CipherError::CounterExhausted);
        }
        self.encrypt_counter += 1;

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce[..IV_SIZE]);
        nonce[IV_SIZE..].copy_from_slice(&self.encrypt_counter.to_le_bytes());

        let mut out = Vec::with_capacity(NONCE_SIZE + plaintext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(plaintext);
        apply_keystream(&self.key, &nonce, &mut out[NONCE_SIZE..]);
        Ok(out)
    }

    /// Decrypt a `nonce || ciphertext` frame, advancing the replay watermark.
    pub fn decrypt(&mut self, frame: &[u8]) -> Result<Vec<u8>, CipherError> {
        if frame.len() < NONCE_SIZE {
            return Err(CipherError::TooShort);
        }
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&frame[..NONCE_SIZE]);
        let counter = u32::from_le_bytes([nonce[8], nonce[9], nonce[10], nonce[11]]);
        if counter <= self.decrypt_counter {
            return Err(CipherError::Replay);
        }
        self.decrypt_counter = counter;

        let mut out = frame[NONCE_SIZE..].to_vec();
        apply_keystream(&self.key, &nonce, &mut out);
        Ok(out)
    }
}

fn apply_keystream(key: &[u8; KEY_SIZE], nonce: &[u8; NONCE_SIZE], data: &mut [u8]) {
    let mut cipher = ChaCha20::new(key.into(), nonce.into());
    cipher.apply_keystream(data);
}
