//! AES-128-CBC with PKCS#7 padding for file contents.
//!
//! Unauthenticated: a modified ciphertext is only detected when it breaks
//! the padding. Kept for compatibility with existing envelopes.

use aes::Aes128;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

pub const KEY_LEN: usize = 16;
pub const BLOCK_LEN: usize = 16;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CipherError {
    #[error("key must be {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("IV must be {BLOCK_LEN} bytes, got {0}")]
    InvalidIvLength(usize),
    #[error("ciphertext length {0} is not a positive multiple of {BLOCK_LEN}")]
    Misaligned(usize),
    #[error("bad padding, wrong key or corrupted ciphertext")]
    Padding,
    #[error("entropy source unavailable: {0}")]
    Entropy(String),
}

pub type Result<T, E = CipherError> = core::result::Result<T, E>;

fn check_lengths(key: &[u8], iv: &[u8]) -> Result<()> {
    if key.len() != KEY_LEN {
        return Err(CipherError::InvalidKeyLength(key.len()));
    }
    if iv.len() != BLOCK_LEN {
        return Err(CipherError::InvalidIvLength(iv.len()));
    }
    Ok(())
}

/// Encrypts under a fresh random IV; returns `(ciphertext, iv)`.
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut iv = vec![0u8; BLOCK_LEN];
    OsRng
        .try_fill_bytes(&mut iv)
        .map_err(|e| CipherError::Entropy(e.to_string()))?;
    let ciphertext = encrypt_with_iv(key, &iv, plaintext)?;
    Ok((ciphertext, iv))
}

pub fn encrypt_with_iv(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    check_lengths(key, iv)?;
    let encryptor = Aes128CbcEnc::new_from_slices(key, iv)
        .map_err(|_| CipherError::InvalidKeyLength(key.len()))?;
    Ok(encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

pub fn decrypt(key: &[u8], ciphertext: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
    check_lengths(key, iv)?;
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
        return Err(CipherError::Misaligned(ciphertext.len()));
    }
    let decryptor = Aes128CbcDec::new_from_slices(key, iv)
        .map_err(|_| CipherError::InvalidKeyLength(key.len()))?;
    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CipherError::Padding)
}
