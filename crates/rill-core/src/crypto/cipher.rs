//! AES-128-CBC blob encryption.
//!
//! Blob ciphertexts are bare CBC with PKCS#7 padding: no framing, no MAC, no
//! length prefix. Integrity comes from the content address (the ciphertext
//! digest), not from the cipher, so the decrypt path only ever sees bytes
//! that already matched their blob hash.

use aes::Aes128;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use thiserror::Error;

/// AES block width in bytes. IVs and ciphertext lengths both align to it.
pub const AES_BLOCK_SIZE: usize = 16;

/// AES-128 stream key width in bytes.
pub const KEY_SIZE: usize = 16;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

#[derive(Error, Debug)]
pub enum CipherError {
    /// The ciphertext is not a whole number of AES blocks, or its final block
    /// does not end in valid PKCS#7 padding.
    #[error("ciphertext has invalid PKCS#7 padding")]
    InvalidPadding,
}

/// Encrypt one plaintext chunk under (`key`, `iv`).
///
/// The output is PKCS#7-padded, so its length is the smallest multiple of
/// [`AES_BLOCK_SIZE`] strictly greater than `plaintext.len()` — a full block
/// of padding for already-aligned input, and never zero.
#[must_use]
pub fn encrypt_blob(key: &[u8; KEY_SIZE], iv: &[u8; AES_BLOCK_SIZE], plaintext: &[u8]) -> Vec<u8> {
    Aes128CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// Decrypt one blob ciphertext and strip its padding.
pub fn decrypt_blob(
    key: &[u8; KEY_SIZE],
    iv: &[u8; AES_BLOCK_SIZE],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CipherError> {
    Aes128CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CipherError::InvalidPadding)
}
