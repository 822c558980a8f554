//! Fixed-key block cipher for the encrypted monitor family
//!
//! The family encrypts every frame with AES-128-CBC under a key baked into
//! the firmware and a zero IV. Traffic is always a whole number of 16-byte
//! blocks and every frame is its own cipher stream, so blocks are coded
//! independently here. (With a zero IV and single-block frames this is
//! indistinguishable from ECB, which reconciles the conflicting captures.)

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::error::ProtocolError;

type FrameEncryptor = cbc::Encryptor<aes::Aes128>;
type FrameDecryptor = cbc::Decryptor<aes::Aes128>;

/// Cipher block length; all frames are multiples of this
pub const BLOCK_LEN: usize = 16;

// Vendor name plus BOM-style sentinels plus numeric suffix, 16 bytes
const FAMILY_KEY: [u8; BLOCK_LEN] = *b"leagend\xff\xfe1882466";
const ZERO_IV: [u8; BLOCK_LEN] = [0u8; BLOCK_LEN];

fn check_block_multiple(data: &[u8]) -> Result<(), ProtocolError> {
    if data.is_empty() || data.len() % BLOCK_LEN != 0 {
        return Err(ProtocolError::Framing(format!(
            "frame length {} is not a positive multiple of {BLOCK_LEN}",
            data.len()
        )));
    }
    Ok(())
}

/// Encrypt a frame of one or more 16-byte blocks
pub fn encrypt(plaintext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    check_block_multiple(plaintext)?;
    let mut out = Vec::with_capacity(plaintext.len());
    for block in plaintext.chunks(BLOCK_LEN) {
        let ciphertext = FrameEncryptor::new(&FAMILY_KEY.into(), &ZERO_IV.into())
            .encrypt_padded_vec_mut::<NoPadding>(block);
        out.extend_from_slice(&ciphertext);
    }
    Ok(out)
}

/// Decrypt a frame of one or more 16-byte blocks
pub fn decrypt(ciphertext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    check_block_multiple(ciphertext)?;
    let mut out = Vec::with_capacity(ciphertext.len());
    for block in ciphertext.chunks(BLOCK_LEN) {
        let plaintext = FrameDecryptor::new(&FAMILY_KEY.into(), &ZERO_IV.into())
            .decrypt_padded_vec_mut::<NoPadding>(block)
            .map_err(|_| ProtocolError::Framing("block decryption failed".into()))?;
        out.extend_from_slice(&plaintext);
    }
    Ok(out)
}
