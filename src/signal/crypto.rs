/**
 * signal/crypto.rs
 *
 * End-to-end sealing of signaling payloads between two WireGuard keys
 */

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};

use crate::error::SignalError;
use crate::keys::{Key, PublicKey};

const NONCE_LEN: usize = 12;
const KEY_CONTEXT: &str = "meshtun 2024-05 signal payload";

/// Both sides derive the same key from their X25519 agreement
fn payload_key(local: &Key, remote: &PublicKey) -> [u8; 32] {
    let shared = local.diffie_hellman(remote);
    blake3::derive_key(KEY_CONTEXT, shared.as_bytes())
}

/// Encrypt `plaintext` for `remote`; output is nonce || ciphertext
pub fn seal(plaintext: &[u8], local: &Key, remote: &PublicKey) -> Result<Vec<u8>, SignalError> {
    let cipher =
        Aes256Gcm::new_from_slice(&payload_key(local, remote)).map_err(|_| SignalError::Seal)?;
    let nonce: [u8; NONCE_LEN] = rand::random();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| SignalError::Seal)?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypt a payload sealed by `remote` for us
pub fn open(sealed: &[u8], local: &Key, remote: &PublicKey) -> Result<Vec<u8>, SignalError> {
    if sealed.len() < NONCE_LEN {
        return Err(SignalError::Open);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher =
        Aes256Gcm::new_from_slice(&payload_key(local, remote)).map_err(|_| SignalError::Open)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| SignalError::Open)
}
