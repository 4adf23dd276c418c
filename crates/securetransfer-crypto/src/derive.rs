/// Key agreement and per-message derivation.
///
/// Both regimes end in the same place: a 256-bit secret combined with the
/// message's public salt.
///   key = SHA-256(salt || secret)
///   iv  = derive_iv(secret, salt)
/// Pre-session messages use a fresh sealed secret per message, post-session
/// messages use SHA-256(client_entropy || server_entropy).

use sha2::{Digest, Sha256};

use crate::encrypt::IV_SIZE;

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Symmetric key for one message: SHA-256(salt || secret).
pub fn message_key(salt: &[u8; 32], secret: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(secret);
    hasher.finalize().into()
}

/// 16-byte IV for one message.
///
/// CRC-32 over (salt || secret), then for byte `i` the checksum shifted
/// right by `i` is XORed with `salt[i] + salt[i + 16]`. Peers depend on
/// this exact mixing; changing it breaks interoperability.
pub fn derive_iv(secret: &[u8; 32], salt: &[u8; 32]) -> [u8; IV_SIZE] {
    let mut crc = crc32fast::Hasher::new();
    crc.update(salt);
    crc.update(secret);
    let checksum = crc.finalize();

    let mut iv = [0u8; IV_SIZE];
    for (i, byte) in iv.iter_mut().enumerate() {
        let mixed = salt[i].wrapping_add(salt[i + IV_SIZE]);
        *byte = ((checksum >> i) & 0xff) as u8 ^ mixed;
    }
    iv
}

/// Session secret agreed by both sides from the exchanged entropy.
pub fn session_secret(client_entropy: &[u8], server_entropy: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(client_entropy);
    hasher.update(server_entropy);
    hasher.finalize().into()
}

/// Proof of nonce possession echoed back by the client.
pub fn nonce_proof(nonce: &[u8]) -> [u8; 32] {
    sha256(nonce)
}
