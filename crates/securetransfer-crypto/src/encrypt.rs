use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::aes::Aes256;
use aes_gcm::{Aes256Gcm, AesGcm, Nonce};
use anyhow::{Result, anyhow};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as SealingPublic, StaticSecret};

use crate::keys::{KeyPair, PublicKey, SECRET_SIZE, random_bytes};

/// AES-256-GCM keyed with a 16-byte IV instead of the usual 12.
type PayloadCipher = AesGcm<Aes256, U16>;

pub const IV_SIZE: usize = 16;
pub const TAG_SIZE: usize = 16;

/// Ephemeral X25519 public key + sealed secret + GCM tag.
pub const SEALED_SECRET_SIZE: usize = 32 + SECRET_SIZE + TAG_SIZE;

/// Encrypt a message payload. `aad` binds the ciphertext to the cleartext
/// header. Returns ciphertext with the tag appended.
pub fn encrypt_payload(
    key: &[u8; 32],
    iv: &[u8; IV_SIZE],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let cipher = PayloadCipher::new_from_slice(key)
        .map_err(|e| anyhow!("Cipher init failed: {}", e))?;
    cipher
        .encrypt(Nonce::<U16>::from_slice(iv), Payload { msg: plaintext, aad })
        .map_err(|e| anyhow!("Encryption failed: {}", e))
}

/// Decrypt a message payload produced by [`encrypt_payload`].
pub fn decrypt_payload(
    key: &[u8; 32],
    iv: &[u8; IV_SIZE],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    if ciphertext.len() < TAG_SIZE {
        return Err(anyhow!("Ciphertext too short"));
    }
    let cipher = PayloadCipher::new_from_slice(key)
        .map_err(|e| anyhow!("Cipher init failed: {}", e))?;
    cipher
        .decrypt(Nonce::<U16>::from_slice(iv), Payload { msg: ciphertext, aad })
        .map_err(|e| anyhow!("Decryption failed: {}", e))
}

/// Seal a 256-bit secret so only the holder of `recipient`'s key pair can
/// open it.
///
/// Output: `[ephemeral public (32)][AES-256-GCM(secret) (48)]`. The wrap
/// key is single-use, so the GCM nonce is fixed at zero.
pub fn seal_secret(
    recipient: &PublicKey,
    secret: &[u8; SECRET_SIZE],
) -> Result<[u8; SEALED_SECRET_SIZE]> {
    let ephemeral = StaticSecret::from(random_bytes::<32>());
    let ephemeral_public = SealingPublic::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient.sealing_key());
    let wrap_key = wrap_key(shared.as_bytes(), &ephemeral_public, recipient.sealing_key());

    let cipher = Aes256Gcm::new_from_slice(&wrap_key)
        .map_err(|e| anyhow!("Cipher init failed: {}", e))?;
    let sealed = cipher
        .encrypt(Nonce::from_slice(&[0u8; 12]), &secret[..])
        .map_err(|e| anyhow!("Sealing failed: {}", e))?;

    let mut out = [0u8; SEALED_SECRET_SIZE];
    out[..32].copy_from_slice(ephemeral_public.as_bytes());
    out[32..].copy_from_slice(&sealed);
    Ok(out)
}

/// Open a secret sealed with [`seal_secret`] to `keys`.
pub fn open_secret(keys: &KeyPair, sealed: &[u8]) -> Result<[u8; SECRET_SIZE]> {
    if sealed.len() != SEALED_SECRET_SIZE {
        return Err(anyhow!("Sealed secret has wrong length: {}", sealed.len()));
    }
    let mut ephemeral = [0u8; 32];
    ephemeral.copy_from_slice(&sealed[..32]);
    let ephemeral_public = SealingPublic::from(ephemeral);
    let own_public = SealingPublic::from(keys.sealing_secret());
    let shared = keys.sealing_secret().diffie_hellman(&ephemeral_public);
    let wrap_key = wrap_key(shared.as_bytes(), &ephemeral_public, &own_public);

    let cipher = Aes256Gcm::new_from_slice(&wrap_key)
        .map_err(|e| anyhow!("Cipher init failed: {}", e))?;
    let secret = cipher
        .decrypt(Nonce::from_slice(&[0u8; 12]), &sealed[32..])
        .map_err(|e| anyhow!("Opening sealed secret failed: {}", e))?;

    secret
        .try_into()
        .map_err(|_| anyhow!("Sealed secret has wrong size"))
}

fn wrap_key(shared: &[u8; 32], ephemeral: &SealingPublic, recipient: &SealingPublic) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(shared);
    hasher.update(ephemeral.as_bytes());
    hasher.update(recipient.as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_secret;

    #[test]
    fn payload_roundtrip() {
        let key = generate_secret();
        let iv = random_bytes::<IV_SIZE>();
        let message = b"chunk of file content";

        let ciphertext = encrypt_payload(&key, &iv, b"header", message).unwrap();
        assert_eq!(ciphertext.len(), message.len() + TAG_SIZE);
        assert_ne!(&ciphertext[..message.len()], message);

        let decrypted = decrypt_payload(&key, &iv, b"header", &ciphertext).unwrap();
        assert_eq!(decrypted, message);
    }

    #[test]
    fn wrong_key_or_header_fails() {
        let key = generate_secret();
        let iv = random_bytes::<IV_SIZE>();
        let ciphertext = encrypt_payload(&key, &iv, b"header", b"secret").unwrap();

        assert!(decrypt_payload(&generate_secret(), &iv, b"header", &ciphertext).is_err());
        assert!(decrypt_payload(&key, &iv, b"HEADER", &ciphertext).is_err());
        assert!(decrypt_payload(&key, &iv, b"header", &ciphertext[..4]).is_err());
    }

    #[test]
    fn empty_payload() {
        let key = generate_secret();
        let iv = random_bytes::<IV_SIZE>();
        let ciphertext = encrypt_payload(&key, &iv, &[], b"").unwrap();
        assert_eq!(ciphertext.len(), TAG_SIZE);
        assert!(decrypt_payload(&key, &iv, &[], &ciphertext).unwrap().is_empty());
    }

    #[test]
    fn sealed_secret_opens_for_recipient_only() {
        let server = KeyPair::generate();
        let other = KeyPair::generate();
        let secret = generate_secret();

        let sealed = seal_secret(&server.public_key(), &secret).unwrap();
        assert_eq!(open_secret(&server, &sealed).unwrap(), secret);
        assert!(open_secret(&other, &sealed).is_err());
    }

    #[test]
    fn tampered_seal_fails() {
        let server = KeyPair::generate();
        let mut sealed = seal_secret(&server.public_key(), &generate_secret()).unwrap();
        sealed[40] ^= 0xFF;
        assert!(open_secret(&server, &sealed).is_err());
        assert!(open_secret(&server, &sealed[..10]).is_err());
    }

    #[test]
    fn sealing_is_randomized() {
        let server = KeyPair::generate();
        let secret = generate_secret();
        let a = seal_secret(&server.public_key(), &secret).unwrap();
        let b = seal_secret(&server.public_key(), &secret).unwrap();
        assert_ne!(a, b);
    }
}
