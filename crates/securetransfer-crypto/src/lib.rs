/// SecureTransfer crypto library.
///
/// The primitives the protocol engine consumes:
/// - Ed25519 identity signatures over each message's running hash
/// - X25519 sealing of a fresh 256-bit secret for pre-session messages
/// - AES-256-GCM payload encryption with a 16-byte IV
/// - SHA-256 / CRC-32 based key, IV and session-secret derivation

pub mod derive;
pub mod encrypt;
pub mod keys;

pub use derive::{derive_iv, message_key, nonce_proof, session_secret, sha256};
pub use encrypt::{
    IV_SIZE, SEALED_SECRET_SIZE, TAG_SIZE, decrypt_payload, encrypt_payload, open_secret,
    seal_secret,
};
pub use keys::{
    KeyPair, PUBLIC_KEY_SIZE, PublicKey, SECRET_SIZE, SIGNATURE_SIZE, generate_secret,
    random_bytes, random_vec,
};
