use aes_gcm::aead::OsRng;
use aes_gcm::aead::rand_core::RngCore;
use anyhow::{Result, anyhow};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use x25519_dalek::{PublicKey as SealingPublic, StaticSecret};

/// Size of every symmetric secret, nonce, salt and entropy value.
pub const SECRET_SIZE: usize = 32;

/// Encoded size of a [`PublicKey`]: verifying key + X25519 public key.
pub const PUBLIC_KEY_SIZE: usize = 64;

/// Size of an Ed25519 signature.
pub const SIGNATURE_SIZE: usize = 64;

/// Fill a fixed-size array from the OS RNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Random bytes of a runtime-chosen length (nonces, entropy).
pub fn random_vec(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Generate a random 256-bit secret.
pub fn generate_secret() -> [u8; SECRET_SIZE] {
    random_bytes()
}

/// Long-lived identity of one endpoint.
///
/// Holds an Ed25519 key for signing outbound messages and an X25519 key
/// for opening secrets sealed to this endpoint.
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
    sealing: StaticSecret,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_secret_bytes(&random_bytes::<64>())
    }

    /// Rebuild from the 64-byte encoding produced by [`KeyPair::to_secret_bytes`].
    pub fn from_secret_bytes(bytes: &[u8; 64]) -> Self {
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&bytes[..32]);
        let mut sealing = [0u8; 32];
        sealing.copy_from_slice(&bytes[32..]);
        Self {
            signing: SigningKey::from_bytes(&seed),
            sealing: StaticSecret::from(sealing),
        }
    }

    pub fn to_secret_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.signing.to_bytes());
        out[32..].copy_from_slice(self.sealing.as_bytes());
        out
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            verifying: self.signing.verifying_key(),
            sealing: SealingPublic::from(&self.sealing),
        }
    }

    /// Sign a message digest.
    pub fn sign(&self, digest: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing.sign(digest).to_bytes()
    }

    pub(crate) fn sealing_secret(&self) -> &StaticSecret {
        &self.sealing
    }

    /// Encode the secret key material to base64 for config files.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_secret_bytes())
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = BASE64.decode(encoded.trim())?;
        let bytes: [u8; 64] = bytes
            .try_into()
            .map_err(|_| anyhow!("Invalid key pair length"))?;
        Ok(Self::from_secret_bytes(&bytes))
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Public half of a [`KeyPair`], distributed to the peer out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKey {
    verifying: VerifyingKey,
    sealing: SealingPublic,
}

impl PublicKey {
    /// Verify a signature over a message digest.
    pub fn verify(&self, digest: &[u8], signature: &[u8]) -> Result<()> {
        let signature = Signature::from_slice(signature)
            .map_err(|e| anyhow!("Malformed signature: {}", e))?;
        self.verifying
            .verify_strict(digest, &signature)
            .map_err(|e| anyhow!("Signature verification failed: {}", e))
    }

    pub(crate) fn sealing_key(&self) -> &SealingPublic {
        &self.sealing
    }

    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        let mut out = [0u8; PUBLIC_KEY_SIZE];
        out[..32].copy_from_slice(self.verifying.as_bytes());
        out[32..].copy_from_slice(self.sealing.as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PUBLIC_KEY_SIZE {
            return Err(anyhow!("Invalid public key length: {}", bytes.len()));
        }
        let mut verifying = [0u8; 32];
        verifying.copy_from_slice(&bytes[..32]);
        let mut sealing = [0u8; 32];
        sealing.copy_from_slice(&bytes[32..]);
        Ok(Self {
            verifying: VerifyingKey::from_bytes(&verifying)
                .map_err(|e| anyhow!("Invalid verifying key: {}", e))?,
            sealing: SealingPublic::from(sealing),
        })
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        Self::from_bytes(&BASE64.decode(encoded.trim())?)
    }
}
