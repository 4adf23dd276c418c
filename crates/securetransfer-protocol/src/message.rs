/// Signed, encrypted message envelope.
///
/// ```text
/// [56]      Cleartext header (see `wire`)
/// [80]      Sealed secret, pre-session opcodes only
/// [4]       Ciphertext length (u32 BE)
/// [n]       AES-256-GCM(plaintext) + 16-byte tag
/// [64]      Ed25519 signature over SHA-256(header || plaintext)
/// ```
///
/// The plaintext is the payload fields followed by a reserved length
/// marker (i32, normally 0).

use bytes::{Buf, BufMut, BytesMut};
use securetransfer_crypto::{
    KeyPair, PublicKey, SEALED_SECRET_SIZE, SECRET_SIZE, SIGNATURE_SIZE, decrypt_payload,
    derive_iv, encrypt_payload, generate_secret, message_key, open_secret, seal_secret,
};
use securetransfer_types::{Opcode, TransferId};
use sha2::{Digest, Sha256};

use crate::error::{ProtocolError, Result};
use crate::wire::{HEADER_SIZE, MessageHeader};

/// How the per-message secret is obtained.
#[derive(Clone, Copy)]
pub enum MessageKey<'a> {
    /// Pre-session: fresh secret sealed to the recipient.
    SealedTo(&'a PublicKey),
    /// Post-session: the negotiated session secret.
    Session(&'a [u8; SECRET_SIZE]),
}

/// Builds one outbound message. Every field write feeds the running hash
/// that is signed in [`MessageWriter::finish`].
pub struct MessageWriter {
    header: MessageHeader,
    header_bytes: [u8; HEADER_SIZE],
    payload: BytesMut,
    hasher: Sha256,
    /// First length that did not fit the signed 32-bit wire field.
    oversized: Option<usize>,
}

impl MessageWriter {
    pub fn new(opcode: Opcode, transfer_id: TransferId) -> Self {
        let header = MessageHeader::new(opcode, transfer_id);
        let header_bytes = header.encode();
        let mut hasher = Sha256::new();
        hasher.update(header_bytes);
        Self {
            header,
            header_bytes,
            payload: BytesMut::new(),
            hasher,
            oversized: None,
        }
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn write_i32(&mut self, value: i32) -> &mut Self {
        self.put(&value.to_be_bytes())
    }

    pub fn write_i64(&mut self, value: i64) -> &mut Self {
        self.put(&value.to_be_bytes())
    }

    /// Length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) -> &mut Self {
        self.write_bytes(value.as_bytes())
    }

    /// Length-prefixed byte blob.
    pub fn write_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.write_length(value.len());
        self.put(value)
    }

    /// A size or count carried in an i32 field. Values past `i32::MAX` make
    /// [`MessageWriter::finish`] fail instead of wrapping negative.
    pub fn write_length(&mut self, value: usize) -> &mut Self {
        match i32::try_from(value) {
            Ok(value) => self.write_i32(value),
            Err(_) => {
                self.oversized.get_or_insert(value);
                self.write_i32(0)
            }
        }
    }

    fn put(&mut self, bytes: &[u8]) -> &mut Self {
        self.hasher.update(bytes);
        self.payload.put_slice(bytes);
        self
    }

    /// Append the reserved marker, sign, encrypt and frame the message.
    pub fn finish(mut self, sender: &KeyPair, key: MessageKey<'_>) -> Result<Vec<u8>> {
        let opcode = self.header.opcode;
        if let Some(length) = self.oversized {
            return Err(ProtocolError::data_format(format!(
                "length {length} does not fit a {opcode} field"
            )));
        }
        let (secret, sealed) = match key {
            MessageKey::SealedTo(recipient) if !opcode.requires_session_key() => {
                let secret = generate_secret();
                let sealed = seal_secret(recipient, &secret)
                    .map_err(|e| ProtocolError::data_format(format!("{e:#}")))?;
                (secret, Some(sealed))
            }
            MessageKey::Session(secret) if opcode.requires_session_key() => (*secret, None),
            _ => {
                return Err(ProtocolError::data_format(format!(
                    "wrong key regime for {opcode}"
                )));
            }
        };

        self.write_i32(0);
        let digest: [u8; 32] = self.hasher.finalize().into();
        let signature = sender.sign(&digest);

        let salt = &self.header.salt;
        let ciphertext = encrypt_payload(
            &message_key(salt, &secret),
            &derive_iv(&secret, salt),
            &self.header_bytes,
            &self.payload,
        )
        .map_err(|e| ProtocolError::data_format(format!("{e:#}")))?;

        let sealed_len = sealed.map_or(0, |s| s.len());
        let mut out = BytesMut::with_capacity(
            HEADER_SIZE + sealed_len + 4 + ciphertext.len() + SIGNATURE_SIZE,
        );
        out.put_slice(&self.header_bytes);
        if let Some(sealed) = sealed {
            out.put_slice(&sealed);
        }
        let ciphertext_len = u32::try_from(ciphertext.len())
            .map_err(|_| ProtocolError::data_format("message too large"))?;
        out.put_u32(ciphertext_len);
        out.put_slice(&ciphertext);
        out.put_slice(&signature);
        Ok(out.to_vec())
    }
}

/// Structurally parsed inbound message, not yet decrypted or trusted.
pub struct Envelope<'a> {
    header: MessageHeader,
    header_bytes: &'a [u8],
    sealed: Option<&'a [u8]>,
    ciphertext: &'a [u8],
    signature: &'a [u8],
}

impl<'a> Envelope<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let header = MessageHeader::decode(data)?;
        let (header_bytes, mut rest) = data.split_at(HEADER_SIZE);

        let sealed = if header.opcode.requires_session_key() {
            None
        } else {
            let (sealed, tail) = split(rest, SEALED_SECRET_SIZE)?;
            rest = tail;
            Some(sealed)
        };

        let (len, tail) = split(rest, 4)?;
        let len = (&len[..]).get_u32() as usize;
        if tail.len() != len + SIGNATURE_SIZE {
            return Err(ProtocolError::data_format(format!(
                "ciphertext length {} does not match message size",
                len
            )));
        }
        let (ciphertext, signature) = tail.split_at(len);

        Ok(Self {
            header,
            header_bytes,
            sealed,
            ciphertext,
            signature,
        })
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    /// Recover the secret and decrypt the payload. `session` must be the
    /// negotiated secret for post-session opcodes.
    pub fn open(self, own_keys: &KeyPair, session: Option<&[u8; SECRET_SIZE]>) -> Result<MessageReader> {
        let secret = match (self.sealed, session) {
            (Some(sealed), _) => open_secret(own_keys, sealed)
                .map_err(|e| ProtocolError::data_format(format!("{e:#}")))?,
            (None, Some(secret)) => *secret,
            (None, None) => {
                return Err(ProtocolError::data_format(format!(
                    "{} requires a session key",
                    self.header.opcode
                )));
            }
        };

        let salt = &self.header.salt;
        let plaintext = decrypt_payload(
            &message_key(salt, &secret),
            &derive_iv(&secret, salt),
            self.header_bytes,
            self.ciphertext,
        )
        .map_err(|e| ProtocolError::data_format(format!("{e:#}")))?;

        let mut hasher = Sha256::new();
        hasher.update(self.header_bytes);
        let mut signature = [0u8; SIGNATURE_SIZE];
        signature.copy_from_slice(self.signature);

        Ok(MessageReader {
            header: self.header,
            plaintext,
            pos: 0,
            hasher,
            signature,
        })
    }
}

fn split(data: &[u8], at: usize) -> Result<(&[u8], &[u8])> {
    if data.len() < at {
        return Err(ProtocolError::data_format("message truncated"));
    }
    Ok(data.split_at(at))
}

/// Decrypted payload reader. Fields read here are untrusted until
/// [`MessageReader::verify_signature`] succeeds; prefer
/// [`MessageReader::read_verified`], which only releases values after it.
pub struct MessageReader {
    header: MessageHeader,
    plaintext: Vec<u8>,
    pos: usize,
    hasher: Sha256,
    signature: [u8; SIGNATURE_SIZE],
}

impl MessageReader {
    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    fn take(&mut self, len: usize) -> Result<&[u8]> {
        if self.plaintext.len() - self.pos < len {
            return Err(ProtocolError::data_format("payload truncated"));
        }
        let bytes = &self.plaintext[self.pos..self.pos + len];
        self.hasher.update(bytes);
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let mut bytes = self.take(4)?;
        Ok(bytes.get_i32())
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let mut bytes = self.take(8)?;
        Ok(bytes.get_i64())
    }

    /// An i64 that must not be negative (offsets, lengths).
    pub fn read_u64(&mut self) -> Result<u64> {
        let value = self.read_i64()?;
        u64::try_from(value)
            .map_err(|_| ProtocolError::data_format(format!("negative value {value}")))
    }

    fn read_len(&mut self, max: usize) -> Result<usize> {
        let len = self.read_i32()?;
        let len = usize::try_from(len)
            .map_err(|_| ProtocolError::data_format(format!("negative length {len}")))?;
        if len > max {
            return Err(ProtocolError::data_format(format!(
                "field of {len} bytes exceeds cap of {max}"
            )));
        }
        Ok(len)
    }

    pub fn read_bytes(&mut self, max: usize) -> Result<Vec<u8>> {
        let len = self.read_len(max)?;
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_string(&mut self, max: usize) -> Result<String> {
        let bytes = self.read_bytes(max)?;
        String::from_utf8(bytes).map_err(|_| ProtocolError::data_format("string is not UTF-8"))
    }

    /// A length-prefixed blob that must be exactly `N` bytes.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        bytes.try_into().map_err(|b: Vec<u8>| {
            ProtocolError::data_format(format!("expected {N} bytes, got {}", b.len()))
        })
    }

    /// Consume the reserved marker, require the payload to be fully read and
    /// check the signature against the sender's key.
    pub fn verify_signature(mut self, peer: &PublicKey) -> Result<()> {
        let reserved = self.read_len(self.plaintext.len())?;
        self.take(reserved)?;
        if self.pos != self.plaintext.len() {
            return Err(ProtocolError::data_format(format!(
                "{} unread payload bytes",
                self.plaintext.len() - self.pos
            )));
        }
        let digest: [u8; 32] = self.hasher.finalize().into();
        peer.verify(&digest, &self.signature)
            .map_err(|_| ProtocolError::Signature)
    }

    /// Read every field with `read`, then verify. The values are only
    /// returned once the signature checks out.
    pub fn read_verified<T>(
        mut self,
        peer: &PublicKey,
        read: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let value = read(&mut self)?;
        self.verify_signature(peer)?;
        Ok(value)
    }
}
