/// Cleartext message header.
///
/// ```text
/// [0..4]    Version (i32 BE)
/// [4..8]    Opcode (i32 BE)
/// [8..24]   Transfer ID (16 bytes)
/// [24..56]  Salt (32 random bytes)
/// ```
///
/// The header is never encrypted so the receiver can look up session state
/// before it has a key. It is bound to the payload as AEAD associated data
/// and is the first input to the signed hash.

use bytes::{Buf, BufMut};
use securetransfer_crypto::{SECRET_SIZE, random_bytes};
use securetransfer_types::{Opcode, PROTOCOL_VERSION, TransferId};

use crate::error::{ProtocolError, Result};

/// Header size in bytes.
pub const HEADER_SIZE: usize = 4 + 4 + 16 + SECRET_SIZE;

/// Parsed cleartext header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub opcode: Opcode,
    pub transfer_id: TransferId,
    pub salt: [u8; SECRET_SIZE],
}

impl MessageHeader {
    /// Header for a new outbound message with a fresh random salt.
    pub fn new(opcode: Opcode, transfer_id: TransferId) -> Self {
        Self {
            opcode,
            transfer_id,
            salt: random_bytes(),
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        let mut buf = &mut out[..];
        buf.put_i32(PROTOCOL_VERSION);
        buf.put_i32(self.opcode.as_i32());
        buf.put_slice(self.transfer_id.as_bytes());
        buf.put_slice(&self.salt);
        out
    }

    /// Decode and validate the header at the start of `data`.
    ///
    /// The version must match exactly and the opcode must be known.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::data_format(format!(
                "message too short for header: {} bytes",
                data.len()
            )));
        }
        let mut buf = &data[..HEADER_SIZE];
        let version = buf.get_i32();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::data_format(format!(
                "unsupported version {version}"
            )));
        }
        let opcode = Opcode::try_from(buf.get_i32())?;
        let mut id = [0u8; 16];
        buf.copy_to_slice(&mut id);
        let mut salt = [0u8; SECRET_SIZE];
        buf.copy_to_slice(&mut salt);

        Ok(Self {
            opcode,
            transfer_id: TransferId::from_bytes(id),
            salt,
        })
    }
}

/// An empty or all-zero buffer means "nothing to send".
pub fn is_noop(data: &[u8]) -> bool {
    data.iter().all(|b| *b == 0)
}

/// Read the header of a message without authenticating it, or `None` for
/// the no-op sentinel.
pub fn peek(data: &[u8]) -> Result<Option<MessageHeader>> {
    if is_noop(data) {
        return Ok(None);
    }
    MessageHeader::decode(data).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let id = TransferId::new();
        let header = MessageHeader::new(Opcode::SendBytesRequest, id);
        let bytes = header.encode();

        assert_eq!(&bytes[0..4], &1i32.to_be_bytes());
        assert_eq!(&bytes[4..8], &18i32.to_be_bytes());
        assert_eq!(&bytes[8..24], id.as_bytes());
        assert_eq!(&bytes[24..56], &header.salt);
        assert_eq!(MessageHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn rejects_bad_version_and_opcode() {
        let mut bytes = MessageHeader::new(Opcode::NonceRequest, TransferId::new()).encode();
        bytes[3] = 2;
        assert!(matches!(
            MessageHeader::decode(&bytes),
            Err(ProtocolError::DataFormat(_))
        ));

        let mut bytes = MessageHeader::new(Opcode::NonceRequest, TransferId::new()).encode();
        bytes[7] = 9;
        assert!(matches!(
            MessageHeader::decode(&bytes),
            Err(ProtocolError::DataFormat(_))
        ));

        assert!(MessageHeader::decode(&bytes[..20]).is_err());
    }

    #[test]
    fn noop_sentinel() {
        assert!(peek(&[]).unwrap().is_none());
        assert!(peek(&[0u8; 300]).unwrap().is_none());
        let bytes = MessageHeader::new(Opcode::NonceRequest, TransferId::new()).encode();
        assert_eq!(peek(&bytes).unwrap().unwrap().opcode, Opcode::NonceRequest);
    }
}
