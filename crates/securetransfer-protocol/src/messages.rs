//! The seven request kinds and their responses as typed values.

use securetransfer_crypto::{KeyPair, PublicKey, SECRET_SIZE};
use securetransfer_types::{Opcode, TransferId};

use crate::error::{ProtocolError, Result};
use crate::message::{Envelope, MessageKey, MessageReader, MessageWriter};

/// Upper bound for nonce and entropy fields.
pub const MAX_KEY_MATERIAL: usize = 1024;

/// Size caps applied while reading variable-length fields.
#[derive(Debug, Clone, Copy)]
pub struct FieldLimits {
    pub max_location_len: usize,
    pub max_chunk: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Nonce,
    Upload {
        nonce_proof: [u8; 32],
        client_entropy: Vec<u8>,
        location: String,
        total_length: u64,
    },
    Download {
        nonce_proof: [u8; 32],
        client_entropy: Vec<u8>,
        location: String,
    },
    SendBytes {
        offset: u64,
        bytes: Vec<u8>,
    },
    UploadComplete {
        location: String,
        content_hash: [u8; 32],
    },
    DownloadBytes {
        offset: u64,
        length: u32,
    },
    DownloadComplete {
        location: String,
    },
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Nonce => Opcode::NonceRequest,
            Self::Upload { .. } => Opcode::UploadRequest,
            Self::Download { .. } => Opcode::DownloadRequest,
            Self::SendBytes { .. } => Opcode::SendBytesRequest,
            Self::UploadComplete { .. } => Opcode::UploadCompleteRequest,
            Self::DownloadBytes { .. } => Opcode::DownloadBytesRequest,
            Self::DownloadComplete { .. } => Opcode::DownloadCompleteRequest,
        }
    }

    pub fn encode(&self, id: TransferId, sender: &KeyPair, key: MessageKey<'_>) -> Result<Vec<u8>> {
        let mut w = MessageWriter::new(self.opcode(), id);
        match self {
            Self::Nonce => {}
            Self::Upload { nonce_proof, client_entropy, location, total_length } => {
                w.write_bytes(nonce_proof)
                    .write_bytes(client_entropy)
                    .write_string(location)
                    .write_i64(to_wire(*total_length)?);
            }
            Self::Download { nonce_proof, client_entropy, location } => {
                w.write_bytes(nonce_proof)
                    .write_bytes(client_entropy)
                    .write_string(location);
            }
            Self::SendBytes { offset, bytes } => {
                w.write_i64(to_wire(*offset)?).write_bytes(bytes);
            }
            Self::UploadComplete { location, content_hash } => {
                w.write_string(location).write_bytes(content_hash);
            }
            Self::DownloadBytes { offset, length } => {
                w.write_i64(to_wire(*offset)?).write_length(*length as usize);
            }
            Self::DownloadComplete { location } => {
                w.write_string(location);
            }
        }
        w.finish(sender, key)
    }

    /// Read the payload of a request whose header carried `opcode`.
    pub fn read(opcode: Opcode, r: &mut MessageReader, limits: &FieldLimits) -> Result<Self> {
        Ok(match opcode {
            Opcode::NonceRequest => Self::Nonce,
            Opcode::UploadRequest => Self::Upload {
                nonce_proof: r.read_array()?,
                client_entropy: r.read_bytes(MAX_KEY_MATERIAL)?,
                location: r.read_string(limits.max_location_len)?,
                total_length: r.read_u64()?,
            },
            Opcode::DownloadRequest => Self::Download {
                nonce_proof: r.read_array()?,
                client_entropy: r.read_bytes(MAX_KEY_MATERIAL)?,
                location: r.read_string(limits.max_location_len)?,
            },
            Opcode::SendBytesRequest => Self::SendBytes {
                offset: r.read_u64()?,
                bytes: r.read_bytes(limits.max_chunk)?,
            },
            Opcode::UploadCompleteRequest => Self::UploadComplete {
                location: r.read_string(limits.max_location_len)?,
                content_hash: r.read_array()?,
            },
            Opcode::DownloadBytesRequest => {
                let offset = r.read_u64()?;
                let length = r.read_i32()?;
                Self::DownloadBytes {
                    offset,
                    length: u32::try_from(length).map_err(|_| {
                        ProtocolError::data_format(format!("negative read length {length}"))
                    })?,
                }
            }
            Opcode::DownloadCompleteRequest => Self::DownloadComplete {
                location: r.read_string(limits.max_location_len)?,
            },
            other => {
                return Err(ProtocolError::data_format(format!("{other} is not a request")));
            }
        })
    }
}

/// How a download response carries the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadBody {
    /// Entire content, no further round-trips.
    Inline(Vec<u8>),
    /// Client must fetch chunks of at most `max_chunk` bytes.
    Chunked { max_chunk: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Nonce {
        nonce: Vec<u8>,
        server_entropy: Vec<u8>,
    },
    Upload {
        max_chunk: u32,
    },
    Download {
        total_length: u64,
        body: DownloadBody,
    },
    SendBytes {
        offset: u64,
    },
    UploadComplete,
    DownloadBytes {
        offset: u64,
        bytes: Vec<u8>,
    },
    DownloadComplete,
}

impl Response {
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Nonce { .. } => Opcode::NonceResponse,
            Self::Upload { .. } => Opcode::UploadResponse,
            Self::Download { .. } => Opcode::DownloadResponse,
            Self::SendBytes { .. } => Opcode::SendBytesResponse,
            Self::UploadComplete => Opcode::UploadCompleteResponse,
            Self::DownloadBytes { .. } => Opcode::DownloadBytesResponse,
            Self::DownloadComplete => Opcode::DownloadCompleteResponse,
        }
    }

    pub fn encode(&self, id: TransferId, sender: &KeyPair, key: MessageKey<'_>) -> Result<Vec<u8>> {
        let mut w = MessageWriter::new(self.opcode(), id);
        match self {
            Self::Nonce { nonce, server_entropy } => {
                w.write_bytes(nonce).write_bytes(server_entropy);
            }
            Self::Upload { max_chunk } => {
                w.write_length(*max_chunk as usize);
            }
            Self::Download { total_length, body } => {
                w.write_i64(to_wire(*total_length)?);
                match body {
                    DownloadBody::Inline(bytes) => {
                        w.write_i32(1).write_bytes(bytes);
                    }
                    DownloadBody::Chunked { max_chunk } => {
                        w.write_i32(0).write_length(*max_chunk as usize);
                    }
                }
            }
            Self::SendBytes { offset } => {
                w.write_i64(to_wire(*offset)?);
            }
            Self::DownloadBytes { offset, bytes } => {
                w.write_i64(to_wire(*offset)?).write_bytes(bytes);
            }
            Self::UploadComplete | Self::DownloadComplete => {}
        }
        w.finish(sender, key)
    }

    pub fn read(opcode: Opcode, r: &mut MessageReader, limits: &FieldLimits) -> Result<Self> {
        Ok(match opcode {
            Opcode::NonceResponse => Self::Nonce {
                nonce: r.read_bytes(MAX_KEY_MATERIAL)?,
                server_entropy: r.read_bytes(MAX_KEY_MATERIAL)?,
            },
            Opcode::UploadResponse => Self::Upload {
                max_chunk: read_chunk_size(r)?,
            },
            Opcode::DownloadResponse => {
                let total_length = r.read_u64()?;
                let body = match r.read_i32()? {
                    1 => DownloadBody::Inline(r.read_bytes(limits.max_chunk)?),
                    0 => DownloadBody::Chunked {
                        max_chunk: read_chunk_size(r)?,
                    },
                    flag => {
                        return Err(ProtocolError::data_format(format!(
                            "unknown download body flag {flag}"
                        )));
                    }
                };
                Self::Download { total_length, body }
            }
            Opcode::SendBytesResponse => Self::SendBytes {
                offset: r.read_u64()?,
            },
            Opcode::UploadCompleteResponse => Self::UploadComplete,
            Opcode::DownloadBytesResponse => Self::DownloadBytes {
                offset: r.read_u64()?,
                bytes: r.read_bytes(limits.max_chunk)?,
            },
            Opcode::DownloadCompleteResponse => Self::DownloadComplete,
            other => {
                return Err(ProtocolError::data_format(format!("{other} is not a response")));
            }
        })
    }

    /// Parse, decrypt and verify the server's answer to a request.
    ///
    /// The reply must carry `expected` and the request's transfer id.
    /// `session` is only consulted for post-session opcodes.
    pub fn open(
        data: &[u8],
        expected: Opcode,
        id: TransferId,
        own_keys: &KeyPair,
        server_key: &PublicKey,
        session: Option<&[u8; SECRET_SIZE]>,
        limits: &FieldLimits,
    ) -> Result<Self> {
        if data.is_empty() {
            return Err(ProtocolError::data_format("empty response"));
        }
        let envelope = Envelope::parse(data)?;
        let header = envelope.header();
        if header.opcode != expected {
            return Err(ProtocolError::data_format(format!(
                "expected {expected}, got {}",
                header.opcode
            )));
        }
        if header.transfer_id != id {
            return Err(ProtocolError::data_format("response for another transfer"));
        }
        let session = if expected.requires_session_key() { session } else { None };
        envelope
            .open(own_keys, session)?
            .read_verified(server_key, |r| Self::read(expected, r, limits))
    }
}

fn to_wire(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| ProtocolError::data_format(format!("{value} out of range")))
}

fn read_chunk_size(r: &mut MessageReader) -> Result<u32> {
    let size = r.read_i32()?;
    match u32::try_from(size) {
        Ok(size) if size > 0 => Ok(size),
        _ => Err(ProtocolError::data_format(format!("invalid chunk size {size}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use securetransfer_crypto::generate_secret;

    const LIMITS: FieldLimits = FieldLimits {
        max_location_len: 1024,
        max_chunk: 4096,
    };

    fn read_request(data: &[u8], server: &KeyPair, client: &KeyPair, secret: Option<&[u8; 32]>) -> Result<Request> {
        let envelope = Envelope::parse(data)?;
        let opcode = envelope.header().opcode;
        envelope
            .open(server, secret)?
            .read_verified(&client.public_key(), |r| Request::read(opcode, r, &LIMITS))
    }

    #[test]
    fn upload_request_fields_survive() {
        let client = KeyPair::generate();
        let server = KeyPair::generate();
        let request = Request::Upload {
            nonce_proof: [3u8; 32],
            client_entropy: vec![9u8; 32],
            location: "a/b.bin".into(),
            total_length: 1 << 40,
        };
        let data = request
            .encode(TransferId::new(), &client, MessageKey::SealedTo(&server.public_key()))
            .unwrap();
        assert_eq!(read_request(&data, &server, &client, None).unwrap(), request);
    }

    #[test]
    fn chunk_size_past_i32_is_not_encoded() {
        let server = KeyPair::generate();
        let secret = generate_secret();
        let response = Response::Upload { max_chunk: u32::MAX };
        assert!(response.encode(TransferId::new(), &server, MessageKey::Session(&secret)).is_err());

        let response = Response::Download {
            total_length: 1 << 32,
            body: DownloadBody::Chunked { max_chunk: i32::MAX as u32 + 1 },
        };
        assert!(response.encode(TransferId::new(), &server, MessageKey::Session(&secret)).is_err());
    }

    #[test]
    fn oversized_chunk_rejected() {
        let client = KeyPair::generate();
        let server = KeyPair::generate();
        let secret = generate_secret();
        let request = Request::SendBytes {
            offset: 0,
            bytes: vec![1u8; LIMITS.max_chunk + 1],
        };
        let data = request
            .encode(TransferId::new(), &client, MessageKey::Session(&secret))
            .unwrap();
        assert!(matches!(
            read_request(&data, &server, &client, Some(&secret)),
            Err(ProtocolError::DataFormat(_))
        ));
    }

    #[test]
    fn download_response_bodies() {
        let client = KeyPair::generate();
        let server = KeyPair::generate();
        let secret = generate_secret();
        let id = TransferId::new();

        for body in [
            DownloadBody::Inline(b"whole file".to_vec()),
            DownloadBody::Chunked { max_chunk: 1000 },
        ] {
            let response = Response::Download { total_length: 10, body };
            let data = response.encode(id, &server, MessageKey::Session(&secret)).unwrap();
            let opened = Response::open(
                &data,
                Opcode::DownloadResponse,
                id,
                &client,
                &server.public_key(),
                Some(&secret),
                &LIMITS,
            )
            .unwrap();
            assert_eq!(opened, response);
        }
    }

    #[test]
    fn response_must_match_request() {
        let client = KeyPair::generate();
        let server = KeyPair::generate();
        let secret = generate_secret();
        let id = TransferId::new();
        let data = Response::SendBytes { offset: 0 }
            .encode(id, &server, MessageKey::Session(&secret))
            .unwrap();

        let open = |expected, id| {
            Response::open(&data, expected, id, &client, &server.public_key(), Some(&secret), &LIMITS)
        };
        assert!(open(Opcode::SendBytesResponse, id).is_ok());
        assert!(open(Opcode::DownloadBytesResponse, id).is_err());
        assert!(open(Opcode::SendBytesResponse, TransferId::new()).is_err());
        assert!(
            Response::open(&[], Opcode::SendBytesResponse, id, &client, &server.public_key(), None, &LIMITS)
                .is_err()
        );
    }

    #[test]
    fn nonce_response_is_sealed_to_client() {
        let client = KeyPair::generate();
        let server = KeyPair::generate();
        let id = TransferId::new();
        let response = Response::Nonce {
            nonce: vec![1u8; 32],
            server_entropy: vec![2u8; 32],
        };
        let data = response
            .encode(id, &server, MessageKey::SealedTo(&client.public_key()))
            .unwrap();

        let opened = Response::open(&data, Opcode::NonceResponse, id, &client, &server.public_key(), None, &LIMITS);
        assert_eq!(opened.unwrap(), response);

        let other = KeyPair::generate();
        assert!(
            Response::open(&data, Opcode::NonceResponse, id, &other, &server.public_key(), None, &LIMITS)
                .is_err()
        );
    }
}
