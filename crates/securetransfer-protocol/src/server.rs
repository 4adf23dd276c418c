/// Receiver side of the protocol.
///
/// The server keeps no state of its own between calls. Each `receive`
/// parses one message, checks it against the persisted session, performs
/// the protocol step and returns the signed, encrypted response.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use securetransfer_crypto::{KeyPair, PublicKey, SECRET_SIZE, nonce_proof, random_vec, session_secret};
use securetransfer_types::{Opcode, ServerConfig, TransferId};

use crate::error::{ProtocolError, Result};
use crate::logging::{NullLogger, TransferEvent, TransferLog, TransferLogger};
use crate::message::{Envelope, MessageKey};
use crate::messages::{DownloadBody, FieldLimits, Request, Response};
use crate::store::{SessionField, SessionStore};
use crate::wire;

const COMPONENT: &str = "server";

/// Error returned to the caller for every rejected message except timeouts.
pub const OPAQUE_ERROR: &str = "invalid message";

/// Callbacks through which the embedding application supplies and
/// consumes file content.
pub trait TransferHandler: Send + Sync {
    /// A new upload has been negotiated.
    fn begin_transfer(&self, id: &TransferId, location: &str, total_length: u64) -> anyhow::Result<()>;

    /// One uploaded chunk. Chunks arrive in any order.
    fn bytes_received(
        &self,
        id: &TransferId,
        location: &str,
        total_length: u64,
        offset: u64,
        bytes: &[u8],
    ) -> anyhow::Result<()>;

    /// The client finished sending. `content_hash` is its SHA-256 of the file.
    fn complete_transfer(
        &self,
        id: &TransferId,
        location: &str,
        total_length: u64,
        content_hash: &[u8; 32],
    ) -> anyhow::Result<()>;

    /// Read `length` bytes at `offset`. Returns the total size of the
    /// content with the bytes; a zero-length read asks only for the size.
    fn download_bytes(
        &self,
        id: &TransferId,
        location: &str,
        offset: u64,
        length: usize,
    ) -> anyhow::Result<(u64, Vec<u8>)>;

    /// Detailed cause of a rejected message, before it is made opaque.
    fn error_raised(&self, _id: Option<&TransferId>, _error: &ProtocolError) {}
}

pub struct Server {
    config: ServerConfig,
    keys: KeyPair,
    client_key: PublicKey,
    store: Arc<dyn SessionStore>,
    logger: Arc<dyn TransferLogger>,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        keys: KeyPair,
        client_key: PublicKey,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            config: config.clamped(),
            keys,
            client_key,
            store,
            logger: Arc::new(NullLogger),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn TransferLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Handle one inbound message and produce the response bytes.
    ///
    /// The no-op sentinel yields an empty response. Failures are reported
    /// to `handler.error_raised`, delayed by a random jitter and returned
    /// as an opaque data-format error; timeouts keep their kind.
    pub fn receive(&self, request: &[u8], handler: &dyn TransferHandler) -> Result<Vec<u8>> {
        if wire::is_noop(request) {
            return Ok(Vec::new());
        }
        let id = wire::peek(request).ok().flatten().map(|h| h.transfer_id);

        match self.dispatch(request, handler) {
            Ok(response) => Ok(response),
            Err(err) => {
                handler.error_raised(id.as_ref(), &err);
                if let Some(id) = id {
                    self.log(id, TransferEvent::Error { message: err.to_string() });
                } else {
                    tracing::warn!(component = COMPONENT, "rejected message: {}", err);
                }
                self.jitter();
                if err.is_timeout() {
                    Err(err)
                } else {
                    Err(ProtocolError::data_format(OPAQUE_ERROR))
                }
            }
        }
    }

    fn dispatch(&self, data: &[u8], handler: &dyn TransferHandler) -> Result<Vec<u8>> {
        let envelope = Envelope::parse(data)?;
        let opcode = envelope.header().opcode;
        let id = envelope.header().transfer_id;
        if !opcode.is_request() {
            return Err(ProtocolError::data_format(format!("{opcode} is not a request")));
        }

        let session = self.check_session(&id, opcode)?;
        let limits = FieldLimits {
            max_location_len: self.config.max_location_len,
            max_chunk: self.config.max_inbound_chunk,
        };
        let request = envelope
            .open(&self.keys, session.as_ref())?
            .read_verified(&self.client_key, |r| Request::read(opcode, r, &limits))?;

        let (response, secret) = match request {
            Request::Nonce => (self.handle_nonce(&id)?, None),
            Request::Upload { nonce_proof, client_entropy, location, total_length } => {
                let secret = self.agree_secret(&id, &nonce_proof, &client_entropy)?;
                let response = self.or_discard(&id, || {
                    self.handle_upload(&id, &secret, location, total_length, handler)
                })?;
                (response, Some(secret))
            }
            Request::Download { nonce_proof, client_entropy, location } => {
                let secret = self.agree_secret(&id, &nonce_proof, &client_entropy)?;
                let response =
                    self.or_discard(&id, || self.handle_download(&id, &secret, location, handler))?;
                (response, Some(secret))
            }
            Request::SendBytes { offset, bytes } => {
                (self.handle_send_bytes(&id, offset, &bytes, handler)?, session)
            }
            Request::UploadComplete { location, content_hash } => {
                (self.handle_upload_complete(&id, &location, &content_hash, handler)?, session)
            }
            Request::DownloadBytes { offset, length } => {
                (self.handle_download_bytes(&id, offset, length, handler)?, session)
            }
            Request::DownloadComplete { location } => {
                (self.handle_download_complete(&id, &location)?, session)
            }
        };

        let key = match &secret {
            Some(secret) => MessageKey::Session(secret),
            None => MessageKey::SealedTo(&self.client_key),
        };
        response.encode(id, &self.keys, key)
    }

    /// Enforce session existence, lifetime and key phase for `opcode`.
    /// Returns the session secret for post-session opcodes.
    fn check_session(&self, id: &TransferId, opcode: Opcode) -> Result<Option<[u8; SECRET_SIZE]>> {
        let started = self.read(id, SessionField::StartTime)?;
        let started = match (opcode, started) {
            (Opcode::NonceRequest, None) => return Ok(None),
            (Opcode::NonceRequest, Some(_)) => {
                return Err(ProtocolError::data_format("session already exists"));
            }
            (_, None) => return Err(ProtocolError::data_format("no session for transfer")),
            (_, Some(raw)) => decode_i64(&raw)?,
        };
        let session_key = self.read(id, SessionField::SessionKey)?;

        let age_ms = Utc::now().timestamp_millis() - started;
        let limit = if session_key.is_some() {
            self.config.session_timeout()
        } else {
            self.config.handshake_timeout()
        };
        if age_ms > self.config.session_timeout().as_millis() as i64
            || age_ms > limit.as_millis() as i64
        {
            self.store.delete_transfer(id).map_err(ProtocolError::store)?;
            self.log(
                *id,
                TransferEvent::SessionEvicted {
                    age_ms,
                    handshake: session_key.is_none(),
                },
            );
            return Err(ProtocolError::Timeout(format!(
                "session {id} expired after {age_ms} ms"
            )));
        }

        match (opcode.requires_session_key(), session_key) {
            (true, Some(key)) => Ok(Some(key.try_into().map_err(|_| {
                ProtocolError::data_format("stored session key has wrong size")
            })?)),
            (false, None) => Ok(None),
            (true, None) => Err(ProtocolError::data_format(format!(
                "{opcode} before session key was established"
            ))),
            (false, Some(_)) => Err(ProtocolError::data_format(format!(
                "{opcode} after session key was established"
            ))),
        }
    }

    fn handle_nonce(&self, id: &TransferId) -> Result<Response> {
        let nonce = random_vec(self.config.nonce_size);
        let server_entropy = random_vec(self.config.session_entropy_size);
        let now = Utc::now().timestamp_millis();

        self.write(id, SessionField::StartTime, &now.to_be_bytes())?;
        self.write(id, SessionField::Nonce, &nonce)?;
        self.write(id, SessionField::ServerKey, &server_entropy)?;
        self.log(*id, TransferEvent::NonceIssued);

        Ok(Response::Nonce { nonce, server_entropy })
    }

    /// Check the echoed nonce, consume it and derive the session secret.
    fn agree_secret(
        &self,
        id: &TransferId,
        proof: &[u8; 32],
        client_entropy: &[u8],
    ) -> Result<[u8; SECRET_SIZE]> {
        let nonce = self.require(id, SessionField::Nonce)?;
        if nonce_proof(&nonce) != *proof {
            return Err(ProtocolError::data_format("nonce proof mismatch"));
        }
        if client_entropy.len() != self.config.session_entropy_size {
            return Err(ProtocolError::data_format(format!(
                "client entropy must be {} bytes",
                self.config.session_entropy_size
            )));
        }
        let server_entropy = self.require(id, SessionField::ServerKey)?;
        self.store.delete(id, SessionField::Nonce).map_err(ProtocolError::store)?;
        Ok(session_secret(client_entropy, &server_entropy))
    }

    /// Run a session-opening step; if it fails after the nonce was consumed,
    /// drop the transfer's remaining rows so nothing is left for the sweeper.
    fn or_discard<T>(&self, id: &TransferId, step: impl FnOnce() -> Result<T>) -> Result<T> {
        let outcome = step();
        if outcome.is_err() {
            if let Err(e) = self.store.delete_transfer(id) {
                tracing::warn!(component = COMPONENT, "failed to discard transfer {}: {}", id, e);
            }
        }
        outcome
    }

    fn handle_upload(
        &self,
        id: &TransferId,
        secret: &[u8; SECRET_SIZE],
        location: String,
        total_length: u64,
        handler: &dyn TransferHandler,
    ) -> Result<Response> {
        self.write(id, SessionField::SessionKey, secret)?;
        self.write(id, SessionField::TotalLength, &total_length.to_be_bytes())?;
        self.write(id, SessionField::Location, location.as_bytes())?;

        handler
            .begin_transfer(id, &location, total_length)
            .map_err(ProtocolError::application)?;
        self.log(*id, TransferEvent::SessionEstablished { location, total_length });

        Ok(Response::Upload {
            max_chunk: self.config.max_inbound_chunk as u32,
        })
    }

    fn handle_download(
        &self,
        id: &TransferId,
        secret: &[u8; SECRET_SIZE],
        location: String,
        handler: &dyn TransferHandler,
    ) -> Result<Response> {
        let (total_length, _) = handler
            .download_bytes(id, &location, 0, 0)
            .map_err(ProtocolError::application)?;

        if total_length <= self.config.max_outbound_chunk as u64 {
            let result = handler
                .download_bytes(id, &location, 0, total_length as usize)
                .map_err(ProtocolError::application);
            self.store.delete_transfer(id).map_err(ProtocolError::store)?;
            let (_, content) = result?;
            if content.len() as u64 != total_length {
                return Err(ProtocolError::Application(format!(
                    "handler returned {} of {} bytes",
                    content.len(),
                    total_length
                )));
            }
            self.log(*id, TransferEvent::InlineDownload { size: content.len() });
            return Ok(Response::Download {
                total_length,
                body: DownloadBody::Inline(content),
            });
        }

        self.write(id, SessionField::SessionKey, secret)?;
        self.write(id, SessionField::TotalLength, &total_length.to_be_bytes())?;
        self.write(id, SessionField::Location, location.as_bytes())?;
        self.log(*id, TransferEvent::SessionEstablished { location, total_length });

        Ok(Response::Download {
            total_length,
            body: DownloadBody::Chunked {
                max_chunk: self.config.max_outbound_chunk as u32,
            },
        })
    }

    fn handle_send_bytes(
        &self,
        id: &TransferId,
        offset: u64,
        bytes: &[u8],
        handler: &dyn TransferHandler,
    ) -> Result<Response> {
        let total_length = self.total_length(id)?;
        check_range(offset, bytes.len() as u64, total_length)?;
        let location = self.location(id)?;

        handler
            .bytes_received(id, &location, total_length, offset, bytes)
            .map_err(ProtocolError::application)?;
        Ok(Response::SendBytes { offset })
    }

    fn handle_upload_complete(
        &self,
        id: &TransferId,
        location: &str,
        content_hash: &[u8; 32],
        handler: &dyn TransferHandler,
    ) -> Result<Response> {
        let outcome = self.finish_upload(id, location, content_hash, handler);
        self.store.delete_transfer(id).map_err(ProtocolError::store)?;
        outcome.map(|_| Response::UploadComplete)
    }

    fn finish_upload(
        &self,
        id: &TransferId,
        location: &str,
        content_hash: &[u8; 32],
        handler: &dyn TransferHandler,
    ) -> Result<()> {
        if self.location(id)? != location {
            return Err(ProtocolError::data_format("location does not match session"));
        }
        let total_length = self.total_length(id)?;
        let duration_ms = self.elapsed_ms(id)?;

        handler
            .complete_transfer(id, location, total_length, content_hash)
            .map_err(ProtocolError::application)?;
        self.log(
            *id,
            TransferEvent::TransferComplete {
                total_bytes: total_length,
                duration_ms,
            },
        );
        Ok(())
    }

    fn handle_download_bytes(
        &self,
        id: &TransferId,
        offset: u64,
        length: u32,
        handler: &dyn TransferHandler,
    ) -> Result<Response> {
        if length as usize > self.config.max_outbound_chunk {
            return Err(ProtocolError::data_format(format!(
                "read of {length} bytes exceeds cap of {}",
                self.config.max_outbound_chunk
            )));
        }
        let total_length = self.total_length(id)?;
        check_range(offset, length as u64, total_length)?;
        let location = self.location(id)?;

        let (_, bytes) = handler
            .download_bytes(id, &location, offset, length as usize)
            .map_err(ProtocolError::application)?;
        if bytes.len() != length as usize {
            return Err(ProtocolError::Application(format!(
                "handler returned {} of {} bytes at offset {}",
                bytes.len(),
                length,
                offset
            )));
        }
        Ok(Response::DownloadBytes { offset, bytes })
    }

    fn handle_download_complete(&self, id: &TransferId, location: &str) -> Result<Response> {
        let summary = self.location(id).and_then(|stored| {
            Ok((stored == location, self.total_length(id)?, self.elapsed_ms(id)?))
        });
        self.store.delete_transfer(id).map_err(ProtocolError::store)?;
        let (matches, total_bytes, duration_ms) = summary?;
        if !matches {
            return Err(ProtocolError::data_format("location does not match session"));
        }
        self.log(*id, TransferEvent::TransferComplete { total_bytes, duration_ms });
        Ok(Response::DownloadComplete)
    }

    fn read(&self, id: &TransferId, field: SessionField) -> Result<Option<Vec<u8>>> {
        self.store.read(id, field).map_err(ProtocolError::store)
    }

    fn require(&self, id: &TransferId, field: SessionField) -> Result<Vec<u8>> {
        self.read(id, field)?
            .ok_or_else(|| ProtocolError::data_format(format!("session is missing {}", field.name())))
    }

    fn write(&self, id: &TransferId, field: SessionField, value: &[u8]) -> Result<()> {
        self.store.write(id, field, value).map_err(ProtocolError::store)
    }

    fn total_length(&self, id: &TransferId) -> Result<u64> {
        let raw = self.require(id, SessionField::TotalLength)?;
        let raw: [u8; 8] = raw
            .try_into()
            .map_err(|_| ProtocolError::data_format("stored total length has wrong size"))?;
        Ok(u64::from_be_bytes(raw))
    }

    fn location(&self, id: &TransferId) -> Result<String> {
        String::from_utf8(self.require(id, SessionField::Location)?)
            .map_err(|_| ProtocolError::data_format("stored location is not UTF-8"))
    }

    fn elapsed_ms(&self, id: &TransferId) -> Result<u64> {
        let started = decode_i64(&self.require(id, SessionField::StartTime)?)?;
        Ok((Utc::now().timestamp_millis() - started).max(0) as u64)
    }

    fn jitter(&self) {
        let min = self.config.error_jitter_min_ms;
        let max = self.config.error_jitter_max_ms.max(min);
        if max == 0 {
            return;
        }
        let delay = rand::rng().random_range(min..=max);
        std::thread::sleep(Duration::from_millis(delay));
    }

    fn log(&self, transfer_id: TransferId, event: TransferEvent) {
        self.logger.log(TransferLog {
            component: COMPONENT,
            transfer_id,
            event,
        });
    }
}

fn decode_i64(raw: &[u8]) -> Result<i64> {
    let raw: [u8; 8] = raw
        .try_into()
        .map_err(|_| ProtocolError::data_format("stored timestamp has wrong size"))?;
    Ok(i64::from_be_bytes(raw))
}

fn check_range(offset: u64, length: u64, total_length: u64) -> Result<()> {
    match offset.checked_add(length) {
        Some(end) if end <= total_length => Ok(()),
        _ => Err(ProtocolError::data_format(format!(
            "range {offset}+{length} exceeds declared length {total_length}"
        ))),
    }
}
