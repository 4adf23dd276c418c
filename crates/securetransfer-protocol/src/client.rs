/// Sender side of the protocol.
///
/// Upload:   nonce → upload request → N × send bytes (pooled) → upload complete
/// Download: nonce → download request → inline body, or
///           N × download bytes (pooled) → download complete
///
/// Every transfer returns `Ok(true)` on success, `Ok(false)` when aborted
/// and `Err` on a protocol or transport failure.

use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use securetransfer_crypto::{KeyPair, PublicKey, SECRET_SIZE, nonce_proof, random_vec, session_secret};
use securetransfer_types::{ClientConfig, TransferId};
use sha2::{Digest, Sha256};

use crate::error::{ProtocolError, Result};
use crate::logging::{NullLogger, TransferEvent, TransferLog, TransferLogger};
use crate::message::MessageKey;
use crate::messages::{DownloadBody, FieldLimits, Request, Response};
use crate::pool::{AbortHandle, WorkerPool};
use crate::sink::{ChunkSink, FileSink};
use crate::transport::Transport;

const COMPONENT: &str = "client";

/// Returned from a progress callback to cancel the transfer.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("transfer cancelled by progress callback")]
pub struct Cancelled;

/// `(location, bytes_so_far, total)`.
pub type ProgressCallback = dyn Fn(&str, u64, u64) -> std::result::Result<(), Cancelled> + Send + Sync;

/// Signs, encrypts and delivers requests; opens the replies.
struct Channel {
    keys: KeyPair,
    server_key: PublicKey,
    transport: Arc<dyn Transport>,
    limits: FieldLimits,
}

impl Channel {
    fn exchange(
        &self,
        id: TransferId,
        location: &str,
        request: &Request,
        secret: Option<&[u8; SECRET_SIZE]>,
    ) -> Result<Response> {
        let key = if request.opcode().requires_session_key() {
            MessageKey::Session(
                secret.ok_or_else(|| ProtocolError::data_format("no session secret"))?,
            )
        } else {
            MessageKey::SealedTo(&self.server_key)
        };
        let expected = request
            .opcode()
            .response()
            .ok_or_else(|| ProtocolError::data_format("not a request"))?;

        let bytes = request.encode(id, &self.keys, key)?;
        let reply = self
            .transport
            .deliver(&id, location, bytes)
            .map_err(transport_error)?;
        Response::open(&reply, expected, id, &self.keys, &self.server_key, secret, &self.limits)
    }
}

/// Keep protocol errors raised by an in-process server, wrap everything else.
fn transport_error(err: anyhow::Error) -> ProtocolError {
    match err.downcast::<ProtocolError>() {
        Ok(err) => err,
        Err(err) => ProtocolError::Transport(format!("{err:#}")),
    }
}

/// State shared by the chunk workers of one transfer.
struct Session {
    channel: Arc<Channel>,
    id: TransferId,
    location: String,
    secret: [u8; SECRET_SIZE],
    total: u64,
    done: AtomicU64,
    progress: Progress,
    logger: Arc<dyn TransferLogger>,
}

impl Session {
    fn send_chunk(&self, offset: u64, bytes: Vec<u8>) -> Result<()> {
        if self.progress.abort.is_aborted() {
            return Ok(());
        }
        let size = bytes.len();
        let request = Request::SendBytes { offset, bytes };
        match self.channel.exchange(self.id, &self.location, &request, Some(&self.secret))? {
            Response::SendBytes { offset: acked } if acked == offset => {}
            _ => {
                return Err(ProtocolError::data_format(format!(
                    "chunk at {offset} acknowledged with wrong offset"
                )));
            }
        }
        self.log(TransferEvent::ChunkSent { offset, size });
        Ok(())
    }

    fn receive_chunk(&self, offset: u64, length: u32, sink: &dyn ChunkSink) -> Result<()> {
        if self.progress.abort.is_aborted() {
            return Ok(());
        }
        let request = Request::DownloadBytes { offset, length };
        let bytes = match self.channel.exchange(self.id, &self.location, &request, Some(&self.secret))? {
            Response::DownloadBytes { offset: at, bytes } if at == offset && bytes.len() == length as usize => bytes,
            _ => {
                return Err(ProtocolError::data_format(format!(
                    "chunk at {offset} answered with wrong range"
                )));
            }
        };
        sink.write_at(offset, &bytes)?;
        self.log(TransferEvent::ChunkReceived { offset, size: bytes.len() });

        let so_far = self.done.fetch_add(bytes.len() as u64, Ordering::SeqCst) + bytes.len() as u64;
        self.progress.report(&self.location, so_far, self.total);
        Ok(())
    }

    fn log(&self, event: TransferEvent) {
        self.logger.log(TransferLog {
            component: COMPONENT,
            transfer_id: self.id,
            event,
        });
    }
}

#[derive(Clone)]
struct Progress {
    callback: Option<Arc<ProgressCallback>>,
    abort: AbortHandle,
}

impl Progress {
    /// A callback that returns `Cancelled` aborts the transfer.
    fn report(&self, location: &str, so_far: u64, total: u64) {
        if let Some(callback) = &self.callback {
            if callback(location, so_far, total).is_err() {
                self.abort.abort();
            }
        }
    }
}

pub struct Client {
    config: ClientConfig,
    channel: Arc<Channel>,
    progress: Progress,
    logger: Arc<dyn TransferLogger>,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        keys: KeyPair,
        server_key: PublicKey,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let limits = FieldLimits {
            max_location_len: config.max_location_len,
            max_chunk: config.max_download_chunk,
        };
        Self {
            config,
            channel: Arc::new(Channel {
                keys,
                server_key,
                transport,
                limits,
            }),
            progress: Progress {
                callback: None,
                abort: AbortHandle::new(),
            },
            logger: Arc::new(NullLogger),
        }
    }

    /// Called with `(location, bytes_so_far, total)` after every chunk.
    pub fn with_progress(
        mut self,
        callback: impl Fn(&str, u64, u64) -> std::result::Result<(), Cancelled> + Send + Sync + 'static,
    ) -> Self {
        self.progress.callback = Some(Arc::new(callback));
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn TransferLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// Request cooperative cancellation. No new chunk requests are issued;
    /// requests already in flight finish on their own. The flag stays set
    /// for the lifetime of the client.
    pub fn abort(&self) {
        self.progress.abort.abort();
    }

    /// A handle that can abort this client from another thread.
    pub fn abort_handle(&self) -> AbortHandle {
        self.progress.abort.clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.progress.abort.is_aborted()
    }

    /// Upload `length` bytes read from `input` to `location`.
    pub fn upload(&self, location: &str, length: u64, mut input: impl Read) -> Result<bool> {
        self.check_location(location)?;
        if i64::try_from(length).is_err() {
            return Err(ProtocolError::data_format(format!("length {length} out of range")));
        }
        let id = TransferId::new();
        if self.is_aborted() {
            self.log(id, TransferEvent::Aborted { bytes_so_far: 0 });
            return Ok(false);
        }
        let started = Instant::now();

        let (nonce, client_entropy, secret) = self.handshake(id, location)?;
        let request = Request::Upload {
            nonce_proof: nonce_proof(&nonce),
            client_entropy,
            location: location.to_string(),
            total_length: length,
        };
        let max_chunk = match self.channel.exchange(id, location, &request, Some(&secret))? {
            Response::Upload { max_chunk } => max_chunk as u64,
            _ => return Err(ProtocolError::data_format("unexpected upload response")),
        };
        self.log(
            id,
            TransferEvent::SessionEstablished {
                location: location.to_string(),
                total_length: length,
            },
        );

        let session = Arc::new(self.session(id, location, secret, length));
        let pool = WorkerPool::new(self.config.limit_threads);
        let mut hasher = Sha256::new();
        let mut offset = 0u64;
        let mut aborted = false;

        while offset < length {
            if self.is_aborted() {
                aborted = true;
                break;
            }
            if pool.has_failed() {
                break;
            }
            let size = max_chunk.min(length - offset) as usize;
            let mut chunk = vec![0u8; size];
            input.read_exact(&mut chunk)?;
            hasher.update(&chunk);

            let worker = Arc::clone(&session);
            let at = offset;
            pool.submit(Box::new(move || worker.send_chunk(at, chunk)))?;
            offset += size as u64;
            self.progress.report(location, offset, length);
        }

        let drained = pool.join(self.config.completion_timeout(), self.config.failure_drain_timeout());
        if aborted || self.is_aborted() {
            self.log(id, TransferEvent::Aborted { bytes_so_far: offset });
            return Ok(false);
        }
        drained?;

        let request = Request::UploadComplete {
            location: location.to_string(),
            content_hash: hasher.finalize().into(),
        };
        match self.channel.exchange(id, location, &request, Some(&secret))? {
            Response::UploadComplete => {}
            _ => return Err(ProtocolError::data_format("unexpected upload complete response")),
        }
        self.log(
            id,
            TransferEvent::TransferComplete {
                total_bytes: length,
                duration_ms: started.elapsed().as_millis() as u64,
            },
        );
        Ok(true)
    }

    /// Download `location` into `sink`.
    pub fn download(&self, location: &str, sink: Arc<dyn ChunkSink>) -> Result<bool> {
        self.check_location(location)?;
        let id = TransferId::new();
        if self.is_aborted() {
            self.log(id, TransferEvent::Aborted { bytes_so_far: 0 });
            return Ok(false);
        }
        let started = Instant::now();

        let (nonce, client_entropy, secret) = self.handshake(id, location)?;
        let request = Request::Download {
            nonce_proof: nonce_proof(&nonce),
            client_entropy,
            location: location.to_string(),
        };
        let (total, body) = match self.channel.exchange(id, location, &request, Some(&secret))? {
            Response::Download { total_length, body } => (total_length, body),
            _ => return Err(ProtocolError::data_format("unexpected download response")),
        };
        sink.set_len(total)?;

        let max_chunk = match body {
            DownloadBody::Inline(bytes) => {
                if bytes.len() as u64 != total {
                    return Err(ProtocolError::data_format(format!(
                        "inline body of {} bytes, declared {}",
                        bytes.len(),
                        total
                    )));
                }
                sink.write_at(0, &bytes)?;
                sink.flush()?;
                self.log(id, TransferEvent::InlineDownload { size: bytes.len() });
                self.progress.report(location, total, total);
                return Ok(true);
            }
            DownloadBody::Chunked { max_chunk } => {
                (max_chunk as u64).min(self.config.max_download_chunk as u64).max(1)
            }
        };
        self.log(
            id,
            TransferEvent::SessionEstablished {
                location: location.to_string(),
                total_length: total,
            },
        );

        let session = Arc::new(self.session(id, location, secret, total));
        let pool = WorkerPool::new(self.config.limit_threads);
        let mut offset = 0u64;
        let mut aborted = false;

        while offset < total {
            if self.is_aborted() {
                aborted = true;
                break;
            }
            if pool.has_failed() {
                break;
            }
            let length = max_chunk.min(total - offset);
            let worker = Arc::clone(&session);
            let sink = Arc::clone(&sink);
            let at = offset;
            pool.submit(Box::new(move || worker.receive_chunk(at, length as u32, sink.as_ref())))?;
            offset += length;
        }

        let drained = pool.join(self.config.completion_timeout(), self.config.failure_drain_timeout());
        if aborted || self.is_aborted() {
            self.log(
                id,
                TransferEvent::Aborted {
                    bytes_so_far: session.done.load(Ordering::SeqCst),
                },
            );
            return Ok(false);
        }
        drained?;
        sink.flush()?;

        let request = Request::DownloadComplete {
            location: location.to_string(),
        };
        match self.channel.exchange(id, location, &request, Some(&secret))? {
            Response::DownloadComplete => {}
            _ => return Err(ProtocolError::data_format("unexpected download complete response")),
        }
        self.log(
            id,
            TransferEvent::TransferComplete {
                total_bytes: total,
                duration_ms: started.elapsed().as_millis() as u64,
            },
        );
        Ok(true)
    }

    /// Download `location` into a file at `path`.
    ///
    /// Content is written to a hidden `.{name}.part` file next to `path` and
    /// renamed over it only once the download completes, so an existing file
    /// at `path` survives a failed or aborted download untouched.
    pub fn download_to_path(&self, location: &str, path: &Path) -> Result<bool> {
        let partial = partial_path(path)?;
        let sink = Arc::new(FileSink::create(&partial)?);
        let outcome = self.download(location, sink);
        match outcome {
            Ok(true) => {
                if let Err(e) = std::fs::rename(&partial, path) {
                    let _ = std::fs::remove_file(&partial);
                    return Err(e.into());
                }
                Ok(true)
            }
            other => {
                let _ = std::fs::remove_file(&partial);
                other
            }
        }
    }

    /// Nonce round-trip. Returns the nonce, fresh client entropy and the
    /// session secret both sides derive from it.
    fn handshake(&self, id: TransferId, location: &str) -> Result<(Vec<u8>, Vec<u8>, [u8; SECRET_SIZE])> {
        let (nonce, server_entropy) = match self.channel.exchange(id, location, &Request::Nonce, None)? {
            Response::Nonce { nonce, server_entropy } => (nonce, server_entropy),
            _ => return Err(ProtocolError::data_format("unexpected nonce response")),
        };
        let client_entropy = random_vec(self.config.session_entropy_size);
        let secret = session_secret(&client_entropy, &server_entropy);
        Ok((nonce, client_entropy, secret))
    }

    fn session(&self, id: TransferId, location: &str, secret: [u8; SECRET_SIZE], total: u64) -> Session {
        Session {
            channel: Arc::clone(&self.channel),
            id,
            location: location.to_string(),
            secret,
            total,
            done: AtomicU64::new(0),
            progress: self.progress.clone(),
            logger: Arc::clone(&self.logger),
        }
    }

    fn check_location(&self, location: &str) -> Result<()> {
        if location.len() > self.config.max_location_len {
            return Err(ProtocolError::data_format(format!(
                "location of {} bytes exceeds cap of {}",
                location.len(),
                self.config.max_location_len
            )));
        }
        Ok(())
    }

    fn log(&self, transfer_id: TransferId, event: TransferEvent) {
        self.logger.log(TransferLog {
            component: COMPONENT,
            transfer_id,
            event,
        });
    }
}

/// Sibling `.{name}.part` path a download is staged in.
fn partial_path(path: &Path) -> Result<PathBuf> {
    let name = path.file_name().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} has no file name", path.display()),
        )
    })?;
    let mut partial = OsString::from(".");
    partial.push(name);
    partial.push(".part");
    Ok(path.with_file_name(partial))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn client(transport: Arc<dyn Transport>) -> Client {
        let server = KeyPair::generate();
        Client::new(ClientConfig::default(), KeyPair::generate(), server.public_key(), transport)
    }

    #[test]
    fn aborted_client_sends_nothing() {
        let calls = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&calls);
        let transport = move |_: &TransferId, _: &str, _: Vec<u8>| -> anyhow::Result<Vec<u8>> {
            *counter.lock().unwrap() += 1;
            Ok(Vec::new())
        };
        let client = client(Arc::new(transport));
        client.abort();

        assert!(!client.upload("a.bin", 3, &b"abc"[..]).unwrap());
        assert!(!client.download("a.bin", Arc::new(crate::sink::MemorySink::new())).unwrap());
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[test]
    fn transport_failure_is_error() {
        let transport = |_: &TransferId, _: &str, _: Vec<u8>| -> anyhow::Result<Vec<u8>> {
            Err(anyhow::anyhow!("connection refused"))
        };
        let client = client(Arc::new(transport));
        let err = client.upload("a.bin", 3, &b"abc"[..]).unwrap_err();
        assert!(matches!(err, ProtocolError::Transport(_)));
    }

    #[test]
    fn empty_reply_is_data_format() {
        let transport = |_: &TransferId, _: &str, _: Vec<u8>| -> anyhow::Result<Vec<u8>> { Ok(Vec::new()) };
        let client = client(Arc::new(transport));
        assert!(matches!(
            client.upload("a.bin", 3, &b"abc"[..]),
            Err(ProtocolError::DataFormat(_))
        ));
    }

    #[test]
    fn overlong_location_rejected_before_sending() {
        let transport = |_: &TransferId, _: &str, _: Vec<u8>| -> anyhow::Result<Vec<u8>> {
            panic!("transport must not be called")
        };
        let client = client(Arc::new(transport));
        let location = "x".repeat(1025);
        assert!(client.upload(&location, 0, std::io::empty()).is_err());
    }

    #[test]
    fn failed_download_keeps_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keep.txt");
        std::fs::write(&path, b"existing contents").unwrap();

        let transport = |_: &TransferId, _: &str, _: Vec<u8>| -> anyhow::Result<Vec<u8>> {
            Err(anyhow::anyhow!("connection refused"))
        };
        let client = client(Arc::new(transport));
        assert!(client.download_to_path("keep.txt", &path).is_err());

        assert_eq!(std::fs::read(&path).unwrap(), b"existing contents");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn partial_file_sits_beside_target() {
        let path = Path::new("/data/reports/q1.pdf");
        assert_eq!(partial_path(path).unwrap(), Path::new("/data/reports/.q1.pdf.part"));
        assert!(partial_path(Path::new("/")).is_err());
    }

    #[test]
    fn abort_handle_reaches_client() {
        let transport = |_: &TransferId, _: &str, _: Vec<u8>| -> anyhow::Result<Vec<u8>> { Ok(Vec::new()) };
        let client = client(Arc::new(transport));
        let handle = client.abort_handle();
        assert!(!client.is_aborted());
        handle.abort();
        assert!(client.is_aborted());
    }
}
