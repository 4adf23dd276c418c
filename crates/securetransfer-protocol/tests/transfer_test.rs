/// Integration tests: full client/server pair over an in-process transport.
///
/// The handler keeps files in memory keyed by location, so an upload
/// followed by a download of the same location must round-trip exactly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, anyhow};
use securetransfer_crypto::{KeyPair, random_vec, sha256};
use securetransfer_protocol::{
    Cancelled, Client, Loopback, MemorySessionStore, MemorySink, OPAQUE_ERROR, ProtocolError,
    Server, SessionField, SessionStore, TransferHandler, Transport,
};
use securetransfer_types::{ClientConfig, ServerConfig, TransferId};

#[derive(Default)]
struct MemoryFiles {
    pending: Mutex<HashMap<TransferId, Vec<u8>>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    chunks_received: AtomicUsize,
    chunks_served: AtomicUsize,
    completed_hashes: Mutex<Vec<[u8; 32]>>,
    /// Offset at which chunk reads and writes start failing.
    fail_at: Mutex<Option<u64>>,
}

impl MemoryFiles {
    fn check_offset(&self, offset: u64) -> anyhow::Result<()> {
        if *self.fail_at.lock().unwrap() == Some(offset) {
            return Err(anyhow!("disk error at offset {offset}"));
        }
        Ok(())
    }
}

impl TransferHandler for MemoryFiles {
    fn begin_transfer(&self, id: &TransferId, _: &str, total_length: u64) -> anyhow::Result<()> {
        self.pending.lock().unwrap().insert(*id, vec![0u8; total_length as usize]);
        Ok(())
    }

    fn bytes_received(&self, id: &TransferId, _: &str, _: u64, offset: u64, bytes: &[u8]) -> anyhow::Result<()> {
        self.check_offset(offset)?;
        let mut pending = self.pending.lock().unwrap();
        let buf = pending.get_mut(id).context("unknown transfer")?;
        let start = offset as usize;
        buf[start..start + bytes.len()].copy_from_slice(bytes);
        self.chunks_received.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn complete_transfer(&self, id: &TransferId, location: &str, _: u64, hash: &[u8; 32]) -> anyhow::Result<()> {
        let content = self.pending.lock().unwrap().remove(id).context("unknown transfer")?;
        if sha256(&content) != *hash {
            return Err(anyhow!("content hash mismatch"));
        }
        self.completed_hashes.lock().unwrap().push(*hash);
        self.files.lock().unwrap().insert(location.to_string(), content);
        Ok(())
    }

    fn download_bytes(&self, _: &TransferId, location: &str, offset: u64, length: usize) -> anyhow::Result<(u64, Vec<u8>)> {
        let files = self.files.lock().unwrap();
        let content = files.get(location).context("no such file")?;
        if length > 0 {
            self.check_offset(offset)?;
            self.chunks_served.fetch_add(1, Ordering::SeqCst);
        }
        let start = offset as usize;
        Ok((content.len() as u64, content[start..start + length].to_vec()))
    }
}

/// Counts round-trips and optionally corrupts one byte of each request.
struct Wire {
    inner: Loopback,
    calls: AtomicUsize,
    flip_at: Option<usize>,
}

impl Transport for Wire {
    fn deliver(&self, id: &TransferId, location: &str, mut request: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(index) = self.flip_at {
            if index < request.len() {
                request[index] ^= 0x01;
            }
        }
        self.inner.deliver(id, location, request)
    }
}

struct Harness {
    files: Arc<MemoryFiles>,
    store: Arc<MemorySessionStore>,
    wire: Arc<Wire>,
    client: Client,
}

fn harness(server_config: ServerConfig, client_config: ClientConfig, flip_at: Option<usize>) -> Harness {
    let server_keys = KeyPair::generate();
    let client_keys = KeyPair::generate();
    let store = Arc::new(MemorySessionStore::new());
    let files = Arc::new(MemoryFiles::default());

    let server_config = ServerConfig {
        error_jitter_min_ms: 0,
        error_jitter_max_ms: 0,
        ..server_config
    };
    let server = Server::new(server_config, server_keys.clone(), client_keys.public_key(), store.clone());
    let wire = Arc::new(Wire {
        inner: Loopback::new(Arc::new(server), files.clone()),
        calls: AtomicUsize::new(0),
        flip_at,
    });
    let client = Client::new(client_config, client_keys, server_keys.public_key(), wire.clone());
    Harness { files, store, wire, client }
}

fn roundtrip(size: usize, chunk: usize, threads: usize) {
    let h = harness(
        ServerConfig {
            max_inbound_chunk: chunk,
            max_outbound_chunk: chunk,
            ..Default::default()
        },
        ClientConfig {
            limit_threads: threads,
            ..Default::default()
        },
        None,
    );
    let content = random_vec(size);

    assert!(h.client.upload("data/file.bin", size as u64, &content[..]).unwrap());
    assert_eq!(h.files.files.lock().unwrap()["data/file.bin"], content);

    let sink = Arc::new(MemorySink::new());
    assert!(h.client.download("data/file.bin", sink.clone()).unwrap());
    assert_eq!(sink.contents(), content);
    assert_eq!(sha256(&sink.contents()), sha256(&content));
    assert_eq!(h.store.transfer_count(), 0);
}

#[test]
fn roundtrip_single_worker() {
    roundtrip(20_000, 1000, 1);
}

#[test]
fn roundtrip_ten_workers() {
    roundtrip(20_000, 1000, 10);
}

#[test]
fn roundtrip_fifty_workers() {
    roundtrip(20_000, 1000, 50);
}

#[test]
fn roundtrip_uneven_tail() {
    roundtrip(10_001, 1000, 4);
}

#[test]
fn empty_file_roundtrip() {
    roundtrip(0, 1000, 2);
}

#[test]
fn upload_counts_chunks_and_hash() {
    let h = harness(
        ServerConfig {
            max_inbound_chunk: 1000,
            ..Default::default()
        },
        ClientConfig {
            limit_threads: 10,
            ..Default::default()
        },
        None,
    );
    let content = random_vec(65_535);

    assert!(h.client.upload("big.bin", 65_535, &content[..]).unwrap());
    assert_eq!(h.files.chunks_received.load(Ordering::SeqCst), 66);
    assert_eq!(*h.files.completed_hashes.lock().unwrap(), vec![sha256(&content)]);
    // nonce + upload + 66 chunks + complete
    assert_eq!(h.wire.calls.load(Ordering::SeqCst), 69);
}

#[test]
fn equal_size_download_is_single_round_trip() {
    let h = harness(
        ServerConfig {
            max_outbound_chunk: 1024,
            ..Default::default()
        },
        ClientConfig::default(),
        None,
    );
    let content = random_vec(1024);
    h.files.files.lock().unwrap().insert("small.bin".into(), content.clone());

    let sink = Arc::new(MemorySink::new());
    assert!(h.client.download("small.bin", sink.clone()).unwrap());
    assert_eq!(sink.contents(), content);
    // nonce + download request, no chunk requests and no completion
    assert_eq!(h.wire.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.store.transfer_count(), 0);
}

#[test]
fn abort_before_start_returns_false() {
    let h = harness(ServerConfig::default(), ClientConfig::default(), None);
    h.client.abort();

    let content = random_vec(5000);
    assert!(!h.client.upload("never.bin", 5000, &content[..]).unwrap());
    assert!(!h.client.download("never.bin", Arc::new(MemorySink::new())).unwrap());
    assert_eq!(h.wire.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn progress_cancellation_stops_upload() {
    let h = harness(
        ServerConfig {
            max_inbound_chunk: 100,
            ..Default::default()
        },
        ClientConfig {
            limit_threads: 2,
            ..Default::default()
        },
        None,
    );
    let client = h.client.with_progress(|_, so_far, _| {
        if so_far >= 300 { Err(Cancelled) } else { Ok(()) }
    });
    let content = random_vec(10_000);

    assert!(!client.upload("cancelled.bin", 10_000, &content[..]).unwrap());
    assert!(client.is_aborted());
    assert!(h.files.chunks_received.load(Ordering::SeqCst) < 100);
    assert!(h.files.files.lock().unwrap().is_empty());
}

#[test]
fn corrupted_requests_fail_opaquely() {
    // Salt byte of the header and a byte inside the sealed secret.
    for flip_at in [30, 100] {
        let h = harness(ServerConfig::default(), ClientConfig::default(), Some(flip_at));
        let content = random_vec(100);
        match h.client.upload("x.bin", 100, &content[..]) {
            Err(ProtocolError::DataFormat(message)) => assert_eq!(message, OPAQUE_ERROR),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(h.files.files.lock().unwrap().is_empty());
    }
}

#[test]
fn unknown_download_location_fails() {
    let h = harness(ServerConfig::default(), ClientConfig::default(), None);
    assert!(h.client.download("missing.bin", Arc::new(MemorySink::new())).is_err());
    assert_eq!(h.store.transfer_count(), 0);
}

fn chunked(chunk: usize, threads: usize) -> Harness {
    harness(
        ServerConfig {
            max_inbound_chunk: chunk,
            max_outbound_chunk: chunk,
            ..Default::default()
        },
        ClientConfig {
            limit_threads: threads,
            ..Default::default()
        },
        None,
    )
}

#[test]
fn failing_upload_chunk_stops_the_transfer() {
    let h = chunked(100, 4);
    *h.files.fail_at.lock().unwrap() = Some(500);
    let content = random_vec(100_000);

    match h.client.upload("broken.bin", 100_000, &content[..]) {
        Err(ProtocolError::TransferFailed(_)) => {}
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(h.files.chunks_received.load(Ordering::SeqCst) < 500);
    assert!(h.files.completed_hashes.lock().unwrap().is_empty());
    assert!(h.files.files.lock().unwrap().is_empty());
}

#[test]
fn failing_download_chunk_stops_the_transfer() {
    let h = chunked(100, 4);
    h.files.files.lock().unwrap().insert("big.bin".into(), random_vec(100_000));
    *h.files.fail_at.lock().unwrap() = Some(500);

    match h.client.download("big.bin", Arc::new(MemorySink::new())) {
        Err(ProtocolError::TransferFailed(_)) => {}
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(h.files.chunks_served.load(Ordering::SeqCst) < 500);
}

#[test]
fn download_to_path_replaces_file_only_on_success() {
    let h = chunked(100, 4);
    let content = random_vec(1000);
    h.files.files.lock().unwrap().insert("report.bin".into(), content.clone());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.bin");
    std::fs::write(&path, b"previous version").unwrap();

    assert!(h.client.download_to_path("missing.bin", &path).is_err());
    assert_eq!(std::fs::read(&path).unwrap(), b"previous version");

    *h.files.fail_at.lock().unwrap() = Some(300);
    assert!(h.client.download_to_path("report.bin", &path).is_err());
    assert_eq!(std::fs::read(&path).unwrap(), b"previous version");

    *h.files.fail_at.lock().unwrap() = None;
    assert!(h.client.download_to_path("report.bin", &path).unwrap());
    assert_eq!(std::fs::read(&path).unwrap(), content);
    // No staging file left behind.
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
}

#[test]
fn stale_session_is_evicted_with_timeout() {
    let h = harness(ServerConfig::default(), ClientConfig::default(), None);
    let id = TransferId::new();
    let past = chrono::Utc::now().timestamp_millis() - 3 * 60 * 60 * 1000;
    h.store.write(&id, SessionField::StartTime, &past.to_be_bytes()).unwrap();
    h.store.write(&id, SessionField::SessionKey, &[7u8; 32]).unwrap();
    h.store.write(&id, SessionField::TotalLength, &10u64.to_be_bytes()).unwrap();

    let client_keys = KeyPair::generate();
    let request = securetransfer_protocol::Request::SendBytes { offset: 0, bytes: vec![0u8; 10] };
    let data = request
        .encode(id, &client_keys, securetransfer_protocol::MessageKey::Session(&[7u8; 32]))
        .unwrap();
    let err = h.wire.inner.deliver(&id, "x", data).unwrap_err();
    let err = err.downcast::<ProtocolError>().unwrap();
    assert!(err.is_timeout());
    assert_eq!(h.store.transfer_count(), 0);
}
