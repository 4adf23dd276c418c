/// SecureTransfer protocol engine.
///
/// Point-to-point file transfer between a client (sender) and a server
/// (receiver) that authenticate each other with long-lived keys:
/// - Signed, encrypted message envelope with a cleartext routing header
/// - Nonce handshake that agrees a per-transfer session secret
/// - Stateless server backed by an injected session store
/// - Chunked upload/download over a bounded worker pool, positional writes
/// - Cooperative abort and fail-fast drain
///
/// The transport is supplied by the embedder; the engine never opens sockets.

pub mod client;
pub mod error;
pub mod logging;
pub mod message;
pub mod messages;
pub mod pool;
pub mod server;
pub mod sink;
pub mod store;
pub mod transport;
pub mod wire;

// Re-export key types for convenience.
pub use client::{Cancelled, Client, ProgressCallback};
pub use error::{ProtocolError, Result};
pub use logging::{NullLogger, TracingLogger, TransferEvent, TransferLog, TransferLogger};
pub use message::{Envelope, MessageKey, MessageReader, MessageWriter};
pub use messages::{DownloadBody, FieldLimits, Request, Response};
pub use pool::{AbortHandle, WorkerPool};
pub use server::{OPAQUE_ERROR, Server, TransferHandler};
pub use sink::{ChunkSink, FileSink, MemorySink};
pub use store::{MemorySessionStore, SessionField, SessionStore};
pub use transport::{Loopback, Transport};
pub use wire::{HEADER_SIZE, MessageHeader};
