/// Structured transfer logging.
///
/// Client and server report lifecycle and per-chunk events through a
/// [`TransferLogger`] so the embedder decides where they go.

use std::fmt;

use securetransfer_types::TransferId;

/// Structured log entry for one transfer.
#[derive(Debug, Clone)]
pub struct TransferLog {
    pub component: &'static str,
    pub transfer_id: TransferId,
    pub event: TransferEvent,
}

/// Transfer events that can be logged.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Server: nonce issued, session row created
    NonceIssued,
    /// Both: session secret agreed
    SessionEstablished {
        location: String,
        total_length: u64,
    },
    /// Client: chunk acknowledged by the server
    ChunkSent {
        offset: u64,
        size: usize,
    },
    /// Client: chunk downloaded and written to the sink
    ChunkReceived {
        offset: u64,
        size: usize,
    },
    /// Whole file carried in the download response
    InlineDownload {
        size: usize,
    },
    TransferComplete {
        total_bytes: u64,
        duration_ms: u64,
    },
    /// Server: session state dropped after a timeout
    SessionEvicted {
        age_ms: i64,
        handshake: bool,
    },
    /// Client: cooperative abort observed
    Aborted {
        bytes_so_far: u64,
    },
    Error {
        message: String,
    },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonceIssued => write!(f, "nonce_issued"),
            Self::SessionEstablished { location, total_length } => {
                write!(f, "session_established location={} total={}", location, total_length)
            }
            Self::ChunkSent { offset, size } => {
                write!(f, "chunk_sent offset={} size={}", offset, size)
            }
            Self::ChunkReceived { offset, size } => {
                write!(f, "chunk_received offset={} size={}", offset, size)
            }
            Self::InlineDownload { size } => write!(f, "inline_download size={}", size),
            Self::TransferComplete { total_bytes, duration_ms } => {
                write!(f, "transfer_complete bytes={} duration_ms={}", total_bytes, duration_ms)
            }
            Self::SessionEvicted { age_ms, handshake } => {
                write!(f, "session_evicted age_ms={} handshake={}", age_ms, handshake)
            }
            Self::Aborted { bytes_so_far } => write!(f, "aborted bytes={}", bytes_so_far),
            Self::Error { message } => write!(f, "error: {}", message),
        }
    }
}

/// Sink for transfer log entries. Implementations can write to tracing,
/// forward to a remote collector, or discard them.
pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        let tid = entry.transfer_id.to_string();
        // Per-chunk events go to debug, everything else is lifecycle.
        match &entry.event {
            TransferEvent::ChunkSent { .. } | TransferEvent::ChunkReceived { .. } => {
                tracing::debug!(
                    component = entry.component,
                    transfer_id = %tid,
                    "{}",
                    entry.event,
                );
            }
            TransferEvent::SessionEvicted { .. } | TransferEvent::Error { .. } => {
                tracing::warn!(
                    component = entry.component,
                    transfer_id = %tid,
                    "{}",
                    entry.event,
                );
            }
            _ => {
                tracing::info!(
                    component = entry.component,
                    transfer_id = %tid,
                    "{}",
                    entry.event,
                );
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_render_as_key_value_lines() {
        let event = TransferEvent::ChunkSent { offset: 1000, size: 24 };
        assert_eq!(event.to_string(), "chunk_sent offset=1000 size=24");

        let event = TransferEvent::SessionEvicted { age_ms: 130_000, handshake: true };
        assert_eq!(event.to_string(), "session_evicted age_ms=130000 handshake=true");

        assert_eq!(TransferEvent::NonceIssued.to_string(), "nonce_issued");
    }
}
