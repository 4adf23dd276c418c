/// Tunable limits for both protocol roles.
///
/// Defaults match the values peers expect; every field can be overridden
/// from a deserialized config or from `ST_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Largest length a signed 32-bit wire field can carry.
pub const MAX_WIRE_LENGTH: usize = i32::MAX as usize;

/// Server (receiver) limits and timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Size of the server-issued nonce in bytes.
    pub nonce_size: usize,
    /// Size of each side's ephemeral entropy in bytes.
    pub session_entropy_size: usize,
    /// Largest chunk a client may send in one SendBytesRequest.
    pub max_inbound_chunk: usize,
    /// Largest chunk the server returns in one response. Files up to this
    /// size are inlined in the DownloadResponse.
    pub max_outbound_chunk: usize,
    /// Cap on the location string in bytes.
    pub max_location_len: usize,
    /// Sessions older than this are evicted.
    pub session_timeout_secs: u64,
    /// Sessions still negotiating after this long are evicted.
    pub handshake_timeout_secs: u64,
    /// Random delay range applied before reporting a rejected message.
    pub error_jitter_min_ms: u64,
    pub error_jitter_max_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            nonce_size: 32,
            session_entropy_size: 32,
            max_inbound_chunk: 65_535,
            max_outbound_chunk: 1_024_000,
            max_location_len: 1024,
            session_timeout_secs: 2 * 60 * 60,
            handshake_timeout_secs: 2 * 60,
            error_jitter_min_ms: 10,
            error_jitter_max_ms: 100,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by any `ST_*` variables present in the environment.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            nonce_size: env_or("ST_NONCE_SIZE", d.nonce_size),
            session_entropy_size: env_or("ST_SESSION_ENTROPY_SIZE", d.session_entropy_size),
            max_inbound_chunk: env_or("ST_MAX_INBOUND_CHUNK", d.max_inbound_chunk),
            max_outbound_chunk: env_or("ST_MAX_OUTBOUND_CHUNK", d.max_outbound_chunk),
            max_location_len: env_or("ST_MAX_LOCATION_LEN", d.max_location_len),
            session_timeout_secs: env_or("ST_SESSION_TIMEOUT_SECS", d.session_timeout_secs),
            handshake_timeout_secs: env_or("ST_HANDSHAKE_TIMEOUT_SECS", d.handshake_timeout_secs),
            error_jitter_min_ms: env_or("ST_ERROR_JITTER_MIN_MS", d.error_jitter_min_ms),
            error_jitter_max_ms: env_or("ST_ERROR_JITTER_MAX_MS", d.error_jitter_max_ms),
        }
        .clamped()
    }

    /// Chunk and location limits brought into the range the wire format can
    /// express: at least one byte and at most [`MAX_WIRE_LENGTH`].
    pub fn clamped(self) -> Self {
        Self {
            max_inbound_chunk: self.max_inbound_chunk.clamp(1, MAX_WIRE_LENGTH),
            max_outbound_chunk: self.max_outbound_chunk.clamp(1, MAX_WIRE_LENGTH),
            max_location_len: self.max_location_len.min(MAX_WIRE_LENGTH),
            ..self
        }
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Client (sender) limits and timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Maximum number of concurrent chunk round-trips.
    pub limit_threads: usize,
    /// Size of the client's ephemeral entropy in bytes.
    pub session_entropy_size: usize,
    /// Cap on the location string in bytes.
    pub max_location_len: usize,
    /// Largest chunk accepted in a download response.
    pub max_download_chunk: usize,
    /// How long to wait for outstanding chunks when nothing has failed.
    pub completion_timeout_secs: u64,
    /// How long to wait for outstanding chunks once one has failed.
    pub failure_drain_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            limit_threads: 10,
            session_entropy_size: 32,
            max_location_len: 1024,
            max_download_chunk: 1_024_000,
            completion_timeout_secs: 60 * 60,
            failure_drain_timeout_secs: 10,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            limit_threads: env_or("ST_LIMIT_THREADS", d.limit_threads),
            session_entropy_size: env_or("ST_SESSION_ENTROPY_SIZE", d.session_entropy_size),
            max_location_len: env_or("ST_MAX_LOCATION_LEN", d.max_location_len),
            max_download_chunk: env_or("ST_MAX_DOWNLOAD_CHUNK", d.max_download_chunk),
            completion_timeout_secs: env_or("ST_COMPLETION_TIMEOUT_SECS", d.completion_timeout_secs),
            failure_drain_timeout_secs: env_or(
                "ST_FAILURE_DRAIN_TIMEOUT_SECS",
                d.failure_drain_timeout_secs,
            ),
        }
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout_secs)
    }

    pub fn failure_drain_timeout(&self) -> Duration {
        Duration::from_secs(self.failure_drain_timeout_secs)
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
