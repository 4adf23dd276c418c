/// Server-side session state, persisted between independent `receive` calls.
///
/// The store is a capability handed to the server, so several stateless
/// server processes can share one backing database.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use securetransfer_types::TransferId;
use tracing::info;

/// One persisted value of a transfer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionField {
    /// Creation time, i64 BE Unix milliseconds.
    StartTime,
    /// Server-issued nonce, consumed by the upload/download request.
    Nonce,
    /// Server ephemeral entropy.
    ServerKey,
    /// Negotiated session secret. Its presence marks the post-session phase.
    SessionKey,
    /// Declared total length, u64 BE.
    TotalLength,
    /// Logical location, UTF-8.
    Location,
}

impl SessionField {
    pub const ALL: [SessionField; 6] = [
        Self::StartTime,
        Self::Nonce,
        Self::ServerKey,
        Self::SessionKey,
        Self::TotalLength,
        Self::Location,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::StartTime => "start-time",
            Self::Nonce => "nonce",
            Self::ServerKey => "server-key",
            Self::SessionKey => "session-key",
            Self::TotalLength => "total-length",
            Self::Location => "location",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }
}

/// Key/value store keyed by transfer id. Implementations must tolerate
/// concurrent calls for the same transfer.
pub trait SessionStore: Send + Sync {
    fn write(&self, id: &TransferId, field: SessionField, value: &[u8]) -> Result<()>;

    fn read(&self, id: &TransferId, field: SessionField) -> Result<Option<Vec<u8>>>;

    /// Deleting a missing field is not an error.
    fn delete(&self, id: &TransferId, field: SessionField) -> Result<()>;

    /// Remove every field of a transfer.
    fn delete_transfer(&self, id: &TransferId) -> Result<()> {
        for field in SessionField::ALL {
            self.delete(id, field)?;
        }
        Ok(())
    }
}

/// In-process store for embedding and tests.
#[derive(Default)]
pub struct MemorySessionStore {
    fields: Mutex<HashMap<(TransferId, SessionField), Vec<u8>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transfers with at least one stored field.
    pub fn transfer_count(&self) -> usize {
        let Ok(fields) = self.fields.lock() else {
            return 0;
        };
        let mut ids: Vec<_> = fields.keys().map(|(id, _)| *id).collect();
        ids.sort();
        ids.dedup();
        ids.len()
    }

    /// Transfers past their allowed age at `now`: older than
    /// `session_timeout`, or older than `handshake_timeout` without a
    /// session key.
    pub fn stale_transfers(
        &self,
        now: DateTime<Utc>,
        session_timeout: Duration,
        handshake_timeout: Duration,
    ) -> Result<Vec<TransferId>> {
        let fields = self.fields.lock().map_err(|_| anyhow!("session store lock poisoned"))?;
        let keyed: HashSet<TransferId> = fields
            .keys()
            .filter(|(_, field)| *field == SessionField::SessionKey)
            .map(|(id, _)| *id)
            .collect();

        let now_ms = now.timestamp_millis();
        let mut stale = Vec::new();
        for ((id, field), value) in fields.iter() {
            if *field != SessionField::StartTime {
                continue;
            }
            let started: [u8; 8] = value
                .as_slice()
                .try_into()
                .map_err(|_| anyhow!("Bad start time for transfer {}", id))?;
            let limit = if keyed.contains(id) { session_timeout } else { handshake_timeout };
            if now_ms - i64::from_be_bytes(started) > limit.as_millis() as i64 {
                stale.push(*id);
            }
        }
        Ok(stale)
    }

    /// Delete every stale transfer and return the ids removed.
    pub fn sweep_stale(
        &self,
        session_timeout: Duration,
        handshake_timeout: Duration,
    ) -> Result<Vec<TransferId>> {
        let stale = self.stale_transfers(Utc::now(), session_timeout, handshake_timeout)?;
        if !stale.is_empty() {
            let doomed: HashSet<TransferId> = stale.iter().copied().collect();
            let mut fields = self.fields.lock().map_err(|_| anyhow!("session store lock poisoned"))?;
            fields.retain(|(id, _), _| !doomed.contains(id));
            info!("Swept {} stale transfer sessions", stale.len());
        }
        Ok(stale)
    }
}

impl SessionStore for MemorySessionStore {
    fn write(&self, id: &TransferId, field: SessionField, value: &[u8]) -> Result<()> {
        let mut fields = self.fields.lock().map_err(|_| anyhow!("session store lock poisoned"))?;
        fields.insert((*id, field), value.to_vec());
        Ok(())
    }

    fn read(&self, id: &TransferId, field: SessionField) -> Result<Option<Vec<u8>>> {
        let fields = self.fields.lock().map_err(|_| anyhow!("session store lock poisoned"))?;
        Ok(fields.get(&(*id, field)).cloned())
    }

    fn delete(&self, id: &TransferId, field: SessionField) -> Result<()> {
        let mut fields = self.fields.lock().map_err(|_| anyhow!("session store lock poisoned"))?;
        fields.remove(&(*id, field));
        Ok(())
    }

    fn delete_transfer(&self, id: &TransferId) -> Result<()> {
        let mut fields = self.fields.lock().map_err(|_| anyhow!("session store lock poisoned"))?;
        fields.retain(|(owner, _), _| owner != id);
        Ok(())
    }
}
