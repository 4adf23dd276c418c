use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use securetransfer_protocol::{SessionField, SessionStore};
use securetransfer_types::TransferId;
use tracing::info;

use crate::Database;

/// Session state persisted in SQLite, shared by every server process that
/// opens the same file.
pub struct SqliteSessionStore {
    db: Database,
}

impl SqliteSessionStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            db: Database::open(path)?,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            db: Database::open_in_memory()?,
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
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
        let now_ms = now.timestamp_millis();
        let stale = self
            .db
            .session_rows()?
            .into_iter()
            .filter(|row| {
                let limit = if row.has_session_key {
                    session_timeout
                } else {
                    handshake_timeout
                };
                now_ms - row.started_at_ms > limit.as_millis() as i64
            })
            .map(|row| row.transfer_id)
            .collect();
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
            self.db.delete_transfers(&stale)?;
            info!("Swept {} stale transfer sessions", stale.len());
        }
        Ok(stale)
    }
}

impl SessionStore for SqliteSessionStore {
    fn write(&self, id: &TransferId, field: SessionField, value: &[u8]) -> Result<()> {
        self.db.write_field(id, field.name(), value)
    }

    fn read(&self, id: &TransferId, field: SessionField) -> Result<Option<Vec<u8>>> {
        self.db.read_field(id, field.name())
    }

    fn delete(&self, id: &TransferId, field: SessionField) -> Result<()> {
        self.db.delete_field(id, field.name())
    }

    fn delete_transfer(&self, id: &TransferId) -> Result<()> {
        self.db.delete_transfer(id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(store: &SqliteSessionStore, id: &TransferId, at: DateTime<Utc>, keyed: bool) {
        store
            .write(id, SessionField::StartTime, &at.timestamp_millis().to_be_bytes())
            .unwrap();
        if keyed {
            store.write(id, SessionField::SessionKey, &[1u8; 32]).unwrap();
        }
    }

    #[test]
    fn fields_roundtrip_and_overwrite() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let id = TransferId::new();

        assert_eq!(store.read(&id, SessionField::Nonce).unwrap(), None);
        store.write(&id, SessionField::Nonce, b"first").unwrap();
        store.write(&id, SessionField::Nonce, b"second").unwrap();
        assert_eq!(store.read(&id, SessionField::Nonce).unwrap(), Some(b"second".to_vec()));

        store.delete(&id, SessionField::Nonce).unwrap();
        assert_eq!(store.read(&id, SessionField::Nonce).unwrap(), None);
    }

    #[test]
    fn delete_transfer_is_scoped() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let a = TransferId::new();
        let b = TransferId::new();
        for field in SessionField::ALL {
            store.write(&a, field, b"x").unwrap();
        }
        store.write(&b, SessionField::Location, b"keep").unwrap();

        store.delete_transfer(&a).unwrap();
        assert_eq!(store.database().transfer_count().unwrap(), 1);
        assert_eq!(store.read(&b, SessionField::Location).unwrap(), Some(b"keep".to_vec()));
    }

    #[test]
    fn stale_sessions_by_phase() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let now = Utc::now();
        let fresh_handshake = TransferId::new();
        let stale_handshake = TransferId::new();
        let keyed_30_min = TransferId::new();
        let keyed_3_hours = TransferId::new();

        start(&store, &fresh_handshake, now - chrono::Duration::seconds(30), false);
        start(&store, &stale_handshake, now - chrono::Duration::minutes(3), false);
        start(&store, &keyed_30_min, now - chrono::Duration::minutes(30), true);
        start(&store, &keyed_3_hours, now - chrono::Duration::hours(3), true);

        let mut stale = store
            .stale_transfers(now, Duration::from_secs(7200), Duration::from_secs(120))
            .unwrap();
        stale.sort();
        let mut expected = vec![stale_handshake, keyed_3_hours];
        expected.sort();
        assert_eq!(stale, expected);

        let swept = store
            .sweep_stale(Duration::from_secs(7200), Duration::from_secs(120))
            .unwrap();
        assert_eq!(swept.len(), 2);
        assert_eq!(store.database().transfer_count().unwrap(), 2);
        assert!(store.read(&fresh_handshake, SessionField::StartTime).unwrap().is_some());
    }

    #[test]
    fn shared_file_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        let first = SqliteSessionStore::open(&path).unwrap();
        let second = SqliteSessionStore::open(&path).unwrap();

        let id = TransferId::new();
        first.write(&id, SessionField::Location, b"shared.bin").unwrap();
        assert_eq!(
            second.read(&id, SessionField::Location).unwrap(),
            Some(b"shared.bin".to_vec())
        );
    }
}
