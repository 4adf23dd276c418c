use crate::Database;
use crate::models::SessionRow;
use anyhow::{Result, anyhow};
use rusqlite::{Connection, OptionalExtension};
use securetransfer_types::TransferId;

impl Database {
    // -- Session fields --

    pub fn write_field(&self, transfer_id: &TransferId, field: &str, value: &[u8]) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO session_fields (transfer_id, field, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(transfer_id, field)
                 DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
                rusqlite::params![transfer_id.to_string(), field, value],
            )?;
            Ok(())
        })
    }

    pub fn read_field(&self, transfer_id: &TransferId, field: &str) -> Result<Option<Vec<u8>>> {
        self.with_conn(|conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM session_fields WHERE transfer_id = ?1 AND field = ?2",
                    rusqlite::params![transfer_id.to_string(), field],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value)
        })
    }

    pub fn delete_field(&self, transfer_id: &TransferId, field: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM session_fields WHERE transfer_id = ?1 AND field = ?2",
                rusqlite::params![transfer_id.to_string(), field],
            )?;
            Ok(())
        })
    }

    /// Remove every field of a transfer in one statement.
    pub fn delete_transfer(&self, transfer_id: &TransferId) -> Result<usize> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM session_fields WHERE transfer_id = ?1",
                [transfer_id.to_string()],
            )?;
            Ok(removed)
        })
    }

    /// Remove several transfers atomically. Returns the number of rows deleted.
    pub fn delete_transfers(&self, transfer_ids: &[TransferId]) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut removed = 0;
            {
                let mut stmt = tx.prepare("DELETE FROM session_fields WHERE transfer_id = ?1")?;
                for id in transfer_ids {
                    removed += stmt.execute([id.to_string()])?;
                }
            }
            tx.commit()?;
            Ok(removed)
        })
    }

    /// Every transfer that has a start time, with its key phase.
    pub fn session_rows(&self) -> Result<Vec<SessionRow>> {
        self.with_conn(query_session_rows)
    }

    pub fn transfer_count(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(DISTINCT transfer_id) FROM session_fields",
                [],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }
}

fn query_session_rows(conn: &Connection) -> Result<Vec<SessionRow>> {
    let mut stmt = conn.prepare(
        "SELECT s.transfer_id, s.value,
                EXISTS (SELECT 1 FROM session_fields k
                        WHERE k.transfer_id = s.transfer_id AND k.field = 'session-key')
         FROM session_fields s
         WHERE s.field = 'start-time'",
    )?;
    let raw = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, bool>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    raw.into_iter()
        .map(|(id, started, has_session_key)| {
            let transfer_id: TransferId = id
                .parse()
                .map_err(|e| anyhow!("Bad transfer id {}: {}", id, e))?;
            let started: [u8; 8] = started
                .try_into()
                .map_err(|_| anyhow!("Bad start time for transfer {}", id))?;
            Ok(SessionRow {
                transfer_id,
                started_at_ms: i64::from_be_bytes(started),
                has_session_key,
            })
        })
        .collect()
}
