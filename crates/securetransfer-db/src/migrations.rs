use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS session_fields (
            transfer_id TEXT NOT NULL,
            field       TEXT NOT NULL,
            value       BLOB NOT NULL,
            updated_at  TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (transfer_id, field)
        );

        CREATE INDEX IF NOT EXISTS idx_session_fields_field
            ON session_fields(field);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
