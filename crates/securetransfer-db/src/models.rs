/// Database row types.
/// Distinct from the protocol's session fields to keep the DB layer independent.

use securetransfer_types::TransferId;

/// One live transfer session as seen by the stale-session sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRow {
    pub transfer_id: TransferId,
    /// Unix milliseconds from the `start-time` field.
    pub started_at_ms: i64,
    /// Whether the session secret has been agreed.
    pub has_session_key: bool,
}
