//! Error taxonomy for the protocol engine.

use securetransfer_types::UnknownOpcode;

/// Errors produced while building, parsing or driving protocol messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Structural or cryptographic violation: bad version, unknown opcode,
    /// length overrun, failed decryption, nonce mismatch, out-of-order state.
    #[error("data format error: {0}")]
    DataFormat(String),

    #[error("signature verification failed")]
    Signature,

    /// Session older than its allowed lifetime. State has been deleted.
    #[error("session timed out: {0}")]
    Timeout(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("session store failure: {0}")]
    Store(String),

    /// The embedding application's handler or sink failed.
    #[error("application failure: {0}")]
    Application(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A chunk worker failed or the chunk workers did not drain in time.
    #[error("transfer failed: {0}")]
    TransferFailed(String),
}

impl ProtocolError {
    pub(crate) fn data_format(message: impl Into<String>) -> Self {
        Self::DataFormat(message.into())
    }

    pub(crate) fn store(err: anyhow::Error) -> Self {
        Self::Store(format!("{err:#}"))
    }

    pub(crate) fn application(err: anyhow::Error) -> Self {
        Self::Application(format!("{err:#}"))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<UnknownOpcode> for ProtocolError {
    fn from(err: UnknownOpcode) -> Self {
        Self::DataFormat(err.to_string())
    }
}

pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;
