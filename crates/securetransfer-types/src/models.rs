use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire version written into every message header.
pub const PROTOCOL_VERSION: i32 = 1;

/// Opcodes at or above this value are encrypted with a key derived from the
/// negotiated session secret. Opcodes below it carry their own
/// public-key-sealed secret.
pub const SESSION_KEY_START: i32 = 16;

/// 128-bit random identifier correlating every message of one logical
/// file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(Uuid);

impl TransferId {
    /// Create a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_simple())
    }
}

impl FromStr for TransferId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Raw opcode value that matches no known message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unknown opcode {0}")]
pub struct UnknownOpcode(pub i32);

/// Operation code carried in the cleartext header of every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Opcode {
    // Pre-session: secret sealed to the recipient's public key.
    NonceRequest = 1,
    NonceResponse = 2,
    UploadRequest = 3,
    DownloadRequest = 4,

    // Post-session: secret is the negotiated session secret.
    UploadResponse = 16,
    DownloadResponse = 17,
    SendBytesRequest = 18,
    SendBytesResponse = 19,
    UploadCompleteRequest = 20,
    UploadCompleteResponse = 21,
    DownloadBytesRequest = 22,
    DownloadBytesResponse = 23,
    DownloadCompleteRequest = 24,
    DownloadCompleteResponse = 25,
}

impl Opcode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// True once the opcode falls in the session-key regime.
    pub fn requires_session_key(self) -> bool {
        self.as_i32() >= SESSION_KEY_START
    }

    /// True for the seven client-to-server message kinds.
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Self::NonceRequest
                | Self::UploadRequest
                | Self::DownloadRequest
                | Self::SendBytesRequest
                | Self::UploadCompleteRequest
                | Self::DownloadBytesRequest
                | Self::DownloadCompleteRequest
        )
    }

    /// The opcode the server answers a request with. `None` for responses.
    pub fn response(self) -> Option<Self> {
        match self {
            Self::NonceRequest => Some(Self::NonceResponse),
            Self::UploadRequest => Some(Self::UploadResponse),
            Self::DownloadRequest => Some(Self::DownloadResponse),
            Self::SendBytesRequest => Some(Self::SendBytesResponse),
            Self::UploadCompleteRequest => Some(Self::UploadCompleteResponse),
            Self::DownloadBytesRequest => Some(Self::DownloadBytesResponse),
            Self::DownloadCompleteRequest => Some(Self::DownloadCompleteResponse),
            _ => None,
        }
    }
}

impl TryFrom<i32> for Opcode {
    type Error = UnknownOpcode;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::NonceRequest,
            2 => Self::NonceResponse,
            3 => Self::UploadRequest,
            4 => Self::DownloadRequest,
            16 => Self::UploadResponse,
            17 => Self::DownloadResponse,
            18 => Self::SendBytesRequest,
            19 => Self::SendBytesResponse,
            20 => Self::UploadCompleteRequest,
            21 => Self::UploadCompleteResponse,
            22 => Self::DownloadBytesRequest,
            23 => Self::DownloadBytesResponse,
            24 => Self::DownloadCompleteRequest,
            25 => Self::DownloadCompleteResponse,
            other => return Err(UnknownOpcode(other)),
        })
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Opcode; 14] = [
        Opcode::NonceRequest,
        Opcode::NonceResponse,
        Opcode::UploadRequest,
        Opcode::DownloadRequest,
        Opcode::UploadResponse,
        Opcode::DownloadResponse,
        Opcode::SendBytesRequest,
        Opcode::SendBytesResponse,
        Opcode::UploadCompleteRequest,
        Opcode::UploadCompleteResponse,
        Opcode::DownloadBytesRequest,
        Opcode::DownloadBytesResponse,
        Opcode::DownloadCompleteRequest,
        Opcode::DownloadCompleteResponse,
    ];

    #[test]
    fn opcode_values_parse_back() {
        for op in ALL {
            assert_eq!(Opcode::try_from(op.as_i32()), Ok(op));
        }
        assert_eq!(Opcode::try_from(0), Err(UnknownOpcode(0)));
        assert_eq!(Opcode::try_from(5), Err(UnknownOpcode(5)));
        assert_eq!(Opcode::try_from(99), Err(UnknownOpcode(99)));
    }

    #[test]
    fn only_bootstrap_messages_are_pre_session() {
        let pre: Vec<_> = ALL.iter().filter(|op| !op.requires_session_key()).collect();
        assert_eq!(
            pre,
            vec![
                &Opcode::NonceRequest,
                &Opcode::NonceResponse,
                &Opcode::UploadRequest,
                &Opcode::DownloadRequest,
            ]
        );
    }

    #[test]
    fn seven_requests_each_have_a_response() {
        let requests: Vec<_> = ALL.iter().filter(|op| op.is_request()).collect();
        assert_eq!(requests.len(), 7);
        for op in requests {
            let resp = op.response().unwrap();
            assert!(!resp.is_request());
        }
        assert_eq!(Opcode::NonceResponse.response(), None);
    }

    #[test]
    fn transfer_id_display_parses_back() {
        let id = TransferId::new();
        let parsed: TransferId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.to_string().len(), 32);
        assert_eq!(TransferId::from_bytes(*id.as_bytes()), id);
    }

    #[test]
    fn transfer_ids_are_unique() {
        assert_ne!(TransferId::new(), TransferId::new());
    }
}
