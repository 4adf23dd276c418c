/// Shared types for the SecureTransfer protocol.
///
/// Identifiers, operation codes and the configurable limits used by both
/// the client (sender) and server (receiver) engines.

pub mod config;
pub mod models;

pub use config::{ClientConfig, MAX_WIRE_LENGTH, ServerConfig};
pub use models::{
    Opcode, PROTOCOL_VERSION, SESSION_KEY_START, TransferId, UnknownOpcode,
};
