/// Moves request bytes to a server and returns its response.
///
/// The protocol never owns a connection; the embedder supplies one of these.

use std::sync::Arc;

use securetransfer_types::TransferId;

use crate::server::{Server, TransferHandler};

pub trait Transport: Send + Sync {
    fn deliver(&self, transfer_id: &TransferId, location: &str, request: Vec<u8>) -> anyhow::Result<Vec<u8>>;
}

impl<F> Transport for F
where
    F: Fn(&TransferId, &str, Vec<u8>) -> anyhow::Result<Vec<u8>> + Send + Sync,
{
    fn deliver(&self, transfer_id: &TransferId, location: &str, request: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        self(transfer_id, location, request)
    }
}

/// In-process transport that calls a [`Server`] directly.
pub struct Loopback {
    server: Arc<Server>,
    handler: Arc<dyn TransferHandler>,
}

impl Loopback {
    pub fn new(server: Arc<Server>, handler: Arc<dyn TransferHandler>) -> Self {
        Self { server, handler }
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }
}

impl Transport for Loopback {
    fn deliver(&self, _transfer_id: &TransferId, _location: &str, request: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        Ok(self.server.receive(&request, self.handler.as_ref())?)
    }
}
