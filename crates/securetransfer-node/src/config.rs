use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use securetransfer_crypto::KeyPair;
use securetransfer_types::{ClientConfig, ServerConfig};
use tracing::warn;

/// Everything the node reads from the environment.
pub struct NodeConfig {
    pub storage_dir: PathBuf,
    pub db_path: PathBuf,
    pub client_keys: KeyPair,
    pub server_keys: KeyPair,
    pub cleanup_interval: Duration,
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl NodeConfig {
    pub fn from_env() -> Result<Self> {
        let storage_dir: PathBuf = std::env::var("ST_STORAGE_DIR")
            .unwrap_or_else(|_| "./transfer-storage".into())
            .into();
        let db_path: PathBuf = std::env::var("ST_DB_PATH")
            .unwrap_or_else(|_| "securetransfer.db".into())
            .into();
        let cleanup_interval_secs: u64 = std::env::var("ST_CLEANUP_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);

        Ok(Self {
            storage_dir,
            db_path,
            client_keys: load_keys("ST_CLIENT_KEY")?,
            server_keys: load_keys("ST_SERVER_KEY")?,
            cleanup_interval: Duration::from_secs(cleanup_interval_secs.max(1)),
            server: ServerConfig::from_env(),
            client: ClientConfig::from_env(),
        })
    }
}

/// Base64 key pair from `var`, or a throwaway one if unset.
fn load_keys(var: &str) -> Result<KeyPair> {
    match std::env::var(var) {
        Ok(encoded) if !encoded.trim().is_empty() => {
            KeyPair::from_base64(&encoded).with_context(|| format!("{var} is not a valid key pair"))
        }
        _ => {
            warn!("{} is unset, using a generated key pair for this run", var);
            Ok(KeyPair::generate())
        }
    }
}
