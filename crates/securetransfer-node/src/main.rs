mod cleanup;
mod config;
mod storage;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use securetransfer_crypto::KeyPair;
use securetransfer_db::SqliteSessionStore;
use securetransfer_protocol::{Client, Loopback, Server, TracingLogger, TransferHandler};

use crate::config::NodeConfig;
use crate::storage::DiskStorage;

const USAGE: &str = "usage:
  securetransfer keygen
  securetransfer upload <file> <location>
  securetransfer download <location> <file>
  securetransfer sweep";

#[derive(Serialize)]
struct KeygenOutput {
    key_pair: String,
    public_key: String,
}

#[derive(Serialize)]
struct TransferSummary {
    direction: &'static str,
    location: String,
    path: PathBuf,
    completed: bool,
    bytes: u64,
    sha256: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "securetransfer=info,securetransfer_protocol=info,securetransfer_db=info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command: Vec<&str> = args.iter().map(String::as_str).collect();

    match command.as_slice() {
        ["keygen"] => {
            let keys = KeyPair::generate();
            let output = KeygenOutput {
                key_pair: keys.to_base64(),
                public_key: keys.public_key().to_base64(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        ["upload", file, location] => {
            let node = Node::start(NodeConfig::from_env()?)?;
            let summary = node.upload(PathBuf::from(file), location.to_string()).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        ["download", location, file] => {
            let node = Node::start(NodeConfig::from_env()?)?;
            let summary = node.download(location.to_string(), PathBuf::from(file)).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        ["sweep"] => {
            let config = NodeConfig::from_env()?;
            let store = SqliteSessionStore::open(&config.db_path)?;
            let storage = DiskStorage::new(config.storage_dir.clone())?;
            let count = cleanup::cleanup_stale(&store, &storage, &config.server)?;
            info!("Evicted {} stale sessions", count);
            Ok(())
        }
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }
}

/// A server and a client wired together in one process over the loopback
/// transport, sharing the on-disk session store and file storage.
struct Node {
    client: Arc<Client>,
}

impl Node {
    fn start(config: NodeConfig) -> anyhow::Result<Self> {
        let store = Arc::new(SqliteSessionStore::open(&config.db_path)?);
        let storage = Arc::new(DiskStorage::new(config.storage_dir.clone())?);
        info!("Session database: {}", config.db_path.display());

        tokio::spawn(cleanup::run_cleanup_loop(
            store.clone(),
            storage.clone(),
            config.server.clone(),
            config.cleanup_interval,
        ));

        let server = Server::new(
            config.server,
            config.server_keys.clone(),
            config.client_keys.public_key(),
            store,
        )
        .with_logger(Arc::new(TracingLogger));
        let handler: Arc<dyn TransferHandler> = storage;
        let transport = Arc::new(Loopback::new(Arc::new(server), handler));

        let client = Client::new(
            config.client,
            config.client_keys,
            config.server_keys.public_key(),
            transport,
        )
        .with_logger(Arc::new(TracingLogger))
        .with_progress(|location, done, total| {
            tracing::debug!("{}: {}/{} bytes", location, done, total);
            Ok(())
        });
        let client = Arc::new(client);

        let abort = client.abort_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, aborting transfer");
                abort.abort();
            }
        });

        Ok(Self { client })
    }

    async fn upload(&self, path: PathBuf, location: String) -> anyhow::Result<TransferSummary> {
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<TransferSummary> {
            let file = std::fs::File::open(&path)
                .with_context(|| format!("Cannot open {}", path.display()))?;
            let length = file.metadata()?.len();
            let completed = client.upload(&location, length, file)?;
            Ok(TransferSummary {
                direction: "upload",
                sha256: completed.then(|| hash_file(&path)).transpose()?,
                location,
                path,
                completed,
                bytes: length,
            })
        })
        .await?
    }

    async fn download(&self, location: String, path: PathBuf) -> anyhow::Result<TransferSummary> {
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<TransferSummary> {
            let completed = client.download_to_path(&location, &path)?;
            if !completed {
                return Ok(TransferSummary {
                    direction: "download",
                    location,
                    path,
                    completed,
                    bytes: 0,
                    sha256: None,
                });
            }
            let bytes = std::fs::metadata(&path)?.len();
            Ok(TransferSummary {
                direction: "download",
                sha256: Some(hash_file(&path)?),
                location,
                path,
                completed,
                bytes,
            })
        })
        .await?
    }
}

fn hash_file(path: &Path) -> anyhow::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
