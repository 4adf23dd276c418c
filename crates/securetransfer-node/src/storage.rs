use anyhow::{Context, Result, bail};
use securetransfer_protocol::{ProtocolError, TransferHandler};
use securetransfer_types::TransferId;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// On-disk file storage behind the protocol server.
///
/// Completed files live at `{dir}/{location}`. Uploads in progress are
/// written to `{dir}/.incoming/{transfer_id}.part`, pre-sized to the
/// declared length, and renamed into place once the content hash matches.
pub struct DiskStorage {
    dir: PathBuf,
}

impl DiskStorage {
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(dir.join(".incoming"))?;
        info!("File storage directory: {}", dir.display());
        Ok(Self { dir })
    }

    /// Resolve a protocol location to a path inside the storage directory.
    /// Absolute paths and `..` components are rejected.
    pub fn resolve(&self, location: &str) -> Result<PathBuf> {
        let relative = Path::new(location);
        if location.is_empty() || location.starts_with('.') {
            bail!("Invalid location: {:?}", location);
        }
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                _ => bail!("Invalid location: {:?}", location),
            }
        }
        Ok(self.dir.join(relative))
    }

    /// Path of the partial file for an upload in progress.
    pub fn part_path(&self, transfer_id: &TransferId) -> PathBuf {
        self.dir.join(".incoming").join(format!("{transfer_id}.part"))
    }

    /// Remove the partial file of an abandoned upload.
    pub fn discard_partial(&self, transfer_id: &TransferId) -> Result<()> {
        match fs::remove_file(self.part_path(transfer_id)) {
            Ok(()) => {
                info!("Discarded partial upload {}", transfer_id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// SHA-256 of a file, streamed in 4 MB reads.
    fn hash_file(path: &Path) -> Result<[u8; 32]> {
        let mut file = fs::File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 4 * 1024 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize().into())
    }
}

impl TransferHandler for DiskStorage {
    fn begin_transfer(&self, id: &TransferId, location: &str, total_length: u64) -> Result<()> {
        self.resolve(location)?;
        let file = fs::File::create(self.part_path(id))?;
        file.set_len(total_length)?;
        debug!("Receiving {} ({} bytes) as {}", location, total_length, id);
        Ok(())
    }

    fn bytes_received(
        &self,
        id: &TransferId,
        _location: &str,
        _total_length: u64,
        offset: u64,
        bytes: &[u8],
    ) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(self.part_path(id))
            .with_context(|| format!("No upload in progress for {id}"))?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        Ok(())
    }

    fn complete_transfer(
        &self,
        id: &TransferId,
        location: &str,
        _total_length: u64,
        content_hash: &[u8; 32],
    ) -> Result<()> {
        let part = self.part_path(id);
        let actual = Self::hash_file(&part)?;
        if actual != *content_hash {
            self.discard_partial(id)?;
            bail!(
                "Content hash mismatch: expected {}, got {}",
                hex::encode(content_hash),
                hex::encode(actual)
            );
        }

        let target = self.resolve(location)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&part, &target)?;
        info!("Stored {} (sha256 {})", location, hex::encode(actual));
        Ok(())
    }

    fn download_bytes(
        &self,
        _id: &TransferId,
        location: &str,
        offset: u64,
        length: usize,
    ) -> Result<(u64, Vec<u8>)> {
        let path = self.resolve(location)?;
        let mut file = fs::File::open(&path).with_context(|| format!("No such file: {location}"))?;
        let total = file.metadata()?.len();
        let mut buf = vec![0u8; length];
        if length > 0 {
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buf)?;
        }
        Ok((total, buf))
    }

    fn error_raised(&self, id: Option<&TransferId>, error: &ProtocolError) {
        match id {
            Some(id) => warn!("Rejected message for transfer {}: {}", id, error),
            None => warn!("Rejected message: {}", error),
        }
    }
}
