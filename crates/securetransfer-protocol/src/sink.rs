/// Destinations for downloaded chunks.
///
/// Chunks complete in any order, so sinks take positional writes.

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

pub trait ChunkSink: Send + Sync {
    /// Write `bytes` at absolute `offset`.
    fn write_at(&self, offset: u64, bytes: &[u8]) -> io::Result<()>;

    /// Called once the total size is known, before any chunk is written.
    fn set_len(&self, _len: u64) -> io::Result<()> {
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

fn poisoned() -> io::Error {
    io::Error::other("sink lock poisoned")
}

/// Any seekable writer behind a mutex, e.g. a `Cursor<Vec<u8>>`.
impl<W: Write + Seek + Send> ChunkSink for Mutex<W> {
    fn write_at(&self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.lock().map_err(|_| poisoned())?;
        writer.seek(SeekFrom::Start(offset))?;
        writer.write_all(bytes)
    }

    fn flush(&self) -> io::Result<()> {
        self.lock().map_err(|_| poisoned())?.flush()
    }
}

/// File destination that pre-sizes itself to the transfer length.
pub struct FileSink {
    file: Mutex<File>,
}

impl FileSink {
    pub fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            file: Mutex::new(File::create(path)?),
        })
    }
}

impl ChunkSink for FileSink {
    fn write_at(&self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        ChunkSink::write_at(&self.file, offset, bytes)
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        self.file.lock().map_err(|_| poisoned())?.set_len(len)
    }

    fn flush(&self) -> io::Result<()> {
        let file = self.file.lock().map_err(|_| poisoned())?;
        file.sync_all()
    }
}

/// Growable in-memory destination.
#[derive(Default)]
pub struct MemorySink {
    data: Mutex<Vec<u8>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

impl ChunkSink for MemorySink {
    fn write_at(&self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        let mut data = self.data.lock().map_err(|_| poisoned())?;
        let start = offset as usize;
        let end = start + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        self.data.lock().map_err(|_| poisoned())?.resize(len as usize, 0);
        Ok(())
    }
}
