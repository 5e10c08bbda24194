//! File-backed collaborators: a read-only artifact source and a read-write
//! cache store over `std::fs::File`.

use std::fs::{File, OpenOptions};
#[cfg(target_family = "unix")]
use std::os::unix::fs::FileExt;
#[cfg(target_family = "windows")]
use std::os::windows::fs::FileExt;
use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use lacuna_cache::CacheStore;
use lacuna_core::{LacunaError, LacunaErrorKind, LacunaResult, RangeSource};

/// Read-only byte-range source over a local file.
pub struct FileRangeSource {
    file: File,
    size_bytes: u64,
}

impl FileRangeSource {
    pub fn open(path: impl AsRef<Path>) -> LacunaResult<Self> {
        debug!(path = %path.as_ref().display(), "opening file-backed source");
        let file = File::open(path).map_err(map_io_err("open file"))?;
        Self::from_file(file)
    }

    pub fn from_file(file: File) -> LacunaResult<Self> {
        let size_bytes = file.metadata().map_err(map_io_err("stat file"))?.len();
        debug!(size_bytes, "initialized file-backed source");
        Ok(Self { file, size_bytes })
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }
}

#[async_trait]
impl RangeSource for FileRangeSource {
    async fn total_len(&self) -> LacunaResult<u64> {
        Ok(self.size_bytes)
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> LacunaResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        read_file_at(&self.file, buf, offset).map_err(map_io_err("read file"))
    }
}

/// Read-write byte store over a local file, suitable as the cache backing of
/// a `CachedRangeSource`.
pub struct FileCacheStore {
    file: File,
}

impl FileCacheStore {
    /// Create or truncate the store file at `path`.
    pub fn create(path: impl AsRef<Path>) -> LacunaResult<Self> {
        debug!(path = %path.as_ref().display(), "creating file-backed store");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(map_io_err("create store file"))?;
        Ok(Self { file })
    }

    /// Open an existing store file, keeping its contents. Used on restart
    /// together with a seeded tracker.
    pub fn open(path: impl AsRef<Path>) -> LacunaResult<Self> {
        debug!(path = %path.as_ref().display(), "opening file-backed store");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(map_io_err("open store file"))?;
        Ok(Self { file })
    }
}

#[async_trait]
impl CacheStore for FileCacheStore {
    async fn read_at(&self, offset: u64, out: &mut [u8]) -> LacunaResult<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        read_file_at(&self.file, out, offset).map_err(map_io_err("read store file"))
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> LacunaResult<()> {
        write_file_at(&self.file, data, offset).map_err(map_io_err("write store file"))
    }

    async fn set_len(&self, len: u64) -> LacunaResult<()> {
        self.file.set_len(len).map_err(map_io_err("resize store file"))
    }

    async fn flush(&self) -> LacunaResult<()> {
        self.file.sync_data().map_err(map_io_err("sync store file"))
    }
}

#[cfg(target_family = "unix")]
fn read_file_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    file.read_at(buf, offset)
}

#[cfg(target_family = "windows")]
fn read_file_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    file.seek_read(buf, offset)
}

#[cfg(target_family = "unix")]
fn write_file_at(file: &File, data: &[u8], offset: u64) -> std::io::Result<()> {
    file.write_all_at(data, offset)
}

#[cfg(target_family = "windows")]
fn write_file_at(file: &File, mut data: &[u8], mut offset: u64) -> std::io::Result<()> {
    while !data.is_empty() {
        let written = file.seek_write(data, offset)?;
        data = &data[written..];
        offset += written as u64;
    }
    Ok(())
}

fn map_io_err(op: &'static str) -> impl FnOnce(std::io::Error) -> LacunaError {
    move |err| LacunaError::with_message(LacunaErrorKind::Io, format!("{op}: {err}"))
}
