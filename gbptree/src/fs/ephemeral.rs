//! In-memory file system for crash simulation.
//!
//! Every file keeps two images: the current content seen by reads, and the
//! durable content as of the last [`StoreChannel::force`]. [`EphemeralFileSystem::crash`]
//! throws away everything that was written but not forced, which is exactly
//! what a power loss does to a real file.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{FileSystem, OpenMode, StoreChannel, read_only_error};

#[derive(Debug, Default)]
struct EphemeralFile {
    content: Vec<u8>,
    durable: Vec<u8>,
}

/// Statistics about operations on an [`EphemeralFileSystem`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EphemeralStats {
    /// Number of write calls.
    pub writes: u64,
    /// Number of force (sync) calls.
    pub forces: u64,
    /// Number of simulated crashes.
    pub crashes: u64,
}

/// An in-memory file system.
#[derive(Debug, Default)]
pub struct EphemeralFileSystem {
    files: Mutex<HashMap<PathBuf, Arc<Mutex<EphemeralFile>>>>,
    dirs: Mutex<HashSet<PathBuf>>,
    stats: Arc<Mutex<EphemeralStats>>,
}

fn lock<T>(mutex: &Mutex<T>) -> io::Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| io::Error::other("ephemeral file system lock poisoned"))
}

impl EphemeralFileSystem {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a power loss: every file reverts to its last forced content.
    pub fn crash(&self) -> io::Result<()> {
        let files = lock(&self.files)?;
        for file in files.values() {
            let mut file = lock(file)?;
            file.content = file.durable.clone();
        }
        lock(&self.stats)?.crashes += 1;
        tracing::debug!(files = files.len(), "simulated crash");
        Ok(())
    }

    /// Flip every bit of the byte at `offset`, in both the current and the
    /// durable image.
    pub fn corrupt_byte(&self, path: &Path, offset: u64) -> io::Result<()> {
        let file = self.file(path)?;
        let mut file = lock(&file)?;
        let index = usize::try_from(offset).map_err(io::Error::other)?;
        if index >= file.content.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("offset {offset} is beyond the end of {}", path.display()),
            ));
        }
        file.content[index] ^= 0xFF;
        if let Some(byte) = file.durable.get_mut(index) {
            *byte ^= 0xFF;
        }
        Ok(())
    }

    /// Current content of a file.
    pub fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        let file = self.file(path)?;
        let content = lock(&file)?.content.clone();
        Ok(content)
    }

    /// Operation counters.
    pub fn stats(&self) -> io::Result<EphemeralStats> {
        Ok(*lock(&self.stats)?)
    }

    fn file(&self, path: &Path) -> io::Result<Arc<Mutex<EphemeralFile>>> {
        lock(&self.files)?
            .get(path)
            .map(Arc::clone)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} not found", path.display()),
                )
            })
    }
}

impl FileSystem for EphemeralFileSystem {
    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<Box<dyn StoreChannel>> {
        let file = match mode {
            OpenMode::Read | OpenMode::ReadWrite => self.file(path)?,
            OpenMode::Create => Arc::clone(
                lock(&self.files)?
                    .entry(path.to_path_buf())
                    .or_default(),
            ),
        };
        Ok(Box::new(EphemeralChannel {
            file,
            path: path.to_path_buf(),
            writable: mode.is_writable(),
            stats: Arc::clone(&self.stats),
        }))
    }

    fn exists(&self, path: &Path) -> bool {
        self.files
            .lock()
            .is_ok_and(|files| files.contains_key(path))
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        lock(&self.dirs)?.insert(path.to_path_buf());
        Ok(())
    }

    fn delete_file(&self, path: &Path) -> io::Result<()> {
        lock(&self.files)?.remove(path).map(|_| ()).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            )
        })
    }

    fn file_size(&self, path: &Path) -> io::Result<u64> {
        let file = self.file(path)?;
        let len = lock(&file)?.content.len();
        Ok(len as u64)
    }
}

#[derive(Debug)]
struct EphemeralChannel {
    file: Arc<Mutex<EphemeralFile>>,
    path: PathBuf,
    writable: bool,
    stats: Arc<Mutex<EphemeralStats>>,
}

impl StoreChannel for EphemeralChannel {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let file = lock(&self.file)?;
        let start = usize::try_from(offset).map_err(io::Error::other)?;
        if start >= file.content.len() {
            return Ok(0);
        }
        let n = buf.len().min(file.content.len() - start);
        buf[..n].copy_from_slice(&file.content[start..start + n]);
        Ok(n)
    }

    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
        if !self.writable {
            return Err(read_only_error(&self.path));
        }
        let start = usize::try_from(offset).map_err(io::Error::other)?;
        let end = start + buf.len();
        {
            let mut file = lock(&self.file)?;
            if file.content.len() < end {
                file.content.resize(end, 0);
            }
            file.content[start..end].copy_from_slice(buf);
        }
        lock(&self.stats)?.writes += 1;
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        if !self.writable {
            return Err(read_only_error(&self.path));
        }
        let len = usize::try_from(len).map_err(io::Error::other)?;
        lock(&self.file)?.content.resize(len, 0);
        Ok(())
    }

    fn size(&mut self) -> io::Result<u64> {
        Ok(lock(&self.file)?.content.len() as u64)
    }

    fn force(&mut self) -> io::Result<()> {
        {
            let mut file = lock(&self.file)?;
            file.durable = file.content.clone();
        }
        lock(&self.stats)?.forces += 1;
        Ok(())
    }
}
