//! File system backed by `std::fs`.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::{FileSystem, OpenMode, StoreChannel, read_only_error};

/// The operating system's file system.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFileSystem;

impl DefaultFileSystem {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl FileSystem for DefaultFileSystem {
    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<Box<dyn StoreChannel>> {
        let file = match mode {
            OpenMode::Read => OpenOptions::new().read(true).open(path)?,
            OpenMode::ReadWrite => OpenOptions::new().read(true).write(true).open(path)?,
            OpenMode::Create => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?,
        };
        Ok(Box::new(FileChannel {
            file,
            path: path.to_path_buf(),
            writable: mode.is_writable(),
        }))
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn delete_file(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn file_size(&self, path: &Path) -> io::Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }
}

#[derive(Debug)]
struct FileChannel {
    file: File,
    path: PathBuf,
    writable: bool,
}

impl StoreChannel for FileChannel {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
        if !self.writable {
            return Err(read_only_error(&self.path));
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        if !self.writable {
            return Err(read_only_error(&self.path));
        }
        self.file.set_len(len)
    }

    fn size(&mut self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn force(&mut self) -> io::Result<()> {
        if self.writable {
            self.file.sync_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_then_read_back() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("data.bin");
        let fs = DefaultFileSystem::new();

        let mut channel = fs.open(&path, OpenMode::Create).expect("create");
        channel.write_all_at(b"hello", 10).expect("write");
        channel.force().expect("force");
        assert_eq!(channel.size().expect("size"), 15);

        let mut buf = [0xFFu8; 15];
        let n = channel.read_at(&mut buf, 0).expect("read");
        assert_eq!(n, 15);
        assert_eq!(&buf[..10], &[0u8; 10]);
        assert_eq!(&buf[10..], b"hello");
        assert!(fs.exists(&path));
        assert_eq!(fs.file_size(&path).expect("file size"), 15);
    }

    #[test]
    fn test_short_read_at_end_of_file() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("short.bin");
        let fs = DefaultFileSystem::new();

        let mut channel = fs.open(&path, OpenMode::Create).expect("create");
        channel.write_all_at(&[1, 2, 3], 0).expect("write");

        let mut buf = [0u8; 8];
        assert_eq!(channel.read_at(&mut buf, 1).expect("read"), 2);
        assert_eq!(channel.read_at(&mut buf, 100).expect("read"), 0);
    }

    #[test]
    fn test_read_only_channel_rejects_writes() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("ro.bin");
        let fs = DefaultFileSystem::new();
        drop(fs.open(&path, OpenMode::Create).expect("create"));

        let mut channel = fs.open(&path, OpenMode::Read).expect("open");
        let err = channel.write_all_at(b"x", 0).expect_err("should fail");
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_opening_missing_file_fails() {
        let dir = tempdir().expect("create temp dir");
        let fs = DefaultFileSystem::new();
        let err = fs
            .open(&dir.path().join("missing"), OpenMode::ReadWrite)
            .expect_err("should fail");
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
