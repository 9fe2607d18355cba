//! [BackingStore] implementation using POSIX I/O.

use metrics::{counter, histogram};
use std::{
    fs::{remove_file, File, OpenOptions},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    time::Instant,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::metrics::{
    describe_store_metrics, READS_FAILED, READS_SUCCESS, READ_LATENCY, TOTAL_BYTES_READ,
    TOTAL_BYTES_WRITTEN, WRITES_FAILED, WRITES_SUCCESS, WRITE_LATENCY,
};
use crate::{BackingStore, StorageError, STORE_FILE_EXTENSION};

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => return Err(std::io::ErrorKind::UnexpectedEof.into()),
            n => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset)? {
            0 => return Err(std::io::ErrorKind::WriteZero.into()),
            n => {
                buf = &buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

struct DeleteOnDrop {
    path: Option<PathBuf>,
    keep: AtomicBool,
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            if !self.keep.load(Ordering::Relaxed) {
                if let Err(e) = remove_file(path) {
                    warn!("Unable to delete file {:?}: {:?}", path, e);
                }
            }
        }
    }
}

/// A container file accessed with positional reads and writes.
///
/// Appends are serialized by a mutex around the current end of file; reads
/// and in-place rewrites go straight to the file.
pub struct FileStore {
    file: File,
    drop: DeleteOnDrop,
    end: Mutex<u64>,
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("path", &self.drop.path)
            .field("end", &*self.end.lock().unwrap())
            .finish()
    }
}

impl FileStore {
    fn with_file(file: File, path: Option<PathBuf>, keep: bool) -> Result<Self, StorageError> {
        describe_store_metrics();
        let end = file.metadata()?.len();
        Ok(Self {
            file,
            drop: DeleteOnDrop {
                path,
                keep: AtomicBool::new(keep),
            },
            end: Mutex::new(end),
        })
    }

    /// Creates (or truncates) the container at `path`.  The file is kept when
    /// the store is dropped.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        debug!("created store {}", path.display());
        Self::with_file(file, Some(path), true)
    }

    /// Creates a new container in `dir` with a generated name.  The file is
    /// deleted when the store is dropped unless [`FileStore::keep`] is called.
    pub fn create_in<P: AsRef<Path>>(dir: P) -> Result<Self, StorageError> {
        let name = format!("{}{}", Uuid::now_v7(), STORE_FILE_EXTENSION);
        let path = dir.as_ref().join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        Self::with_file(file, Some(path), false)
    }

    /// Opens an existing container for reading and writing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Self::with_file(file, Some(path), true)
    }

    /// Creates an anonymous container that disappears with the store.
    pub fn temporary() -> Result<Self, StorageError> {
        Self::with_file(tempfile::tempfile()?, None, false)
    }

    /// Returns the container's path, if it has one.
    pub fn path(&self) -> Option<&Path> {
        self.drop.path.as_deref()
    }

    /// Keeps the file when the store is dropped.
    pub fn keep(&self) {
        self.drop.keep.store(true, Ordering::Relaxed);
    }
}

impl BackingStore for FileStore {
    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, StorageError> {
        let size = *self.end.lock().unwrap();
        if offset.checked_add(len as u64).is_none_or(|end| end > size) {
            counter!(READS_FAILED).increment(1);
            return Err(StorageError::ShortRead { offset, len, size });
        }

        let start = Instant::now();
        let mut buffer = vec![0; len];
        match read_exact_at(&self.file, &mut buffer, offset) {
            Ok(()) => {
                counter!(TOTAL_BYTES_READ).increment(len as u64);
                counter!(READS_SUCCESS).increment(1);
                histogram!(READ_LATENCY).record(start.elapsed().as_secs_f64());
                Ok(buffer)
            }
            Err(e) => {
                counter!(READS_FAILED).increment(1);
                Err(e.into())
            }
        }
    }

    fn append(&self, bytes: &[u8]) -> Result<u64, StorageError> {
        let mut end = self.end.lock().unwrap();
        let offset = *end;
        let start = Instant::now();
        if let Err(e) = write_all_at(&self.file, bytes, offset) {
            counter!(WRITES_FAILED).increment(1);
            return Err(e.into());
        }
        *end += bytes.len() as u64;

        counter!(TOTAL_BYTES_WRITTEN).increment(bytes.len() as u64);
        counter!(WRITES_SUCCESS).increment(1);
        histogram!(WRITE_LATENCY).record(start.elapsed().as_secs_f64());
        Ok(offset)
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<(), StorageError> {
        let size = *self.end.lock().unwrap();
        if offset
            .checked_add(bytes.len() as u64)
            .is_none_or(|end| end > size)
        {
            counter!(WRITES_FAILED).increment(1);
            return Err(StorageError::WriteOutOfRange {
                offset,
                len: bytes.len(),
                size,
            });
        }

        let start = Instant::now();
        match write_all_at(&self.file, bytes, offset) {
            Ok(()) => {
                counter!(TOTAL_BYTES_WRITTEN).increment(bytes.len() as u64);
                counter!(WRITES_SUCCESS).increment(1);
                histogram!(WRITE_LATENCY).record(start.elapsed().as_secs_f64());
                Ok(())
            }
            Err(e) => {
                counter!(WRITES_FAILED).increment(1);
                Err(e.into())
            }
        }
    }

    fn size(&self) -> Result<u64, StorageError> {
        Ok(*self.end.lock().unwrap())
    }

    fn sync(&self) -> Result<(), StorageError> {
        self.file.sync_all()?;
        Ok(())
    }
}
