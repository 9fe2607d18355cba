use std::io::ErrorKind;
use thiserror::Error;

/// An error that can occur when using a backing store.
///
/// The variants carry plain data (an [`ErrorKind`] rather than a
/// [`std::io::Error`]) so that the error can be cloned and handed to every
/// caller that observed the same failed transfer.
#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum StorageError {
    /// I/O error.
    #[error("{0}")]
    StdIo(ErrorKind),

    /// Read ended before the full request length.
    #[error("Read of {len} bytes at offset {offset} extends past the end of the store ({size} bytes).")]
    ShortRead { offset: u64, len: usize, size: u64 },

    /// An in-place write would extend past the end of the store.
    ///
    /// In-place writes only ever rewrite a region that was previously
    /// appended; growing the store goes through `append`.
    #[error("In-place write of {len} bytes at offset {offset} extends past the end of the store ({size} bytes).")]
    WriteOutOfRange { offset: u64, len: usize, size: u64 },

    /// CRC32C checksum verification failed.
    #[error("Checksum mismatch: expected {expected:#x}, found {found:#x}.")]
    ChecksumMismatch { expected: u32, found: u32 },

    /// A block did not start with the expected magic number.
    #[error("Invalid magic: expected {expected:?}, found {found:?}.")]
    InvalidMagic { expected: [u8; 4], found: [u8; 4] },

    /// A block belongs to a different owner than the one reading it.
    #[error("Block owner mismatch: expected box {expected}, found box {found}.")]
    OwnerMismatch { expected: u64, found: u64 },

    /// The store contents could not be interpreted.
    #[error("Corrupt store: {0}")]
    Corrupt(String),
}

impl From<std::io::Error> for StorageError {
    fn from(value: std::io::Error) -> Self {
        Self::StdIo(value.kind())
    }
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::StdIo(kind) => *kind,
            StorageError::ShortRead { .. } => ErrorKind::UnexpectedEof,
            StorageError::WriteOutOfRange { .. } => ErrorKind::InvalidInput,
            StorageError::ChecksumMismatch { .. }
            | StorageError::InvalidMagic { .. }
            | StorageError::OwnerMismatch { .. }
            | StorageError::Corrupt(_) => ErrorKind::InvalidData,
        }
    }

    /// Whether the error indicates that the stored bytes themselves are bad,
    /// as opposed to the transfer failing.
    pub fn is_corruption(&self) -> bool {
        self.kind() == ErrorKind::InvalidData
    }
}
