//! Cache and sync error types, with their POSIX errno mapping.

/// Main error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no such file or directory")]
    NotFound,
    #[error("file already exists")]
    AlreadyExists,
    #[error("file not writeable")]
    NotWriteable,
    #[error("file not readable")]
    NotReadable,
    #[error("operation on a closed handle")]
    BadHandle,
    #[error("permission denied")]
    Denied,
    #[error("unsupported flag: {0}")]
    Unsupported(&'static str),
    #[error("item is a directory")]
    IsDirectory,
    #[error("item is a file")]
    NotDirectory,
    #[error("remote I/O error: {0}")]
    RemoteIo(String),
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("framed file error: {0}")]
    Framed(#[from] FramedError),
    #[error("block error: {0}")]
    Block(#[from] BlockError),
    #[error("coordination error: {0}")]
    State(#[from] StateError),
    #[error("invalid cached metadata")]
    InvalidMetadata,
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}

impl Error {
    /// Negated errno for the POSIX operation surface.
    ///
    /// Anything without a specific mapping collapses to `EIO`.
    pub fn errno(&self) -> i32 {
        let e = match self {
            Error::NotFound => libc::ENOENT,
            Error::AlreadyExists => libc::EEXIST,
            Error::NotWriteable | Error::BadHandle => libc::EBADF,
            Error::NotReadable | Error::Denied => libc::EACCES,
            Error::Unsupported(_) => libc::ENOTSUP,
            Error::IsDirectory => libc::EISDIR,
            Error::NotDirectory => libc::ENOTDIR,
            Error::RemoteIo(_) => libc::EREMOTEIO,
            Error::Invalid(_) | Error::Block(BlockError::ZeroBlockSize) => libc::EINVAL,
            _ => libc::EIO,
        };
        -e
    }
}

impl From<serde_json::Error> for Error {
    fn from(_: serde_json::Error) -> Self {
        Error::InvalidMetadata
    }
}

/// Framed cache file error.
#[derive(thiserror::Error, Debug)]
pub enum FramedError {
    #[error("invalid header")]
    InvalidHeader,
    #[error("block size mismatch: expected {expected}, found {found}")]
    BlockSizeMismatch { expected: u32, found: u32 },
    #[error("file is read-only")]
    ReadOnly,
    #[error("read failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Block storage and block cache error.
#[derive(thiserror::Error, Debug)]
pub enum BlockError {
    #[error("block size must be nonzero")]
    ZeroBlockSize,
    #[error("block {0} not allocated")]
    NotAllocated(u64),
    #[error("data block exceeds block size")]
    Oversized,
    #[error("corrupted block map data")]
    CorruptedMap,
    #[error("invalid block storage state")]
    InvalidState,
    #[error("framed file error: {0}")]
    Framed(#[from] FramedError),
}

/// Durable and ephemeral coordination store error.
#[derive(thiserror::Error, Debug)]
pub enum StateError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("unknown process state {0}")]
    UnknownState(i64),
    #[error("inode {0} not found")]
    InodeNotFound(i64),
    #[error("sync ownership conflict: {0}")]
    OwnershipConflict(String),
    #[error("sync startup timed out")]
    StartupTimeout,
}
