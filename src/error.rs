use std::io;
use std::sync::PoisonError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    // Navigation and domain conditions
    NotFound,
    WrongPath,
    NotMap,
    NotArray,
    NotData,
    IndexOutOfBounds,
    ArrayEmpty,
    AlreadyExists,

    // Transactions
    TransactionInProgress,
    Poisoned,
    LockPoisoned,

    // Storage
    InvalidChunk(String),
    ChunkTooLarge(usize),
    TruncatedLog(String),
    Corruption(String),
    Io(io::Error),
    Locked(io::Error),
    InvalidInput(String),
}

impl Error {
    /// Expected conditions that never poison a transaction.
    pub fn is_domain(&self) -> bool {
        matches!(
            self,
            Error::NotFound
                | Error::WrongPath
                | Error::NotMap
                | Error::NotArray
                | Error::NotData
                | Error::IndexOutOfBounds
                | Error::ArrayEmpty
                | Error::AlreadyExists
        )
    }

    /// Errors after which the database refuses further writes.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Corruption(_) | Error::InvalidChunk(_) | Error::TruncatedLog(_)
        )
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        // Unwrap errors that crossed an io::Write or io::Read boundary.
        if err.get_ref().is_some_and(|inner| inner.is::<Error>()) {
            if let Some(Ok(inner)) = err.into_inner().map(|inner| inner.downcast::<Error>()) {
                return *inner;
            }
            return Error::Corruption("lost wrapped error".to_string());
        }
        Error::Io(err)
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(err) => err,
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::LockPoisoned
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NotFound => write!(f, "Not found"),
            Error::WrongPath => write!(f, "Path does not lead through maps and arrays"),
            Error::NotMap => write!(f, "Entity is not a map"),
            Error::NotArray => write!(f, "Entity is not an array"),
            Error::NotData => write!(f, "Entity is not data"),
            Error::IndexOutOfBounds => write!(f, "Array index out of bounds"),
            Error::ArrayEmpty => write!(f, "Array is empty"),
            Error::AlreadyExists => write!(f, "Entity already exists"),
            Error::TransactionInProgress => write!(f, "Another write transaction is in progress"),
            Error::Poisoned => write!(f, "Database refuses writes after a fatal error"),
            Error::LockPoisoned => write!(f, "Mutex was poisoned"),
            Error::InvalidChunk(msg) => write!(f, "Invalid chunk: {}", msg),
            Error::ChunkTooLarge(len) => write!(f, "Chunk of {} bytes does not fit a segment", len),
            Error::TruncatedLog(msg) => write!(f, "Truncated log: {}", msg),
            Error::Corruption(msg) => write!(f, "Corruption: {}", msg),
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::Locked(err) => write!(f, "Database directory is locked: {}", err),
            Error::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) | Error::Locked(err) => Some(err),
            _ => None,
        }
    }
}
