use std::ffi::{CStr, NulError};
use std::fmt;
use std::io;
use std::os::raw::c_int;
use std::panic::Location;
use std::result;

use lmdb_sys as ffi;
use thiserror::Error as ThisError;

pub type Result<T> = result::Result<T, Error>;

/// Kind of failure reported by the engine or by this crate.
///
/// The engine variants map one-to-one onto LMDB return codes; see
/// [`ErrorKind::from_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ThisError)]
pub enum ErrorKind {
    #[error("key/data pair already exists")]
    KeyExist,
    #[error("no matching key/data pair found")]
    NotFound,
    #[error("requested page not found")]
    PageNotFound,
    #[error("database file is corrupted")]
    Corrupted,
    #[error("update of meta page failed or environment had fatal error")]
    Panic,
    #[error("database version mismatch")]
    VersionMismatch,
    #[error("file is not a valid LMDB file")]
    Invalid,
    #[error("environment mapsize limit reached")]
    MapFull,
    #[error("environment maxdbs limit reached")]
    DbsFull,
    #[error("environment maxreaders limit reached")]
    ReadersFull,
    #[error("thread-local storage keys full")]
    TlsFull,
    #[error("transaction has too many dirty pages")]
    TxnFull,
    #[error("too many open cursors")]
    CursorFull,
    #[error("page has not enough space")]
    PageFull,
    #[error("database contents grew beyond environment mapsize")]
    MapResized,
    #[error("operation and database are incompatible")]
    Incompatible,
    #[error("invalid reuse of reader locktable slot")]
    BadRslot,
    #[error("transaction must abort, has a child, or is invalid")]
    BadTxn,
    #[error("unsupported size of key/database name/data")]
    BadValSize,
    #[error("the database handle is invalid or was changed unexpectedly")]
    BadDbi,
    #[error("the environment has been previously closed or never opened")]
    EnvNotOpen,
    #[error("invalid environment path")]
    InvalidPath,
    #[error("I/O error")]
    Io,
    #[error("value compression failed")]
    Codec,
    #[error("the LMDB operation failed")]
    Operation,
}

impl ErrorKind {
    /// Maps an LMDB return code onto its kind.
    pub fn from_code(code: c_int) -> ErrorKind {
        match code {
            -30799 => ErrorKind::KeyExist,
            -30798 => ErrorKind::NotFound,
            -30797 => ErrorKind::PageNotFound,
            -30796 => ErrorKind::Corrupted,
            -30795 => ErrorKind::Panic,
            -30794 => ErrorKind::VersionMismatch,
            -30793 => ErrorKind::Invalid,
            -30792 => ErrorKind::MapFull,
            -30791 => ErrorKind::DbsFull,
            -30790 => ErrorKind::ReadersFull,
            -30789 => ErrorKind::TlsFull,
            -30788 => ErrorKind::TxnFull,
            -30787 => ErrorKind::CursorFull,
            -30786 => ErrorKind::PageFull,
            -30785 => ErrorKind::MapResized,
            -30784 => ErrorKind::Incompatible,
            -30783 => ErrorKind::BadRslot,
            -30782 => ErrorKind::BadTxn,
            -30781 => ErrorKind::BadValSize,
            -30780 => ErrorKind::BadDbi,
            _ => ErrorKind::Operation,
        }
    }
}

/// An error with its kind, an optional custom message and the place it was raised.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    code: Option<c_int>,
    message: Option<String>,
    location: Option<&'static Location<'static>>,
}

impl Error {
    #[track_caller]
    pub fn new(kind: ErrorKind) -> Error {
        Error {
            kind,
            code: None,
            message: None,
            location: Some(Location::caller()),
        }
    }

    #[track_caller]
    pub fn with_message(kind: ErrorKind, message: impl Into<String>) -> Error {
        Error {
            kind,
            code: None,
            message: Some(message.into()),
            location: Some(Location::caller()),
        }
    }

    /// Builds an error from a non-zero LMDB return code.
    ///
    /// Codes without a dedicated kind keep the engine's own description.
    #[track_caller]
    pub fn from_code(code: c_int) -> Error {
        let kind = ErrorKind::from_code(code);
        let message = match kind {
            ErrorKind::Operation => Some(strerror(code)),
            _ => None,
        };
        Error {
            kind,
            code: Some(code),
            message,
            location: Some(Location::caller()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The raw engine return code, if the error came from the engine.
    pub fn code(&self) -> Option<c_int> {
        self.code
    }

    pub fn file_name(&self) -> Option<&'static str> {
        self.location.map(|l| l.file())
    }

    pub fn line(&self) -> Option<u32> {
        self.location.map(|l| l.line())
    }

    /// Custom message if one was given, otherwise the kind's description.
    pub fn message(&self) -> String {
        match &self.message {
            Some(message) => message.clone(),
            None => self.kind.to_string(),
        }
    }

    /// Map-full or transaction-full: conditions a larger map can resolve.
    pub fn is_capacity(&self) -> bool {
        matches!(self.kind, ErrorKind::MapFull | ErrorKind::TxnFull)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }
}

impl PartialEq<ErrorKind> for Error {
    fn eq(&self, other: &ErrorKind) -> bool {
        self.kind == *other
    }
}

impl From<ErrorKind> for Error {
    #[track_caller]
    fn from(kind: ErrorKind) -> Error {
        Error::new(kind)
    }
}

impl From<c_int> for Error {
    #[track_caller]
    fn from(code: c_int) -> Error {
        Error::from_code(code)
    }
}

impl From<io::Error> for Error {
    #[track_caller]
    fn from(err: io::Error) -> Error {
        Error::with_message(ErrorKind::Io, err.to_string())
    }
}

impl From<NulError> for Error {
    #[track_caller]
    fn from(err: NulError) -> Error {
        Error::with_message(ErrorKind::BadValSize, err.to_string())
    }
}

/// Zero is success, anything else an engine error.
pub(crate) trait IntoResult {
    fn into_result(self) -> Result<()>;
}

impl IntoResult for c_int {
    #[track_caller]
    fn into_result(self) -> Result<()> {
        if self == 0 {
            Ok(())
        } else {
            Err(Error::from_code(self))
        }
    }
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())?;
        if let Some(code) = self.code {
            write!(f, " (code {})", code)?;
        }
        if let Some(location) = self.location {
            write!(f, " at {}:{}", location.file(), location.line())?;
        }
        Ok(())
    }
}

fn strerror(code: c_int) -> String {
    // mdb_strerror returns a pointer to a static or thread-local buffer
    unsafe {
        let ptr = ffi::mdb_strerror(code);
        if ptr.is_null() {
            return format!("unknown error code {}", code);
        }
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_codes_map_to_kinds() {
        assert_eq!(ErrorKind::from_code(-30798), ErrorKind::NotFound);
        assert_eq!(ErrorKind::from_code(-30792), ErrorKind::MapFull);
        assert_eq!(ErrorKind::from_code(-30788), ErrorKind::TxnFull);
        assert_eq!(ErrorKind::from_code(-30782), ErrorKind::BadTxn);
        assert_eq!(ErrorKind::from_code(-30785), ErrorKind::MapResized);
        assert_eq!(ErrorKind::from_code(22), ErrorKind::Operation);
    }

    #[test]
    fn test_capacity_errors() {
        assert!(Error::from_code(-30792).is_capacity());
        assert!(Error::from_code(-30788).is_capacity());
        assert!(!Error::from_code(-30798).is_capacity());
        assert!(!Error::new(ErrorKind::Operation).is_capacity());
    }

    #[test]
    fn test_error_records_location() {
        let err = Error::new(ErrorKind::BadTxn);
        assert_eq!(err.file_name(), Some(file!()));
        assert!(err.line().is_some());

        let err: Result<()> = (-30798 as c_int).into_result();
        let err = err.unwrap_err();
        assert_eq!(err.file_name(), Some(file!()));
        assert_eq!(err.code(), Some(-30798));
    }

    #[test]
    fn test_custom_message_overrides_default() {
        let err = Error::new(ErrorKind::NotFound);
        assert_eq!(err.message(), "no matching key/data pair found");

        let err = Error::with_message(ErrorKind::Operation, "map is busy");
        assert_eq!(err.message(), "map is busy");
        assert!(err.to_string().starts_with("map is busy"));
    }

    #[test]
    fn test_unknown_codes_keep_engine_text() {
        // EINVAL
        let err = Error::from_code(22);
        assert_eq!(err.kind(), ErrorKind::Operation);
        assert!(!err.message().is_empty());
        assert_ne!(err.message(), ErrorKind::Operation.to_string());
    }
}
