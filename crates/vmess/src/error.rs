use std::io;

use common::PipeError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// No registered user accepts the auth id.
    #[error("no matching user for auth id")]
    NotFound,

    /// A valid auth id that was already seen inside the replay window.
    #[error("replayed auth id")]
    Replay,

    #[error("failed to open header length")]
    OpenLength,

    #[error("failed to open header payload")]
    OpenPayload,

    #[error("invalid request header: {0}")]
    InvalidHeader(String),

    #[error("header checksum mismatch")]
    Checksum,

    #[error("unsupported {0}")]
    Unsupported(String),

    #[error("response header does not match the request")]
    ResponseAuth,

    #[error("chunk authentication failed")]
    ChunkAuth,

    #[error("encryption failure")]
    Seal,
}

impl Error {
    /// Finds a VMess error carried inside an `io::Error`.
    pub fn from_io(e: &io::Error) -> Option<&Error> {
        e.get_ref().and_then(|inner| inner.downcast_ref::<Error>())
    }
}

impl From<PipeError> for Error {
    fn from(e: PipeError) -> Self {
        Error::Io(e.into())
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            Error::InvalidHeader(_) | Error::Checksum | Error::Unsupported(_) => {
                io::Error::new(io::ErrorKind::InvalidData, e)
            }
            e => io::Error::new(io::ErrorKind::PermissionDenied, e),
        }
    }
}
