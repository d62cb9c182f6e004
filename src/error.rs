use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type.
///
/// The first five variants form the control-plane taxonomy: their
/// [`name`](Error::name) is what goes into an error response frame.
/// Everything below them is an internal failure surfaced from the protocol
/// stack.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("malformed request: {0}")]
    TypeError(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("unsupported media: {0}")]
    UnsupportedMedia(String),

    #[error("transport not connected")]
    ErrTransportNotConnected,
    #[error("no selected ICE tuple")]
    ErrNoSelectedTuple,
    #[error("SRTP session not established")]
    ErrNoSrtpSession,
    #[error("DTLS transport already started")]
    ErrDtlsAlreadyStarted,
    #[error("certificate generation failed: {0}")]
    ErrCertificate(String),

    #[error("{0}")]
    Shared(#[from] shared::error::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Taxonomy name used in control-channel error responses.
    pub fn name(&self) -> &'static str {
        match self {
            Error::TypeError(_) => "TypeError",
            Error::InvalidState(_) => "InvalidStateError",
            Error::NotFound(_) => "NotFoundError",
            Error::AlreadyExists(_) => "AlreadyExistsError",
            Error::UnsupportedMedia(_) => "UnsupportedError",
            _ => "Error",
        }
    }
}
