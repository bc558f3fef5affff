use crate::http::Status;
use std::io;
use thiserror::Error;

/// Main error type for the server
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    /// A header, cookie or status mutation was attempted after the
    /// response head went out on the wire.
    #[error("Cannot {0}: response headers already sent")]
    HeadersSent(&'static str),

    /// A header or cookie would have broken the response framing
    #[error("Invalid header {0:?}")]
    InvalidHeader(String),

    /// Raised by a resource to have the connection render the canned page
    /// for this status.
    #[error("Request failed with status {0}")]
    Status(Status),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Failure while reading a single request off the wire.
///
/// Every variant except `NoRequest` and `Io` maps to the status code the
/// connection answers with before closing.
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("no request received")]
    NoRequest,

    #[error("bad method: {0}")]
    BadMethod(String),

    #[error("malformed request line: {0}")]
    BadRequestLine(String),

    #[error("malformed header line: {0}")]
    BadHeader(String),

    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("content-length required")]
    LengthRequired,

    #[error("invalid content-length: {0}")]
    BadContentLength(String),

    #[error("body of {length} bytes exceeds the {limit} byte limit")]
    BodyTooLarge { length: u64, limit: u64 },

    #[error("invalid multipart boundary: {0}")]
    BadBoundary(String),

    #[error("malformed multipart body: {0}")]
    BadMultipart(String),

    #[error("request body truncated")]
    Truncated,

    #[error("IO error: {0}")]
    Io(io::Error),
}

impl RequestError {
    /// The status to answer with, or `None` when nothing should be sent.
    pub fn status(&self) -> Option<Status> {
        match self {
            RequestError::NoRequest | RequestError::Io(_) => None,
            RequestError::BadMethod(_) => Some(Status::MethodNotAllowed),
            RequestError::LengthRequired => Some(Status::LengthRequired),
            RequestError::BadRequestLine(_)
            | RequestError::BadHeader(_)
            | RequestError::LineTooLong(_)
            | RequestError::BadContentLength(_)
            | RequestError::BodyTooLarge { .. }
            | RequestError::BadBoundary(_)
            | RequestError::BadMultipart(_)
            | RequestError::Truncated => Some(Status::BadRequest),
        }
    }
}

impl From<io::Error> for RequestError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => RequestError::Truncated,
            _ => RequestError::Io(err),
        }
    }
}
