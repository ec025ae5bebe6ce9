//! Error types of the server crate.
//!
//! Each failure domain has its own enum. The ones that end up on the wire carry a
//! `status_code()` so the connection can turn them into an error response.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitStatus;

use http::StatusCode;
use thiserror::Error;

/// Problems with the configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config `{}`: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

impl ConfigError {
    pub fn invalid<S: ToString>(str: S) -> Self {
        Self::Invalid { reason: str.to_string() }
    }
}

/// Fatal errors of the server process.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("event loop io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

/// Failures while persisting an upload.
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("form field larger than {limit} bytes")]
    TooLargeField { limit: usize },

    #[error("no upload directory configured for this route")]
    NoUploadDir,

    #[error("upload directory `{}` is unusable: {source}", path.display())]
    UnusableUploadDir { path: PathBuf, source: io::Error },

    #[error("failed to write upload: {source}")]
    Write { source: io::Error },
}

impl UploadError {
    pub fn write(source: io::Error) -> Self {
        Self::Write { source }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            UploadError::TooLargeField { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            UploadError::NoUploadDir | UploadError::UnusableUploadDir { .. } | UploadError::Write { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Failures of a CGI request, before or after the child was spawned.
#[derive(Error, Debug)]
pub enum CgiError {
    #[error("script is outside of the cgi directory")]
    Forbidden,

    #[error("script not found")]
    NotFound,

    #[error("script is not readable: {source}")]
    Unreadable { source: io::Error },

    #[error("interpreter `{}` is not an executable file", path.display())]
    BadInterpreter { path: PathBuf },

    #[error("script is neither executable nor starts with a shebang")]
    NotExecutable,

    #[error("failed to spawn cgi process: {source}")]
    Spawn { source: io::Error },

    #[error("cgi process timed out")]
    Timeout,

    #[error("cgi output exceeds {limit} bytes")]
    OutputTooLarge { limit: u64 },

    #[error("cgi header block exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },

    #[error("malformed cgi header: {reason}")]
    MalformedHeader { reason: String },

    #[error("cgi process produced no output")]
    NoOutput,

    #[error("cgi output ended before the header block ({status:?})")]
    PrematureEof { status: Option<ExitStatus> },

    #[error("cgi output ended {missing} bytes short of its content-length")]
    TruncatedBody { missing: u64 },

    #[error("cgi pipe io error: {source}")]
    Io { source: io::Error },
}

impl CgiError {
    pub fn malformed_header<S: ToString>(str: S) -> Self {
        Self::MalformedHeader { reason: str.to_string() }
    }

    pub fn io(source: io::Error) -> Self {
        Self::Io { source }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            CgiError::Forbidden => StatusCode::FORBIDDEN,
            CgiError::NotFound => StatusCode::NOT_FOUND,
            CgiError::Unreadable { .. } | CgiError::BadInterpreter { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            CgiError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            CgiError::NotExecutable
            | CgiError::Spawn { .. }
            | CgiError::OutputTooLarge { .. }
            | CgiError::HeaderTooLarge { .. }
            | CgiError::MalformedHeader { .. }
            | CgiError::NoOutput
            | CgiError::PrematureEof { .. }
            | CgiError::TruncatedBody { .. }
            | CgiError::Io { .. } => StatusCode::BAD_GATEWAY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_statuses() {
        assert_eq!(UploadError::TooLargeField { limit: 1 }.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(UploadError::NoUploadDir.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(UploadError::write(io::ErrorKind::Other.into()).status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn cgi_statuses() {
        assert_eq!(CgiError::Forbidden.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(CgiError::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(CgiError::BadInterpreter { path: "/x".into() }.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(CgiError::NotExecutable.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(CgiError::Timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(CgiError::OutputTooLarge { limit: 1 }.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(CgiError::PrematureEof { status: None }.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn messages() {
        assert_eq!(ConfigError::invalid("no servers").to_string(), "invalid config: no servers");
        assert_eq!(CgiError::malformed_header("bad status").to_string(), "malformed cgi header: bad status");
    }
}
