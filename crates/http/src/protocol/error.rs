use http::StatusCode;
use std::io;
use thiserror::Error;

/// Errors raised while decoding a request head and deciding its framing.
///
/// Every variant maps onto the status code that should be answered to the
/// client, see [`ParseError::status_code`].
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("header size too large, current: {current_size} exceed the limit {max_size}")]
    TooLargeHeader { current_size: usize, max_size: usize },

    #[error("header line too long, current: {current_size} exceed the limit {max_size}")]
    TooLongLine { current_size: usize, max_size: usize },

    #[error("request line too long, current: {current_size} exceed the limit {max_size}")]
    TooLongUri { current_size: usize, max_size: usize },

    #[error("header number exceed the limit {max_num}")]
    TooManyHeaders { max_num: usize },

    #[error("invalid request line: {reason}")]
    InvalidRequestLine { reason: String },

    #[error("invalid http version: {0:?}")]
    InvalidVersion(Option<u8>),

    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    #[error("invalid http method")]
    InvalidMethod,

    #[error("invalid http uri")]
    InvalidUri,

    #[error("invalid content-length header: {reason}")]
    InvalidContentLength { reason: String },

    #[error("transfer-encoding and content-length both present in headers")]
    ConflictingFraming,

    #[error("unsupported transfer-encoding: {coding}")]
    UnsupportedTransferEncoding { coding: String },

    #[error("content-length or transfer-encoding required")]
    LengthRequired,

    #[error("declared body size {size} exceed the limit {limit}")]
    TooLargeBody { size: u64, limit: u64 },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn too_large_header(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHeader { current_size, max_size }
    }

    pub fn too_long_line(current_size: usize, max_size: usize) -> Self {
        Self::TooLongLine { current_size, max_size }
    }

    pub fn too_long_uri(current_size: usize, max_size: usize) -> Self {
        Self::TooLongUri { current_size, max_size }
    }

    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    pub fn invalid_request_line<S: ToString>(str: S) -> Self {
        Self::InvalidRequestLine { reason: str.to_string() }
    }

    pub fn invalid_header<S: ToString>(str: S) -> Self {
        Self::InvalidHeader { reason: str.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(str: S) -> Self {
        Self::InvalidContentLength { reason: str.to_string() }
    }

    pub fn unsupported_transfer_encoding<S: ToString>(str: S) -> Self {
        Self::UnsupportedTransferEncoding { coding: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }

    /// The status code answered to the client for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::TooLargeHeader { .. } | Self::TooLongLine { .. } | Self::TooManyHeaders { .. } => {
                StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
            }
            Self::TooLongUri { .. } => StatusCode::URI_TOO_LONG,
            Self::UnsupportedTransferEncoding { .. } => StatusCode::NOT_IMPLEMENTED,
            Self::LengthRequired => StatusCode::LENGTH_REQUIRED,
            Self::TooLargeBody { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// Errors raised by the chunked transfer-coding decoder.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkedError {
    #[error("malformed chunked body: {reason}")]
    Malformed { reason: &'static str },

    #[error("chunked body exceed the limit {limit}")]
    TooLarge { limit: u64 },
}

impl ChunkedError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Malformed { .. } => StatusCode::BAD_REQUEST,
            Self::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }
}

/// Errors raised while reading a framed request body.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BodyError {
    #[error(transparent)]
    Chunked(#[from] ChunkedError),

    #[error("body exceed the limit {limit}")]
    TooLarge { limit: u64 },
}

impl BodyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Chunked(e) => e.status_code(),
            Self::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }
}

/// Errors raised by the multipart stream parser.
///
/// All of them are answered with `400 Bad Request`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MultipartError {
    #[error("invalid multipart boundary")]
    InvalidBoundary,

    #[error("part header block exceed the limit {max_size}")]
    TooLargeHeader { max_size: usize },

    #[error("part header line exceed the limit {max_size}")]
    TooLongLine { max_size: usize },

    #[error("invalid part header: {reason}")]
    InvalidHeader { reason: String },

    #[error("malformed multipart delimiter")]
    MalformedDelimiter,

    #[error("multipart body ended before the closing boundary")]
    Truncated,
}

/// Errors raised while serializing a response.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SendError {
    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_status() {
        assert_eq!(ParseError::too_large_header(40_000, 32_768).status_code(), StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);
        assert_eq!(ParseError::too_long_uri(9_000, 8_192).status_code(), StatusCode::URI_TOO_LONG);
        assert_eq!(ParseError::too_many_headers(100).status_code(), StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);
        assert_eq!(ParseError::ConflictingFraming.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ParseError::unsupported_transfer_encoding("gzip").status_code(), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(ParseError::LengthRequired.status_code(), StatusCode::LENGTH_REQUIRED);
        assert_eq!(ParseError::TooLargeBody { size: 11, limit: 10 }.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn body_error_status() {
        let malformed = BodyError::from(ChunkedError::Malformed { reason: "bad size" });
        assert_eq!(malformed.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(BodyError::TooLarge { limit: 1 }.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
