//! HTTP response types.
//!
//! [`ResponseHead`] is the head half handed to the response encoder. [`Response`] is a
//! fully buffered response as produced by the static, upload, delete and error paths,
//! together with the connection handling flags the state machine needs.

use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::{HeaderMap, StatusCode};

/// Type alias for HTTP response headers.
pub type ResponseHead = http::Response<()>;

/// A fully buffered response.
#[derive(Debug)]
pub struct Response {
    head: ResponseHead,
    body: Bytes,
    close: bool,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        let mut head = ResponseHead::new(());
        *head.status_mut() = status;
        Self { head, body: Bytes::new(), close: false }
    }

    /// Sets the body and its `Content-Type`.
    pub fn with_body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        if let Ok(value) = HeaderValue::from_str(content_type) {
            self.head.headers_mut().insert(header::CONTENT_TYPE, value);
        }
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: header::HeaderName, value: HeaderValue) -> Self {
        self.head.headers_mut().insert(name, value);
        self
    }

    /// Marks the connection to be closed once this response is flushed.
    pub fn with_close(mut self) -> Self {
        self.close = true;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.head.status()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.head.headers()
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        self.head.headers_mut()
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn is_close(&self) -> bool {
        self.close
    }

    pub fn set_close(&mut self, close: bool) {
        self.close = close;
    }

    pub fn into_parts(self) -> (ResponseHead, Bytes) {
        (self.head, self.body)
    }
}

/// Statuses after which the connection is not reused, since the request stream can
/// no longer be trusted to be in sync.
pub fn is_close_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_REQUEST
            | StatusCode::REQUEST_TIMEOUT
            | StatusCode::LENGTH_REQUIRED
            | StatusCode::PAYLOAD_TOO_LARGE
            | StatusCode::URI_TOO_LONG
            | StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
            | StatusCode::NOT_IMPLEMENTED
    )
}
