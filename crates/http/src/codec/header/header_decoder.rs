//! HTTP header decoder for parsing request heads.
//!
//! The decoder enforces the head limits before handing the bytes to `httparse`:
//!
//! - the whole head, request line included, may not exceed 32 KiB
//! - a single line may not exceed 8 KiB (the request line answers 414, header lines 431)
//! - at most 100 header lines
//!
//! Framing (`Content-Length` / `Transfer-Encoding`) is not decided here. The connection
//! state machine first checks the method and the route, then calls [`parse_payload`]
//! with the body limit that applies to the resolved route.

use std::mem::MaybeUninit;

use bytes::{Buf, BytesMut};
use http::{Method, header};
use httparse::{Error, Status};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::ensure;
use crate::protocol::{ParseError, PayloadSize, RequestHeader};

/// Maximum number of header lines allowed in a request
pub const MAX_HEADER_NUM: usize = 100;

/// Maximum size in bytes allowed for the entire head
pub const MAX_HEADER_BYTES: usize = 32 * 1024;

/// Maximum size in bytes of a single line of the head
pub const MAX_LINE_BYTES: usize = 8 * 1024;

/// Decoder for HTTP request heads implementing the [`Decoder`] trait.
///
/// On success the head bytes are consumed from the source buffer; anything after the
/// blank line (body bytes, or a pipelined request) stays in place.
#[derive(Debug, Default)]
pub struct HeaderDecoder;

impl Decoder for HeaderDecoder {
    type Item = RequestHeader;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // tolerate the stray CRLF some clients send between pipelined requests
        while src.first().is_some_and(|b| *b == b'\r' || *b == b'\n') {
            if src[0] == b'\r' && src.len() < 2 {
                return Ok(None);
            }
            let skip = if src[0] == b'\r' { 2 } else { 1 };
            if skip == 2 && src[1] != b'\n' {
                return Err(ParseError::invalid_request_line("stray carriage return"));
            }
            src.advance(skip);
        }

        let Some(head_len) = scan_head(src)? else {
            return Ok(None);
        };

        let mut req = httparse::Request::new(&mut []);
        let mut headers: [MaybeUninit<httparse::Header>; MAX_HEADER_NUM] = [const { MaybeUninit::uninit() }; MAX_HEADER_NUM];

        let status = req.parse_with_uninit_headers(&src[..head_len], &mut headers).map_err(|e| match e {
            Error::TooManyHeaders => ParseError::too_many_headers(MAX_HEADER_NUM),
            Error::Version => ParseError::InvalidVersion(None),
            Error::HeaderName | Error::HeaderValue => ParseError::invalid_header(e),
            e => ParseError::invalid_request_line(e),
        })?;

        match status {
            Status::Complete(offset) => {
                trace!(head_size = offset, "parsed request head");
                let header = RequestHeader::try_from(req)?;
                src.advance(offset);
                Ok(Some(header))
            }
            // the blank line was found by the scan, so the head can not be partial
            Status::Partial => Err(ParseError::invalid_request_line("incomplete request head")),
        }
    }
}

/// Scans the buffered head, enforcing the size limits line by line.
///
/// Returns the length of the head including the terminating blank line, or `None` when
/// the terminator has not arrived yet.
fn scan_head(src: &[u8]) -> Result<Option<usize>, ParseError> {
    let mut line_start = 0;
    let mut line_no = 0;

    while let Some(pos) = src[line_start..].iter().position(|b| *b == b'\n') {
        let line_end = line_start + pos;
        let mut line_len = pos;
        if line_len > 0 && src[line_end - 1] == b'\r' {
            line_len -= 1;
        }

        let next = line_end + 1;
        ensure!(next <= MAX_HEADER_BYTES, ParseError::too_large_header(next, MAX_HEADER_BYTES));

        if line_len == 0 {
            return Ok(Some(next));
        }

        if line_no == 0 {
            ensure!(line_len <= MAX_LINE_BYTES, ParseError::too_long_uri(line_len, MAX_LINE_BYTES));
        } else {
            ensure!(line_len <= MAX_LINE_BYTES, ParseError::too_long_line(line_len, MAX_LINE_BYTES));
            ensure!(line_no <= MAX_HEADER_NUM, ParseError::too_many_headers(MAX_HEADER_NUM));
        }

        line_no += 1;
        line_start = next;
    }

    let partial = src.len() - line_start;
    if line_no == 0 {
        ensure!(partial <= MAX_LINE_BYTES, ParseError::too_long_uri(partial, MAX_LINE_BYTES));
    } else {
        ensure!(partial <= MAX_LINE_BYTES, ParseError::too_long_line(partial, MAX_LINE_BYTES));
    }
    ensure!(src.len() <= MAX_HEADER_BYTES, ParseError::too_large_header(src.len(), MAX_HEADER_BYTES));

    Ok(None)
}

/// Decides how the request body is framed.
///
/// `max_body` is the body limit resolved for the request's route, `None` meaning
/// unlimited. The checks follow RFC 9112 section 6:
///
/// - `Transfer-Encoding` together with `Content-Length` is rejected
/// - the only accepted transfer-coding is a single `chunked`
/// - `Content-Length` must be a single non-negative decimal that fits in a `u64`
/// - a `POST` must declare one of the two
pub fn parse_payload(request: &RequestHeader, max_body: Option<u64>) -> Result<PayloadSize, ParseError> {
    let te_header = request.headers().get(header::TRANSFER_ENCODING);
    let cl_header = request.headers().get(header::CONTENT_LENGTH);

    match (te_header, cl_header) {
        (Some(_), Some(_)) => Err(ParseError::ConflictingFraming),

        (Some(te_value), None) => {
            let te_str = te_value.to_str().map_err(|_| ParseError::unsupported_transfer_encoding("<opaque>"))?;
            ensure!(te_str.trim().eq_ignore_ascii_case("chunked"), ParseError::unsupported_transfer_encoding(te_str.trim()));
            Ok(PayloadSize::Chunked)
        }

        (None, Some(cl_value)) => {
            let cl_str = cl_value.to_str().map_err(|_| ParseError::invalid_content_length("value can't to_str"))?;
            let length = parse_content_length(cl_str)
                .ok_or_else(|| ParseError::invalid_content_length(format!("value {cl_str} is not u64")))?;

            if let Some(limit) = max_body {
                ensure!(length <= limit, ParseError::TooLargeBody { size: length, limit });
            }
            Ok(PayloadSize::Length(length))
        }

        (None, None) => {
            ensure!(request.method() != Method::POST, ParseError::LengthRequired);
            Ok(PayloadSize::Empty)
        }
    }
}

/// Overflow checked decimal parsing; rejects signs, blanks inside the value and lists.
fn parse_content_length(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    value.bytes().try_fold(0u64, |acc, b| {
        if !b.is_ascii_digit() {
            return None;
        }
        acc.checked_mul(10)?.checked_add(u64::from(b - b'0'))
    })
}
