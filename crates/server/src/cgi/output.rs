//! Translation of CGI output into a response.
//!
//! The child writes a header block, a blank line and the body. [`OutputParser`] buffers
//! the header block, turns it into a [`ResponseHead`] plus the framing of the body, and
//! then passes body bytes through as they arrive.

use bytes::{Bytes, BytesMut};
use http::header::{self, HeaderName, HeaderValue};
use http::{StatusCode, Version};
use std::process::ExitStatus;
use tracing::trace;
use webserv_http::protocol::{PayloadSize, ResponseHead};

use crate::error::CgiError;

/// The header block must end within this many bytes.
pub const MAX_CGI_HEADER_BYTES: usize = 32 * 1024;

/// What a piece of CGI output turned into.
#[derive(Debug)]
pub enum OutputEvent {
    Head(ResponseHead, PayloadSize),
    Body(Bytes),
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Headers,
    /// Body bytes flow through; `Some` counts down a declared length.
    Body(Option<u64>),
    Done,
}

#[derive(Debug)]
pub struct OutputParser {
    state: State,
    buffer: BytesMut,
    total: u64,
    max_output: u64,
    chunked: bool,
}

impl OutputParser {
    /// A parser for a response to a request of `version`, accepting at most `max_output`
    /// bytes of output in total.
    ///
    /// Bodies without a declared length are chunked for HTTP/1.1 and close-delimited for
    /// HTTP/1.0.
    pub fn new(version: Version, max_output: u64) -> Self {
        Self { state: State::Headers, buffer: BytesMut::new(), total: 0, max_output, chunked: version != Version::HTTP_10 }
    }

    pub fn is_head_parsed(&self) -> bool {
        self.state != State::Headers
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Consumes output read from the child.
    pub fn feed(&mut self, data: &[u8], events: &mut Vec<OutputEvent>) -> Result<(), CgiError> {
        if self.state == State::Done {
            return Ok(());
        }

        self.total += data.len() as u64;
        if self.total > self.max_output {
            return Err(CgiError::OutputTooLarge { limit: self.max_output });
        }

        if self.state != State::Headers {
            self.forward(Bytes::copy_from_slice(data), events);
            return Ok(());
        }

        self.buffer.extend_from_slice(data);
        let Some(body_start) = find_header_end(&self.buffer) else {
            if self.buffer.len() > MAX_CGI_HEADER_BYTES {
                return Err(CgiError::HeaderTooLarge { limit: MAX_CGI_HEADER_BYTES });
            }
            return Ok(());
        };

        if body_start > MAX_CGI_HEADER_BYTES {
            return Err(CgiError::HeaderTooLarge { limit: MAX_CGI_HEADER_BYTES });
        }

        let head_bytes = self.buffer.split_to(body_start);
        let (head, payload_size) = self.parse_head(&head_bytes)?;
        trace!(status = %head.status(), ?payload_size, "parsed cgi header block");
        events.push(OutputEvent::Head(head, payload_size));

        match payload_size {
            PayloadSize::Length(length) => self.state = State::Body(Some(length)),
            PayloadSize::Chunked | PayloadSize::CloseDelimited => self.state = State::Body(None),
            PayloadSize::Empty => {
                self.state = State::Done;
                events.push(OutputEvent::End);
                return Ok(());
            }
        }

        let rest = self.buffer.split().freeze();
        self.forward(rest, events);
        Ok(())
    }

    /// Handles end of output. `status` is the exit status of the child, if already known.
    pub fn finish(&mut self, status: Option<ExitStatus>, events: &mut Vec<OutputEvent>) -> Result<(), CgiError> {
        match self.state {
            State::Headers if self.total == 0 => Err(CgiError::NoOutput),
            State::Headers => Err(CgiError::PrematureEof { status }),
            State::Body(Some(missing)) => Err(CgiError::TruncatedBody { missing }),
            State::Body(None) => {
                self.state = State::Done;
                events.push(OutputEvent::End);
                Ok(())
            }
            State::Done => Ok(()),
        }
    }

    fn forward(&mut self, mut bytes: Bytes, events: &mut Vec<OutputEvent>) {
        match &mut self.state {
            State::Body(Some(remaining)) => {
                let take = usize::try_from(*remaining).map_or(bytes.len(), |remaining| remaining.min(bytes.len()));
                bytes.truncate(take);
                *remaining -= take as u64;
                let finished = *remaining == 0;

                if !bytes.is_empty() {
                    events.push(OutputEvent::Body(bytes));
                }
                if finished {
                    self.state = State::Done;
                    events.push(OutputEvent::End);
                }
            }
            State::Body(None) if !bytes.is_empty() => events.push(OutputEvent::Body(bytes)),
            _ => {}
        }
    }

    fn parse_head(&self, block: &[u8]) -> Result<(ResponseHead, PayloadSize), CgiError> {
        // one slot per line, the byte cap already bounds the block
        let lines = block.iter().filter(|b| **b == b'\n').count() + 1;
        let mut raw = vec![httparse::EMPTY_HEADER; lines];
        let parsed = match httparse::parse_headers(block, &mut raw) {
            Ok(httparse::Status::Complete((_, parsed))) => parsed,
            Ok(httparse::Status::Partial) => return Err(CgiError::malformed_header("incomplete header block")),
            Err(e) => return Err(CgiError::malformed_header(e)),
        };

        let mut head = ResponseHead::new(());
        let mut status = None;
        let mut content_length = None;

        for raw_header in parsed {
            let name = HeaderName::from_bytes(raw_header.name.as_bytes()).map_err(CgiError::malformed_header)?;
            let value = HeaderValue::from_bytes(raw_header.value).map_err(CgiError::malformed_header)?;

            if name.as_str() == "status" {
                status = Some(parse_status(&value)?);
            } else if name == header::CONTENT_LENGTH {
                let length = value.to_str().ok().and_then(|value| value.trim().parse::<u64>().ok());
                content_length = Some(length.ok_or_else(|| CgiError::malformed_header("invalid content-length"))?);
            } else if !is_hop_by_hop(&name) {
                head.headers_mut().append(name, value);
            }
        }

        let status = status.unwrap_or_else(|| {
            if head.headers().contains_key(header::LOCATION) { StatusCode::FOUND } else { StatusCode::OK }
        });
        *head.status_mut() = status;

        let payload_size = if forbids_body(status) {
            PayloadSize::Empty
        } else {
            match content_length {
                Some(length) => PayloadSize::Length(length),
                None if self.chunked => PayloadSize::Chunked,
                None => PayloadSize::CloseDelimited,
            }
        };

        Ok((head, payload_size))
    }
}

/// Offset of the first byte after the blank line closing the header block.
///
/// Lines may end with CRLF or a bare LF.
fn find_header_end(buffer: &[u8]) -> Option<usize> {
    let mut line_start = 0;
    for (i, byte) in buffer.iter().enumerate() {
        if *byte != b'\n' {
            continue;
        }
        let line = &buffer[line_start..i];
        if line.is_empty() || line == b"\r" {
            return Some(i + 1);
        }
        line_start = i + 1;
    }
    None
}

/// `Status: 404 Not Found` or just `Status: 404`.
fn parse_status(value: &HeaderValue) -> Result<StatusCode, CgiError> {
    let code = value.as_bytes().split(|byte| *byte == b' ').find(|part| !part.is_empty()).unwrap_or_default();
    StatusCode::from_bytes(code).map_err(|_| CgiError::malformed_header("invalid status"))
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    *name == header::CONNECTION
        || *name == header::TRANSFER_ENCODING
        || *name == header::TE
        || *name == header::TRAILER
        || *name == header::UPGRADE
        || *name == header::PROXY_AUTHENTICATE
        || matches!(name.as_str(), "keep-alive" | "proxy-connection")
}

fn forbids_body(status: StatusCode) -> bool {
    status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED
}
