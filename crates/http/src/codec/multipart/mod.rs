//! Streaming `multipart/form-data` decoding.
//!
//! [`MultipartStreamParser`] is fed decoded body bytes as they arrive and reports parts to
//! a [`PartSink`]; it never holds more than one header block or a small overlap window in
//! memory, so uploads of any size can be streamed straight to disk.

mod content_disposition;
mod stream_parser;

pub use content_disposition::{ContentDisposition, boundary_from_content_type};
pub use stream_parser::{MultipartStatus, MultipartStreamParser, PartSink};
