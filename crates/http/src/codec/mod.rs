//! Codecs for the HTTP/1.x wire format.
//!
//! - Request side: [`HeaderDecoder`] for the head, [`PayloadDecoder`] (length or chunked)
//!   for the body, and [`MultipartStreamParser`] for `multipart/form-data` bodies
//! - Response side: [`ResponseEncoder`], which writes a head through [`HeaderEncoder`]
//!   and then the payload items with the framing announced in the head
//!
//! All of them work on `BytesMut` buffers and never touch a socket, so they can be driven
//! by a readiness loop one partial read at a time.

mod body;
mod header;
mod multipart;
mod response_encoder;

pub use body::{ChunkedDecoder, ChunkedEncoder, LengthDecoder, MAX_CHUNK_LINE, PayloadDecoder, PayloadEncoder};
pub use header::{HeaderDecoder, HeaderEncoder, MAX_HEADER_BYTES, MAX_HEADER_NUM, MAX_LINE_BYTES, parse_payload};
pub use multipart::{ContentDisposition, MultipartStatus, MultipartStreamParser, PartSink, boundary_from_content_type};
pub use response_encoder::ResponseEncoder;
