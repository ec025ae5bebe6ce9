//! Request head decoding and response head encoding.
//!
//! - [`HeaderDecoder`]: decodes a request head from raw bytes, enforcing the head limits
//! - [`parse_payload`]: decides the request body framing once the route is known
//! - [`HeaderEncoder`]: serializes a response head and its framing headers

mod header_decoder;
mod header_encoder;

pub use header_decoder::HeaderDecoder;
pub use header_decoder::{MAX_HEADER_BYTES, MAX_HEADER_NUM, MAX_LINE_BYTES, parse_payload};
pub use header_encoder::HeaderEncoder;
