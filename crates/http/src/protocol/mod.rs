//! Core HTTP protocol types.
//!
//! - **Message Handling** ([`Message`], [`PayloadItem`], [`PayloadSize`]): what the
//!   codecs consume and produce
//! - **Request** ([`RequestHeader`]): a parsed request head
//! - **Response** ([`ResponseHead`], [`Response`]): response heads and buffered responses
//! - **Errors**: one `thiserror` enum per failure domain, each able to name the status
//!   code the client should see

mod message;
pub use message::Message;
pub use message::PayloadItem;
pub use message::PayloadSize;

mod request;
pub use request::RequestHeader;

mod response;
pub use response::Response;
pub use response::ResponseHead;
pub use response::is_close_status;

mod error;
pub use error::BodyError;
pub use error::ChunkedError;
pub use error::MultipartError;
pub use error::ParseError;
pub use error::SendError;
