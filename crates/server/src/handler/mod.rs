//! Request handlers for everything that is not CGI.
//!
//! Handlers get a [`RequestContext`] and return either a complete response or the status
//! of the error to answer with; the connection turns the latter into an error page.

use http::StatusCode;
use webserv_http::protocol::{RequestHeader, Response};

use crate::config::{RouteConfig, ServerConfig};

mod autoindex;
mod delete;
mod error_page;
pub mod mime_type;
pub mod path;
mod static_file;
mod upload;

pub use delete::delete;
pub use error_page::{default_page, error_response};
pub use static_file::serve;
pub use upload::{MAX_FIELD_BYTES, SavedFile, UploadSink, UploadSummary, sanitize_filename, save_raw, unique_file};

pub type HandlerResult = Result<Response, StatusCode>;

/// What a handler needs to know about the request it serves.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub header: &'a RequestHeader,
    pub server: &'a ServerConfig,
    pub route: &'a RouteConfig,
    /// The percent-decoded request path.
    pub path: &'a str,
}
