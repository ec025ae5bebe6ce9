//! Error responses.
//!
//! Every error response is built here: the configured page for the status when it can
//! be read, an inline page otherwise.

use std::fs;

use http::StatusCode;
use tracing::warn;
use webserv_http::protocol::Response;

use crate::config::{RouteConfig, ServerConfig};
use crate::handler::path;

pub fn error_response(status: StatusCode, server: &ServerConfig, route: Option<&RouteConfig>) -> Response {
    let body = configured_page(status, server, route).unwrap_or_else(|| default_page(status));
    Response::new(status).with_body(mime::TEXT_HTML_UTF_8.as_ref(), body)
}

fn configured_page(status: StatusCode, server: &ServerConfig, route: Option<&RouteConfig>) -> Option<Vec<u8>> {
    let page = server.error_pages.get(&status.as_u16())?;
    let root = route.and_then(|route| route.root.as_deref()).unwrap_or(&server.root);
    let page_path = path::resolve(root, page)?;

    match fs::read(&page_path) {
        Ok(body) => Some(body),
        Err(e) => {
            warn!(cause = %e, page = %page_path.display(), "failed to read error page, falling back to the built-in one");
            None
        }
    }
}

/// The built-in page for `status`.
pub fn default_page(status: StatusCode) -> Vec<u8> {
    let title = format!("{} {}", status.as_str(), status.canonical_reason().unwrap_or("Error"));
    format!(
        "<!DOCTYPE html>\n<html>\n<head><title>{title}</title></head>\n<body>\n<h1>{title}</h1>\n<hr>\n<p>{}</p>\n</body>\n</html>\n",
        crate::SERVER_NAME
    )
    .into_bytes()
}
