//! `GET`/`HEAD` on the filesystem.

use std::fs;
use std::path::Path;

use http::{HeaderValue, StatusCode, header};
use tracing::{debug, warn};
use webserv_http::protocol::Response;

use crate::handler::path::{self, io_status};
use crate::handler::{HandlerResult, RequestContext, autoindex, mime_type};

/// Serves the file or directory the request path maps to.
///
/// Directories are redirected to their slash-terminated path first, then served by
/// their index file, an autoindex listing, or refused.
pub fn serve(ctx: &RequestContext<'_>) -> HandlerResult {
    let (root, relative) = ctx.server.document_root(ctx.route, ctx.path);
    let fs_path = path::resolve(root, relative).ok_or(StatusCode::FORBIDDEN)?;

    let metadata = fs::metadata(&fs_path).map_err(|e| {
        debug!(cause = %e, path = %fs_path.display(), "static lookup failed");
        io_status(&e)
    })?;

    if metadata.is_dir() {
        if !ctx.path.ends_with('/') {
            return Ok(slash_redirect(ctx));
        }

        for index in ctx.server.index_for(ctx.route) {
            let candidate = fs_path.join(index);
            if candidate.is_file() {
                return file_response(&candidate);
            }
        }

        if ctx.route.autoindex {
            return match autoindex::render(&fs_path, ctx.path) {
                Ok(page) => Ok(Response::new(StatusCode::OK).with_body(mime::TEXT_HTML_UTF_8.as_ref(), page)),
                Err(e) => {
                    warn!(cause = %e, path = %fs_path.display(), "failed to list directory");
                    Err(io_status(&e))
                }
            };
        }

        return Err(StatusCode::FORBIDDEN);
    }

    if !metadata.is_file() {
        return Err(StatusCode::FORBIDDEN);
    }

    file_response(&fs_path)
}

fn file_response(fs_path: &Path) -> HandlerResult {
    let body = fs::read(fs_path).map_err(|e| {
        warn!(cause = %e, path = %fs_path.display(), "failed to read file");
        io_status(&e)
    })?;

    let content_type = mime_type::for_path(fs_path);
    Ok(Response::new(StatusCode::OK).with_body(content_type.as_ref(), body))
}

fn slash_redirect(ctx: &RequestContext<'_>) -> Response {
    let mut location = format!("{}/", ctx.header.path());
    if !ctx.header.query().is_empty() {
        location.push('?');
        location.push_str(ctx.header.query());
    }

    let response = Response::new(StatusCode::MOVED_PERMANENTLY);
    match HeaderValue::from_str(&location) {
        Ok(value) => response.with_header(header::LOCATION, value),
        Err(_) => response,
    }
}
