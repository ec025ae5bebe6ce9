//! `DELETE` of files below the document root.

use std::fs;

use http::StatusCode;
use tracing::{info, warn};
use webserv_http::protocol::Response;

use crate::handler::path::{self, io_status};
use crate::handler::{HandlerResult, RequestContext};

/// Removes the file the request path maps to.
///
/// Directories, paths leaving the root and permission failures are refused with 403.
pub fn delete(ctx: &RequestContext<'_>) -> HandlerResult {
    let (root, relative) = ctx.server.document_root(ctx.route, ctx.path);
    let fs_path = path::resolve(root, relative).ok_or(StatusCode::FORBIDDEN)?;

    let metadata = fs::symlink_metadata(&fs_path).map_err(|e| io_status(&e))?;
    if metadata.is_dir() || fs_path == root {
        return Err(StatusCode::FORBIDDEN);
    }

    if !path::is_within(root, &fs_path) {
        warn!(path = %fs_path.display(), "refusing to delete outside of the root");
        return Err(StatusCode::FORBIDDEN);
    }

    fs::remove_file(&fs_path).map_err(|e| {
        warn!(cause = %e, path = %fs_path.display(), "failed to delete file");
        io_status(&e)
    })?;

    info!(path = %fs_path.display(), "deleted file");
    Ok(Response::new(StatusCode::NO_CONTENT))
}
