//! Decisions taken once a request head is complete.
//!
//! [`evaluate`] looks at the head alone and either plans how the request is read and
//! served, or produces the response that rejects it. Rejections are sent before the body
//! was read, so they always close the connection.

use http::{HeaderValue, Method, StatusCode, Version, header};
use tracing::debug;
use webserv_http::codec::{boundary_from_content_type, parse_payload};
use webserv_http::protocol::{PayloadSize, RequestHeader, Response};

use crate::cgi;
use crate::config::{IMPLEMENTED_METHODS, RouteConfig, ServerConfig};
use crate::handler::{error_response, path};

/// Where a request goes once its body was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Static,
    Upload,
    Delete,
    Cgi,
}

/// How an accepted request is read and served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPlan {
    /// Index of the matched route in the server's routes.
    pub route: usize,
    /// The percent-decoded request path.
    pub path: String,
    pub payload_size: PayloadSize,
    pub max_body: Option<u64>,
    pub dispatch: Dispatch,
    /// Boundary of a `multipart/form-data` body that is streamed to the upload sink.
    pub multipart: Option<String>,
}

/// Plans `header` against `server`, or returns the response rejecting it.
///
/// The checks run in a fixed order: implemented method, allowed method, redirect,
/// framing, expectation.
pub fn evaluate(header: &RequestHeader, server: &ServerConfig) -> Result<RequestPlan, Response> {
    let method = header.method();
    if !IMPLEMENTED_METHODS.contains(method) {
        return Err(reject(StatusCode::NOT_IMPLEMENTED, server, None));
    }

    let Some(path) = path::percent_decode(header.path()) else {
        return Err(reject(StatusCode::BAD_REQUEST, server, None));
    };

    let Some(route_index) = server.route_index_for(&path) else {
        return Err(reject(StatusCode::NOT_FOUND, server, None));
    };
    let route = &server.routes[route_index];

    if !route.allows(method) {
        let response = reject(StatusCode::METHOD_NOT_ALLOWED, server, Some(route));
        return Err(match HeaderValue::from_str(&route.allow_header()) {
            Ok(allow) => response.with_header(header::ALLOW, allow),
            Err(_) => response,
        });
    }

    if let Some(target) = &route.redirect {
        let response = Response::new(StatusCode::MOVED_PERMANENTLY).with_close();
        return Err(match HeaderValue::from_str(target) {
            Ok(location) => response.with_header(header::LOCATION, location),
            Err(_) => reject(StatusCode::INTERNAL_SERVER_ERROR, server, Some(route)),
        });
    }

    let max_body = server.max_body_for(route);
    let payload_size = parse_payload(header, max_body).map_err(|e| {
        debug!(cause = %e, "rejecting request framing");
        reject(e.status_code(), server, Some(route))
    })?;

    if header.version() == Version::HTTP_11 && header.expects_continue() {
        return Err(reject(StatusCode::EXPECTATION_FAILED, server, Some(route)));
    }

    let dispatch = if cgi::split_script_path(route, &path).is_some() {
        Dispatch::Cgi
    } else {
        match *method {
            Method::POST => Dispatch::Upload,
            Method::DELETE => Dispatch::Delete,
            _ => Dispatch::Static,
        }
    };

    let multipart = match dispatch {
        Dispatch::Upload if header.is_multipart_form() => {
            let content_type = header.headers().get(header::CONTENT_TYPE).and_then(|value| value.to_str().ok());
            match content_type.and_then(boundary_from_content_type) {
                Some(boundary) => Some(boundary),
                None => return Err(reject(StatusCode::BAD_REQUEST, server, Some(route))),
            }
        }
        _ => None,
    };

    Ok(RequestPlan { route: route_index, path, payload_size, max_body, dispatch, multipart })
}

fn reject(status: StatusCode, server: &ServerConfig, route: Option<&RouteConfig>) -> Response {
    error_response(status, server, route).with_close()
}
