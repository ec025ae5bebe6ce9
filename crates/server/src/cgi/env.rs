//! CGI/1.1 meta-variables.

use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::net::SocketAddr;

use http::{Method, Version, header};
use webserv_http::protocol::RequestHeader;

use crate::cgi::resolve::Script;
use crate::config::{RouteConfig, ServerConfig};

/// Everything the environment of one CGI child is derived from.
#[derive(Debug, Clone, Copy)]
pub struct CgiRequest<'a> {
    pub header: &'a RequestHeader,
    pub server: &'a ServerConfig,
    pub route: &'a RouteConfig,
    pub script: &'a Script,
    pub body_len: usize,
    pub peer: SocketAddr,
    pub local: SocketAddr,
}

/// Builds the complete environment of the child; the server's own environment is not
/// inherited except for the route's pass-through list.
pub fn build_env(request: &CgiRequest<'_>) -> BTreeMap<String, OsString> {
    let head = request.header;
    let mut vars = BTreeMap::new();
    let mut set = |name: &str, value: String| {
        vars.insert(name.to_owned(), OsString::from(value));
    };

    set("GATEWAY_INTERFACE", "CGI/1.1".to_owned());
    set("SERVER_PROTOCOL", protocol(head.version()).to_owned());
    set("SERVER_SOFTWARE", crate::SERVER_SOFTWARE.to_owned());
    set("SERVER_NAME", server_name(request));
    set("SERVER_PORT", request.local.port().to_string());
    set("REQUEST_METHOD", head.method().as_str().to_owned());
    set("SCRIPT_NAME", request.script.script_name.clone());
    set("SCRIPT_FILENAME", request.script.path.to_string_lossy().into_owned());
    set("PATH_INFO", request.script.path_info.clone());
    set("QUERY_STRING", head.query().to_owned());
    set("REMOTE_ADDR", request.peer.ip().to_string());
    set("REMOTE_PORT", request.peer.port().to_string());
    set("REDIRECT_STATUS", "200".to_owned());

    if request.body_len > 0 || head.method() == Method::POST {
        set("CONTENT_LENGTH", request.body_len.to_string());
    }

    if let Some(content_type) = head.headers().get(header::CONTENT_TYPE) {
        set("CONTENT_TYPE", String::from_utf8_lossy(content_type.as_bytes()).into_owned());
    }

    for (name, value) in head.headers() {
        // `Proxy` must never become HTTP_PROXY
        if name == header::CONTENT_LENGTH || name == header::CONTENT_TYPE || name.as_str() == "proxy" {
            continue;
        }
        let var = format!("HTTP_{}", name.as_str().to_ascii_uppercase().replace('-', "_"));
        set(&var, String::from_utf8_lossy(value.as_bytes()).into_owned());
    }

    for name in &request.route.cgi_pass_env {
        if let Some(value) = env::var_os(name) {
            vars.entry(name.clone()).or_insert(value);
        }
    }

    vars
}

fn protocol(version: Version) -> &'static str {
    if version == Version::HTTP_10 { "HTTP/1.0" } else { "HTTP/1.1" }
}

fn server_name(request: &CgiRequest<'_>) -> String {
    if let Some(name) = &request.server.server_name {
        return name.clone();
    }

    let host = request.header.headers().get(header::HOST).and_then(|host| host.to_str().ok());
    match host.map(strip_port) {
        Some(host) if !host.is_empty() => host.to_owned(),
        _ => request.local.ip().to_string(),
    }
}

/// `Host` header value without its port.
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // [v6]:port
        return host.split_once(']').map_or(host, |(addr, _)| &host[..=addr.len()]);
    }
    host.split_once(':').map_or(host, |(name, _)| name)
}
