//! Server configuration model.
//!
//! The configuration is a JSON document deserialized with `serde`:
//!
//! ```json
//! {
//!   "servers": [{
//!     "port": 8080,
//!     "root": "www",
//!     "routes": [
//!       { "path": "/", "allowed_methods": ["GET"] },
//!       { "path": "/upload", "allowed_methods": ["GET", "POST", "DELETE"], "upload_dir": "www/uploads" },
//!       { "path": "/cgi-bin", "allowed_methods": ["GET", "POST"], "cgi_extensions": { ".py": "/usr/bin/python3" } }
//!     ]
//!   }]
//! }
//! ```
//!
//! Every server without a `/` route gets an implicit one that allows `GET`, so route
//! resolution by longest prefix always finds a match.

use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use http::Method;
use serde::Deserialize;
use tracing::debug;

use crate::ensure;
use crate::error::ConfigError;

const DEFAULT_CLIENT_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_CGI_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_CGI_MAX_OUTPUT_BYTES: u64 = 64 * 1024 * 1024;

/// Methods the server knows how to serve.
pub const IMPLEMENTED_METHODS: [Method; 4] = [Method::GET, Method::HEAD, Method::POST, Method::DELETE];

/// The whole configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub servers: Vec<ServerConfig>,
}

/// One virtual server.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub server_name: Option<String>,
    pub root: PathBuf,
    #[serde(default = "default_index")]
    pub index: Vec<String>,
    /// Status code to page path, relative to the root serving the request.
    #[serde(default)]
    pub error_pages: HashMap<u16, String>,
    #[serde(default)]
    pub client_max_body_size: Option<u64>,
    #[serde(default = "default_client_timeout_ms")]
    pub client_timeout_ms: u64,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// A location block: everything below `path` shares these settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    pub path: String,
    #[serde(default = "default_allowed_methods")]
    pub allowed_methods: Vec<String>,
    #[serde(default)]
    pub autoindex: bool,
    #[serde(default)]
    pub max_body_size: Option<u64>,
    /// Replaces the route prefix when mapping a request path onto disk.
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub index: Option<Vec<String>>,
    #[serde(default)]
    pub upload_dir: Option<PathBuf>,
    #[serde(default)]
    pub redirect: Option<String>,
    /// Extension (with the leading dot) to an optional interpreter.
    #[serde(default)]
    pub cgi_extensions: HashMap<String, Option<PathBuf>>,
    #[serde(default)]
    pub cgi_path: Option<PathBuf>,
    #[serde(default = "default_cgi_timeout_ms")]
    pub cgi_timeout_ms: u64,
    #[serde(default = "default_cgi_max_output_bytes")]
    pub cgi_max_output_bytes: u64,
    #[serde(default = "default_cgi_pass_env")]
    pub cgi_pass_env: Vec<String>,
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_index() -> Vec<String> {
    vec!["index.html".to_owned()]
}

fn default_client_timeout_ms() -> u64 {
    DEFAULT_CLIENT_TIMEOUT_MS
}

fn default_allowed_methods() -> Vec<String> {
    vec!["GET".to_owned()]
}

fn default_cgi_timeout_ms() -> u64 {
    DEFAULT_CGI_TIMEOUT_MS
}

fn default_cgi_max_output_bytes() -> u64 {
    DEFAULT_CGI_MAX_OUTPUT_BYTES
}

fn default_cgi_pass_env() -> Vec<String> {
    vec!["PATH".to_owned()]
}

impl Config {
    /// Reads, parses and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        debug!(path = %path.display(), "loaded configuration file");
        Self::from_json(&text)
    }

    /// Parses and validates a configuration document.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_json::from_str(text)?;
        config.validate()?;
        config.normalize();
        Ok(config)
    }

    /// Rejects configurations the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.servers.is_empty(), ConfigError::invalid("at least one server is required"));

        for server in &self.servers {
            ensure!(server.client_timeout_ms > 0, ConfigError::invalid("client_timeout_ms must be positive"));

            for (status, page) in &server.error_pages {
                ensure!((400..600).contains(status), ConfigError::invalid(format!("error page for non-error status {status}")));
                ensure!(!page.is_empty(), ConfigError::invalid(format!("empty error page path for {status}")));
            }

            for route in &server.routes {
                route.validate()?;
            }
        }

        Ok(())
    }

    fn normalize(&mut self) {
        for server in &mut self.servers {
            for route in &mut server.routes {
                for method in &mut route.allowed_methods {
                    method.make_ascii_uppercase();
                }
            }

            if !server.routes.iter().any(|route| route.path == "/") {
                server.routes.push(RouteConfig::fallback());
            }
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    /// Whether a `Host` header value (port stripped) names this server.
    pub fn matches_host(&self, host: &str) -> bool {
        self.server_name.as_deref().is_some_and(|name| name.eq_ignore_ascii_case(host))
    }

    /// The route with the longest prefix matching `path`, on segment boundaries.
    pub fn route_for(&self, path: &str) -> Option<&RouteConfig> {
        self.route_index_for(path).map(|index| &self.routes[index])
    }

    /// Position of [`ServerConfig::route_for`] in `routes`.
    pub fn route_index_for(&self, path: &str) -> Option<usize> {
        self.routes
            .iter()
            .enumerate()
            .filter(|(_, route)| route.matches(path))
            .max_by_key(|(_, route)| route.path.len())
            .map(|(index, _)| index)
    }

    /// Body limit for a route: its own override, else the server default.
    pub fn max_body_for(&self, route: &RouteConfig) -> Option<u64> {
        route.max_body_size.or(self.client_max_body_size)
    }

    /// Index candidates for a route.
    pub fn index_for<'a>(&'a self, route: &'a RouteConfig) -> &'a [String] {
        route.index.as_deref().unwrap_or(&self.index)
    }

    /// Directory a request under `route` is served from, and the path relative to it.
    ///
    /// A route root replaces the route prefix, otherwise the full request path is
    /// appended to the server root.
    pub fn document_root<'p>(&'p self, route: &'p RouteConfig, path: &'p str) -> (&'p Path, &'p str) {
        match &route.root {
            Some(root) => (root.as_path(), route.strip_prefix(path)),
            None => (self.root.as_path(), path),
        }
    }

    /// Directory CGI scripts of `route` are confined to, and the path relative to it.
    pub fn cgi_root<'p>(&'p self, route: &'p RouteConfig, path: &'p str) -> (&'p Path, &'p str) {
        match &route.cgi_path {
            Some(cgi_path) => (cgi_path.as_path(), route.strip_prefix(path)),
            None => self.document_root(route, path),
        }
    }
}

impl RouteConfig {
    fn fallback() -> Self {
        Self {
            path: "/".to_owned(),
            allowed_methods: default_allowed_methods(),
            autoindex: false,
            max_body_size: None,
            root: None,
            index: None,
            upload_dir: None,
            redirect: None,
            cgi_extensions: HashMap::new(),
            cgi_path: None,
            cgi_timeout_ms: DEFAULT_CGI_TIMEOUT_MS,
            cgi_max_output_bytes: DEFAULT_CGI_MAX_OUTPUT_BYTES,
            cgi_pass_env: default_cgi_pass_env(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        ensure!(self.path.starts_with('/'), ConfigError::invalid(format!("route path `{}` must start with `/`", self.path)));

        for method in &self.allowed_methods {
            let known = IMPLEMENTED_METHODS.iter().any(|implemented| implemented.as_str().eq_ignore_ascii_case(method));
            ensure!(known, ConfigError::invalid(format!("route `{}` allows unknown method `{method}`", self.path)));
        }

        for extension in self.cgi_extensions.keys() {
            ensure!(
                extension.len() > 1 && extension.starts_with('.'),
                ConfigError::invalid(format!("cgi extension `{extension}` must start with a dot"))
            );
        }

        ensure!(self.cgi_timeout_ms > 0, ConfigError::invalid(format!("route `{}` has a zero cgi_timeout_ms", self.path)));
        Ok(())
    }

    fn matches(&self, path: &str) -> bool {
        let prefix = self.path.trim_end_matches('/');
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// `path` with the route prefix removed, always starting with `/`.
    pub fn strip_prefix<'p>(&self, path: &'p str) -> &'p str {
        let prefix = self.path.trim_end_matches('/');
        match path.strip_prefix(prefix) {
            Some("") | None => "/",
            Some(rest) => rest,
        }
    }

    /// Whether `method` may be used on this route. `GET` implies `HEAD`.
    pub fn allows(&self, method: &Method) -> bool {
        self.allowed_methods.iter().any(|allowed| {
            allowed == method.as_str() || (*method == Method::HEAD && allowed == Method::GET.as_str())
        })
    }

    /// The normalised allow-list, in a stable order, for the `Allow` header.
    pub fn allow_header(&self) -> String {
        IMPLEMENTED_METHODS.iter().filter(|method| self.allows(method)).map(Method::as_str).collect::<Vec<_>>().join(", ")
    }

    pub fn cgi_timeout(&self) -> Duration {
        Duration::from_millis(self.cgi_timeout_ms)
    }

    pub fn is_cgi_extension(&self, segment: &str) -> bool {
        self.cgi_interpreter(segment).is_some()
    }

    /// The configured entry for the extension of `segment`, if it is a CGI one.
    ///
    /// The outer option tells whether the extension is registered, the inner one holds
    /// the interpreter.
    pub fn cgi_interpreter(&self, segment: &str) -> Option<Option<&Path>> {
        let dot = segment.rfind('.')?;
        self.cgi_extensions.get(&segment[dot..]).map(Option::as_deref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    const CONFIG: &str = indoc! {r#"
        {
          "servers": [{
            "host": "127.0.0.1",
            "port": 8080,
            "server_name": "example.test",
            "root": "/srv/www",
            "error_pages": { "404": "errors/404.html" },
            "client_max_body_size": 1024,
            "routes": [
              { "path": "/upload", "allowed_methods": ["get", "POST"], "upload_dir": "/srv/uploads", "max_body_size": 4096 },
              { "path": "/images/", "root": "/srv/images", "autoindex": true },
              { "path": "/cgi-bin", "allowed_methods": ["GET", "POST"], "cgi_extensions": { ".py": "/usr/bin/python3", ".sh": null } }
            ]
          }]
        }
    "#};

    fn server() -> ServerConfig {
        Config::from_json(CONFIG).unwrap().servers.remove(0)
    }

    #[test]
    fn defaults_are_applied() {
        let server = server();

        assert_eq!(server.listen_addr(), "127.0.0.1:8080".parse().unwrap());
        assert_eq!(server.index, vec!["index.html"]);
        assert_eq!(server.client_timeout(), Duration::from_secs(60));
        assert_eq!(server.error_pages.get(&404).map(String::as_str), Some("errors/404.html"));

        let cgi = server.route_for("/cgi-bin/x.py").unwrap();
        assert_eq!(cgi.cgi_timeout(), Duration::from_secs(30));
        assert_eq!(cgi.cgi_max_output_bytes, 64 * 1024 * 1024);
        assert_eq!(cgi.cgi_pass_env, vec!["PATH"]);
    }

    #[test]
    fn fallback_route_is_added() {
        let server = server();
        let route = server.route_for("/anything/else").unwrap();

        assert_eq!(route.path, "/");
        assert!(route.allows(&Method::GET));
        assert!(route.allows(&Method::HEAD));
        assert!(!route.allows(&Method::POST));
    }

    #[test]
    fn longest_prefix_on_segment_boundaries() {
        let server = server();

        assert_eq!(server.route_for("/upload").unwrap().path, "/upload");
        assert_eq!(server.route_for("/upload/a.txt").unwrap().path, "/upload");
        assert_eq!(server.route_for("/uploads").unwrap().path, "/");
        assert_eq!(server.route_for("/images").unwrap().path, "/images/");
        assert_eq!(server.route_for("/images/cat.png").unwrap().path, "/images/");
    }

    #[test]
    fn document_roots() {
        let server = server();

        let images = server.route_for("/images/cat.png").unwrap();
        assert_eq!(server.document_root(images, "/images/cat.png"), (Path::new("/srv/images"), "/cat.png"));
        assert_eq!(server.document_root(images, "/images"), (Path::new("/srv/images"), "/"));

        let upload = server.route_for("/upload/a").unwrap();
        assert_eq!(server.document_root(upload, "/upload/a"), (Path::new("/srv/www"), "/upload/a"));
    }

    #[test]
    fn methods_and_limits() {
        let server = server();
        let upload = server.route_for("/upload").unwrap();

        assert!(upload.allows(&Method::POST));
        assert!(upload.allows(&Method::HEAD));
        assert!(!upload.allows(&Method::DELETE));
        assert_eq!(upload.allow_header(), "GET, HEAD, POST");
        assert_eq!(server.max_body_for(upload), Some(4096));

        let root = server.route_for("/").unwrap();
        assert_eq!(root.allow_header(), "GET, HEAD");
        assert_eq!(server.max_body_for(root), Some(1024));
    }

    #[test]
    fn cgi_extensions() {
        let server = server();
        let cgi = server.route_for("/cgi-bin").unwrap();

        assert_eq!(cgi.cgi_interpreter("test.py"), Some(Some(Path::new("/usr/bin/python3"))));
        assert_eq!(cgi.cgi_interpreter("run.sh"), Some(None));
        assert_eq!(cgi.cgi_interpreter("index.html"), None);
        assert!(!cgi.is_cgi_extension("py"));
    }

    #[test]
    fn host_matching() {
        let server = server();
        assert!(server.matches_host("EXAMPLE.test"));
        assert!(!server.matches_host("other.test"));
    }

    #[test]
    fn rejects_invalid_documents() {
        let cases = [
            r#"{ "servers": [] }"#,
            r#"{ "servers": [{ "port": 1, "root": "/", "routes": [{ "path": "nope" }] }] }"#,
            r#"{ "servers": [{ "port": 1, "root": "/", "routes": [{ "path": "/", "allowed_methods": ["PUT"] }] }] }"#,
            r#"{ "servers": [{ "port": 1, "root": "/", "routes": [{ "path": "/", "cgi_extensions": { "py": null } }] }] }"#,
            r#"{ "servers": [{ "port": 1, "root": "/", "error_pages": { "200": "ok.html" } }] }"#,
        ];

        for case in cases {
            assert!(matches!(Config::from_json(case), Err(ConfigError::Invalid { .. })), "{case}");
        }

        assert!(matches!(Config::from_json(r#"{ "servers": [{ "port": 1 }] }"#), Err(ConfigError::Parse(_))));
        assert!(matches!(Config::from_json(r#"{ "servers": [], "bogus": 1 }"#), Err(ConfigError::Parse(_))));
    }
}
