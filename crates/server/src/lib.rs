//! A single-threaded, readiness-polled HTTP/1.x server.
//!
//! One `mio` loop multiplexes every listening socket, client connection and CGI pipe.
//! Requests are routed by longest prefix to static files with optional directory listing,
//! streaming `multipart/form-data` uploads, deletions and CGI/1.1 scripts. The protocol
//! work itself lives in `webserv-http`; this crate wires it to sockets, the filesystem
//! and child processes.
//!
//! # Example
//!
//! ```no_run
//! use webserv::config::Config;
//! use webserv::event_loop::EventLoop;
//!
//! let config = Config::load("conf/webserv.json")?;
//! let mut event_loop = EventLoop::bind(config)?;
//! event_loop.run()?;
//! # Ok::<(), webserv::error::ServerError>(())
//! ```
//!
//! # Architecture
//!
//! - [`config`]: the JSON configuration and route resolution
//! - [`event_loop`]: the poll loop and its token maps
//! - [`connection`]: the per-client state machine
//! - [`handler`]: static files, uploads, deletions and error pages
//! - [`cgi`]: script resolution, environment, output translation and the child process

pub mod cgi;
pub mod config;
pub mod connection;
pub mod date;
pub mod error;
pub mod event_loop;
pub mod handler;

mod utils;
pub(crate) use utils::ensure;

/// Short name shown on built-in pages.
pub const SERVER_NAME: &str = "webserv";

/// Value of the `Server` header and of `SERVER_SOFTWARE` for CGI scripts.
pub const SERVER_SOFTWARE: &str = concat!("webserv/", env!("CARGO_PKG_VERSION"));
