#![allow(dead_code, reason = "shared by several test binaries")]

use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::{Value, json};
use tempfile::TempDir;
use webserv::config::Config;
use webserv::error::ServerError;
use webserv::event_loop::{EventLoop, ShutdownHandle};

/// A server running on an ephemeral port in a background thread.
pub struct TestServer {
    pub addr: SocketAddr,
    pub root: TempDir,
    handle: ShutdownHandle,
    thread: Option<JoinHandle<Result<(), ServerError>>>,
}

impl TestServer {
    /// Starts one server described by `server`, listening on `127.0.0.1:0` and serving
    /// `root` unless the description names another root.
    pub fn start(root: TempDir, mut server: Value) -> Self {
        server["host"] = json!("127.0.0.1");
        server["port"] = json!(0);
        if server.get("root").is_none() {
            server["root"] = json!(root.path());
        }

        let config = Config::from_json(&json!({ "servers": [server] }).to_string()).unwrap();
        let mut event_loop = EventLoop::bind(config).unwrap();
        let addr = event_loop.local_addrs()[0];
        let handle = event_loop.shutdown_handle();
        let thread = thread::spawn(move || event_loop.run());

        Self { addr, root, handle, thread: Some(thread) }
    }

    pub fn path(&self, relative: &str) -> std::path::PathBuf {
        self.root.path().join(relative)
    }

    pub fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
    }

    /// Sends `raw` on a fresh connection and reads one response.
    pub fn request(&self, raw: &str) -> Reply {
        let mut stream = self.connect();
        stream.write_all(raw.as_bytes()).unwrap();
        read_reply(&mut stream, &mut Vec::new(), raw.starts_with("HEAD "))
    }

    pub fn stop(mut self) -> Result<(), ServerError> {
        self.handle.shutdown().unwrap();
        self.thread.take().unwrap().join().unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.handle.shutdown();
            let _ = thread.join();
        }
    }
}

#[derive(Debug)]
pub struct Reply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(key, _)| key.eq_ignore_ascii_case(name)).map(|(_, value)| value.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Reads one response from `stream`; `buf` carries bytes over between responses.
pub fn read_reply(stream: &mut TcpStream, buf: &mut Vec<u8>, head_only: bool) -> Reply {
    let head_len = loop {
        if let Some(end) = find(buf, b"\r\n\r\n") {
            break end + 4;
        }
        assert!(fill(stream, buf) > 0, "connection closed before a response head");
    };

    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut headers);
    response.parse(&buf[..head_len]).unwrap();
    let status = response.code.unwrap();
    let headers: Vec<(String, String)> = response
        .headers
        .iter()
        .map(|header| (header.name.to_owned(), String::from_utf8_lossy(header.value).into_owned()))
        .collect();
    buf.drain(..head_len);

    let mut reply = Reply { status, headers, body: Vec::new() };
    if head_only || status == 204 || status == 304 {
        return reply;
    }

    if reply.header("transfer-encoding") == Some("chunked") {
        reply.body = read_chunked(stream, buf);
    } else if let Some(length) = reply.header("content-length") {
        let length: usize = length.parse().unwrap();
        while buf.len() < length {
            assert!(fill(stream, buf) > 0, "connection closed inside a response body");
        }
        reply.body = buf.drain(..length).collect();
    } else {
        while fill(stream, buf) > 0 {}
        reply.body = std::mem::take(buf);
    }
    reply
}

fn read_chunked(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Vec<u8> {
    let mut body = Vec::new();
    loop {
        let line_end = loop {
            if let Some(end) = find(buf, b"\r\n") {
                break end;
            }
            assert!(fill(stream, buf) > 0, "connection closed inside a chunk size");
        };
        let size = usize::from_str_radix(std::str::from_utf8(&buf[..line_end]).unwrap().trim(), 16).unwrap();
        buf.drain(..line_end + 2);

        while buf.len() < size + 2 {
            assert!(fill(stream, buf) > 0, "connection closed inside a chunk");
        }
        body.extend(buf.drain(..size));
        buf.drain(..2);

        if size == 0 {
            return body;
        }
    }
}

/// Whether the server closed the connection, after reading anything still pending.
pub fn is_closed(stream: &mut TcpStream) -> bool {
    let mut rest = [0u8; 1024];
    loop {
        match stream.read(&mut rest) {
            Ok(0) => return true,
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => return true,
            Err(_) => return false,
        }
    }
}

fn fill(stream: &mut TcpStream, buf: &mut Vec<u8>) -> usize {
    let mut chunk = [0u8; 16 * 1024];
    match stream.read(&mut chunk) {
        Ok(n) => {
            buf.extend_from_slice(&chunk[..n]);
            n
        }
        Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => 0,
        Err(e) => panic!("read failed: {e}"),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

pub fn write_file(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}

pub fn write_script(path: &Path, contents: &str) {
    write_file(path, contents);
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}
