//! HTTP request header handling.
//!
//! [`RequestHeader`] wraps `http::Request<()>` and adds the handful of queries the
//! connection state machine asks about a request: keep-alive, expectations and the
//! declared content type.

use std::str::FromStr;

use http::header::{self, Entry};
use http::request::Parts;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Uri, Version};
use mime::Mime;

use crate::protocol::ParseError;

/// Represents an HTTP request header.
#[derive(Debug)]
pub struct RequestHeader {
    inner: Request<()>,
}

impl AsRef<Request<()>> for RequestHeader {
    fn as_ref(&self) -> &Request<()> {
        &self.inner
    }
}

impl AsMut<Request<()>> for RequestHeader {
    fn as_mut(&mut self) -> &mut Request<()> {
        &mut self.inner
    }
}

impl RequestHeader {
    /// Consumes the header and returns the inner `Request<()>`.
    pub fn into_inner(self) -> Request<()> {
        self.inner
    }

    /// Attaches a body to this header, converting it into a full `Request<T>`.
    pub fn body<T>(self, body: T) -> Request<T> {
        self.inner.map(|_| body)
    }

    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    pub fn uri(&self) -> &Uri {
        self.inner.uri()
    }

    pub fn version(&self) -> Version {
        self.inner.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// The request target path, without the query string.
    pub fn path(&self) -> &str {
        self.inner.uri().path()
    }

    /// The raw query string, empty when the target carries none.
    pub fn query(&self) -> &str {
        self.inner.uri().query().unwrap_or("")
    }

    /// Whether the client asked to keep the connection open after this request.
    ///
    /// HTTP/1.1 defaults to persistent connections unless `Connection: close` is sent,
    /// HTTP/1.0 only keeps the connection when `Connection: keep-alive` is sent.
    pub fn is_keep_alive(&self) -> bool {
        let has_token = |token: &str| {
            self.headers().get_all(header::CONNECTION).iter().any(|value| {
                value.to_str().is_ok_and(|v| v.split(',').any(|item| item.trim().eq_ignore_ascii_case(token)))
            })
        };

        match self.version() {
            Version::HTTP_11 => !has_token("close"),
            _ => has_token("keep-alive") && !has_token("close"),
        }
    }

    /// Whether the request carries `Expect: 100-continue`.
    pub fn expects_continue(&self) -> bool {
        self.headers()
            .get(header::EXPECT)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.trim().eq_ignore_ascii_case("100-continue"))
    }

    /// The parsed `Content-Type`, if present and well formed.
    pub fn content_type(&self) -> Option<Mime> {
        self.headers().get(header::CONTENT_TYPE)?.to_str().ok()?.parse().ok()
    }

    /// Whether the body is a `multipart/form-data` payload.
    pub fn is_multipart_form(&self) -> bool {
        self.content_type()
            .is_some_and(|mime| mime.type_() == mime::MULTIPART && mime.subtype() == mime::FORM_DATA)
    }
}

impl From<Parts> for RequestHeader {
    #[inline]
    fn from(parts: Parts) -> Self {
        Self { inner: Request::from_parts(parts, ()) }
    }
}

impl From<Request<()>> for RequestHeader {
    #[inline]
    fn from(inner: Request<()>) -> Self {
        Self { inner }
    }
}

/// Converts a parsed HTTP request into a RequestHeader.
///
/// Header names are case-folded by `http::HeaderName`, and repeated header fields are
/// merged into a single comma separated value.
impl<'headers, 'buf> TryFrom<httparse::Request<'headers, 'buf>> for RequestHeader {
    type Error = ParseError;

    fn try_from(req: httparse::Request<'headers, 'buf>) -> Result<Self, Self::Error> {
        let method = req.method.ok_or(ParseError::InvalidMethod)?;
        let method = Method::from_bytes(method.as_bytes()).map_err(|_| ParseError::InvalidMethod)?;

        let path = req.path.ok_or(ParseError::InvalidUri)?;
        let uri = Uri::from_str(path).map_err(|_| ParseError::InvalidUri)?;

        let version = match req.version {
            Some(1) => Version::HTTP_11,
            Some(0) => Version::HTTP_10,
            other => return Err(ParseError::InvalidVersion(other)),
        };

        let mut headers: HeaderMap<HeaderValue> = HeaderMap::with_capacity(req.headers.len());
        for h in req.headers.iter() {
            let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(ParseError::invalid_header)?;
            let value = HeaderValue::from_bytes(h.value).map_err(ParseError::invalid_header)?;

            match headers.entry(name) {
                Entry::Occupied(mut entry) => {
                    let mut joined = Vec::with_capacity(entry.get().len() + 2 + value.len());
                    joined.extend_from_slice(entry.get().as_bytes());
                    joined.extend_from_slice(b", ");
                    joined.extend_from_slice(value.as_bytes());
                    let joined = HeaderValue::from_bytes(&joined).map_err(ParseError::invalid_header)?;
                    entry.insert(joined);
                }
                Entry::Vacant(entry) => {
                    entry.insert(value);
                }
            }
        }

        let mut inner = Request::new(());
        *inner.method_mut() = method;
        *inner.uri_mut() = uri;
        *inner.version_mut() = version;
        *inner.headers_mut() = headers;

        Ok(RequestHeader { inner })
    }
}

#[cfg(test)]
mod tests {
    use std::mem::MaybeUninit;

    use http::{HeaderValue, Method, Version};
    use indoc::indoc;

    use super::*;

    fn parse(str: &str) -> RequestHeader {
        let mut parsed_req = httparse::Request::new(&mut []);
        let mut headers: [MaybeUninit<httparse::Header>; 16] = [const { MaybeUninit::uninit() }; 16];

        parsed_req.parse_with_uninit_headers(str.as_bytes(), &mut headers).unwrap();
        parsed_req.try_into().unwrap()
    }

    #[test]
    fn from_curl() {
        let str = indoc! {r##"
        GET /index.html HTTP/1.1
        Host: 127.0.0.1:8080
        User-Agent: curl/7.79.1
        Accept: */*

        "##};

        let header = parse(str);

        assert_eq!(header.method(), &Method::GET);
        assert_eq!(header.version(), Version::HTTP_11);
        assert_eq!(header.path(), "/index.html");
        assert_eq!(header.query(), "");
        assert_eq!(header.headers().len(), 3);
        assert_eq!(header.headers().get(http::header::ACCEPT), Some(&HeaderValue::from_static("*/*")));
        assert_eq!(header.headers().get(http::header::HOST), Some(&HeaderValue::from_static("127.0.0.1:8080")));
        assert!(header.is_keep_alive());
    }

    #[test]
    fn query_is_split_out() {
        let header = parse("GET /cgi-bin/env.py/extra?a=1&b=2 HTTP/1.1\r\n\r\n");

        assert_eq!(header.path(), "/cgi-bin/env.py/extra");
        assert_eq!(header.query(), "a=1&b=2");
    }

    #[test]
    fn duplicate_headers_are_joined() {
        let str = indoc! {r##"
        GET / HTTP/1.1
        Host: localhost
        X-Trace: a
        x-trace: b

        "##};

        let header = parse(str);

        assert_eq!(header.headers().get("x-trace"), Some(&HeaderValue::from_static("a, b")));
        assert_eq!(header.headers().get_all("x-trace").iter().count(), 1);
    }

    #[test]
    fn keep_alive_defaults() {
        assert!(!parse("GET / HTTP/1.0\r\n\r\n").is_keep_alive());
        assert!(parse("GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n").is_keep_alive());
        assert!(!parse("GET / HTTP/1.1\r\nConnection: close\r\n\r\n").is_keep_alive());
        assert!(parse("GET / HTTP/1.1\r\nConnection: upgrade, keep-alive\r\n\r\n").is_keep_alive());
    }

    #[test]
    fn expect_and_content_type() {
        let str = indoc! {r##"
        POST /upload HTTP/1.1
        Host: localhost
        Expect: 100-continue
        Content-Type: multipart/form-data; boundary=----abc

        "##};

        let header = parse(str);

        assert!(header.expects_continue());
        assert!(header.is_multipart_form());
        assert_eq!(header.content_type().and_then(|m| m.get_param(mime::BOUNDARY).map(|b| b.to_string())), Some("----abc".to_string()));
    }
}
