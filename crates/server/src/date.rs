//! Cached `Date` header value.
//!
//! Formatting the date for every response is wasted work when many responses are
//! written within the same second, so the formatted value is kept and refreshed once it
//! is older than [`REFRESH_INTERVAL`]. There is no background task to refresh it; each
//! connection keeps a cache and refreshes it on access.

use std::time::{Duration, Instant};

use bytes::Bytes;
use http::HeaderValue;

const REFRESH_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub struct DateService {
    current: HeaderValue,
    updated_at: Instant,
}

impl DateService {
    pub fn new() -> Self {
        Self { current: format_now(), updated_at: Instant::now() }
    }

    /// The `Date` header value for a response written at `now`.
    pub fn http_date(&mut self, now: Instant) -> HeaderValue {
        if now.saturating_duration_since(self.updated_at) >= REFRESH_INTERVAL {
            self.current = format_now();
            self.updated_at = now;
        }
        self.current.clone()
    }
}

impl Default for DateService {
    fn default() -> Self {
        Self::new()
    }
}

fn format_now() -> HeaderValue {
    let mut buf = faf_http_date::get_date_buff_no_key();
    faf_http_date::get_date_no_key(&mut buf);
    // the formatted date is plain ASCII
    HeaderValue::from_maybe_shared(Bytes::copy_from_slice(&buf[..])).unwrap_or_else(|_| HeaderValue::from_static(""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_rfc_date() {
        let mut service = DateService::new();
        let value = service.http_date(Instant::now());
        let text = value.to_str().unwrap();

        assert_eq!(text.len(), 29);
        assert!(text.ends_with(" GMT"));
    }

    #[test]
    fn reuses_value_within_interval() {
        let mut service = DateService::new();
        let first = service.http_date(service.updated_at);
        let second = service.http_date(service.updated_at + Duration::from_millis(10));
        assert_eq!(first, second);
    }
}
