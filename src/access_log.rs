//! Access log records, one line per proxied request

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Local};
use hyper::header::{HeaderMap, AUTHORIZATION};
use hyper::{Method, Version};
use std::fmt;
use std::net::SocketAddr;

/// Timestamp layout used in every access log line (12-hour clock)
pub const TIMESTAMP_FORMAT: &str = "%d/%b/%Y %I:%M:%S";

/// Placeholder for absent fields
pub const PLACEHOLDER: &str = "-";

/// A single completed request
#[derive(Debug, Clone)]
pub struct AccessLogEntry {
    pub remote_addr: SocketAddr,
    pub host: String,
    pub user: String,
    pub timestamp: DateTime<Local>,
    pub method: Method,
    pub uri: String,
    pub version: Version,
    pub status: u16,
    /// `-1` when the length is not known up front
    pub content_length: i64,
}

impl fmt::Display for AccessLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} [{}] \"{} {} {:?}\" {} {}",
            self.remote_addr,
            self.host,
            self.user,
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.method,
            self.uri,
            self.version,
            self.status,
            self.content_length
        )
    }
}

/// Destination for access log lines.
///
/// Implementations must emit each entry as one whole line.
pub trait AccessLogSink: Send + Sync {
    fn record(&self, entry: &AccessLogEntry);
}

/// Writes access lines through `tracing` under the `tlsmux::access` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAccessLog;

impl AccessLogSink for TracingAccessLog {
    fn record(&self, entry: &AccessLogEntry) {
        let line = entry.to_string();
        tracing::info!(target: "tlsmux::access", "{}", line);
    }
}

/// Username from an `Authorization: Basic` header, if one decodes
pub fn basic_auth_user(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let credentials = String::from_utf8(decoded).ok()?;
    let (user, _password) = credentials.split_once(':')?;
    Some(user.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use hyper::header::HeaderValue;

    #[test]
    fn test_basic_auth_user() {
        let mut headers = HeaderMap::new();
        // alice:secret
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic YWxpY2U6c2VjcmV0"));
        assert_eq!(basic_auth_user(&headers), Some("alice".to_string()));
    }

    #[test]
    fn test_basic_auth_user_absent_or_other_scheme() {
        let mut headers = HeaderMap::new();
        assert_eq!(basic_auth_user(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(basic_auth_user(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic !!!"));
        assert_eq!(basic_auth_user(&headers), None);
    }

    #[test]
    fn test_line_format() {
        let entry = AccessLogEntry {
            remote_addr: "127.0.0.1:51000".parse().unwrap(),
            host: "app1.local.dev".to_string(),
            user: PLACEHOLDER.to_string(),
            timestamp: Local.with_ymd_and_hms(2024, 3, 7, 14, 5, 9).unwrap(),
            method: Method::GET,
            uri: "/users?id=1".to_string(),
            version: Version::HTTP_11,
            status: 200,
            content_length: 42,
        };

        let morning = AccessLogEntry {
            timestamp: Local.with_ymd_and_hms(2024, 3, 7, 0, 5, 9).unwrap(),
            ..entry.clone()
        };
        assert!(morning.to_string().contains("[07/Mar/2024 12:05:09]"));

        assert_eq!(
            entry.to_string(),
            "127.0.0.1:51000 app1.local.dev - [07/Mar/2024 02:05:09] \"GET /users?id=1 HTTP/1.1\" 200 42"
        );
    }
}
