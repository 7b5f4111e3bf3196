//! Just enough HTTP/1.x to run a login page.
//!
//! Requests are reduced to a method, a decoded path and the query string;
//! headers and bodies are ignored. Responses always carry an exact
//! `Content-Length`, a permissive CORS header and `Connection: close`.

use crate::error::{PortalError, PortalResult};
use std::collections::HashMap;

/// Accepted query parameter names for the username, checked in order.
pub const USERNAME_ALIASES: &[&str] = &["username", "user", "usuario"];

/// Accepted query parameter names for the password, checked in order.
pub const PASSWORD_ALIASES: &[&str] = &["password", "pass", "contrasenna"];

/// End of the request head.
pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// A parsed request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    /// Percent-decoded path without query or fragment.
    pub path: String,
    /// Query parameters; blank values are dropped.
    pub query: HashMap<String, Vec<String>>,
}

/// A username/password pair taken from the query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl HttpRequest {
    /// Parse the request line out of a raw request head.
    ///
    /// Bytes that are not valid UTF-8 are replaced rather than rejected.
    pub fn parse(raw: &[u8]) -> PortalResult<Self> {
        let text = String::from_utf8_lossy(raw);
        let request_line = text
            .lines()
            .next()
            .ok_or_else(|| PortalError::Malformed("empty request".into()))?;

        let mut parts = request_line.split_whitespace();
        let (method, target) = match (parts.next(), parts.next()) {
            (Some(m), Some(t)) => (m, t),
            _ => {
                return Err(PortalError::Malformed(format!(
                    "bad request line: {request_line:?}"
                )))
            }
        };

        let target = strip_authority(target);
        let target = target.split('#').next().unwrap_or_default();
        let (raw_path, raw_query) = match target.split_once('?') {
            Some((p, q)) => (p, q),
            None => (target, ""),
        };

        let path = urlencoding::decode(raw_path)
            .map(|p| p.into_owned())
            .unwrap_or_else(|_| raw_path.to_string());

        Ok(Self {
            method: method.to_string(),
            path,
            query: parse_query(raw_query),
        })
    }

    /// First value of the first alias present in the query string.
    pub fn param(&self, aliases: &[&str]) -> Option<&str> {
        aliases
            .iter()
            .find_map(|alias| self.query.get(*alias))
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Username and password, if both are present under any accepted alias.
    pub fn credentials(&self) -> Option<Credentials> {
        let username = self.param(USERNAME_ALIASES)?;
        let password = self.param(PASSWORD_ALIASES)?;
        Some(Credentials {
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    /// `true` for the site root.
    pub fn is_root(&self) -> bool {
        self.path.is_empty() || self.path == "/"
    }
}

/// Drop `scheme://authority` from an absolute-form request target.
fn strip_authority(target: &str) -> &str {
    if target.starts_with('/') {
        return target;
    }
    match target.split_once("://") {
        Some((_, rest)) => match rest.find('/') {
            Some(idx) => &rest[idx..],
            None => "/",
        },
        None => target,
    }
}

/// Parse `application/x-www-form-urlencoded` pairs, keeping every value.
pub fn parse_query(query: &str) -> HashMap<String, Vec<String>> {
    let mut params: HashMap<String, Vec<String>> = HashMap::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if value.is_empty() {
            continue;
        }
        params
            .entry(key.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    params
}

/// Content type for a static file, by extension.
pub fn content_type_for(path: &str) -> &'static str {
    let ext = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css",
        "js" => "application/javascript",
        _ => "application/octet-stream",
    }
}

/// Response status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    NotFound,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::NotFound => 404,
        }
    }

    fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::NotFound => "Not Found",
        }
    }
}

/// A complete single-shot response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: Status,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// HTML page with status 200.
    pub fn html(body: String) -> Self {
        Self {
            status: Status::Ok,
            content_type: "text/html; charset=utf-8",
            body: body.into_bytes(),
        }
    }

    /// HTML page with status 404.
    pub fn not_found(body: String) -> Self {
        Self {
            status: Status::NotFound,
            ..Self::html(body)
        }
    }

    /// Serialize head and body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let head = format!(
            "HTTP/1.1 {} {}\r\n\
             Content-Type: {}\r\n\
             Content-Length: {}\r\n\
             Access-Control-Allow-Origin: *\r\n\
             Connection: close\r\n\r\n",
            self.status.code(),
            self.status.reason(),
            self.content_type,
            self.body.len(),
        );
        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }

    /// Body as text, for logging and tests.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_login_request() {
        let req = HttpRequest::parse(
            b"GET /?username=alice&password=correct HTTP/1.1\r\nHost: portal\r\n\r\n",
        )
        .unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/");
        assert!(req.is_root());
        assert_eq!(
            req.credentials(),
            Some(Credentials {
                username: "alice".into(),
                password: "correct".into(),
            })
        );
    }

    #[test]
    fn test_alias_priority() {
        let req =
            HttpRequest::parse(b"GET /?user=bob&username=alice&pass=x&contrasenna=y HTTP/1.1")
                .unwrap();
        let creds = req.credentials().unwrap();
        assert_eq!(creds.username, "alice");
        assert_eq!(creds.password, "x");

        let req = HttpRequest::parse(b"GET /?usuario=carla&contrasenna=clave HTTP/1.1").unwrap();
        let creds = req.credentials().unwrap();
        assert_eq!(creds.username, "carla");
        assert_eq!(creds.password, "clave");
    }

    #[test]
    fn test_first_value_wins() {
        let req = HttpRequest::parse(b"GET /?user=a&user=b HTTP/1.1").unwrap();
        assert_eq!(req.param(USERNAME_ALIASES), Some("a"));
    }

    #[test]
    fn test_missing_or_blank_credentials() {
        let req = HttpRequest::parse(b"GET /?username=alice HTTP/1.1").unwrap();
        assert_eq!(req.credentials(), None);

        let req = HttpRequest::parse(b"GET /?username=alice&password= HTTP/1.1").unwrap();
        assert_eq!(req.credentials(), None);
    }

    #[test]
    fn test_query_decoding() {
        let req = HttpRequest::parse(b"GET /?user=j%C3%BAlia+m&pass=a%26b HTTP/1.1").unwrap();
        let creds = req.credentials().unwrap();
        assert_eq!(creds.username, "júlia m");
        assert_eq!(creds.password, "a&b");
    }

    #[test]
    fn test_absolute_form_target() {
        let req = HttpRequest::parse(b"GET http://example.com/logout?x=1 HTTP/1.1").unwrap();
        assert_eq!(req.path, "/logout");

        let req = HttpRequest::parse(b"GET http://example.com HTTP/1.1").unwrap();
        assert!(req.is_root());

        let req = HttpRequest::parse(b"GET /?next=http://example.com/a HTTP/1.1").unwrap();
        assert!(req.is_root());
    }

    #[test]
    fn test_malformed_request_line() {
        assert!(HttpRequest::parse(b"").is_err());
        assert!(HttpRequest::parse(b"GET\r\n\r\n").is_err());
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for("index.HTML"), "text/html; charset=utf-8");
        assert_eq!(content_type_for("a/b.htm"), "text/html; charset=utf-8");
        assert_eq!(content_type_for("style.css"), "text/css");
        assert_eq!(content_type_for("app.js"), "application/javascript");
        assert_eq!(content_type_for("logo.png"), "application/octet-stream");
        assert_eq!(content_type_for("README"), "application/octet-stream");
    }

    #[test]
    fn test_response_bytes() {
        let resp = HttpResponse::not_found("<p>ñ</p>".to_string());
        let text = String::from_utf8(resp.to_bytes()).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Content-Length: 9\r\n"));
        assert!(text.contains("Access-Control-Allow-Origin: *\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\n<p>ñ</p>"));
    }
}
