use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::config::ServerSpec;
use crate::http::request::Request;

pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "Request-URI Too Long",
        415 => "Unsupported Media Type",
        417 => "Expectation Failed",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown Error",
    }
}

// Statuses that force Connection: close regardless of what was negotiated.
const MUST_CLOSE: [u16; 4] = [400, 408, 413, 500];

/// Mutable while a handler builds it, serialized exactly once per request.
/// Headers are kept sorted so serialization is deterministic.
#[derive(Debug)]
pub struct Response {
    status: u16,
    reason: String,
    version: String,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    pub fn new() -> Self {
        Response {
            status: 200,
            reason: "OK".to_string(),
            version: "HTTP/1.1".to_string(),
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    pub fn set_status(&mut self, code: u16) {
        self.status = code;
        self.reason = reason_phrase(code).to_string();
    }

    pub fn set_header(&mut self, key: &str, value: &str) {
        self.headers.insert(key.to_string(), value.to_string());
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Adopts the request's protocol version and settles the
    /// connection-persistence decision: HTTP/1.1 stays open unless the client
    /// said close, HTTP/1.0 stays open only on an explicit keep-alive, and a
    /// handful of statuses always close.
    pub fn finalize(&mut self, request: &Request) {
        self.version = request.version.clone();
        let connection = request.header("Connection").unwrap_or("");
        let negotiated = match request.version.as_str() {
            "HTTP/1.1" => !connection.eq_ignore_ascii_case("close"),
            "HTTP/1.0" => connection.eq_ignore_ascii_case("keep-alive"),
            _ => false,
        };
        let keep_alive = negotiated && !MUST_CLOSE.contains(&self.status);
        self.set_header("Connection", if keep_alive { "keep-alive" } else { "close" });
    }

    /// Status line, headers, blank line, body. Content-Length, Content-Type
    /// and Connection are injected here when a handler did not set them.
    pub fn into_bytes(mut self) -> Vec<u8> {
        self.headers
            .entry("Content-Length".to_string())
            .or_insert_with(|| self.body.len().to_string());
        self.headers
            .entry("Content-Type".to_string())
            .or_insert_with(|| "text/html".to_string());
        self.headers
            .entry("Connection".to_string())
            .or_insert_with(|| "close".to_string());

        let mut out = format!("{} {} {}\r\n", self.version, self.status, self.reason);
        for (key, value) in &self.headers {
            out.push_str(key);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");

        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }

    /// Error page lookup order: the server's configured page for the code,
    /// then `<root>/error.html`, then a generated minimal page.
    pub fn from_error_code(code: u16, server: &ServerSpec) -> Response {
        let mut res = Response::new();
        res.set_status(code);

        let body = server
            .error_pages
            .get(&code)
            .and_then(|page| fs::read(page).ok())
            .or_else(|| fs::read(Path::new(&server.root).join("error.html")).ok())
            .unwrap_or_else(|| minimal_page(code).into_bytes());

        res.set_header("Content-Type", "text/html");
        res.set_header("Content-Length", &body.len().to_string());
        res.set_body(body);
        res
    }

    /// Minimal status-only response; no config involved. 204 gets an empty
    /// body with an explicit zero Content-Length.
    pub fn with_status(code: u16) -> Response {
        let mut res = Response::new();
        res.set_status(code);
        res.set_body(minimal_page(code));
        res.set_header("Content-Type", "text/html");
        res.set_header("Content-Length", &res.body.len().to_string());

        if code == 204 {
            res.set_body("");
            res.set_header("Content-Length", "0");
        }
        res
    }
}

fn minimal_page(code: u16) -> String {
    let reason = reason_phrase(code);
    format!(
        "<html><head><title>{code} {reason}</title></head><body><h1>{code} {reason}</h1></body></html>"
    )
}
