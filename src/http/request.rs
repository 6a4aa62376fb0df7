use std::collections::HashMap;

use crate::error::{ServerError, ServerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl Method {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "DELETE" => Some(Method::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }
}

/// One parsed request. Immutable once built; the raw trailing bytes are kept
/// alongside the (possibly multipart-extracted) body because chunked uploads
/// are decoded later, on the upload path only.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub raw_body: Vec<u8>,
    pub host: String,
    pub multipart_filename: Option<String>,
}

impl Request {
    /// Case-insensitive header lookup. Keys are stored case-preserved with
    /// last-write-wins on duplicates.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn path_only(&self) -> &str {
        match self.path.split_once('?') {
            Some((p, _)) => p,
            None => &self.path,
        }
    }

    pub fn query(&self) -> &str {
        match self.path.split_once('?') {
            Some((_, q)) => q,
            None => "",
        }
    }

    pub fn is_chunked(&self) -> bool {
        self.header("Transfer-Encoding")
            .map(|v| v.eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
    }

    /// Headers plus body are all buffered; parse the lot.
    pub fn parse(raw: &[u8]) -> ServerResult<Request> {
        let header_end = find_header_end(raw)
            .ok_or_else(|| ServerError::MalformedRequest("missing header terminator".into()))?;
        let head = std::str::from_utf8(&raw[..header_end])
            .map_err(|_| ServerError::MalformedRequest("header block is not valid UTF-8".into()))?;

        let mut lines = head.split("\r\n");
        let request_line = lines
            .next()
            .ok_or_else(|| ServerError::MalformedRequest("empty request".into()))?;
        let (method, path, version) = parse_request_line(request_line)?;

        let mut headers = HashMap::new();
        let mut host = String::new();
        let mut boundary = None;
        for line in lines {
            if line.is_empty() {
                break;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            if key.eq_ignore_ascii_case("host") {
                host = value.to_string();
            }
            if let Some(b) = extract_boundary(line) {
                boundary = Some(b);
            }
            headers.insert(key.to_string(), value.to_string());
        }

        let raw_body = raw[header_end..].to_vec();
        let mut request = Request {
            method,
            path,
            version,
            headers,
            body: Vec::new(),
            raw_body,
            host,
            multipart_filename: None,
        };

        if request.raw_body.is_empty() || request.is_chunked() {
            // chunked bodies stay undecoded here; the upload path decodes them
            return Ok(request);
        }

        let is_multipart = request
            .header("Content-Type")
            .map(|v| v.to_ascii_lowercase().contains("multipart/form-data"))
            .unwrap_or(false);
        if is_multipart {
            if let Some(boundary) = boundary {
                let (payload, filename) = extract_first_part(&request.raw_body, &boundary);
                request.body = payload;
                request.multipart_filename = filename;
                return Ok(request);
            }
        }

        request.body = request.raw_body.clone();
        Ok(request)
    }

    /// Completeness test run by the multiplexer after every read.
    pub fn is_complete(buf: &[u8]) -> bool {
        let Some(header_end) = find_header_end(buf) else {
            return false;
        };
        match declared_content_length(&buf[..header_end]) {
            Some(length) => buf.len() - header_end >= length,
            None => {
                if header_value(&buf[..header_end], "transfer-encoding")
                    .map(|v| v.eq_ignore_ascii_case("chunked"))
                    .unwrap_or(false)
                {
                    find_bytes(&buf[header_end..], b"0\r\n\r\n").is_some()
                } else {
                    true
                }
            }
        }
    }

    /// Declared Content-Length of a buffered (possibly incomplete) request,
    /// read straight from the raw header block. Used for the body-size
    /// ceiling check before full parsing.
    pub fn declared_length(buf: &[u8]) -> Option<usize> {
        let header_end = find_header_end(buf)?;
        declared_content_length(&buf[..header_end])
    }
}

fn parse_request_line(line: &str) -> ServerResult<(Method, String, String)> {
    let mut parts = line.split_whitespace();
    let (Some(method), Some(path), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ServerError::MalformedRequest(format!(
            "incomplete request line: {line:?}"
        )));
    };
    let method = Method::from_token(&method.to_ascii_uppercase()).ok_or_else(|| {
        ServerError::MalformedRequest(format!("unsupported method: {method}"))
    })?;
    Ok((method, path.to_string(), version.to_string()))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    find_bytes(buf, b"\r\n\r\n").map(|pos| pos + 4)
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn header_value(head: &[u8], lowered_name: &str) -> Option<String> {
    let head = std::str::from_utf8(head).ok()?;
    for line in head.split("\r\n").skip(1) {
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            if key.trim().eq_ignore_ascii_case(lowered_name) {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

fn declared_content_length(head: &[u8]) -> Option<usize> {
    header_value(head, "content-length").and_then(|v| v.parse().ok())
}

fn extract_boundary(header_line: &str) -> Option<String> {
    let pos = header_line.find("boundary=")?;
    let mut b = &header_line[pos + "boundary=".len()..];
    b = b.strip_prefix('"').unwrap_or(b);
    b = b.strip_suffix('"').unwrap_or(b);
    Some(b.to_string())
}

/// First part of a multipart body: the bytes between the end of the part's
/// header block and the next boundary marker, trailing line terminators
/// stripped. Also pulls a filename out of its Content-Disposition.
fn extract_first_part(body: &[u8], boundary: &str) -> (Vec<u8>, Option<String>) {
    let filename = std::str::from_utf8(body)
        .ok()
        .and_then(|text| {
            text.lines()
                .find(|l| l.to_ascii_lowercase().starts_with("content-disposition"))
                .and_then(extract_filename)
        });

    let Some(start) = find_bytes(body, b"\r\n\r\n").map(|p| p + 4) else {
        return (Vec::new(), filename);
    };
    let marker = format!("--{boundary}").into_bytes();
    let Some(end) = find_bytes(&body[start..], &marker).map(|p| p + start) else {
        return (Vec::new(), filename);
    };

    let mut payload = &body[start..end];
    while let [rest @ .., b'\r' | b'\n'] = payload {
        payload = rest;
    }
    (payload.to_vec(), filename)
}

pub fn extract_filename(content_disposition: &str) -> Option<String> {
    let lowered = content_disposition.to_ascii_lowercase();
    let pos = lowered.find("filename=")?;
    let rest = &content_disposition[pos + "filename=".len()..];
    let rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '"');
    let end = rest
        .find('"')
        .or_else(|| rest.find(';'))
        .unwrap_or(rest.len());
    let name = rest[..end].trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Hexadecimal size line, chunk data, repeat; a zero-size chunk terminates.
pub fn decode_chunked(raw: &[u8]) -> Vec<u8> {
    let mut decoded = Vec::new();
    let mut pos = 0;
    while pos < raw.len() {
        let Some(line_end) = find_bytes(&raw[pos..], b"\r\n").map(|p| p + pos) else {
            break;
        };
        let Ok(size_line) = std::str::from_utf8(&raw[pos..line_end]) else {
            break;
        };
        let Ok(size) = usize::from_str_radix(size_line.trim(), 16) else {
            break;
        };
        if size == 0 {
            break;
        }
        let data_start = line_end + 2;
        let data_end = data_start + size;
        if data_end > raw.len() {
            break;
        }
        decoded.extend_from_slice(&raw[data_start..data_end]);
        pos = data_end + 2; // skip the chunk's trailing CRLF
    }
    decoded
}
