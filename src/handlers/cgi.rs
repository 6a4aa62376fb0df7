use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::process::ExitStatusExt;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};

use log::warn;

use crate::config::LocationSpec;
use crate::error::{ServerError, ServerResult};
use crate::http::request::Request;

pub const CGI_TIMEOUT_SECS: u64 = 3;

/// What the gateway process produced, before the multiplexer turns it into
/// a Response. Transient; consumed immediately.
#[derive(Debug)]
pub struct CgiOutcome {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

/// A request is a CGI request when the location declares an extension and
/// the path either ends with it, or names the location itself and an index
/// file exists to stand in for the script (extensionless index CGI).
pub fn applies(request: &Request, location: Option<&LocationSpec>) -> bool {
    let Some(location) = location else {
        return false;
    };
    let Some(ext) = &location.cgi_extension else {
        return false;
    };
    let path = request.path_only();
    if path.ends_with(ext.as_str()) {
        return true;
    }
    path == location.path && !location.index.is_empty()
}

/// Resolves the script's filesystem path: the effective index is appended
/// for directory-shaped targets, the location prefix is stripped, and the
/// remainder lands under the document root.
pub fn script_path(
    request: &Request,
    location: &LocationSpec,
    docroot: &str,
    index: &str,
) -> PathBuf {
    let mut target = request.path_only().to_string();
    if target == location.path || target.ends_with('/') {
        if !target.ends_with('/') {
            target.push('/');
        }
        target.push_str(index);
    }
    let relative = target
        .strip_prefix(location.path.as_str())
        .unwrap_or(&target)
        .trim_start_matches('/');
    lexical_normalize(&Path::new(docroot).join(relative))
}

/// The script must exist, be executable, and canonicalize inside the
/// canonical document root. Missing scripts are 404; everything else 403.
pub fn validate_script(script: &Path, docroot: &str) -> ServerResult<PathBuf> {
    let meta = std::fs::metadata(script)
        .map_err(|_| ServerError::NotFound(script.display().to_string()))?;
    if meta.permissions().mode() & 0o111 == 0 {
        return Err(ServerError::PathEscape(format!(
            "{} is not executable",
            script.display()
        )));
    }

    let canonical = script
        .canonicalize()
        .map_err(|_| ServerError::NotFound(script.display().to_string()))?;
    let canonical_root = Path::new(docroot)
        .canonicalize()
        .unwrap_or_else(|_| lexical_normalize(Path::new(docroot)));
    if !canonical.starts_with(&canonical_root) {
        return Err(ServerError::PathEscape(canonical.display().to_string()));
    }
    Ok(canonical)
}

/// One child per request: body on stdin, output on stdout, a bounded wait
/// for the first readable byte. The child is reaped on every path.
pub fn run(
    request: &Request,
    script: &Path,
    interpreter: Option<&str>,
) -> ServerResult<CgiOutcome> {
    let script_str = script.to_string_lossy();
    let mut command = match interpreter {
        Some(interpreter) => {
            let mut cmd = Command::new(interpreter);
            cmd.arg(script);
            cmd
        }
        None => Command::new(script),
    };

    let content_length = request
        .header("Content-Length")
        .map(str::to_string)
        .unwrap_or_else(|| request.body.len().to_string());

    let mut child = command
        .env("GATEWAY_INTERFACE", "CGI/1.1")
        .env("REQUEST_METHOD", request.method.as_str())
        .env("SCRIPT_FILENAME", script_str.as_ref())
        .env("QUERY_STRING", request.query())
        .env("CONTENT_TYPE", request.header("Content-Type").unwrap_or(""))
        .env("CONTENT_LENGTH", content_length)
        .env("SERVER_PROTOCOL", "HTTP/1.1")
        .env("HTTP_HOST", &request.host)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        if !request.body.is_empty() {
            // a child that exits without reading gets EPIPE here; not fatal
            let _ = stdin.write_all(&request.body);
        }
    }

    let mut stdout = match child.stdout.take() {
        Some(stdout) => stdout,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ServerError::UpstreamKilled("no stdout pipe".into()));
        }
    };

    let mut pfd = libc::pollfd {
        fd: stdout.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let ready = unsafe { libc::poll(&mut pfd, 1, (CGI_TIMEOUT_SECS * 1000) as i32) };
    if ready == 0 {
        warn!("cgi script {} timed out, killing it", script.display());
        let _ = child.kill();
        let _ = child.wait();
        return Err(ServerError::UpstreamTimeout(CGI_TIMEOUT_SECS));
    }
    if ready < 0 {
        let _ = child.kill();
        let _ = child.wait();
        return Err(ServerError::Io(std::io::Error::last_os_error()));
    }

    let mut output = Vec::new();
    stdout.read_to_end(&mut output)?;
    let status = child.wait()?;

    if let Some(signal) = status.signal() {
        return Err(ServerError::UpstreamKilled(format!("signal {signal}")));
    }
    match status.code() {
        Some(0) | None => {}
        Some(code) => return Err(ServerError::UpstreamFailed(code)),
    }

    Ok(parse_output(&output))
}

/// Header block, blank line (either line ending), body. A `Status`
/// pseudo-header carries the numeric code; keys are lowercased. Output with
/// no separator is all body.
pub fn parse_output(output: &[u8]) -> CgiOutcome {
    let (head, body) = match find(output, b"\r\n\r\n") {
        Some(pos) => (&output[..pos], &output[pos + 4..]),
        None => match find(output, b"\n\n") {
            Some(pos) => (&output[..pos], &output[pos + 2..]),
            None => (&output[..0], output),
        },
    };

    let mut status = 200;
    let mut headers = BTreeMap::new();
    if let Ok(head) = std::str::from_utf8(head) {
        for line in head.lines() {
            let line = line.trim_end_matches('\r');
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();
            if key == "status" {
                if let Some(code) = value
                    .split_whitespace()
                    .next()
                    .and_then(|c| c.parse::<u16>().ok())
                {
                    status = code;
                }
            } else {
                headers.insert(key, value.to_string());
            }
        }
    }

    CgiOutcome {
        status,
        headers,
        body: body.to_vec(),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}
