use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use log::warn;

use crate::config::models::{Config, LocationSpec, RawConfig, RawLocation, RawServer, ServerSpec};
use crate::error::{ServerError, ServerResult};

pub const MAX_BODY_CEILING: usize = 100 * 1024 * 1024;

const KNOWN_METHODS: [&str; 7] = ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];
const REDIRECT_CODES: [u16; 4] = [301, 302, 307, 308];
const EXPECTED_ERROR_PAGES: [u16; 4] = [400, 403, 404, 500];

fn fatal(msg: String) -> ServerError {
    ServerError::Config(msg)
}

/// Turns the raw serde model into the runtime snapshot, applying defaults
/// and the validation policy. Violations that would make the server
/// misbehave are fatal; findings the server can live with are warnings.
pub fn validate(raw: RawConfig) -> ServerResult<Config> {
    if raw.servers.is_empty() {
        return Err(fatal("no servers defined in config".into()));
    }

    let mut servers = Vec::with_capacity(raw.servers.len());
    for (i, srv) in raw.servers.into_iter().enumerate() {
        servers.push(validate_server(i, srv)?);
    }

    check_unique_bindings(&servers)?;

    Ok(Config { servers })
}

fn validate_server(i: usize, raw: RawServer) -> ServerResult<ServerSpec> {
    if raw.listen == 0 {
        return Err(fatal(format!("server {i}: listen port must be 1-65535")));
    }
    if raw.listen < 1024 {
        warn!("server {i}: port {} needs elevated privileges on Linux", raw.listen);
    }

    let root = raw
        .root
        .filter(|r| !r.is_empty())
        .ok_or_else(|| fatal(format!("server {i}: root is required")))?;
    if !Path::new(&root).is_dir() {
        return Err(fatal(format!("server {i}: root path does not exist: {root}")));
    }

    if raw.server_names.is_empty() {
        return Err(fatal(format!("server {i}: at least one server_name is required")));
    }

    if raw.client_max_body_size == 0 || raw.client_max_body_size > MAX_BODY_CEILING {
        return Err(fatal(format!(
            "server {i}: client_max_body_size must be 1..={MAX_BODY_CEILING} bytes"
        )));
    }

    let index = if raw.index.is_empty() {
        vec!["index.html".to_string()]
    } else {
        raw.index
    };
    for idx in &index {
        let full = Path::new(&root).join(idx);
        if !full.is_file() {
            warn!("server {i}: index file does not exist: {}", full.display());
        }
    }

    let mut error_pages = BTreeMap::new();
    for (code_str, page) in raw.error_pages {
        let code: u16 = code_str
            .parse()
            .map_err(|_| fatal(format!("server {i}: invalid error_page code: {code_str}")))?;
        if !(100..=599).contains(&code) {
            return Err(fatal(format!("server {i}: error_page code out of range: {code}")));
        }
        error_pages.insert(code, page);
    }
    for code in EXPECTED_ERROR_PAGES {
        if !error_pages.contains_key(&code) {
            warn!("server {i}: no error_page configured for {code}");
        }
    }

    if raw.locations.is_empty() {
        return Err(fatal(format!("server {i}: at least one location block is required")));
    }
    let mut locations = Vec::with_capacity(raw.locations.len());
    for (j, loc) in raw.locations.into_iter().enumerate() {
        locations.push(validate_location(i, j, loc)?);
    }

    Ok(ServerSpec {
        listen_port: raw.listen,
        server_names: raw.server_names,
        root,
        index,
        client_max_body_size: raw.client_max_body_size,
        error_pages,
        locations,
    })
}

fn validate_location(i: usize, j: usize, raw: RawLocation) -> ServerResult<LocationSpec> {
    let at = format!("server {i} location {j}");

    if raw.path.is_empty() || !raw.path.starts_with('/') {
        return Err(fatal(format!("{at}: path must be non-empty and start with '/'")));
    }

    let methods = if raw.methods.is_empty() {
        vec!["GET".to_string()]
    } else {
        raw.methods
    };
    for m in &methods {
        if m.chars().any(|c| c.is_ascii_lowercase()) {
            return Err(fatal(format!("{at}: HTTP method must be uppercase: {m}")));
        }
        if !KNOWN_METHODS.contains(&m.as_str()) {
            return Err(fatal(format!("{at}: unknown HTTP method: {m}")));
        }
    }

    if let Some(root) = &raw.root {
        if !Path::new(root).is_dir() {
            return Err(fatal(format!("{at}: root path does not exist: {root}")));
        }
    }
    if let Some(upload) = &raw.upload_path {
        if !Path::new(upload).is_dir() {
            return Err(fatal(format!("{at}: upload_path does not exist: {upload}")));
        }
    }

    if let Some(ext) = &raw.cgi_extension {
        if !ext.starts_with('.') {
            return Err(fatal(format!("{at}: cgi_extension must start with '.': {ext}")));
        }
        if ext[1..]
            .chars()
            .any(|c| !c.is_ascii_alphanumeric() && c != '_' && c != '-')
        {
            return Err(fatal(format!("{at}: cgi_extension contains invalid character: {ext}")));
        }
        let interp = raw
            .cgi_interpreter
            .as_deref()
            .ok_or_else(|| fatal(format!("{at}: cgi_extension set but no cgi_interpreter")))?;
        if !Path::new(interp).exists() {
            return Err(fatal(format!("{at}: cgi_interpreter does not exist: {interp}")));
        }
    }

    if let Some(redirect) = &raw.redirect {
        if !redirect.starts_with('/') {
            return Err(fatal(format!("{at}: redirect must start with '/': {redirect}")));
        }
    }
    let redirect_code = raw.redirect_code.unwrap_or(301);
    if raw.redirect.is_some() && !REDIRECT_CODES.contains(&redirect_code) {
        return Err(fatal(format!("{at}: redirect_code must be one of 301/302/307/308")));
    }

    let index = raw.index;
    if let Some(root) = raw.root.as_deref() {
        for idx in &index {
            let full = Path::new(root).join(idx);
            if !full.is_file() {
                warn!("{at}: index file does not exist: {}", full.display());
            }
        }
    }

    Ok(LocationSpec {
        path: raw.path,
        methods,
        root: raw.root,
        index,
        upload_path: raw.upload_path,
        cgi_extension: raw.cgi_extension,
        cgi_interpreter: raw.cgi_interpreter,
        redirect: raw.redirect,
        redirect_code,
    })
}

/// (port, name) pairs must be globally unique. Every server carries at
/// least one name by the time this runs; empty name lists are fatal earlier.
fn check_unique_bindings(servers: &[ServerSpec]) -> ServerResult<()> {
    let mut seen: HashSet<(u16, &str)> = HashSet::new();
    for srv in servers {
        for name in &srv.server_names {
            if !seen.insert((srv.listen_port, name.as_str())) {
                return Err(fatal(format!(
                    "duplicate (port, server_name) binding: {}:{name}",
                    srv.listen_port
                )));
            }
        }
    }
    Ok(())
}
