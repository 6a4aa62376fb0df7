use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{error, info};

use crate::config::{LocationSpec, ServerSpec};
use crate::error::{ServerError, ServerResult};
use crate::http::request::{decode_chunked, Method, Request};
use crate::http::response::Response;

const MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

/// Static file serving, uploads, deletions and directory listings for one
/// resolved (server, location) pair. CGI requests never reach this type.
pub struct Router<'a> {
    docroot: String,
    upload_dir: String,
    index: String,
    server: &'a ServerSpec,
    location: Option<&'a LocationSpec>,
}

impl<'a> Router<'a> {
    pub fn new(
        docroot: String,
        upload_dir: String,
        index: String,
        server: &'a ServerSpec,
        location: Option<&'a LocationSpec>,
    ) -> Self {
        Router {
            docroot,
            upload_dir,
            index,
            server,
            location,
        }
    }

    pub fn handle(&self, request: &Request) -> Response {
        let path = request.path_only().to_string();

        // Fixed redirects come first and bypass the method checks entirely.
        if let Some(res) = self.fixed_redirect(&path) {
            let mut res = res;
            res.finalize(request);
            return res;
        }

        let mut res = match self.dispatch(request, &path) {
            Ok(res) => res,
            Err(err) => {
                error!("{} {}: {}", request.method.as_str(), path, err);
                self.error_response(&err)
            }
        };
        res.finalize(request);
        res
    }

    fn dispatch(&self, request: &Request, path: &str) -> ServerResult<Response> {
        if let Some(location) = self.location {
            if let Some(target) = &location.redirect {
                return Ok(redirect(location.redirect_code, target));
            }
        }

        if !method_allowed(request.method, path) {
            return Err(ServerError::MethodNotAllowed);
        }

        match request.method {
            Method::Get => self.handle_get(path),
            Method::Post => self.handle_post(request),
            Method::Delete => self.handle_delete(path),
        }
    }

    fn error_response(&self, err: &ServerError) -> Response {
        match err {
            // 405 is deliberately generic, no per-server page lookup
            ServerError::MethodNotAllowed => Response::with_status(405),
            _ => Response::from_error_code(err.status_code(), self.server),
        }
    }

    fn fixed_redirect(&self, path: &str) -> Option<Response> {
        match path {
            "/old-page" => Some(redirect(301, "/")),
            "/redirect-upload" => Some(redirect(302, "/upload")),
            "/redirect-calculator" => Some(redirect(307, "/calculator")),
            _ => None,
        }
    }

    fn handle_get(&self, path: &str) -> ServerResult<Response> {
        let root = normalize(Path::new(&self.docroot));
        let mut full = normalize(&root.join(path.trim_start_matches('/')));

        if !full.starts_with(&root) {
            return Err(ServerError::PathEscape(path.to_string()));
        }

        if !full.exists() {
            let with_html = PathBuf::from(format!("{}.html", full.display()));
            if with_html.exists() {
                full = with_html;
            } else {
                return Err(ServerError::NotFound(path.to_string()));
            }
        }

        // the target exists by now, so its real path can be checked; a
        // symlink inside the tree may point anywhere
        full = self.contained_real_path(&full, path)?;

        if full.is_dir() {
            let index_path = full.join(&self.index);
            if index_path.is_file() {
                full = self.contained_real_path(&index_path, path)?;
            } else {
                return self.directory_listing(&full, path);
            }
        }

        let body = fs::read(&full)?;
        let mut res = Response::new();
        res.set_status(200);
        res.set_header("Content-Type", content_type(&full));
        res.set_header("Content-Length", &body.len().to_string());
        res.set_body(body);
        Ok(res)
    }

    fn directory_listing(&self, dir: &Path, url_path: &str) -> ServerResult<Response> {
        let mut entries: Vec<(String, bool, u64)> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = entry.metadata()?;
            entries.push((name, meta.is_dir(), meta.len()));
        }
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let mut html = format!(
            "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"UTF-8\">\n\
             <title>Index of {url_path}</title>\n</head>\n<body>\n\
             <h1>Index of {url_path}</h1>\n<table>\n\
             <tr><th>Name</th><th>Size</th><th>Type</th></tr>\n"
        );

        if url_path != "/" && !url_path.is_empty() {
            let trimmed = url_path.trim_end_matches('/');
            let parent = match trimmed.rfind('/') {
                Some(pos) => &trimmed[..pos + 1],
                None => "/",
            };
            html.push_str(&format!(
                "<tr><td><a href=\"{parent}\">[Parent Directory]</a></td>\
                 <td>-</td><td>Directory</td></tr>\n"
            ));
        }

        let base = if url_path.ends_with('/') {
            url_path.to_string()
        } else {
            format!("{url_path}/")
        };
        for (name, is_dir, size) in entries {
            if is_dir {
                html.push_str(&format!(
                    "<tr><td><a href=\"{base}{name}/\">{name}/</a></td>\
                     <td>-</td><td>Directory</td></tr>\n"
                ));
            } else {
                html.push_str(&format!(
                    "<tr><td><a href=\"{base}{name}\">{name}</a></td>\
                     <td>{}</td><td>File</td></tr>\n",
                    format_file_size(size)
                ));
            }
        }
        html.push_str("</table>\n</body>\n</html>");

        let mut res = Response::new();
        res.set_status(200);
        res.set_header("Content-Type", "text/html; charset=UTF-8");
        res.set_header("Content-Length", &html.len().to_string());
        res.set_body(html);
        Ok(res)
    }

    fn handle_post(&self, request: &Request) -> ServerResult<Response> {
        let declared = request.header("Content-Length");
        if declared.is_none() && !request.is_chunked() {
            return Err(ServerError::LengthRequired);
        }
        if let Some(length) = declared.and_then(|v| v.parse::<usize>().ok()) {
            if length > MAX_UPLOAD_BYTES {
                return Err(ServerError::PayloadTooLarge(length));
            }
        }

        let name = upload_name(request);

        let base = normalize(&Path::new(&self.docroot).join(&self.upload_dir));
        fs::create_dir_all(&base)?;

        let dest = normalize(&base.join(&name));
        if !dest.starts_with(&base) {
            return Err(ServerError::PathEscape(name));
        }
        if dest.exists() {
            return Err(ServerError::Conflict(name));
        }

        let body = if request.is_chunked() {
            decode_chunked(&request.raw_body)
        } else {
            request.body.clone()
        };
        fs::write(&dest, &body)?;
        info!("uploaded {} ({} bytes)", dest.display(), body.len());

        Ok(text_response(201, "Created\n"))
    }

    fn handle_delete(&self, path: &str) -> ServerResult<Response> {
        let Some(filename) = path.strip_prefix("/uploads/") else {
            return Err(ServerError::NotFound(path.to_string()));
        };

        let base = normalize(&Path::new(&self.docroot).join(&self.upload_dir));
        let target = normalize(&base.join(filename));

        if !target.starts_with(&base) {
            return Err(ServerError::PathEscape(path.to_string()));
        }
        if !target.exists() {
            return Err(ServerError::NotFound(path.to_string()));
        }

        fs::remove_file(&target)?;
        info!("deleted {}", target.display());
        Ok(Response::with_status(204))
    }

    /// Canonical form of an existing target, required to stay under the
    /// canonical document root. Lexical containment is not enough once
    /// symlinks are involved.
    fn contained_real_path(&self, target: &Path, url_path: &str) -> ServerResult<PathBuf> {
        let canonical = target
            .canonicalize()
            .map_err(|_| ServerError::NotFound(url_path.to_string()))?;
        let canonical_root = Path::new(&self.docroot)
            .canonicalize()
            .map_err(|_| ServerError::NotFound(url_path.to_string()))?;
        if !canonical.starts_with(&canonical_root) {
            return Err(ServerError::PathEscape(url_path.to_string()));
        }
        Ok(canonical)
    }
}

fn text_response(code: u16, body: &str) -> Response {
    let mut res = Response::new();
    res.set_status(code);
    res.set_header("Content-Type", "text/plain");
    res.set_header("Content-Length", &body.len().to_string());
    res.set_body(body);
    res
}

fn redirect(code: u16, target: &str) -> Response {
    let mut res = Response::new();
    res.set_status(code);
    res.set_header("Location", target);
    res.set_header("Content-Length", "0");
    res.set_body("");
    res
}

/// Method allow-list by path class. The fixed redirects never get here.
fn method_allowed(method: Method, path: &str) -> bool {
    if path == "/static" || path.starts_with("/static/") || path == "/index.html" {
        return method == Method::Get;
    }
    if path == "/upload"
        || path == "/upload.html"
        || (path.starts_with("/upload/") && !path.starts_with("/uploads/"))
    {
        return method == Method::Get;
    }
    if path == "/uploads" || path.starts_with("/uploads/") {
        return matches!(method, Method::Get | Method::Post | Method::Delete);
    }
    method == Method::Get
}

/// Lexical normalization: resolves `.` and `..` without touching the
/// filesystem, so containment can be checked for paths that may not exist.
fn normalize(path: &Path) -> PathBuf {
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

/// Destination filename for an upload: the request path's last segment,
/// else the multipart filename, else a timestamped fallback.
fn upload_name(request: &Request) -> String {
    if let Some(name) = last_path_segment(request.path_only()) {
        return name;
    }
    if let Some(name) = &request.multipart_filename {
        if last_path_segment(name).is_some() {
            return name.clone();
        }
    }
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("upload_{secs}.bin")
}

fn last_path_segment(path: &str) -> Option<String> {
    let name = match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    };
    let name = name.trim_start_matches(['/', '\\']);
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    if name.contains('/') || name.contains('\\') {
        return None;
    }
    Some(name.to_string())
}

fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("html") | Some("htm") => "text/html; charset=UTF-8",
        Some("css") => "text/css; charset=UTF-8",
        Some("js") => "application/javascript; charset=UTF-8",
        Some("txt") => "text/plain; charset=UTF-8",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// Human-readable size, one decimal, capped at GB.
fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.1} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::{tempdir, TempDir};

    fn server_spec(root: &Path) -> ServerSpec {
        ServerSpec {
            listen_port: 8080,
            server_names: vec!["localhost".into()],
            root: root.to_string_lossy().into_owned(),
            index: vec!["index.html".into()],
            client_max_body_size: 1024 * 1024,
            error_pages: BTreeMap::new(),
            locations: vec![],
        }
    }

    fn router_for<'a>(server: &'a ServerSpec) -> Router<'a> {
        Router::new(
            server.root.clone(),
            "uploads".into(),
            "index.html".into(),
            server,
            None,
        )
    }

    fn get(path: &str) -> Request {
        Request::parse(format!("GET {path} HTTP/1.1\r\nHost: x\r\n\r\n").as_bytes())
            .expect("request parses")
    }

    fn www() -> (TempDir, PathBuf) {
        let dir = tempdir().expect("tempdir");
        let root = dir.path().join("www");
        fs::create_dir(&root).expect("mkdir www");
        (dir, root)
    }

    #[test]
    fn get_root_serves_the_index_file() {
        let (_dir, root) = www();
        fs::write(root.join("index.html"), b"<h1>home</h1>").expect("write index");
        let server = server_spec(&root);
        let res = router_for(&server).handle(&get("/"));
        assert_eq!(res.status(), 200);
        assert_eq!(res.body(), b"<h1>home</h1>");
        assert_eq!(res.header("Content-Type"), Some("text/html; charset=UTF-8"));
    }

    #[test]
    fn get_missing_file_is_404_with_minimal_page() {
        let (_dir, root) = www();
        let server = server_spec(&root);
        let res = router_for(&server).handle(&get("/missing.html"));
        assert_eq!(res.status(), 404);
        let body = String::from_utf8(res.body().to_vec()).unwrap();
        assert!(body.contains("404 Not Found"));
    }

    #[test]
    fn get_retries_with_html_suffix() {
        let (_dir, root) = www();
        fs::write(root.join("about.html"), b"about us").expect("write about");
        let server = server_spec(&root);
        let res = router_for(&server).handle(&get("/about"));
        assert_eq!(res.status(), 200);
        assert_eq!(res.body(), b"about us");
    }

    #[test]
    fn traversal_outside_docroot_is_403() {
        let (_dir, root) = www();
        let server = server_spec(&root);
        let res = router_for(&server).handle(&get("/../../etc/passwd"));
        assert_eq!(res.status(), 403);
    }

    #[test]
    fn symlinked_directory_outside_docroot_is_403() {
        let (dir, root) = www();
        let outside = dir.path().join("outside");
        fs::create_dir(&outside).expect("mkdir outside");
        fs::write(outside.join("secret.txt"), b"TOP SECRET").expect("write secret");
        std::os::unix::fs::symlink(&outside, root.join("link")).expect("symlink");

        let server = server_spec(&root);
        let res = router_for(&server).handle(&get("/link/secret.txt"));
        assert_eq!(res.status(), 403);
    }

    #[test]
    fn symlinked_file_outside_docroot_is_403() {
        let (dir, root) = www();
        let secret = dir.path().join("secret.txt");
        fs::write(&secret, b"TOP SECRET").expect("write secret");
        std::os::unix::fs::symlink(&secret, root.join("leak.txt")).expect("symlink");

        let server = server_spec(&root);
        let res = router_for(&server).handle(&get("/leak.txt"));
        assert_eq!(res.status(), 403);
    }

    #[test]
    fn symlink_within_docroot_still_serves() {
        let (_dir, root) = www();
        fs::write(root.join("real.txt"), b"inside").expect("write real");
        std::os::unix::fs::symlink(root.join("real.txt"), root.join("alias.txt"))
            .expect("symlink");

        let server = server_spec(&root);
        let res = router_for(&server).handle(&get("/alias.txt"));
        assert_eq!(res.status(), 200);
        assert_eq!(res.body(), b"inside");
    }

    #[test]
    fn directory_without_index_gets_a_listing() {
        let (_dir, root) = www();
        fs::write(root.join("a.txt"), b"aaa").expect("write a");
        fs::create_dir(root.join("sub")).expect("mkdir sub");
        let server = server_spec(&root);
        let res = router_for(&server).handle(&get("/"));
        assert_eq!(res.status(), 200);
        let body = String::from_utf8(res.body().to_vec()).unwrap();
        assert!(body.contains("a.txt"));
        assert!(body.contains("sub/"));
        // directories sort before files
        assert!(body.find("sub/").unwrap() < body.find("a.txt").unwrap());
        // at the root there is no parent link
        assert!(!body.contains("[Parent Directory]"));
    }

    #[test]
    fn nested_listing_has_a_parent_link() {
        let (_dir, root) = www();
        fs::create_dir(root.join("files")).expect("mkdir files");
        fs::write(root.join("files/x.txt"), b"x").expect("write x");
        let server = server_spec(&root);
        let res = router_for(&server).handle(&get("/files/"));
        assert_eq!(res.status(), 200);
        let body = String::from_utf8(res.body().to_vec()).unwrap();
        assert!(body.contains("[Parent Directory]"));
        assert!(body.contains("1.0 B"));
    }

    fn post(path: &str, body: &[u8]) -> Request {
        let mut raw = format!(
            "POST {path} HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        raw.extend_from_slice(body);
        Request::parse(&raw).expect("request parses")
    }

    #[test]
    fn post_creates_upload_then_conflicts() {
        let (_dir, root) = www();
        let server = server_spec(&root);
        let router = router_for(&server);

        let res = router.handle(&post("/uploads/report.txt", b"hello"));
        assert_eq!(res.status(), 201);
        let written = fs::read(root.join("uploads/report.txt")).expect("file exists");
        assert_eq!(written, b"hello");

        let res = router.handle(&post("/uploads/report.txt", b"hello"));
        assert_eq!(res.status(), 409);
    }

    #[test]
    fn post_without_length_or_chunked_is_411() {
        let (_dir, root) = www();
        let server = server_spec(&root);
        let raw = b"POST /uploads/x HTTP/1.1\r\nHost: x\r\n\r\n";
        let req = Request::parse(raw).expect("parses");
        let res = router_for(&server).handle(&req);
        assert_eq!(res.status(), 411);
    }

    #[test]
    fn post_declaring_over_100mb_is_413() {
        let (_dir, root) = www();
        let server = server_spec(&root);
        let raw = format!(
            "POST /uploads/big HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n",
            MAX_UPLOAD_BYTES + 1
        );
        let req = Request::parse(raw.as_bytes()).expect("parses");
        let res = router_for(&server).handle(&req);
        assert_eq!(res.status(), 413);
    }

    #[test]
    fn post_declaring_exactly_the_ceiling_is_accepted() {
        let (_dir, root) = www();
        let server = server_spec(&root);
        let mut raw = format!(
            "POST /uploads/edge.bin HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n",
            MAX_UPLOAD_BYTES
        )
        .into_bytes();
        raw.extend_from_slice(b"tiny");
        let req = Request::parse(&raw).expect("parses");
        let res = router_for(&server).handle(&req);
        assert_eq!(res.status(), 201);
    }

    #[test]
    fn chunked_post_is_decoded_before_writing() {
        let (_dir, root) = www();
        let server = server_spec(&root);
        let raw = b"POST /uploads/wiki.txt HTTP/1.1\r\nHost: x\r\n\
Transfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n0\r\n\r\n";
        let req = Request::parse(raw).expect("parses");
        let res = router_for(&server).handle(&req);
        assert_eq!(res.status(), 201);
        assert_eq!(fs::read(root.join("uploads/wiki.txt")).unwrap(), b"Wiki");
    }

    fn delete(path: &str) -> Request {
        Request::parse(format!("DELETE {path} HTTP/1.1\r\nHost: x\r\n\r\n").as_bytes())
            .expect("request parses")
    }

    #[test]
    fn delete_removes_then_404s() {
        let (_dir, root) = www();
        fs::create_dir(root.join("uploads")).expect("mkdir uploads");
        fs::write(root.join("uploads/gone.txt"), b"bye").expect("write");
        let server = server_spec(&root);
        let router = router_for(&server);

        let res = router.handle(&delete("/uploads/gone.txt"));
        assert_eq!(res.status(), 204);
        assert!(res.body().is_empty());

        let res = router.handle(&delete("/uploads/gone.txt"));
        assert_eq!(res.status(), 404);
    }

    #[test]
    fn delete_outside_uploads_is_405() {
        let (_dir, root) = www();
        fs::write(root.join("keep.txt"), b"keep").expect("write");
        let server = server_spec(&root);
        // DELETE is only in the allow-list under /uploads
        let res = router_for(&server).handle(&delete("/keep.txt"));
        assert_eq!(res.status(), 405);
        assert!(root.join("keep.txt").exists());
    }

    #[test]
    fn disallowed_method_is_405() {
        let (_dir, root) = www();
        let server = server_spec(&root);
        let res = router_for(&server).handle(&post("/index.html", b"x"));
        assert_eq!(res.status(), 405);
    }

    #[test]
    fn fixed_redirects_bypass_method_checks() {
        let (_dir, root) = www();
        let server = server_spec(&root);
        let router = router_for(&server);

        let res = router.handle(&get("/old-page"));
        assert_eq!(res.status(), 301);
        assert_eq!(res.header("Location"), Some("/"));
        assert!(res.body().is_empty());

        let res = router.handle(&get("/redirect-upload"));
        assert_eq!(res.status(), 302);
        assert_eq!(res.header("Location"), Some("/upload"));

        let res = router.handle(&post("/redirect-calculator", b""));
        assert_eq!(res.status(), 307);
        assert_eq!(res.header("Location"), Some("/calculator"));
    }

    #[test]
    fn configured_location_redirect_answers_with_its_code() {
        let (_dir, root) = www();
        let server = server_spec(&root);
        let location = LocationSpec {
            path: "/docs".into(),
            methods: vec!["GET".into()],
            root: None,
            index: vec![],
            upload_path: None,
            cgi_extension: None,
            cgi_interpreter: None,
            redirect: Some("/".into()),
            redirect_code: 308,
        };
        let router = Router::new(
            server.root.clone(),
            "uploads".into(),
            "index.html".into(),
            &server,
            Some(&location),
        );
        let res = router.handle(&get("/docs/manual"));
        assert_eq!(res.status(), 308);
        assert_eq!(res.header("Location"), Some("/"));
    }
}
