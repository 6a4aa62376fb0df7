//! End-to-end tests over a real socket: each test boots the server on its
//! own port, then speaks raw HTTP/1.1 to it. The server closes the
//! connection after every response, so `read_to_end` delimits a reply.

use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;

use rhttpd::config;
use rhttpd::server::Server;

fn write_config(dir: &Path, root: &Path, port: u16) -> String {
    let path = dir.join("rhttpd.toml");
    let toml = format!(
        r#"
[[server]]
listen = {port}
server_names = ["localhost"]
root = "{root}"
client_max_body_size = 4096

[[server.location]]
path = "/"
methods = ["GET", "POST", "DELETE"]
"#,
        root = root.display()
    );
    fs::write(&path, toml).expect("write config");
    path.to_string_lossy().into_owned()
}

fn boot(port: u16) -> TempDir {
    let dir = TempDir::new().expect("tempdir");
    let root = dir.path().join("www");
    fs::create_dir(&root).expect("mkdir www");
    fs::write(root.join("index.html"), b"<h1>it works</h1>").expect("write index");
    fs::create_dir(root.join("static")).expect("mkdir static");
    fs::write(root.join("static/note.txt"), b"plain note").expect("write note");

    let config_path = write_config(dir.path(), &root, port);
    let cfg = config::load(&config_path).expect("config loads");
    let mut server = Server::new(cfg).expect("server builds");
    server.bind().expect("port binds");
    thread::spawn(move || server.run());
    dir
}

fn send(port: u16, request: &[u8]) -> String {
    // the server thread may still be between bind and poll
    let mut stream = connect_with_retry(port);
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("set read timeout");
    stream.write_all(request).expect("send request");
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).expect("read response");
    String::from_utf8_lossy(&reply).into_owned()
}

fn connect_with_retry(port: u16) -> TcpStream {
    for _ in 0..50 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)) {
            return stream;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("server never came up on port {port}");
}

#[test]
fn get_root_serves_index_and_closes() {
    let _www = boot(18081);
    let reply = send(18081, b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "got: {reply}");
    assert!(reply.contains("Content-Type: text/html"));
    assert!(reply.ends_with("<h1>it works</h1>"));
}

#[test]
fn get_static_file_has_plain_content_type() {
    let _www = boot(18082);
    let reply = send(18082, b"GET /static/note.txt HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "got: {reply}");
    assert!(reply.contains("Content-Type: text/plain"));
    assert!(reply.ends_with("plain note"));
}

#[test]
fn missing_file_is_404() {
    let _www = boot(18083);
    let reply = send(18083, b"GET /nope.html HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(reply.starts_with("HTTP/1.1 404 Not Found\r\n"), "got: {reply}");
    assert!(reply.contains("404 Not Found"));
}

#[test]
fn upload_then_fetch_then_delete() {
    let www = boot(18084);
    let reply = send(
        18084,
        b"POST /uploads/hello.txt HTTP/1.1\r\nHost: localhost\r\n\
          Content-Length: 5\r\n\r\nhello",
    );
    assert!(reply.starts_with("HTTP/1.1 201 Created\r\n"), "got: {reply}");
    let stored = www.path().join("www/uploads/hello.txt");
    assert_eq!(fs::read(&stored).expect("uploaded file"), b"hello");

    let reply = send(
        18084,
        b"GET /uploads/hello.txt HTTP/1.1\r\nHost: localhost\r\n\r\n",
    );
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "got: {reply}");
    assert!(reply.ends_with("hello"));

    let reply = send(
        18084,
        b"DELETE /uploads/hello.txt HTTP/1.1\r\nHost: localhost\r\n\r\n",
    );
    assert!(reply.starts_with("HTTP/1.1 204 No Content\r\n"), "got: {reply}");
    assert!(!stored.exists());
}

#[test]
fn body_over_configured_ceiling_is_413_with_close() {
    let _www = boot(18085);
    // declared length alone trips the ceiling, no body bytes are sent
    let reply = send(
        18085,
        b"POST /uploads/big.bin HTTP/1.1\r\nHost: localhost\r\n\
          Content-Length: 5000\r\n\r\n",
    );
    assert!(
        reply.starts_with("HTTP/1.1 413 Payload Too Large\r\n"),
        "got: {reply}"
    );
    assert!(reply.contains("Connection: close"));
}

#[test]
fn malformed_request_line_is_400() {
    let _www = boot(18086);
    let reply = send(18086, b"NONSENSE\r\n\r\n");
    assert!(reply.starts_with("HTTP/1.1 400 Bad Request\r\n"), "got: {reply}");
    assert!(reply.contains("Connection: close"));
}

#[test]
fn post_to_static_page_is_405() {
    let _www = boot(18087);
    let reply = send(
        18087,
        b"POST /index.html HTTP/1.1\r\nHost: localhost\r\n\
          Content-Length: 1\r\n\r\nx",
    );
    assert!(
        reply.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"),
        "got: {reply}"
    );
}

#[test]
fn fixed_redirect_is_served_over_the_wire() {
    let _www = boot(18088);
    let reply = send(18088, b"GET /old-page HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(
        reply.starts_with("HTTP/1.1 301 Moved Permanently\r\n"),
        "got: {reply}"
    );
    assert!(reply.contains("Location: /"));
}

#[test]
fn chunked_upload_is_decoded() {
    let www = boot(18089);
    let reply = send(
        18089,
        b"POST /uploads/wiki.txt HTTP/1.1\r\nHost: localhost\r\n\
          Transfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n0\r\n\r\n",
    );
    assert!(reply.starts_with("HTTP/1.1 201 Created\r\n"), "got: {reply}");
    let stored = www.path().join("www/uploads/wiki.txt");
    assert_eq!(fs::read(&stored).expect("uploaded file"), b"Wiki");
}
