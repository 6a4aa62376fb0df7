pub mod connection;
pub mod resolver;

use std::collections::{HashMap, HashSet};
use std::io::{self, Read, Write};

use log::{error, info, warn};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};

use crate::config::Config;
use crate::error::ServerResult;
use crate::handlers::cgi;
use crate::handlers::router::Router;
use crate::http::request::Request;
use crate::http::response::Response;
use crate::server::connection::{Connection, ConnectionState};
use crate::server::resolver::Resolved;

// Listener tokens live below this; connection tokens above. Tokens are never
// reused, so a connection's identity stays stable for its whole life.
const LISTENER_TOKEN_MAX: usize = 100;

pub struct Server {
    poll: Poll,
    listeners: HashMap<Token, ListenerEntry>,
    connections: HashMap<Token, Connection>,
    config: Config,
    next_token: usize,
}

struct ListenerEntry {
    listener: TcpListener,
    port: u16,
}

impl Server {
    pub fn new(config: Config) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            listeners: HashMap::new(),
            connections: HashMap::new(),
            config,
            next_token: LISTENER_TOKEN_MAX,
        })
    }

    /// One listener per distinct configured port; servers sharing a port
    /// share the listener and are told apart later by the resolver.
    pub fn bind(&mut self) -> ServerResult<()> {
        let mut seen: HashSet<u16> = HashSet::new();
        for (idx, srv) in self.config.servers.iter().enumerate() {
            if !seen.insert(srv.listen_port) {
                continue;
            }
            let addr = match format!("0.0.0.0:{}", srv.listen_port).parse() {
                Ok(addr) => addr,
                Err(e) => {
                    error!("invalid listen address for port {}: {e}", srv.listen_port);
                    continue;
                }
            };
            match TcpListener::bind(addr) {
                Ok(mut listener) => {
                    let token = Token(idx);
                    self.poll
                        .registry()
                        .register(&mut listener, token, Interest::READABLE)?;
                    self.listeners.insert(
                        token,
                        ListenerEntry {
                            listener,
                            port: srv.listen_port,
                        },
                    );
                    info!("listening on http://localhost:{}/", srv.listen_port);
                }
                Err(e) => error!("failed to bind port {}: {e}", srv.listen_port),
            }
        }

        if self.listeners.is_empty() {
            return Err(crate::error::ServerError::Config(
                "no ports could be bound".into(),
            ));
        }
        Ok(())
    }

    pub fn run(&mut self) {
        let mut events = Events::with_capacity(1024);
        info!("event loop started");
        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("poll failed: {e}");
                continue;
            }

            for event in events.iter() {
                let token = event.token();
                if self.listeners.contains_key(&token) {
                    if event.is_error() {
                        // listener-level trouble is logged, never fatal
                        warn!("ignoring error event on listener {token:?}");
                        continue;
                    }
                    self.accept_connections(token);
                } else {
                    self.handle_client_event(token, event);
                }
            }
        }
    }

    fn accept_connections(&mut self, listener_token: Token) {
        loop {
            let Some(entry) = self.listeners.get_mut(&listener_token) else {
                return;
            };
            match entry.listener.accept() {
                Ok((mut stream, peer)) => {
                    let port = entry.port;
                    let token = Token(self.next_token);
                    self.next_token += 1;

                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        error!("failed to register client {peer}: {e}");
                        continue;
                    }
                    info!("accepted {peer} on port {port} as {token:?}");
                    self.connections.insert(token, Connection::new(stream, port));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn handle_client_event(&mut self, token: Token, event: &mio::event::Event) {
        if event.is_readable() {
            self.read_from_client(token);
        }
        if event.is_writable() {
            self.write_to_client(token);
        }
        if event.is_read_closed() || event.is_write_closed() {
            self.close_connection(token);
        }
    }

    fn read_from_client(&mut self, token: Token) {
        let mut should_close = false;
        let mut complete = false;

        let ceiling = match self.connections.get(&token) {
            Some(conn) => resolver::find_server(&self.config, conn.port).client_max_body_size,
            None => return,
        };
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        if conn.state != ConnectionState::ReadRequest {
            return;
        }
        let mut buf = [0u8; 4096];
        loop {
            match conn.stream.read(&mut buf) {
                Ok(0) => {
                    should_close = true;
                    break;
                }
                Ok(n) => {
                    conn.read_buffer.extend_from_slice(&buf[..n]);
                    // a declared length over the ceiling is answered straight
                    // away; waiting for the full body would be pointless
                    let oversized = Request::declared_length(&conn.read_buffer)
                        .is_some_and(|declared| declared > ceiling);
                    if oversized || Request::is_complete(&conn.read_buffer) {
                        complete = true;
                        break;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    should_close = true;
                    break;
                }
            }
        }

        if should_close {
            self.close_connection(token);
        } else if complete {
            self.process_request(token);
        }
    }

    fn write_to_client(&mut self, token: Token) {
        let mut should_close = false;
        let mut drained = false;

        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        while conn.bytes_written < conn.write_buffer.len() {
            match conn.stream.write(&conn.write_buffer[conn.bytes_written..]) {
                Ok(n) => conn.bytes_written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    should_close = true;
                    break;
                }
            }
        }
        if !should_close && conn.bytes_written >= conn.write_buffer.len() {
            drained = true;
        }

        if should_close || drained {
            // one request per accepted connection; a full drain ends it
            self.close_connection(token);
        }
    }

    fn process_request(&mut self, token: Token) {
        let (buf, port) = match self.connections.get_mut(&token) {
            Some(conn) => (std::mem::take(&mut conn.read_buffer), conn.port),
            None => return,
        };
        let bytes = self.build_response(&buf, port);
        self.queue_response(token, bytes);
    }

    /// Full dispatch for one buffered, complete request:
    /// resolve → (CGI | router) → serialized bytes.
    fn build_response(&self, buf: &[u8], port: u16) -> Vec<u8> {
        let server = resolver::find_server(&self.config, port);

        // ceiling check on the declared length, before any parsing
        if let Some(declared) = Request::declared_length(buf) {
            if declared > server.client_max_body_size {
                warn!(
                    "declared body of {declared} bytes exceeds ceiling of {}",
                    server.client_max_body_size
                );
                return Response::from_error_code(413, server).into_bytes();
            }
        }

        let request = match Request::parse(buf) {
            Ok(request) => request,
            Err(err) => {
                error!("request rejected: {err}");
                return Response::from_error_code(err.status_code(), server).into_bytes();
            }
        };

        let resolved = resolver::resolve(&self.config, port, request.path_only());
        if cgi::applies(&request, resolved.location) {
            return self.cgi_response(&request, &resolved).into_bytes();
        }

        Router::new(
            resolved.docroot.clone(),
            resolved.upload_dir.clone(),
            resolved.index.clone(),
            resolved.server,
            resolved.location,
        )
        .handle(&request)
        .into_bytes()
    }

    fn cgi_response(&self, request: &Request, resolved: &Resolved) -> Response {
        let Some(location) = resolved.location else {
            return Response::with_status(500);
        };
        let script = cgi::script_path(request, location, &resolved.docroot, &resolved.index);
        let script = match cgi::validate_script(&script, &resolved.docroot) {
            Ok(script) => script,
            Err(err) => {
                error!("cgi script rejected: {err}");
                return Response::from_error_code(err.status_code(), resolved.server);
            }
        };

        match cgi::run(request, &script, location.cgi_interpreter.as_deref()) {
            Ok(outcome) => {
                let mut res = Response::new();
                res.set_status(outcome.status);
                // CGI-declared headers are currently discarded and the
                // Content-Type pinned; a known limitation kept as-is.
                res.set_header("Content-Type", "text/html");
                res.set_body(outcome.body);
                res
            }
            Err(err) => {
                error!("cgi execution failed: {err}");
                Response::from_error_code(err.status_code(), resolved.server)
            }
        }
    }

    fn queue_response(&mut self, token: Token, bytes: Vec<u8>) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        conn.write_buffer = bytes;
        conn.bytes_written = 0;
        conn.state = ConnectionState::WriteResponse;

        if let Err(e) =
            self.poll
                .registry()
                .reregister(&mut conn.stream, token, Interest::WRITABLE)
        {
            error!("failed to switch {token:?} to write interest: {e}");
            self.close_connection(token);
        }
    }

    fn close_connection(&mut self, token: Token) {
        if let Some(mut conn) = self.connections.remove(&token) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
        }
    }
}
