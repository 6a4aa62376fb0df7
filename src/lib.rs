//! Event-driven HTTP/1.1 server: one thread, one readiness poll, many
//! non-blocking connections. Requests are framed incrementally, resolved
//! against a virtual-host/location configuration, and dispatched to static
//! file serving, uploads, deletions, directory listings or a CGI child.

pub mod config;
pub mod error;
pub mod handlers;
pub mod http;
pub mod server;
