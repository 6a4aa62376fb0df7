use crate::config::{Config, LocationSpec, ServerSpec};

/// Everything the dispatch path needs to know once a request's port and path
/// have been matched against the configuration.
pub struct Resolved<'a> {
    pub server: &'a ServerSpec,
    pub location: Option<&'a LocationSpec>,
    pub docroot: String,
    pub upload_dir: String,
    pub index: String,
}

/// First configured server listening on the port; if none matches, the first
/// server overall is the explicit default.
pub fn find_server(config: &Config, port: u16) -> &ServerSpec {
    config
        .servers
        .iter()
        .find(|s| s.listen_port == port)
        .unwrap_or(&config.servers[0])
}

/// Longest literal path prefix wins; ties are impossible since equal-length
/// prefixes over the same path are equal. Declaration order never matters.
fn match_location<'a>(server: &'a ServerSpec, path: &str) -> Option<&'a LocationSpec> {
    server
        .locations
        .iter()
        .filter(|loc| path.starts_with(&loc.path))
        .max_by_key(|loc| loc.path.len())
}

pub fn resolve<'a>(config: &'a Config, port: u16, path: &str) -> Resolved<'a> {
    let server = find_server(config, port);
    let location = match_location(server, path);

    let docroot = location
        .and_then(|l| l.root.clone())
        .unwrap_or_else(|| server.root.clone());
    let upload_dir = location
        .and_then(|l| l.upload_path.clone())
        .unwrap_or_else(|| "uploads".to_string());
    let index = location
        .and_then(|l| l.index.first().cloned())
        .or_else(|| server.index.first().cloned())
        .unwrap_or_else(|| "index.html".to_string());

    Resolved {
        server,
        location,
        docroot,
        upload_dir,
        index,
    }
}
