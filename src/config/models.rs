use std::collections::{BTreeMap, HashMap};

use serde_derive::Deserialize;

/// Raw on-disk shape of the TOML configuration file. Nothing here is
/// trusted until `check::validate` has turned it into a `Config`.
#[derive(Debug, Deserialize)]
pub struct RawConfig {
    #[serde(default, rename = "server")]
    pub servers: Vec<RawServer>,
}

#[derive(Debug, Deserialize)]
pub struct RawServer {
    pub listen: u16,
    #[serde(default)]
    pub server_names: Vec<String>,
    pub root: Option<String>,
    #[serde(default)]
    pub index: Vec<String>,
    #[serde(default = "default_body_size")]
    pub client_max_body_size: usize,
    #[serde(default)]
    pub error_pages: HashMap<String, String>,
    #[serde(default, rename = "location")]
    pub locations: Vec<RawLocation>,
}

#[derive(Debug, Deserialize)]
pub struct RawLocation {
    pub path: String,
    #[serde(default)]
    pub methods: Vec<String>,
    pub root: Option<String>,
    #[serde(default)]
    pub index: Vec<String>,
    pub upload_path: Option<String>,
    pub cgi_extension: Option<String>,
    pub cgi_interpreter: Option<String>,
    pub redirect: Option<String>,
    pub redirect_code: Option<u16>,
}

fn default_body_size() -> usize {
    1024 * 1024
}

/// Validated, immutable configuration snapshot. Built once at startup and
/// never mutated afterwards; the event loop only ever reads it.
#[derive(Debug, Clone)]
pub struct Config {
    pub servers: Vec<ServerSpec>,
}

#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub listen_port: u16,
    pub server_names: Vec<String>,
    pub root: String,
    pub index: Vec<String>,
    pub client_max_body_size: usize,
    pub error_pages: BTreeMap<u16, String>,
    pub locations: Vec<LocationSpec>,
}

#[derive(Debug, Clone)]
pub struct LocationSpec {
    pub path: String,
    pub methods: Vec<String>,
    pub root: Option<String>,
    pub index: Vec<String>,
    pub upload_path: Option<String>,
    pub cgi_extension: Option<String>,
    pub cgi_interpreter: Option<String>,
    pub redirect: Option<String>,
    pub redirect_code: u16,
}
