pub mod check;
pub mod models;

use std::fs;

use crate::error::{ServerError, ServerResult};
pub use models::{Config, LocationSpec, ServerSpec};

pub const DEFAULT_CONFIG_FILE: &str = "rhttpd.toml";

/// Reads, deserializes and validates a configuration file. Any failure here
/// is fatal to startup; nothing has been bound yet.
pub fn load(path: &str) -> ServerResult<Config> {
    let content = fs::read_to_string(path)
        .map_err(|e| ServerError::Config(format!("cannot read {path}: {e}")))?;
    let raw: models::RawConfig = toml::from_str(&content)
        .map_err(|e| ServerError::Config(format!("cannot parse {path}: {e}")))?;
    check::validate(raw)
}
