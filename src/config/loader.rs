//! Configuration loading
//!
//! Built on the `config` crate: defaults come from serde, then the JSON file
//! and the prefixed environment are layered on top.

use config::{Config, Environment, File, FileFormat};
use log::debug;
use std::path::{Path, PathBuf};

use super::defaults::{DEFAULT_CONFIG_FILE, ENV_PREFIX};
use super::RelayConfig;
use crate::common::{ProxyError, Result};

/// Trait for loading configuration from its sources
pub trait ConfigLoader: Sized {
    /// Load defaults overlaid with a JSON file, ignoring the environment
    fn from_file<P: AsRef<Path>>(path: P) -> Result<Self>;

    /// Load defaults, then the file, then `CIPHER_RELAY_*` variables
    ///
    /// An explicit `path` must exist; without one, `config.json` in the
    /// working directory is used when present.
    fn load(path: Option<&Path>) -> Result<Self>;
}

impl ConfigLoader for RelayConfig {
    fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ProxyError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        build(Some((path.to_path_buf(), true)), false)
    }

    fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => {
                if !path.is_file() {
                    return Err(ProxyError::Config(format!(
                        "Config file not found: {}",
                        path.display()
                    )));
                }
                (path.to_path_buf(), true)
            }
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };
        build(Some(file), true)
    }
}

fn build(file: Option<(PathBuf, bool)>, with_env: bool) -> Result<RelayConfig> {
    let mut builder = Config::builder();

    if let Some((path, required)) = file {
        debug!("Reading configuration file {} (required: {})", path.display(), required);
        builder = builder.add_source(File::from(path).format(FileFormat::Json).required(required));
    }

    if with_env {
        builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true));
    }

    let config: RelayConfig = builder.build()?.try_deserialize()?;
    Ok(config)
}
