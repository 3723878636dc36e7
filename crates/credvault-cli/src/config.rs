use std::{
    env,
    ffi::OsString,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use color_eyre::{
    eyre::{eyre, WrapErr},
    Result,
};
use credvault_remote::RemoteConfig;
use dirs::config_dir;
use serde::{Deserialize, Serialize};

/// Environment variable naming an alternate config file.
pub const CONFIG_ENV: &str = "CREDVAULT_CONFIG";

/// User-level configuration, read from `<config_dir>/credvault/config.toml`
/// unless `CREDVAULT_CONFIG` points elsewhere.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct Config {
    /// Override for the local record directory.
    pub data_dir: Option<PathBuf>,
    /// Alias of the device key inside the keyring.
    pub key_alias: Option<String>,
    /// Keyring service name the device key is filed under.
    pub keyring_service: Option<String>,
    /// Remote document store mirroring sealed records (optional).
    pub remote: Option<RemoteConfig>,
}

pub fn load() -> Result<Config> {
    load_from_path(config_path()?)
}

/// Parse the config at `path`. An absent or blank file yields the defaults.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Config::default()),
        Err(err) => {
            return Err(err).wrap_err_with(|| format!("reading config {}", path.display()))
        }
    };
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    toml::from_str(&contents).wrap_err_with(|| format!("parsing config {}", path.display()))
}

/// Path `load` and `write_default_if_missing` operate on.
pub fn config_path() -> Result<PathBuf> {
    resolve_path(env::var_os(CONFIG_ENV))
}

fn resolve_path(override_path: Option<OsString>) -> Result<PathBuf> {
    match override_path.filter(|p| !p.is_empty()) {
        Some(path) => Ok(PathBuf::from(path)),
        None => config_dir()
            .map(|base| base.join("credvault").join("config.toml"))
            .ok_or_else(|| eyre!("no platform config directory; set {CONFIG_ENV}")),
    }
}

/// Write `config` to the config path unless a file is already there.
pub fn write_default_if_missing(config: &Config) -> Result<PathBuf> {
    write_to_path_if_missing(config, &config_path()?)
}

fn write_to_path_if_missing(config: &Config, path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(config)?;
    fs::write(path, body)?;
    Ok(path.to_path_buf())
}
