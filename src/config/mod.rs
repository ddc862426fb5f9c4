use std::sync::OnceLock;

use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::Deserialize;
use validator::Validate;

mod capture_config;
mod log_config;

pub use capture_config::{BlockSize, CaptureConfig, Channels, SampleFormat, SampleRate};
pub use log_config::LogConfig;

use crate::error::ConfigError;

pub static CONFIG: OnceLock<ServerConfig> = OnceLock::new();

/// Loads configuration from `config.toml` (or `$APP_CONFIG`), merged with
/// `APP_`-prefixed environment variables, validates it, and stores it in the
/// process-wide [`CONFIG`] cell. Any failure here is fatal: nothing has been
/// bound yet.
pub fn init() -> Result<(), ConfigError> {
    let raw_config = Figment::new()
        .merge(Toml::file(
            Env::var("APP_CONFIG").as_deref().unwrap_or("config.toml"),
        ))
        .merge(Env::prefixed("APP_").global());

    let config = raw_config
        .extract::<ServerConfig>()
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;

    config
        .capture
        .validate()
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;

    if let Some(tls) = &config.tls {
        if !std::path::Path::new(&tls.cert).exists() {
            return Err(ConfigError::Invalid(format!(
                "tls certificate not found at {}",
                tls.cert
            )));
        }
        if !std::path::Path::new(&tls.key).exists() {
            return Err(ConfigError::Invalid(format!(
                "tls key not found at {}",
                tls.key
            )));
        }
    } else {
        return Err(ConfigError::Invalid(
            "tls configuration is required".into(),
        ));
    }

    CONFIG
        .set(config)
        .map_err(|_| ConfigError::Invalid("config already initialized".into()))
}

pub fn get() -> &'static ServerConfig {
    CONFIG.get().expect("config should be set")
}

#[derive(Deserialize, Clone, Debug)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Deserialize, Clone, Debug)]
pub struct TlsConfig {
    pub cert: String,
    pub key: String,
}

fn default_listen_addr() -> String {
    "0.0.0.0".into()
}

fn default_listen_port() -> u16 {
    8908
}
