//! Server configuration: TOML file + CLI overrides.

use hubrelay_core::codec::DEFAULT_MAX_FRAME_SIZE;
use hubrelay_core::{RelayError, RelayResult};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub tunnel: TunnelSection,
    #[serde(default)]
    pub channels: Vec<ChannelCredentials>,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_connector_path")]
    pub connector_path: String,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            connector_path: default_connector_path(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

/// `[tunnel]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelSection {
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    /// Request headers tunneled in addition to `Content-Type`.
    #[serde(default)]
    pub forwarded_headers: Vec<String>,
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            max_body_size: default_max_body_size(),
            forwarded_headers: Vec::new(),
        }
    }
}

/// One `[[channels]]` entry: credentials that resolve to a hub identity.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChannelCredentials {
    pub identity_uid: String,
    pub channel_uid: String,
    /// HTTP Basic username for callers reaching this hub.
    pub username: String,
    /// Hex SHA-256 of the HTTP Basic password.
    pub password_sha256: String,
    /// Hex SHA-256 of the bearer token the hub presents when connecting.
    pub access_token_sha256: Option<String>,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_connector_path() -> String {
    "/connector".to_string()
}
fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}
fn default_max_body_size() -> usize {
    16 * 1024 * 1024
}

/// Resolved server configuration (CLI overrides applied, values validated).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub connector_path: String,
    pub max_frame_size: usize,
    pub max_body_size: usize,
    pub forwarded_headers: Vec<String>,
    pub channels: Vec<ChannelCredentials>,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_bind: Option<&str>,
        cli_port: Option<u16>,
    ) -> RelayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse_config(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, cli_bind, cli_port)
    }

    fn resolve(
        file_config: ConfigFile,
        cli_bind: Option<&str>,
        cli_port: Option<u16>,
    ) -> RelayResult<Self> {
        let bind = cli_bind.unwrap_or(file_config.server.bind.as_str());
        let port = cli_port.unwrap_or(file_config.server.port);
        let bind_addr: SocketAddr = format!("{bind}:{port}")
            .parse()
            .map_err(|e| RelayError::Config(format!("invalid bind address {bind}:{port}: {e}")))?;

        let connector_path = file_config.server.connector_path;
        if !connector_path.starts_with('/') {
            return Err(RelayError::Config(format!(
                "connector_path must start with '/': {connector_path}"
            )));
        }
        if file_config.server.max_frame_size == 0 {
            return Err(RelayError::Config("max_frame_size must be positive".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for channel in &file_config.channels {
            if !seen.insert((&channel.identity_uid, &channel.channel_uid)) {
                return Err(RelayError::Config(format!(
                    "duplicate channel {}/{}",
                    channel.identity_uid, channel.channel_uid
                )));
            }
        }

        Ok(Self {
            bind_addr,
            connector_path,
            max_frame_size: file_config.server.max_frame_size,
            max_body_size: file_config.tunnel.max_body_size,
            forwarded_headers: file_config.tunnel.forwarded_headers,
            channels: file_config.channels,
        })
    }
}

fn parse_config(content: &str) -> RelayResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| RelayError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
