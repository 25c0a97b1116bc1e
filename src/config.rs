//! Proxy configuration
//!
//! Loads and validates the JSON configuration file that names the listen
//! and destination ports, the plugin set, and the disconnect behavior used
//! when a plugin asks for the connection to be torn down.

use std::path::Path;

use serde::Deserialize;
use tokio::fs;

use crate::plugin::PluginDescriptor;

/// Proxy configuration. Field aliases accept the capitalized spellings
/// used by older configuration files.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Port the proxy listens on
    #[serde(alias = "FromPort")]
    pub from_port: u16,
    /// Port of the real server
    #[serde(alias = "ToPort")]
    pub to_port: u16,
    /// Host of the real server
    #[serde(default = "default_to_host", alias = "ToHost")]
    pub to_host: String,
    /// Plugins to load, in pipeline order
    #[serde(default, alias = "Plugins")]
    pub plugins: Vec<PluginDescriptor>,
    /// Close code sent when a plugin requests a WebSocket close
    #[serde(default = "default_ws_disconnect_code", alias = "WebSocketDisconnectCode")]
    pub web_socket_disconnect_code: u16,
    /// Close reason sent alongside the close code
    #[serde(
        default = "default_ws_disconnect_message",
        alias = "WebSocketDisconnectMessage"
    )]
    pub web_socket_disconnect_message: String,
    /// HTTP status returned when a plugin rejects the handshake
    #[serde(default = "default_http_disconnect_code", alias = "HttpDisconnectCode")]
    pub http_disconnect_code: u16,
    #[serde(default, alias = "HttpDisconnectMessage")]
    pub http_disconnect_message: Option<String>,
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(default = "default_log_level", alias = "LogLevel")]
    pub log_level: String,
    /// Whether to log to file
    #[serde(default, alias = "LogToFile")]
    pub log_to_file: bool,
    /// Path to log file (used when log_to_file is true)
    #[serde(default, alias = "LogFilePath")]
    pub log_file_path: Option<String>,
}

fn default_to_host() -> String {
    "localhost".to_string()
}

fn default_ws_disconnect_code() -> u16 {
    1008
}

fn default_ws_disconnect_message() -> String {
    "The server is on fire!".to_string()
}

fn default_http_disconnect_code() -> u16 {
    503
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl Config {
    /// Load configuration from a JSON file.
    pub async fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(&path).await.map_err(|e| {
            anyhow::anyhow!(
                "Failed to read configuration file '{}': {}",
                path.as_ref().display(),
                e
            )
        })?;
        let config: Config = serde_json::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse JSON configuration: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration fields
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.from_port == 0 {
            return Err(anyhow::anyhow!("fromPort must be between 1 and 65535"));
        }
        if self.to_port == 0 {
            return Err(anyhow::anyhow!("toPort must be between 1 and 65535"));
        }

        // A same-port loop on the local host would proxy to itself
        let local = matches!(self.to_host.as_str(), "localhost" | "127.0.0.1" | "::1");
        if local && self.from_port == self.to_port {
            return Err(anyhow::anyhow!(
                "fromPort and toPort must differ when proxying to {}",
                self.to_host
            ));
        }

        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.log_level.to_uppercase().as_str()) {
            return Err(anyhow::anyhow!("Invalid log level: {}", self.log_level));
        }

        if self.log_to_file {
            if let Some(path) = &self.log_file_path {
                if path.trim().is_empty() {
                    return Err(anyhow::anyhow!(
                        "Log file path cannot be empty when logToFile is true"
                    ));
                }
            }
        }

        for plugin in &self.plugins {
            if plugin.name.trim().is_empty() {
                return Err(anyhow::anyhow!("Plugin names cannot be empty"));
            }
        }

        Ok(())
    }
}
