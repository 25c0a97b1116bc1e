//! Plugin capability contract and registry
//!
//! Plugins declare which stages they tamper with through a capability
//! bitmask; the pipeline invokes only the declared handlers. Plugins are
//! compiled in and selected by name from the proxy configuration, each
//! with an optional JSON configuration file of its own.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bitflags::bitflags;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::message::Message;
use crate::plugins;

bitflags! {
    /// Which pipeline stages a plugin participates in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TamperStyle: u8 {
        const NETWORK = 1;
        const BYTES = 1 << 1;
        const MESSAGE = 1 << 2;
        const RESPONSE = 1 << 3;
    }
}

/// Where in the socket lifecycle a network-stage call happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStage {
    /// During the WebSocket handshake, before any relay traffic
    Connect,
    /// Before a payload is processed; no byte count available
    Initial,
    /// After bytes were read from a socket
    Read,
    /// Before bytes are written to a socket
    Write,
}

impl NetworkStage {
    pub fn as_str(self) -> &'static str {
        match self {
            NetworkStage::Connect => "connect",
            NetworkStage::Initial => "initial",
            NetworkStage::Read => "read",
            NetworkStage::Write => "write",
        }
    }
}

impl fmt::Display for NetworkStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a network-stage plugin wants done with the connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NetworkAction {
    #[default]
    Continue,
    /// Sever the TCP stream with no close handshake
    BreakPipe,
    /// Send a WebSocket close frame with the configured code
    CloseWebSocket,
    /// Reject at the HTTP layer with the configured status
    CloseHttp,
}

/// A network stage's decision: a connection verdict plus an injected wait.
/// The session applies the wait outside any shared lock, so a delay on one
/// direction never stalls the other direction's relay loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkVerdict {
    pub action: NetworkAction,
    pub delay: Duration,
}

impl NetworkVerdict {
    pub fn action(action: NetworkAction) -> Self {
        Self {
            action,
            delay: Duration::ZERO,
        }
    }

    pub fn delay(delay: Duration) -> Self {
        Self {
            action: NetworkAction::Continue,
            delay,
        }
    }
}

/// What a response-capable plugin does with an offered request.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseAction {
    /// Let the request continue untouched
    Pass,
    /// Intercept: this reply goes back to the originator and a no-op
    /// placeholder continues to the remote
    Substitute(Message),
    /// Hold the request this long before it continues, without blocking
    /// the opposite direction
    Stall(Duration),
}

/// A plugin handler failure. Aborts the current relay cycle; the session
/// itself stays up.
#[derive(Error, Debug)]
#[error("plugin {plugin} failed in {stage} stage")]
pub struct PluginStageError {
    pub plugin: &'static str,
    pub stage: &'static str,
    #[source]
    pub source: anyhow::Error,
}

/// The tampering surface. Handlers default to pass-through so a plugin
/// only implements the stages its style declares.
#[async_trait]
pub trait TamperPlugin: Send {
    fn name(&self) -> &'static str;

    fn style(&self) -> TamperStyle;

    async fn handle_network_stage(
        &mut self,
        _stage: NetworkStage,
        _size: Option<usize>,
        _from_client: bool,
    ) -> anyhow::Result<NetworkVerdict> {
        Ok(NetworkVerdict::default())
    }

    async fn handle_bytes_stage(
        &mut self,
        _bytes: &mut Vec<u8>,
        _from_client: bool,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn handle_message_stage(
        &mut self,
        _message: &mut Message,
        _from_client: bool,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Offered every Request.
    async fn handle_response_stage(
        &mut self,
        _message: &Message,
        _from_client: bool,
    ) -> anyhow::Result<ResponseAction> {
        Ok(ResponseAction::Pass)
    }
}

/// One entry of the proxy configuration's `plugins` array.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDescriptor {
    pub name: String,
    #[serde(default)]
    pub config_path: Option<PathBuf>,
}

/// Parse a plugin's JSON configuration file.
pub fn parse_config<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading plugin config {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("parsing plugin config {}", path.display()))
}

fn build_one(descriptor: &PluginDescriptor) -> anyhow::Result<Box<dyn TamperPlugin>> {
    let config_path = descriptor.config_path.as_deref();
    match descriptor.name.as_str() {
        "bad-network" => Ok(Box::new(plugins::BadNetworkPlugin::from_config_path(
            config_path,
        )?)),
        "disconnection" => Ok(Box::new(plugins::DisconnectionPlugin::from_config_path(
            config_path,
        )?)),
        "message-interceptor" => Ok(Box::new(plugins::InterceptorPlugin::from_config_path(
            config_path,
        )?)),
        "no-compression" => Ok(Box::new(plugins::NoCompressionPlugin::new())),
        other => anyhow::bail!("unknown plugin name {other:?}"),
    }
}

/// Instantiate every configured plugin. A plugin that fails to configure
/// is skipped with a warning rather than aborting the proxy.
pub fn build_plugins(descriptors: &[PluginDescriptor]) -> Vec<Box<dyn TamperPlugin>> {
    let mut built: Vec<Box<dyn TamperPlugin>> = Vec::with_capacity(descriptors.len());
    for descriptor in descriptors {
        match build_one(descriptor) {
            Ok(plugin) => {
                info!(name = %descriptor.name, style = ?plugin.style(), "loaded plugin");
                built.push(plugin);
            }
            Err(error) => {
                warn!(name = %descriptor.name, %error, "skipping plugin that failed to configure");
            }
        }
    }
    built
}
