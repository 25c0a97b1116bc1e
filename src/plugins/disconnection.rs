//! Pattern-driven disconnection
//!
//! Watches the request stream against a compiled pattern; the first match
//! triggers the configured disconnect behavior. The session clock starts
//! at the first request this plugin observes, not at connection time.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::info;

use crate::message::{Message, MessageKind};
use crate::pattern::Pattern;
use crate::plugin::{
    self, NetworkAction, NetworkStage, NetworkVerdict, ResponseAction, TamperPlugin, TamperStyle,
};

const TIMEOUT_STALL: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum DisconnectType {
    /// Fabricate a BLIP error reply instead of touching the transport
    #[serde(alias = "BLIPErrorMessage")]
    BlipErrorMessage,
    /// Close the WebSocket with the configured close code
    WebsocketClose,
    /// Sever the TCP stream without a close handshake
    #[default]
    PipeBreak,
    /// Stall the matching message for two minutes, then let it through.
    /// The stall only holds this message's direction.
    Timeout,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Config {
    #[serde(default, alias = "DisconnectType")]
    disconnect_type: DisconnectType,
    #[serde(alias = "PatternClauses")]
    pattern_clauses: Vec<String>,
}

pub struct DisconnectionPlugin {
    mode: DisconnectType,
    pattern: Pattern,
    started: Option<Instant>,
    next_action: NetworkAction,
}

impl DisconnectionPlugin {
    pub fn from_config_path(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = path.context("disconnection plugin requires a config file")?;
        let config: Config = plugin::parse_config(path)?;
        let pattern = Pattern::compile(&config.pattern_clauses)
            .context("compiling disconnection pattern")?;
        info!(
            mode = ?config.disconnect_type,
            clauses = config.pattern_clauses.len(),
            "disconnection trigger armed"
        );
        Ok(Self {
            mode: config.disconnect_type,
            pattern,
            started: None,
            next_action: NetworkAction::Continue,
        })
    }

    fn trigger(&mut self, number: u64) -> ResponseAction {
        info!(mode = ?self.mode, number, "disconnection pattern matched");
        match self.mode {
            DisconnectType::BlipErrorMessage => {
                let mut reply = Message::new(number, MessageKind::Error);
                reply.properties.insert("Error-Domain", "HTTP");
                reply.properties.insert("Error-Code", "500");
                reply.body = b"The server is on fire!".to_vec();
                ResponseAction::Substitute(reply)
            }
            DisconnectType::WebsocketClose => {
                self.next_action = NetworkAction::CloseWebSocket;
                ResponseAction::Pass
            }
            DisconnectType::PipeBreak => {
                self.next_action = NetworkAction::BreakPipe;
                ResponseAction::Pass
            }
            DisconnectType::Timeout => ResponseAction::Stall(TIMEOUT_STALL),
        }
    }
}

#[async_trait]
impl TamperPlugin for DisconnectionPlugin {
    fn name(&self) -> &'static str {
        "disconnection"
    }

    fn style(&self) -> TamperStyle {
        if self.mode == DisconnectType::BlipErrorMessage {
            TamperStyle::RESPONSE
        } else {
            TamperStyle::RESPONSE | TamperStyle::NETWORK
        }
    }

    async fn handle_network_stage(
        &mut self,
        _stage: NetworkStage,
        _size: Option<usize>,
        _from_client: bool,
    ) -> anyhow::Result<NetworkVerdict> {
        Ok(NetworkVerdict::action(self.next_action))
    }

    async fn handle_response_stage(
        &mut self,
        message: &Message,
        _from_client: bool,
    ) -> anyhow::Result<ResponseAction> {
        let started = *self.started.get_or_insert_with(Instant::now);
        if self.pattern.evaluate(message, started.elapsed()) {
            Ok(self.trigger(message.number))
        } else {
            Ok(ResponseAction::Pass)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin(mode: DisconnectType, clauses: &[&str]) -> DisconnectionPlugin {
        let owned: Vec<String> = clauses.iter().map(|s| s.to_string()).collect();
        DisconnectionPlugin {
            mode,
            pattern: Pattern::compile(&owned).unwrap(),
            started: None,
            next_action: NetworkAction::Continue,
        }
    }

    fn request(number: u64) -> Message {
        Message::new(number, MessageKind::Request)
    }

    #[tokio::test]
    async fn test_blip_error_fabrication() {
        let mut p = plugin(DisconnectType::BlipErrorMessage, &["msgno = 3"]);
        assert_eq!(p.style(), TamperStyle::RESPONSE);

        let pass = p.handle_response_stage(&request(2), true).await.unwrap();
        assert_eq!(pass, ResponseAction::Pass);

        let reply = match p.handle_response_stage(&request(3), true).await.unwrap() {
            ResponseAction::Substitute(reply) => reply,
            other => panic!("pattern match should fabricate a reply, got {other:?}"),
        };
        assert_eq!(reply.number, 3);
        assert_eq!(reply.kind, MessageKind::Error);
        assert_eq!(reply.properties.get("Error-Domain"), Some("HTTP"));
        assert_eq!(reply.properties.get("Error-Code"), Some("500"));
        assert_eq!(reply.body, b"The server is on fire!");
    }

    #[tokio::test]
    async fn test_pipe_break_arms_network_verdict() {
        let mut p = plugin(DisconnectType::PipeBreak, &["msgno = 1"]);
        assert!(p.style().contains(TamperStyle::NETWORK));

        let verdict = p
            .handle_network_stage(NetworkStage::Initial, None, true)
            .await
            .unwrap();
        assert_eq!(verdict.action, NetworkAction::Continue);

        let action = p.handle_response_stage(&request(1), true).await.unwrap();
        assert_eq!(action, ResponseAction::Pass);
        let verdict = p
            .handle_network_stage(NetworkStage::Initial, None, true)
            .await
            .unwrap();
        assert_eq!(verdict.action, NetworkAction::BreakPipe);
    }

    #[tokio::test]
    async fn test_websocket_close_arms_network_verdict() {
        let mut p = plugin(DisconnectType::WebsocketClose, &["type = request"]);
        p.handle_response_stage(&request(1), true).await.unwrap();
        let verdict = p
            .handle_network_stage(NetworkStage::Write, Some(10), true)
            .await
            .unwrap();
        assert_eq!(verdict.action, NetworkAction::CloseWebSocket);
    }

    #[tokio::test]
    async fn test_timeout_stalls_without_network_verdict() {
        let mut p = plugin(DisconnectType::Timeout, &["msgno = 1"]);
        let action = p.handle_response_stage(&request(1), true).await.unwrap();
        assert_eq!(action, ResponseAction::Stall(TIMEOUT_STALL));
        let verdict = p
            .handle_network_stage(NetworkStage::Initial, None, true)
            .await
            .unwrap();
        assert_eq!(verdict.action, NetworkAction::Continue);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_clock_starts_at_first_request() {
        let mut p = plugin(DisconnectType::BlipErrorMessage, &["after 1 minute"]);
        // Idle time before the first request does not count
        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(
            p.handle_response_stage(&request(1), true).await.unwrap(),
            ResponseAction::Pass
        );
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(matches!(
            p.handle_response_stage(&request(2), true).await.unwrap(),
            ResponseAction::Substitute(_)
        ));
    }
}
