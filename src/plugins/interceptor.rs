//! Rule-based message interception
//!
//! Thin plugin shell around the rule engine: every reassembled message is
//! run through the active rule set and mutated in place before it is
//! re-encoded for the remote side.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::message::Message;
use crate::plugin::{self, TamperPlugin, TamperStyle};
use crate::rules::{Direction, Rule, RuleEngine};

#[derive(Debug, Clone, Deserialize)]
struct Config {
    #[serde(alias = "Rules")]
    rules: Vec<Rule>,
}

pub struct InterceptorPlugin {
    engine: RuleEngine,
}

impl InterceptorPlugin {
    pub fn from_config_path(path: Option<&Path>) -> anyhow::Result<Self> {
        let rules = match path {
            Some(path) => plugin::parse_config::<Config>(path)?.rules,
            None => Vec::new(),
        };
        info!(count = rules.len(), "interception rules loaded");
        Ok(Self {
            engine: RuleEngine::new(rules),
        })
    }

    #[cfg(test)]
    pub fn from_rules(rules: Vec<Rule>) -> Self {
        Self {
            engine: RuleEngine::new(rules),
        }
    }
}

#[async_trait]
impl TamperPlugin for InterceptorPlugin {
    fn name(&self) -> &'static str {
        "message-interceptor"
    }

    fn style(&self) -> TamperStyle {
        TamperStyle::MESSAGE
    }

    async fn handle_message_stage(
        &mut self,
        message: &mut Message,
        from_client: bool,
    ) -> anyhow::Result<()> {
        let direction = if from_client {
            Direction::TO_SERVER
        } else {
            Direction::TO_CLIENT
        };
        self.engine.apply(message, direction);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;
    use crate::rules::{Criteria, Transform};

    #[tokio::test]
    async fn test_messages_are_mutated_in_place() {
        let mut plugin = InterceptorPlugin::from_rules(vec![Rule {
            criteria: Criteria {
                profile: Some("getCheckpoint".to_string()),
                ..Default::default()
            },
            output_transforms: vec![Transform::Body {
                content: "intercepted".to_string(),
            }],
            direction: Direction::TO_SERVER,
        }]);

        let mut msg = Message::new(1, MessageKind::Request);
        msg.properties.insert("Profile", "getCheckpoint");
        plugin.handle_message_stage(&mut msg, true).await.unwrap();
        assert_eq!(msg.body, b"intercepted");

        // Same message flowing the other way is out of rule scope
        let mut msg = Message::new(2, MessageKind::Request);
        msg.properties.insert("Profile", "getCheckpoint");
        plugin.handle_message_stage(&mut msg, false).await.unwrap();
        assert!(msg.body.is_empty());
    }
}
