//! Compression stripping
//!
//! Clears the compressed flag on every message so both endpoints fall back
//! to plain bodies. Takes no configuration.

use async_trait::async_trait;
use tracing::{info, trace};

use crate::message::{FrameFlags, Message};
use crate::plugin::{TamperPlugin, TamperStyle};

#[derive(Default)]
pub struct NoCompressionPlugin;

impl NoCompressionPlugin {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TamperPlugin for NoCompressionPlugin {
    fn name(&self) -> &'static str {
        "no-compression"
    }

    fn style(&self) -> TamperStyle {
        TamperStyle::MESSAGE
    }

    async fn handle_message_stage(
        &mut self,
        message: &mut Message,
        from_client: bool,
    ) -> anyhow::Result<()> {
        let leg = if from_client { "to server" } else { "to client" };
        if message.flags.contains(FrameFlags::COMPRESSED) {
            message.flags -= FrameFlags::COMPRESSED;
            info!(
                kind = %message.kind,
                number = message.number,
                leg,
                "disabled compression"
            );
        } else {
            trace!(
                kind = %message.kind,
                number = message.number,
                leg,
                "ignored non-compressed message"
            );
        }
        Ok(())
    }
}
