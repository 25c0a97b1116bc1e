//! Tamper pipeline
//!
//! Runs every inbound WebSocket payload through the staged plugin set and
//! tells the session manager what to send where. Stage order per payload:
//! network (initial, then write with the byte count), bytes, frame
//! reassembly, message, then the interception offer for requests.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace};

use crate::codec::{CodecError, FrameBuffer, FrameCodec};
use crate::message::{FrameFlags, Message, MessageKind};
use crate::plugin::{
    NetworkAction, NetworkStage, NetworkVerdict, PluginStageError, ResponseAction, TamperPlugin,
    TamperStyle,
};

/// Which leg an outbound frame goes to, relative to the payload's origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Back to the side the payload came from
    Origin,
    /// Onward to the other side
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub target: Target,
    pub payload: Vec<u8>,
}

/// The session manager's marching orders for one relay cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Forward(Vec<Outbound>),
    /// Message incomplete, nothing to send yet
    Buffering,
    BreakPipe,
    CloseWebSocket,
    CloseHttp,
}

/// One cycle's outcome plus the injected wait the plugins asked for. The
/// caller sleeps the wait with the pipeline lock released, so a delay on
/// one direction never stalls the other direction's relay loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleOutput {
    pub outcome: CycleOutcome,
    pub delay: Duration,
}

impl CycleOutput {
    pub fn forward_to_remote(payload: Vec<u8>) -> Self {
        Self {
            outcome: CycleOutcome::Forward(vec![Outbound {
                target: Target::Remote,
                payload,
            }]),
            delay: Duration::ZERO,
        }
    }
}

#[derive(Error, Debug)]
pub enum CycleError {
    #[error(transparent)]
    Plugin(#[from] PluginStageError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

pub struct TamperPipeline {
    plugins: Vec<Box<dyn TamperPlugin>>,
    codec: Box<dyn FrameCodec>,
    client_buffer: FrameBuffer,
    server_buffer: FrameBuffer,
}

impl TamperPipeline {
    pub fn new(plugins: Vec<Box<dyn TamperPlugin>>, codec: Box<dyn FrameCodec>) -> Self {
        Self {
            plugins,
            codec,
            client_buffer: FrameBuffer::new(),
            server_buffer: FrameBuffer::new(),
        }
    }

    pub fn has_plugins(&self) -> bool {
        !self.plugins.is_empty()
    }

    fn reset_buffer(&mut self, from_client: bool) {
        if from_client {
            self.client_buffer.reset();
        } else {
            self.server_buffer.reset();
        }
    }

    /// Drop both reassembly buffers, e.g. when a session ends.
    pub fn reset(&mut self) {
        self.client_buffer.reset();
        self.server_buffer.reset();
    }

    /// Run the Connect network stage, used during the handshake. The first
    /// non-Continue verdict wins; delays accumulate until then.
    pub async fn connect_stage(&mut self) -> Result<NetworkVerdict, PluginStageError> {
        let mut delay = Duration::ZERO;
        for plugin in &mut self.plugins {
            if !plugin.style().contains(TamperStyle::NETWORK) {
                continue;
            }
            let verdict = plugin
                .handle_network_stage(NetworkStage::Connect, None, true)
                .await
                .map_err(|source| PluginStageError {
                    plugin: plugin.name(),
                    stage: NetworkStage::Connect.as_str(),
                    source,
                })?;
            delay += verdict.delay;
            if verdict.action != NetworkAction::Continue {
                return Ok(NetworkVerdict {
                    action: verdict.action,
                    delay,
                });
            }
        }
        Ok(NetworkVerdict {
            action: NetworkAction::Continue,
            delay,
        })
    }

    /// Process one binary WebSocket payload. Errors reset the originating
    /// direction's reassembly buffer before propagating.
    pub async fn process(
        &mut self,
        payload: Vec<u8>,
        from_client: bool,
    ) -> Result<CycleOutput, CycleError> {
        match self.run_cycle(payload, from_client).await {
            Ok(output) => Ok(output),
            Err(error) => {
                self.reset_buffer(from_client);
                Err(error)
            }
        }
    }

    async fn run_cycle(
        &mut self,
        mut payload: Vec<u8>,
        from_client: bool,
    ) -> Result<CycleOutput, CycleError> {
        let size = payload.len();
        let mut delay = Duration::ZERO;
        for plugin in &mut self.plugins {
            let style = plugin.style();
            if style.contains(TamperStyle::NETWORK) {
                for (stage, size) in [
                    (NetworkStage::Initial, None),
                    (NetworkStage::Write, Some(size)),
                ] {
                    trace!(%stage, plugin = plugin.name(), "network stage");
                    let verdict = plugin
                        .handle_network_stage(stage, size, from_client)
                        .await
                        .map_err(|source| PluginStageError {
                            plugin: plugin.name(),
                            stage: stage.as_str(),
                            source,
                        })?;
                    delay += verdict.delay;
                    let outcome = match verdict.action {
                        NetworkAction::Continue => None,
                        NetworkAction::BreakPipe => Some(CycleOutcome::BreakPipe),
                        NetworkAction::CloseWebSocket => Some(CycleOutcome::CloseWebSocket),
                        NetworkAction::CloseHttp => Some(CycleOutcome::CloseHttp),
                    };
                    if let Some(outcome) = outcome {
                        return Ok(CycleOutput { outcome, delay });
                    }
                }
            }
            if style.contains(TamperStyle::BYTES) {
                trace!(plugin = plugin.name(), "bytes stage");
                plugin
                    .handle_bytes_stage(&mut payload, from_client)
                    .await
                    .map_err(|source| PluginStageError {
                        plugin: plugin.name(),
                        stage: "bytes",
                        source,
                    })?;
            }
        }

        if from_client {
            self.client_buffer.push(payload);
        } else {
            self.server_buffer.push(payload);
        }
        let frames = if from_client {
            self.client_buffer.frames()
        } else {
            self.server_buffer.frames()
        };
        let mut message = match self.codec.decode(frames)? {
            Some(message) => message,
            None => {
                return Ok(CycleOutput {
                    outcome: CycleOutcome::Buffering,
                    delay,
                })
            }
        };
        self.reset_buffer(from_client);
        debug!(
            kind = %message.kind,
            number = message.number,
            from_client,
            "reassembled message"
        );

        for plugin in &mut self.plugins {
            if !plugin.style().contains(TamperStyle::MESSAGE) {
                continue;
            }
            plugin
                .handle_message_stage(&mut message, from_client)
                .await
                .map_err(|source| PluginStageError {
                    plugin: plugin.name(),
                    stage: "message",
                    source,
                })?;
        }

        let mut substitute = None;
        if message.kind == MessageKind::Request {
            for plugin in &mut self.plugins {
                if !plugin.style().contains(TamperStyle::RESPONSE) {
                    continue;
                }
                let action = plugin
                    .handle_response_stage(&message, from_client)
                    .await
                    .map_err(|source| PluginStageError {
                        plugin: plugin.name(),
                        stage: "response",
                        source,
                    })?;
                match action {
                    ResponseAction::Pass => {}
                    ResponseAction::Substitute(reply) => substitute = Some(reply),
                    ResponseAction::Stall(stall) => delay += stall,
                }
                break;
            }
        }

        let mut outbound = Vec::with_capacity(2);
        match substitute {
            Some(reply) => {
                debug!(number = message.number, "intercepting request");
                // The remote still needs to see the sequence number, so a
                // NoReply placeholder takes the original message's place
                let mut noop = Message::new(message.number, MessageKind::Request);
                noop.flags |= FrameFlags::NO_REPLY;
                noop.properties.insert("no-op", "true");
                outbound.push(Outbound {
                    target: Target::Remote,
                    payload: self.codec.encode(&noop)?,
                });
                outbound.push(Outbound {
                    target: Target::Origin,
                    payload: self.codec.encode(&reply)?,
                });
            }
            None => {
                outbound.push(Outbound {
                    target: Target::Remote,
                    payload: self.codec.encode(&message)?,
                });
            }
        }
        Ok(CycleOutput {
            outcome: CycleOutcome::Forward(outbound),
            delay,
        })
    }
}
