//! Session manager
//!
//! Listens for one WebSocket client at a time, opens the matching leg to
//! the real server, and runs one relay loop per direction through the
//! shared tamper pipeline. After a session ends the listener re-arms.

use std::sync::Arc;

use anyhow::Context;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderMap, StatusCode, Uri};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{accept_hdr_async, connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::codec::BlipWireCodec;
use crate::config::Config;
use crate::pipeline::{CycleOutcome, CycleOutput, TamperPipeline, Target};
use crate::plugin::{NetworkAction, TamperPlugin};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

/// Hop-by-hop upgrade headers the WebSocket client rebuilds itself.
const EXCLUDED_HEADERS: &[&str] = &[
    "sec-websocket-version",
    "sec-websocket-key",
    "connection",
    "upgrade",
    "host",
];

/// How a relay loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Socket closed or errored; tear down normally
    Closed,
    /// A plugin demanded the pipe be severed without a close handshake
    Aborted,
    /// Operator shutdown
    Shutdown,
}

/// What was captured from the client's upgrade request.
struct ClientHello {
    headers: HeaderMap,
    uri: Uri,
}

pub struct Proxy {
    config: Config,
    pipeline: Arc<Mutex<TamperPipeline>>,
    shutdown: broadcast::Sender<()>,
}

impl Proxy {
    pub fn new(config: Config, plugins: Vec<Box<dyn TamperPlugin>>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config,
            pipeline: Arc::new(Mutex::new(TamperPipeline::new(
                plugins,
                Box::new(BlipWireCodec),
            ))),
            shutdown,
        }
    }

    /// Sender half of the shutdown signal; any send stops the run loop and
    /// aborts in-flight reads and delays.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    /// Bind the configured listen port and serve until shutdown.
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{}", self.config.from_port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        info!("Listening on port {}...", self.config.from_port);
        self.run_on(listener).await
    }

    /// Serve sessions from an already-bound listener. One tunnel at a
    /// time; the listener re-arms after each session.
    pub async fn run_on(&self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer_addr) = result?;
                    debug!("Got connection from {}", peer_addr);
                    if let Err(e) = self.handle_session(stream).await {
                        warn!("Session error: {:#}", e);
                    }
                    self.pipeline.lock().await.reset();
                    info!("Client disconnected, listening again...");
                }
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping proxy");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_session(&self, stream: TcpStream) -> anyhow::Result<()> {
        // The Connect verdict is decided before the upgrade completes so a
        // CloseHttp plugin can reject at the HTTP layer.
        let connect_verdict = self.pipeline.lock().await.connect_stage().await?;
        if !connect_verdict.delay.is_zero() {
            tokio::time::sleep(connect_verdict.delay).await;
        }
        let connect_action = connect_verdict.action;

        let mut hello: Option<ClientHello> = None;
        let http_code = self.config.http_disconnect_code;
        let http_message = self.config.http_disconnect_message.clone();
        let callback = |request: &Request, mut response: Response| {
            hello = Some(ClientHello {
                headers: request.headers().clone(),
                uri: request.uri().clone(),
            });
            if connect_action == NetworkAction::CloseHttp {
                let mut rejection = ErrorResponse::new(http_message);
                *rejection.status_mut() = StatusCode::from_u16(http_code)
                    .unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
                return Err(rejection);
            }
            // Echo the client's first offered subprotocol; the remote leg
            // receives the full offer list
            if let Some(offered) = request.headers().get("Sec-WebSocket-Protocol") {
                if let Some(first) = offered
                    .to_str()
                    .ok()
                    .and_then(|all| all.split(',').next())
                    .map(str::trim)
                {
                    if let Ok(value) = first.parse() {
                        response
                            .headers_mut()
                            .insert("Sec-WebSocket-Protocol", value);
                    }
                }
            }
            Ok(response)
        };

        let client_ws = match accept_hdr_async(MaybeTlsStream::Plain(stream), callback).await {
            Ok(ws) => ws,
            Err(e) => {
                // Non-upgrade requests and CloseHttp rejections land here
                warn!("Client handshake did not complete: {}", e);
                return Ok(());
            }
        };
        info!("Established websocket connection to client...");

        let hello = hello.context("client handshake captured no request")?;
        let server_ws = match self.dial_remote(&hello).await {
            Ok(ws) => ws,
            Err(WsError::Http(response)) => {
                self.relay_rejection(client_ws, response.status()).await;
                return Ok(());
            }
            Err(e) => return Err(e).context("connecting to remote server"),
        };
        info!("Established websocket connection to server...");

        let (client_sink, client_source) = client_ws.split();
        let (server_sink, server_source) = server_ws.split();
        let client_sink = Arc::new(Mutex::new(client_sink));
        let server_sink = Arc::new(Mutex::new(server_sink));

        let from_client = self.relay_loop(
            client_source,
            client_sink.clone(),
            server_sink.clone(),
            true,
        );
        let from_server = self.relay_loop(
            server_source,
            server_sink.clone(),
            client_sink.clone(),
            false,
        );

        // First loop to finish ends the session; the other direction's
        // read is cancelled with it
        let end = tokio::select! {
            end = from_client => end,
            end = from_server => end,
        };
        debug!(?end, "session ended");
        Ok(())
    }

    async fn dial_remote(&self, hello: &ClientHello) -> Result<WsStream, WsError> {
        let path = hello
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!(
            "ws://{}:{}{}",
            self.config.to_host, self.config.to_port, path
        );
        let mut request = url.into_client_request()?;
        for (name, value) in &hello.headers {
            let lowered = name.as_str().to_ascii_lowercase();
            if EXCLUDED_HEADERS.contains(&lowered.as_str()) {
                if lowered == "host" {
                    // Keep the client's Host but point it at the real port
                    if let Ok(host) = value.to_str() {
                        let rewritten = host.replace(
                            &self.config.from_port.to_string(),
                            &self.config.to_port.to_string(),
                        );
                        if let Ok(rewritten) = rewritten.parse() {
                            request.headers_mut().insert("Host", rewritten);
                        }
                    }
                }
                continue;
            }
            debug!("Forwarding header '{}' from origin...", name);
            request.headers_mut().append(name.clone(), value.clone());
        }
        let (ws, _response) = connect_async(request).await?;
        Ok(ws)
    }

    /// The remote refused the upgrade after the client leg was already
    /// accepted, so the status travels in a close frame instead of an
    /// HTTP response. 401 carries the auth challenge in the reason.
    async fn relay_rejection(&self, client_ws: WsStream, status: StatusCode) {
        info!("Got error code '{}' from destination, returning to origin...", status.as_u16());
        let reason = if status == StatusCode::UNAUTHORIZED {
            format!(
                "upstream returned {}; Www-Authenticate: Basic realm=\"Couchbase Sync Gateway\"",
                status.as_u16()
            )
        } else {
            format!("upstream returned {}", status.as_u16())
        };
        let (mut sink, _source) = client_ws.split();
        let frame = CloseFrame {
            // Private-use range keeps the HTTP status recoverable
            code: CloseCode::from(4000 + status.as_u16()),
            reason: reason.into(),
        };
        if let Err(e) = sink.send(WsMessage::Close(Some(frame))).await {
            warn!("Failed to relay upstream rejection: {}", e);
        }
    }

    async fn close_client(&self, client_is_origin: bool, origin: &Mutex<WsSink>, remote: &Mutex<WsSink>) {
        let frame = CloseFrame {
            code: CloseCode::from(self.config.web_socket_disconnect_code),
            reason: self.config.web_socket_disconnect_message.clone().into(),
        };
        let sink = if client_is_origin { origin } else { remote };
        if let Err(e) = sink.lock().await.send(WsMessage::Close(Some(frame))).await {
            warn!("Failed to send close frame: {}", e);
        }
    }

    async fn relay_loop(
        &self,
        mut incoming: WsSource,
        origin_sink: Arc<Mutex<WsSink>>,
        remote_sink: Arc<Mutex<WsSink>>,
        from_client: bool,
    ) -> SessionEnd {
        let leg = if from_client { "client" } else { "server" };
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let next = tokio::select! {
                next = incoming.next() => next,
                _ = shutdown.recv() => return SessionEnd::Shutdown,
            };
            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    warn!("Read error from {}: {}", leg, e);
                    return SessionEnd::Closed;
                }
                None => {
                    debug!("Socket from {} ended", leg);
                    return SessionEnd::Closed;
                }
            };

            match message {
                WsMessage::Binary(payload) => {
                    // The lock covers one processing cycle only; plugin
                    // delays are slept after it is released so the other
                    // direction keeps relaying
                    let result = {
                        let mut pipeline = self.pipeline.lock().await;
                        if pipeline.has_plugins() {
                            pipeline.process(payload, from_client).await
                        } else {
                            // With no plugins loaded the payload is opaque
                            Ok(CycleOutput::forward_to_remote(payload))
                        }
                    };
                    let output = match result {
                        Ok(output) => output,
                        Err(e) => {
                            // One failed cycle does not end the session
                            warn!("Exception during read from {}, resetting... ({:#})", leg, e);
                            continue;
                        }
                    };
                    if !output.delay.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(output.delay) => {}
                            _ = shutdown.recv() => return SessionEnd::Shutdown,
                        }
                    }
                    match output.outcome {
                        CycleOutcome::Forward(frames) => {
                            for frame in frames {
                                let sink = match frame.target {
                                    Target::Origin => &origin_sink,
                                    Target::Remote => &remote_sink,
                                };
                                let sent = sink
                                    .lock()
                                    .await
                                    .send(WsMessage::Binary(frame.payload))
                                    .await;
                                if let Err(e) = sent {
                                    warn!("Send failed relaying from {}: {}", leg, e);
                                    return SessionEnd::Closed;
                                }
                            }
                        }
                        CycleOutcome::Buffering => {}
                        CycleOutcome::BreakPipe => {
                            info!("Plugin demanded pipe break, severing both legs");
                            return SessionEnd::Aborted;
                        }
                        CycleOutcome::CloseWebSocket | CycleOutcome::CloseHttp => {
                            info!("Plugin demanded close, shutting the client leg");
                            self.close_client(from_client, &origin_sink, &remote_sink)
                                .await;
                            return SessionEnd::Closed;
                        }
                    }
                }
                WsMessage::Close(frame) => {
                    debug!("Propagating close from {} to the other side", leg);
                    let _ = remote_sink.lock().await.send(WsMessage::Close(frame)).await;
                    return SessionEnd::Closed;
                }
                // Control and text traffic passes through untouched
                other => {
                    if let Err(e) = remote_sink.lock().await.send(other).await {
                        warn!("Send failed relaying from {}: {}", leg, e);
                        return SessionEnd::Closed;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameCodec;
    use crate::message::{FrameFlags, Message, MessageKind};
    use crate::plugin::PluginDescriptor;
    use crate::plugins::{DisconnectionPlugin, InterceptorPlugin};
    use crate::rules::{Criteria, Direction, Rule, Transform};
    use tokio::sync::mpsc;

    fn test_config(from_port: u16, to_port: u16) -> Config {
        serde_json::from_str(&format!(
            r#"{{ "fromPort": {from_port}, "toPort": {to_port}, "toHost": "127.0.0.1" }}"#
        ))
        .unwrap()
    }

    fn encode(message: &Message) -> Vec<u8> {
        BlipWireCodec.encode(message).unwrap()
    }

    fn decode(payload: Vec<u8>) -> Message {
        BlipWireCodec.decode(&[payload]).unwrap().unwrap()
    }

    fn request(number: u64, body: &[u8]) -> Message {
        let mut msg = Message::new(number, MessageKind::Request);
        msg.properties.insert("Profile", "echo");
        msg.body = body.to_vec();
        msg
    }

    /// Upstream that answers each request with a Response echoing the body
    /// and reports everything it saw on a channel.
    async fn spawn_echo_server() -> (u16, mpsc::UnboundedReceiver<Message>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(WsMessage::Binary(payload))) = ws.next().await {
                let msg = decode(payload);
                let reply_needed = msg.kind == MessageKind::Request
                    && !msg.flags.contains(FrameFlags::NO_REPLY);
                let _ = seen_tx.send(msg.clone());
                if reply_needed {
                    let mut reply = Message::new(msg.number, MessageKind::Response);
                    reply.body = msg.body;
                    ws.send(WsMessage::Binary(encode(&reply))).await.unwrap();
                }
            }
        });
        (port, seen_rx)
    }

    async fn start_proxy(plugins: Vec<Box<dyn TamperPlugin>>, to_port: u16) -> (u16, broadcast::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let from_port = listener.local_addr().unwrap().port();
        let proxy = Arc::new(Proxy::new(test_config(from_port, to_port), plugins));
        let shutdown = proxy.shutdown_handle();
        tokio::spawn(async move { proxy.run_on(listener).await });
        (from_port, shutdown)
    }

    #[tokio::test]
    async fn test_end_to_end_body_transform() {
        let (to_port, mut seen) = spawn_echo_server().await;
        let interceptor = InterceptorPlugin::from_rules(vec![Rule {
            criteria: Criteria {
                profile: Some("echo".to_string()),
                ..Default::default()
            },
            output_transforms: vec![Transform::Body {
                content: "tampered".to_string(),
            }],
            direction: Direction::TO_SERVER,
        }]);
        let (from_port, shutdown) = start_proxy(vec![Box::new(interceptor)], to_port).await;

        let (mut client, _) = connect_async(format!("ws://127.0.0.1:{from_port}/db/_blipsync"))
            .await
            .unwrap();
        client
            .send(WsMessage::Binary(encode(&request(1, b"original"))))
            .await
            .unwrap();

        // Upstream sees the transformed body and echoes it back untouched
        let upstream_view = seen.recv().await.unwrap();
        assert_eq!(upstream_view.body, b"tampered");

        let reply = match client.next().await.unwrap().unwrap() {
            WsMessage::Binary(payload) => decode(payload),
            other => panic!("unexpected frame {other:?}"),
        };
        assert_eq!(reply.kind, MessageKind::Response);
        assert_eq!(reply.number, 1);
        assert_eq!(reply.body, b"tampered");

        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_end_to_end_fabricated_reply_and_noop() {
        let (to_port, mut seen) = spawn_echo_server().await;
        let plugins = {
            let dir = std::env::temp_dir().join(format!(
                "troublemaker-test-{}-{}",
                std::process::id(),
                to_port
            ));
            std::fs::create_dir_all(&dir).unwrap();
            let config_path = dir.join("disconnection.json");
            std::fs::write(
                &config_path,
                r#"{ "disconnectType": "BlipErrorMessage", "patternClauses": ["msgno = 7"] }"#,
            )
            .unwrap();
            vec![
                Box::new(DisconnectionPlugin::from_config_path(Some(config_path.as_path())).unwrap())
                    as Box<dyn TamperPlugin>,
            ]
        };
        let (from_port, shutdown) = start_proxy(plugins, to_port).await;

        let (mut client, _) = connect_async(format!("ws://127.0.0.1:{from_port}/db/_blipsync"))
            .await
            .unwrap();

        // A non-matching request relays normally
        client
            .send(WsMessage::Binary(encode(&request(1, b"hello"))))
            .await
            .unwrap();
        assert_eq!(seen.recv().await.unwrap().number, 1);
        let reply = match client.next().await.unwrap().unwrap() {
            WsMessage::Binary(payload) => decode(payload),
            other => panic!("unexpected frame {other:?}"),
        };
        assert_eq!(reply.kind, MessageKind::Response);

        // The matching request is intercepted: fabricated error to the
        // client, no-op placeholder to the server
        client
            .send(WsMessage::Binary(encode(&request(7, b"doomed"))))
            .await
            .unwrap();
        let reply = match client.next().await.unwrap().unwrap() {
            WsMessage::Binary(payload) => decode(payload),
            other => panic!("unexpected frame {other:?}"),
        };
        assert_eq!(reply.kind, MessageKind::Error);
        assert_eq!(reply.number, 7);
        assert_eq!(reply.body, b"The server is on fire!");
        assert_eq!(reply.properties.get("Error-Domain"), Some("HTTP"));

        let noop = seen.recv().await.unwrap();
        assert_eq!(noop.number, 7);
        assert!(noop.flags.contains(FrameFlags::NO_REPLY));
        assert_eq!(noop.properties.get("no-op"), Some("true"));

        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_listener_rearms_after_session() {
        let (to_port, _seen) = spawn_echo_server().await;
        let (from_port, shutdown) = start_proxy(vec![], to_port).await;

        let (mut client, _) = connect_async(format!("ws://127.0.0.1:{from_port}/"))
            .await
            .unwrap();
        client.close(None).await.unwrap();
        while client.next().await.is_some() {}

        // Second session connects after the first closed; upstream is gone
        // by now so the handshake fails, but the listener must answer
        let second = connect_async(format!("ws://127.0.0.1:{from_port}/")).await;
        let _ = second;

        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_delay_on_one_direction_does_not_stall_the_other() {
        use crate::plugin::{NetworkStage, NetworkVerdict, TamperStyle};
        use async_trait::async_trait;
        use std::time::Duration;

        struct OneWayDelay {
            delay: Duration,
        }

        #[async_trait]
        impl TamperPlugin for OneWayDelay {
            fn name(&self) -> &'static str {
                "one-way-delay"
            }

            fn style(&self) -> TamperStyle {
                TamperStyle::NETWORK
            }

            async fn handle_network_stage(
                &mut self,
                stage: NetworkStage,
                _size: Option<usize>,
                from_client: bool,
            ) -> anyhow::Result<NetworkVerdict> {
                if from_client && stage == NetworkStage::Initial {
                    Ok(NetworkVerdict::delay(self.delay))
                } else {
                    Ok(NetworkVerdict::default())
                }
            }
        }

        // Upstream that pushes server-initiated traffic on command and
        // reports every message it receives
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let to_port = listener.local_addr().unwrap().port();
        let (push_tx, mut push_rx) = mpsc::unbounded_channel::<Message>();
        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            loop {
                tokio::select! {
                    Some(msg) = push_rx.recv() => {
                        ws.send(WsMessage::Binary(encode(&msg))).await.unwrap();
                    }
                    frame = ws.next() => match frame {
                        Some(Ok(WsMessage::Binary(payload))) => {
                            let _ = seen_tx.send(decode(payload));
                        }
                        _ => break,
                    }
                }
            }
        });

        let plugin = OneWayDelay {
            delay: Duration::from_millis(1000),
        };
        let (from_port, shutdown) = start_proxy(vec![Box::new(plugin)], to_port).await;
        let (mut client, _) = connect_async(format!("ws://127.0.0.1:{from_port}/db/_blipsync"))
            .await
            .unwrap();

        // This request enters the delayed direction and holds it for 1s
        client
            .send(WsMessage::Binary(encode(&request(1, b"slow lane"))))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // A server push must reach the client while that delay is pending
        let mut push = Message::new(42, MessageKind::Request);
        push.flags |= FrameFlags::NO_REPLY;
        push_tx.send(push).unwrap();

        let started = std::time::Instant::now();
        let delivered = match client.next().await.unwrap().unwrap() {
            WsMessage::Binary(payload) => decode(payload),
            other => panic!("unexpected frame {other:?}"),
        };
        assert_eq!(delivered.number, 42);
        assert!(
            started.elapsed() < Duration::from_millis(500),
            "server push waited {:?} behind the client-side delay",
            started.elapsed()
        );

        // The delayed request still comes out the other end
        assert_eq!(seen.recv().await.unwrap().number, 1);

        let _ = shutdown.send(());
    }

    #[test]
    fn test_plugin_descriptor_list_parses() {
        let raw = r#"[
            { "name": "bad-network", "configPath": "/tmp/bad-network.json" },
            { "name": "no-compression" }
        ]"#;
        let parsed: Vec<PluginDescriptor> = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(parsed[0].config_path.is_some());
        assert!(parsed[1].config_path.is_none());
    }
}
