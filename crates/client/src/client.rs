//! Connection lifecycle: dial, authenticated handshake, receive loop, and
//! reconnection with bounded backoff.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use {
    futures::{
        SinkExt, StreamExt,
        stream::{SplitSink, SplitStream},
    },
    serde_json::Value,
    tokio::{net::TcpStream, sync::Mutex, task::JoinHandle},
    tokio_tungstenite::{
        MaybeTlsStream, WebSocketStream, connect_async_with_config,
        tungstenite::{Message, protocol::WebSocketConfig},
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use wicket_protocol::{
    ChallengePayload, Frame, HelloPayload, MAX_FRAME_BYTES, events, methods,
};

use crate::{
    config::GatewayConfig,
    error::ClientError,
    events::{EventHandler, EventRegistry, HandlerId, Subscription},
    pending::PendingRequests,
};

/// Stream type produced by `connect_async_with_config`.
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

// ── Connection state ─────────────────────────────────────────────────────────

/// Lifecycle of the single gateway connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
    /// Terminal, user-initiated. No further reconnection is attempted.
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Reconnecting,
            4 => Self::Closed,
            _ => Self::Disconnected,
        }
    }
}

/// Next reconnect delay: doubled, capped.
fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

// ── Client ───────────────────────────────────────────────────────────────────

/// Handle to the single gateway connection. Cheap to clone; every clone
/// shares one socket, one pending-request map and one event registry.
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: GatewayConfig,
    state: AtomicU8,
    /// Serializes connect/teardown so a second socket is never opened
    /// concurrently with a live one.
    connect_lock: Mutex<()>,
    writer: Mutex<Option<WsSink>>,
    pending: PendingRequests,
    events: Arc<EventRegistry>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    cancel: Mutex<CancellationToken>,
    challenge_nonce: Mutex<Option<String>>,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                state: AtomicU8::new(ConnectionState::Disconnected as u8),
                connect_lock: Mutex::new(()),
                writer: Mutex::new(None),
                pending: PendingRequests::default(),
                events: Arc::new(EventRegistry::default()),
                recv_task: Mutex::new(None),
                cancel: Mutex::new(CancellationToken::new()),
                challenge_nonce: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// Whether the handshake has completed on a live socket.
    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Store `state` unless the client has been closed. Returns false when
    /// the closed state won.
    fn set_state_unless_closed(&self, state: ConnectionState) -> bool {
        let closed = ConnectionState::Closed as u8;
        self.inner
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != closed).then_some(state as u8)
            })
            .is_ok()
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Open the socket and run the authenticated handshake.
    ///
    /// Any previous connection is torn down first; its pending requests
    /// fail with [`ClientError::ConnectionClosed`]. No retries happen here.
    /// Recovery from unexpected loss is the reconnect loop's job; repeating
    /// a failed startup `connect` is the caller's.
    pub async fn connect(&self) -> Result<HelloPayload, ClientError> {
        let _guard = self.inner.connect_lock.lock().await;
        if self.state() == ConnectionState::Closed {
            return Err(ClientError::ConnectionClosed);
        }
        self.teardown().await;
        self.set_state_unless_closed(ConnectionState::Connecting);

        let (hello, sink, source) = match self.dial_and_handshake().await {
            Ok(parts) => parts,
            Err(e) => {
                self.set_state_unless_closed(ConnectionState::Disconnected);
                return Err(e);
            },
        };

        *self.inner.writer.lock().await = Some(sink);
        if !self.set_state_unless_closed(ConnectionState::Connected) {
            // disconnect() raced us; drop the fresh socket.
            if let Some(mut sink) = self.inner.writer.lock().await.take() {
                let _ = sink.close().await;
            }
            return Err(ClientError::ConnectionClosed);
        }

        let cancel = CancellationToken::new();
        *self.inner.cancel.lock().await = cancel.clone();
        let client = self.clone();
        *self.inner.recv_task.lock().await = Some(tokio::spawn(client.receive_loop(source, cancel)));

        info!(protocol = hello.protocol, "gateway handshake complete");
        Ok(hello)
    }

    /// Permanently close the client. Idempotent; no reconnection follows.
    pub async fn disconnect(&self) {
        self.inner
            .state
            .store(ConnectionState::Closed as u8, Ordering::SeqCst);
        self.teardown().await;
        info!("gateway client closed");
    }

    /// Cancel the receive loop, close the socket, and fail all waiters.
    async fn teardown(&self) {
        self.inner.cancel.lock().await.cancel();
        if let Some(task) = self.inner.recv_task.lock().await.take() {
            // The token stops the loop between frames; abort also unsticks a
            // handler that is mid-await.
            task.abort();
            let _ = task.await;
        }
        if let Some(mut sink) = self.inner.writer.lock().await.take() {
            let _ = sink.close().await;
        }
        self.inner.pending.fail_all();
    }

    // ── Handshake ────────────────────────────────────────────────────────

    async fn dial_and_handshake(&self) -> Result<(HelloPayload, WsSink, WsSource), ClientError> {
        let config = &self.inner.config;
        url::Url::parse(&config.url)?;

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(MAX_FRAME_BYTES);
        ws_config.max_frame_size = Some(MAX_FRAME_BYTES);
        let (stream, _) =
            connect_async_with_config(config.url.as_str(), Some(ws_config), false).await?;
        let (mut sink, mut source) = stream.split();

        let hello = self.handshake(&mut sink, &mut source).await?;
        Ok((hello, sink, source))
    }

    /// Run the `connect` exchange directly on the socket, before the receive
    /// loop exists. The gateway may open with a `connect.challenge` event;
    /// its nonce is recorded, but the request still goes out unsigned.
    async fn handshake(
        &self,
        sink: &mut WsSink,
        source: &mut WsSource,
    ) -> Result<HelloPayload, ClientError> {
        let config = &self.inner.config;

        if let Ok(Some(first)) = tokio::time::timeout(config.challenge_wait, source.next()).await {
            match first {
                Ok(msg) => match frame_from_message(&msg) {
                    Some(Frame::Event { event, payload }) if event == events::CONNECT_CHALLENGE => {
                        self.record_challenge(payload.as_ref()).await;
                    },
                    Some(_) | None => debug!("discarding pre-handshake frame"),
                },
                Err(e) => return Err(ClientError::Transport(e)),
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        let params = serde_json::to_value(config.connect_params())
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        let frame = Frame::request(&id, methods::CONNECT, Some(params));
        let raw = frame
            .encode()
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        sink.send(Message::Text(raw.into())).await?;

        let response = tokio::time::timeout(config.handshake_timeout, source.next())
            .await
            .map_err(|_| ClientError::Handshake("timed out waiting for connect response".into()))?
            .ok_or_else(|| ClientError::Handshake("socket closed during handshake".into()))??;

        match frame_from_message(&response) {
            Some(Frame::Response {
                id: response_id,
                ok,
                payload,
                error,
            }) if response_id == id => {
                if !ok {
                    let message = error
                        .map(|e| e.message)
                        .unwrap_or_else(|| "unknown error".into());
                    return Err(ClientError::Handshake(message));
                }
                let payload = payload.ok_or_else(|| {
                    ClientError::Handshake("connect response carried no payload".into())
                })?;
                serde_json::from_value(payload)
                    .map_err(|e| ClientError::Handshake(format!("malformed hello payload: {e}")))
            },
            _ => Err(ClientError::Handshake(
                "unexpected frame during handshake".into(),
            )),
        }
    }

    async fn record_challenge(&self, payload: Option<&Value>) {
        let Some(payload) = payload else { return };
        match serde_json::from_value::<ChallengePayload>(payload.clone()) {
            Ok(challenge) => {
                // Held for a future signed-challenge exchange; connect is
                // currently sent unsigned regardless.
                debug!(nonce = %challenge.nonce, "received connect.challenge");
                *self.inner.challenge_nonce.lock().await = Some(challenge.nonce);
            },
            Err(e) => warn!(error = %e, "malformed connect.challenge payload"),
        }
    }

    // ── Receive loop ─────────────────────────────────────────────────────

    /// Drain inbound frames until the socket closes or the connection is
    /// torn down. Runs as a background task, one per connection.
    async fn receive_loop(self, mut source: WsSource, cancel: CancellationToken) {
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => return,
                msg = source.next() => msg,
            };
            match msg {
                Some(Ok(Message::Close(_))) => {
                    debug!("gateway closed the connection");
                    break;
                },
                Some(Ok(msg)) => {
                    if let Some(frame) = frame_from_message(&msg) {
                        self.handle_frame(frame).await;
                    }
                },
                Some(Err(e)) => {
                    warn!(error = %e, "socket read failed");
                    break;
                },
                None => {
                    debug!("socket stream ended");
                    break;
                },
            }
        }

        // Unexpected loss. Fail waiters now; recovery belongs to the
        // reconnect loop unless the client was closed on purpose.
        let outstanding = self.inner.pending.len();
        self.inner.pending.fail_all();
        if self.set_state_unless_closed(ConnectionState::Reconnecting) {
            warn!(outstanding, "gateway connection lost, reconnecting");
            let client = self.clone();
            tokio::spawn(client.run_reconnect());
        }
    }

    async fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Response {
                id,
                ok,
                payload,
                error,
            } => self.inner.pending.resolve(&id, ok, payload, error),
            Frame::Event { event, payload } => self.handle_event(event, payload).await,
            Frame::Request { method, .. } => {
                debug!(method, "ignoring inbound request frame");
            },
        }
    }

    async fn handle_event(&self, event: String, payload: Option<Value>) {
        match event.as_str() {
            events::CONNECT_CHALLENGE => {
                self.record_challenge(payload.as_ref()).await;
                // Re-authenticate off the receive loop. Best effort.
                let client = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = client.resend_connect().await {
                        warn!(error = %e, "re-issued connect failed");
                    }
                });
            },
            events::TICK => {},
            _ => self.inner.events.dispatch(&event, payload.as_ref()).await,
        }
    }

    /// Re-issue the `connect` request through the correlator after a
    /// mid-session challenge.
    async fn resend_connect(&self) -> Result<(), ClientError> {
        let nonce = self.inner.challenge_nonce.lock().await.clone();
        debug!(nonce = nonce.as_deref().unwrap_or(""), "re-issuing connect");
        let params = serde_json::to_value(self.inner.config.connect_params())
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        self.request(
            methods::CONNECT,
            Some(params),
            self.inner.config.handshake_timeout,
            false,
        )
        .await?;
        info!("re-issued connect after challenge");
        Ok(())
    }

    // ── Reconnect ────────────────────────────────────────────────────────

    /// Reconnect with doubling backoff until success or explicit close.
    /// No attempt cap: availability favors eventual recovery.
    ///
    /// Returns a boxed future so its type is nominal rather than opaque,
    /// which breaks the `Send` auto-trait inference cycle formed by
    /// `connect` → `receive_loop` → `run_reconnect` → `connect`.
    fn run_reconnect(self) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
        let mut backoff = self.inner.config.reconnect_initial;
        loop {
            if self.state() == ConnectionState::Closed || self.connected() {
                return;
            }
            debug!(wait = ?backoff, "next reconnect attempt");
            tokio::time::sleep(backoff).await;
            if self.state() == ConnectionState::Closed || self.connected() {
                return;
            }
            match self.connect().await {
                Ok(_) => {
                    info!("gateway reconnected");
                    return;
                },
                Err(e) => {
                    warn!(error = %e, "reconnect attempt failed");
                    if !self.set_state_unless_closed(ConnectionState::Reconnecting) {
                        return;
                    }
                },
            }
            backoff = next_backoff(backoff, self.inner.config.reconnect_max);
        }
        })
    }

    // ── Requests ─────────────────────────────────────────────────────────

    /// Send `method` and wait up to `timeout` for its completion.
    ///
    /// With `expect_final`, intermediate `status:"accepted"` responses keep
    /// the request pending until a terminal response arrives. A response
    /// arriving after the timeout is discarded as stale.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        expect_final: bool,
    ) -> Result<Option<Value>, ClientError> {
        if !self.connected() {
            return Err(ClientError::NotConnected);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let rx = self.inner.pending.insert(&id, expect_final);
        let frame = Frame::request(&id, method, params);

        if let Err(e) = self.send_frame(&frame).await {
            self.inner.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(completion)) => completion,
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                self.inner.pending.remove(&id);
                Err(ClientError::Timeout {
                    method: method.into(),
                })
            },
        }
    }

    async fn send_frame(&self, frame: &Frame) -> Result<(), ClientError> {
        let raw = frame
            .encode()
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        let mut writer = self.inner.writer.lock().await;
        match writer.as_mut() {
            Some(sink) => Ok(sink.send(Message::Text(raw.into())).await?),
            None => Err(ClientError::NotConnected),
        }
    }

    // ── Event registration ───────────────────────────────────────────────

    /// Register `handler` for `event` (or the `"*"` wildcard).
    /// Registration order is invocation order.
    pub fn on_event(&self, event: &str, handler: EventHandler) -> HandlerId {
        self.inner.events.register(event, handler)
    }

    /// Remove a previously registered handler.
    pub fn off_event(&self, event: &str, id: HandlerId) -> bool {
        self.inner.events.unregister(event, id)
    }

    /// Register `handler` for the lifetime of the returned guard.
    pub fn subscribe(&self, event: &str, handler: EventHandler) -> Subscription {
        let id = self.inner.events.register(event, handler);
        Subscription::new(Arc::clone(&self.inner.events), event, id)
    }
}

fn frame_from_message(msg: &Message) -> Option<Frame> {
    match msg {
        Message::Text(raw) => match Frame::decode(raw.as_str()) {
            Ok(frame) => Some(frame),
            Err(e) => {
                // One bad frame never tears down the connection.
                warn!(error = %e, "dropping undecodable frame");
                None
            },
        },
        _ => None,
    }
}
