//! Chat streaming session and the direct request helpers.
//!
//! `chat.send` itself only acknowledges submission; the reply streams in as
//! `chat` events correlated by session key. The session here accumulates
//! deltas (each carries the cumulative text so far) until a terminal
//! `final`/`error`/`aborted` event resolves the call.

use std::{sync::Arc, time::Duration};

use {
    base64::Engine as _,
    futures::future::BoxFuture,
    serde_json::Value,
    tokio::sync::{Mutex, oneshot},
    tracing::debug,
};

use wicket_protocol::{
    AgentParams, Attachment, ChatEventPayload, ChatSendParams, ChatState, SendParams, events,
    methods, status,
};

use crate::{client::GatewayClient, error::ClientError, events::EventHandler};

/// Callback invoked with each cumulative delta fragment.
pub type DeltaHandler = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Image carried along with a chat message.
#[derive(Debug, Clone)]
pub struct ImageAttachment {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl ImageAttachment {
    fn to_wire(&self) -> Attachment {
        Attachment::image(
            self.mime_type.as_str(),
            base64::engine::general_purpose::STANDARD.encode(&self.data),
        )
    }
}

/// Options for [`GatewayClient::chat_send`].
#[derive(Clone, Default)]
pub struct ChatOptions {
    /// Thinking mode forwarded to the gateway (`off`/`low`/`high`).
    pub thinking: Option<String>,
    /// Overall bound for the streamed reply. Defaults to the config's
    /// `chat_timeout`.
    pub timeout: Option<Duration>,
    /// Invoked with the latest cumulative fragment on every delta.
    pub on_delta: Option<DeltaHandler>,
    pub attachments: Vec<ImageAttachment>,
}

/// Options for [`GatewayClient::agent_send`].
#[derive(Clone, Default)]
pub struct AgentOptions {
    pub session_key: Option<String>,
    pub agent_id: Option<String>,
    pub thinking: Option<String>,
    /// Defaults to the config's `agent_timeout`.
    pub timeout: Option<Duration>,
}

/// Options for [`GatewayClient::send_message`].
#[derive(Clone, Default)]
pub struct SendOptions {
    pub channel: Option<String>,
    pub account_id: Option<String>,
}

/// Per-call accumulator, destroyed when the call returns.
struct ChatStream {
    text: String,
    done: Option<oneshot::Sender<Result<(), ClientError>>>,
}

impl ChatStream {
    fn finish(&mut self, outcome: Result<(), ClientError>) {
        if let Some(done) = self.done.take() {
            let _ = done.send(outcome);
        }
    }
}

impl GatewayClient {
    /// Send a chat message and reconstruct the streamed reply.
    ///
    /// Returns the trimmed final text, or `None` when the reply carried no
    /// text at all. Progress arrives as `chat` events for `session_key`;
    /// events for other sessions on the same connection are ignored.
    pub async fn chat_send(
        &self,
        session_key: &str,
        message: &str,
        options: ChatOptions,
    ) -> Result<Option<String>, ClientError> {
        let params = ChatSendParams {
            session_key: session_key.to_string(),
            message: message.to_string(),
            idempotency_key: uuid::Uuid::new_v4().to_string(),
            thinking: options.thinking.clone(),
            attachments: (!options.attachments.is_empty()).then(|| {
                options
                    .attachments
                    .iter()
                    .map(ImageAttachment::to_wire)
                    .collect()
            }),
        };
        let params =
            serde_json::to_value(params).map_err(|e| ClientError::Protocol(e.to_string()))?;

        let (done_tx, done_rx) = oneshot::channel();
        let stream = Arc::new(Mutex::new(ChatStream {
            text: String::new(),
            done: Some(done_tx),
        }));

        // The guard holds the temporary handler; it drops — and the handler
        // unregisters — on every exit path below, including `?`.
        let _chat_events = self.subscribe(
            events::CHAT,
            chat_event_handler(
                session_key.to_string(),
                Arc::clone(&stream),
                options.on_delta.clone(),
            ),
        );

        // Submission acknowledgment only; the answer comes over events.
        let ack = self
            .request(
                methods::CHAT_SEND,
                Some(params),
                self.config().ack_timeout,
                false,
            )
            .await?;
        if let Some(ack) = &ack
            && ack.get("status").and_then(Value::as_str) == Some(status::ERROR)
        {
            let summary = ack
                .get("summary")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(ClientError::Remote(format!("chat.send failed: {summary}")));
        }

        let timeout = options.timeout.unwrap_or(self.config().chat_timeout);
        let outcome = match tokio::time::timeout(timeout, done_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => Err(ClientError::Timeout {
                method: methods::CHAT_SEND.into(),
            }),
        };
        outcome?;

        let text = stream.lock().await.text.trim().to_string();
        Ok((!text.is_empty()).then_some(text))
    }

    /// Invoke the gateway agent and wait for its final text.
    ///
    /// Unlike [`Self::chat_send`], the answer arrives as the request's own
    /// final response; intermediate `accepted` acks are skipped over.
    pub async fn agent_send(
        &self,
        message: &str,
        options: AgentOptions,
    ) -> Result<Option<String>, ClientError> {
        let params = AgentParams {
            message: message.to_string(),
            idempotency_key: uuid::Uuid::new_v4().to_string(),
            session_key: options.session_key,
            agent_id: options.agent_id,
            thinking: options.thinking,
        };
        let params =
            serde_json::to_value(params).map_err(|e| ClientError::Protocol(e.to_string()))?;

        let timeout = options.timeout.unwrap_or(self.config().agent_timeout);
        let payload = self.request(methods::AGENT, Some(params), timeout, true).await?;

        let text = payload.as_ref().and_then(|p| {
            p.get("text")
                .and_then(Value::as_str)
                .or_else(|| p.get("response").and_then(Value::as_str))
        });
        Ok(text
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from))
    }

    /// Send a message straight to a delivery target (phone number, user id).
    /// Returns the gateway's raw result payload.
    pub async fn send_message(
        &self,
        to: &str,
        message: &str,
        options: SendOptions,
    ) -> Result<Option<Value>, ClientError> {
        let params = SendParams {
            to: to.to_string(),
            message: message.to_string(),
            idempotency_key: uuid::Uuid::new_v4().to_string(),
            channel: options.channel,
            account_id: options.account_id,
        };
        let params =
            serde_json::to_value(params).map_err(|e| ClientError::Protocol(e.to_string()))?;
        self.request(
            methods::SEND,
            Some(params),
            self.config().request_timeout,
            false,
        )
        .await
    }
}

fn chat_event_handler(
    session_key: String,
    stream: Arc<Mutex<ChatStream>>,
    on_delta: Option<DeltaHandler>,
) -> EventHandler {
    Arc::new(move |_event, payload| {
        let session_key = session_key.clone();
        let stream = Arc::clone(&stream);
        let on_delta = on_delta.clone();
        Box::pin(async move {
            let Some(payload) = payload else {
                return Ok(());
            };
            let payload: ChatEventPayload = serde_json::from_value(payload)
                .map_err(|e| anyhow::anyhow!("undecodable chat payload: {e}"))?;
            if payload.session_key != session_key {
                debug!(session = %payload.session_key, "ignoring chat event for another session");
                return Ok(());
            }

            let mut stream = stream.lock().await;
            match payload.state {
                ChatState::Delta => {
                    if let Some(text) = payload.message.as_ref().and_then(|m| m.joined_text()) {
                        // Each delta carries the cumulative text so far.
                        stream.text = text.clone();
                        if let Some(on_delta) = &on_delta
                            && !text.is_empty()
                        {
                            on_delta(text).await;
                        }
                    }
                },
                ChatState::Final => {
                    if let Some(text) = payload.message.as_ref().and_then(|m| m.joined_text()) {
                        stream.text = text;
                    }
                    stream.finish(Ok(()));
                },
                ChatState::Error => {
                    let message = payload
                        .error_message
                        .unwrap_or_else(|| "unknown error".into());
                    stream.finish(Err(ClientError::Remote(message)));
                },
                ChatState::Aborted => {
                    stream.finish(Err(ClientError::Remote("request aborted".into())));
                },
            }
            Ok(())
        })
    })
}
