//! Client for the assistant gateway's WebSocket RPC protocol.
//!
//! One authenticated connection, concurrent request multiplexing over it,
//! server-push event dispatch, and streamed chat replies reassembled from
//! correlated `chat` events. Unexpected connection loss is recovered by a
//! reconnect loop with doubling backoff; explicit [`GatewayClient::disconnect`]
//! is terminal.
//!
//! ```no_run
//! use wicket_client::{ChatOptions, GatewayClient, GatewayConfig};
//!
//! # async fn run() -> Result<(), wicket_client::ClientError> {
//! let client = GatewayClient::new(GatewayConfig::from_env());
//! client.connect().await?;
//!
//! let reply = client
//!     .chat_send("qq:private:42", "hello there", ChatOptions::default())
//!     .await?;
//! if let Some(text) = reply {
//!     println!("{text}");
//! }
//!
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

mod chat;
mod client;
mod config;
mod error;
mod events;
mod pending;

pub use wicket_protocol as protocol;

pub use {
    chat::{AgentOptions, ChatOptions, DeltaHandler, ImageAttachment, SendOptions},
    client::{ConnectionState, GatewayClient},
    config::GatewayConfig,
    error::ClientError,
    events::{EventHandler, HandlerId, Subscription},
};
