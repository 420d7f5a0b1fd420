use std::time::Duration;

use secrecy::Secret;

use wicket_protocol::{
    CHALLENGE_WAIT_MS, ClientInfo, ConnectAuth, ConnectParams, HANDSHAKE_TIMEOUT_MS,
    PROTOCOL_VERSION, roles, scopes,
};

/// Connection settings for [`crate::GatewayClient`].
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Gateway WebSocket URL.
    pub url: String,
    /// Bearer token, sent in the `connect` auth block when set.
    pub token: Option<Secret<String>>,
    /// Password, sent in the `connect` auth block when set.
    pub password: Option<Secret<String>>,
    /// Client id. Must match an identity pre-registered on the gateway.
    pub client_id: String,
    pub client_version: String,
    /// Platform string reported in the handshake.
    pub platform: String,
    /// Operating mode reported in the handshake.
    pub mode: String,
    pub role: String,
    pub scopes: Vec<String>,
    /// Default bound for plain requests and `send`.
    pub request_timeout: Duration,
    /// Bound for the `chat.send` submission acknowledgment.
    pub ack_timeout: Duration,
    /// Default bound for a full streamed chat reply.
    pub chat_timeout: Duration,
    /// Default bound for an `agent` invocation.
    pub agent_timeout: Duration,
    /// Pre-handshake window for an unsolicited `connect.challenge`.
    pub challenge_wait: Duration,
    /// Bound for the `connect` response.
    pub handshake_timeout: Duration,
    /// First reconnect delay. Doubles per failed attempt.
    pub reconnect_initial: Duration,
    /// Reconnect delay cap.
    pub reconnect_max: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:18789".into(),
            token: None,
            password: None,
            client_id: "gateway-client".into(),
            client_version: env!("CARGO_PKG_VERSION").into(),
            platform: std::env::consts::OS.into(),
            mode: "backend".into(),
            role: roles::OPERATOR.into(),
            scopes: vec![scopes::ADMIN.into()],
            request_timeout: Duration::from_secs(60),
            ack_timeout: Duration::from_secs(10),
            chat_timeout: Duration::from_secs(60),
            agent_timeout: Duration::from_secs(120),
            challenge_wait: Duration::from_millis(CHALLENGE_WAIT_MS),
            handshake_timeout: Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

impl GatewayConfig {
    /// Defaults, with URL and credentials resolved from `WICKET_GATEWAY_URL`,
    /// `WICKET_TOKEN` and `WICKET_PASSWORD`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("WICKET_GATEWAY_URL") {
            config.url = url;
        }
        config.token = std::env::var("WICKET_TOKEN").ok().map(Secret::new);
        config.password = std::env::var("WICKET_PASSWORD").ok().map(Secret::new);
        config
    }

    /// Build the `connect` handshake parameters. Secrets are exposed here
    /// and nowhere else.
    pub(crate) fn connect_params(&self) -> ConnectParams {
        use secrecy::ExposeSecret;

        let auth = (self.token.is_some() || self.password.is_some()).then(|| ConnectAuth {
            token: self.token.as_ref().map(|t| t.expose_secret().clone()),
            password: self.password.as_ref().map(|p| p.expose_secret().clone()),
        });

        ConnectParams {
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client: ClientInfo {
                id: self.client_id.clone(),
                version: self.client_version.clone(),
                platform: self.platform.clone(),
                mode: self.mode.clone(),
            },
            caps: Vec::new(),
            role: self.role.clone(),
            scopes: self.scopes.clone(),
            auth,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_gateway_expectations() {
        let config = GatewayConfig::default();
        assert_eq!(config.url, "ws://127.0.0.1:18789");
        assert_eq!(config.client_id, "gateway-client");
        assert_eq!(config.mode, "backend");
        assert_eq!(config.role, "operator");
        assert_eq!(config.scopes, vec!["operator.admin".to_string()]);
        assert_eq!(config.reconnect_initial, Duration::from_secs(1));
        assert_eq!(config.reconnect_max, Duration::from_secs(30));
        assert_eq!(config.challenge_wait, Duration::from_secs(2));
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
    }

    #[test]
    fn connect_params_pin_protocol_version() {
        let params = GatewayConfig::default().connect_params();
        assert_eq!(params.min_protocol, params.max_protocol);
        assert_eq!(params.min_protocol, PROTOCOL_VERSION);
        assert!(params.caps.is_empty());
        assert!(params.auth.is_none());
    }

    #[test]
    fn connect_params_carry_configured_credentials() {
        let config = GatewayConfig {
            token: Some(Secret::new("tok".into())),
            password: Some(Secret::new("pw".into())),
            ..GatewayConfig::default()
        };
        let auth = config.connect_params().auth.unwrap();
        assert_eq!(auth.token.as_deref(), Some("tok"));
        assert_eq!(auth.password.as_deref(), Some("pw"));
    }
}
