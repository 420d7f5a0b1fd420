//! Request correlator: outstanding requests by id, resolved by the receive
//! loop when matching responses arrive.

use {dashmap::DashMap, serde_json::Value, tokio::sync::oneshot};

use wicket_protocol::{ErrorBody, status};

use crate::error::ClientError;

/// Outcome delivered to a request waiter.
pub(crate) type Completion = Result<Option<Value>, ClientError>;

struct Pending {
    tx: oneshot::Sender<Completion>,
    expect_final: bool,
}

/// Tracks in-flight requests. One entry per id; each entry completes at most
/// once.
#[derive(Default)]
pub(crate) struct PendingRequests {
    map: DashMap<String, Pending>,
}

impl PendingRequests {
    /// Register a request and hand back its completion slot.
    pub fn insert(&self, id: &str, expect_final: bool) -> oneshot::Receiver<Completion> {
        let (tx, rx) = oneshot::channel();
        self.map.insert(id.to_string(), Pending { tx, expect_final });
        rx
    }

    /// Route a response to its waiter.
    ///
    /// Responses with no matching entry are discarded as stale. Under
    /// `expect_final`, an ok response whose payload status is `"accepted"`
    /// leaves the request pending.
    pub fn resolve(&self, id: &str, ok: bool, payload: Option<Value>, error: Option<ErrorBody>) {
        let accepted = ok
            && payload
                .as_ref()
                .and_then(|p| p.get("status"))
                .and_then(Value::as_str)
                == Some(status::ACCEPTED);
        let Some((_, pending)) = self.map.remove_if(id, |_, p| !(p.expect_final && accepted))
        else {
            return;
        };
        let completion = if ok {
            Ok(payload)
        } else {
            Err(ClientError::Remote(
                error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "unknown error".into()),
            ))
        };
        let _ = pending.tx.send(completion);
    }

    /// Drop a request that timed out locally. Returns whether it was present.
    pub fn remove(&self, id: &str) -> bool {
        self.map.remove(id).is_some()
    }

    /// Fail every outstanding waiter with `ConnectionClosed`. The pending
    /// set is empty afterward.
    pub fn fail_all(&self) {
        let ids: Vec<String> = self.map.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Some((_, pending)) = self.map.remove(&id) {
                let _ = pending.tx.send(Err(ClientError::ConnectionClosed));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}
