//! Event dispatch: ordered handler lists per event name, plus a wildcard
//! bucket that sees everything.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use {dashmap::DashMap, futures::future::BoxFuture, serde_json::Value, tracing::error};

use wicket_protocol::events;

/// Handler invoked for matching inbound events.
///
/// Handlers receive the event name and payload. Failure is reported through
/// the returned result; a failing handler is logged and never affects other
/// handlers or the receive loop. Handlers run on the receive loop, so they
/// should not block.
pub type EventHandler =
    Arc<dyn Fn(String, Option<Value>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Identifies one registration for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

/// Event-name → ordered handler list. Registration order is invocation
/// order.
#[derive(Default)]
pub(crate) struct EventRegistry {
    handlers: DashMap<String, Vec<(HandlerId, EventHandler)>>,
    next_id: AtomicU64,
}

impl EventRegistry {
    pub fn register(&self, event: &str, handler: EventHandler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .entry(event.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    pub fn unregister(&self, event: &str, id: HandlerId) -> bool {
        let Some(mut list) = self.handlers.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(handler_id, _)| *handler_id != id);
        before != list.len()
    }

    /// Snapshot the handler list so dispatch never awaits under the map lock.
    fn handlers_for(&self, event: &str) -> Vec<EventHandler> {
        self.handlers
            .get(event)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    /// Invoke handlers for `event` in registration order, then wildcard
    /// handlers. Each failure is logged and contained.
    pub async fn dispatch(&self, event: &str, payload: Option<&Value>) {
        for handler in self.handlers_for(event) {
            if let Err(e) = handler(event.to_string(), payload.cloned()).await {
                error!(error = %e, event, "event handler failed");
            }
        }
        if event != events::WILDCARD {
            for handler in self.handlers_for(events::WILDCARD) {
                if let Err(e) = handler(event.to_string(), payload.cloned()).await {
                    error!(error = %e, event, "wildcard event handler failed");
                }
            }
        }
    }
}

/// Scoped registration: the handler is removed when the guard drops, on
/// every exit path.
pub struct Subscription {
    registry: Arc<EventRegistry>,
    event: String,
    id: HandlerId,
}

impl Subscription {
    pub(crate) fn new(registry: Arc<EventRegistry>, event: &str, id: HandlerId) -> Self {
        Self {
            registry,
            event: event.to_string(),
            id,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.unregister(&self.event, self.id);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio::sync::Mutex;

    use super::*;

    fn recording_handler(log: Arc<Mutex<Vec<String>>>, tag: &str) -> EventHandler {
        let tag = tag.to_string();
        Arc::new(move |event, _payload| {
            let log = Arc::clone(&log);
            let tag = tag.clone();
            Box::pin(async move {
                log.lock().await.push(format!("{tag}:{event}"));
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order() {
        let registry = EventRegistry::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register("chat", recording_handler(Arc::clone(&log), "first"));
        registry.register("chat", recording_handler(Arc::clone(&log), "second"));

        registry.dispatch("chat", None).await;
        assert_eq!(*log.lock().await, vec!["first:chat", "second:chat"]);
    }

    #[tokio::test]
    async fn handler_failure_does_not_stop_the_rest() {
        let registry = EventRegistry::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register(
            "chat",
            Arc::new(|_, _| Box::pin(async { Err(anyhow::anyhow!("broken handler")) })),
        );
        registry.register("chat", recording_handler(Arc::clone(&log), "survivor"));

        registry.dispatch("chat", None).await;
        assert_eq!(*log.lock().await, vec!["survivor:chat"]);
    }

    #[tokio::test]
    async fn wildcard_receives_name_and_payload() {
        let registry = EventRegistry::default();
        let seen: Arc<Mutex<Vec<(String, Option<Value>)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_in = Arc::clone(&seen);
        registry.register(
            events::WILDCARD,
            Arc::new(move |event, payload| {
                let seen = Arc::clone(&seen_in);
                Box::pin(async move {
                    seen.lock().await.push((event, payload));
                    Ok(())
                })
            }),
        );

        let payload = serde_json::json!({"k": "v"});
        registry.dispatch("custom.thing", Some(&payload)).await;

        let seen = seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "custom.thing");
        assert_eq!(seen[0].1.as_ref().unwrap()["k"], "v");
    }

    #[tokio::test]
    async fn named_handlers_run_before_wildcard() {
        let registry = EventRegistry::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register(events::WILDCARD, recording_handler(Arc::clone(&log), "any"));
        registry.register("chat", recording_handler(Arc::clone(&log), "named"));

        registry.dispatch("chat", None).await;
        assert_eq!(*log.lock().await, vec!["named:chat", "any:chat"]);
    }

    #[tokio::test]
    async fn unregister_stops_invocation() {
        let registry = EventRegistry::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = registry.register("chat", recording_handler(Arc::clone(&log), "gone"));
        assert!(registry.unregister("chat", id));
        assert!(!registry.unregister("chat", id));

        registry.dispatch("chat", None).await;
        assert!(log.lock().await.is_empty());
    }

    #[tokio::test]
    async fn subscription_drop_unregisters() {
        let registry = Arc::new(EventRegistry::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        {
            let id = registry.register("chat", recording_handler(Arc::clone(&log), "scoped"));
            let _guard = Subscription::new(Arc::clone(&registry), "chat", id);
            registry.dispatch("chat", None).await;
        }
        registry.dispatch("chat", None).await;
        assert_eq!(*log.lock().await, vec!["scoped:chat"]);
    }
}
