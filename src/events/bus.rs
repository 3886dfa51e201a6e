//! In-process publish/subscribe dispatcher.
//!
//! Subscriptions match either an exact event-type name or a glob pattern
//! (`workflow.*`). `emit` snapshots the matching handlers under the lock,
//! releases it, then runs every handler concurrently; a handler failure is
//! logged with event context and never blocks the other handlers.

use futures::future::{join_all, BoxFuture};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::NexusEvent;

pub type SubscriptionId = Uuid;

/// Boxed async event handler. Use [`EventBus::handler`] to wrap a closure.
pub type EventHandler =
    Arc<dyn Fn(NexusEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct Subscription {
    event_type: String,
    handler: EventHandler,
    is_pattern: bool,
}

#[derive(Default)]
pub struct EventBus {
    subscriptions: Mutex<HashMap<SubscriptionId, Subscription>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an async closure into an [`EventHandler`].
    pub fn handler<F, Fut>(f: F) -> EventHandler
    where
        F: Fn(NexusEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Arc::new(move |event| Box::pin(f(event)))
    }

    /// Subscribe a handler to an exact event type.
    pub fn subscribe(&self, event_type: &str, handler: EventHandler) -> SubscriptionId {
        self.insert(event_type, handler, false)
    }

    /// Subscribe a handler using a glob pattern, e.g. `"workflow.*"` or
    /// `"*"`.
    pub fn subscribe_pattern(&self, pattern: &str, handler: EventHandler) -> SubscriptionId {
        self.insert(pattern, handler, true)
    }

    fn insert(&self, event_type: &str, handler: EventHandler, is_pattern: bool) -> SubscriptionId {
        let id = Uuid::new_v4();
        let mut subs = self
            .subscriptions
            .lock()
            .expect("event bus subscription lock poisoned");
        subs.insert(
            id,
            Subscription {
                event_type: event_type.to_string(),
                handler,
                is_pattern,
            },
        );
        id
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self
            .subscriptions
            .lock()
            .expect("event bus subscription lock poisoned");
        subs.remove(&id).is_some()
    }

    /// Number of active subscriptions, optionally restricted to one exact
    /// event type.
    pub fn subscriber_count(&self, event_type: Option<&str>) -> usize {
        let subs = self
            .subscriptions
            .lock()
            .expect("event bus subscription lock poisoned");
        match event_type {
            None => subs.len(),
            Some(name) => subs.values().filter(|s| s.event_type == name).count(),
        }
    }

    /// Emit an event to all matching subscribers and wait for every handler
    /// to terminate. Handler errors are logged, not propagated.
    pub async fn emit(&self, event: NexusEvent) {
        let event_type = event.event_type();
        let handlers: Vec<EventHandler> = {
            let subs = self
                .subscriptions
                .lock()
                .expect("event bus subscription lock poisoned");
            subs.values()
                .filter(|sub| {
                    if sub.is_pattern {
                        glob::Pattern::new(&sub.event_type)
                            .map(|p| p.matches(event_type))
                            .unwrap_or(false)
                    } else {
                        sub.event_type == event_type
                    }
                })
                .map(|sub| sub.handler.clone())
                .collect()
        };

        if handlers.is_empty() {
            return;
        }

        let results = join_all(handlers.into_iter().map(|handler| {
            let event = event.clone();
            async move { handler(event).await }
        }))
        .await;

        for result in results {
            if let Err(e) = result {
                tracing::error!(
                    event_type = event_type,
                    workflow_id = event.workflow_id.as_deref().unwrap_or(""),
                    "Event handler error: {e:#}"
                );
            }
        }
    }

    /// Remove all subscriptions. Test isolation helper.
    pub fn clear(&self) {
        let mut subs = self
            .subscriptions
            .lock()
            .expect("event bus subscription lock poisoned");
        subs.clear();
    }
}
