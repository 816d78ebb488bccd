use std::collections::BTreeSet;
use std::future::Future;

use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::{Receiver, Sender};
use tokio::task::JoinHandle;

use lightscene_api::context::ContextId;

/// Notifications delivered by the host platform.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlatformEvent {
    StateChanged {
        entity_id: String,
        context: ContextId,
    },
    CallService {
        domain: String,
        service: String,
        service_data: Value,
        context: ContextId,
    },
    SceneReloaded,
    /// Platform reconnected; scenes may have changed while away
    Reconnected,
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct EventBus {
    tx: Sender<PlatformEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    const BUFFER_SIZE: usize = 256;

    #[must_use]
    pub fn new() -> Self {
        Self {
            tx: Sender::new(Self::BUFFER_SIZE),
        }
    }

    pub fn send(&self, event: PlatformEvent) {
        // no subscribers is fine, the event is simply not needed
        let _ = self.tx.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> Receiver<PlatformEvent> {
        self.tx.subscribe()
    }

    /// Call `handler` for every state change of the given entities, until
    /// the returned [`Subscription`] is dropped.
    pub fn track_state_changes<F, Fut>(
        &self,
        entity_ids: BTreeSet<String>,
        handler: F,
    ) -> Subscription
    where
        F: Fn(String, ContextId) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut rx = self.subscribe();

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(PlatformEvent::StateChanged { entity_id, context }) => {
                        if entity_ids.contains(&entity_id) {
                            handler(entity_id, context).await;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(count)) => {
                        log::warn!("State change listener lagged behind, {count} events lost");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Subscription { task }
    }
}

/// Listener registration. Dropping it releases the listener.
#[derive(Debug)]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::{Arc, Mutex};

    use lightscene_api::context::ContextId;

    use crate::scene::event::{EventBus, PlatformEvent};
    use crate::scene::testutil::settle;

    fn changed(entity_id: &str, ctx: &str) -> PlatformEvent {
        PlatformEvent::StateChanged {
            entity_id: entity_id.to_string(),
            context: ContextId::new(ctx),
        }
    }

    #[tokio::test]
    async fn tracks_only_requested_entities() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(vec![]));

        let sink = seen.clone();
        let _sub = bus.track_state_changes(
            BTreeSet::from(["light.a".to_string()]),
            move |entity_id, ctx| {
                let sink = sink.clone();
                async move { sink.lock().unwrap().push((entity_id, ctx)) }
            },
        );

        bus.send(changed("light.a", "c1"));
        bus.send(changed("light.b", "c2"));
        bus.send(PlatformEvent::SceneReloaded);
        settle().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("light.a".to_string(), ContextId::new("c1"))]
        );
    }

    #[tokio::test]
    async fn dropped_subscription_stops_listening() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(0));

        let sink = seen.clone();
        let sub = bus.track_state_changes(
            BTreeSet::from(["light.a".to_string()]),
            move |_, _| {
                let sink = sink.clone();
                async move { *sink.lock().unwrap() += 1 }
            },
        );
        settle().await;

        drop(sub);
        settle().await;
        bus.send(changed("light.a", "c1"));
        settle().await;

        assert_eq!(*seen.lock().unwrap(), 0);
    }
}
