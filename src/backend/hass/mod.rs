pub mod applier;
pub mod client;
pub mod publisher;
pub mod source;

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Duration, MissedTickBehavior, interval};

use crate::error::ApiResult;
use crate::scene::event::{EventBus, PlatformEvent};

use self::client::{HassClient, HassWs};

/// Feeds Home Assistant websocket events onto the event bus, reconnecting
/// whenever the connection drops.
pub struct HassBackend {
    name: String,
    client: Arc<HassClient>,
    bus: EventBus,
    ws: Option<HassWs>,
    connected_before: bool,
}

impl HassBackend {
    const RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

    #[must_use]
    pub fn new(client: Arc<HassClient>, bus: EventBus) -> Self {
        Self {
            name: client.backend_name().to_string(),
            client,
            bus,
            ws: None,
            connected_before: false,
        }
    }

    async fn ensure_ws_connected(&mut self) {
        if self.ws.is_some() {
            return;
        }

        match self.client.subscribe_events().await {
            Ok(ws) => {
                log::info!("[{}] Connected to Home Assistant websocket", self.name);
                self.ws = Some(ws);

                // events may have been missed while away
                if self.connected_before {
                    self.bus.send(PlatformEvent::Reconnected);
                }
                self.connected_before = true;
            }
            Err(err) => {
                log::debug!("[{}] WS connect failed: {}", self.name, err);
            }
        }
    }

    fn handle_ws_event(&mut self, event: ApiResult<Option<PlatformEvent>>) {
        match event {
            Ok(Some(event)) => self.bus.send(event),
            Ok(None) => {
                log::warn!("[{}] Home Assistant websocket closed", self.name);
                self.ws = None;
            }
            Err(err) => {
                log::warn!("[{}] WS error: {}", self.name, err);
                self.ws = None;
            }
        }
    }

    fn is_shutdown(event: &Result<PlatformEvent, RecvError>) -> bool {
        matches!(
            event,
            Ok(PlatformEvent::Shutdown) | Err(RecvError::Closed)
        )
    }

    pub async fn run(mut self) -> ApiResult<()> {
        let mut events = self.bus.subscribe();

        let mut ws_tick = interval(Self::RECONNECT_INTERVAL);
        ws_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if let Some(ws) = &mut self.ws {
                tokio::select! {
                    _ = ws_tick.tick() => {}
                    ev = events.recv() => {
                        if Self::is_shutdown(&ev) {
                            break;
                        }
                    }
                    ev = ws.next_event() => {
                        self.handle_ws_event(ev);
                    }
                }
            } else {
                tokio::select! {
                    _ = ws_tick.tick() => {
                        self.ensure_ws_connected().await;
                    }
                    ev = events.recv() => {
                        if Self::is_shutdown(&ev) {
                            break;
                        }
                    }
                }
            }
        }

        log::info!("[{}] Home Assistant backend stopped", self.name);

        Ok(())
    }
}
