use std::collections::BTreeMap;
use std::sync::Arc;

use itertools::Itertools;
use serde_json::Value;
use tokio::sync::broadcast::Receiver;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Instant, sleep_until};

use lightscene_api::config::LightSceneConfig;
use lightscene_api::context::ContextId;
use lightscene_api::scene::{ATTR_BRIGHTNESS, LIGHT_DOMAIN, SCENE_DOMAIN};

use crate::error::ApiResult;
use crate::scene::entity::LightScene;
use crate::scene::event::{EventBus, PlatformEvent};
use crate::scene::{SceneSource, StateApplier, StatePublisher};

const ATTR_ENTITY_ID: &str = "entity_id";
const ATTR_BRIGHTNESS_PCT: &str = "brightness_pct";

const SERVICE_TURN_ON: &str = "turn_on";
const SERVICE_TURN_OFF: &str = "turn_off";
const SERVICE_TOGGLE: &str = "toggle";

/// What the event loop should do after an event was handled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ManagerAction {
    Continue,
    Reload,
    Stop,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum LightCommand {
    TurnOn(Option<u8>),
    TurnOff,
    Toggle(Option<u8>),
}

/// Owns one [`LightScene`] per discovered scene, and routes platform events
/// to them.
pub struct SceneManager {
    config: LightSceneConfig,
    source: Arc<dyn SceneSource>,
    applier: Arc<dyn StateApplier>,
    publisher: Arc<dyn StatePublisher>,
    bus: EventBus,
    events: Receiver<PlatformEvent>,
    lightscenes: BTreeMap<String, Arc<LightScene>>,
}

impl SceneManager {
    #[must_use]
    pub fn new(
        config: LightSceneConfig,
        source: Arc<dyn SceneSource>,
        applier: Arc<dyn StateApplier>,
        publisher: Arc<dyn StatePublisher>,
        bus: EventBus,
    ) -> Self {
        let events = bus.subscribe();
        Self {
            config,
            source,
            applier,
            publisher,
            bus,
            events,
            lightscenes: BTreeMap::new(),
        }
    }

    /// Scene-light for the given scene entity id
    #[must_use]
    pub fn lightscene(&self, scene_id: &str) -> Option<&Arc<LightScene>> {
        self.lightscenes.get(scene_id)
    }

    pub fn lightscenes(&self) -> impl Iterator<Item = &Arc<LightScene>> {
        self.lightscenes.values()
    }

    fn by_entity_id(&self, entity_id: &str) -> Option<&Arc<LightScene>> {
        self.lightscenes
            .values()
            .find(|ls| ls.entity_id() == entity_id)
    }

    /// Tear down every scene-light.
    pub async fn teardown(&mut self) {
        for (_, lightscene) in std::mem::take(&mut self.lightscenes) {
            lightscene.removed().await;
        }
    }

    /// Replace all scene-lights with fresh ones for the scenes currently
    /// known to the platform. Returns the number of scene-lights created.
    pub async fn discover(&mut self) -> ApiResult<usize> {
        self.teardown().await;

        let snapshots = self.source.discover().await?;

        for snapshot in snapshots {
            if self.config.is_disabled(&snapshot.scene_id) {
                log::debug!("Skipping disabled scene {}", snapshot.scene_id);
                continue;
            }

            if self.lightscenes.contains_key(&snapshot.scene_id) {
                log::warn!("Duplicate scene {}, keeping the first", snapshot.scene_id);
                continue;
            }

            let lightscene = Arc::new(LightScene::new(
                Arc::new(snapshot),
                &self.config,
                self.applier.clone(),
                self.publisher.clone(),
            ));
            lightscene.added(&self.bus).await;

            self.lightscenes
                .insert(lightscene.scene_id().to_string(), lightscene);
        }

        log::info!("Discovered {} scene lights", self.lightscenes.len());
        log::debug!("Scene lights: {}", self.lightscenes.keys().join(", "));

        Ok(self.lightscenes.len())
    }

    pub async fn handle_event(&self, event: PlatformEvent) -> ManagerAction {
        match event {
            PlatformEvent::CallService {
                domain,
                service,
                service_data,
                context,
            } => {
                if domain == SCENE_DOMAIN && service == SERVICE_TURN_ON {
                    self.route_scene_activation(&service_data, &context);
                } else if domain == LIGHT_DOMAIN {
                    self.route_light_call(&service, &service_data).await;
                }
                ManagerAction::Continue
            }
            PlatformEvent::SceneReloaded | PlatformEvent::Reconnected => ManagerAction::Reload,
            PlatformEvent::Shutdown => ManagerAction::Stop,
            // member changes are handled by the scene-light listeners
            PlatformEvent::StateChanged { .. } => ManagerAction::Continue,
        }
    }

    fn route_scene_activation(&self, service_data: &Value, context: &ContextId) {
        let Some(entity_ids) = target_entity_ids(service_data) else {
            log::warn!("Dropping malformed scene activation (context {context}): {service_data}");
            return;
        };

        for entity_id in entity_ids {
            let Some(lightscene) = self.lightscenes.get(&entity_id) else {
                continue;
            };

            let lightscene = lightscene.clone();
            let context = context.clone();
            tokio::spawn(async move {
                lightscene.process_scene_activated_elsewhere(context).await;
            });
        }
    }

    async fn route_light_call(&self, service: &str, service_data: &Value) {
        let Some(command) = light_command(service, service_data) else {
            return;
        };
        let Some(entity_ids) = target_entity_ids(service_data) else {
            return;
        };

        for entity_id in entity_ids {
            let Some(lightscene) = self.by_entity_id(&entity_id) else {
                continue;
            };

            let is_on = lightscene.is_on().await;
            let command = match command {
                LightCommand::Toggle(_) if is_on => LightCommand::TurnOff,
                LightCommand::Toggle(bri) => LightCommand::TurnOn(bri),
                cmd => cmd,
            };

            let res = match command {
                LightCommand::TurnOn(Some(0)) | LightCommand::TurnOff => {
                    lightscene.turn_off().await
                }
                LightCommand::TurnOn(bri) | LightCommand::Toggle(bri) => {
                    lightscene.turn_on(bri).await
                }
            };

            if let Err(err) = res {
                log::error!("[{}] Failed to handle light.{service}: {err}", lightscene.name());
            }
        }
    }

    /// Process events until shutdown. Reload notifications are debounced:
    /// rediscovery runs once no new notification arrived for the configured
    /// reload delay.
    pub async fn run(mut self) -> ApiResult<()> {
        let mut reload_at: Option<Instant> = None;

        loop {
            let reload = async move {
                match reload_at {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                () = reload => {
                    reload_at = None;
                    if let Err(err) = self.discover().await {
                        log::error!("Scene rediscovery failed, retrying: {err}");
                        reload_at = Some(Instant::now() + self.config.reload_delay());
                    }
                }
                event = self.events.recv() => {
                    let event = match event {
                        Ok(event) => event,
                        Err(RecvError::Lagged(count)) => {
                            log::warn!("Scene manager lagged behind, {count} events lost");
                            continue;
                        }
                        Err(RecvError::Closed) => PlatformEvent::Shutdown,
                    };

                    match self.handle_event(event).await {
                        ManagerAction::Continue => {}
                        ManagerAction::Reload => {
                            log::debug!("Scene reload requested, rediscovering in {:?}", self.config.reload_delay());
                            reload_at = Some(Instant::now() + self.config.reload_delay());
                        }
                        ManagerAction::Stop => break,
                    }
                }
            }
        }

        log::info!("Shutting down {} scene lights", self.lightscenes.len());
        self.teardown().await;

        Ok(())
    }
}

/// Entity ids targeted by a service call: a single id, a comma separated
/// list, or a list of ids.
fn target_entity_ids(service_data: &Value) -> Option<Vec<String>> {
    match service_data.get(ATTR_ENTITY_ID)? {
        Value::String(ids) => Some(
            ids.split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(ToString::to_string)
                .collect(),
        ),
        Value::Array(ids) => ids
            .iter()
            .map(|id| id.as_str().map(ToString::to_string))
            .collect(),
        _ => None,
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn requested_brightness(service_data: &Value) -> Option<u8> {
    if let Some(bri) = service_data.get(ATTR_BRIGHTNESS).and_then(Value::as_f64) {
        return Some(bri.round().clamp(0.0, 255.0) as u8);
    }

    let pct = service_data
        .get(ATTR_BRIGHTNESS_PCT)
        .and_then(Value::as_f64)?;
    Some((pct.clamp(0.0, 100.0) * 255.0 / 100.0).round() as u8)
}

fn light_command(service: &str, service_data: &Value) -> Option<LightCommand> {
    match service {
        SERVICE_TURN_ON => Some(LightCommand::TurnOn(requested_brightness(service_data))),
        SERVICE_TURN_OFF => Some(LightCommand::TurnOff),
        SERVICE_TOGGLE => Some(LightCommand::Toggle(requested_brightness(service_data))),
        _ => None,
    }
}
