use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

use lightscene_api::config::{EntityFilter, LightSceneConfig};
use lightscene_api::context::ContextId;
use lightscene_api::scene::{EntityTarget, SceneSnapshot};

use crate::error::ApiResult;
use crate::scene::causation::{CausationTracker, ContextStamps, StampInbox};
use crate::scene::event::{EventBus, Subscription};
use crate::scene::reproduce::{CancelReason, Outcome, ReproductionController, Transition};
use crate::scene::scaler::BrightnessScaler;
use crate::scene::{ColorMode, LightSceneStatus, StateApplier, StatePublisher};

struct LightSceneState {
    is_on: bool,
    brightness: u8,
    tracker: CausationTracker,
    inbox: StampInbox,
}

impl LightSceneState {
    /// Pull in stamps from earlier reproductions. Stamps left over from
    /// while the light was off belong to the "off" pass and are dropped.
    fn absorb_stamps(&mut self) {
        if self.is_on {
            self.inbox.drain_into(&mut self.tracker);
        } else {
            self.inbox.discard();
        }
    }
}

/// A dimmable light projected from a scene.
///
/// Turning it on reproduces the scene (scaled to the requested brightness),
/// turning it off drives every member to "off". Any member change that the
/// light did not cause itself turns it off, since the scene no longer
/// describes reality.
pub struct LightScene {
    snapshot: Arc<SceneSnapshot>,
    filter: EntityFilter,
    scaler: BrightnessScaler,
    controller: ReproductionController,
    publisher: Arc<dyn StatePublisher>,
    stamps: ContextStamps,
    state: Mutex<LightSceneState>,
    listeners: Mutex<Vec<Subscription>>,
    removed: AtomicBool,
}

impl LightScene {
    #[must_use]
    pub fn new(
        snapshot: Arc<SceneSnapshot>,
        config: &LightSceneConfig,
        applier: Arc<dyn StateApplier>,
        publisher: Arc<dyn StatePublisher>,
    ) -> Self {
        let scaler = BrightnessScaler::initialize(&snapshot);
        let controller =
            ReproductionController::new(&snapshot.name, applier, config.reproduce_timeout());
        let (stamps, inbox) = ContextStamps::channel();

        let state = LightSceneState {
            is_on: false,
            brightness: scaler.baseline(),
            tracker: CausationTracker::new(),
            inbox,
        };

        Self {
            snapshot,
            filter: config.filter.clone(),
            scaler,
            controller,
            publisher,
            stamps,
            state: Mutex::new(state),
            listeners: Mutex::new(vec![]),
            removed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.snapshot.name
    }

    #[must_use]
    pub fn scene_id(&self) -> &str {
        &self.snapshot.scene_id
    }

    #[must_use]
    pub fn unique_id(&self) -> String {
        format!("{}_light_scene", self.snapshot.scene_id)
    }

    #[must_use]
    pub fn entity_id(&self) -> String {
        format!("light.{}_light_scene", self.snapshot.object_id())
    }

    #[must_use]
    pub const fn supports_brightness(&self) -> bool {
        self.scaler.supports_brightness()
    }

    #[must_use]
    pub const fn baseline_brightness(&self) -> u8 {
        self.scaler.baseline()
    }

    #[must_use]
    pub const fn color_mode(&self) -> ColorMode {
        if self.supports_brightness() {
            ColorMode::Brightness
        } else {
            ColorMode::Onoff
        }
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.controller.is_busy()
    }

    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub async fn is_on(&self) -> bool {
        self.state.lock().await.is_on
    }

    pub async fn brightness(&self) -> Option<u8> {
        let state = self.state.lock().await;
        self.visible_brightness(&state)
    }

    pub async fn status(&self) -> LightSceneStatus {
        let state = self.state.lock().await;
        self.status_of(&state)
    }

    /// Wait for the current reproduction, if any, to finish.
    pub async fn settled(&self) -> ApiResult<Option<Outcome>> {
        self.controller.settled().await
    }

    fn visible_brightness(&self, state: &LightSceneState) -> Option<u8> {
        (state.is_on && self.supports_brightness()).then_some(state.brightness)
    }

    fn status_of(&self, state: &LightSceneState) -> LightSceneStatus {
        LightSceneStatus {
            entity_id: self.entity_id(),
            unique_id: self.unique_id(),
            name: self.snapshot.name.clone(),
            icon: self.snapshot.icon.clone(),
            is_on: state.is_on,
            brightness: self.visible_brightness(state),
            color_mode: self.color_mode(),
            supported_color_modes: vec![self.color_mode()],
            members: self.snapshot.member_ids().map(ToString::to_string).collect(),
        }
    }

    /// Publish while holding the state lock, so the platform sees states in
    /// the order they were set.
    async fn publish(&self, state: &MutexGuard<'_, LightSceneState>) {
        let status = self.status_of(state);
        if let Err(err) = self.publisher.publish(&status).await {
            log::warn!("[{}] Failed to publish state: {err}", self.name());
        }
    }

    fn watched_members(&self) -> BTreeSet<String> {
        self.snapshot
            .member_ids()
            .filter(|id| self.filter.matches(id))
            .map(ToString::to_string)
            .collect()
    }

    fn off_targets(&self) -> Vec<EntityTarget> {
        self.snapshot
            .member_ids()
            .filter(|id| self.filter.matches(id))
            .map(EntityTarget::off)
            .collect()
    }

    /// Attach member listeners and publish the initial state.
    pub async fn added(self: &Arc<Self>, bus: &EventBus) {
        log::debug!("[{}] Added as {}", self.name(), self.entity_id());

        let members = self.watched_members();
        if !self.filter.is_empty() {
            log::debug!(
                "[{}] Watching {} of {} members",
                self.name(),
                members.len(),
                self.snapshot.members.len()
            );
        }
        if !members.is_empty() {
            let weak = Arc::downgrade(self);
            let sub = bus.track_state_changes(members, move |entity_id, context| {
                let weak = weak.clone();
                async move {
                    if let Some(lightscene) = weak.upgrade() {
                        lightscene
                            .process_external_state_change(&entity_id, &context)
                            .await;
                    }
                }
            });
            self.listeners.lock().await.push(sub);
        }

        let state = self.state.lock().await;
        self.publish(&state).await;
    }

    /// Release listeners and stop any in-flight reproduction. Every later
    /// call on this scene-light is a no-op.
    pub async fn removed(&self) {
        if self.removed.swap(true, Ordering::AcqRel) {
            return;
        }

        // every call re-checks the flag under the state lock, so once the
        // lock has been taken here nothing can publish anymore
        drop(self.state.lock().await);

        log::debug!("[{}] Removed", self.name());
        self.listeners.lock().await.clear();
        self.controller.cancel(CancelReason::Caller).await;
    }

    pub async fn turn_on(&self, brightness: Option<u8>) -> ApiResult<()> {
        if self.is_removed() {
            log::debug!("[{}] Ignoring turn on, scene light removed", self.name());
            return Ok(());
        }

        let slot = self.controller.acquire().await;

        let mut state = self.state.lock().await;
        if self.is_removed() {
            log::debug!("[{}] Dropping turn on, removed while waiting", self.name());
            return Ok(());
        }
        state.absorb_stamps();

        let context = state.tracker.mint();
        state.tracker.activate(context.id.clone());

        let requested = if self.supports_brightness() {
            let bri = brightness.unwrap_or(state.brightness).max(1);
            state.brightness = bri;
            Some(bri)
        } else {
            None
        };
        let targets = self.scaler.targets(&self.snapshot, requested);

        state.is_on = true;
        self.publish(&state).await;
        drop(state);

        log::debug!(
            "[{}] Turned on (brightness {:?}, context {})",
            self.name(),
            requested,
            context.id
        );

        slot.start(targets, context, Transition::On, self.stamps.clone());
        Ok(())
    }

    pub async fn turn_off(&self) -> ApiResult<()> {
        if self.is_removed() {
            log::debug!("[{}] Ignoring turn off, scene light removed", self.name());
            return Ok(());
        }

        let slot = self.controller.acquire().await;

        let mut state = self.state.lock().await;
        if self.is_removed() {
            log::debug!("[{}] Dropping turn off, removed while waiting", self.name());
            return Ok(());
        }
        let context = state.tracker.mint();

        state.is_on = false;
        state.tracker.clear();
        state.inbox.discard();
        self.publish(&state).await;
        drop(state);

        log::debug!("[{}] Turned off (context {})", self.name(), context.id);

        slot.start(self.off_targets(), context, Transition::Off, self.stamps.clone());
        Ok(())
    }

    /// Handle a state change of a member entity.
    ///
    /// Returns true if the change was external and turned the light off.
    pub async fn process_external_state_change(&self, entity_id: &str, tag: &ContextId) -> bool {
        if self.is_removed() {
            return false;
        }

        let mut state = self.state.lock().await;

        if self.is_removed() || !state.is_on || self.controller.is_busy() {
            return false;
        }

        let state_ref = &mut *state;
        state_ref.inbox.drain_into(&mut state_ref.tracker);

        if !state.tracker.is_external(tag) {
            log::debug!(
                "[{}] Ignored {entity_id} change from scene activation (context {tag}, {} known)",
                self.name(),
                state.tracker.known_count()
            );
            return false;
        }

        log::info!(
            "[{}] {entity_id} changed externally (context {tag}), turning off",
            self.name()
        );

        state.is_on = false;
        state.tracker.clear();
        self.publish(&state).await;
        true
    }

    /// Handle the scene being activated by someone other than this light.
    ///
    /// The activator already reproduced the scene, so this only adopts its
    /// context and reports the light as on, at baseline brightness.
    pub async fn process_scene_activated_elsewhere(&self, tag: ContextId) {
        if self.is_removed() {
            return;
        }

        self.controller.wait_idle().await;

        let mut state = self.state.lock().await;
        if self.is_removed() {
            return;
        }
        state.absorb_stamps();
        state.tracker.activate(tag.clone());
        state.is_on = true;
        state.brightness = self.scaler.baseline();
        self.publish(&state).await;
        drop(state);

        log::debug!(
            "[{}] Processed {} activation from context '{tag}'",
            self.name(),
            self.scene_id()
        );
    }
}
