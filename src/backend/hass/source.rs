use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use lightscene_api::scene::{EntityTarget, SCENE_DOMAIN, STATE_ON, SceneSnapshot, entity_domain};

use crate::backend::hass::client::{HassClient, HassState};
use crate::error::ApiResult;
use crate::scene::SceneSource;

/// Discovers scenes through the Home Assistant REST api.
///
/// Scenes created in the scene editor carry an `id` attribute, which gives
/// access to their stored member states. For every other scene only the
/// member list is known, and every member is assumed to be declared "on".
pub struct HassSceneSource {
    client: Arc<HassClient>,
}

impl HassSceneSource {
    #[must_use]
    pub const fn new(client: Arc<HassClient>) -> Self {
        Self { client }
    }

    #[must_use]
    pub fn fallback_snapshot(state: &HassState) -> SceneSnapshot {
        let attrs = &state.attributes;

        let mut snapshot = SceneSnapshot::new(
            state.entity_id.as_str(),
            attrs
                .get("friendly_name")
                .and_then(Value::as_str)
                .unwrap_or(&state.entity_id),
        );
        snapshot.icon = attrs.get("icon").and_then(Value::as_str).map(ToString::to_string);

        let members = attrs
            .get("entity_id")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str);

        for member in members {
            snapshot = snapshot.with_member(EntityTarget::new(member, STATE_ON));
        }

        snapshot
    }

    async fn snapshot(&self, state: &HassState) -> SceneSnapshot {
        let fallback = Self::fallback_snapshot(state);

        let Some(id) = state.attributes.get("id").and_then(Value::as_str) else {
            return fallback;
        };

        match self.client.get_scene_config(id).await {
            Ok(Some(def)) => {
                let mut snapshot = def.into_snapshot(state.entity_id.clone());
                snapshot.name = fallback.name;
                if snapshot.icon.is_none() {
                    snapshot.icon = fallback.icon;
                }
                snapshot
            }
            Ok(None) => fallback,
            Err(err) => {
                log::warn!(
                    "[{}] Failed to load definition of {}, assuming all members on: {err}",
                    self.client.backend_name(),
                    state.entity_id
                );
                fallback
            }
        }
    }
}

#[async_trait]
impl SceneSource for HassSceneSource {
    async fn discover(&self) -> ApiResult<Vec<SceneSnapshot>> {
        let states = self.client.get_states().await?;

        let mut res = vec![];
        for state in states
            .iter()
            .filter(|st| entity_domain(&st.entity_id) == SCENE_DOMAIN)
        {
            res.push(self.snapshot(state).await);
        }

        Ok(res)
    }
}
