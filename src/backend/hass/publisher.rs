use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use lightscene_api::scene::{STATE_OFF, STATE_ON};

use crate::backend::hass::client::{HassClient, HassStateUpdate};
use crate::error::ApiResult;
use crate::scene::{LightSceneStatus, StatePublisher};

/// Writes scene-light states into the Home Assistant state machine.
pub struct HassPublisher {
    client: Arc<HassClient>,
}

impl HassPublisher {
    #[must_use]
    pub const fn new(client: Arc<HassClient>) -> Self {
        Self { client }
    }

    #[must_use]
    pub fn state_update(status: &LightSceneStatus) -> HassStateUpdate {
        let mut attributes = Map::new();
        attributes.insert("friendly_name".to_string(), Value::from(status.name.as_str()));
        if let Some(icon) = &status.icon {
            attributes.insert("icon".to_string(), Value::from(icon.as_str()));
        }
        attributes.insert(
            "supported_color_modes".to_string(),
            serde_json::to_value(&status.supported_color_modes).unwrap_or_default(),
        );

        // color mode and brightness are only reported while on
        let color_mode = if status.is_on {
            serde_json::to_value(status.color_mode).unwrap_or_default()
        } else {
            Value::Null
        };
        attributes.insert("color_mode".to_string(), color_mode);
        attributes.insert(
            "brightness".to_string(),
            status.brightness.map_or(Value::Null, Value::from),
        );
        attributes.insert("entity_id".to_string(), Value::from(status.members.clone()));

        HassStateUpdate {
            state: if status.is_on { STATE_ON } else { STATE_OFF }.to_string(),
            attributes,
        }
    }
}

#[async_trait]
impl StatePublisher for HassPublisher {
    async fn publish(&self, status: &LightSceneStatus) -> ApiResult<()> {
        log::trace!(
            "[{}] Publishing {} = {}",
            self.client.backend_name(),
            status.entity_id,
            if status.is_on { STATE_ON } else { STATE_OFF }
        );

        self.client
            .set_state(&status.entity_id, &Self::state_update(status))
            .await
    }
}
