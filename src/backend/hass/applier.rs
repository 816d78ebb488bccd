use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{Map, Value};

use lightscene_api::context::{Context, ContextId};
use lightscene_api::scene::{ATTR_BRIGHTNESS, EntityTarget, LIGHT_DOMAIN, STATE_OFF, STATE_ON};

use crate::backend::hass::client::{HassClient, HassState};
use crate::error::ApiResult;
use crate::scene::StateApplier;
use crate::scene::causation::ContextStamps;

const ATTR_COLOR_MODE: &str = "color_mode";
const ATTR_COLOR_TEMP: &str = "color_temp";
const ATTR_COLOR_TEMP_KELVIN: &str = "color_temp_kelvin";
const ATTR_EFFECT: &str = "effect";

const COLOR_ATTRS: &[(&str, &str)] = &[
    ("color_temp", ATTR_COLOR_TEMP_KELVIN),
    ("hs", "hs_color"),
    ("xy", "xy_color"),
    ("rgb", "rgb_color"),
    ("rgbw", "rgbw_color"),
    ("rgbww", "rgbww_color"),
];

const STATE_OPEN: &str = "open";
const STATE_CLOSED: &str = "closed";

#[derive(Clone, Debug, PartialEq)]
pub struct ServiceCall {
    pub domain: &'static str,
    pub service: &'static str,
    pub data: Map<String, Value>,
}

impl ServiceCall {
    fn new(domain: &'static str, service: &'static str, entity_id: &str) -> Self {
        let mut data = Map::new();
        data.insert("entity_id".to_string(), Value::from(entity_id));
        Self {
            domain,
            service,
            data,
        }
    }

    fn with(mut self, key: &str, value: Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn color_temp_kelvin(attributes: &Map<String, Value>) -> Option<Value> {
    if let Some(kelvin) = attributes.get(ATTR_COLOR_TEMP_KELVIN) {
        return Some(kelvin.clone());
    }
    let mireds = attributes.get(ATTR_COLOR_TEMP)?.as_f64().filter(|m| *m > 0.0)?;
    Some(Value::from((1_000_000.0 / mireds).round() as u64))
}

/// Color attribute to send along with `light.turn_on`. When the target
/// declares a color mode, only the attribute of that mode is used.
fn light_color(attributes: &Map<String, Value>) -> Option<(&'static str, Value)> {
    let mode = attributes.get(ATTR_COLOR_MODE).and_then(Value::as_str);

    COLOR_ATTRS
        .iter()
        .filter(|(color_mode, _)| mode.is_none_or(|m| m == *color_mode))
        .find_map(|(_, attr)| {
            let value = if *attr == ATTR_COLOR_TEMP_KELVIN {
                color_temp_kelvin(attributes)
            } else {
                attributes.get(*attr).cloned()
            };
            value.map(|v| (*attr, v))
        })
}

/// Map a target state onto the service call reproducing it.
#[must_use]
pub fn service_call(target: &EntityTarget) -> Option<ServiceCall> {
    let entity_id = target.entity_id.as_str();

    if target.is_light() {
        if target.state == STATE_OFF {
            return Some(ServiceCall::new(LIGHT_DOMAIN, "turn_off", entity_id));
        }
        if target.state != STATE_ON {
            return None;
        }

        let mut call = ServiceCall::new(LIGHT_DOMAIN, "turn_on", entity_id);
        if let Some(bri) = target.brightness() {
            call = call.with(ATTR_BRIGHTNESS, Value::from(bri));
        }
        if let Some((attr, value)) = light_color(&target.attributes) {
            call = call.with(attr, value);
        }
        if let Some(effect) = target.attributes.get(ATTR_EFFECT) {
            call = call.with(ATTR_EFFECT, effect.clone());
        }
        return Some(call);
    }

    match target.state.as_str() {
        STATE_ON => Some(ServiceCall::new("homeassistant", "turn_on", entity_id)),
        STATE_OFF => Some(ServiceCall::new("homeassistant", "turn_off", entity_id)),
        STATE_OPEN if target.domain() == "cover" => {
            Some(ServiceCall::new("cover", "open_cover", entity_id))
        }
        STATE_CLOSED if target.domain() == "cover" => {
            Some(ServiceCall::new("cover", "close_cover", entity_id))
        }
        _ => None,
    }
}

/// Report the contexts Home Assistant attached to states changed by a call.
fn record_contexts(states: Vec<HassState>, stamps: &ContextStamps) {
    for ctx in states.into_iter().filter_map(|st| st.context) {
        stamps.record(ContextId::new(ctx.id));
    }
}

/// Reproduces target states through Home Assistant service calls.
///
/// The REST service api cannot carry a caller context, so the minted context
/// is only logged. Self-caused changes are recognized by the context ids
/// Home Assistant returns with the changed states.
pub struct HassApplier {
    client: Arc<HassClient>,
}

impl HassApplier {
    #[must_use]
    pub const fn new(client: Arc<HassClient>) -> Self {
        Self { client }
    }

    async fn apply(&self, target: &EntityTarget, stamps: &ContextStamps) {
        let name = self.client.backend_name();

        let Some(call) = service_call(target) else {
            log::warn!(
                "[{name}] Cannot reproduce state {:?} for {}",
                target.state,
                target.entity_id
            );
            return;
        };

        match self
            .client
            .call_service(call.domain, call.service, call.data)
            .await
        {
            Ok(states) => record_contexts(states, stamps),
            Err(err) => {
                log::warn!("[{name}] Failed to reproduce {}: {err}", target.entity_id);
            }
        }
    }
}

#[async_trait]
impl StateApplier for HassApplier {
    async fn reproduce(
        &self,
        targets: &[EntityTarget],
        context: &Context,
        stamps: &ContextStamps,
    ) -> ApiResult<()> {
        log::debug!(
            "[{}] Reproducing {} states (context {})",
            self.client.backend_name(),
            targets.len(),
            context.id
        );

        join_all(targets.iter().map(|target| self.apply(target, stamps))).await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use lightscene_api::context::ContextId;
    use lightscene_api::scene::EntityTarget;

    use crate::backend::hass::applier::{ServiceCall, record_contexts, service_call};
    use crate::backend::hass::client::HassState;
    use crate::scene::causation::{CausationTracker, ContextStamps};

    fn data(call: &ServiceCall) -> serde_json::Value {
        serde_json::Value::Object(call.data.clone())
    }

    #[test]
    fn light_on_with_color_mode() {
        let target = EntityTarget::new("light.a", "on")
            .with_brightness(50)
            .with_attribute("color_mode", "xy")
            .with_attribute("xy_color", json!([0.3, 0.4]))
            .with_attribute("hs_color", json!([30, 100]))
            .with_attribute("friendly_name", "Lamp");

        let call = service_call(&target).unwrap();
        assert_eq!((call.domain, call.service), ("light", "turn_on"));
        assert_eq!(
            data(&call),
            json!({"entity_id": "light.a", "brightness": 50, "xy_color": [0.3, 0.4]})
        );
    }

    #[test]
    fn light_color_temp_from_mireds() {
        let target = EntityTarget::new("light.a", "on")
            .with_attribute("color_mode", "color_temp")
            .with_attribute("color_temp", 250);

        let call = service_call(&target).unwrap();
        assert_eq!(
            data(&call),
            json!({"entity_id": "light.a", "color_temp_kelvin": 4000})
        );
    }

    #[test]
    fn light_without_color_mode_uses_first_color() {
        let target =
            EntityTarget::new("light.a", "on").with_attribute("rgb_color", json!([255, 0, 0]));

        let call = service_call(&target).unwrap();
        assert_eq!(
            data(&call),
            json!({"entity_id": "light.a", "rgb_color": [255, 0, 0]})
        );
    }

    #[test]
    fn other_domains() {
        let off = service_call(&EntityTarget::off("light.a")).unwrap();
        assert_eq!((off.domain, off.service), ("light", "turn_off"));

        let fan = service_call(&EntityTarget::new("switch.fan", "on")).unwrap();
        assert_eq!((fan.domain, fan.service), ("homeassistant", "turn_on"));

        let cover = service_call(&EntityTarget::new("cover.blinds", "closed")).unwrap();
        assert_eq!((cover.domain, cover.service), ("cover", "close_cover"));

        assert!(service_call(&EntityTarget::new("media_player.tv", "playing")).is_none());
        assert!(service_call(&EntityTarget::new("light.a", "unavailable")).is_none());
    }

    #[test]
    fn returned_state_contexts_become_stamps() {
        let states: Vec<HassState> = serde_json::from_value(json!([
            {"entity_id": "light.tv", "state": "on", "context": {"id": "ctx-1", "parent_id": null}},
            {"entity_id": "light.desk", "state": "on", "context": {"id": "ctx-2"}},
            {"entity_id": "switch.fan", "state": "on"},
        ]))
        .unwrap();

        let (stamps, mut inbox) = ContextStamps::channel();
        let mut tracker = CausationTracker::new();
        record_contexts(states, &stamps);
        inbox.drain_into(&mut tracker);

        assert_eq!(tracker.known_count(), 2);
        assert!(!tracker.is_external(&ContextId::new("ctx-1")));
        assert!(!tracker.is_external(&ContextId::new("ctx-2")));
    }
}
