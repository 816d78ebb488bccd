use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const STATE_ON: &str = "on";
pub const STATE_OFF: &str = "off";
pub const ATTR_BRIGHTNESS: &str = "brightness";
pub const LIGHT_DOMAIN: &str = "light";
pub const SCENE_DOMAIN: &str = "scene";

/// Desired state of a single entity: state token plus attributes.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityTarget {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl EntityTarget {
    #[must_use]
    pub fn new(entity_id: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            state: state.into(),
            attributes: Map::new(),
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn off(entity_id: impl Into<String>) -> Self {
        Self::new(entity_id, STATE_OFF)
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        entity_domain(&self.entity_id)
    }

    #[must_use]
    pub fn is_light(&self) -> bool {
        self.domain() == LIGHT_DOMAIN
    }

    #[must_use]
    pub fn is_on(&self) -> bool {
        self.state == STATE_ON
    }

    /// Declared brightness, if the attribute holds a number in 0..=255.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn brightness(&self) -> Option<u8> {
        let value = self.attributes.get(ATTR_BRIGHTNESS)?;
        value
            .as_u64()
            .or_else(|| value.as_f64().filter(|x| *x >= 0.0).map(|x| x.round() as u64))
            .and_then(|x| u8::try_from(x).ok())
    }

    #[must_use]
    pub fn with_brightness(mut self, brightness: u8) -> Self {
        self.attributes
            .insert(ATTR_BRIGHTNESS.to_string(), Value::from(brightness));
        self
    }
}

/// Declarative description of a scene, read-only once loaded.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SceneSnapshot {
    /// Entity id of the scene, e.g. `scene.movie_night`
    pub scene_id: String,
    pub name: String,
    #[serde(default)]
    pub icon: Option<String>,
    /// Member target states, in declaration order
    #[serde(default)]
    pub members: Vec<EntityTarget>,
}

impl SceneSnapshot {
    #[must_use]
    pub fn new(scene_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scene_id: scene_id.into(),
            name: name.into(),
            icon: None,
            members: vec![],
        }
    }

    #[must_use]
    pub fn with_member(mut self, target: EntityTarget) -> Self {
        self.members.push(target);
        self
    }

    #[must_use]
    pub fn object_id(&self) -> &str {
        self.scene_id
            .split_once('.')
            .map_or(self.scene_id.as_str(), |(_, obj)| obj)
    }

    pub fn member_ids(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|m| m.entity_id.as_str())
    }
}

#[must_use]
pub fn entity_domain(entity_id: &str) -> &str {
    entity_id.split_once('.').map_or("", |(domain, _)| domain)
}
