use std::fs::File;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use serde::Deserialize;
use serde_json::{Map, Value};

use lightscene_api::scene::{EntityTarget, SCENE_DOMAIN, STATE_OFF, STATE_ON, SceneSnapshot};

use crate::error::ApiResult;
use crate::scene::SceneSource;

/// Scene definition as stored by Home Assistant, both in `scenes.yaml` and
/// in the scene config api.
#[derive(Clone, Debug, Deserialize)]
pub struct SceneDefinition {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub entities: Map<String, Value>,
}

impl SceneDefinition {
    /// Entity id Home Assistant derives from the scene name.
    #[must_use]
    pub fn default_entity_id(&self) -> String {
        format!("{SCENE_DOMAIN}.{}", slugify(&self.name))
    }

    #[must_use]
    pub fn into_snapshot(self, scene_id: String) -> SceneSnapshot {
        let members = self
            .entities
            .iter()
            .filter_map(|(entity_id, value)| {
                let target = parse_target(entity_id, value);
                if target.is_none() {
                    log::warn!("[{scene_id}] Skipping {entity_id}: unsupported declaration {value}");
                }
                target
            })
            .collect();

        SceneSnapshot {
            scene_id,
            name: self.name,
            icon: self.icon,
            members,
        }
    }
}

fn state_token(value: &Value) -> Option<String> {
    match value {
        Value::String(state) => Some(state.clone()),
        Value::Bool(true) => Some(STATE_ON.to_string()),
        Value::Bool(false) => Some(STATE_OFF.to_string()),
        _ => None,
    }
}

/// Parse a member declaration: either a bare state token, or a mapping
/// holding `state` plus attributes.
#[must_use]
pub fn parse_target(entity_id: &str, value: &Value) -> Option<EntityTarget> {
    if let Some(state) = state_token(value) {
        return Some(EntityTarget::new(entity_id, state));
    }

    let mut attributes = value.as_object()?.clone();
    let state = state_token(&attributes.remove("state")?)?;

    Some(EntityTarget {
        entity_id: entity_id.to_string(),
        state,
        attributes,
    })
}

/// Object id the way Home Assistant slugifies entity names.
#[must_use]
pub fn slugify(name: &str) -> String {
    let mut out = String::new();
    let mut last_underscore = false;
    for ch in name.chars() {
        let low = ch.to_ascii_lowercase();
        if low.is_ascii_alphanumeric() {
            out.push(low);
            last_underscore = false;
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
    }
    let out = out.trim_matches('_');
    if out.is_empty() {
        "unknown".to_string()
    } else {
        out.to_string()
    }
}

/// Reads scene definitions from a Home Assistant `scenes.yaml` file.
pub struct YamlSceneSource {
    file: Utf8PathBuf,
}

impl YamlSceneSource {
    #[must_use]
    pub const fn new(file: Utf8PathBuf) -> Self {
        Self { file }
    }

    pub fn parse(yaml: &str) -> ApiResult<Vec<SceneSnapshot>> {
        let defs: Option<Vec<SceneDefinition>> = serde_yml::from_str(yaml)?;

        Ok(defs
            .unwrap_or_default()
            .into_iter()
            .map(|def| {
                let scene_id = def.default_entity_id();
                def.into_snapshot(scene_id)
            })
            .collect())
    }
}

#[async_trait]
impl SceneSource for YamlSceneSource {
    async fn discover(&self) -> ApiResult<Vec<SceneSnapshot>> {
        log::debug!("Reading scenes from {}", self.file);
        let fd = File::open(&self.file)?;
        let yaml = std::io::read_to_string(fd)?;
        Self::parse(&yaml)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use lightscene_api::scene::EntityTarget;

    use crate::scene::source::{YamlSceneSource, parse_target, slugify};

    #[test]
    fn slugify_names() {
        assert_eq!(slugify("Movie Night"), "movie_night");
        assert_eq!(slugify("  Kids' room -- dim "), "kids_room_dim");
        assert_eq!(slugify("???"), "unknown");
    }

    #[test]
    fn parse_bare_and_mapped_targets() {
        assert_eq!(
            parse_target("switch.fan", &json!("on")),
            Some(EntityTarget::new("switch.fan", "on"))
        );
        assert_eq!(
            parse_target("switch.fan", &json!(false)),
            Some(EntityTarget::off("switch.fan"))
        );
        assert_eq!(
            parse_target("light.a", &json!({"state": "on", "brightness": 120})),
            Some(EntityTarget::new("light.a", "on").with_brightness(120))
        );
        assert_eq!(parse_target("light.a", &json!({"brightness": 120})), None);
        assert_eq!(parse_target("light.a", &json!(12)), None);
    }

    #[test]
    fn parse_scenes_yaml() {
        let yaml = r#"
- id: "1700000000001"
  name: Movie Night
  icon: mdi:movie
  entities:
    light.tv_backlight:
      state: "on"
      brightness: 80
      color_mode: xy
      xy_color: [0.3, 0.3]
    light.ceiling: "off"
    media_player.tv:
      state: playing
- name: Empty
"#;

        let scenes = YamlSceneSource::parse(yaml).unwrap();
        assert_eq!(scenes.len(), 2);

        let movie = &scenes[0];
        assert_eq!(movie.scene_id, "scene.movie_night");
        assert_eq!(movie.icon.as_deref(), Some("mdi:movie"));
        assert_eq!(
            movie.member_ids().collect::<Vec<_>>(),
            vec!["light.tv_backlight", "light.ceiling", "media_player.tv"]
        );
        assert_eq!(movie.members[0].brightness(), Some(80));
        assert!(!movie.members[0].attributes.contains_key("state"));
        assert_eq!(movie.members[1], EntityTarget::off("light.ceiling"));
        assert_eq!(movie.members[2].state, "playing");

        assert_eq!(scenes[1].scene_id, "scene.empty");
        assert!(scenes[1].members.is_empty());
    }

    #[test]
    fn empty_file_has_no_scenes() {
        assert!(YamlSceneSource::parse("").unwrap().is_empty());
    }
}
