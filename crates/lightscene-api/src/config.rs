use std::collections::BTreeSet;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct HassServer {
    pub url: Url,
    pub token_env: Option<String>,
}

/// Include/exclude filter over scene member entities.
///
/// Members rejected by the filter are neither watched for external changes
/// nor driven by the "off" reproduction.
#[derive(Clone, Debug, Serialize, Deserialize, Default, Eq, PartialEq)]
pub struct EntityFilter {
    #[serde(default)]
    pub include_domains: BTreeSet<String>,
    #[serde(default)]
    pub include_entities: BTreeSet<String>,
    #[serde(default)]
    pub exclude_domains: BTreeSet<String>,
    #[serde(default)]
    pub exclude_entities: BTreeSet<String>,
}

impl EntityFilter {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.include_domains.is_empty()
            && self.include_entities.is_empty()
            && self.exclude_domains.is_empty()
            && self.exclude_entities.is_empty()
    }

    #[must_use]
    pub fn matches(&self, entity_id: &str) -> bool {
        if self.exclude_entities.contains(entity_id) {
            return false;
        }
        if self.include_entities.contains(entity_id) {
            return true;
        }

        let domain = entity_id.split_once('.').map_or(entity_id, |(d, _)| d);
        if self.exclude_domains.contains(domain) {
            return false;
        }

        self.include_domains.is_empty() || self.include_domains.contains(domain)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct LightSceneConfig {
    #[serde(default = "LightSceneConfig::default_reproduce_timeout")]
    pub reproduce_timeout_secs: u64,
    #[serde(default = "LightSceneConfig::default_reload_delay")]
    pub reload_delay_secs: u64,
    #[serde(default)]
    pub disabled_scenes: BTreeSet<String>,
    #[serde(default)]
    pub scenes_file: Option<Utf8PathBuf>,
    #[serde(default)]
    pub filter: EntityFilter,
}

impl Default for LightSceneConfig {
    fn default() -> Self {
        Self {
            reproduce_timeout_secs: Self::default_reproduce_timeout(),
            reload_delay_secs: Self::default_reload_delay(),
            disabled_scenes: BTreeSet::new(),
            scenes_file: None,
            filter: EntityFilter::default(),
        }
    }
}

impl LightSceneConfig {
    pub const DEFAULT_REPRODUCE_TIMEOUT_SECS: u64 = 60;
    pub const DEFAULT_RELOAD_DELAY_SECS: u64 = 5;

    const fn default_reproduce_timeout() -> u64 {
        Self::DEFAULT_REPRODUCE_TIMEOUT_SECS
    }

    const fn default_reload_delay() -> u64 {
        Self::DEFAULT_RELOAD_DELAY_SECS
    }

    #[must_use]
    pub const fn reproduce_timeout(&self) -> Duration {
        Duration::from_secs(self.reproduce_timeout_secs)
    }

    #[must_use]
    pub const fn reload_delay(&self) -> Duration {
        Duration::from_secs(self.reload_delay_secs)
    }

    #[must_use]
    pub fn is_disabled(&self, scene_id: &str) -> bool {
        self.disabled_scenes.contains(scene_id)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    pub hass: HassServer,
    #[serde(default)]
    pub lightscene: LightSceneConfig,
}

impl HassServer {
    pub const DEFAULT_TOKEN_ENV: &'static str = "HASS_TOKEN";

    #[must_use]
    pub fn token_env_name(&self) -> &str {
        self.token_env.as_deref().unwrap_or(Self::DEFAULT_TOKEN_ENV)
    }
}

#[cfg(test)]
mod tests {
    use maplit::btreeset;

    use crate::config::{EntityFilter, LightSceneConfig};

    #[test]
    fn empty_filter_matches_everything() {
        let filter = EntityFilter::default();
        assert!(filter.is_empty());
        assert!(filter.matches("light.kitchen"));
        assert!(filter.matches("switch.fan"));
    }

    #[test]
    fn exclusions_win_over_inclusions() {
        let filter = EntityFilter {
            include_domains: btreeset! {"light".to_string()},
            include_entities: btreeset! {"switch.fan".to_string()},
            exclude_entities: btreeset! {"light.porch".to_string()},
            ..EntityFilter::default()
        };

        assert!(filter.matches("light.kitchen"));
        assert!(filter.matches("switch.fan"));
        assert!(!filter.matches("light.porch"));
        assert!(!filter.matches("switch.heater"));
    }

    #[test]
    fn excluded_domain_rejects_members() {
        let filter = EntityFilter {
            exclude_domains: btreeset! {"media_player".to_string()},
            ..EntityFilter::default()
        };

        assert!(!filter.matches("media_player.tv"));
        assert!(filter.matches("light.tv_backlight"));
    }

    #[test]
    fn lightscene_config_defaults() {
        let conf: LightSceneConfig = serde_yml::from_str("disabled_scenes: [scene.night]").unwrap();

        assert_eq!(conf.reproduce_timeout().as_secs(), 60);
        assert_eq!(conf.reload_delay().as_secs(), 5);
        assert!(conf.is_disabled("scene.night"));
        assert!(!conf.is_disabled("scene.day"));
        assert!(conf.filter.is_empty());
    }
}
