use std::collections::BTreeMap;

use lightscene_api::scene::{EntityTarget, SceneSnapshot};

/// Baseline used when no member light contributes a positive brightness.
pub const DEFAULT_BASELINE_BRIGHTNESS: u8 = 255;

/// Brightness reference for a scene, and proportional rescaling of its
/// member lights.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrightnessScaler {
    baseline: u8,
    supports_brightness: bool,
    per_entity: BTreeMap<String, u8>,
}

impl BrightnessScaler {
    /// Compute the per-member baselines and the scene baseline.
    ///
    /// A member light declared "on" contributes its declared brightness, or
    /// full brightness when it declares none. Lights declared in any other
    /// state contribute 0 and are never scaled. The scene baseline is the
    /// floor-average of all positive contributions.
    #[must_use]
    pub fn initialize(snapshot: &SceneSnapshot) -> Self {
        let per_entity: BTreeMap<String, u8> = snapshot
            .members
            .iter()
            .filter(|member| member.is_light())
            .map(|member| {
                let bri = if member.is_on() {
                    member.brightness().unwrap_or(u8::MAX)
                } else {
                    0
                };
                (member.entity_id.clone(), bri)
            })
            .collect();

        let positive: Vec<u32> = per_entity
            .values()
            .filter(|bri| **bri > 0)
            .map(|bri| u32::from(*bri))
            .collect();

        let average = u32::try_from(positive.len())
            .ok()
            .filter(|count| *count > 0)
            .and_then(|count| u8::try_from(positive.iter().sum::<u32>() / count).ok());

        match average {
            Some(baseline) => Self {
                baseline,
                supports_brightness: true,
                per_entity,
            },
            None => Self {
                baseline: DEFAULT_BASELINE_BRIGHTNESS,
                supports_brightness: false,
                per_entity,
            },
        }
    }

    #[must_use]
    pub const fn baseline(&self) -> u8 {
        self.baseline
    }

    #[must_use]
    pub const fn supports_brightness(&self) -> bool {
        self.supports_brightness
    }

    #[must_use]
    pub fn member_baseline(&self, entity_id: &str) -> Option<u8> {
        self.per_entity.get(entity_id).copied()
    }

    /// Scaled brightness for every member light with a positive baseline.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn scale(&self, requested: u8) -> BTreeMap<String, u8> {
        let factor = f64::from(requested) / f64::from(self.baseline);

        self.per_entity
            .iter()
            .filter(|(_, bri)| **bri > 0)
            .map(|(id, bri)| {
                let scaled = (f64::from(*bri) * factor).round().clamp(1.0, 255.0);
                (id.clone(), scaled as u8)
            })
            .collect()
    }

    /// Target states for turning the scene on.
    ///
    /// Without brightness support, or without a requested brightness, these
    /// are the literal declared states.
    #[must_use]
    pub fn targets(&self, snapshot: &SceneSnapshot, requested: Option<u8>) -> Vec<EntityTarget> {
        let scaled = match requested {
            Some(bri) if self.supports_brightness => self.scale(bri),
            _ => BTreeMap::new(),
        };

        snapshot
            .members
            .iter()
            .map(|member| match scaled.get(&member.entity_id) {
                Some(bri) => member.clone().with_brightness(*bri),
                None => member.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use lightscene_api::scene::{EntityTarget, SceneSnapshot};
    use maplit::btreemap;

    use crate::scene::scaler::{BrightnessScaler, DEFAULT_BASELINE_BRIGHTNESS};

    fn light(id: &str, bri: u8) -> EntityTarget {
        EntityTarget::new(id, "on").with_brightness(bri)
    }

    fn two_lights() -> SceneSnapshot {
        SceneSnapshot::new("scene.evening", "Evening")
            .with_member(light("light.a", 100))
            .with_member(light("light.b", 200))
    }

    #[test]
    fn baseline_is_floor_average_of_on_lights() {
        let scene = SceneSnapshot::new("scene.x", "X")
            .with_member(light("light.a", 100))
            .with_member(light("light.b", 101))
            .with_member(EntityTarget::off("light.c").with_brightness(250))
            .with_member(EntityTarget::new("switch.fan", "on").with_brightness(10));

        let scaler = BrightnessScaler::initialize(&scene);

        assert!(scaler.supports_brightness());
        assert_eq!(scaler.baseline(), 100);
        assert_eq!(scaler.member_baseline("light.c"), Some(0));
        assert_eq!(scaler.member_baseline("switch.fan"), None);
    }

    #[test]
    fn on_light_without_brightness_counts_as_full() {
        let scene = SceneSnapshot::new("scene.x", "X")
            .with_member(EntityTarget::new("light.a", "on"))
            .with_member(light("light.b", 55));

        let scaler = BrightnessScaler::initialize(&scene);

        assert!(scaler.supports_brightness());
        assert_eq!(scaler.member_baseline("light.a"), Some(255));
        assert_eq!(scaler.baseline(), 155);
    }

    #[test]
    fn scene_without_on_lights_falls_back_to_default() {
        let scene = SceneSnapshot::new("scene.x", "X")
            .with_member(light("light.a", 0))
            .with_member(EntityTarget::off("light.b"))
            .with_member(EntityTarget::new("switch.fan", "on"));

        let scaler = BrightnessScaler::initialize(&scene);

        assert!(!scaler.supports_brightness());
        assert_eq!(scaler.baseline(), DEFAULT_BASELINE_BRIGHTNESS);
    }

    #[test]
    fn scale_halves_two_lights() {
        let scaler = BrightnessScaler::initialize(&two_lights());

        assert_eq!(scaler.baseline(), 150);
        assert_eq!(
            scaler.scale(75),
            btreemap! {"light.a".to_string() => 50, "light.b".to_string() => 100}
        );
    }

    #[test]
    fn scale_never_reaches_zero() {
        let scene = SceneSnapshot::new("scene.x", "X")
            .with_member(light("light.dim", 3))
            .with_member(light("light.bright", 255));

        let scaler = BrightnessScaler::initialize(&scene);

        assert!(scaler.scale(1).values().all(|bri| *bri >= 1));
    }

    #[test]
    fn full_request_on_full_baseline_is_identity() {
        let scene = SceneSnapshot::new("scene.x", "X")
            .with_member(EntityTarget::new("light.a", "on"))
            .with_member(light("light.b", 255));

        let scaler = BrightnessScaler::initialize(&scene);
        assert_eq!(scaler.baseline(), 255);

        let targets = scaler.targets(&scene, Some(255));
        assert_eq!(targets[0].brightness(), Some(255));
        assert_eq!(targets[1], scene.members[1]);
    }

    #[test]
    fn scale_clamps_to_full_brightness() {
        let scaler = BrightnessScaler::initialize(&two_lights());

        assert_eq!(
            scaler.scale(255),
            btreemap! {"light.a".to_string() => 170, "light.b".to_string() => 255}
        );
    }

    #[test]
    fn targets_leave_other_members_untouched() {
        let scene = two_lights()
            .with_member(EntityTarget::off("light.c"))
            .with_member(EntityTarget::new("media_player.tv", "playing").with_attribute("source", "hdmi"));

        let scaler = BrightnessScaler::initialize(&scene);
        let targets = scaler.targets(&scene, Some(75));

        assert_eq!(targets.len(), 4);
        assert_eq!(targets[0].brightness(), Some(50));
        assert_eq!(targets[1].brightness(), Some(100));
        assert_eq!(targets[2], scene.members[2]);
        assert_eq!(targets[3], scene.members[3]);
    }

    #[test]
    fn targets_are_literal_without_brightness_support() {
        let scene = SceneSnapshot::new("scene.x", "X")
            .with_member(EntityTarget::new("switch.fan", "on"))
            .with_member(EntityTarget::off("light.b"));

        let scaler = BrightnessScaler::initialize(&scene);

        assert_eq!(scaler.targets(&scene, Some(10)), scene.members);
    }
}
