pub mod causation;
pub mod entity;
pub mod event;
pub mod manager;
pub mod reproduce;
pub mod scaler;
pub mod source;

#[cfg(test)]
pub mod testutil;

use async_trait::async_trait;
use serde::Serialize;

use lightscene_api::context::Context;
use lightscene_api::scene::{EntityTarget, SceneSnapshot};

use crate::error::ApiResult;
use crate::scene::causation::ContextStamps;

/// Drives entities toward target states on the host platform.
///
/// Implementations apply every target on a best-effort basis: a failing
/// member is reported by the implementation itself and does not stop the
/// rest of the batch. Every causation context the platform attaches to the
/// resulting changes is reported through `stamps`.
#[async_trait]
pub trait StateApplier: Send + Sync {
    async fn reproduce(
        &self,
        targets: &[EntityTarget],
        context: &Context,
        stamps: &ContextStamps,
    ) -> ApiResult<()>;
}

/// Makes a scene-light's visible state known to the host platform.
#[async_trait]
pub trait StatePublisher: Send + Sync {
    async fn publish(&self, status: &LightSceneStatus) -> ApiResult<()>;
}

/// Discovers the scenes known to the host platform.
#[async_trait]
pub trait SceneSource: Send + Sync {
    async fn discover(&self) -> ApiResult<Vec<SceneSnapshot>>;
}

#[derive(Clone, Copy, Debug, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ColorMode {
    Onoff,
    Brightness,
}

/// Externally visible state of a scene-light.
#[derive(Clone, Debug, Serialize, Eq, PartialEq)]
pub struct LightSceneStatus {
    pub entity_id: String,
    pub unique_id: String,
    pub name: String,
    pub icon: Option<String>,
    pub is_on: bool,
    pub brightness: Option<u8>,
    pub color_mode: ColorMode,
    pub supported_color_modes: Vec<ColorMode>,
    pub members: Vec<String>,
}
