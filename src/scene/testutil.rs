use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use lightscene_api::context::{Context, ContextId};
use lightscene_api::scene::{EntityTarget, SceneSnapshot};

use crate::error::{ApiError, ApiResult};
use crate::scene::causation::ContextStamps;
use crate::scene::{LightSceneStatus, SceneSource, StateApplier, StatePublisher};

/// Let spawned tasks run until they block.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

#[derive(Clone, Debug)]
pub struct ApplyCall {
    pub targets: Vec<EntityTarget>,
    pub context: Context,
}

/// Records reproductions. In blocking mode, each reproduction waits for a
/// permit handed out by [`FakeApplier::release`].
pub struct FakeApplier {
    permits: Semaphore,
    fail: bool,
    calls: Mutex<Vec<ApplyCall>>,
    finished: Mutex<usize>,
}

impl FakeApplier {
    fn build(permits: usize, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            permits: Semaphore::new(permits),
            fail,
            calls: Mutex::new(vec![]),
            finished: Mutex::new(0),
        })
    }

    pub fn immediate() -> Arc<Self> {
        Self::build(Semaphore::MAX_PERMITS, false)
    }

    pub fn blocking() -> Arc<Self> {
        Self::build(0, false)
    }

    pub fn failing() -> Arc<Self> {
        Self::build(Semaphore::MAX_PERMITS, true)
    }

    pub fn release(&self, count: usize) {
        self.permits.add_permits(count);
    }

    pub fn calls(&self) -> Vec<ApplyCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn started(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn finished(&self) -> usize {
        *self.finished.lock().unwrap()
    }

    /// Context id stamped for changes made to `entity_id`.
    pub fn stamp_for(entity_id: &str) -> ContextId {
        ContextId::new(format!("stamp:{entity_id}"))
    }
}

#[async_trait]
impl StateApplier for FakeApplier {
    async fn reproduce(
        &self,
        targets: &[EntityTarget],
        context: &Context,
        stamps: &ContextStamps,
    ) -> ApiResult<()> {
        self.calls.lock().unwrap().push(ApplyCall {
            targets: targets.to_vec(),
            context: context.clone(),
        });

        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ApiError::service_error("closed"))?;
        permit.forget();

        if self.fail {
            return Err(ApiError::service_error("platform unavailable"));
        }

        for target in targets {
            stamps.record(Self::stamp_for(&target.entity_id));
        }

        *self.finished.lock().unwrap() += 1;
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePublisher {
    published: Mutex<Vec<LightSceneStatus>>,
}

impl FakePublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn published(&self) -> Vec<LightSceneStatus> {
        self.published.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<LightSceneStatus> {
        self.published.lock().unwrap().last().cloned()
    }

    pub fn count(&self) -> usize {
        self.published.lock().unwrap().len()
    }
}

#[async_trait]
impl StatePublisher for FakePublisher {
    async fn publish(&self, status: &LightSceneStatus) -> ApiResult<()> {
        self.published.lock().unwrap().push(status.clone());
        Ok(())
    }
}

pub struct FakeSource {
    scenes: Mutex<Vec<SceneSnapshot>>,
    discovered: Mutex<usize>,
}

impl FakeSource {
    pub fn new(scenes: Vec<SceneSnapshot>) -> Arc<Self> {
        Arc::new(Self {
            scenes: Mutex::new(scenes),
            discovered: Mutex::new(0),
        })
    }

    pub fn set(&self, scenes: Vec<SceneSnapshot>) {
        *self.scenes.lock().unwrap() = scenes;
    }

    pub fn discovered(&self) -> usize {
        *self.discovered.lock().unwrap()
    }
}

#[async_trait]
impl SceneSource for FakeSource {
    async fn discover(&self) -> ApiResult<Vec<SceneSnapshot>> {
        *self.discovered.lock().unwrap() += 1;
        Ok(self.scenes.lock().unwrap().clone())
    }
}
