use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard, oneshot, watch};
use tokio::task::JoinHandle;

use lightscene_api::context::Context;
use lightscene_api::scene::EntityTarget;

use crate::error::{ApiError, ApiResult};
use crate::scene::StateApplier;
use crate::scene::causation::ContextStamps;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Transition {
    On,
    Off,
}

impl Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::On => "on",
            Self::Off => "off",
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CancelReason {
    /// A newer reproduction replaces this one
    Superseded,
    /// Cancelled from outside the controller (teardown, explicit cancel)
    Caller,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    Completed,
    Failed(String),
    TimedOut,
    Superseded,
    Cancelled,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperationState {
    Running,
    Cancelling,
    Done,
}

/// Handle to one in-flight reproduction.
#[derive(Debug)]
pub struct Operation {
    label: Transition,
    cancel: Option<oneshot::Sender<CancelReason>>,
    outcome: watch::Receiver<Option<Outcome>>,
    task: JoinHandle<()>,
}

impl Operation {
    #[must_use]
    pub fn state(&self) -> OperationState {
        if self.task.is_finished() || self.outcome.borrow().is_some() {
            OperationState::Done
        } else if self.cancel.is_none() {
            OperationState::Cancelling
        } else {
            OperationState::Running
        }
    }

    fn cancel(&mut self, reason: CancelReason) {
        if let Some(tx) = self.cancel.take() {
            // an error means the task already finished on its own
            let _ = tx.send(reason);
        }
    }

    async fn drain(self) -> Option<Outcome> {
        if let Err(err) = self.task.await {
            log::error!("Reproduction task for '{}' failed: {err}", self.label);
        }
        self.outcome.borrow().clone()
    }
}

/// Releases the busy gate when the owning task ends, including by panic.
struct BusyRelease(Arc<watch::Sender<bool>>);

impl Drop for BusyRelease {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

/// Runs at most one reproduction at a time for a single scene-light.
///
/// Starting a new reproduction cancels and drains the previous one first
/// (last writer wins, no queueing). Each reproduction is bounded by a
/// timeout, after which it is cancelled and logged as a warning.
pub struct ReproductionController {
    name: String,
    applier: Arc<dyn StateApplier>,
    timeout: Duration,
    slot: Mutex<Option<Operation>>,
    busy: Arc<watch::Sender<bool>>,
}

impl ReproductionController {
    #[must_use]
    pub fn new(name: impl Into<String>, applier: Arc<dyn StateApplier>, timeout: Duration) -> Self {
        let (busy, _) = watch::channel(false);
        Self {
            name: name.into(),
            applier,
            timeout,
            slot: Mutex::new(None),
            busy: Arc::new(busy),
        }
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        *self.busy.borrow()
    }

    /// Wait until no reproduction is in flight.
    pub async fn wait_idle(&self) {
        let mut rx = self.busy.subscribe();
        // the sender lives as long as self, so this cannot fail
        let _ = rx.wait_for(|busy| !*busy).await;
    }

    /// Take exclusive control of the controller.
    ///
    /// Any in-flight reproduction is superseded and drained before this
    /// returns, and the busy gate stays closed until the returned slot is
    /// either dropped or used to start a new reproduction.
    pub async fn acquire(&self) -> ReproductionSlot<'_> {
        let mut guard = self.slot.lock().await;

        if let Some(mut op) = guard.take() {
            if op.state() != OperationState::Done {
                log::debug!(
                    "[{}] Superseding in-flight '{}' reproduction",
                    self.name,
                    op.label
                );
            }
            op.cancel(CancelReason::Superseded);
            op.drain().await;
        }

        self.wait_idle().await;
        self.busy.send_replace(true);

        ReproductionSlot {
            controller: self,
            guard,
            armed: true,
        }
    }

    /// Cancel the in-flight reproduction, if any, and wait for it to stop.
    pub async fn cancel(&self, reason: CancelReason) -> Option<Outcome> {
        let mut guard = self.slot.lock().await;
        let mut op = guard.take()?;
        op.cancel(reason);
        op.drain().await
    }

    /// Wait for the current reproduction to finish.
    ///
    /// Supersession and timeouts are reported as outcomes. A reproduction
    /// cancelled from outside the controller surfaces as
    /// [`ApiError::Cancelled`].
    pub async fn settled(&self) -> ApiResult<Option<Outcome>> {
        let Some(mut rx) = self.slot.lock().await.as_ref().map(|op| op.outcome.clone()) else {
            return Ok(None);
        };

        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ApiError::service_error(format!("[{}] Reproduction task lost", self.name)))?
            .clone();

        match outcome {
            Some(Outcome::Cancelled) => Err(ApiError::Cancelled),
            other => Ok(other),
        }
    }

    async fn run(
        applier: Arc<dyn StateApplier>,
        targets: Vec<EntityTarget>,
        context: Context,
        stamps: ContextStamps,
        timeout: Duration,
        cancel: oneshot::Receiver<CancelReason>,
    ) -> Outcome {
        let reproduce = applier.reproduce(&targets, &context, &stamps);

        tokio::select! {
            biased;

            reason = cancel => match reason {
                Ok(CancelReason::Superseded) => Outcome::Superseded,
                Ok(CancelReason::Caller) | Err(_) => Outcome::Cancelled,
            },

            res = tokio::time::timeout(timeout, reproduce) => match res {
                Ok(Ok(())) => Outcome::Completed,
                Ok(Err(err)) => Outcome::Failed(err.to_string()),
                Err(_) => Outcome::TimedOut,
            },
        }
    }
}

/// Exclusive access to a [`ReproductionController`], with any previous
/// reproduction already drained.
pub struct ReproductionSlot<'a> {
    controller: &'a ReproductionController,
    guard: MutexGuard<'a, Option<Operation>>,
    armed: bool,
}

impl ReproductionSlot<'_> {
    /// Start driving `targets`, tagged with `context`.
    pub fn start(
        mut self,
        targets: Vec<EntityTarget>,
        context: Context,
        label: Transition,
        stamps: ContextStamps,
    ) {
        let ctl = self.controller;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (outcome_tx, outcome_rx) = watch::channel(None);

        let name = ctl.name.clone();
        let applier = ctl.applier.clone();
        let timeout = ctl.timeout;
        let release = BusyRelease(ctl.busy.clone());

        log::debug!(
            "[{name}] Starting '{label}' reproduction of {} entities (context {})",
            targets.len(),
            context.id
        );

        let task = tokio::spawn(async move {
            let outcome =
                ReproductionController::run(applier, targets, context, stamps, timeout, cancel_rx)
                    .await;

            match &outcome {
                Outcome::Completed => log::debug!("[{name}] '{label}' reproduction completed"),
                Outcome::Failed(err) => {
                    log::warn!("[{name}] '{label}' reproduction failed: {err}");
                }
                Outcome::TimedOut => log::warn!(
                    "[{name}] '{label}' reproduction timed out after {}s, cancelled",
                    timeout.as_secs()
                ),
                Outcome::Superseded => log::debug!("[{name}] '{label}' reproduction superseded"),
                Outcome::Cancelled => log::debug!("[{name}] '{label}' reproduction cancelled"),
            }

            drop(release);
            outcome_tx.send_replace(Some(outcome));
        });

        *self.guard = Some(Operation {
            label,
            cancel: Some(cancel_tx),
            outcome: outcome_rx,
            task,
        });

        // the spawned task owns the busy gate from here on
        self.armed = false;
    }
}

impl Drop for ReproductionSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.controller.busy.send_replace(false);
        }
    }
}
