use std::collections::HashSet;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use lightscene_api::context::{Context, ContextId};

/// Records which causation contexts a scene-light produced itself.
///
/// A single reproduction pass can surface many context ids (the platform may
/// stamp every service call with a fresh one), so every id seen during the
/// current "on" lifetime is kept, not just the latest.
///
/// The most recent tag survives [`CausationTracker::clear`], so contexts
/// minted after an "off" still link back to the ones before it.
#[derive(Debug, Default)]
pub struct CausationTracker {
    active: Option<ContextId>,
    known: HashSet<ContextId>,
    latest: Option<ContextId>,
}

impl CausationTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new context linked to the most recent one.
    pub fn mint(&mut self) -> Context {
        let context = Context::child_of(self.latest.as_ref());
        self.latest = Some(context.id.clone());
        context
    }

    /// Make `tag` the active context, and remember it as self-caused.
    pub fn activate(&mut self, tag: ContextId) {
        self.known.insert(tag.clone());
        self.latest = Some(tag.clone());
        self.active = Some(tag);
    }

    pub fn mark_self(&mut self, tag: ContextId) {
        self.known.insert(tag);
    }

    #[must_use]
    pub fn is_external(&self, tag: &ContextId) -> bool {
        self.active.as_ref() != Some(tag) && !self.known.contains(tag)
    }

    #[must_use]
    pub const fn active(&self) -> Option<&ContextId> {
        self.active.as_ref()
    }

    #[must_use]
    pub fn known_count(&self) -> usize {
        self.known.len()
    }

    pub fn clear(&mut self) {
        self.active = None;
        self.known.clear();
    }
}

/// Sending half handed to the applier, which reports every context id the
/// platform attached to changes it made on behalf of a scene-light.
#[derive(Clone, Debug)]
pub struct ContextStamps {
    tx: UnboundedSender<ContextId>,
}

impl ContextStamps {
    #[must_use]
    pub fn channel() -> (Self, StampInbox) {
        let (tx, rx) = unbounded_channel();
        (Self { tx }, StampInbox { rx })
    }

    pub fn record(&self, tag: ContextId) {
        // the receiver only goes away when the scene-light is dropped
        let _ = self.tx.send(tag);
    }
}

#[derive(Debug)]
pub struct StampInbox {
    rx: UnboundedReceiver<ContextId>,
}

impl StampInbox {
    /// Move every pending stamp into `tracker`.
    pub fn drain_into(&mut self, tracker: &mut CausationTracker) {
        while let Ok(tag) = self.rx.try_recv() {
            tracker.mark_self(tag);
        }
    }

    /// Drop every pending stamp.
    pub fn discard(&mut self) {
        while self.rx.try_recv().is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use lightscene_api::context::ContextId;

    use crate::scene::causation::{CausationTracker, ContextStamps};

    #[test]
    fn unknown_tags_are_external() {
        let tracker = CausationTracker::new();
        assert!(tracker.is_external(&ContextId::new("x")));
    }

    #[test]
    fn active_and_marked_tags_are_self_caused() {
        let mut tracker = CausationTracker::new();
        tracker.activate(ContextId::new("first"));
        tracker.activate(ContextId::new("second"));
        tracker.mark_self(ContextId::new("stamp"));

        assert_eq!(tracker.active(), Some(&ContextId::new("second")));
        assert!(!tracker.is_external(&ContextId::new("first")));
        assert!(!tracker.is_external(&ContextId::new("second")));
        assert!(!tracker.is_external(&ContextId::new("stamp")));
        assert!(tracker.is_external(&ContextId::new("other")));
        assert_eq!(tracker.known_count(), 3);
    }

    #[test]
    fn clear_forgets_everything() {
        let mut tracker = CausationTracker::new();
        tracker.activate(ContextId::new("a"));
        tracker.mark_self(ContextId::new("b"));
        tracker.clear();

        assert_eq!(tracker.known_count(), 0);
        assert_eq!(tracker.active(), None);
        assert!(tracker.is_external(&ContextId::new("a")));
        assert!(tracker.is_external(&ContextId::new("b")));
    }

    #[test]
    fn stamps_reach_tracker_on_drain() {
        let (stamps, mut inbox) = ContextStamps::channel();
        let mut tracker = CausationTracker::new();

        stamps.record(ContextId::new("s1"));
        stamps.clone().record(ContextId::new("s2"));
        assert!(tracker.is_external(&ContextId::new("s1")));

        inbox.drain_into(&mut tracker);
        assert!(!tracker.is_external(&ContextId::new("s1")));
        assert!(!tracker.is_external(&ContextId::new("s2")));
    }

    #[test]
    fn discarded_stamps_are_lost() {
        let (stamps, mut inbox) = ContextStamps::channel();
        let mut tracker = CausationTracker::new();

        stamps.record(ContextId::new("late"));
        inbox.discard();
        inbox.drain_into(&mut tracker);

        assert_eq!(tracker.known_count(), 0);
    }

    #[test]
    fn minted_contexts_link_across_clear() {
        let mut tracker = CausationTracker::new();

        let first = tracker.mint();
        assert_eq!(first.parent_id, None);
        tracker.activate(first.id.clone());

        let off = tracker.mint();
        tracker.clear();
        assert_eq!(off.parent_id.as_ref(), Some(&first.id));

        let again = tracker.mint();
        assert_eq!(again.parent_id.as_ref(), Some(&off.id));
        assert!(tracker.is_external(&first.id));

        tracker.activate(ContextId::new("automation"));
        assert_eq!(
            tracker.mint().parent_id,
            Some(ContextId::new("automation"))
        );
    }
}
