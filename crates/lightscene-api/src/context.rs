use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier of the actor that caused a state change.
#[derive(Clone, Debug, Serialize, Deserialize, Hash, Eq, PartialEq, Ord, PartialOrd)]
#[serde(transparent)]
pub struct ContextId(String);

impl ContextId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContextId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Causation context, optionally linked to the context it was derived from.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct Context {
    pub id: ContextId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<ContextId>,
}

impl Context {
    #[must_use]
    pub const fn new(id: ContextId) -> Self {
        Self {
            id,
            parent_id: None,
        }
    }

    /// Mint a fresh context, linked to `parent` when there is one.
    #[must_use]
    pub fn child_of(parent: Option<&ContextId>) -> Self {
        Self {
            id: ContextId::random(),
            parent_id: parent.cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::context::{Context, ContextId};

    #[test]
    fn child_context_links_parent() {
        let root = ContextId::new("01HZROOT");
        let child = Context::child_of(Some(&root));

        assert_eq!(child.parent_id, Some(root.clone()));
        assert_ne!(child.id, root);
    }

    #[test]
    fn minted_contexts_are_unique() {
        let a = Context::child_of(None);
        let b = Context::child_of(None);

        assert_eq!(a.parent_id, None);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn context_id_is_transparent_in_json() {
        let ctx = Context::new(ContextId::new("abc"));
        let json = serde_json::to_value(&ctx).unwrap();

        assert_eq!(json, serde_json::json!({"id": "abc"}));
    }
}
