use std::collections::HashMap;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::idset::IdSet;

use super::{Engine, Notice};

/// Handler run on downstream receipt of a typed payload.
pub type ActionFn = fn(&mut Engine, &IdSet, &Value) -> Result<()>;

/// Handler run when a typed payload arrives upstream from a descendant.
pub type NotifyFn = fn(&mut Engine, &mut Notice) -> Result<()>;

/// Registry mapping message-type tags to handlers. Each type carries at
/// most one action and one notify; services register theirs at engine
/// construction.
#[derive(Default)]
pub struct Router {
    actions: HashMap<String, ActionFn>,
    notifies: HashMap<String, NotifyFn>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_action(&mut self, kind: &str, handler: ActionFn) -> Result<()> {
        if self.actions.contains_key(kind) {
            return Err(Error::DuplicateHandler(kind.to_string()));
        }
        self.actions.insert(kind.to_string(), handler);
        Ok(())
    }

    pub fn register_notify(&mut self, kind: &str, handler: NotifyFn) -> Result<()> {
        if self.notifies.contains_key(kind) {
            return Err(Error::DuplicateHandler(kind.to_string()));
        }
        self.notifies.insert(kind.to_string(), handler);
        Ok(())
    }

    pub fn action(&self, kind: &str) -> Option<ActionFn> {
        self.actions.get(kind).copied()
    }

    pub fn notify(&self, kind: &str) -> Option<NotifyFn> {
        self.notifies.get(kind).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_action(_: &mut Engine, _: &IdSet, _: &Value) -> Result<()> {
        Ok(())
    }

    fn noop_notify(_: &mut Engine, _: &mut Notice) -> Result<()> {
        Ok(())
    }

    #[test]
    fn test_register_and_lookup() {
        let mut router = Router::new();
        router.register_action("kill", noop_action).expect("first");
        router.register_notify("start", noop_notify).expect("first");
        assert!(router.action("kill").is_some());
        assert!(router.notify("start").is_some());
        assert!(router.action("start").is_none());
        assert!(router.notify("kill").is_none());
    }

    /// Test that a second registration for the same type is rejected.
    #[test]
    fn test_duplicate_registration() {
        let mut router = Router::new();
        router.register_action("kill", noop_action).expect("first");
        assert!(matches!(
            router.register_action("kill", noop_action),
            Err(Error::DuplicateHandler(kind)) if kind == "kill"
        ));

        router.register_notify("finish", noop_notify).expect("first");
        assert!(matches!(
            router.register_notify("finish", noop_notify),
            Err(Error::DuplicateHandler(_))
        ));
    }
}
