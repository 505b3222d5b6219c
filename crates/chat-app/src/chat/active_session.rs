use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parley_storage::SessionName;

/// The one session the user is currently looking at.
///
/// Readers load it lock-free. Switching never touches in-flight sends; those keep the
/// session they captured when they started.
#[derive(Default)]
pub struct ActiveSessionSelector {
    current: ArcSwapOption<SessionName>,
}

impl ActiveSessionSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<SessionName> {
        self.current.load_full().map(|name| name.as_ref().clone())
    }

    pub fn set(&self, name: Option<SessionName>) {
        tracing::debug!(session = ?name, "active session changed");
        self.current.store(name.map(Arc::new));
    }

    /// Clears the selection only if it still points at `name`. Returns whether it did.
    pub(crate) fn clear_if(&self, name: &SessionName) -> bool {
        let previous = self.current.rcu(|current| match current {
            Some(active) if active.as_ref() == name => None,
            other => other.clone(),
        });
        previous.is_some_and(|active| active.as_ref() == name)
    }
}
