use vaxwatch_core::{CredentialArtifact, CredentialUsageState};

/// Uses a credential may absorb before a refresh is forced.
pub const MAX_USES: u32 = 26;

/// Holder for one scope's credential and its use counter.
///
/// Owned by a single broker and mutated only from the task driving it.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    state: CredentialUsageState,
}

impl CredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store from a state saved by an earlier run.
    #[must_use]
    pub fn from_state(state: CredentialUsageState) -> Self {
        Self { state }
    }

    #[must_use]
    pub fn get(&self) -> Option<&CredentialArtifact> {
        self.state.artifact.as_ref()
    }

    #[must_use]
    pub fn current_use_count(&self) -> u32 {
        self.state.use_count
    }

    /// Replaces the artifact and resets the use counter.
    pub fn set(&mut self, artifact: CredentialArtifact) {
        self.state.artifact = Some(artifact);
        self.state.use_count = 0;
    }

    pub fn record_use(&mut self, degrading: bool) {
        if degrading {
            self.state.use_count = self.state.use_count.saturating_add(1);
        }
    }

    /// Drops the artifact so the next use refreshes.
    pub fn invalidate(&mut self) {
        self.state.artifact = None;
    }

    /// True when there is nothing to use or the budget is spent.
    #[must_use]
    pub fn needs_refresh(&self) -> bool {
        self.state.artifact.is_none() || self.state.use_count >= MAX_USES
    }

    #[must_use]
    pub fn snapshot(&self) -> CredentialUsageState {
        self.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(key: &str) -> CredentialArtifact {
        CredentialArtifact {
            session_key: key.to_owned(),
            auxiliary_tokens: Vec::new(),
        }
    }

    #[test]
    fn empty_store_needs_refresh() {
        let store = CredentialStore::new();
        assert!(store.get().is_none());
        assert!(store.needs_refresh());
    }

    #[test]
    fn set_resets_use_count() {
        let mut store = CredentialStore::from_state(CredentialUsageState {
            artifact: Some(artifact("old")),
            use_count: 20,
        });
        store.set(artifact("new"));
        assert_eq!(store.current_use_count(), 0);
        assert_eq!(store.get().map(|a| a.session_key.as_str()), Some("new"));
    }

    #[test]
    fn only_degrading_uses_count() {
        let mut store = CredentialStore::new();
        store.set(artifact("k"));
        store.record_use(false);
        assert_eq!(store.current_use_count(), 0);
        store.record_use(true);
        store.record_use(true);
        assert_eq!(store.current_use_count(), 2);
    }

    #[test]
    fn budget_exhaustion_forces_refresh() {
        let mut store = CredentialStore::new();
        store.set(artifact("k"));
        for _ in 0..MAX_USES - 1 {
            store.record_use(true);
        }
        assert!(!store.needs_refresh());
        store.record_use(true);
        assert!(store.needs_refresh());
    }

    #[test]
    fn invalidate_keeps_counter_but_drops_artifact() {
        let mut store = CredentialStore::new();
        store.set(artifact("k"));
        store.record_use(true);
        store.invalidate();
        assert!(store.needs_refresh());
        assert_eq!(store.snapshot().use_count, 1);
    }
}
