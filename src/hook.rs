//! Hook registry for circuit breaker events.

use crate::state::State;
use parking_lot::RwLock;
use std::sync::Arc;

type TransitionHookFn = Arc<dyn Fn(&str, State, State) + Send + Sync + 'static>;
type NamedHookFn = Arc<dyn Fn(&str) + Send + Sync + 'static>;

/// A registry for circuit breaker event hooks.
///
/// Hooks run on the calling task after the breaker's state lock has been
/// released, so they may inspect the breaker but should stay cheap.
pub struct HookRegistry {
    on_transition: RwLock<Option<TransitionHookFn>>,
    on_rejected: RwLock<Option<NamedHookFn>>,
    on_failure: RwLock<Option<NamedHookFn>>,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    /// Creates a new empty hook registry.
    pub fn new() -> Self {
        Self {
            on_transition: RwLock::new(None),
            on_rejected: RwLock::new(None),
            on_failure: RwLock::new(None),
        }
    }

    /// Sets the hook called with `(breaker, from, to)` on every transition.
    pub fn set_on_transition<F>(&self, f: F)
    where
        F: Fn(&str, State, State) + Send + Sync + 'static,
    {
        *self.on_transition.write() = Some(Arc::new(f));
    }

    /// Sets the hook called when a call is short-circuited.
    pub fn set_on_rejected<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.on_rejected.write() = Some(Arc::new(f));
    }

    /// Sets the hook called when an admitted operation fails.
    pub fn set_on_failure<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.on_failure.write() = Some(Arc::new(f));
    }

    pub(crate) fn execute_transition_hook(&self, breaker: &str, from: State, to: State) {
        let hook = self.on_transition.read().clone();
        if let Some(hook) = hook {
            hook(breaker, from, to);
        }
    }

    pub(crate) fn execute_rejected_hook(&self, breaker: &str) {
        let hook = self.on_rejected.read().clone();
        if let Some(hook) = hook {
            hook(breaker);
        }
    }

    pub(crate) fn execute_failure_hook(&self, breaker: &str) {
        let hook = self.on_failure.read().clone();
        if let Some(hook) = hook {
            hook(breaker);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn transition_hook_sees_edge() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hooks = HookRegistry::new();
        let sink = Arc::clone(&seen);
        hooks.set_on_transition(move |name, from, to| {
            sink.lock().push((name.to_string(), from, to));
        });

        hooks.execute_transition_hook("chat", State::Closed, State::Open);
        hooks.execute_rejected_hook("chat");

        assert_eq!(
            *seen.lock(),
            vec![("chat".to_string(), State::Closed, State::Open)]
        );
    }
}
