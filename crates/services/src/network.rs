//! Connectivity signal with deduplicated transitions.

use std::sync::Mutex;

use crate::observer::{Subject, Subscription};

/// Capability supplying the platform's connectivity signal.
///
/// `None` means the platform cannot tell; the monitor then assumes online,
/// which is the safe direction: a failed dispatch simply re-queues, while a
/// false "offline" would needlessly delay sync.
pub trait ConnectivityProbe: Send + Sync {
    fn is_online(&self) -> Option<bool>;
}

/// Probe for environments with no connectivity signal at all.
pub struct AlwaysOnlineProbe;

impl ConnectivityProbe for AlwaysOnlineProbe {
    fn is_online(&self) -> Option<bool> {
        None
    }
}

/// Tracks the online/offline state and fires a transition event exactly
/// once per state change.
pub struct NetworkMonitor {
    online: Mutex<bool>,
    transitions: Subject<bool>,
}

impl NetworkMonitor {
    /// Build a monitor seeded from the probe (online when the probe is silent).
    #[must_use]
    pub fn new(probe: &dyn ConnectivityProbe) -> Self {
        Self::with_initial(probe.is_online().unwrap_or(true))
    }

    /// Build a monitor with an explicit initial state (tests, demos).
    #[must_use]
    pub fn with_initial(online: bool) -> Self {
        Self {
            online: Mutex::new(online),
            transitions: Subject::new(),
        }
    }

    /// Current connectivity state.
    #[must_use]
    pub fn is_online(&self) -> bool {
        *self
            .online
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Feed a platform connectivity change into the monitor.
    ///
    /// Duplicate reports of the current state are swallowed; listeners see
    /// each transition exactly once.
    pub fn set_online(&self, online: bool) {
        {
            let mut guard = self
                .online
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if *guard == online {
                return;
            }
            *guard = online;
        }
        tracing::debug!(online, "connectivity transition");
        self.transitions.emit(&online);
    }

    /// Listen for transitions; the payload is the new state.
    #[must_use]
    pub fn subscribe(
        &self,
        listener: impl Fn(&bool) + Send + Sync + 'static,
    ) -> Subscription<bool> {
        self.transitions.subscribe(listener)
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedProbe(Option<bool>);

    impl ConnectivityProbe for FixedProbe {
        fn is_online(&self) -> Option<bool> {
            self.0
        }
    }

    #[test]
    fn silent_probe_defaults_to_online() {
        let monitor = NetworkMonitor::new(&FixedProbe(None));
        assert!(monitor.is_online());
    }

    #[test]
    fn probe_signal_seeds_initial_state() {
        let monitor = NetworkMonitor::new(&FixedProbe(Some(false)));
        assert!(!monitor.is_online());
    }

    #[test]
    fn duplicate_transitions_fire_once() {
        let monitor = NetworkMonitor::with_initial(true);
        let fired = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&fired);
        let _sub = monitor.subscribe(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        monitor.set_online(true); // already online, no event
        monitor.set_online(false);
        monitor.set_online(false); // already offline, no event
        monitor.set_online(true);

        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
