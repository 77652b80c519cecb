use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

use crate::client::Client;
use crate::server::Server;

pub type LifecycleHook = Arc<dyn Fn(&Server) + Send + Sync>;
pub type RequestHook = Arc<dyn Fn(&Client, &Server) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecyclePhase {
    BeforeStart,
    Start,
    Started,
    BeforeStop,
    Stop,
    Stopped,
}

impl LifecyclePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecyclePhase::BeforeStart => "OnBeforeStart",
            LifecyclePhase::Start => "OnStart",
            LifecyclePhase::Started => "OnStarted",
            LifecyclePhase::BeforeStop => "OnBeforeStop",
            LifecyclePhase::Stop => "OnStop",
            LifecyclePhase::Stopped => "OnStopped",
        }
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named callbacks fired in registration order.
///
/// Re-adding an existing name swaps the callback but keeps its position.
pub struct HookSet<F> {
    hooks: RwLock<Vec<(String, F)>>,
}

impl<F> Default for HookSet<F> {
    fn default() -> Self {
        Self {
            hooks: RwLock::new(Vec::new()),
        }
    }
}

impl<F: Clone> HookSet<F> {
    /// Returns `false` and ignores the callback when `name` is empty.
    pub fn add(&self, name: impl Into<String>, hook: F) -> bool {
        let name = name.into();
        if name.is_empty() {
            return false;
        }
        let mut hooks = self.hooks.write();
        match hooks.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = hook,
            None => hooks.push((name, hook)),
        }
        true
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut hooks = self.hooks.write();
        let before = hooks.len();
        hooks.retain(|(existing, _)| existing != name);
        hooks.len() != before
    }

    pub fn names(&self) -> Vec<String> {
        self.hooks.read().iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Callbacks in order, copied out so they run without the lock held
    /// and may themselves add or remove hooks.
    pub fn snapshot(&self) -> Vec<F> {
        self.hooks.read().iter().map(|(_, hook)| hook.clone()).collect()
    }
}

/// All hook points of a server.
#[derive(Default)]
pub struct Hooks {
    before_start: HookSet<LifecycleHook>,
    start: HookSet<LifecycleHook>,
    started: HookSet<LifecycleHook>,
    before_stop: HookSet<LifecycleHook>,
    stop: HookSet<LifecycleHook>,
    stopped: HookSet<LifecycleHook>,
    pub request: HookSet<RequestHook>,
    pub response: HookSet<RequestHook>,
}

impl Hooks {
    pub fn lifecycle(&self, phase: LifecyclePhase) -> &HookSet<LifecycleHook> {
        match phase {
            LifecyclePhase::BeforeStart => &self.before_start,
            LifecyclePhase::Start => &self.start,
            LifecyclePhase::Started => &self.started,
            LifecyclePhase::BeforeStop => &self.before_stop,
            LifecyclePhase::Stop => &self.stop,
            LifecyclePhase::Stopped => &self.stopped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_keeps_order_and_replaces_in_place() {
        let set: HookSet<u32> = HookSet::default();
        assert!(set.add("a", 1));
        assert!(set.add("b", 2));
        assert!(set.add("a", 3));
        assert!(!set.add("", 4));

        assert_eq!(set.names(), vec!["a", "b"]);
        assert_eq!(set.snapshot(), vec![3, 2]);
    }

    #[test]
    fn remove_by_name() {
        let set: HookSet<u32> = HookSet::default();
        set.add("a", 1);
        set.add("b", 2);

        assert!(set.remove("a"));
        assert!(!set.remove("a"));
        assert_eq!(set.snapshot(), vec![2]);
    }
}
