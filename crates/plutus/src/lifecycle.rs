//! Lifecycle hooks an agent fires at well-defined points: joining, leaving,
//! state changes, and peer membership changes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use plutus_core::ChangeEvent;

/// A point in an agent's lifecycle that hooks can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    BeforeJoin,
    AfterJoin,
    BeforeLeave,
    AfterLeave,
    OnStateChange,
    OnPeerJoin,
    OnPeerLeave,
    OnError,
}

/// The data passed to a hook when its event fires.
#[derive(Debug, Clone)]
pub enum LifecycleContext {
    /// No extra data (join/leave events).
    None,
    /// Fired alongside [`LifecycleEvent::OnStateChange`].
    StateChange(ChangeEvent),
    /// A peer id, for [`LifecycleEvent::OnPeerJoin`]/[`LifecycleEvent::OnPeerLeave`].
    Peer(u64),
    /// A human-readable error, for [`LifecycleEvent::OnError`].
    Error(String),
}

/// A registered hook's identity, returned by [`LifecycleManager::on`] so it
/// can later be removed with [`LifecycleManager::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookId(usize);

type Hook = Arc<dyn Fn(&LifecycleContext) + Send + Sync>;

/// Registers and fires lifecycle hooks for an [`crate::agent::Agent`].
#[derive(Default)]
pub struct LifecycleManager {
    hooks: Mutex<HashMap<LifecycleEvent, Vec<(HookId, Hook)>>>,
    next_id: AtomicUsize,
}

impl LifecycleManager {
    /// An empty manager with no hooks registered.
    pub fn new() -> Self {
        LifecycleManager::default()
    }

    /// Register `hook` to run whenever `event` fires.
    pub fn on<F>(&self, event: LifecycleEvent, hook: F) -> HookId
    where
        F: Fn(&LifecycleContext) + Send + Sync + 'static,
    {
        let id = HookId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.hooks
            .lock()
            .unwrap()
            .entry(event)
            .or_default()
            .push((id, Arc::new(hook)));
        id
    }

    /// Remove a previously registered hook.
    pub fn off(&self, event: LifecycleEvent, id: HookId) {
        if let Some(hooks) = self.hooks.lock().unwrap().get_mut(&event) {
            hooks.retain(|(hook_id, _)| *hook_id != id);
        }
    }

    /// Fire every hook registered for `event`, in registration order.
    pub fn fire(&self, event: LifecycleEvent, context: LifecycleContext) {
        let hooks = self.hooks.lock().unwrap().get(&event).cloned();
        if let Some(hooks) = hooks {
            for (_, hook) in hooks {
                hook(&context);
            }
        }
    }
}
