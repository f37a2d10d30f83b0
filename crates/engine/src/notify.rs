//! Watcher registry: per-ref change callbacks
//!
//! Callbacks are invoked once per commit that changed the watched ref, after
//! the commit's store swap and outside any critical section, so a callback
//! may itself start a new transaction without deadlocking.
//!
//! Watchers live outside the versioned store: registering or removing a
//! callback is not a transactional event and must not bump ref versions or
//! conflict with commits.

use crate::store::DynValue;
use dashmap::DashMap;
use refstm_core::{RefId, WatchToken};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Type-erased change callback.
pub(crate) type WatchFn = Arc<dyn Fn(&DynValue) + Send + Sync>;

struct Watcher {
    token: WatchToken,
    hook: WatchFn,
}

pub(crate) struct WatcherRegistry {
    watchers: DashMap<RefId, Vec<Watcher>>,
    next_token: AtomicU64,
}

impl WatcherRegistry {
    pub fn new() -> Self {
        WatcherRegistry {
            watchers: DashMap::new(),
            next_token: AtomicU64::new(1),
        }
    }

    /// Register `hook` for `id`; the returned token removes it again.
    pub fn register(&self, id: RefId, hook: WatchFn) -> WatchToken {
        let token = WatchToken::new(self.next_token.fetch_add(1, Ordering::SeqCst));
        self.watchers
            .entry(id)
            .or_default()
            .push(Watcher { token, hook });
        token
    }

    /// Remove one callback. Unknown tokens are ignored.
    pub fn unregister(&self, id: RefId, token: WatchToken) {
        if let Some(mut entry) = self.watchers.get_mut(&id) {
            entry.retain(|watcher| watcher.token != token);
        }
    }

    /// Remove every callback for a ref whose last handle dropped.
    pub fn drop_ref(&self, id: RefId) {
        self.watchers.remove(&id);
    }

    /// Invoke all callbacks registered for `id` with the committed value.
    ///
    /// The hooks are cloned out of the map before any of them runs, so a
    /// callback that commits (and so dispatches) again cannot deadlock
    /// against the registry.
    pub fn dispatch(&self, id: RefId, value: &DynValue) {
        let hooks: Vec<WatchFn> = match self.watchers.get(&id) {
            Some(entry) => entry.iter().map(|watcher| watcher.hook.clone()).collect(),
            None => return,
        };
        for hook in hooks {
            hook(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collector() -> (Arc<Mutex<Vec<i64>>>, WatchFn) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let hook: WatchFn = Arc::new(move |value: &DynValue| {
            if let Some(n) = value.downcast_ref::<i64>() {
                sink.lock().unwrap().push(*n);
            }
        });
        (seen, hook)
    }

    #[test]
    fn test_dispatch_invokes_registered_hook() {
        let registry = WatcherRegistry::new();
        let id = RefId::new(1);
        let (seen, hook) = collector();
        registry.register(id, hook);

        registry.dispatch(id, &(Arc::new(42i64) as DynValue));
        assert_eq!(*seen.lock().unwrap(), vec![42]);
    }

    #[test]
    fn test_dispatch_to_unwatched_ref_is_noop() {
        let registry = WatcherRegistry::new();
        registry.dispatch(RefId::new(9), &(Arc::new(1i64) as DynValue));
    }

    #[test]
    fn test_unregister_stops_delivery() {
        let registry = WatcherRegistry::new();
        let id = RefId::new(1);
        let (seen, hook) = collector();
        let token = registry.register(id, hook);

        registry.unregister(id, token);
        registry.dispatch(id, &(Arc::new(1i64) as DynValue));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unregister_leaves_other_hooks() {
        let registry = WatcherRegistry::new();
        let id = RefId::new(1);
        let (first_seen, first) = collector();
        let (second_seen, second) = collector();
        let first_token = registry.register(id, first);
        registry.register(id, second);

        registry.unregister(id, first_token);
        registry.dispatch(id, &(Arc::new(5i64) as DynValue));
        assert!(first_seen.lock().unwrap().is_empty());
        assert_eq!(*second_seen.lock().unwrap(), vec![5]);
    }

    #[test]
    fn test_drop_ref_clears_all_hooks() {
        let registry = WatcherRegistry::new();
        let id = RefId::new(1);
        let (seen, hook) = collector();
        registry.register(id, hook);

        registry.drop_ref(id);
        registry.dispatch(id, &(Arc::new(1i64) as DynValue));
        assert!(seen.lock().unwrap().is_empty());
    }
}
