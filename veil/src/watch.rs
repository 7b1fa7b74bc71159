//! Store watches bound to client events

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error, trace};

use crate::bus::{HandleOps, StoreService, StoreWatchId};
use crate::error::{invariant_violation, Result, VeilError};
use crate::list_lock;
use crate::store::validate_abs_path;
use crate::sync::ListLock;
use crate::types::{ClientId, EventHandle, WatchHandle};

struct WatchContext {
    client: ClientId,
    path: String,
    watch: StoreWatchId,
}

pub struct WatchRegistry {
    store: Arc<dyn StoreService>,
    handles: Arc<dyn HandleOps>,
    next_handle: AtomicU64,
    watches: ListLock<HashMap<WatchHandle, WatchContext>>,
}

impl WatchRegistry {
    pub fn new(store: Arc<dyn StoreService>, handles: Arc<dyn HandleOps>) -> Self {
        Self {
            store,
            handles,
            next_handle: AtomicU64::new(1),
            watches: list_lock!(HashMap::new(), "STORE_WATCH_LIST"),
        }
    }

    pub fn add_watch(&self, client: ClientId, path: &str, event: EventHandle) -> Result<WatchHandle> {
        validate_abs_path(path)?;

        let event = self.handles.reference_event(client, event).map_err(|e| {
            error!("event handle for {} rejected: {}", client, e);
            VeilError::from(e)
        })?;

        debug!("> Path '{}', {}", path, client);
        let watch = self.store.watch_add(path, event).map_err(|e| {
            error!("watch on '{}' failed: {}", path, e);
            VeilError::from(e)
        })?;

        let handle = WatchHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.watches.lock().insert(
            handle,
            WatchContext {
                client,
                path: path.to_string(),
                watch,
            },
        );

        trace!("< Watch {:?}", handle);
        Ok(handle)
    }

    pub fn remove_watch(&self, client: ClientId, handle: WatchHandle) -> Result<()> {
        let context = {
            let mut watches = self.watches.lock();
            let owned = watches.get(&handle).map_or(false, |w| w.client == client);
            if owned {
                watches.remove(&handle)
            } else {
                None
            }
        };

        let context = context.ok_or_else(|| VeilError::not_found(format!("watch {} for {client}", handle.0)))?;
        self.free(context);
        Ok(())
    }

    /// Tear down every watch `client` owns; returns how many
    pub fn remove_all(&self, client: ClientId) -> usize {
        let detached: Vec<WatchContext> = {
            let mut watches = self.watches.lock();
            let handles: Vec<WatchHandle> = watches
                .iter()
                .filter(|(_, w)| w.client == client)
                .map(|(h, _)| *h)
                .collect();
            handles.into_iter().filter_map(|h| watches.remove(&h)).collect()
        };

        let count = detached.len();
        for context in detached {
            self.free(context);
        }
        count
    }

    fn free(&self, context: WatchContext) {
        trace!("free watch on '{}' ({})", context.path, context.client);
        if let Err(e) = self.store.watch_remove(context.watch) {
            invariant_violation("store watch could not be removed", &e);
        }
    }

    pub fn len(&self) -> usize {
        self.watches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.watches.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{FaultPoint, Loopback};
    use crate::error::Status;
    use crate::types::DomainId;
    use std::time::Duration;

    fn setup() -> (Arc<Loopback>, WatchRegistry) {
        let lb = Arc::new(Loopback::new(DomainId(0), 16, 1));
        let registry = WatchRegistry::new(lb.clone(), lb.clone());
        (lb, registry)
    }

    #[test]
    fn test_watch_fires_on_write() {
        let (lb, registry) = setup();
        let client = ClientId(1);
        let (handle, event) = lb.create_event(client);

        let watch = registry.add_watch(client, "/local/domain/0/ring", handle).unwrap();
        assert!(event.wait_timeout(Duration::from_millis(10)));

        lb.write("/local/domain/0/ring/state", "4").unwrap();
        assert!(event.wait_timeout(Duration::from_millis(10)));

        registry.remove_watch(client, watch).unwrap();
        assert_eq!(lb.stats().watches, 0);
    }

    #[test]
    fn test_remove_is_owner_scoped() {
        let (lb, registry) = setup();
        let (handle, _) = lb.create_event(ClientId(1));
        let watch = registry.add_watch(ClientId(1), "data", handle).unwrap();

        let err = registry.remove_watch(ClientId(2), watch).unwrap_err();
        assert_eq!(err.status(), Status::NotFound);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_all() {
        let (lb, registry) = setup();
        let (handle, _) = lb.create_event(ClientId(1));
        for path in ["a", "b", "c"] {
            registry.add_watch(ClientId(1), path, handle).unwrap();
        }
        assert_eq!(registry.remove_all(ClientId(1)), 3);
        assert_eq!(registry.remove_all(ClientId(1)), 0);
        assert_eq!(lb.stats().watches, 0);
    }

    #[test]
    fn test_bad_path_rejected() {
        let (lb, registry) = setup();
        let (handle, _) = lb.create_event(ClientId(1));
        let err = registry.add_watch(ClientId(1), "", handle).unwrap_err();
        assert_eq!(err.status(), Status::InvalidParameter);
    }

    #[test]
    #[should_panic(expected = "invariant violation")]
    fn test_failed_watch_removal_is_fatal() {
        let (lb, registry) = setup();
        let (handle, _) = lb.create_event(ClientId(1));
        let watch = registry.add_watch(ClientId(1), "data", handle).unwrap();
        lb.fail_after(FaultPoint::WatchRemove, 0);
        let _ = registry.remove_watch(ClientId(1), watch);
    }
}
