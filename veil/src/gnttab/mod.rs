//! Grant and map context managers
//!
//! A grant makes pages of a fresh kernel buffer visible to a foreign
//! domain and maps the same pages into the client. A map does the reverse:
//! it maps pages a foreign domain granted to us into kernel space and then
//! into the client. Both park their context in the correlation queue until
//! the client revokes/unmaps or the request is cancelled.
//!
//! Construction acquires resources in a fixed order and every failure path
//! releases what it acquired in reverse. Teardown of a live context never
//! fails quietly: a page that will not revoke or a mapping that will not
//! unmap is an invariant violation.

mod grant;
mod map;

pub use grant::{GrantContext, GrantRequest, GrantResult};
pub use map::{MapContext, MapRequest};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::bus::{Bus, CacheLock, GrantCache, KernelBuffer};
use crate::error::{Result, Status, VeilError};
use crate::evtchn::ChannelRegistry;
use crate::queue::{PendingOp, PendingQueue};
use crate::types::{pages_to_bytes, GrantFlags, LocalPort, MAX_PAGES};

/// Spin lock handed to the grant table as its cache lock callbacks
#[derive(Debug, Default)]
pub struct GrantCacheLock {
    held: AtomicBool,
}

impl GrantCacheLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

impl CacheLock for GrantCacheLock {
    fn acquire(&self) {
        while self
            .held
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    fn release(&self) {
        self.held.store(false, Ordering::Release);
    }
}

/// Check page count and notify offset of a grant or map request
pub fn validate_geometry(pages: u32, flags: GrantFlags, notify_offset: u32) -> Result<()> {
    if pages == 0 || pages > MAX_PAGES {
        return Err(VeilError::invalid(format!(
            "page count {pages} outside 1..={MAX_PAGES}"
        )));
    }
    if flags.contains(GrantFlags::USE_NOTIFY_OFFSET) && notify_offset as u64 >= pages_to_bytes(pages) {
        return Err(VeilError::invalid(format!(
            "notify offset {notify_offset:#x} beyond {pages} pages"
        )));
    }
    Ok(())
}

/// Notification settings shared by grant and map contexts
#[derive(Debug, Clone, Copy)]
pub(crate) struct Notify {
    pub flags: GrantFlags,
    pub offset: u32,
    pub port: LocalPort,
}

pub struct GrantTable {
    bus: Bus,
    cache: GrantCache,
    queue: Arc<PendingQueue>,
    channels: Arc<ChannelRegistry>,
}

impl GrantTable {
    /// Create the grant cache and bind the managers to the queue
    pub fn new(bus: Bus, queue: Arc<PendingQueue>, channels: Arc<ChannelRegistry>) -> Result<Self> {
        let cache = bus
            .gnttab
            .create_cache("veil-gnttab", Arc::new(GrantCacheLock::new()))
            .map_err(|e| {
                error!("grant cache creation failed: {}", e);
                VeilError::from(e)
            })?;
        debug!("grant cache {:?} created", cache);

        Ok(Self {
            bus,
            cache,
            queue,
            channels,
        })
    }

    pub fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    /// Tear down a context that was removed from the queue
    pub fn free_op(&self, op: PendingOp) {
        match op {
            PendingOp::Grant(context) => self.free_grant(context),
            PendingOp::Map(context) => self.free_map(context),
        }
    }

    /// Teardown steps shared by grants and maps, before the unmaps
    fn notify_peer(&self, notify: &Notify, buffer: &KernelBuffer) {
        if notify.flags.contains(GrantFlags::USE_NOTIFY_OFFSET) {
            self.bus.memory.poke(buffer, notify.offset as u64, 0);
        }

        if notify.flags.contains(GrantFlags::USE_NOTIFY_PORT) {
            if let Err(e) = self.channels.notify(notify.port, None) {
                error!("failed to notify {}: {}", notify.port, e);
            }
        }
    }
}

impl Drop for GrantTable {
    fn drop(&mut self) {
        if std::thread::panicking() {
            if !self.queue.is_empty() {
                error!("{} parked requests leaked while unwinding", self.queue.len());
            }
            return;
        }

        let mut parked = self.queue.drain();
        // maps may alias our own grants, which refuse revocation while mapped
        parked.sort_by_key(|(op, _)| matches!(op, PendingOp::Grant(_)));
        if !parked.is_empty() {
            warn!("{} requests still parked at shutdown, tearing down", parked.len());
        }
        for (op, completion) in parked {
            self.free_op(op);
            completion.complete(Status::Cancelled);
        }
        self.bus.gnttab.destroy_cache(self.cache);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Loopback;
    use crate::types::{ClientId, DomainId};

    #[test]
    fn test_geometry_bounds() {
        let none = GrantFlags::empty();
        assert_eq!(validate_geometry(0, none, 0).unwrap_err().status(), Status::InvalidParameter);
        assert!(validate_geometry(1, none, 0).is_ok());
        assert!(validate_geometry(MAX_PAGES, none, 0).is_ok());
        assert!(validate_geometry(MAX_PAGES + 1, none, 0).is_err());
    }

    #[test]
    fn test_notify_offset_only_checked_when_used() {
        assert!(validate_geometry(1, GrantFlags::empty(), 4096).is_ok());
        assert!(validate_geometry(1, GrantFlags::USE_NOTIFY_OFFSET, 4095).is_ok());
        assert!(validate_geometry(1, GrantFlags::USE_NOTIFY_OFFSET, 4096).is_err());
    }

    #[test]
    fn test_drop_tears_down_parked_grants() {
        let lb = Arc::new(Loopback::new(DomainId(0), 64, 1));
        let channels = Arc::new(ChannelRegistry::new(lb.clone(), lb.clone(), 1, 4).unwrap());
        let table = GrantTable::new(Bus::loopback(lb.clone()), Arc::new(PendingQueue::new()), channels).unwrap();
        let request = GrantRequest {
            remote: DomainId(1),
            pages: 3,
            flags: GrantFlags::empty(),
            notify_offset: 0,
            notify_port: LocalPort(0),
            request_id: 1,
        };
        let pending = table.permit_foreign_access(ClientId(1), &request).unwrap();

        drop(table);
        assert_eq!(pending.status(), Some(Status::Cancelled));
        let stats = lb.stats();
        assert_eq!(stats.active_grants, 0);
        assert_eq!(stats.allocated_pages, 0);
        assert_eq!(stats.user_mappings, 0);
        assert_eq!(stats.violations, 0);
    }

    #[test]
    fn test_drop_unmaps_before_revoking() {
        let lb = Arc::new(Loopback::new(DomainId(0), 64, 1));
        let channels = Arc::new(ChannelRegistry::new(lb.clone(), lb.clone(), 1, 4).unwrap());
        let table = GrantTable::new(Bus::loopback(lb.clone()), Arc::new(PendingQueue::new()), channels).unwrap();
        let client = ClientId(1);

        for request_id in 1..=4 {
            let request = GrantRequest {
                remote: DomainId(0),
                pages: 2,
                flags: GrantFlags::empty(),
                notify_offset: 0,
                notify_port: LocalPort(0),
                request_id,
            };
            table.permit_foreign_access(client, &request).unwrap();
            let references = table
                .get_grant_result(client, request_id, GrantResult::encoded_len(2))
                .unwrap()
                .references;
            let map = MapRequest {
                remote: DomainId(0),
                pages: 2,
                flags: GrantFlags::empty(),
                notify_offset: 0,
                notify_port: LocalPort(0),
                request_id,
                references,
            };
            table.map_foreign_pages(client, &map).unwrap();
        }

        drop(table);
        let stats = lb.stats();
        assert_eq!(stats.foreign_mappings, 0);
        assert_eq!(stats.active_grants, 0);
        assert_eq!(stats.allocated_pages, 0);
        assert_eq!(stats.violations, 0);
    }

    #[test]
    fn test_cache_lock() {
        let lock = GrantCacheLock::new();
        lock.acquire();
        assert!(lock.is_held());
        lock.release();
        assert!(!lock.is_held());
    }
}
