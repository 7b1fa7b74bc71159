//! Device object: owns every registry and gates requests on readiness
//!
//! A [`Device`] is built once per bus. Every operation first checks that
//! the collaborator interfaces are acquired and fails with
//! [`VeilError::DeviceNotReady`] otherwise. Client teardown and
//! cancellation are not gated.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info};

use crate::bus::Bus;
use crate::cleanup::{CleanupCoordinator, CleanupReport};
use crate::config::DeviceConfig;
use crate::error::{Result, VeilError};
use crate::evtchn::ChannelRegistry;
use crate::gnttab::{GrantRequest, GrantResult, GrantTable, MapRequest};
use crate::queue::{PendingQueue, PendingRequest};
use crate::store::StoreGateway;
use crate::types::{ClientId, DomainId, EventHandle, LocalPort, RequestId, StorePermission, UserVa, WatchHandle};
use crate::watch::WatchRegistry;

pub struct Device {
    bus: Bus,
    queue: Arc<PendingQueue>,
    gnttab: Arc<GrantTable>,
    channels: Arc<ChannelRegistry>,
    watches: Arc<WatchRegistry>,
    store: StoreGateway,
    cleanup: CleanupCoordinator,
    interfaces_acquired: AtomicBool,
}

impl Device {
    /// Build the registries and acquire the collaborator interfaces
    pub fn new(bus: Bus, config: &DeviceConfig) -> Result<Self> {
        let spawn_failed = |what: &str, e: std::io::Error| {
            error!("{} workers could not start: {}", what, e);
            VeilError::ResourceExhausted(format!("{what} workers: {e}"))
        };

        let channels = Arc::new(
            ChannelRegistry::new(
                bus.evtchn.clone(),
                bus.handles.clone(),
                config.deferred_workers,
                config.deferred_queue_depth,
            )
            .map_err(|e| spawn_failed("deferred", e))?,
        );

        let queue = Arc::new(PendingQueue::new());
        let gnttab = Arc::new(GrantTable::new(bus.clone(), queue.clone(), channels.clone())?);
        let watches = Arc::new(WatchRegistry::new(bus.store.clone(), bus.handles.clone()));
        let store = StoreGateway::new(bus.store.clone());

        let cleanup = CleanupCoordinator::new(
            gnttab.clone(),
            channels.clone(),
            watches.clone(),
            config.cleanup_queue_depth,
        )
        .map_err(|e| spawn_failed("cleanup", e))?;

        info!("device ready");
        Ok(Self {
            bus,
            queue,
            gnttab,
            channels,
            watches,
            store,
            cleanup,
            interfaces_acquired: AtomicBool::new(true),
        })
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn acquire_interfaces(&self) {
        if !self.interfaces_acquired.swap(true, Ordering::AcqRel) {
            info!("interfaces acquired");
        }
    }

    pub fn release_interfaces(&self) {
        if self.interfaces_acquired.swap(false, Ordering::AcqRel) {
            info!("interfaces released");
        }
    }

    pub fn is_ready(&self) -> bool {
        self.interfaces_acquired.load(Ordering::Acquire)
    }

    fn ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(VeilError::DeviceNotReady)
        }
    }

    // ---- grants and maps ----

    pub fn permit_foreign_access(&self, client: ClientId, request: &GrantRequest) -> Result<PendingRequest> {
        self.ready()?;
        self.gnttab.permit_foreign_access(client, request)
    }

    pub fn get_grant_result(&self, client: ClientId, request_id: u64, result_len: usize) -> Result<GrantResult> {
        self.ready()?;
        self.gnttab.get_grant_result(client, request_id, result_len)
    }

    pub fn revoke_foreign_access(&self, client: ClientId, request_id: u64) -> Result<()> {
        self.ready()?;
        self.gnttab.revoke_foreign_access(client, request_id)
    }

    pub fn map_foreign_pages(&self, client: ClientId, request: &MapRequest) -> Result<PendingRequest> {
        self.ready()?;
        self.gnttab.map_foreign_pages(client, request)
    }

    pub fn get_map_result(&self, client: ClientId, request_id: u64) -> Result<UserVa> {
        self.ready()?;
        self.gnttab.get_map_result(client, request_id)
    }

    pub fn unmap_foreign_pages(&self, client: ClientId, request_id: u64) -> Result<()> {
        self.ready()?;
        self.gnttab.unmap_foreign_pages(client, request_id)
    }

    // ---- event channels ----

    pub fn bind_unbound_channel(
        &self,
        client: ClientId,
        remote: DomainId,
        mask: bool,
        event: EventHandle,
    ) -> Result<LocalPort> {
        self.ready()?;
        self.channels.bind_unbound(client, remote, mask, event)
    }

    pub fn bind_interdomain_channel(
        &self,
        client: ClientId,
        remote: DomainId,
        remote_port: LocalPort,
        mask: bool,
        event: EventHandle,
    ) -> Result<LocalPort> {
        self.ready()?;
        self.channels.bind_interdomain(client, remote, remote_port, mask, event)
    }

    pub fn close_channel(&self, client: ClientId, port: LocalPort) -> Result<()> {
        self.ready()?;
        self.channels.close(port, client)
    }

    pub fn notify_channel(&self, client: ClientId, port: LocalPort) -> Result<()> {
        self.ready()?;
        self.channels.notify(port, Some(client))
    }

    pub fn unmask_channel(&self, client: ClientId, port: LocalPort) -> Result<()> {
        self.ready()?;
        self.channels.unmask(port, client)
    }

    // ---- store ----

    pub fn add_watch(&self, client: ClientId, path: &str, event: EventHandle) -> Result<WatchHandle> {
        self.ready()?;
        self.watches.add_watch(client, path, event)
    }

    pub fn remove_watch(&self, client: ClientId, watch: WatchHandle) -> Result<()> {
        self.ready()?;
        self.watches.remove_watch(client, watch)
    }

    pub fn store_read(&self, path: &str) -> Result<String> {
        self.ready()?;
        self.store.read(path)
    }

    pub fn store_write(&self, path: &str, value: &str) -> Result<()> {
        self.ready()?;
        self.store.write(path, value)
    }

    pub fn store_directory(&self, path: &str) -> Result<Vec<String>> {
        self.ready()?;
        self.store.directory(path)
    }

    pub fn store_remove(&self, path: &str) -> Result<()> {
        self.ready()?;
        self.store.remove(path)
    }

    pub fn store_set_permissions(&self, path: &str, permissions: &[StorePermission]) -> Result<()> {
        self.ready()?;
        self.store.set_permissions(path, permissions)
    }

    // ---- teardown ----

    /// Cancel one parked request; false if it already completed
    pub fn cancel(&self, id: RequestId) -> bool {
        self.cleanup.cancel(id)
    }

    pub fn cancel_client(&self, client: ClientId) -> usize {
        self.cleanup.cancel_client(client)
    }

    /// Release the watches and channels of a departing client
    pub fn cleanup_client(&self, client: ClientId) -> CleanupReport {
        self.cleanup.cleanup_client(client)
    }

    /// Wait for queued cancellations to finish
    pub fn flush(&self) {
        self.cleanup.flush();
    }

    // ---- accounting ----

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Loopback;
    use crate::error::Status;
    use crate::types::GrantFlags;

    fn device() -> (Arc<Loopback>, Device) {
        let lb = Arc::new(Loopback::new(DomainId(0), 1024, 2));
        let config = DeviceConfig {
            deferred_workers: 2,
            ..DeviceConfig::default()
        };
        let device = Device::new(Bus::loopback(lb.clone()), &config).unwrap();
        (lb, device)
    }

    #[test]
    fn test_requests_gated_on_interfaces() {
        let (lb, device) = device();
        let client = ClientId(1);
        let (event, _) = lb.create_event(client);

        device.release_interfaces();
        assert!(!device.is_ready());
        assert_eq!(
            device
                .bind_unbound_channel(client, DomainId(1), false, event)
                .unwrap_err()
                .status(),
            Status::DeviceNotReady
        );
        assert_eq!(device.store_read("x").unwrap_err().status(), Status::DeviceNotReady);

        device.acquire_interfaces();
        assert!(device.bind_unbound_channel(client, DomainId(1), false, event).is_ok());
    }

    #[test]
    fn test_cleanup_runs_while_not_ready() {
        let (lb, device) = device();
        let client = ClientId(1);
        let (event, _) = lb.create_event(client);
        device.bind_unbound_channel(client, DomainId(1), false, event).unwrap();

        device.release_interfaces();
        assert_eq!(device.cleanup_client(client).channels, 1);
        assert_eq!(device.channel_count(), 0);
    }

    #[test]
    fn test_grant_lifecycle_through_device() {
        let (lb, device) = device();
        let client = ClientId(1);
        let request = GrantRequest {
            remote: DomainId(1),
            pages: 4,
            flags: GrantFlags::empty(),
            notify_offset: 0,
            notify_port: LocalPort(0),
            request_id: 1,
        };

        let pending = device.permit_foreign_access(client, &request).unwrap();
        assert_eq!(device.pending_count(), 1);
        device.revoke_foreign_access(client, 1).unwrap();
        assert_eq!(pending.status(), Some(Status::Success));
        assert_eq!(device.pending_count(), 0);
        assert_eq!(lb.stats().active_grants, 0);
    }
}
