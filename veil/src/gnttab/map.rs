//! Map contexts: foreign pages mapped into a client

use tracing::{debug, error};

use super::{validate_geometry, GrantTable, Notify};
use crate::bus::{ForeignMapping, KernelBuffer};
use crate::error::{invariant_violation, Result, Status, VeilError};
use crate::queue::{PendingOp, PendingRequest};
use crate::types::{ClientId, DomainId, GrantFlags, GrantRef, LocalPort, RequestId, UserVa};

/// Parameters of a map request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapRequest {
    pub remote: DomainId,
    pub pages: u32,
    pub flags: GrantFlags,
    pub notify_offset: u32,
    pub notify_port: LocalPort,
    pub request_id: u64,
    pub references: Vec<GrantRef>,
}

pub struct MapContext {
    id: RequestId,
    remote: DomainId,
    notify: Notify,
    mapping: ForeignMapping,
    kernel: KernelBuffer,
    user_va: UserVa,
}

impl GrantTable {
    /// Map pages `request.remote` granted to us into `client`
    pub fn map_foreign_pages(&self, client: ClientId, request: &MapRequest) -> Result<PendingRequest> {
        validate_geometry(request.pages, request.flags, request.notify_offset)?;
        if request.references.len() != request.pages as usize {
            return Err(VeilError::invalid(format!(
                "{} references for {} pages",
                request.references.len(),
                request.pages
            )));
        }

        let id = RequestId::map(client, request.request_id);
        debug!(
            "> RemoteDomain {}, NumberPages {}, Flags {:?}, Offset {:#x}, Port {}, {}",
            request.remote,
            request.pages,
            request.flags,
            request.notify_offset,
            request.notify_port,
            id
        );

        if self.queue.contains(&id) {
            error!("{} already pending", id);
            return Err(VeilError::invalid(format!("{id} already pending")));
        }

        let readonly = request.flags.contains(GrantFlags::READONLY);
        let mapping = self
            .bus
            .gnttab
            .map_foreign_pages(request.remote, &request.references, readonly)
            .map_err(|e| {
                error!("mapping {} pages of {} failed: {}", request.pages, request.remote, e);
                VeilError::from(e)
            })?;

        let kernel = match self.bus.memory.map_io_space(&mapping) {
            Ok(kernel) => kernel,
            Err(e) => {
                error!("kernel mapping of {} pages failed: {}", request.pages, e);
                self.release_foreign(mapping);
                return Err(VeilError::ResourceExhausted(format!(
                    "kernel mapping of {} pages",
                    request.pages
                )));
            }
        };

        let user_va = match self.bus.memory.map_user(client, &kernel) {
            Ok(va) => va,
            Err(e) => {
                error!("user mapping of {} pages failed: {}", request.pages, e);
                self.bus.memory.unmap_io_space(kernel);
                self.release_foreign(mapping);
                return Err(e.into());
            }
        };

        let context = MapContext {
            id,
            remote: request.remote,
            notify: Notify {
                flags: request.flags,
                offset: request.notify_offset,
                port: request.notify_port,
            },
            mapping,
            kernel,
            user_va,
        };

        match self.queue.insert(id, PendingOp::Map(context)) {
            Ok(pending) => {
                debug!("< {} UserVa {}", id, user_va);
                Ok(pending)
            }
            Err(op) => {
                error!("{} raced with a duplicate", id);
                self.unwind_op(op);
                Err(VeilError::invalid(format!("{id} already pending")))
            }
        }
    }

    /// User address of a pending map
    pub fn get_map_result(&self, client: ClientId, request_id: u64) -> Result<UserVa> {
        let id = RequestId::map(client, request_id);
        self.queue
            .peek(&id, |op| match op {
                PendingOp::Map(context) => Some(context.user_va),
                PendingOp::Grant(_) => None,
            })
            .flatten()
            .ok_or_else(|| VeilError::not_found(format!("{id}")))
    }

    /// Unmap a pending map and complete its request with success
    pub fn unmap_foreign_pages(&self, client: ClientId, request_id: u64) -> Result<()> {
        let id = RequestId::map(client, request_id);
        debug!("> {}", id);

        let (op, completion) = self
            .queue
            .remove(&id)
            .ok_or_else(|| VeilError::not_found(format!("{id}")))?;

        self.free_op(op);
        completion.complete(Status::Success);
        Ok(())
    }

    pub(super) fn free_map(&self, context: MapContext) {
        debug!("free {} mapped from {}", context.id, context.remote);
        self.notify_peer(&context.notify, &context.kernel);
        self.unwind_map(context);
    }

    pub(super) fn unwind_map(&self, context: MapContext) {
        self.bus
            .memory
            .unmap_user(context.id.client, context.user_va, &context.kernel);
        self.bus.memory.unmap_io_space(context.kernel);
        self.release_foreign(context.mapping);
    }

    fn release_foreign(&self, mapping: ForeignMapping) {
        let id = mapping.id;
        if let Err(e) = self.bus.gnttab.unmap_foreign_pages(mapping) {
            invariant_violation(&format!("foreign mapping {id} could not be unmapped"), &e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Bus, FaultPoint, Loopback};
    use crate::evtchn::ChannelRegistry;
    use crate::gnttab::{GrantRequest, GrantResult};
    use crate::queue::PendingQueue;
    use std::sync::{Arc, Barrier};
    use std::thread;

    const SELF: DomainId = DomainId(0);

    fn setup() -> (Arc<Loopback>, GrantTable) {
        let lb = Arc::new(Loopback::new(SELF, 4096, 2));
        let bus = Bus::loopback(lb.clone());
        let channels = Arc::new(ChannelRegistry::new(lb.clone(), lb.clone(), 2, 16).unwrap());
        let table = GrantTable::new(bus, Arc::new(PendingQueue::new()), channels).unwrap();
        (lb, table)
    }

    /// Grant `pages` pages to ourselves and return the result
    fn self_grant(table: &GrantTable, client: ClientId, pages: u32, flags: GrantFlags) -> GrantResult {
        let request = GrantRequest {
            remote: SELF,
            pages,
            flags,
            notify_offset: 0,
            notify_port: LocalPort(0),
            request_id: 100,
        };
        table.permit_foreign_access(client, &request).unwrap();
        table
            .get_grant_result(client, 100, GrantResult::encoded_len(pages))
            .unwrap()
    }

    fn map_request(references: Vec<GrantRef>, request_id: u64) -> MapRequest {
        MapRequest {
            remote: SELF,
            pages: references.len() as u32,
            flags: GrantFlags::empty(),
            notify_offset: 0,
            notify_port: LocalPort(0),
            request_id,
            references,
        }
    }

    #[test]
    fn test_mapped_pages_alias_granted_pages() {
        let (lb, table) = setup();
        let client = ClientId(1);
        let granted = self_grant(&table, client, 2, GrantFlags::empty());

        let pending = table
            .map_foreign_pages(client, &map_request(granted.references.clone(), 1))
            .unwrap();
        let mapped = table.get_map_result(client, 1).unwrap();
        assert_ne!(mapped, granted.address);

        lb.user_write(client, UserVa(mapped.0 + 4096 + 5), b"ring").unwrap();
        assert_eq!(
            lb.user_read(client, UserVa(granted.address.0 + 4096 + 5), 4).unwrap(),
            b"ring".to_vec()
        );

        table.unmap_foreign_pages(client, 1).unwrap();
        assert_eq!(pending.status(), Some(Status::Success));
        table.revoke_foreign_access(client, 100).unwrap();

        let stats = lb.stats();
        assert_eq!(stats.foreign_mappings, 0);
        assert_eq!(stats.io_mappings, 0);
        assert_eq!(stats.user_mappings, 0);
        assert_eq!(stats.violations, 0);
    }

    #[test]
    fn test_notify_offset_cleared_on_unmap() {
        let (lb, table) = setup();
        let client = ClientId(1);
        let granted = self_grant(&table, client, 1, GrantFlags::empty());

        let mut request = map_request(granted.references.clone(), 1);
        request.flags = GrantFlags::USE_NOTIFY_OFFSET;
        request.notify_offset = 64;
        table.map_foreign_pages(client, &request).unwrap();

        let flag = UserVa(granted.address.0 + 64);
        lb.user_write(client, flag, &[1]).unwrap();
        table.unmap_foreign_pages(client, 1).unwrap();
        assert_eq!(lb.user_read(client, flag, 1).unwrap(), vec![0]);
    }

    #[test]
    fn test_reference_count_must_match_pages() {
        let (_lb, table) = setup();
        let mut request = map_request(vec![GrantRef(8), GrantRef(9)], 1);
        request.pages = 3;
        let err = table.map_foreign_pages(ClientId(1), &request).unwrap_err();
        assert_eq!(err.status(), Status::InvalidParameter);
    }

    #[test]
    fn test_readonly_grant_needs_readonly_map() {
        let (lb, table) = setup();
        let client = ClientId(1);
        let granted = self_grant(&table, client, 1, GrantFlags::READONLY);

        let err = table
            .map_foreign_pages(client, &map_request(granted.references.clone(), 1))
            .unwrap_err();
        assert_eq!(err.status(), Status::Unsuccessful);
        assert_eq!(lb.stats().foreign_mappings, 0);

        let mut request = map_request(granted.references, 2);
        request.flags = GrantFlags::READONLY;
        table.map_foreign_pages(client, &request).unwrap();
    }

    #[test]
    fn test_kernel_map_failure_unwinds() {
        let (lb, table) = setup();
        let client = ClientId(1);
        let granted = self_grant(&table, client, 2, GrantFlags::empty());

        lb.fail_after(FaultPoint::MapIoSpace, 0);
        let err = table
            .map_foreign_pages(client, &map_request(granted.references.clone(), 1))
            .unwrap_err();
        assert_eq!(err.status(), Status::ResourceExhausted);
        assert_eq!(lb.stats().foreign_mappings, 0);

        lb.fail_after(FaultPoint::MapUser, 0);
        assert!(table
            .map_foreign_pages(client, &map_request(granted.references, 2))
            .is_err());
        let stats = lb.stats();
        assert_eq!(stats.foreign_mappings, 0);
        assert_eq!(stats.io_mappings, 0);
        assert_eq!(stats.violations, 0);
    }

    #[test]
    fn test_unknown_map_is_not_found() {
        let (_lb, table) = setup();
        assert_eq!(
            table.get_map_result(ClientId(1), 5).unwrap_err().status(),
            Status::NotFound
        );
        assert_eq!(
            table.unmap_foreign_pages(ClientId(1), 5).unwrap_err().status(),
            Status::NotFound
        );
    }

    #[test]
    fn test_racing_duplicate_ids_park_one_mapping() {
        let (lb, table) = setup();
        let client = ClientId(1);
        let granted = self_grant(&table, client, 2, GrantFlags::empty());
        let request = map_request(granted.references.clone(), 1);
        let barrier = Barrier::new(2);

        for round in 0..32 {
            let (a, b) = thread::scope(|s| {
                let a = s.spawn(|| {
                    barrier.wait();
                    table.map_foreign_pages(client, &request)
                });
                let b = s.spawn(|| {
                    barrier.wait();
                    table.map_foreign_pages(client, &request)
                });
                (a.join().unwrap(), b.join().unwrap())
            });

            let statuses: Vec<_> = [&a, &b]
                .iter()
                .map(|r| r.as_ref().err().map(|e| e.status()))
                .collect();
            assert!(statuses.contains(&None), "round {}: {:?}", round, statuses);
            assert!(statuses.contains(&Some(Status::InvalidParameter)), "round {}: {:?}", round, statuses);
            assert_eq!(lb.stats().foreign_mappings, 1);

            table.unmap_foreign_pages(client, 1).unwrap();
            let stats = lb.stats();
            assert_eq!(stats.foreign_mappings, 0);
            assert_eq!(stats.io_mappings, 0);
        }

        table.revoke_foreign_access(client, 100).unwrap();
        let stats = lb.stats();
        assert_eq!(stats.active_grants, 0);
        assert_eq!(stats.user_mappings, 0);
        assert_eq!(stats.violations, 0);
    }

    #[test]
    #[should_panic(expected = "invariant violation")]
    fn test_failed_foreign_unmap_is_fatal() {
        let (lb, table) = setup();
        let client = ClientId(1);
        let granted = self_grant(&table, client, 1, GrantFlags::empty());
        table
            .map_foreign_pages(client, &map_request(granted.references, 1))
            .unwrap();
        lb.fail_after(FaultPoint::UnmapForeignPages, 0);
        let _ = table.unmap_foreign_pages(client, 1);
    }
}
