//! Grant contexts: local pages shared with a foreign domain

use tracing::{debug, error, trace};

use super::{validate_geometry, GrantTable, Notify};
use crate::bus::{BusError, GrantEntry, KernelBuffer};
use crate::error::{invariant_violation, Result, Status, VeilError};
use crate::queue::{PendingOp, PendingRequest};
use crate::types::{ClientId, DomainId, GrantFlags, GrantRef, LocalPort, RequestId, UserVa};

/// Parameters of a grant request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantRequest {
    pub remote: DomainId,
    pub pages: u32,
    pub flags: GrantFlags,
    pub notify_offset: u32,
    pub notify_port: LocalPort,
    pub request_id: u64,
}

/// Where the client finds its pages and what to hand the remote domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantResult {
    pub address: UserVa,
    pub references: Vec<GrantRef>,
}

impl GrantResult {
    /// Exact result size for a grant of `pages` pages
    pub fn encoded_len(pages: u32) -> usize {
        8 + 4 * pages as usize
    }
}

pub struct GrantContext {
    id: RequestId,
    remote: DomainId,
    notify: Notify,
    grants: Vec<GrantEntry>,
    buffer: KernelBuffer,
    user_va: UserVa,
}

impl GrantContext {
    pub fn pages(&self) -> u32 {
        self.grants.len() as u32
    }
}

impl GrantTable {
    /// Share `request.pages` fresh pages with `request.remote`
    ///
    /// On success the context is parked and the returned request stays
    /// pending until the grant is revoked or cancelled.
    pub fn permit_foreign_access(&self, client: ClientId, request: &GrantRequest) -> Result<PendingRequest> {
        validate_geometry(request.pages, request.flags, request.notify_offset)?;

        let id = RequestId::grant(client, request.request_id);
        debug!(
            "> RemoteDomain {}, NumberPages {}, Flags {:?}, Offset {:#x}, Port {}, {}",
            request.remote,
            request.pages,
            request.flags,
            request.notify_offset,
            request.notify_port,
            id
        );

        // checked again when the context is parked
        if self.queue.contains(&id) {
            error!("{} already pending", id);
            return Err(VeilError::invalid(format!("{id} already pending")));
        }

        let mut grants: Vec<GrantEntry> = Vec::new();
        grants.try_reserve_exact(request.pages as usize).map_err(|_| {
            error!("no memory for {} grant slots", request.pages);
            VeilError::ResourceExhausted(format!("{} grant slots", request.pages))
        })?;

        let buffer = self.bus.memory.allocate(request.pages).map_err(|e| {
            error!("allocation of {} pages failed: {}", request.pages, e);
            match e {
                BusError::OutOfResources => VeilError::ResourceExhausted(format!("{} pages", request.pages)),
                other => VeilError::from(other),
            }
        })?;

        let readonly = request.flags.contains(GrantFlags::READONLY);
        for (page, pfn) in buffer.frames.iter().enumerate() {
            match self
                .bus
                .gnttab
                .permit_foreign_access(self.cache, request.remote, *pfn, readonly)
            {
                Ok(entry) => {
                    trace!("Grants[{}] = {:?}", page, entry.reference());
                    grants.push(entry);
                }
                Err(e) => {
                    error!("sharing failed at page {}: {}", page, e);
                    self.revoke_all(grants);
                    self.bus.memory.free(buffer);
                    return Err(e.into());
                }
            }
        }

        let user_va = match self.bus.memory.map_user(client, &buffer) {
            Ok(va) => va,
            Err(e) => {
                error!("user mapping of {} pages failed: {}", request.pages, e);
                self.revoke_all(grants);
                self.bus.memory.free(buffer);
                return Err(e.into());
            }
        };

        let context = GrantContext {
            id,
            remote: request.remote,
            notify: Notify {
                flags: request.flags,
                offset: request.notify_offset,
                port: request.notify_port,
            },
            grants,
            buffer,
            user_va,
        };

        match self.queue.insert(id, PendingOp::Grant(context)) {
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

    /// User address and references of a pending grant
    ///
    /// `result_len` is the size of the caller's result buffer and must be
    /// exactly [`GrantResult::encoded_len`] for the grant's page count.
    pub fn get_grant_result(&self, client: ClientId, request_id: u64, result_len: usize) -> Result<GrantResult> {
        let id = RequestId::grant(client, request_id);
        trace!("> {}", id);

        let result = self.queue.peek(&id, |op| match op {
            PendingOp::Grant(context) => {
                let expected = GrantResult::encoded_len(context.pages());
                if result_len != expected {
                    return Err(VeilError::InvalidSize {
                        expected,
                        actual: result_len,
                    });
                }
                let references = context
                    .grants
                    .iter()
                    .map(|entry| self.bus.gnttab.get_reference(entry))
                    .collect();
                Ok(GrantResult {
                    address: context.user_va,
                    references,
                })
            }
            PendingOp::Map(_) => Err(VeilError::not_found(format!("{id}"))),
        });

        result.unwrap_or_else(|| Err(VeilError::not_found(format!("{id}"))))
    }

    /// Revoke a pending grant and complete its request with success
    pub fn revoke_foreign_access(&self, client: ClientId, request_id: u64) -> Result<()> {
        let id = RequestId::grant(client, request_id);
        debug!("> {}", id);

        let (op, completion) = self
            .queue
            .remove(&id)
            .ok_or_else(|| VeilError::not_found(format!("{id}")))?;

        self.free_op(op);
        completion.complete(Status::Success);
        Ok(())
    }

    pub(super) fn free_grant(&self, context: GrantContext) {
        trace!("free {} shared with {}", context.id, context.remote);
        self.notify_peer(&context.notify, &context.buffer);
        self.bus
            .memory
            .unmap_user(context.id.client, context.user_va, &context.buffer);
        self.revoke_all(context.grants);
        self.bus.memory.free(context.buffer);
    }

    /// Undo a fully built grant that never became visible
    pub(super) fn unwind_grant(&self, context: GrantContext) {
        self.bus
            .memory
            .unmap_user(context.id.client, context.user_va, &context.buffer);
        self.revoke_all(context.grants);
        self.bus.memory.free(context.buffer);
    }

    /// Revoke in reverse order of sharing
    fn revoke_all(&self, mut grants: Vec<GrantEntry>) {
        while let Some(entry) = grants.pop() {
            let reference = entry.reference();
            if let Err(e) = self.bus.gnttab.revoke_foreign_access(self.cache, entry) {
                invariant_violation(&format!("grant {} could not be revoked", reference.0), &e);
            }
        }
    }

    pub(super) fn unwind_op(&self, op: PendingOp) {
        match op {
            PendingOp::Grant(context) => self.unwind_grant(context),
            PendingOp::Map(context) => self.unwind_map(context),
        }
    }
}
