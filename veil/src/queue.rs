//! Correlation queue of parked grant and map operations
//!
//! A grant or map request that succeeds does not complete: its context is
//! parked here together with the completion the caller waits on. A later
//! revoke/unmap, or a cancellation, removes it again. Removal is the only
//! way out, so whichever path removes an entry first owns its teardown and
//! every other path sees not-found.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::Status;
use crate::gnttab::{GrantContext, MapContext};
use crate::queue_lock;
use crate::sync::QueueLock;
use crate::types::{ClientId, OperationKind, RequestId};

/// Context owned by a parked operation
pub enum PendingOp {
    Grant(GrantContext),
    Map(MapContext),
}

impl PendingOp {
    pub fn kind(&self) -> OperationKind {
        match self {
            PendingOp::Grant(_) => OperationKind::Grant,
            PendingOp::Map(_) => OperationKind::Map,
        }
    }
}

/// One-shot completion of a parked request
#[derive(Debug, Default)]
pub struct Completion {
    status: Mutex<Option<Status>>,
    cond: Condvar,
}

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Complete with `status`; returns false if already completed
    pub fn complete(&self, status: Status) -> bool {
        let mut slot = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return false;
        }
        *slot = Some(status);
        self.cond.notify_all();
        true
    }

    pub fn status(&self) -> Option<Status> {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn wait(&self) -> Status {
        let slot = self.status.lock().unwrap_or_else(|e| e.into_inner());
        let slot = self
            .cond
            .wait_while(slot, |s| s.is_none())
            .unwrap_or_else(|e| e.into_inner());
        slot.unwrap_or(Status::Cancelled)
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Status> {
        let slot = self.status.lock().unwrap_or_else(|e| e.into_inner());
        let (slot, _) = self
            .cond
            .wait_timeout_while(slot, timeout, |s| s.is_none())
            .unwrap_or_else(|e| e.into_inner());
        *slot
    }
}

/// Caller's view of a request that returned pending
#[derive(Debug, Clone)]
pub struct PendingRequest {
    id: RequestId,
    completion: Arc<Completion>,
}

impl PendingRequest {
    pub fn new(id: RequestId, completion: Arc<Completion>) -> Self {
        Self { id, completion }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn status(&self) -> Option<Status> {
        self.completion.status()
    }

    pub fn is_complete(&self) -> bool {
        self.completion.status().is_some()
    }

    pub fn wait(&self) -> Status {
        self.completion.wait()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Status> {
        self.completion.wait_timeout(timeout)
    }
}

struct Parked {
    op: PendingOp,
    completion: Arc<Completion>,
}

pub struct PendingQueue {
    entries: QueueLock<HashMap<RequestId, Parked>>,
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingQueue {
    pub fn new() -> Self {
        Self {
            entries: queue_lock!(HashMap::new(), "PENDING_QUEUE"),
        }
    }

    /// Park `op` under `id`
    ///
    /// On a duplicate id the operation is handed back untouched.
    pub fn insert(&self, id: RequestId, op: PendingOp) -> Result<PendingRequest, PendingOp> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&id) {
            return Err(op);
        }

        let completion = Arc::new(Completion::new());
        entries.insert(
            id,
            Parked {
                op,
                completion: completion.clone(),
            },
        );
        Ok(PendingRequest::new(id, completion))
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.entries.lock().contains_key(id)
    }

    /// Read a parked operation in place, under the queue lock
    pub fn peek<R>(&self, id: &RequestId, f: impl FnOnce(&PendingOp) -> R) -> Option<R> {
        let entries = self.entries.lock();
        entries.get(id).map(|parked| f(&parked.op))
    }

    /// Take a parked operation out, together with its completion
    pub fn remove(&self, id: &RequestId) -> Option<(PendingOp, Arc<Completion>)> {
        self.entries
            .lock()
            .remove(id)
            .map(|parked| (parked.op, parked.completion))
    }

    /// Ids of every operation `client` has parked
    pub fn ids_for(&self, client: ClientId) -> Vec<RequestId> {
        self.entries
            .lock()
            .keys()
            .filter(|id| id.client == client)
            .copied()
            .collect()
    }

    /// Take every parked operation out
    pub fn drain(&self) -> Vec<(PendingOp, Arc<Completion>)> {
        self.entries
            .lock()
            .drain()
            .map(|(_, parked)| (parked.op, parked.completion))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_completion_first_wins() {
        let completion = Completion::new();
        assert!(completion.complete(Status::Success));
        assert!(!completion.complete(Status::Cancelled));
        assert_eq!(completion.status(), Some(Status::Success));
        assert_eq!(completion.wait(), Status::Success);
    }

    #[test]
    fn test_completion_wakes_waiter() {
        let completion = Arc::new(Completion::new());
        let request = PendingRequest::new(RequestId::grant(ClientId(1), 1), completion.clone());
        let waiter = thread::spawn(move || request.wait_timeout(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(10));
        completion.complete(Status::Cancelled);
        assert_eq!(waiter.join().unwrap(), Some(Status::Cancelled));
    }

    #[test]
    fn test_wait_timeout_expires() {
        let completion = Completion::new();
        assert_eq!(completion.wait_timeout(Duration::from_millis(5)), None);
    }
}
