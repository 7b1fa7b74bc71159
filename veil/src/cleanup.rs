//! Client teardown and cancellation of parked requests

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Status;
use crate::evtchn::ChannelRegistry;
use crate::gnttab::GrantTable;
use crate::queue::{Completion, PendingOp};
use crate::types::{ClientId, RequestId};
use crate::watch::WatchRegistry;
use crate::worker::Worker;

/// What a client cleanup released
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub watches: usize,
    pub channels: usize,
}

type CancelItem = (PendingOp, Arc<Completion>);

pub struct CleanupCoordinator {
    gnttab: Arc<GrantTable>,
    channels: Arc<ChannelRegistry>,
    watches: Arc<WatchRegistry>,
    worker: Worker<CancelItem>,
}

impl CleanupCoordinator {
    pub fn new(
        gnttab: Arc<GrantTable>,
        channels: Arc<ChannelRegistry>,
        watches: Arc<WatchRegistry>,
        depth: usize,
    ) -> std::io::Result<Self> {
        let table = gnttab.clone();
        let worker = Worker::spawn("veil-cleanup", depth, move |(op, completion): CancelItem| {
            let kind = op.kind();
            table.free_op(op);
            completion.complete(Status::Cancelled);
            debug!("cancelled {:?} torn down", kind);
        })?;

        Ok(Self {
            gnttab,
            channels,
            watches,
            worker,
        })
    }

    /// Cancel a parked grant or map
    ///
    /// Returns false if the request is no longer parked; a revoke or unmap
    /// got there first and owns the completion.
    pub fn cancel(&self, id: RequestId) -> bool {
        let Some(item) = self.gnttab.queue().remove(&id) else {
            debug!("cancel of {} lost the race", id);
            return false;
        };

        debug!("cancel {}", id);
        if let Err((op, completion)) = self.worker.post(item) {
            warn!("cleanup worker gone, tearing down {} inline", id);
            self.gnttab.free_op(op);
            completion.complete(Status::Cancelled);
        }
        true
    }

    /// Cancel every parked request of `client`; returns how many
    pub fn cancel_client(&self, client: ClientId) -> usize {
        self.gnttab
            .queue()
            .ids_for(client)
            .into_iter()
            .filter(|id| self.cancel(*id))
            .count()
    }

    /// Release the watches and channels `client` owns
    ///
    /// Parked grants and maps are left alone; they go away through revoke,
    /// unmap or cancellation.
    pub fn cleanup_client(&self, client: ClientId) -> CleanupReport {
        let watches = self.watches.remove_all(client);

        let detached = self.channels.detach_owned_by(client);
        let channels = detached.len();
        for channel in detached {
            self.channels.teardown(channel);
        }

        if watches > 0 || channels > 0 {
            info!("{} cleaned up: {} watches, {} channels", client, watches, channels);
        }
        CleanupReport { watches, channels }
    }

    /// Wait for every queued cancellation to finish
    pub fn flush(&self) {
        self.worker.flush();
    }
}
