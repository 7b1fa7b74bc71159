//! Event channel registry
//!
//! Bridges a bus signal into a user event through two stages. The signal
//! handler runs in interrupt context: it only checks liveness and posts
//! the channel to the deferred worker of the signalling processor. The
//! deferred task checks liveness again, sets the user event and re-arms
//! the channel (delivery leaves it masked).
//!
//! Teardown order is what keeps the event from being touched after close:
//! mark inactive, close on the bus (no handler runs after this), then
//! barrier through every deferred worker before the context is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use tracing::{debug, error, trace, warn};

use crate::bus::{ChannelHandle, ChannelKind, EventChannelService, HandleOps, SignalHandler};
use crate::error::{Result, VeilError};
use crate::event::UserEvent;
use crate::list_lock;
use crate::sync::ListLock;
use crate::types::{ClientId, DomainId, EventHandle, LocalPort};
use crate::worker::DeferredPool;

/// Deferred pool carrying signalled channels
pub type ChannelPool = DeferredPool<Arc<EventChannel>>;

/// One bound channel
pub struct EventChannel {
    client: ClientId,
    event: Arc<UserEvent>,
    channel: OnceLock<ChannelHandle>,
    port: OnceLock<LocalPort>,
    active: AtomicBool,
    evtchn: Arc<dyn EventChannelService>,
}

impl EventChannel {
    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn port(&self) -> Option<LocalPort> {
        self.port.get().copied()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Deferred stage: set the user event and re-arm
    pub(crate) fn deliver(&self) {
        if !self.is_active() {
            return;
        }

        self.event.set();

        if let Some(channel) = self.channel.get() {
            if let Err(e) = self.evtchn.unmask(*channel) {
                trace!("unmask after delivery failed: {}", e);
            }
        }
    }
}

/// Interrupt stage
fn signal_handler(channel: Weak<EventChannel>, pool: Weak<ChannelPool>) -> SignalHandler {
    Arc::new(move |cpu| {
        let Some(channel) = channel.upgrade() else {
            return false;
        };
        if !channel.is_active() {
            return true;
        }
        let Some(pool) = pool.upgrade() else {
            return true;
        };

        if let Err(channel) = pool.try_post(cpu, channel) {
            warn!(
                "deferred queue full on cpu {}, dropping signal for {:?}",
                cpu,
                channel.port()
            );
        }
        true
    })
}

pub struct ChannelRegistry {
    evtchn: Arc<dyn EventChannelService>,
    handles: Arc<dyn HandleOps>,
    pool: Arc<ChannelPool>,
    channels: ListLock<HashMap<LocalPort, Arc<EventChannel>>>,
}

impl ChannelRegistry {
    pub fn new(
        evtchn: Arc<dyn EventChannelService>,
        handles: Arc<dyn HandleOps>,
        workers: usize,
        depth: usize,
    ) -> std::io::Result<Self> {
        let pool = DeferredPool::spawn(workers, depth, |channel: Arc<EventChannel>| channel.deliver())?;
        debug!("channel registry using {} deferred workers", pool.len());

        Ok(Self {
            evtchn,
            handles,
            pool: Arc::new(pool),
            channels: list_lock!(HashMap::new(), "EVTCHN_LIST"),
        })
    }

    pub fn bind_unbound(
        &self,
        client: ClientId,
        remote: DomainId,
        mask: bool,
        event: EventHandle,
    ) -> Result<LocalPort> {
        debug!("> RemoteDomain {}, Mask {}, {}", remote, mask, client);
        self.bind(client, ChannelKind::Unbound { remote }, mask, event)
    }

    pub fn bind_interdomain(
        &self,
        client: ClientId,
        remote: DomainId,
        remote_port: LocalPort,
        mask: bool,
        event: EventHandle,
    ) -> Result<LocalPort> {
        debug!(
            "> RemoteDomain {}, RemotePort {}, Mask {}, {}",
            remote, remote_port, mask, client
        );
        self.bind(client, ChannelKind::Interdomain { remote, remote_port }, mask, event)
    }

    fn bind(&self, client: ClientId, kind: ChannelKind, mask: bool, event: EventHandle) -> Result<LocalPort> {
        let event = self.handles.reference_event(client, event).map_err(|e| {
            error!("event handle for {} rejected: {}", client, e);
            VeilError::from(e)
        })?;

        let context = Arc::new(EventChannel {
            client,
            event,
            channel: OnceLock::new(),
            port: OnceLock::new(),
            active: AtomicBool::new(false),
            evtchn: self.evtchn.clone(),
        });

        let handler = signal_handler(Arc::downgrade(&context), Arc::downgrade(&self.pool));
        let channel = self.evtchn.open(kind, handler).map_err(|e| {
            error!("channel open failed: {}", e);
            VeilError::from(e)
        })?;

        let port = match self.evtchn.local_port(channel) {
            Ok(port) => port,
            Err(e) => {
                error!("no local port for new channel: {}", e);
                self.evtchn.close(channel);
                return Err(e.into());
            }
        };

        let _ = context.channel.set(channel);
        let _ = context.port.set(port);
        context.active.store(true, Ordering::Release);

        if !mask {
            if let Err(e) = self.evtchn.unmask(channel) {
                warn!("initial unmask of {} failed: {}", port, e);
            }
        }

        // visible to close only once fully armed
        self.channels.lock().insert(port, context);

        debug!("< LocalPort {}", port);
        Ok(port)
    }

    fn find(&self, port: LocalPort, client: Option<ClientId>) -> Option<Arc<EventChannel>> {
        self.channels
            .lock()
            .get(&port)
            .filter(|c| client.map_or(true, |owner| c.client == owner))
            .cloned()
    }

    /// Signal the remote end of `port`
    ///
    /// `client` restricts the lookup to channels that client owns; `None`
    /// matches any owner (used when a grant or map is torn down).
    pub fn notify(&self, port: LocalPort, client: Option<ClientId>) -> Result<()> {
        let context = self
            .find(port, client)
            .ok_or_else(|| VeilError::not_found(format!("no channel on {port}")))?;

        let channel = context
            .channel
            .get()
            .copied()
            .ok_or_else(|| VeilError::not_found(format!("{port} is not open")))?;

        self.evtchn.send(channel)?;
        Ok(())
    }

    pub fn unmask(&self, port: LocalPort, client: ClientId) -> Result<()> {
        trace!("> LocalPort {}, {}", port, client);
        let context = self
            .find(port, Some(client))
            .ok_or_else(|| VeilError::invalid(format!("no channel on {port} for {client}")))?;

        if let Some(channel) = context.channel.get() {
            self.evtchn.unmask(*channel)?;
        }
        Ok(())
    }

    pub fn close(&self, port: LocalPort, client: ClientId) -> Result<()> {
        debug!("> LocalPort {}, {}", port, client);
        let context = {
            let mut channels = self.channels.lock();
            let owned = channels.get(&port).map_or(false, |c| c.client == client);
            if owned {
                channels.remove(&port)
            } else {
                None
            }
        };

        let context = context.ok_or_else(|| VeilError::not_found(format!("no channel on {port} for {client}")))?;
        self.teardown(context);
        Ok(())
    }

    /// Remove every channel `client` owns, without tearing them down
    pub fn detach_owned_by(&self, client: ClientId) -> Vec<Arc<EventChannel>> {
        let mut channels = self.channels.lock();
        let ports: Vec<LocalPort> = channels
            .iter()
            .filter(|(_, c)| c.client == client)
            .map(|(port, _)| *port)
            .collect();
        ports.into_iter().filter_map(|port| channels.remove(&port)).collect()
    }

    /// Stop delivery and release a detached channel
    ///
    /// Must be called without any registry lock held and never from a
    /// deferred worker.
    pub fn teardown(&self, context: Arc<EventChannel>) {
        debug!("free {:?} ({})", context.port(), context.client);
        context.active.store(false, Ordering::Release);

        if let Some(channel) = context.channel.get() {
            self.evtchn.close(*channel);
        }

        // a signal may already be queued
        self.pool.flush();
    }

    pub fn ports_of(&self, client: ClientId) -> Vec<LocalPort> {
        let mut ports: Vec<LocalPort> = self
            .channels
            .lock()
            .values()
            .filter(|c| c.client == client)
            .filter_map(|c| c.port())
            .collect();
        ports.sort();
        ports
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }
}
