//! # Bus Abstraction Traits
//!
//! Veil talks to the hypervisor bus through the traits in this module:
//! the key/value store, the event channel service, the grant table service,
//! memory management for the buffers shared through grants, and the handle
//! table that resolves client event handles.
//!
//! ## Testing Strategy
//!
//! The in-process [`Loopback`] implements every trait. Tests and the `veild`
//! development daemon run the full core against it; a real platform layer
//! plugs in by implementing the same traits.

pub mod loopback;

pub use loopback::{FaultPoint, Loopback, LoopbackStats};

use std::sync::Arc;

use thiserror::Error;

use crate::error::Status;
use crate::event::UserEvent;
use crate::types::{
    ClientId, DomainId, EventHandle, GrantRef, LocalPort, Pfn, StorePermission, UserVa,
};

/// Result type for collaborator calls
pub type BusResult<T> = std::result::Result<T, BusError>;

/// Collaborator failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("object not found")]
    NotFound,

    #[error("out of resources")]
    OutOfResources,

    #[error("rejected by the bus (code {code})")]
    Rejected { code: i32 },

    #[error("invalid argument")]
    InvalidArgument,

    #[error("bus unavailable")]
    Unavailable,
}

impl BusError {
    pub fn status(&self) -> Status {
        match self {
            BusError::NotFound => Status::NotFound,
            BusError::OutOfResources => Status::ResourceExhausted,
            BusError::InvalidArgument => Status::InvalidParameter,
            BusError::Rejected { .. } | BusError::Unavailable => Status::Unsuccessful,
        }
    }
}

/// Handle of a registered store watch, owned by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreWatchId(pub u64);

/// Key/value namespace shared with other domains
pub trait StoreService: Send + Sync {
    fn read(&self, path: &str) -> BusResult<String>;

    fn write(&self, path: &str, value: &str) -> BusResult<()>;

    /// Names of the children of `path`
    fn directory(&self, path: &str) -> BusResult<Vec<String>>;

    fn remove(&self, path: &str) -> BusResult<()>;

    fn set_permissions(&self, path: &str, permissions: &[StorePermission]) -> BusResult<()>;

    /// Set `event` whenever `path` or anything below it changes
    fn watch_add(&self, path: &str, event: Arc<UserEvent>) -> BusResult<StoreWatchId>;

    fn watch_remove(&self, watch: StoreWatchId) -> BusResult<()>;
}

/// Opaque handle of an open event channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle(pub u64);

/// How a channel is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Allocate a fresh port the remote domain can bind to
    Unbound { remote: DomainId },
    /// Connect to a port the remote domain allocated
    Interdomain { remote: DomainId, remote_port: LocalPort },
}

/// Signal callback registered with a channel
///
/// Invoked in interrupt context with the index of the processor that took
/// the signal. It must not block. Delivery masks the channel; it stays
/// masked until someone calls [`EventChannelService::unmask`].
pub type SignalHandler = Arc<dyn Fn(usize) -> bool + Send + Sync>;

/// Event channel service
pub trait EventChannelService: Send + Sync {
    /// Open a channel; it starts masked
    fn open(&self, kind: ChannelKind, handler: SignalHandler) -> BusResult<ChannelHandle>;

    fn local_port(&self, channel: ChannelHandle) -> BusResult<LocalPort>;

    /// Re-arm delivery; a signal that arrived while masked is delivered now
    fn unmask(&self, channel: ChannelHandle) -> BusResult<()>;

    /// Signal the remote end
    fn send(&self, channel: ChannelHandle) -> BusResult<()>;

    /// Stop delivery
    ///
    /// When this returns the handler is not running and will not run again.
    fn close(&self, channel: ChannelHandle);
}

/// Cache lock callbacks the grant table invokes around cache bookkeeping
pub trait CacheLock: Send + Sync {
    fn acquire(&self);
    fn release(&self);
}

/// Handle of a grant cache created at device start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GrantCache(pub u64);

/// One page shared with a foreign domain
///
/// Owned by whoever holds it; revoking consumes it.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct GrantEntry {
    id: u64,
    reference: GrantRef,
}

impl GrantEntry {
    pub fn new(id: u64, reference: GrantRef) -> Self {
        Self { id, reference }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn reference(&self) -> GrantRef {
        self.reference
    }
}

/// Hypervisor-side mapping of foreign pages
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct ForeignMapping {
    pub id: u64,
    pub pages: u32,
}

/// Grant table service
pub trait GrantTableService: Send + Sync {
    fn create_cache(&self, name: &str, lock: Arc<dyn CacheLock>) -> BusResult<GrantCache>;

    fn destroy_cache(&self, cache: GrantCache);

    fn permit_foreign_access(
        &self,
        cache: GrantCache,
        domain: DomainId,
        pfn: Pfn,
        readonly: bool,
    ) -> BusResult<GrantEntry>;

    fn revoke_foreign_access(&self, cache: GrantCache, entry: GrantEntry) -> BusResult<()>;

    fn get_reference(&self, entry: &GrantEntry) -> GrantRef;

    fn map_foreign_pages(
        &self,
        domain: DomainId,
        references: &[GrantRef],
        readonly: bool,
    ) -> BusResult<ForeignMapping>;

    fn unmap_foreign_pages(&self, mapping: ForeignMapping) -> BusResult<()>;
}

/// Kernel-owned run of pages, with the frame list that describes it
#[derive(Debug, PartialEq, Eq)]
pub struct KernelBuffer {
    pub id: u64,
    pub frames: Vec<Pfn>,
}

/// Memory management used by grant and map contexts
pub trait MemoryOps: Send + Sync {
    /// Allocate `pages` zeroed pages
    fn allocate(&self, pages: u32) -> BusResult<KernelBuffer>;

    /// Zero and release a buffer from [`MemoryOps::allocate`]
    fn free(&self, buffer: KernelBuffer);

    /// Map a foreign mapping into kernel space
    fn map_io_space(&self, mapping: &ForeignMapping) -> BusResult<KernelBuffer>;

    fn unmap_io_space(&self, buffer: KernelBuffer);

    /// Map `buffer` into the address space of `client`
    fn map_user(&self, client: ClientId, buffer: &KernelBuffer) -> BusResult<UserVa>;

    /// Remove the mapping of `buffer` at `va` from `client`'s address space
    ///
    /// Callable from any thread; the client is named explicitly.
    fn unmap_user(&self, client: ClientId, va: UserVa, buffer: &KernelBuffer);

    fn poke(&self, buffer: &KernelBuffer, offset: u64, value: u8);
}

/// Resolves client handles to kernel objects
pub trait HandleOps: Send + Sync {
    fn reference_event(&self, client: ClientId, handle: EventHandle) -> BusResult<Arc<UserEvent>>;
}

/// Every collaborator the core needs
#[derive(Clone)]
pub struct Bus {
    pub store: Arc<dyn StoreService>,
    pub evtchn: Arc<dyn EventChannelService>,
    pub gnttab: Arc<dyn GrantTableService>,
    pub memory: Arc<dyn MemoryOps>,
    pub handles: Arc<dyn HandleOps>,
}

impl Bus {
    /// Wire every collaborator to the same loopback instance
    pub fn loopback(loopback: Arc<Loopback>) -> Self {
        Self {
            store: loopback.clone(),
            evtchn: loopback.clone(),
            gnttab: loopback.clone(),
            memory: loopback.clone(),
            handles: loopback,
        }
    }
}
