//! In-process loopback bus
//!
//! Implements every collaborator trait inside one process. Frames are
//! stored sparsely, so large grants only cost memory for the pages that
//! are actually touched. Grants offered to the loopback's own domain can
//! be mapped back, which aliases the granted frames; that is how tests
//! and `veild` exercise both ends of a shared ring.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use spin::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use super::{
    BusError, BusResult, CacheLock, ChannelHandle, ChannelKind, EventChannelService, ForeignMapping,
    GrantCache, GrantEntry, GrantTableService, HandleOps, KernelBuffer, MemoryOps, SignalHandler,
    StoreService, StoreWatchId,
};
use crate::config::LoopbackConfig;
use crate::event::UserEvent;
use crate::types::{
    ClientId, DomainId, EventHandle, GrantRef, LocalPort, Pfn, StorePermission, UserVa, PAGE_SIZE,
};

/// Grant table status codes reported through [`BusError::Rejected`]
const GNTST_BAD_GNTREF: i32 = -4;
const GNTST_PERMISSION_DENIED: i32 = -8;
const EBUSY: i32 = -16;

/// First grant reference handed out; lower ones are reserved by the bus
const FIRST_GRANT_REF: u32 = 8;

/// Base of every client arena
const USER_ARENA_BASE: u64 = 0x1000_0000;

/// Points where a collaborator call can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultPoint {
    Allocate,
    PermitForeignAccess,
    RevokeForeignAccess,
    MapUser,
    MapForeignPages,
    UnmapForeignPages,
    MapIoSpace,
    ChannelOpen,
    WatchAdd,
    WatchRemove,
}

/// Accounting snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopbackStats {
    pub allocated_pages: u64,
    pub active_grants: u64,
    pub foreign_mappings: u64,
    pub io_mappings: u64,
    pub user_mappings: u64,
    pub open_channels: u64,
    pub watches: u64,
    pub events: u64,
    /// Misuse detected by the loopback (double free, freeing granted frames, ...)
    pub violations: u64,
}

struct MemState {
    next_pfn: u64,
    allocated_pages: u64,
    owned: HashMap<u64, u32>,
    io: HashMap<u64, u32>,
    frames: HashMap<Pfn, Box<[u8]>>,
    arenas: HashMap<ClientId, Arena>,
}

struct Arena {
    next_va: u64,
    regions: BTreeMap<u64, Region>,
}

struct Region {
    buffer_id: u64,
    frames: Vec<Pfn>,
}

struct GrantRecord {
    entry_id: u64,
    domain: DomainId,
    pfn: Pfn,
    readonly: bool,
    maps: u32,
}

struct MappingRecord {
    references: Vec<GrantRef>,
    frames: Vec<Pfn>,
}

struct GrantState {
    caches: HashMap<u64, (String, Arc<dyn CacheLock>)>,
    next_ref: u32,
    entries: HashMap<GrantRef, GrantRecord>,
    granted_pfns: HashMap<Pfn, u32>,
    mappings: HashMap<u64, MappingRecord>,
    revocations: Vec<GrantRef>,
}

struct PortRecord {
    port: LocalPort,
    kind: ChannelKind,
    peer: Mutex<Option<LocalPort>>,
    masked: AtomicBool,
    pending: AtomicBool,
    sent: AtomicU64,
    handler: RwLock<Option<SignalHandler>>,
}

struct ChannelState {
    next_port: u32,
    by_handle: HashMap<u64, Arc<PortRecord>>,
    by_port: HashMap<LocalPort, u64>,
}

struct StoreNode {
    value: String,
    permissions: Vec<StorePermission>,
}

struct StoreState {
    nodes: BTreeMap<String, StoreNode>,
    watches: HashMap<u64, (String, Arc<UserEvent>)>,
}

/// In-process implementation of every bus trait
pub struct Loopback {
    domain: DomainId,
    processors: usize,
    memory_limit_pages: u64,
    next_id: AtomicU64,
    mem: Mutex<MemState>,
    grants: Mutex<GrantState>,
    channels: Mutex<ChannelState>,
    store: Mutex<StoreState>,
    events: Mutex<HashMap<(ClientId, EventHandle), Arc<UserEvent>>>,
    faults: Mutex<HashMap<FaultPoint, u32>>,
    violations: AtomicU64,
}

impl Loopback {
    pub fn new(domain: DomainId, memory_limit_pages: u64, processors: usize) -> Self {
        Self {
            domain,
            processors: processors.max(1),
            memory_limit_pages,
            next_id: AtomicU64::new(1),
            mem: Mutex::new(MemState {
                next_pfn: 0x100,
                allocated_pages: 0,
                owned: HashMap::new(),
                io: HashMap::new(),
                frames: HashMap::new(),
                arenas: HashMap::new(),
            }),
            grants: Mutex::new(GrantState {
                caches: HashMap::new(),
                next_ref: FIRST_GRANT_REF,
                entries: HashMap::new(),
                granted_pfns: HashMap::new(),
                mappings: HashMap::new(),
                revocations: Vec::new(),
            }),
            channels: Mutex::new(ChannelState {
                next_port: 1,
                by_handle: HashMap::new(),
                by_port: HashMap::new(),
            }),
            store: Mutex::new(StoreState {
                nodes: BTreeMap::new(),
                watches: HashMap::new(),
            }),
            events: Mutex::new(HashMap::new()),
            faults: Mutex::new(HashMap::new()),
            violations: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &LoopbackConfig) -> Self {
        Self::new(DomainId(config.domain_id), config.memory_limit_pages, config.processors)
    }

    pub fn domain(&self) -> DomainId {
        self.domain
    }

    pub fn processors(&self) -> usize {
        self.processors
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn violation(&self, what: &str) {
        warn!("loopback: {}", what);
        self.violations.fetch_add(1, Ordering::AcqRel);
    }

    // ---- fault injection ----

    /// Make the call at `point` fail after `after` more successful calls
    pub fn fail_after(&self, point: FaultPoint, after: u32) {
        self.faults.lock().insert(point, after);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    fn should_fail(&self, point: FaultPoint) -> bool {
        let mut faults = self.faults.lock();
        let remaining = faults.get(&point).copied();
        match remaining {
            Some(0) => {
                faults.remove(&point);
                debug!("loopback: injected fault at {:?}", point);
                true
            }
            Some(n) => {
                faults.insert(point, n - 1);
                false
            }
            None => false,
        }
    }

    // ---- accounting ----

    pub fn stats(&self) -> LoopbackStats {
        let (allocated_pages, io_mappings, user_mappings) = {
            let mem = self.mem.lock();
            let user = mem.arenas.values().map(|a| a.regions.len() as u64).sum();
            (mem.allocated_pages, mem.io.len() as u64, user)
        };
        let (active_grants, foreign_mappings) = {
            let grants = self.grants.lock();
            (grants.entries.len() as u64, grants.mappings.len() as u64)
        };

        LoopbackStats {
            allocated_pages,
            active_grants,
            foreign_mappings,
            io_mappings,
            user_mappings,
            open_channels: self.channels.lock().by_handle.len() as u64,
            watches: self.store.lock().watches.len() as u64,
            events: self.events.lock().len() as u64,
            violations: self.violations.load(Ordering::Acquire),
        }
    }

    /// Drain the log of revoked references, in revocation order
    pub fn take_revocations(&self) -> Vec<GrantRef> {
        std::mem::take(&mut self.grants.lock().revocations)
    }

    // ---- events ----

    /// Create an event object owned by `client`
    pub fn create_event(&self, client: ClientId) -> (EventHandle, Arc<UserEvent>) {
        let handle = EventHandle(self.next_id());
        let event = Arc::new(UserEvent::new());
        self.events.lock().insert((client, handle), event.clone());
        (handle, event)
    }

    pub fn close_event(&self, client: ClientId, handle: EventHandle) -> BusResult<()> {
        self.events
            .lock()
            .remove(&(client, handle))
            .map(|_| ())
            .ok_or(BusError::NotFound)
    }

    /// Drop every handle `client` still holds
    pub fn release_client(&self, client: ClientId) {
        self.events.lock().retain(|(owner, _), _| *owner != client);
    }

    // ---- user address space access ----

    fn with_region<R>(
        &self,
        client: ClientId,
        va: UserVa,
        len: usize,
        f: impl FnOnce(&mut MemState, Vec<Pfn>, u64) -> R,
    ) -> BusResult<R> {
        let mut mem = self.mem.lock();
        let arena = mem.arenas.get(&client).ok_or(BusError::NotFound)?;
        let (base, region) = arena
            .regions
            .range(..=va.0)
            .next_back()
            .ok_or(BusError::NotFound)?;

        let offset = va.0 - base;
        let size = region.frames.len() as u64 * PAGE_SIZE as u64;
        u64::try_from(len)
            .ok()
            .and_then(|len| offset.checked_add(len))
            .filter(|end| *end <= size)
            .ok_or(BusError::InvalidArgument)?;
        let frames = region.frames.clone();
        Ok(f(&mut *mem, frames, offset))
    }

    /// Write `data` through a client mapping
    pub fn user_write(&self, client: ClientId, va: UserVa, data: &[u8]) -> BusResult<()> {
        self.with_region(client, va, data.len(), |mem, frames, offset| {
            for (i, byte) in data.iter().enumerate() {
                write_byte(&mut mem.frames, &frames, offset + i as u64, *byte);
            }
        })
    }

    /// Read `len` bytes through a client mapping
    pub fn user_read(&self, client: ClientId, va: UserVa, len: usize) -> BusResult<Vec<u8>> {
        self.with_region(client, va, len, |mem, frames, offset| {
            (0..len)
                .map(|i| read_byte(&mem.frames, &frames, offset + i as u64))
                .collect()
        })
    }

    // ---- event channel helpers ----

    fn port_record(&self, channel: ChannelHandle) -> BusResult<Arc<PortRecord>> {
        self.channels
            .lock()
            .by_handle
            .get(&channel.0)
            .cloned()
            .ok_or(BusError::NotFound)
    }

    fn record_for_port(&self, port: LocalPort) -> Option<Arc<PortRecord>> {
        let channels = self.channels.lock();
        channels
            .by_port
            .get(&port)
            .and_then(|handle| channels.by_handle.get(handle))
            .cloned()
    }

    /// Raise a signal on a port; masked ports latch it as pending
    fn raise(&self, record: &PortRecord, cpu: usize) {
        record.pending.store(true, Ordering::Release);
        if record.masked.swap(true, Ordering::AcqRel) {
            trace!("loopback: {} masked, signal latched", record.port);
            return;
        }
        record.pending.store(false, Ordering::Release);

        let handler = record.handler.read();
        if let Some(handler) = handler.as_ref() {
            trace!("loopback: deliver {} on cpu {}", record.port, cpu);
            handler(cpu % self.processors);
        }
    }

    /// Signal `port` as if the remote end had sent on it
    pub fn inject(&self, port: LocalPort, cpu: usize) -> BusResult<()> {
        let record = self.record_for_port(port).ok_or(BusError::NotFound)?;
        self.raise(&record, cpu);
        Ok(())
    }

    /// Number of sends issued on `port`
    pub fn sent_count(&self, port: LocalPort) -> u64 {
        self.record_for_port(port)
            .map(|r| r.sent.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn is_masked(&self, port: LocalPort) -> Option<bool> {
        self.record_for_port(port).map(|r| r.masked.load(Ordering::Acquire))
    }

    // ---- store helpers ----

    fn normalize(&self, path: &str) -> BusResult<String> {
        if path.is_empty() {
            return Err(BusError::InvalidArgument);
        }
        let absolute = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/local/domain/{}/{}", self.domain.0, path)
        };
        let trimmed = absolute.trim_end_matches('/');
        if trimmed.is_empty() {
            Ok("/".to_string())
        } else {
            Ok(trimmed.to_string())
        }
    }

    fn fire_watches(store: &StoreState, changed: &str) {
        for (path, event) in store.watches.values() {
            if path_covers(path, changed) {
                event.set();
            }
        }
    }
}

fn path_covers(watch: &str, changed: &str) -> bool {
    watch == "/"
        || changed == watch
        || (changed.starts_with(watch) && changed.as_bytes().get(watch.len()) == Some(&b'/'))
}

fn child_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{path}/")
    }
}

fn parent_of(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) if path.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(idx) => Some(&path[..idx]),
    }
}

fn read_byte(frames: &HashMap<Pfn, Box<[u8]>>, list: &[Pfn], offset: u64) -> u8 {
    let page = (offset / PAGE_SIZE as u64) as usize;
    let within = (offset % PAGE_SIZE as u64) as usize;
    list.get(page)
        .and_then(|pfn| frames.get(pfn))
        .map(|frame| frame[within])
        .unwrap_or(0)
}

fn write_byte(frames: &mut HashMap<Pfn, Box<[u8]>>, list: &[Pfn], offset: u64, value: u8) {
    let page = (offset / PAGE_SIZE as u64) as usize;
    let within = (offset % PAGE_SIZE as u64) as usize;
    if let Some(pfn) = list.get(page) {
        let frame = frames
            .entry(*pfn)
            .or_insert_with(|| vec![0u8; PAGE_SIZE].into_boxed_slice());
        frame[within] = value;
    }
}

impl MemoryOps for Loopback {
    fn allocate(&self, pages: u32) -> BusResult<KernelBuffer> {
        if self.should_fail(FaultPoint::Allocate) {
            return Err(BusError::OutOfResources);
        }

        let mut mem = self.mem.lock();
        if mem.allocated_pages + pages as u64 > self.memory_limit_pages {
            debug!(
                "loopback: allocation of {} pages over limit ({} in use, limit {})",
                pages, mem.allocated_pages, self.memory_limit_pages
            );
            return Err(BusError::OutOfResources);
        }

        let start = mem.next_pfn;
        mem.next_pfn += pages as u64;
        mem.allocated_pages += pages as u64;

        let id = self.next_id();
        mem.owned.insert(id, pages);
        trace!("loopback: allocated buffer {} ({} pages at pfn {:#x})", id, pages, start);

        Ok(KernelBuffer {
            id,
            frames: (start..start + pages as u64).map(Pfn).collect(),
        })
    }

    fn free(&self, buffer: KernelBuffer) {
        let still_granted = {
            let grants = self.grants.lock();
            buffer
                .frames
                .iter()
                .filter(|pfn| grants.granted_pfns.contains_key(pfn))
                .count()
        };
        if still_granted > 0 {
            self.violation(&format!(
                "buffer {} freed with {} pages still granted",
                buffer.id, still_granted
            ));
        }

        let mut mem = self.mem.lock();
        let owned = mem.owned.remove(&buffer.id);
        match owned {
            Some(pages) => {
                mem.allocated_pages -= pages as u64;
                for pfn in &buffer.frames {
                    mem.frames.remove(pfn);
                }
            }
            None => {
                drop(mem);
                self.violation(&format!("free of unknown buffer {}", buffer.id));
            }
        }
    }

    fn map_io_space(&self, mapping: &ForeignMapping) -> BusResult<KernelBuffer> {
        if self.should_fail(FaultPoint::MapIoSpace) {
            return Err(BusError::OutOfResources);
        }

        let frames = self
            .grants
            .lock()
            .mappings
            .get(&mapping.id)
            .map(|m| m.frames.clone())
            .ok_or(BusError::NotFound)?;

        let id = self.next_id();
        self.mem.lock().io.insert(id, mapping.pages);
        Ok(KernelBuffer { id, frames })
    }

    fn unmap_io_space(&self, buffer: KernelBuffer) {
        if self.mem.lock().io.remove(&buffer.id).is_none() {
            self.violation(&format!("unmap of unknown io mapping {}", buffer.id));
        }
    }

    fn map_user(&self, client: ClientId, buffer: &KernelBuffer) -> BusResult<UserVa> {
        if self.should_fail(FaultPoint::MapUser) {
            return Err(BusError::OutOfResources);
        }

        let mut mem = self.mem.lock();
        let arena = mem.arenas.entry(client).or_insert_with(|| Arena {
            next_va: USER_ARENA_BASE,
            regions: BTreeMap::new(),
        });

        let va = arena.next_va;
        // one guard page between regions
        arena.next_va += (buffer.frames.len() as u64 + 1) * PAGE_SIZE as u64;
        arena.regions.insert(
            va,
            Region {
                buffer_id: buffer.id,
                frames: buffer.frames.clone(),
            },
        );
        trace!("loopback: mapped buffer {} at {:#x} for {}", buffer.id, va, client);
        Ok(UserVa(va))
    }

    fn unmap_user(&self, client: ClientId, va: UserVa, buffer: &KernelBuffer) {
        let removed = {
            let mut mem = self.mem.lock();
            mem.arenas.get_mut(&client).and_then(|arena| {
                let owned_by_buffer = arena
                    .regions
                    .get(&va.0)
                    .map_or(false, |region| region.buffer_id == buffer.id);
                if owned_by_buffer {
                    arena.regions.remove(&va.0)
                } else {
                    None
                }
            })
        };
        if removed.is_none() {
            self.violation(&format!("unmap of {} not mapped for {}", va, client));
        }
    }

    fn poke(&self, buffer: &KernelBuffer, offset: u64, value: u8) {
        let mut mem = self.mem.lock();
        write_byte(&mut mem.frames, &buffer.frames, offset, value);
    }
}

impl GrantTableService for Loopback {
    fn create_cache(&self, name: &str, lock: Arc<dyn CacheLock>) -> BusResult<GrantCache> {
        let id = self.next_id();
        self.grants.lock().caches.insert(id, (name.to_string(), lock));
        debug!("loopback: created grant cache {} ({})", name, id);
        Ok(GrantCache(id))
    }

    fn destroy_cache(&self, cache: GrantCache) {
        if self.grants.lock().caches.remove(&cache.0).is_none() {
            self.violation(&format!("destroy of unknown grant cache {}", cache.0));
        }
    }

    fn permit_foreign_access(
        &self,
        cache: GrantCache,
        domain: DomainId,
        pfn: Pfn,
        readonly: bool,
    ) -> BusResult<GrantEntry> {
        if self.should_fail(FaultPoint::PermitForeignAccess) {
            return Err(BusError::OutOfResources);
        }

        let mut grants = self.grants.lock();
        let lock = grants
            .caches
            .get(&cache.0)
            .map(|(_, lock)| lock.clone())
            .ok_or(BusError::InvalidArgument)?;

        lock.acquire();
        let reference = GrantRef(grants.next_ref);
        grants.next_ref = grants.next_ref.wrapping_add(1).max(FIRST_GRANT_REF);
        lock.release();

        let entry_id = self.next_id();
        grants.entries.insert(
            reference,
            GrantRecord {
                entry_id,
                domain,
                pfn,
                readonly,
                maps: 0,
            },
        );
        *grants.granted_pfns.entry(pfn).or_insert(0) += 1;

        Ok(GrantEntry::new(entry_id, reference))
    }

    fn revoke_foreign_access(&self, cache: GrantCache, entry: GrantEntry) -> BusResult<()> {
        if self.should_fail(FaultPoint::RevokeForeignAccess) {
            return Err(BusError::Rejected { code: EBUSY });
        }

        let mut grants = self.grants.lock();
        let lock = grants
            .caches
            .get(&cache.0)
            .map(|(_, lock)| lock.clone())
            .ok_or(BusError::InvalidArgument)?;

        let reference = entry.reference();
        match grants.entries.get(&reference) {
            Some(record) if record.entry_id != entry.id() => return Err(BusError::NotFound),
            Some(record) if record.maps > 0 => return Err(BusError::Rejected { code: EBUSY }),
            Some(_) => {}
            None => return Err(BusError::NotFound),
        }

        lock.acquire();
        let record = grants.entries.remove(&reference);
        lock.release();

        if let Some(record) = record {
            if let Some(count) = grants.granted_pfns.get_mut(&record.pfn) {
                *count -= 1;
                if *count == 0 {
                    grants.granted_pfns.remove(&record.pfn);
                }
            }
        }
        grants.revocations.push(reference);
        Ok(())
    }

    fn get_reference(&self, entry: &GrantEntry) -> GrantRef {
        entry.reference()
    }

    fn map_foreign_pages(
        &self,
        domain: DomainId,
        references: &[GrantRef],
        readonly: bool,
    ) -> BusResult<ForeignMapping> {
        if self.should_fail(FaultPoint::MapForeignPages) {
            return Err(BusError::OutOfResources);
        }
        if domain != self.domain {
            // only grants made by this host can be mapped back
            return Err(BusError::NotFound);
        }

        let mut grants = self.grants.lock();
        let mut frames = Vec::with_capacity(references.len());
        for reference in references {
            let record = grants
                .entries
                .get(reference)
                .ok_or(BusError::Rejected { code: GNTST_BAD_GNTREF })?;
            if record.domain != self.domain {
                return Err(BusError::Rejected { code: GNTST_PERMISSION_DENIED });
            }
            if record.readonly && !readonly {
                return Err(BusError::Rejected { code: GNTST_PERMISSION_DENIED });
            }
            frames.push(record.pfn);
        }

        for reference in references {
            if let Some(record) = grants.entries.get_mut(reference) {
                record.maps += 1;
            }
        }

        let id = self.next_id();
        grants.mappings.insert(
            id,
            MappingRecord {
                references: references.to_vec(),
                frames,
            },
        );

        Ok(ForeignMapping {
            id,
            pages: references.len() as u32,
        })
    }

    fn unmap_foreign_pages(&self, mapping: ForeignMapping) -> BusResult<()> {
        if self.should_fail(FaultPoint::UnmapForeignPages) {
            return Err(BusError::Rejected { code: EBUSY });
        }

        let mut grants = self.grants.lock();
        let record = grants.mappings.remove(&mapping.id).ok_or(BusError::NotFound)?;
        for reference in &record.references {
            if let Some(entry) = grants.entries.get_mut(reference) {
                entry.maps = entry.maps.saturating_sub(1);
            }
        }
        Ok(())
    }
}

impl EventChannelService for Loopback {
    fn open(&self, kind: ChannelKind, handler: SignalHandler) -> BusResult<ChannelHandle> {
        if self.should_fail(FaultPoint::ChannelOpen) {
            return Err(BusError::OutOfResources);
        }

        let mut channels = self.channels.lock();

        let peer = match kind {
            ChannelKind::Unbound { .. } => None,
            ChannelKind::Interdomain { remote, remote_port } => {
                if remote != self.domain {
                    return Err(BusError::NotFound);
                }
                let target = channels
                    .by_port
                    .get(&remote_port)
                    .and_then(|h| channels.by_handle.get(h))
                    .cloned()
                    .ok_or(BusError::InvalidArgument)?;

                let bindable = matches!(target.kind, ChannelKind::Unbound { remote } if remote == self.domain);
                let mut target_peer = target.peer.lock();
                if !bindable || target_peer.is_some() {
                    return Err(BusError::InvalidArgument);
                }

                let port = LocalPort(channels.next_port);
                *target_peer = Some(port);
                Some(remote_port)
            }
        };

        let port = LocalPort(channels.next_port);
        channels.next_port += 1;

        let handle = self.next_id();
        let record = Arc::new(PortRecord {
            port,
            kind,
            peer: Mutex::new(peer),
            masked: AtomicBool::new(true),
            pending: AtomicBool::new(false),
            sent: AtomicU64::new(0),
            handler: RwLock::new(Some(handler)),
        });
        channels.by_handle.insert(handle, record);
        channels.by_port.insert(port, handle);

        debug!("loopback: opened {} ({:?})", port, kind);
        Ok(ChannelHandle(handle))
    }

    fn local_port(&self, channel: ChannelHandle) -> BusResult<LocalPort> {
        self.port_record(channel).map(|r| r.port)
    }

    fn unmask(&self, channel: ChannelHandle) -> BusResult<()> {
        let record = self.port_record(channel)?;
        record.masked.store(false, Ordering::Release);
        if record.pending.load(Ordering::Acquire) {
            let cpu = record.port.0 as usize;
            self.raise(&record, cpu);
        }
        Ok(())
    }

    fn send(&self, channel: ChannelHandle) -> BusResult<()> {
        let record = self.port_record(channel)?;
        record.sent.fetch_add(1, Ordering::AcqRel);

        let peer = *record.peer.lock();
        if let Some(peer) = peer {
            if let Some(target) = self.record_for_port(peer) {
                let cpu = peer.0 as usize;
                self.raise(&target, cpu);
            }
        }
        Ok(())
    }

    fn close(&self, channel: ChannelHandle) {
        let record = {
            let mut channels = self.channels.lock();
            let record = channels.by_handle.remove(&channel.0);
            if let Some(record) = &record {
                channels.by_port.remove(&record.port);
            }
            record
        };

        let Some(record) = record else {
            self.violation(&format!("close of unknown channel {}", channel.0));
            return;
        };

        // waits for an in-flight handler
        *record.handler.write() = None;

        let peer = record.peer.lock().take();
        if let Some(peer) = peer {
            if let Some(target) = self.record_for_port(peer) {
                *target.peer.lock() = None;
            }
        }
        debug!("loopback: closed {}", record.port);
    }
}

impl StoreService for Loopback {
    fn read(&self, path: &str) -> BusResult<String> {
        let path = self.normalize(path)?;
        self.store
            .lock()
            .nodes
            .get(&path)
            .map(|n| n.value.clone())
            .ok_or(BusError::NotFound)
    }

    fn write(&self, path: &str, value: &str) -> BusResult<()> {
        let path = self.normalize(path)?;
        let mut store = self.store.lock();

        let mut parent = parent_of(&path);
        while let Some(p) = parent {
            if p != "/" {
                store.nodes.entry(p.to_string()).or_insert_with(|| StoreNode {
                    value: String::new(),
                    permissions: Vec::new(),
                });
            }
            parent = parent_of(p);
        }

        store
            .nodes
            .entry(path.clone())
            .and_modify(|n| n.value = value.to_string())
            .or_insert_with(|| StoreNode {
                value: value.to_string(),
                permissions: Vec::new(),
            });

        Self::fire_watches(&store, &path);
        Ok(())
    }

    fn directory(&self, path: &str) -> BusResult<Vec<String>> {
        let path = self.normalize(path)?;
        let store = self.store.lock();
        if path != "/" && !store.nodes.contains_key(&path) {
            return Err(BusError::NotFound);
        }

        let prefix = child_prefix(&path);
        let children = store
            .nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect();
        Ok(children)
    }

    fn remove(&self, path: &str) -> BusResult<()> {
        let path = self.normalize(path)?;
        let mut store = self.store.lock();
        if store.nodes.remove(&path).is_none() {
            return Err(BusError::NotFound);
        }

        let prefix = child_prefix(&path);
        store.nodes.retain(|k, _| !k.starts_with(&prefix));
        Self::fire_watches(&store, &path);
        Ok(())
    }

    fn set_permissions(&self, path: &str, permissions: &[StorePermission]) -> BusResult<()> {
        let path = self.normalize(path)?;
        let mut store = self.store.lock();
        let node = store.nodes.get_mut(&path).ok_or(BusError::NotFound)?;
        node.permissions = permissions.to_vec();
        Self::fire_watches(&store, &path);
        Ok(())
    }

    fn watch_add(&self, path: &str, event: Arc<UserEvent>) -> BusResult<StoreWatchId> {
        if self.should_fail(FaultPoint::WatchAdd) {
            return Err(BusError::OutOfResources);
        }

        let path = self.normalize(path)?;
        let id = self.next_id();
        // a new watch fires once so the client picks up the current state
        event.set();
        self.store.lock().watches.insert(id, (path, event));
        Ok(StoreWatchId(id))
    }

    fn watch_remove(&self, watch: StoreWatchId) -> BusResult<()> {
        if self.should_fail(FaultPoint::WatchRemove) {
            return Err(BusError::Unavailable);
        }
        self.store
            .lock()
            .watches
            .remove(&watch.0)
            .map(|_| ())
            .ok_or(BusError::NotFound)
    }
}

impl HandleOps for Loopback {
    fn reference_event(&self, client: ClientId, handle: EventHandle) -> BusResult<Arc<UserEvent>> {
        self.events
            .lock()
            .get(&(client, handle))
            .cloned()
            .ok_or(BusError::InvalidArgument)
    }
}

impl Loopback {
    /// Permissions recorded on a store node
    pub fn store_permissions(&self, path: &str) -> BusResult<Vec<StorePermission>> {
        let path = self.normalize(path)?;
        self.store
            .lock()
            .nodes
            .get(&path)
            .map(|n| n.permissions.clone())
            .ok_or(BusError::NotFound)
    }
}
