//! Identifiers and constants shared by every Veil subsystem

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of one shared page in bytes
pub const PAGE_SIZE: usize = 4096;

/// Largest page count a single grant or map request may cover
pub const MAX_PAGES: u32 = 1024 * 1024;

/// Longest absolute store path accepted from a client, terminator included
pub const STORE_ABS_PATH_MAX: usize = 3072;

/// Identity of a connected client (one per open handle on the device)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client:{}", self.0)
    }
}

/// Hypervisor domain identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DomainId(pub u16);

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dom{}", self.0)
    }
}

/// Local event channel port number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalPort(pub u32);

impl fmt::Display for LocalPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port:{}", self.0)
    }
}

/// Grant reference number, meaningful to the remote domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GrantRef(pub u32);

/// Physical frame number of a page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pfn(pub u64);

/// Address of a mapping inside a client's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserVa(pub u64);

impl UserVa {
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for UserVa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Client-visible handle of a user event object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventHandle(pub u64);

/// Client-visible handle of a registered store watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WatchHandle(pub u64);

/// Kind of a parked asynchronous operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Grant,
    Map,
}

/// Key of a parked operation in the correlation queue
///
/// The caller picks `number`; it only has to be unique among the
/// operations of the same kind that the same client has pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId {
    pub client: ClientId,
    pub number: u64,
    pub kind: OperationKind,
}

impl RequestId {
    pub fn grant(client: ClientId, number: u64) -> Self {
        Self { client, number, kind: OperationKind::Grant }
    }

    pub fn map(client: ClientId, number: u64) -> Self {
        Self { client, number, kind: OperationKind::Map }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{} ({})", self.kind, self.number, self.client)
    }
}

bitflags::bitflags! {
    /// Grant/map request flags
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct GrantFlags: u32 {
        /// Remote side gets read-only access
        const READONLY = 1 << 0;
        /// Zero the byte at the notify offset on teardown
        const USE_NOTIFY_OFFSET = 1 << 1;
        /// Send on the notify port on teardown
        const USE_NOTIFY_PORT = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Store node permission mask
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct StorePermissionMask: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// One entry of a store node's access control list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorePermission {
    pub domain: DomainId,
    pub mask: StorePermissionMask,
}

/// Total byte length of `pages` pages
pub fn pages_to_bytes(pages: u32) -> u64 {
    pages as u64 * PAGE_SIZE as u64
}
