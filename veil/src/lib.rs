//! Veil - foreign-domain page sharing and event channel bridge
//!
//! Lets an unprivileged client:
//! - Share pages with a foreign domain (grants) and map pages it shared (maps)
//! - Bind event channels and wait on them through user events
//! - Use the shared key/value store, including watches
//!
//! The core talks to the hypervisor only through the traits in [`bus`];
//! [`bus::Loopback`] implements them in-process.

pub mod sync;

pub mod abi;
pub mod bus;
pub mod cleanup;
pub mod config;
pub mod device;
pub mod error;
pub mod event;
pub mod evtchn;
pub mod gnttab;
pub mod ipc;
pub mod queue;
pub mod store;
pub mod types;
pub mod watch;
pub mod worker;

pub use device::Device;
pub use error::{Result, Status, VeilError};
