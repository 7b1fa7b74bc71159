//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::Arc;

use nyx_veil::bus::{Bus, Loopback};
use nyx_veil::config::DeviceConfig;
use nyx_veil::gnttab::{GrantRequest, MapRequest};
use nyx_veil::types::{DomainId, GrantFlags, GrantRef, LocalPort, MAX_PAGES};
use nyx_veil::Device;

pub const SELF: DomainId = DomainId(0);
pub const PEER: DomainId = DomainId(1);

/// Device over a loopback large enough for the biggest legal grant
pub fn device() -> (Arc<Loopback>, Device) {
    let lb = Arc::new(Loopback::new(SELF, 2 * MAX_PAGES as u64 + 64, 4));
    let config = DeviceConfig {
        deferred_workers: 4,
        ..DeviceConfig::default()
    };
    let device = Device::new(Bus::loopback(lb.clone()), &config).expect("device");
    (lb, device)
}

pub fn grant_request(remote: DomainId, pages: u32, request_id: u64) -> GrantRequest {
    GrantRequest {
        remote,
        pages,
        flags: GrantFlags::empty(),
        notify_offset: 0,
        notify_port: LocalPort(0),
        request_id,
    }
}

pub fn map_request(references: Vec<GrantRef>, request_id: u64) -> MapRequest {
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
