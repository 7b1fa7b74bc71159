//! IPC interface for the Veil daemon
//!
//! Newline-delimited JSON over a Unix socket. Each connection is one
//! client: it gets its own [`ClientId`], and when the connection goes away
//! its parked requests are cancelled and its watches and channels are
//! released.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info};

use crate::bus::{HandleOps, Loopback, LoopbackStats};
use crate::device::Device;
use crate::error::{invariant_violation, Status, VeilError};
use crate::gnttab::{GrantRequest, GrantResult, MapRequest};
use crate::queue::PendingRequest;
use crate::types::{
    ClientId, DomainId, EventHandle, GrantFlags, GrantRef, LocalPort, OperationKind, RequestId,
    StorePermission, StorePermissionMask, UserVa, WatchHandle,
};

/// IPC request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum IpcRequest {
    /// Get daemon status
    Status,

    /// Create an event object for this client
    CreateEvent,

    /// Close an event object
    CloseEvent { handle: u64 },

    /// Wait for an event to be set (consumes the signal)
    WaitEvent { handle: u64, timeout_ms: u64 },

    StoreRead { path: String },

    StoreWrite { path: String, value: String },

    StoreDirectory { path: String },

    StoreRemove { path: String },

    StoreSetPermissions {
        path: String,
        permissions: Vec<PermissionEntry>,
    },

    AddWatch { path: String, event: u64 },

    RemoveWatch { watch: u64 },

    BindUnbound { remote: u16, mask: bool, event: u64 },

    BindInterdomain {
        remote: u16,
        remote_port: u32,
        mask: bool,
        event: u64,
    },

    CloseChannel { port: u32 },

    NotifyChannel { port: u32 },

    UnmaskChannel { port: u32 },

    /// Share fresh pages with a foreign domain
    PermitForeignAccess {
        remote: u16,
        pages: u32,
        #[serde(default)]
        flags: u32,
        #[serde(default)]
        notify_offset: u32,
        #[serde(default)]
        notify_port: u32,
        request_id: u64,
    },

    GetGrantResult { request_id: u64 },

    RevokeForeignAccess { request_id: u64 },

    /// Map pages a foreign domain granted
    MapForeignPages {
        remote: u16,
        #[serde(default)]
        flags: u32,
        #[serde(default)]
        notify_offset: u32,
        #[serde(default)]
        notify_port: u32,
        request_id: u64,
        references: Vec<u32>,
    },

    GetMapResult { request_id: u64 },

    UnmapForeignPages { request_id: u64 },

    /// Cancel a parked grant or map
    Cancel { kind: OperationKind, request_id: u64 },

    /// Read through one of this client's mappings
    ReadMemory { address: u64, len: usize },

    /// Write through one of this client's mappings
    WriteMemory { address: u64, data: Vec<u8> },

    /// Raise a signal on a local port as if the remote end had sent
    Inject { port: u32 },
}

/// IPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum IpcResponse {
    Success { message: String },
    Pending { request_id: u64 },
    Value { value: String },
    Entries { entries: Vec<String> },
    Event { handle: u64 },
    Signalled { signalled: bool },
    Port { port: u32 },
    Watch { watch: u64 },
    Grant { address: u64, references: Vec<u32> },
    Address { address: u64 },
    Memory { data: Vec<u8> },
    Status {
        ready: bool,
        clients: usize,
        pending: usize,
        channels: usize,
        watches: usize,
        loopback: LoopbackStats,
    },
    Error { code: Status, message: String },
}

impl From<VeilError> for IpcResponse {
    fn from(e: VeilError) -> Self {
        IpcResponse::Error {
            code: e.status(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionEntry {
    pub domain: u16,
    pub mask: u32,
}

fn success(message: impl Into<String>) -> IpcResponse {
    IpcResponse::Success {
        message: message.into(),
    }
}

/// Shared daemon state
pub struct VeilState {
    pub device: Device,
    pub loopback: Arc<Loopback>,
    next_client: AtomicU64,
    clients: AtomicUsize,
}

impl VeilState {
    pub fn new(device: Device, loopback: Arc<Loopback>) -> Self {
        Self {
            device,
            loopback,
            next_client: AtomicU64::new(1),
            clients: AtomicUsize::new(0),
        }
    }

    pub fn connected_clients(&self) -> usize {
        self.clients.load(Ordering::Acquire)
    }
}

/// Per-connection state
pub struct Session {
    client: ClientId,
    pending: HashMap<RequestId, PendingRequest>,
}

impl Session {
    pub fn open(state: &VeilState) -> Self {
        let client = ClientId(state.next_client.fetch_add(1, Ordering::Relaxed));
        state.clients.fetch_add(1, Ordering::AcqRel);
        Self {
            client,
            pending: HashMap::new(),
        }
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Cancel what is still parked and release everything the client owns
    pub async fn close(self, state: &Arc<VeilState>) {
        let client = self.client;
        let ids: Vec<RequestId> = self.pending.into_keys().collect();

        let report = blocking(state, move |state| {
            let cancelled = ids.into_iter().filter(|id| state.device.cancel(*id)).count();
            state.device.flush();
            let report = state.device.cleanup_client(client);
            state.loopback.release_client(client);
            Ok((cancelled, report))
        })
        .await;

        if let Ok((cancelled, report)) = report {
            info!(
                "{} disconnected: {} requests cancelled, {} watches, {} channels",
                client, cancelled, report.watches, report.channels
            );
        }
        state.clients.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Run a device call off the async runtime
async fn blocking<T, F>(state: &Arc<VeilState>, f: F) -> crate::error::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&VeilState) -> crate::error::Result<T> + Send + 'static,
{
    let state = state.clone();
    tokio::task::spawn_blocking(move || f(&state))
        .await
        .unwrap_or_else(|e| invariant_violation("device call did not complete", &e))
}

/// IPC server
pub struct VeilServer {
    socket_path: String,
    state: Arc<VeilState>,
}

impl VeilServer {
    pub fn new(socket_path: &str, state: Arc<VeilState>) -> Self {
        Self {
            socket_path: socket_path.to_string(),
            state,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let _ = std::fs::remove_file(&self.socket_path);

        if let Some(parent) = std::path::Path::new(&self.socket_path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;

        // Restrict socket permissions
        std::fs::set_permissions(
            &self.socket_path,
            std::os::unix::fs::PermissionsExt::from_mode(0o600),
        )?;

        info!("Veil IPC listening on {}", self.socket_path);

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, state).await {
                            error!("Client error: {}", e);
                        }
                    });
                }
                Err(e) => error!("Accept error: {}", e),
            }
        }
    }
}

async fn handle_client(stream: UnixStream, state: Arc<VeilState>) -> Result<()> {
    let mut session = Session::open(&state);
    debug!("{} connected", session.client());

    let served = serve(stream, &state, &mut session).await;
    session.close(&state).await;
    served
}

async fn serve(stream: UnixStream, state: &Arc<VeilState>, session: &mut Session) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<IpcRequest>(&line) {
            Ok(request) => process_request(request, state, session).await,
            Err(e) => IpcResponse::Error {
                code: Status::InvalidParameter,
                message: e.to_string(),
            },
        };

        let json = serde_json::to_string(&response)?;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        line.clear();
    }

    Ok(())
}

pub async fn process_request(request: IpcRequest, state: &Arc<VeilState>, session: &mut Session) -> IpcResponse {
    let client = session.client;

    match request {
        IpcRequest::Status => IpcResponse::Status {
            ready: state.device.is_ready(),
            clients: state.connected_clients(),
            pending: state.device.pending_count(),
            channels: state.device.channel_count(),
            watches: state.device.watch_count(),
            loopback: state.loopback.stats(),
        },

        IpcRequest::CreateEvent => {
            let (handle, _) = state.loopback.create_event(client);
            IpcResponse::Event { handle: handle.0 }
        }

        IpcRequest::CloseEvent { handle } => match state.loopback.close_event(client, EventHandle(handle)) {
            Ok(()) => success("Event closed"),
            Err(e) => VeilError::from(e).into(),
        },

        IpcRequest::WaitEvent { handle, timeout_ms } => {
            let event = match state.loopback.reference_event(client, EventHandle(handle)) {
                Ok(event) => event,
                Err(e) => return VeilError::from(e).into(),
            };
            let timeout = Duration::from_millis(timeout_ms);
            match blocking(state, move |_| Ok(event.wait_timeout(timeout))).await {
                Ok(signalled) => IpcResponse::Signalled { signalled },
                Err(e) => e.into(),
            }
        }

        IpcRequest::StoreRead { path } => {
            match blocking(state, move |s| s.device.store_read(&path)).await {
                Ok(value) => IpcResponse::Value { value },
                Err(e) => e.into(),
            }
        }

        IpcRequest::StoreWrite { path, value } => {
            match blocking(state, move |s| s.device.store_write(&path, &value)).await {
                Ok(()) => success("Value written"),
                Err(e) => e.into(),
            }
        }

        IpcRequest::StoreDirectory { path } => {
            match blocking(state, move |s| s.device.store_directory(&path)).await {
                Ok(entries) => IpcResponse::Entries { entries },
                Err(e) => e.into(),
            }
        }

        IpcRequest::StoreRemove { path } => {
            match blocking(state, move |s| s.device.store_remove(&path)).await {
                Ok(()) => success("Node removed"),
                Err(e) => e.into(),
            }
        }

        IpcRequest::StoreSetPermissions { path, permissions } => {
            let permissions: Vec<StorePermission> = permissions
                .iter()
                .map(|p| StorePermission {
                    domain: DomainId(p.domain),
                    mask: StorePermissionMask::from_bits_retain(p.mask),
                })
                .collect();
            match blocking(state, move |s| s.device.store_set_permissions(&path, &permissions)).await {
                Ok(()) => success("Permissions set"),
                Err(e) => e.into(),
            }
        }

        IpcRequest::AddWatch { path, event } => {
            match blocking(state, move |s| s.device.add_watch(client, &path, EventHandle(event))).await {
                Ok(watch) => IpcResponse::Watch { watch: watch.0 },
                Err(e) => e.into(),
            }
        }

        IpcRequest::RemoveWatch { watch } => {
            match blocking(state, move |s| s.device.remove_watch(client, WatchHandle(watch))).await {
                Ok(()) => success("Watch removed"),
                Err(e) => e.into(),
            }
        }

        IpcRequest::BindUnbound { remote, mask, event } => {
            let bound = blocking(state, move |s| {
                s.device
                    .bind_unbound_channel(client, DomainId(remote), mask, EventHandle(event))
            })
            .await;
            match bound {
                Ok(port) => IpcResponse::Port { port: port.0 },
                Err(e) => e.into(),
            }
        }

        IpcRequest::BindInterdomain {
            remote,
            remote_port,
            mask,
            event,
        } => {
            let bound = blocking(state, move |s| {
                s.device.bind_interdomain_channel(
                    client,
                    DomainId(remote),
                    LocalPort(remote_port),
                    mask,
                    EventHandle(event),
                )
            })
            .await;
            match bound {
                Ok(port) => IpcResponse::Port { port: port.0 },
                Err(e) => e.into(),
            }
        }

        IpcRequest::CloseChannel { port } => {
            match blocking(state, move |s| s.device.close_channel(client, LocalPort(port))).await {
                Ok(()) => success("Channel closed"),
                Err(e) => e.into(),
            }
        }

        IpcRequest::NotifyChannel { port } => match state.device.notify_channel(client, LocalPort(port)) {
            Ok(()) => success("Notified"),
            Err(e) => e.into(),
        },

        IpcRequest::UnmaskChannel { port } => match state.device.unmask_channel(client, LocalPort(port)) {
            Ok(()) => success("Unmasked"),
            Err(e) => e.into(),
        },

        IpcRequest::PermitForeignAccess {
            remote,
            pages,
            flags,
            notify_offset,
            notify_port,
            request_id,
        } => {
            let request = GrantRequest {
                remote: DomainId(remote),
                pages,
                flags: GrantFlags::from_bits_truncate(flags),
                notify_offset,
                notify_port: LocalPort(notify_port),
                request_id,
            };
            let parked = blocking(state, move |s| s.device.permit_foreign_access(client, &request)).await;
            park(session, parked)
        }

        IpcRequest::GetGrantResult { request_id } => {
            let result = blocking(state, move |s| grant_result_any_size(&s.device, client, request_id)).await;
            match result {
                Ok(result) => IpcResponse::Grant {
                    address: result.address.0,
                    references: result.references.iter().map(|r| r.0).collect(),
                },
                Err(e) => e.into(),
            }
        }

        IpcRequest::RevokeForeignAccess { request_id } => {
            let revoked = blocking(state, move |s| s.device.revoke_foreign_access(client, request_id)).await;
            match revoked {
                Ok(()) => {
                    session.pending.remove(&RequestId::grant(client, request_id));
                    success("Grant revoked")
                }
                Err(e) => e.into(),
            }
        }

        IpcRequest::MapForeignPages {
            remote,
            flags,
            notify_offset,
            notify_port,
            request_id,
            references,
        } => {
            let request = MapRequest {
                remote: DomainId(remote),
                pages: references.len() as u32,
                flags: GrantFlags::from_bits_truncate(flags),
                notify_offset,
                notify_port: LocalPort(notify_port),
                request_id,
                references: references.into_iter().map(GrantRef).collect(),
            };
            let parked = blocking(state, move |s| s.device.map_foreign_pages(client, &request)).await;
            park(session, parked)
        }

        IpcRequest::GetMapResult { request_id } => match state.device.get_map_result(client, request_id) {
            Ok(address) => IpcResponse::Address { address: address.0 },
            Err(e) => e.into(),
        },

        IpcRequest::UnmapForeignPages { request_id } => {
            let unmapped = blocking(state, move |s| s.device.unmap_foreign_pages(client, request_id)).await;
            match unmapped {
                Ok(()) => {
                    session.pending.remove(&RequestId::map(client, request_id));
                    success("Pages unmapped")
                }
                Err(e) => e.into(),
            }
        }

        IpcRequest::Cancel { kind, request_id } => {
            let id = RequestId {
                client,
                number: request_id,
                kind,
            };
            let pending = session.pending.remove(&id);
            let cancelled = blocking(state, move |s| Ok(s.device.cancel(id))).await;
            match (cancelled, pending) {
                (Ok(true), Some(pending)) => {
                    let status = blocking(state, move |_| Ok(pending.wait())).await;
                    match status {
                        Ok(status) => success(format!("Request cancelled ({status})")),
                        Err(e) => e.into(),
                    }
                }
                (Ok(true), None) => success("Request cancelled"),
                (Ok(false), _) => VeilError::not_found(format!("{id}")).into(),
                (Err(e), _) => e.into(),
            }
        }

        IpcRequest::ReadMemory { address, len } => match state.loopback.user_read(client, UserVa(address), len) {
            Ok(data) => IpcResponse::Memory { data },
            Err(e) => VeilError::from(e).into(),
        },

        IpcRequest::WriteMemory { address, data } => {
            match state.loopback.user_write(client, UserVa(address), &data) {
                Ok(()) => success(format!("{} bytes written", data.len())),
                Err(e) => VeilError::from(e).into(),
            }
        }

        IpcRequest::Inject { port } => {
            let cpu = port as usize % state.loopback.processors();
            match state.loopback.inject(LocalPort(port), cpu) {
                Ok(()) => success("Signal raised"),
                Err(e) => VeilError::from(e).into(),
            }
        }
    }
}

/// Remember a parked request on the session
fn park(session: &mut Session, parked: crate::error::Result<PendingRequest>) -> IpcResponse {
    match parked {
        Ok(pending) => {
            let id = pending.id();
            session.pending.insert(id, pending);
            IpcResponse::Pending { request_id: id.number }
        }
        Err(e) => e.into(),
    }
}

/// Fetch a grant result when the caller cannot state its size up front
///
/// The socket has no result buffer, so the first call learns the size.
fn grant_result_any_size(device: &Device, client: ClientId, request_id: u64) -> crate::error::Result<GrantResult> {
    match device.get_grant_result(client, request_id, 0) {
        Err(VeilError::InvalidSize { expected, .. }) => device.get_grant_result(client, request_id, expected),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::config::DeviceConfig;

    fn state() -> Arc<VeilState> {
        let lb = Arc::new(Loopback::new(DomainId(0), 4096, 2));
        let config = DeviceConfig {
            deferred_workers: 2,
            ..DeviceConfig::default()
        };
        let device = Device::new(Bus::loopback(lb.clone()), &config).unwrap();
        Arc::new(VeilState::new(device, lb))
    }

    #[test]
    fn test_request_wire_format() {
        let json = r#"{"type":"PermitForeignAccess","data":{"remote":1,"pages":4,"request_id":7}}"#;
        let request: IpcRequest = serde_json::from_str(json).unwrap();
        assert!(matches!(
            request,
            IpcRequest::PermitForeignAccess { pages: 4, flags: 0, request_id: 7, .. }
        ));

        let cancel = r#"{"type":"Cancel","data":{"kind":"map","request_id":2}}"#;
        let request: IpcRequest = serde_json::from_str(cancel).unwrap();
        assert!(matches!(request, IpcRequest::Cancel { kind: OperationKind::Map, .. }));

        let status: IpcRequest = serde_json::from_str(r#"{"type":"Status"}"#).unwrap();
        assert!(matches!(status, IpcRequest::Status));
    }

    #[test]
    fn test_error_response_carries_status() {
        let response: IpcResponse = VeilError::not_found("x").into();
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains(r#""status":"Error""#));
        assert!(json.contains(r#""code":"not_found""#));
    }

    #[tokio::test]
    async fn test_grant_round_trip() {
        let state = state();
        let mut session = Session::open(&state);

        let response = process_request(
            IpcRequest::PermitForeignAccess {
                remote: 1,
                pages: 4,
                flags: 0,
                notify_offset: 0,
                notify_port: 0,
                request_id: 7,
            },
            &state,
            &mut session,
        )
        .await;
        assert!(matches!(response, IpcResponse::Pending { request_id: 7 }));
        assert_eq!(session.pending_count(), 1);

        let response = process_request(IpcRequest::GetGrantResult { request_id: 7 }, &state, &mut session).await;
        match response {
            IpcResponse::Grant { address, references } => {
                assert_ne!(address, 0);
                assert_eq!(references.len(), 4);
            }
            other => panic!("unexpected {:?}", other),
        }

        let response =
            process_request(IpcRequest::RevokeForeignAccess { request_id: 7 }, &state, &mut session).await;
        assert!(matches!(response, IpcResponse::Success { .. }));
        assert_eq!(session.pending_count(), 0);

        let response = process_request(IpcRequest::GetGrantResult { request_id: 7 }, &state, &mut session).await;
        assert!(matches!(response, IpcResponse::Error { code: Status::NotFound, .. }));
    }

    #[tokio::test]
    async fn test_disconnect_releases_everything() {
        let state = state();
        let mut session = Session::open(&state);
        assert_eq!(state.connected_clients(), 1);

        let event = match process_request(IpcRequest::CreateEvent, &state, &mut session).await {
            IpcResponse::Event { handle } => handle,
            other => panic!("unexpected {:?}", other),
        };
        process_request(
            IpcRequest::BindUnbound {
                remote: 1,
                mask: false,
                event,
            },
            &state,
            &mut session,
        )
        .await;
        process_request(
            IpcRequest::AddWatch {
                path: "data".to_string(),
                event,
            },
            &state,
            &mut session,
        )
        .await;
        process_request(
            IpcRequest::PermitForeignAccess {
                remote: 1,
                pages: 2,
                flags: 0,
                notify_offset: 0,
                notify_port: 0,
                request_id: 1,
            },
            &state,
            &mut session,
        )
        .await;

        session.close(&state).await;

        let stats = state.loopback.stats();
        assert_eq!(stats.active_grants, 0);
        assert_eq!(stats.allocated_pages, 0);
        assert_eq!(stats.open_channels, 0);
        assert_eq!(stats.watches, 0);
        assert_eq!(stats.events, 0);
        assert_eq!(state.connected_clients(), 0);
    }

    #[tokio::test]
    async fn test_cancel_reports_not_found_second_time() {
        let state = state();
        let mut session = Session::open(&state);
        process_request(
            IpcRequest::PermitForeignAccess {
                remote: 1,
                pages: 1,
                flags: 0,
                notify_offset: 0,
                notify_port: 0,
                request_id: 3,
            },
            &state,
            &mut session,
        )
        .await;

        let cancel = IpcRequest::Cancel {
            kind: OperationKind::Grant,
            request_id: 3,
        };
        let first = process_request(cancel.clone(), &state, &mut session).await;
        assert!(matches!(first, IpcResponse::Success { .. }));
        let second = process_request(cancel, &state, &mut session).await;
        assert!(matches!(second, IpcResponse::Error { code: Status::NotFound, .. }));
    }
}
