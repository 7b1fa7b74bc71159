//! Binary request ABI
//!
//! Every request is a code plus an input and an output byte buffer, the
//! way a device control call arrives. Layouts are little-endian and fixed;
//! sizes are checked exactly before anything is decoded. Reads from the
//! input go through [`Reader`], which reports a short buffer as
//! [`VeilError::InvalidSize`] instead of reading past the end.
//!
//! | Code | Input | Output |
//! |------|-------|--------|
//! | `StoreRead` | path NUL | value NUL |
//! | `StoreWrite` | path NUL value NUL | none |
//! | `StoreDirectory` | path NUL | names, each NUL, then NUL |
//! | `StoreRemove` | path NUL | none |
//! | `StoreSetPermissions` | path_len u32, count u32, count x (domain u16, pad u16, mask u32), path | none |
//! | `StoreAddWatch` | path_len u32, pad u32, event u64, path | watch u64 |
//! | `StoreRemoveWatch` | watch u64 | none |
//! | `EvtchnBindUnbound` | domain u16, mask u8, pad u8, pad u32, event u64 | port u32 |
//! | `EvtchnBindInterdomain` | domain u16, mask u8, pad u8, remote port u32, event u64 | port u32 |
//! | `EvtchnClose`, `EvtchnNotify`, `EvtchnUnmask` | port u32 | none |
//! | `GnttabPermitForeignAccess` | grant header (32 bytes) | none, pending |
//! | `GnttabGetGrantResult` | request id u64 | address u64, n x ref u32 |
//! | `GnttabRevokeForeignAccess` | request id u64 | none |
//! | `GnttabMapForeignPages` | grant header, n x ref u32 | none, pending |
//! | `GnttabGetMapResult` | request id u64 | address u64 |
//! | `GnttabUnmapForeignPages` | request id u64 | none |
//!
//! The grant header is: domain u16, pad u16, pages u32, flags u32,
//! notify offset u32, notify port u32, pad u32, request id u64.

use tracing::{debug, trace};

use crate::device::Device;
use crate::error::{Result, Status, VeilError};
use crate::gnttab::{GrantRequest, GrantResult, MapRequest};
use crate::queue::PendingRequest;
use crate::store::{encode_multi_sz, valid_str};
use crate::types::{
    ClientId, DomainId, EventHandle, GrantFlags, GrantRef, LocalPort, StorePermission, StorePermissionMask,
    WatchHandle, MAX_PAGES, STORE_ABS_PATH_MAX,
};

/// Size of the fixed part of grant and map requests
pub const GRANT_HEADER_LEN: usize = 32;

/// Size of one permission entry in `StoreSetPermissions`
pub const PERMISSION_ENTRY_LEN: usize = 8;

/// Device control codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RequestCode {
    StoreRead = 0x800,
    StoreWrite = 0x801,
    StoreDirectory = 0x802,
    StoreRemove = 0x803,
    StoreSetPermissions = 0x804,
    StoreAddWatch = 0x805,
    StoreRemoveWatch = 0x806,

    EvtchnBindUnbound = 0x810,
    EvtchnBindInterdomain = 0x811,
    EvtchnClose = 0x812,
    EvtchnNotify = 0x813,
    EvtchnUnmask = 0x814,

    GnttabPermitForeignAccess = 0x820,
    GnttabGetGrantResult = 0x821,
    GnttabRevokeForeignAccess = 0x822,
    GnttabMapForeignPages = 0x823,
    GnttabGetMapResult = 0x824,
    GnttabUnmapForeignPages = 0x825,
}

impl RequestCode {
    pub const ALL: [RequestCode; 18] = [
        RequestCode::StoreRead,
        RequestCode::StoreWrite,
        RequestCode::StoreDirectory,
        RequestCode::StoreRemove,
        RequestCode::StoreSetPermissions,
        RequestCode::StoreAddWatch,
        RequestCode::StoreRemoveWatch,
        RequestCode::EvtchnBindUnbound,
        RequestCode::EvtchnBindInterdomain,
        RequestCode::EvtchnClose,
        RequestCode::EvtchnNotify,
        RequestCode::EvtchnUnmask,
        RequestCode::GnttabPermitForeignAccess,
        RequestCode::GnttabGetGrantResult,
        RequestCode::GnttabRevokeForeignAccess,
        RequestCode::GnttabMapForeignPages,
        RequestCode::GnttabGetMapResult,
        RequestCode::GnttabUnmapForeignPages,
    ];

    pub fn from_u32(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| *c as u32 == code)
    }
}

/// Bounded little-endian reader over a request buffer
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.buf.len());
        let end = end.ok_or(VeilError::InvalidSize {
            expected: self.pos.saturating_add(len),
            actual: self.buf.len(),
        })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        self.array().map(u16::from_le_bytes)
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.array().map(u32::from_le_bytes)
    }

    pub fn u64(&mut self) -> Result<u64> {
        self.array().map(u64::from_le_bytes)
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.bytes(len).map(|_| ())
    }
}

/// Bounded little-endian writer over a result buffer
pub struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn written(&self) -> usize {
        self.pos
    }

    pub fn bytes(&mut self, data: &[u8]) -> Result<()> {
        let end = self.pos + data.len();
        if end > self.buf.len() {
            return Err(VeilError::InvalidSize {
                expected: end,
                actual: self.buf.len(),
            });
        }
        self.buf[self.pos..end].copy_from_slice(data);
        self.pos = end;
        Ok(())
    }

    pub fn u32(&mut self, value: u32) -> Result<()> {
        self.bytes(&value.to_le_bytes())
    }

    pub fn u64(&mut self, value: u64) -> Result<()> {
        self.bytes(&value.to_le_bytes())
    }
}

/// Result of one device control call
#[derive(Debug)]
pub struct IoctlOutcome {
    pub status: Status,
    /// Bytes written, or bytes required when `status` is buffer-overflow
    pub information: usize,
    /// Set when `status` is pending
    pub pending: Option<PendingRequest>,
}

impl IoctlOutcome {
    fn done(information: usize) -> Self {
        Self {
            status: Status::Success,
            information,
            pending: None,
        }
    }

    fn pending(request: PendingRequest) -> Self {
        Self {
            status: Status::Pending,
            information: 0,
            pending: Some(request),
        }
    }

    fn failed(err: &VeilError) -> Self {
        let information = match err {
            VeilError::BufferOverflow { needed } => *needed,
            _ => 0,
        };
        Self {
            status: err.status(),
            information,
            pending: None,
        }
    }
}

fn expect_len(what: &str, buf_len: usize, expected: usize) -> Result<()> {
    if buf_len != expected {
        trace!("{} length {} != {}", what, buf_len, expected);
        return Err(VeilError::InvalidSize {
            expected,
            actual: buf_len,
        });
    }
    Ok(())
}

/// Whole input must be exactly one NUL-terminated printable string
fn whole_str(input: &[u8]) -> Result<&str> {
    match valid_str(input) {
        Some((s, used)) if used == input.len() => Ok(s),
        _ => Err(VeilError::invalid("input is not a single printable string")),
    }
}

/// Copy a variable-length answer, reporting overflow for an empty buffer
fn copy_out(data: &[u8], output: &mut [u8]) -> Result<usize> {
    if output.is_empty() {
        return Err(VeilError::BufferOverflow { needed: data.len() });
    }
    if output.len() < data.len() {
        return Err(VeilError::invalid(format!(
            "output of {} bytes cannot hold {}",
            output.len(),
            data.len()
        )));
    }
    Writer::new(output).bytes(data)?;
    Ok(data.len())
}

fn read_grant_header(reader: &mut Reader<'_>) -> Result<GrantRequest> {
    let remote = DomainId(reader.u16()?);
    reader.skip(2)?;
    let pages = reader.u32()?;
    let flags = GrantFlags::from_bits_truncate(reader.u32()?);
    let notify_offset = reader.u32()?;
    let notify_port = LocalPort(reader.u32()?);
    reader.skip(4)?;
    let request_id = reader.u64()?;
    Ok(GrantRequest {
        remote,
        pages,
        flags,
        notify_offset,
        notify_port,
        request_id,
    })
}

impl Device {
    /// Decode and run one device control request
    pub fn ioctl(&self, client: ClientId, code: u32, input: &[u8], output: &mut [u8]) -> IoctlOutcome {
        let outcome = if !self.is_ready() {
            Err(VeilError::DeviceNotReady)
        } else {
            match RequestCode::from_u32(code) {
                Some(code) => self.dispatch(client, code, input, output),
                None => Err(VeilError::Unsupported(code)),
            }
        };

        match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!("request {:#x} from {} failed: {}", code, client, e);
                IoctlOutcome::failed(&e)
            }
        }
    }

    fn dispatch(&self, client: ClientId, code: RequestCode, input: &[u8], output: &mut [u8]) -> Result<IoctlOutcome> {
        trace!("{:?} in {} out {}", code, input.len(), output.len());
        match code {
            RequestCode::StoreRead => {
                let path = whole_str(input)?;
                let value = self.store_read(path)?;
                let mut data = value.into_bytes();
                data.push(0);
                copy_out(&data, output).map(IoctlOutcome::done)
            }

            RequestCode::StoreWrite => {
                expect_len("output", output.len(), 0)?;
                let (path, used) = valid_str(input).ok_or_else(|| VeilError::invalid("bad path"))?;
                let value = whole_str(&input[used..])?;
                self.store_write(path, value)?;
                Ok(IoctlOutcome::done(0))
            }

            RequestCode::StoreDirectory => {
                let path = whole_str(input)?;
                let entries = self.store_directory(path)?;
                copy_out(&encode_multi_sz(&entries), output).map(IoctlOutcome::done)
            }

            RequestCode::StoreRemove => {
                expect_len("output", output.len(), 0)?;
                let path = whole_str(input)?;
                self.store_remove(path)?;
                Ok(IoctlOutcome::done(0))
            }

            RequestCode::StoreSetPermissions => {
                expect_len("output", output.len(), 0)?;
                let mut reader = Reader::new(input);
                let path_len = reader.u32()? as usize;
                let count = reader.u32()? as usize;
                if path_len == 0 || path_len > STORE_ABS_PATH_MAX {
                    return Err(VeilError::invalid(format!("path length {path_len}")));
                }
                let expected = count
                    .checked_mul(PERMISSION_ENTRY_LEN)
                    .and_then(|n| n.checked_add(8 + path_len))
                    .ok_or_else(|| VeilError::invalid(format!("{count} permissions")))?;
                expect_len("input", input.len(), expected)?;

                let mut permissions = Vec::with_capacity(count);
                for _ in 0..count {
                    let domain = DomainId(reader.u16()?);
                    reader.skip(2)?;
                    let mask = StorePermissionMask::from_bits_retain(reader.u32()?);
                    permissions.push(StorePermission { domain, mask });
                }
                let path = whole_str(reader.bytes(path_len)?)?;
                self.store_set_permissions(path, &permissions)?;
                Ok(IoctlOutcome::done(0))
            }

            RequestCode::StoreAddWatch => {
                expect_len("output", output.len(), 8)?;
                let mut reader = Reader::new(input);
                let path_len = reader.u32()? as usize;
                reader.skip(4)?;
                let event = EventHandle(reader.u64()?);
                if path_len == 0 || path_len > STORE_ABS_PATH_MAX {
                    return Err(VeilError::invalid(format!("path length {path_len}")));
                }
                expect_len("input", input.len(), 16 + path_len)?;

                let mut path = reader.bytes(path_len)?.to_vec();
                path[path_len - 1] = 0;
                let path = whole_str(&path)?;

                let watch = self.add_watch(client, path, event)?;
                let mut writer = Writer::new(output);
                writer.u64(watch.0)?;
                Ok(IoctlOutcome::done(writer.written()))
            }

            RequestCode::StoreRemoveWatch => {
                expect_len("input", input.len(), 8)?;
                expect_len("output", output.len(), 0)?;
                let watch = WatchHandle(Reader::new(input).u64()?);
                self.remove_watch(client, watch)?;
                Ok(IoctlOutcome::done(0))
            }

            RequestCode::EvtchnBindUnbound | RequestCode::EvtchnBindInterdomain => {
                expect_len("input", input.len(), 16)?;
                expect_len("output", output.len(), 4)?;
                let mut reader = Reader::new(input);
                let remote = DomainId(reader.u16()?);
                let mask = reader.u8()? != 0;
                reader.skip(1)?;
                let remote_port = LocalPort(reader.u32()?);
                let event = EventHandle(reader.u64()?);

                let port = if code == RequestCode::EvtchnBindUnbound {
                    self.bind_unbound_channel(client, remote, mask, event)?
                } else {
                    self.bind_interdomain_channel(client, remote, remote_port, mask, event)?
                };

                let mut writer = Writer::new(output);
                writer.u32(port.0)?;
                Ok(IoctlOutcome::done(writer.written()))
            }

            RequestCode::EvtchnClose | RequestCode::EvtchnNotify | RequestCode::EvtchnUnmask => {
                expect_len("input", input.len(), 4)?;
                expect_len("output", output.len(), 0)?;
                let port = LocalPort(Reader::new(input).u32()?);
                match code {
                    RequestCode::EvtchnClose => self.close_channel(client, port)?,
                    RequestCode::EvtchnNotify => self.notify_channel(client, port)?,
                    _ => self.unmask_channel(client, port)?,
                }
                Ok(IoctlOutcome::done(0))
            }

            RequestCode::GnttabPermitForeignAccess => {
                expect_len("input", input.len(), GRANT_HEADER_LEN)?;
                expect_len("output", output.len(), 0)?;
                let request = read_grant_header(&mut Reader::new(input))?;
                self.permit_foreign_access(client, &request)
                    .map(IoctlOutcome::pending)
            }

            RequestCode::GnttabGetGrantResult => {
                expect_len("input", input.len(), 8)?;
                let request_id = Reader::new(input).u64()?;
                let result = self.get_grant_result(client, request_id, output.len())?;

                let mut writer = Writer::new(output);
                writer.u64(result.address.0)?;
                for reference in &result.references {
                    writer.u32(reference.0)?;
                }
                debug_assert_eq!(writer.written(), GrantResult::encoded_len(result.references.len() as u32));
                Ok(IoctlOutcome::done(writer.written()))
            }

            RequestCode::GnttabMapForeignPages => {
                expect_len("output", output.len(), 0)?;
                let mut reader = Reader::new(input);
                let header = read_grant_header(&mut reader)?;
                if header.pages == 0 || header.pages > MAX_PAGES {
                    return Err(VeilError::invalid(format!("page count {}", header.pages)));
                }
                expect_len("input", input.len(), GRANT_HEADER_LEN + 4 * header.pages as usize)?;

                let references = (0..header.pages)
                    .map(|_| reader.u32().map(GrantRef))
                    .collect::<Result<Vec<_>>>()?;
                let request = MapRequest {
                    remote: header.remote,
                    pages: header.pages,
                    flags: header.flags,
                    notify_offset: header.notify_offset,
                    notify_port: header.notify_port,
                    request_id: header.request_id,
                    references,
                };
                self.map_foreign_pages(client, &request).map(IoctlOutcome::pending)
            }

            RequestCode::GnttabGetMapResult => {
                expect_len("input", input.len(), 8)?;
                expect_len("output", output.len(), 8)?;
                let request_id = Reader::new(input).u64()?;
                let address = self.get_map_result(client, request_id)?;
                let mut writer = Writer::new(output);
                writer.u64(address.0)?;
                Ok(IoctlOutcome::done(writer.written()))
            }

            RequestCode::GnttabRevokeForeignAccess | RequestCode::GnttabUnmapForeignPages => {
                expect_len("input", input.len(), 8)?;
                expect_len("output", output.len(), 0)?;
                let request_id = Reader::new(input).u64()?;
                if code == RequestCode::GnttabRevokeForeignAccess {
                    self.revoke_foreign_access(client, request_id)?;
                } else {
                    self.unmap_foreign_pages(client, request_id)?;
                }
                Ok(IoctlOutcome::done(0))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Bus, Loopback};
    use crate::config::DeviceConfig;
    use std::sync::Arc;

    fn device() -> (Arc<Loopback>, Device) {
        let lb = Arc::new(Loopback::new(DomainId(0), 1024, 2));
        let config = DeviceConfig {
            deferred_workers: 2,
            ..DeviceConfig::default()
        };
        (lb.clone(), Device::new(Bus::loopback(lb), &config).unwrap())
    }

    fn grant_header(pages: u32, flags: u32, request_id: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u16.to_le_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&pages.to_le_bytes());
        buf.extend_from_slice(&flags.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&[0; 4]);
        buf.extend_from_slice(&request_id.to_le_bytes());
        buf
    }

    #[test]
    fn test_reader_bounds() {
        let data = [1u8, 0, 2, 0, 0, 0];
        let mut reader = Reader::new(&data);
        assert_eq!(reader.u16().unwrap(), 1);
        assert_eq!(reader.u32().unwrap(), 2);
        let err = reader.u8().unwrap_err();
        assert!(matches!(err, VeilError::InvalidSize { expected: 7, actual: 6 }));
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_request_codes_round_trip() {
        for code in RequestCode::ALL {
            assert_eq!(RequestCode::from_u32(code as u32), Some(code));
        }
        assert_eq!(RequestCode::from_u32(0x7ff), None);
    }

    #[test]
    fn test_unknown_code_is_unsupported() {
        let (_lb, device) = device();
        let outcome = device.ioctl(ClientId(1), 0x9999, &[], &mut []);
        assert_eq!(outcome.status, Status::UnsupportedRequest);
    }

    #[test]
    fn test_not_ready_wins_over_decoding() {
        let (_lb, device) = device();
        device.release_interfaces();
        let outcome = device.ioctl(ClientId(1), 0x9999, &[], &mut []);
        assert_eq!(outcome.status, Status::DeviceNotReady);
    }

    #[test]
    fn test_store_read_sizes() {
        let (lb, device) = device();
        use crate::bus::StoreService;
        lb.write("name", "veil").unwrap();
        let code = RequestCode::StoreRead as u32;

        let outcome = device.ioctl(ClientId(1), code, b"name\0", &mut []);
        assert_eq!(outcome.status, Status::BufferOverflow);
        assert_eq!(outcome.information, 5);

        let mut short = [0u8; 3];
        let outcome = device.ioctl(ClientId(1), code, b"name\0", &mut short);
        assert_eq!(outcome.status, Status::InvalidParameter);

        let mut out = [0u8; 16];
        let outcome = device.ioctl(ClientId(1), code, b"name\0", &mut out);
        assert_eq!(outcome.status, Status::Success);
        assert_eq!(&out[..outcome.information], b"veil\0");
    }

    #[test]
    fn test_store_write_and_directory() {
        let (_lb, device) = device();
        let client = ClientId(1);
        let write = RequestCode::StoreWrite as u32;
        assert!(device.ioctl(client, write, b"dir/a\x001\0", &mut []).status.is_success());
        assert!(device.ioctl(client, write, b"dir/b\x002\0", &mut []).status.is_success());
        assert_eq!(
            device.ioctl(client, write, b"dir/c\x003", &mut []).status,
            Status::InvalidParameter
        );

        let mut out = [0u8; 32];
        let outcome = device.ioctl(client, RequestCode::StoreDirectory as u32, b"dir\0", &mut out);
        assert!(outcome.status.is_success());
        assert_eq!(&out[..outcome.information], b"a\0b\0\0");
    }

    #[test]
    fn test_set_permissions_layout() {
        let (lb, device) = device();
        use crate::bus::StoreService;
        lb.write("node", "").unwrap();

        let mut input = Vec::new();
        input.extend_from_slice(&5u32.to_le_bytes());
        input.extend_from_slice(&1u32.to_le_bytes());
        input.extend_from_slice(&2u16.to_le_bytes());
        input.extend_from_slice(&[0, 0]);
        input.extend_from_slice(&StorePermissionMask::READ.bits().to_le_bytes());
        input.extend_from_slice(b"node\0");

        let code = RequestCode::StoreSetPermissions as u32;
        assert!(device.ioctl(ClientId(1), code, &input, &mut []).status.is_success());
        assert_eq!(lb.store_permissions("node").unwrap()[0].domain, DomainId(2));

        input.push(0);
        assert_eq!(device.ioctl(ClientId(1), code, &input, &mut []).status, Status::InvalidSize);
    }

    #[test]
    fn test_grant_over_the_abi() {
        let (lb, device) = device();
        let client = ClientId(1);

        let outcome = device.ioctl(
            client,
            RequestCode::GnttabPermitForeignAccess as u32,
            &grant_header(4, 0, 11),
            &mut [],
        );
        assert_eq!(outcome.status, Status::Pending);
        let pending = outcome.pending.unwrap();

        let get = RequestCode::GnttabGetGrantResult as u32;
        let mut wrong = [0u8; 8 + 4 * 3];
        assert_eq!(
            device.ioctl(client, get, &11u64.to_le_bytes(), &mut wrong).status,
            Status::InvalidSize
        );

        let mut out = [0u8; 8 + 4 * 4];
        let outcome = device.ioctl(client, get, &11u64.to_le_bytes(), &mut out);
        assert!(outcome.status.is_success());
        assert_eq!(outcome.information, out.len());
        assert_ne!(u64::from_le_bytes(out[..8].try_into().unwrap()), 0);

        let revoke = RequestCode::GnttabRevokeForeignAccess as u32;
        assert!(device.ioctl(client, revoke, &11u64.to_le_bytes(), &mut []).status.is_success());
        assert_eq!(pending.status(), Some(Status::Success));
        assert_eq!(lb.stats().active_grants, 0);
        assert_eq!(
            device.ioctl(client, get, &11u64.to_le_bytes(), &mut out).status,
            Status::NotFound
        );
    }

    #[test]
    fn test_map_size_checks() {
        let (_lb, device) = device();
        let code = RequestCode::GnttabMapForeignPages as u32;

        let mut input = grant_header(2, 0, 1);
        input.extend_from_slice(&8u32.to_le_bytes());
        assert_eq!(device.ioctl(ClientId(1), code, &input, &mut []).status, Status::InvalidSize);

        let zero = grant_header(0, 0, 1);
        assert_eq!(device.ioctl(ClientId(1), code, &zero, &mut []).status, Status::InvalidParameter);

        assert_eq!(
            device.ioctl(ClientId(1), code, &input[..20], &mut []).status,
            Status::InvalidSize
        );
    }

    #[test]
    fn test_bind_and_close_over_the_abi() {
        let (lb, device) = device();
        let client = ClientId(1);
        let (event, _) = lb.create_event(client);

        let mut input = Vec::new();
        input.extend_from_slice(&1u16.to_le_bytes());
        input.push(1);
        input.push(0);
        input.extend_from_slice(&0u32.to_le_bytes());
        input.extend_from_slice(&event.0.to_le_bytes());

        let mut out = [0u8; 4];
        let outcome = device.ioctl(client, RequestCode::EvtchnBindUnbound as u32, &input, &mut out);
        assert!(outcome.status.is_success());
        let port = u32::from_le_bytes(out);
        assert_eq!(lb.is_masked(LocalPort(port)), Some(true));

        let close = RequestCode::EvtchnClose as u32;
        assert_eq!(
            device.ioctl(ClientId(2), close, &port.to_le_bytes(), &mut []).status,
            Status::NotFound
        );
        assert!(device.ioctl(client, close, &port.to_le_bytes(), &mut []).status.is_success());
        assert_eq!(
            device
                .ioctl(client, RequestCode::EvtchnUnmask as u32, &port.to_le_bytes(), &mut [])
                .status,
            Status::InvalidParameter
        );
    }

    #[test]
    fn test_add_watch_forces_terminator() {
        let (lb, device) = device();
        let client = ClientId(1);
        let (event, _) = lb.create_event(client);

        let mut input = Vec::new();
        input.extend_from_slice(&5u32.to_le_bytes());
        input.extend_from_slice(&[0; 4]);
        input.extend_from_slice(&event.0.to_le_bytes());
        input.extend_from_slice(b"dataX");

        let mut out = [0u8; 8];
        let outcome = device.ioctl(client, RequestCode::StoreAddWatch as u32, &input, &mut out);
        assert!(outcome.status.is_success());
        assert_eq!(device.watch_count(), 1);

        let remove = RequestCode::StoreRemoveWatch as u32;
        assert!(device.ioctl(client, remove, &out, &mut []).status.is_success());
        assert_eq!(device.ioctl(client, remove, &out, &mut []).status, Status::NotFound);
    }
}
