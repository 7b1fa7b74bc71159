//! Store pass-through with request validation
//!
//! Requests arrive as raw byte strings. A string is accepted only if it
//! is printable up to a terminating NUL that lies inside the buffer.

use std::sync::Arc;

use tracing::{debug, error, trace};

use crate::bus::StoreService;
use crate::error::{Result, VeilError};
use crate::types::{StorePermission, StorePermissionMask, STORE_ABS_PATH_MAX};

/// Decode a NUL-terminated printable string at the start of `buf`
///
/// Returns the string and the number of bytes consumed, terminator
/// included.
pub fn valid_str(buf: &[u8]) -> Option<(&str, usize)> {
    for (i, byte) in buf.iter().enumerate() {
        if *byte == 0 {
            // printable ASCII is valid UTF-8
            return std::str::from_utf8(&buf[..i]).ok().map(|s| (s, i + 1));
        }
        if !(0x20..=0x7e).contains(byte) {
            return None;
        }
    }
    None
}

fn is_printable(s: &str) -> bool {
    s.bytes().all(|b| (0x20..=0x7e).contains(&b))
}

/// Path length check for requests that carry an explicit length
///
/// `path` excludes the terminator, so at most `STORE_ABS_PATH_MAX - 1`
/// bytes are allowed.
pub fn validate_abs_path(path: &str) -> Result<()> {
    if path.is_empty() || path.len() + 1 > STORE_ABS_PATH_MAX {
        return Err(VeilError::invalid(format!(
            "store path length {} outside 1..{}",
            path.len(),
            STORE_ABS_PATH_MAX
        )));
    }
    Ok(())
}

/// Encode directory entries as NUL-separated names with a final NUL
pub fn encode_multi_sz(entries: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in entries {
        out.extend_from_slice(entry.as_bytes());
        out.push(0);
    }
    if entries.is_empty() {
        out.push(0);
    }
    out.push(0);
    out
}

pub struct StoreGateway {
    store: Arc<dyn StoreService>,
}

impl StoreGateway {
    pub fn new(store: Arc<dyn StoreService>) -> Self {
        Self { store }
    }

    fn check(&self, what: &str, s: &str) -> Result<()> {
        if is_printable(s) {
            Ok(())
        } else {
            Err(VeilError::invalid(format!("{what} is not printable")))
        }
    }

    pub fn read(&self, path: &str) -> Result<String> {
        self.check("path", path)?;
        let value = self.store.read(path).map_err(|e| {
            error!("read of \"{}\" failed: {}", path, e);
            VeilError::from(e)
        })?;
        trace!("(\"{}\")->\"{}\"", path, value);
        Ok(value)
    }

    pub fn write(&self, path: &str, value: &str) -> Result<()> {
        self.check("path", path)?;
        self.check("value", value)?;
        self.store.write(path, value).map_err(|e| {
            error!("write of \"{}\" failed: {}", path, e);
            VeilError::from(e)
        })?;
        trace!("(\"{}\"=\"{}\")", path, value);
        Ok(())
    }

    pub fn directory(&self, path: &str) -> Result<Vec<String>> {
        self.check("path", path)?;
        let entries = self.store.directory(path).map_err(|e| {
            error!("directory of \"{}\" failed: {}", path, e);
            VeilError::from(e)
        })?;
        debug!("(\"{}\")=({})", path, entries.len());
        Ok(entries)
    }

    pub fn remove(&self, path: &str) -> Result<()> {
        self.check("path", path)?;
        self.store.remove(path).map_err(|e| {
            error!("remove of \"{}\" failed: {}", path, e);
            VeilError::from(e)
        })?;
        Ok(())
    }

    pub fn set_permissions(&self, path: &str, permissions: &[StorePermission]) -> Result<()> {
        validate_abs_path(path)?;
        debug!("> Path '{}', NumberPermissions {}", path, permissions.len());

        for (index, permission) in permissions.iter().enumerate() {
            trace!("> {}: Domain {}, Mask {:?}", index, permission.domain, permission.mask);
            if !StorePermissionMask::all().contains(permission.mask) {
                return Err(VeilError::invalid(format!(
                    "permission {index} has mask bits outside read|write"
                )));
            }
        }

        self.store.set_permissions(path, permissions).map_err(|e| {
            error!("set permissions on \"{}\" failed: {}", path, e);
            VeilError::from(e)
        })?;
        Ok(())
    }
}
