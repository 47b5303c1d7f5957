use std::ffi::c_void;
use std::os::fd::{AsFd, AsRawFd};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use libbpf_rs::{MapCore, MapFlags, MapHandle};
use tracing::debug;

use crate::bpf::maps::*;

/// A map pinned by the tracer in the BPF filesystem.
pub struct PinnedMap {
    name: String,
    handle: MapHandle,
}

impl PinnedMap {
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        let path = dir.join(name);
        let handle = MapHandle::from_pinned_path(&path)
            .with_context(|| format!("opening pinned map {}", path.display()))?;
        debug!(
            "opened map {} key_size={} value_size={}",
            name,
            handle.key_size(),
            handle.value_size()
        );

        Ok(PinnedMap {
            name: name.to_string(),
            handle,
        })
    }

    pub fn handle(&self) -> &MapHandle {
        &self.handle
    }

    fn check_size(&self, what: &'static str, expected: u32, got: usize) -> Result<(), MapError> {
        if expected as usize != got {
            return Err(MapError::SizeMismatch {
                map: self.name.clone(),
                what,
                expected: expected as usize,
                got,
            });
        }
        Ok(())
    }

    fn libbpf_error(&self, error: &libbpf_rs::Error) -> MapError {
        MapError::Libbpf {
            map: self.name.clone(),
            reason: error.to_string(),
        }
    }
}

impl KernelMap for PinnedMap {
    fn name(&self) -> &str {
        &self.name
    }

    fn update(&self, key: &[u8], value: &[u8]) -> Result<(), MapError> {
        self.check_size("key", self.handle.key_size(), key.len())?;
        self.check_size("value", self.handle.value_size(), value.len())?;

        // Going through libbpf-sys directly as we need the raw errno to tell
        // a full map apart from other failures.
        // Safety: the key and value sizes match the map's, checked above.
        let ret = unsafe {
            libbpf_sys::bpf_map_update_elem(
                self.handle.as_fd().as_raw_fd(),
                key.as_ptr() as *const c_void,
                value.as_ptr() as *const c_void,
                libbpf_sys::BPF_ANY as u64,
            )
        };

        match -ret {
            0 => Ok(()),
            libc::E2BIG | libc::ENOSPC => Err(MapError::CapacityExhausted(self.name.clone())),
            code => Err(MapError::Os {
                map: self.name.clone(),
                errno: errno::Errno(code),
            }),
        }
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MapError> {
        self.check_size("key", self.handle.key_size(), key.len())?;
        self.handle
            .lookup(key, MapFlags::ANY)
            .map_err(|e| self.libbpf_error(&e))
    }

    fn delete(&self, key: &[u8]) -> Result<(), MapError> {
        self.check_size("key", self.handle.key_size(), key.len())?;
        self.handle.delete(key).map_err(|e| match e.kind() {
            libbpf_rs::ErrorKind::NotFound => MapError::NotFound(self.name.clone()),
            _ => self.libbpf_error(&e),
        })
    }

    fn keys(&self) -> Result<Vec<Vec<u8>>, MapError> {
        Ok(self.handle.keys().collect())
    }
}

impl KernelMaps {
    /// Opens the maps the tracer pinned under `dir`.
    pub fn from_pinned(dir: &Path, with_symbol_table: bool) -> Result<Self> {
        let open = |name: &str| -> Result<Arc<dyn KernelMap>> { Ok(Arc::new(PinnedMap::open(dir, name)?)) };

        Ok(KernelMaps {
            process_info: open(PROCESS_INFO_MAP)?,
            unwind_tables: open(UNWIND_TABLES_MAP)?,
            unwind_info_chunks: open(UNWIND_INFO_CHUNKS_MAP)?,
            stack_traces: open(STACK_TRACES_MAP)?,
            stack_counts: open(STACK_COUNTS_MAP)?,
            symbol_table: if with_symbol_table {
                Some(open(SYMBOL_TABLE_MAP)?)
            } else {
                None
            },
        })
    }
}
