use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, span, Level};

pub const PROCESS_INFO_MAP: &str = "process_info";
pub const UNWIND_TABLES_MAP: &str = "unwind_tables";
pub const UNWIND_INFO_CHUNKS_MAP: &str = "unwind_info_chunks";
pub const STACK_TRACES_MAP: &str = "stack_traces";
pub const STACK_COUNTS_MAP: &str = "stack_counts";
pub const SYMBOL_TABLE_MAP: &str = "symbol_table";
pub const EVENTS_MAP: &str = "events";

#[derive(Debug, Error)]
pub enum MapError {
    /// `E2BIG`: the map has no room for another element.
    #[error("map {0} is full")]
    CapacityExhausted(String),
    #[error("key not found in map {0}")]
    NotFound(String),
    #[error("map {map} expects {expected} bytes for its {what}, got {got}")]
    SizeMismatch {
        map: String,
        what: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("operation on map {map} failed: {errno}")]
    Os { map: String, errno: errno::Errno },
    #[error("operation on map {map} failed: {reason}")]
    Libbpf { map: String, reason: String },
}

/// A kernel map shared with the tracer. Keys and values are raw bytes laid
/// out as described in `bpf::bindings`.
pub trait KernelMap: Send + Sync {
    fn name(&self) -> &str;
    fn update(&self, key: &[u8], value: &[u8]) -> Result<(), MapError>;
    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MapError>;
    fn delete(&self, key: &[u8]) -> Result<(), MapError>;
    fn keys(&self) -> Result<Vec<Vec<u8>>, MapError>;
}

/// Deletes every entry of `map`. Failures are logged and counted, never propagated.
pub fn clear_map(map: &dyn KernelMap) {
    let _span = span!(Level::DEBUG, "clear_map", map = map.name()).entered();

    let keys = match map.keys() {
        Ok(keys) => keys,
        Err(e) => {
            debug!("could not list keys of map {}: {}", map.name(), e);
            return;
        }
    };

    let total_entries = keys.len();
    let failures = keys.iter().filter(|key| map.delete(key).is_err()).count();

    debug!(
        "clearing map {} found {} entries, failed to delete {} entries",
        map.name(),
        total_entries,
        failures
    );
}

/// Map kept in memory, behaving like a kernel hash map with `max_entries`
/// elements: inserting a new key into a full map fails with
/// [`MapError::CapacityExhausted`]. Used to run the engine without a tracer.
pub struct MemoryMap {
    name: String,
    max_entries: usize,
    entries: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    updates: AtomicUsize,
}

impl MemoryMap {
    pub fn new(name: &str, max_entries: usize) -> Self {
        MemoryMap {
            name: name.to_string(),
            max_entries,
            entries: Mutex::new(BTreeMap::new()),
            updates: AtomicUsize::new(0),
        }
    }

    /// Number of successful updates since creation.
    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KernelMap for MemoryMap {
    fn name(&self) -> &str {
        &self.name
    }

    fn update(&self, key: &[u8], value: &[u8]) -> Result<(), MapError> {
        let mut entries = self.entries.lock().unwrap();
        if !entries.contains_key(key) && entries.len() >= self.max_entries {
            return Err(MapError::CapacityExhausted(self.name.clone()));
        }
        entries.insert(key.to_vec(), value.to_vec());
        self.updates.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MapError> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn delete(&self, key: &[u8]) -> Result<(), MapError> {
        match self.entries.lock().unwrap().remove(key) {
            Some(_) => Ok(()),
            None => Err(MapError::NotFound(self.name.clone())),
        }
    }

    fn keys(&self) -> Result<Vec<Vec<u8>>, MapError> {
        Ok(self.entries.lock().unwrap().keys().cloned().collect())
    }
}

/// The maps this engine reads and writes.
#[derive(Clone)]
pub struct KernelMaps {
    pub process_info: Arc<dyn KernelMap>,
    /// Keyed by shard index.
    pub unwind_tables: Arc<dyn KernelMap>,
    /// Keyed by executable handle.
    pub unwind_info_chunks: Arc<dyn KernelMap>,
    pub stack_traces: Arc<dyn KernelMap>,
    pub stack_counts: Arc<dyn KernelMap>,
    pub symbol_table: Option<Arc<dyn KernelMap>>,
}

/// Concrete handles to in-memory maps, kept around so their contents can be inspected.
#[derive(Clone)]
pub struct MemoryMaps {
    pub process_info: Arc<MemoryMap>,
    pub unwind_tables: Arc<MemoryMap>,
    pub unwind_info_chunks: Arc<MemoryMap>,
    pub stack_traces: Arc<MemoryMap>,
    pub stack_counts: Arc<MemoryMap>,
    pub symbol_table: Arc<MemoryMap>,
}

impl MemoryMaps {
    pub fn new(max_shards: usize) -> Self {
        MemoryMaps {
            process_info: Arc::new(MemoryMap::new(PROCESS_INFO_MAP, 4096)),
            unwind_tables: Arc::new(MemoryMap::new(UNWIND_TABLES_MAP, max_shards)),
            unwind_info_chunks: Arc::new(MemoryMap::new(UNWIND_INFO_CHUNKS_MAP, 5000)),
            stack_traces: Arc::new(MemoryMap::new(STACK_TRACES_MAP, 100_000)),
            stack_counts: Arc::new(MemoryMap::new(STACK_COUNTS_MAP, 10_240)),
            symbol_table: Arc::new(MemoryMap::new(SYMBOL_TABLE_MAP, 100_000)),
        }
    }

    pub fn kernel_maps(&self) -> KernelMaps {
        KernelMaps {
            process_info: self.process_info.clone(),
            unwind_tables: self.unwind_tables.clone(),
            unwind_info_chunks: self.unwind_info_chunks.clone(),
            stack_traces: self.stack_traces.clone(),
            stack_counts: self.stack_counts.clone(),
            symbol_table: Some(self.symbol_table.clone()),
        }
    }

    /// Total number of successful writes to the maps the unwinding machinery owns.
    pub fn unwind_writes(&self) -> usize {
        self.process_info.updates() + self.unwind_tables.updates() + self.unwind_info_chunks.updates()
    }
}
