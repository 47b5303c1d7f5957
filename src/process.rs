use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use lru::LruCache;
use procfs::process::{MMPermissions, MMapPath};

use crate::error::Error;

pub type Pid = i32;

/// What type of mapping we are dealing with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutableMappingType {
    /// An object file that got loaded from disk.
    FileBacked,
    /// Not file backed, typically produced by a JIT runtime.
    Anonymous,
    /// Special mapping to optimise certain system calls, such as the vDSO.
    Special,
}

/// An executable memory region of a process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutableMapping {
    pub kind: ExecutableMappingType,
    pub start_addr: u64,
    pub end_addr: u64,
    pub offset: u64,
    /// Start address of the first mapping of the same object.
    pub load_address: u64,
    /// Set for file backed mappings, as seen by the process.
    pub path: Option<PathBuf>,
    /// Whether this is the first file backed mapping, which is the executable itself.
    pub main_object: bool,
}

impl ExecutableMapping {
    pub fn is_file_backed(&self) -> bool {
        self.kind == ExecutableMappingType::FileBacked
    }

    pub fn is_jitted(&self) -> bool {
        self.kind == ExecutableMappingType::Anonymous
    }

    pub fn is_special(&self) -> bool {
        self.kind == ExecutableMappingType::Special
    }

    /// Files written by JIT compilers in the perf jitdump format (`jit-<pid>.dump`)
    /// are mapped executable so perf can find them, but they contain no code.
    pub fn is_jit_dump(&self) -> bool {
        let Some(file_name) = self
            .path
            .as_deref()
            .and_then(Path::file_name)
            .and_then(|name| name.to_str())
        else {
            return false;
        };
        file_name.starts_with("jit-") && file_name.ends_with(".dump")
    }

    /// Path to the backing file from our mount namespace.
    pub fn procfs_path(&self, pid: Pid) -> Option<PathBuf> {
        let path = self.path.as_ref()?;
        Some(PathBuf::from(format!(
            "/proc/{}/root{}",
            pid,
            path.to_string_lossy()
        )))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutableMappings(pub Vec<ExecutableMapping>);

impl ExecutableMappings {
    /// Reads the executable mappings of `pid` from procfs.
    pub fn for_pid(pid: Pid) -> Result<Self, Error> {
        let process = procfs::process::Process::new(pid).map_err(|e| Error::from_procfs(pid, e))?;
        let maps = process.maps().map_err(|e| Error::from_procfs(pid, e))?;

        let mut mappings = Vec::new();
        for map in maps.iter() {
            if !map.perms.contains(MMPermissions::EXECUTE) {
                continue;
            }

            let (kind, path) = match &map.pathname {
                MMapPath::Path(path) => {
                    // We've seen debug info executables that get deleted in Rust applications.
                    if path.to_string_lossy().contains("(deleted)") {
                        continue;
                    }
                    (ExecutableMappingType::FileBacked, Some(path.clone()))
                }
                MMapPath::Anonymous => (ExecutableMappingType::Anonymous, None),
                MMapPath::Vdso | MMapPath::Vsyscall => (ExecutableMappingType::Special, None),
                _ => continue,
            };

            // Find the first address for a file backed mapping. Some loaders split
            // the .rodata section in their own non-executable section, which we need
            // to account for here.
            let load_address = match kind {
                ExecutableMappingType::FileBacked => maps
                    .iter()
                    .find(|other| other.pathname == map.pathname)
                    .map(|other| other.address.0)
                    .unwrap_or(map.address.0),
                _ => map.address.0,
            };

            let main_object = kind == ExecutableMappingType::FileBacked
                && !mappings
                    .iter()
                    .any(|m: &ExecutableMapping| m.is_file_backed());

            mappings.push(ExecutableMapping {
                kind,
                start_addr: map.address.0,
                end_addr: map.address.1,
                offset: map.offset,
                load_address,
                path,
                main_object,
            });
        }

        Ok(ExecutableMappings(mappings))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExecutableMapping> {
        self.0.iter()
    }

    pub fn has_jitted_code(&self) -> bool {
        self.0.iter().any(ExecutableMapping::is_jitted)
    }

    /// Hash of the mappings that does not depend on their order.
    pub fn fingerprint(&self) -> u64 {
        let mut hashes: Vec<u64> = self
            .0
            .iter()
            .map(|mapping| {
                let mut hasher = DefaultHasher::new();
                mapping.hash(&mut hasher);
                hasher.finish()
            })
            .collect();
        hashes.sort_unstable();

        let mut hasher = DefaultHasher::new();
        hashes.hash(&mut hasher);
        hasher.finish()
    }
}

/// Reads the current executable mappings of a process.
pub trait ProcessMappingsReader: Send + Sync {
    fn executable_mappings(&self, pid: Pid) -> Result<ExecutableMappings, Error>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsMappingsReader;

impl ProcessMappingsReader for ProcfsMappingsReader {
    fn executable_mappings(&self, pid: Pid) -> Result<ExecutableMappings, Error> {
        ExecutableMappings::for_pid(pid)
    }
}

/// Remembers the mappings fingerprint of the processes whose information
/// was last written to the kernel.
pub struct ProcessMappingCache {
    fingerprints: Mutex<LruCache<Pid, u64>>,
}

impl ProcessMappingCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        ProcessMappingCache {
            fingerprints: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, pid: Pid) -> Option<u64> {
        self.fingerprints.lock().unwrap().get(&pid).copied()
    }

    pub fn add(&self, pid: Pid, fingerprint: u64) {
        self.fingerprints.lock().unwrap().put(pid, fingerprint);
    }

    pub fn purge(&self) {
        self.fingerprints.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.fingerprints.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
