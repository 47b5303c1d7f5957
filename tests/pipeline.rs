use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use rand::Rng;

use nativeprof::batcher::batch;
use nativeprof::bpf::bindings::{
    encode_count, encode_stack_trace, ChunkDescriptor, ProcessInfoRecord, StackCountKey,
};
use nativeprof::bpf::bindings::{MAPPING_TYPE_FILE, MAPPING_TYPE_JITTED, MAPPING_TYPE_SPECIAL};
use nativeprof::bpf::maps::{KernelMap, MemoryMap, MemoryMaps};
use nativeprof::dispatcher::{EventDispatcher, KernelEvent};
use nativeprof::error::Error;
use nativeprof::error_tracker::LastErrors;
use nativeprof::frame_pointers::{FramePointerDetector, FramePointerError};
use nativeprof::interpreter::InterpreterRegistry;
use nativeprof::object::{ObjectInspector, ObjectSummary};
use nativeprof::process::{
    ExecutableMapping, ExecutableMappingType, ExecutableMappings, Pid, ProcessMappingsReader,
};
use nativeprof::process_info::{ProcessData, ProcessInfoFetcher};
use nativeprof::profiler::{Collaborators, Profiler, ProfilerConfig};
use nativeprof::shard::{UnwindShardManager, UnwindTableStore};
use nativeprof::stats::{Counter, ProfilerStats};
use nativeprof::unwind_info::types::{CfaType, CompactUnwindRow};
use nativeprof::unwind_info::{CompactRowEncoder, UnwindInfoError, UnwindRowGenerator, UnwindTable};
use nativeprof::util::architecture;
use nativeprof_object::{BuildId, ObjectFileError};

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Executables by file name.
#[derive(Default)]
struct FakeObjects {
    objects: HashMap<String, ObjectSummary>,
    unparseable: HashSet<String>,
}

impl FakeObjects {
    fn with(self, name: &str, build_id: &[u8]) -> Self {
        self.insert(name, build_id, true)
    }

    /// An executable that is not position independent.
    fn with_static(self, name: &str, build_id: &[u8]) -> Self {
        self.insert(name, build_id, false)
    }

    fn with_unparseable(mut self, name: &str) -> Self {
        self.unparseable.insert(name.to_string());
        self
    }

    fn insert(mut self, name: &str, build_id: &[u8], is_dynamic: bool) -> Self {
        self.objects.insert(
            name.to_string(),
            ObjectSummary {
                build_id: BuildId::gnu(build_id),
                is_dynamic,
            },
        );
        self
    }
}

impl ObjectInspector for FakeObjects {
    fn inspect(&self, path: &Path) -> Result<ObjectSummary, ObjectFileError> {
        let name = file_name(path);
        if self.unparseable.contains(&name) {
            let e = object::File::parse(&b"not an object file"[..])
                .err()
                .expect("garbage should not parse");
            return Err(ObjectFileError::Parse(e));
        }
        self.objects.get(&name).cloned().ok_or_else(|| {
            ObjectFileError::Io(std::io::Error::from(std::io::ErrorKind::NotFound))
        })
    }
}

/// Rows for functions of the given sizes, each size counting the end of
/// function marker.
fn functions(sizes: &[usize]) -> Vec<CompactUnwindRow> {
    let mut pc = 0x1000;
    let mut rows = Vec::new();
    for size in sizes {
        for _ in 1..*size {
            rows.push(CompactUnwindRow {
                pc,
                cfa_type: CfaType::FramePointerOffset,
                cfa_offset: 16,
                ..Default::default()
            });
            pc += 4;
        }
        rows.push(CompactUnwindRow::stop_unwinding(pc));
        pc += 4;
    }
    rows
}

/// Function sizes by executable file name.
#[derive(Default)]
struct FakeUnwindRows {
    tables: HashMap<String, Vec<usize>>,
    calls: AtomicUsize,
}

impl FakeUnwindRows {
    fn with(mut self, name: &str, sizes: &[usize]) -> Self {
        self.tables.insert(name.to_string(), sizes.to_vec());
        self
    }
}

impl UnwindRowGenerator for FakeUnwindRows {
    fn generate(&self, path: &Path) -> Result<UnwindTable, UnwindInfoError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let sizes = self
            .tables
            .get(&file_name(path))
            .ok_or(UnwindInfoError::EhFrameSectionNotFound)?;
        Ok(UnwindTable {
            rows: functions(sizes),
            arch: architecture(),
        })
    }
}

#[derive(Default)]
struct FakeMappings {
    processes: Mutex<HashMap<Pid, ExecutableMappings>>,
}

impl FakeMappings {
    fn set(&self, pid: Pid, mappings: ExecutableMappings) {
        self.processes.lock().unwrap().insert(pid, mappings);
    }
}

impl ProcessMappingsReader for FakeMappings {
    fn executable_mappings(&self, pid: Pid) -> Result<ExecutableMappings, Error> {
        self.processes
            .lock()
            .unwrap()
            .get(&pid)
            .cloned()
            .ok_or(Error::ProcessGone(pid))
    }
}

/// Blocks every fetch until the gate's sender is dropped.
struct FakeProcessInfo {
    gate: Option<Receiver<()>>,
    fetches: AtomicUsize,
}

impl FakeProcessInfo {
    fn open() -> Self {
        FakeProcessInfo {
            gate: None,
            fetches: AtomicUsize::new(0),
        }
    }

    fn gated(gate: Receiver<()>) -> Self {
        FakeProcessInfo {
            gate: Some(gate),
            fetches: AtomicUsize::new(0),
        }
    }
}

impl ProcessInfoFetcher for FakeProcessInfo {
    fn fetch(&self, pid: Pid) -> Result<ProcessData, Error> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let _ = gate.recv();
        }
        Ok(ProcessData {
            pid,
            interpreter: None,
            mappings: None,
        })
    }

    fn fetch_with_fresh_mappings(&self, pid: Pid) -> Result<ProcessData, Error> {
        self.fetch(pid)
    }
}

struct NoFramePointers;

impl FramePointerDetector for NoFramePointers {
    fn has_frame_pointers(&self, _executable: &Path) -> Result<bool, FramePointerError> {
        Ok(false)
    }
}

/// Remembers what it was asked to do.
#[derive(Default)]
struct RecordingStore {
    added: Mutex<Vec<Pid>>,
    persists: AtomicUsize,
}

impl UnwindTableStore for RecordingStore {
    fn add_unwind_table_for_process(
        &self,
        pid: Pid,
        _mappings: Option<ExecutableMappings>,
        _check_cache: bool,
        _default_uses_frame_pointer: bool,
    ) -> Result<(), Error> {
        self.added.lock().unwrap().push(pid);
        Ok(())
    }

    fn persist_unwind_table(&self) -> Result<(), Error> {
        self.persists.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn refresh(
        &self,
        _pid: Pid,
        _mappings: Option<ExecutableMappings>,
        _default_uses_frame_pointer: bool,
    ) -> Result<bool, Error> {
        Ok(false)
    }
}

fn file_mapping(path: &str, start_addr: u64, end_addr: u64, main_object: bool) -> ExecutableMapping {
    ExecutableMapping {
        kind: ExecutableMappingType::FileBacked,
        start_addr,
        end_addr,
        offset: 0,
        load_address: start_addr,
        path: Some(PathBuf::from(path)),
        main_object,
    }
}

struct Harness {
    maps: MemoryMaps,
    manager: UnwindShardManager,
    mappings: Arc<FakeMappings>,
    unwind_rows: Arc<FakeUnwindRows>,
    stats: Arc<ProfilerStats>,
}

fn collaborators(
    objects: FakeObjects,
    unwind_rows: Arc<FakeUnwindRows>,
    mappings: Arc<FakeMappings>,
    process_info: Arc<dyn ProcessInfoFetcher>,
) -> Collaborators {
    Collaborators {
        process_info,
        frame_pointers: Arc::new(NoFramePointers),
        objects: Arc::new(objects),
        unwind_rows,
        mappings,
    }
}

fn harness(config: &ProfilerConfig, objects: FakeObjects, unwind_rows: FakeUnwindRows) -> Harness {
    harness_with_maps(config, MemoryMaps::new(config.max_shards), objects, unwind_rows)
}

fn harness_with_maps(
    config: &ProfilerConfig,
    maps: MemoryMaps,
    objects: FakeObjects,
    unwind_rows: FakeUnwindRows,
) -> Harness {
    let mappings = Arc::new(FakeMappings::default());
    let unwind_rows = Arc::new(unwind_rows);
    let stats = Arc::new(ProfilerStats::default());
    let manager = UnwindShardManager::new(
        config,
        maps.kernel_maps(),
        &collaborators(
            objects,
            unwind_rows.clone(),
            mappings.clone(),
            Arc::new(FakeProcessInfo::open()),
        ),
        Arc::new(InterpreterRegistry::new(NonZeroUsize::new(1024).unwrap())),
        stats.clone(),
    );

    Harness {
        maps,
        manager,
        mappings,
        unwind_rows,
        stats,
    }
}

fn process_info(maps: &MemoryMaps, pid: Pid, config: &ProfilerConfig) -> ProcessInfoRecord {
    let bytes = maps.process_info.lookup(&pid.to_ne_bytes()).unwrap().unwrap();
    ProcessInfoRecord::decode(&bytes, config.max_mappings_per_process).unwrap()
}

fn chunks(maps: &MemoryMaps, handle: u64, config: &ProfilerConfig) -> Vec<ChunkDescriptor> {
    let bytes = maps
        .unwind_info_chunks
        .lookup(&handle.to_ne_bytes())
        .unwrap()
        .unwrap();
    ChunkDescriptor::decode_all(&bytes, config.max_unwind_chunks).unwrap()
}

fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_shared_executables_get_one_handle() {
    let config = ProfilerConfig {
        shard_capacity: 100,
        ..Default::default()
    };
    let h = harness(
        &config,
        FakeObjects::default()
            .with("libfoo.so", b"foo")
            .with("app", b"app"),
        FakeUnwindRows::default()
            .with("libfoo.so", &[3, 4])
            .with("app", &[2]),
    );

    h.mappings.set(
        100,
        ExecutableMappings(vec![
            file_mapping("/usr/lib/libfoo.so", 0x1000, 0x2000, false),
            file_mapping("/usr/lib/libfoo.so", 0x2000, 0x3000, false),
            file_mapping("/usr/lib/libfoo.so", 0x3000, 0x4000, false),
            file_mapping("/usr/bin/app", 0x8000, 0x9000, false),
        ]),
    );

    h.manager
        .add_unwind_table_for_process(100, None, true, false)
        .unwrap();

    let record = process_info(&h.maps, 100, &config);
    let ids: Vec<u64> = record.mappings.iter().map(|m| m.executable_id).collect();
    assert_eq!(ids, vec![1, 1, 1, 2]);
    assert_eq!(h.manager.unique_executables(), 2);
    assert_eq!(h.unwind_rows.calls.load(Ordering::Relaxed), 2);

    // The unwind rows of both executables sit in shard 0, one after the other.
    assert_eq!(
        chunks(&h.maps, 1, &config),
        vec![ChunkDescriptor {
            low_pc: 0x1000,
            high_pc: 0x1000 + 6 * 4,
            shard_index: 0,
            low_index: 0,
            high_index: 7,
        }]
    );
    assert_eq!(chunks(&h.maps, 2, &config)[0].low_index, 7);
}

#[test]
fn test_adding_a_known_process_writes_nothing() {
    let config = ProfilerConfig::default();
    let h = harness(
        &config,
        FakeObjects::default().with("app", b"app"),
        FakeUnwindRows::default().with("app", &[5, 5]),
    );
    h.mappings.set(
        1,
        ExecutableMappings(vec![file_mapping("/usr/bin/app", 0x1000, 0x2000, true)]),
    );
    h.mappings.set(
        2,
        ExecutableMappings(vec![file_mapping("/usr/bin/app", 0x1000, 0x2000, true)]),
    );

    h.manager.add_unwind_table_for_process(1, None, true, false).unwrap();
    let writes = h.maps.unwind_writes();

    h.manager.add_unwind_table_for_process(1, None, true, false).unwrap();
    assert_eq!(h.maps.unwind_writes(), writes);

    // Another process running the same executable only needs its process info.
    let chunk_writes = h.maps.unwind_info_chunks.updates();
    h.manager.add_unwind_table_for_process(2, None, true, false).unwrap();
    assert_eq!(h.maps.unwind_info_chunks.updates(), chunk_writes);
    assert_eq!(h.maps.process_info.len(), 2);
    assert_eq!(h.unwind_rows.calls.load(Ordering::Relaxed), 1);
}

#[test]
fn test_refresh_only_writes_changed_mappings() {
    let config = ProfilerConfig::default();
    let h = harness(
        &config,
        FakeObjects::default().with("app", b"app").with("libc.so", b"libc"),
        FakeUnwindRows::default().with("app", &[4]).with("libc.so", &[4]),
    );
    let mut mappings = vec![file_mapping("/usr/bin/app", 0x1000, 0x2000, true)];
    h.mappings.set(1, ExecutableMappings(mappings.clone()));

    h.manager.add_unwind_table_for_process(1, None, true, false).unwrap();
    assert!(!h.manager.refresh(1, None, false).unwrap());

    mappings.push(file_mapping("/usr/lib/libc.so", 0x7000, 0x8000, false));
    assert!(h
        .manager
        .refresh(1, Some(ExecutableMappings(mappings)), false)
        .unwrap());
    assert_eq!(process_info(&h.maps, 1, &config).mappings.len(), 2);
}

#[test]
fn test_reset_waits_for_enough_profiling_rounds() {
    let config = ProfilerConfig {
        shard_capacity: 10,
        max_shards: 1,
        min_rounds_before_redoing_unwind_info: 5,
        ..Default::default()
    };
    let h = harness(
        &config,
        FakeObjects::default().with("app", b"app").with("other", b"other"),
        FakeUnwindRows::default()
            .with("app", &[5, 5, 5])
            .with("other", &[2]),
    );
    h.mappings.set(
        1,
        ExecutableMappings(vec![file_mapping("/usr/bin/app", 0x1000, 0x2000, true)]),
    );
    h.mappings.set(
        2,
        ExecutableMappings(vec![file_mapping("/usr/bin/other", 0x1000, 0x2000, true)]),
    );

    // Shard 0 is full and persisted, the last function went to shard 1.
    h.manager.add_unwind_table_for_process(1, None, true, false).unwrap();
    assert_eq!(h.manager.shard_index(), 1);

    // There is no room for shard 1 in the kernel.
    assert!(matches!(
        h.manager.persist_unwind_table(),
        Err(Error::NeedMoreProfilingRounds)
    ));
    assert!(h.manager.is_blocked());

    for _ in 1..5 {
        h.manager.finish_profiling_round();
        assert!(matches!(
            h.manager.persist_unwind_table(),
            Err(Error::NeedMoreProfilingRounds)
        ));
        // New executables are not accepted while blocked.
        assert!(matches!(
            h.manager.add_unwind_table_for_process(2, None, true, false),
            Err(Error::NeedMoreProfilingRounds)
        ));
    }
    assert_eq!(h.stats.get(Counter::UnwindStateResets), 0);

    h.manager.finish_profiling_round();
    h.manager.persist_unwind_table().unwrap();

    assert_eq!(h.stats.get(Counter::UnwindStateResets), 1);
    assert_eq!(h.manager.shard_index(), 0);
    assert!(!h.manager.is_blocked());
    assert_eq!(h.manager.unique_executables(), 0);
    assert!(!h.manager.process_is_known(1));
    assert!(h.maps.process_info.is_empty());
    assert!(h.maps.unwind_info_chunks.is_empty());

    // Everything starts over from handle 1 in shard 0.
    h.manager.add_unwind_table_for_process(2, None, true, false).unwrap();
    assert_eq!(process_info(&h.maps, 2, &config).mappings[0].executable_id, 1);
    assert_eq!(chunks(&h.maps, 1, &config)[0].shard_index, 0);
}

#[test]
fn test_functions_never_span_chunks() {
    let config = ProfilerConfig {
        shard_capacity: 64,
        max_shards: 256,
        ..Default::default()
    };
    let mut rng = rand::thread_rng();
    // Functions of at most half a shard keep every executable well within
    // its chunk limit.
    let executables: Vec<(String, Vec<usize>)> = (0..8)
        .map(|i| {
            let sizes = (0..rng.gen_range(1..20))
                .map(|_| rng.gen_range(1..=32))
                .collect();
            (format!("lib{}.so", i), sizes)
        })
        .collect();

    let mut objects = FakeObjects::default();
    let mut unwind_rows = FakeUnwindRows::default();
    let mut mappings = Vec::new();
    for (i, (name, sizes)) in executables.iter().enumerate() {
        objects = objects.with(name, name.as_bytes());
        unwind_rows = unwind_rows.with(name, sizes);
        let start = 0x10_0000 * (i as u64 + 1);
        mappings.push(file_mapping(&format!("/lib/{}", name), start, start + 0x1000, i == 0));
    }
    let h = harness(&config, objects, unwind_rows);
    h.mappings.set(1, ExecutableMappings(mappings));

    h.manager.add_unwind_table_for_process(1, None, true, false).unwrap();
    h.manager.persist_unwind_table().unwrap();

    let encoder = CompactRowEncoder::new(config.architecture);
    let row_size = encoder.row_size();
    let record = process_info(&h.maps, 1, &config);
    for (mapping, (_, sizes)) in record.mappings.iter().zip(&executables) {
        let expected_rows = functions(sizes);
        let mut seen = 0;
        for chunk in chunks(&h.maps, mapping.executable_id, &config) {
            assert!(chunk.low_index < chunk.high_index);
            assert!(chunk.high_index as usize <= config.shard_capacity);

            let shard = h
                .maps
                .unwind_tables
                .lookup(&chunk.shard_index.to_ne_bytes())
                .unwrap()
                .unwrap();
            let row = |index: u64| {
                let start = index as usize * row_size;
                encoder.decode(&shard[start..start + row_size]).unwrap()
            };

            assert!(row(chunk.high_index - 1).is_end_of_function_marker());
            assert_eq!(row(chunk.low_index).pc, chunk.low_pc);
            assert_eq!(row(chunk.high_index - 1).pc, chunk.high_pc);
            if chunk.low_index > 0 {
                assert!(row(chunk.low_index - 1).is_end_of_function_marker());
            }

            for index in chunk.low_index..chunk.high_index {
                assert_eq!(row(index), expected_rows[seen]);
                seen += 1;
            }
        }
        assert_eq!(seen, expected_rows.len());
    }
}

#[test]
fn test_function_larger_than_a_shard() {
    let config = ProfilerConfig {
        shard_capacity: 4,
        ..Default::default()
    };
    let h = harness(
        &config,
        FakeObjects::default().with("app", b"app"),
        FakeUnwindRows::default().with("app", &[2, 9]),
    );
    h.mappings.set(
        1,
        ExecutableMappings(vec![file_mapping("/usr/bin/app", 0x1000, 0x2000, true)]),
    );

    assert!(matches!(
        h.manager.add_unwind_table_for_process(1, None, true, false),
        Err(Error::UnwindTableTooLarge { rows: 9, .. })
    ));
    // The executable is retried from scratch next time.
    assert_eq!(h.manager.unique_executables(), 0);
    assert!(!h.manager.process_is_known(1));
}

#[test]
fn test_too_many_mappings() {
    let config = ProfilerConfig {
        max_mappings_per_process: 3,
        ..Default::default()
    };
    let h = harness(&config, FakeObjects::default(), FakeUnwindRows::default());
    h.mappings.set(
        1,
        ExecutableMappings(
            (0..3)
                .map(|i| file_mapping("/usr/bin/app", i * 0x1000, (i + 1) * 0x1000, i == 0))
                .collect(),
        ),
    );

    assert!(matches!(
        h.manager.add_unwind_table_for_process(1, None, true, false),
        Err(Error::TooManyExecutableMappings { count: 3, max: 3, .. })
    ));
}

fn other_mapping(kind: ExecutableMappingType, path: Option<&str>, start_addr: u64) -> ExecutableMapping {
    ExecutableMapping {
        kind,
        start_addr,
        end_addr: start_addr + 0x1000,
        offset: 0,
        load_address: start_addr,
        path: path.map(PathBuf::from),
        main_object: false,
    }
}

#[test]
fn test_unparseable_executable_is_skipped() {
    let config = ProfilerConfig::default();
    let h = harness(
        &config,
        FakeObjects::default()
            .with("app", b"app")
            .with_unparseable("broken.so"),
        FakeUnwindRows::default()
            .with("app", &[3])
            .with("broken.so", &[3]),
    );
    h.mappings.set(
        1,
        ExecutableMappings(vec![
            file_mapping("/usr/bin/app", 0x1000, 0x2000, true),
            file_mapping("/usr/lib/broken.so", 0x7000, 0x8000, false),
        ]),
    );

    h.manager.add_unwind_table_for_process(1, None, true, false).unwrap();

    let record = process_info(&h.maps, 1, &config);
    let ids: Vec<u64> = record.mappings.iter().map(|m| m.executable_id).collect();
    assert_eq!(ids, vec![1, 0]);
    assert_eq!(record.mappings[1].kind, MAPPING_TYPE_FILE);
    assert_eq!(h.unwind_rows.calls.load(Ordering::Relaxed), 1);
    assert!(h.manager.process_is_known(1));
}

#[test]
fn test_jitted_and_special_mappings() {
    let config = ProfilerConfig::default();
    let h = harness(
        &config,
        FakeObjects::default().with("app", b"app"),
        FakeUnwindRows::default().with("app", &[3]),
    );
    h.mappings.set(
        1,
        ExecutableMappings(vec![
            file_mapping("/usr/bin/app", 0x1000, 0x2000, true),
            other_mapping(ExecutableMappingType::Anonymous, None, 0x5000),
            other_mapping(ExecutableMappingType::FileBacked, Some("/tmp/jit-1.dump"), 0x6000),
            other_mapping(ExecutableMappingType::Special, Some("[vdso]"), 0x7000),
        ]),
    );

    h.manager.add_unwind_table_for_process(1, None, true, false).unwrap();

    let record = process_info(&h.maps, 1, &config);
    assert!(record.is_jit_compiler);
    // The jitdump file is left out.
    assert_eq!(record.mappings.len(), 3);

    let jitted = &record.mappings[1];
    assert_eq!(jitted.kind, MAPPING_TYPE_JITTED);
    assert_eq!(jitted.executable_id, 0);
    assert_eq!(jitted.load_address, 0x5000);
    assert_eq!((jitted.begin, jitted.end), (0x5000, 0x6000));

    let special = &record.mappings[2];
    assert_eq!(special.kind, MAPPING_TYPE_SPECIAL);
    assert_eq!(special.executable_id, 0);
    assert_eq!(special.load_address, 0x7000);
}

#[test]
fn test_load_address_of_static_executables() {
    let config = ProfilerConfig::default();
    let h = harness(
        &config,
        FakeObjects::default()
            .with_static("app", b"app")
            .with("libc.so", b"libc"),
        FakeUnwindRows::default()
            .with("app", &[3])
            .with("libc.so", &[3]),
    );
    h.mappings.set(
        1,
        ExecutableMappings(vec![
            file_mapping("/usr/bin/app", 0x40_0000, 0x40_1000, true),
            file_mapping("/usr/lib/libc.so", 0x7f00_0000, 0x7f00_1000, false),
        ]),
    );

    h.manager.add_unwind_table_for_process(1, None, true, false).unwrap();

    let record = process_info(&h.maps, 1, &config);
    assert_eq!(record.mappings[0].load_address, 0);
    assert_eq!(record.mappings[1].load_address, 0x7f00_0000);
}

#[test]
fn test_full_process_info_map_waits_for_enough_profiling_rounds() {
    let config = ProfilerConfig {
        min_rounds_before_redoing_process_info: 2,
        ..Default::default()
    };
    let mut maps = MemoryMaps::new(config.max_shards);
    maps.process_info = Arc::new(MemoryMap::new("process_info", 1));
    let h = harness_with_maps(
        &config,
        maps,
        FakeObjects::default().with("app", b"app"),
        FakeUnwindRows::default().with("app", &[3]),
    );
    for pid in [1, 2] {
        h.mappings.set(
            pid,
            ExecutableMappings(vec![file_mapping("/usr/bin/app", 0x1000, 0x2000, true)]),
        );
    }

    h.manager.add_unwind_table_for_process(1, None, true, false).unwrap();

    // No room for pid 2, which is tried again on its next event.
    for _ in 0..2 {
        h.manager.add_unwind_table_for_process(2, None, true, false).unwrap();
        assert!(!h.manager.process_is_known(2));
        assert_eq!(h.maps.process_info.len(), 1);
        h.manager.finish_profiling_round();
    }
    assert_eq!(h.stats.get(Counter::ProcessInfoResets), 0);

    h.manager.add_unwind_table_for_process(2, None, true, false).unwrap();
    assert_eq!(h.stats.get(Counter::ProcessInfoResets), 1);
    assert!(h.manager.process_is_known(2));
    assert!(!h.manager.process_is_known(1));
    assert_eq!(h.maps.process_info.len(), 1);
    assert_eq!(process_info(&h.maps, 2, &config).mappings[0].executable_id, 1);
    // Unwind information survives.
    assert_eq!(h.manager.unique_executables(), 1);
}

#[test]
fn test_reset_while_adding_a_process() {
    let config = ProfilerConfig {
        shard_capacity: 10,
        max_shards: 1,
        min_rounds_before_redoing_unwind_info: 0,
        ..Default::default()
    };
    let h = harness(
        &config,
        FakeObjects::default().with("app", b"app").with("other", b"other"),
        FakeUnwindRows::default()
            .with("app", &[5, 5, 5])
            .with("other", &[6]),
    );
    h.mappings.set(
        1,
        ExecutableMappings(vec![file_mapping("/usr/bin/app", 0x1000, 0x2000, true)]),
    );
    h.mappings.set(
        2,
        ExecutableMappings(vec![file_mapping("/usr/bin/other", 0x1000, 0x2000, true)]),
    );

    // Shard 0 is persisted, shard 1 holds the last function of app.
    h.manager.add_unwind_table_for_process(1, None, true, false).unwrap();
    assert_eq!(h.manager.shard_index(), 1);

    // other doesn't fit in shard 1, and shard 1 doesn't fit in the kernel.
    assert!(matches!(
        h.manager.add_unwind_table_for_process(2, None, true, false),
        Err(Error::UnwindStateReset)
    ));
    assert_eq!(h.stats.get(Counter::UnwindStateResets), 1);
    assert_eq!(h.manager.shard_index(), 0);
    assert_eq!(h.manager.unique_executables(), 0);
    assert!(!h.manager.process_is_known(1));
    assert!(h.maps.process_info.is_empty());

    h.manager.add_unwind_table_for_process(2, None, true, false).unwrap();
    assert_eq!(process_info(&h.maps, 2, &config).mappings[0].executable_id, 1);
}

fn dispatcher(
    config: &ProfilerConfig,
    process_info: Arc<FakeProcessInfo>,
    store: Arc<dyn UnwindTableStore>,
    stats: Arc<ProfilerStats>,
) -> (EventDispatcher, Receiver<Pid>) {
    let (unwind_requests_send, unwind_requests) = unbounded();
    let dispatcher = dispatcher_sending_to(config, process_info, store, stats, unwind_requests_send);
    (dispatcher, unwind_requests)
}

fn dispatcher_sending_to(
    config: &ProfilerConfig,
    process_info: Arc<FakeProcessInfo>,
    store: Arc<dyn UnwindTableStore>,
    stats: Arc<ProfilerStats>,
    unwind_requests_send: Sender<Pid>,
) -> EventDispatcher {
    let collaborators = collaborators(
        FakeObjects::default(),
        Arc::new(FakeUnwindRows::default()),
        Arc::new(FakeMappings::default()),
        process_info,
    );
    EventDispatcher::new(
        config,
        &collaborators,
        store,
        Arc::new(InterpreterRegistry::new(NonZeroUsize::new(16).unwrap())),
        stats,
        Arc::new(LastErrors::default()),
        unwind_requests_send,
    )
}

#[test]
fn test_process_info_requests_are_deduplicated() {
    let config = ProfilerConfig {
        workers: 2,
        ..Default::default()
    };
    let (gate_send, gate) = bounded::<()>(0);
    let process_info = Arc::new(FakeProcessInfo::gated(gate));
    let stats = Arc::new(ProfilerStats::default());
    let (dispatcher, _unwind_requests) = dispatcher(
        &config,
        process_info.clone(),
        Arc::new(RecordingStore::default()),
        stats.clone(),
    );

    let (events_send, events) = unbounded();
    let (_lost_send, lost) = unbounded();
    let (_stop_send, stop) = bounded(0);

    thread::scope(|scope| {
        scope.spawn(|| dispatcher.run(&events, &lost, &stop));

        events_send.send(KernelEvent::ProcessMappings(7).encode()).unwrap();
        events_send.send(KernelEvent::ProcessMappings(7).encode()).unwrap();
        wait_for("the duplicate to be dropped", || {
            stats.get(Counter::EventsDeduplicated) == 1
        });

        drop(gate_send);
        drop(events_send);
    });

    assert_eq!(process_info.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(stats.get(Counter::EventsProcessMappings), 2);
}

#[test]
fn test_stop_unblocks_a_full_work_queue() {
    let config = ProfilerConfig {
        workers: 1,
        ..Default::default()
    };
    let (gate_send, gate) = bounded::<()>(0);
    let process_info = Arc::new(FakeProcessInfo::gated(gate));
    let stats = Arc::new(ProfilerStats::default());
    let (dispatcher, _unwind_requests) = dispatcher(
        &config,
        process_info.clone(),
        Arc::new(RecordingStore::default()),
        stats.clone(),
    );

    let (events_send, events) = unbounded();
    let (_lost_send, lost) = unbounded::<u64>();
    let (stop_send, stop) = bounded::<()>(0);
    let (done_send, done) = bounded(1);
    thread::spawn(move || {
        dispatcher.run(&events, &lost, &stop);
        let _ = done_send.send(());
    });

    for pid in 1..=10 {
        events_send.send(KernelEvent::ProcessMappings(pid).encode()).unwrap();
    }
    // One pid is being fetched, four wait in the queue and the sixth can't
    // be queued.
    wait_for("the work queue to fill up", || {
        process_info.fetches.load(Ordering::SeqCst) == 1
            && stats.get(Counter::EventsProcessMappings) == 6
    });

    drop(stop_send);
    drop(gate_send);
    assert!(done.recv_timeout(Duration::from_secs(10)).is_ok());
    drop(events_send);
}

#[test]
fn test_stop_unblocks_a_full_unwind_request_queue() {
    let config = ProfilerConfig::default();
    let stats = Arc::new(ProfilerStats::default());
    let (unwind_requests_send, _unwind_requests) = bounded(1);
    let dispatcher = dispatcher_sending_to(
        &config,
        Arc::new(FakeProcessInfo::open()),
        Arc::new(RecordingStore::default()),
        stats.clone(),
        unwind_requests_send,
    );

    let (events_send, events) = unbounded();
    let (_lost_send, lost) = unbounded::<u64>();
    let (stop_send, stop) = bounded::<()>(0);
    let (done_send, done) = bounded(1);
    thread::spawn(move || {
        dispatcher.run(&events, &lost, &stop);
        let _ = done_send.send(());
    });

    // Nobody reads the requests, the second one can't be queued.
    events_send.send(KernelEvent::UnwindInfo(1).encode()).unwrap();
    events_send.send(KernelEvent::UnwindInfo(2).encode()).unwrap();
    wait_for("the request queue to fill up", || {
        stats.get(Counter::EventsUnwindInfo) == 2
    });

    drop(stop_send);
    assert!(done.recv_timeout(Duration::from_secs(10)).is_ok());
    drop(events_send);
}

#[test]
fn test_lost_events_are_counted() {
    let config = ProfilerConfig::default();
    let stats = Arc::new(ProfilerStats::default());
    let (dispatcher, _unwind_requests) = dispatcher(
        &config,
        Arc::new(FakeProcessInfo::open()),
        Arc::new(RecordingStore::default()),
        stats.clone(),
    );

    let (_events_send, events) = unbounded::<Vec<u8>>();
    let (lost_send, lost) = unbounded();
    let (stop_send, stop) = bounded::<()>(0);

    thread::scope(|scope| {
        scope.spawn(|| dispatcher.run(&events, &lost, &stop));

        lost_send.send(3).unwrap();
        lost_send.send(4).unwrap();
        // A closed lost events channel doesn't stop the dispatcher.
        drop(lost_send);
        wait_for("the lost events to be counted", || {
            stats.get(Counter::EventsLost) == 7
        });

        drop(stop_send);
    });
}

#[test]
fn test_unwind_info_requests_are_forwarded() {
    let config = ProfilerConfig::default();
    let stats = Arc::new(ProfilerStats::default());
    let (dispatcher, unwind_requests) = dispatcher(
        &config,
        Arc::new(FakeProcessInfo::open()),
        Arc::new(RecordingStore::default()),
        stats.clone(),
    );

    let (events_send, events) = unbounded();
    let (_lost_send, lost) = unbounded();
    let (_stop_send, stop) = bounded(0);

    events_send.send(KernelEvent::UnwindInfo(42).encode()).unwrap();
    events_send.send(Vec::new()).unwrap();
    drop(events_send);
    dispatcher.run(&events, &lost, &stop);

    assert_eq!(unwind_requests.try_recv(), Ok(42));
    assert_eq!(stats.get(Counter::EventsUnwindInfo), 1);
    assert_eq!(stats.get(Counter::EventsEmpty), 1);
}

#[test]
fn test_batched_unwind_requests_persist_once() {
    let config = ProfilerConfig::default();
    let store = Arc::new(RecordingStore::default());
    let (dispatcher, _unwind_requests) = dispatcher(
        &config,
        Arc::new(FakeProcessInfo::open()),
        store.clone(),
        Arc::new(ProfilerStats::default()),
    );

    let (requests_send, requests) = unbounded();
    let (_stop_send, stop) = bounded(0);
    for pid in [5, 5, 9] {
        requests_send.send(pid).unwrap();
    }
    drop(requests_send);

    let mut batches = 0;
    batch(&requests, Duration::from_millis(50), &stop, |pids| {
        batches += 1;
        dispatcher.load_unwind_info_batch(&pids);
    });

    assert_eq!(batches, 1);
    assert_eq!(*store.added.lock().unwrap(), vec![5, 5, 9]);
    assert_eq!(store.persists.load(Ordering::SeqCst), 1);
}

#[test]
fn test_profiler_end_to_end() {
    let config = ProfilerConfig {
        workers: 1,
        shard_capacity: 100,
        unwind_request_quiet_period: Duration::from_millis(20),
        event_idle_interval: Duration::from_millis(10),
        ..Default::default()
    };
    let maps = MemoryMaps::new(config.max_shards);
    let mappings = Arc::new(FakeMappings::default());
    mappings.set(
        300,
        ExecutableMappings(vec![file_mapping("/usr/bin/app", 0x1000, 0x2000, true)]),
    );
    let collaborators = collaborators(
        FakeObjects::default().with("app", b"app"),
        Arc::new(FakeUnwindRows::default().with("app", &[3, 3])),
        mappings,
        Arc::new(FakeProcessInfo::open()),
    );

    let profiler = Profiler::new(config, maps.kernel_maps(), collaborators);
    let handle = profiler.handle();
    let store = profiler.store();

    let (events_send, events) = unbounded();
    let (_lost_send, lost) = unbounded();
    let (stop_send, stop) = bounded(0);
    let profiler_thread = thread::spawn(move || profiler.run(events, lost, stop));

    events_send.send(KernelEvent::UnwindInfo(300).encode()).unwrap();
    wait_for("the shard to be persisted", || !maps.unwind_tables.is_empty());
    assert!(store.process_is_known(300));
    assert_eq!(process_info(&maps, 300, &ProfilerConfig::default()).mappings.len(), 1);

    maps.stack_traces
        .update(&1u64.to_ne_bytes(), &encode_stack_trace(&[0x1004, 0x1010]))
        .unwrap();
    maps.stack_counts
        .update(
            &StackCountKey {
                pid: 300,
                tid: 301,
                user_stack_id: 1,
                kernel_stack_id: 0,
                interpreter_stack_id: 0,
            }
            .encode(),
            &encode_count(4),
        )
        .unwrap();

    let dump = handle.dump().unwrap();
    let samples = &dump.processes[&300].samples;
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].user_stack, vec![0x1004, 0x1010]);
    assert_eq!(samples[0].count, 4);
    assert_eq!(handle.stats().get(Counter::ProfilingRounds), 1);
    assert!(handle.last_error().is_none());
    assert!(maps.stack_counts.is_empty());

    drop(stop_send);
    profiler_thread.join().unwrap();
    assert!(handle.dump().is_none());
}
