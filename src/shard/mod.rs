mod buffer;
mod dedup;
mod reset;

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, span, warn, Level};

use nativeprof_object::ObjectFileError;

pub use buffer::ShardBuffer;
pub use dedup::{ExecutableDeduper, ExecutableHandle};
pub use reset::{CapacityDecision, ResetHysteresis, ResetState};

use crate::bpf::bindings::{
    ChunkDescriptor, MappingRecord, ProcessInfoRecord, MAPPING_TYPE_FILE, MAPPING_TYPE_JITTED,
    MAPPING_TYPE_SPECIAL,
};
use crate::bpf::maps::{clear_map, KernelMaps, MapError};
use crate::error::Error;
use crate::interpreter::InterpreterRegistry;
use crate::object::ObjectInspector;
use crate::process::{
    ExecutableMapping, ExecutableMappingType, ExecutableMappings, Pid, ProcessMappingCache,
    ProcessMappingsReader,
};
use crate::profiler::{Collaborators, ProfilerConfig};
use crate::stats::{Counter, ProfilerStats};
use crate::unwind_info::types::CompactUnwindRow;
use crate::unwind_info::{CompactRowEncoder, UnwindRowGenerator};

/// Where process and unwind information gets written to. Implementations
/// serialize every call, so callers may share one store between threads.
pub trait UnwindTableStore: Send + Sync {
    /// Writes the process information of `pid`, generating the unwind tables
    /// of the executables it maps that have not been seen before.
    fn add_unwind_table_for_process(
        &self,
        pid: Pid,
        mappings: Option<ExecutableMappings>,
        check_cache: bool,
        default_uses_frame_pointer: bool,
    ) -> Result<(), Error>;

    /// Writes the open shard to the kernel.
    fn persist_unwind_table(&self) -> Result<(), Error>;

    /// Re-adds `pid` if its mappings changed since they were last written.
    /// Returns whether anything was written.
    fn refresh(
        &self,
        pid: Pid,
        mappings: Option<ExecutableMappings>,
        default_uses_frame_pointer: bool,
    ) -> Result<bool, Error>;
}

/// Length of the longest prefix of `rows` that fits in `available` rows and
/// ends on an end of function marker, if any.
pub fn next_chunk_len(rows: &[CompactUnwindRow], available: usize) -> Option<usize> {
    rows[..rows.len().min(available)]
        .iter()
        .rposition(CompactUnwindRow::is_end_of_function_marker)
        .map(|i| i + 1)
}

#[derive(Debug, PartialEq, Eq)]
enum PersistOutcome {
    Empty,
    Persisted,
    Reset,
}

struct ShardState {
    buffer: ShardBuffer,
    shard_index: u64,
    deduper: ExecutableDeduper,
    unwind_info_reset: ResetHysteresis,
    process_info_reset: ResetHysteresis,
    /// Encoded process information, reused between writes.
    process_info_scratch: Vec<u8>,
}

/// Allocates the unwind tables of every executable mapped by the profiled
/// processes into fixed-size shards, never splitting a function between two
/// chunks, and keeps the per process information the tracer needs in sync.
pub struct UnwindShardManager {
    state: Mutex<ShardState>,
    maps: KernelMaps,
    process_cache: ProcessMappingCache,
    objects: Arc<dyn ObjectInspector>,
    unwind_rows: Arc<dyn UnwindRowGenerator>,
    mappings: Arc<dyn ProcessMappingsReader>,
    interpreters: Arc<InterpreterRegistry>,
    stats: Arc<ProfilerStats>,
    max_chunks: usize,
    max_mappings_per_process: usize,
}

impl UnwindShardManager {
    pub fn new(
        config: &ProfilerConfig,
        maps: KernelMaps,
        collaborators: &Collaborators,
        interpreters: Arc<InterpreterRegistry>,
        stats: Arc<ProfilerStats>,
    ) -> Self {
        let process_cache_size =
            NonZeroUsize::new(config.process_cache_size).unwrap_or(NonZeroUsize::MIN);

        UnwindShardManager {
            state: Mutex::new(ShardState {
                buffer: ShardBuffer::new(
                    CompactRowEncoder::new(config.architecture),
                    config.shard_capacity,
                ),
                shard_index: 0,
                deduper: ExecutableDeduper::new(),
                unwind_info_reset: ResetHysteresis::new(
                    config.min_rounds_before_redoing_unwind_info,
                ),
                process_info_reset: ResetHysteresis::new(
                    config.min_rounds_before_redoing_process_info,
                ),
                process_info_scratch: Vec::with_capacity(ProcessInfoRecord::encoded_size(
                    config.max_mappings_per_process,
                )),
            }),
            maps,
            process_cache: ProcessMappingCache::new(process_cache_size),
            objects: collaborators.objects.clone(),
            unwind_rows: collaborators.unwind_rows.clone(),
            mappings: collaborators.mappings.clone(),
            interpreters,
            stats,
            max_chunks: config.max_unwind_chunks,
            max_mappings_per_process: config.max_mappings_per_process,
        }
    }

    /// Marks the end of a profiling round, which is what resets wait for.
    pub fn finish_profiling_round(&self) {
        let mut state = self.state.lock().unwrap();
        state.unwind_info_reset.on_round_finished();
        state.process_info_reset.on_round_finished();
    }

    pub fn shard_index(&self) -> u64 {
        self.state.lock().unwrap().shard_index
    }

    pub fn unique_executables(&self) -> usize {
        self.state.lock().unwrap().deduper.len()
    }

    pub fn is_blocked(&self) -> bool {
        self.state.lock().unwrap().unwind_info_reset.is_blocked()
    }

    pub fn process_is_known(&self, pid: Pid) -> bool {
        self.process_cache.get(pid).is_some()
    }

    fn mapping_record(
        &self,
        state: &mut ShardState,
        pid: Pid,
        mapping: &ExecutableMapping,
    ) -> Result<MappingRecord, Error> {
        let mut record = MappingRecord {
            load_address: 0,
            begin: mapping.start_addr,
            end: mapping.end_addr,
            executable_id: 0,
            kind: MAPPING_TYPE_FILE,
        };

        let path = match (mapping.kind, mapping.procfs_path(pid)) {
            (ExecutableMappingType::Anonymous, _) => {
                record.kind = MAPPING_TYPE_JITTED;
                record.load_address = mapping.load_address;
                return Ok(record);
            }
            (ExecutableMappingType::Special, _) => {
                record.kind = MAPPING_TYPE_SPECIAL;
                record.load_address = mapping.load_address;
                return Ok(record);
            }
            (ExecutableMappingType::FileBacked, Some(path)) => path,
            (ExecutableMappingType::FileBacked, None) => return Ok(record),
        };

        let summary = match self.objects.inspect(&path) {
            Ok(summary) => summary,
            Err(ObjectFileError::Parse(e)) => {
                debug!("could not parse {}: {}, no unwind info", path.display(), e);
                return Ok(record);
            }
            Err(e) => return Err(Error::BuildId { path, source: e }),
        };

        // Non position independent executables are mapped at the addresses they
        // were linked at.
        if !mapping.main_object || summary.is_dynamic {
            record.load_address = mapping.load_address;
        }

        let (handle, already_seen) = state.deduper.handle_for(&summary.build_id);
        if !already_seen {
            if let Err(e) = self.add_unwind_table_for_executable(state, handle, &path) {
                state.deduper.forget(&summary.build_id);
                return Err(e);
            }
        }
        record.executable_id = handle;

        Ok(record)
    }

    fn add_unwind_table_for_executable(
        &self,
        state: &mut ShardState,
        handle: ExecutableHandle,
        path: &Path,
    ) -> Result<(), Error> {
        let span = span!(Level::DEBUG, "generate_unwind_table", path = %path.display()).entered();
        let table = match self.unwind_rows.generate(path) {
            Ok(table) => table,
            Err(e) => {
                debug!("no unwind information for {}: {}", path.display(), e);
                return Ok(());
            }
        };
        span.exit();

        if table.arch != state.buffer.encoder().arch() {
            debug!(
                "skipping {}, built for {:?}",
                path.display(),
                table.arch
            );
            return Ok(());
        }

        let mut chunks = Vec::new();
        let mut rows = &table.rows[..];
        while !rows.is_empty() {
            if state.unwind_info_reset.is_blocked() {
                return Err(Error::NeedMoreProfilingRounds);
            }

            let Some(len) = next_chunk_len(rows, state.buffer.available()) else {
                if state.buffer.is_empty() {
                    return Err(Error::UnwindTableTooLarge {
                        path: path.to_path_buf(),
                        rows: rows.len(),
                    });
                }
                self.allocate_new_shard(state)?;
                continue;
            };

            let chunk = &rows[..len];
            let (low_index, high_index) = state.buffer.push_rows(chunk);
            chunks.push(ChunkDescriptor {
                low_pc: chunk[0].pc,
                high_pc: chunk[len - 1].pc,
                shard_index: state.shard_index,
                low_index,
                high_index,
            });
            rows = &rows[len..];

            if state.buffer.available() == 0 {
                self.allocate_new_shard(state)?;
            }
        }

        if chunks.len() > self.max_chunks {
            warn!(
                "{} needs {} chunks, only the first {} will be used",
                path.display(),
                chunks.len(),
                self.max_chunks
            );
        }

        self.maps.unwind_info_chunks.update(
            &handle.to_ne_bytes(),
            &ChunkDescriptor::encode_all(&chunks, self.max_chunks),
        )?;

        debug!(
            "unwind table for {} has {} rows in {} chunks, handle {}",
            path.display(),
            table.rows.len(),
            chunks.len(),
            handle
        );
        Ok(())
    }

    /// Seals the open shard and moves on to the next one.
    fn allocate_new_shard(&self, state: &mut ShardState) -> Result<(), Error> {
        if self.persist_locked(state)? == PersistOutcome::Reset {
            return Err(Error::UnwindStateReset);
        }
        state.buffer.reset();
        state.shard_index += 1;
        Ok(())
    }

    fn persist_locked(&self, state: &mut ShardState) -> Result<PersistOutcome, Error> {
        if state.buffer.is_empty() {
            return Ok(PersistOutcome::Empty);
        }

        let key = state.shard_index.to_ne_bytes();
        match self.maps.unwind_tables.update(&key, state.buffer.as_bytes()) {
            Ok(()) => {
                self.stats.incr(Counter::ShardsPersisted);
                Ok(PersistOutcome::Persisted)
            }
            Err(MapError::CapacityExhausted(_)) => {
                match state.unwind_info_reset.on_capacity_exhausted() {
                    CapacityDecision::Wait => {
                        debug!(
                            "no room for shard {}, waiting for more profiling rounds",
                            state.shard_index
                        );
                        Err(Error::NeedMoreProfilingRounds)
                    }
                    CapacityDecision::Reset => {
                        self.reset_unwind_state(state);
                        Ok(PersistOutcome::Reset)
                    }
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn reset_unwind_state(&self, state: &mut ShardState) {
        warn!(
            "all {} shards are in use, resetting unwind information after {} rounds",
            state.shard_index + 1,
            state.unwind_info_reset.rounds_since_reset()
        );

        self.process_cache.purge();
        state.deduper.clear();
        state.shard_index = 0;
        state.buffer.reset();
        state.unwind_info_reset.on_reset();

        clear_map(self.maps.process_info.as_ref());
        clear_map(self.maps.unwind_info_chunks.as_ref());
        clear_map(self.maps.stack_traces.as_ref());
        clear_map(self.maps.stack_counts.as_ref());

        self.stats.incr(Counter::UnwindStateResets);
    }

    /// Returns whether the record was written. A full map that can't be reset
    /// yet is not an error, the process is retried on its next event.
    fn write_process_info(
        &self,
        state: &mut ShardState,
        pid: Pid,
        record: &ProcessInfoRecord,
    ) -> Result<bool, Error> {
        let key = pid.to_ne_bytes();
        record.encode_into(&mut state.process_info_scratch, self.max_mappings_per_process);

        match self
            .maps
            .process_info
            .update(&key, &state.process_info_scratch)
        {
            Err(MapError::CapacityExhausted(_)) => {
                match state.process_info_reset.on_capacity_exhausted() {
                    CapacityDecision::Wait => {
                        debug!("process info map is full, skipping pid {}", pid);
                        Ok(false)
                    }
                    CapacityDecision::Reset => {
                        info!("process info map is full, resetting it");
                        self.process_cache.purge();
                        clear_map(self.maps.process_info.as_ref());
                        state.process_info_reset.on_reset();
                        self.stats.incr(Counter::ProcessInfoResets);

                        self.maps
                            .process_info
                            .update(&key, &state.process_info_scratch)?;
                        Ok(true)
                    }
                }
            }
            other => {
                other?;
                Ok(true)
            }
        }
    }
}

impl UnwindTableStore for UnwindShardManager {
    fn add_unwind_table_for_process(
        &self,
        pid: Pid,
        mappings: Option<ExecutableMappings>,
        check_cache: bool,
        default_uses_frame_pointer: bool,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();

        if check_cache {
            if let Some(fingerprint) = self.process_cache.get(pid) {
                let unchanged = mappings
                    .as_ref()
                    .map_or(true, |mappings| mappings.fingerprint() == fingerprint);
                if unchanged {
                    return Ok(());
                }
            }
        }

        let mappings = match mappings {
            Some(mappings) => mappings,
            None => self.mappings.executable_mappings(pid)?,
        };

        if mappings.len() >= self.max_mappings_per_process {
            return Err(Error::TooManyExecutableMappings {
                pid,
                count: mappings.len(),
                max: self.max_mappings_per_process,
            });
        }

        let mut records = Vec::with_capacity(mappings.len());
        for mapping in mappings.iter() {
            if mapping.is_jit_dump() {
                continue;
            }
            records.push(self.mapping_record(&mut state, pid, mapping)?);
        }

        let record = ProcessInfoRecord {
            should_use_fp_by_default: default_uses_frame_pointer,
            is_jit_compiler: mappings.has_jitted_code(),
            interpreter_type: self.interpreters.interpreter_type(pid),
            mappings: records,
        };
        if self.write_process_info(&mut state, pid, &record)? {
            self.process_cache.add(pid, mappings.fingerprint());
        }

        Ok(())
    }

    fn persist_unwind_table(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        self.persist_locked(&mut state).map(|_| ())
    }

    fn refresh(
        &self,
        pid: Pid,
        mappings: Option<ExecutableMappings>,
        default_uses_frame_pointer: bool,
    ) -> Result<bool, Error> {
        let mappings = match mappings {
            Some(mappings) => mappings,
            None => self.mappings.executable_mappings(pid)?,
        };

        if self.process_cache.get(pid) == Some(mappings.fingerprint()) {
            return Ok(false);
        }

        self.add_unwind_table_for_process(pid, Some(mappings), false, default_uses_frame_pointer)?;
        Ok(true)
    }
}
