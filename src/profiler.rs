use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use tracing::{debug, error, info, span, warn, Level};

use crate::batcher::batch;
use crate::bpf::maps::KernelMaps;
use crate::collector::{InterpreterSymbolTable, ProcessRawData, ProfileCollector};
use crate::dispatcher::EventDispatcher;
use crate::error_tracker::LastErrors;
use crate::frame_pointers::{FramePointerDetector, ObjectFramePointerDetector};
use crate::interpreter::InterpreterRegistry;
use crate::object::{ElfObjectInspector, ObjectInspector};
use crate::process::{Pid, ProcessMappingsReader, ProcfsMappingsReader};
use crate::process_info::{ProcessInfoFetcher, ProcfsProcessInfoFetcher};
use crate::shard::UnwindShardManager;
use crate::stats::{Counter, ProfilerStats};
use crate::unwind_info::{DwarfUnwindRowGenerator, UnwindRowGenerator};
use crate::util::{architecture, Architecture};

/// Unwind information requests waiting for the batcher.
const UNWIND_REQUESTS_QUEUE_SIZE: usize = 1024;
const FRAME_POINTER_CACHE_SIZE: usize = 1024;

pub struct ProfilerConfig {
    /// Threads serving process information requests.
    pub workers: usize,
    pub dwarf_unwinding_enabled: bool,
    pub interpreter_unwinding_enabled: bool,
    /// Rows per shard.
    pub shard_capacity: usize,
    pub max_shards: usize,
    /// Chunks an executable's unwind table may be split into.
    pub max_unwind_chunks: usize,
    pub max_mappings_per_process: usize,
    pub min_rounds_before_redoing_unwind_info: u64,
    pub min_rounds_before_redoing_process_info: u64,
    pub process_cache_size: usize,
    pub interpreter_cache_size: usize,
    pub error_tracker_size: usize,
    /// How long unwind information requests are collected before being served.
    pub unwind_request_quiet_period: Duration,
    /// How long the dispatcher waits for events before checking for a stop.
    pub event_idle_interval: Duration,
    pub perf_buffer_bytes: usize,
    pub architecture: Architecture,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            dwarf_unwinding_enabled: true,
            interpreter_unwinding_enabled: false,
            shard_capacity: 250_000,
            max_shards: 30,
            max_unwind_chunks: 30,
            max_mappings_per_process: 400,
            min_rounds_before_redoing_unwind_info: 5,
            min_rounds_before_redoing_process_info: 5,
            process_cache_size: 100_000,
            interpreter_cache_size: 10_000,
            error_tracker_size: 512,
            unwind_request_quiet_period: Duration::from_millis(150),
            event_idle_interval: Duration::from_millis(100),
            perf_buffer_bytes: 512 * 1024,
            architecture: architecture(),
        }
    }
}

/// The services the engine relies on to learn about processes and executables.
#[derive(Clone)]
pub struct Collaborators {
    pub process_info: Arc<dyn ProcessInfoFetcher>,
    pub frame_pointers: Arc<dyn FramePointerDetector>,
    pub objects: Arc<dyn ObjectInspector>,
    pub unwind_rows: Arc<dyn UnwindRowGenerator>,
    pub mappings: Arc<dyn ProcessMappingsReader>,
}

impl Collaborators {
    /// Reads everything from procfs and the executables on disk.
    pub fn system() -> Self {
        Collaborators {
            process_info: Arc::new(ProcfsProcessInfoFetcher::default()),
            frame_pointers: Arc::new(ObjectFramePointerDetector::new(
                NonZeroUsize::new(FRAME_POINTER_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            )),
            objects: Arc::new(ElfObjectInspector),
            unwind_rows: Arc::new(DwarfUnwindRowGenerator),
            mappings: Arc::new(ProcfsMappingsReader),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DumpResponse {
    pub processes: HashMap<Pid, ProcessRawData>,
    pub interpreter_symbol_table: InterpreterSymbolTable,
}

type DumpRequest = Sender<DumpResponse>;

/// Used from other threads to request profiles and check on the profiler.
#[derive(Clone)]
pub struct ProfilerHandle {
    requests: Sender<DumpRequest>,
    stats: Arc<ProfilerStats>,
    last_errors: Arc<LastErrors>,
}

impl ProfilerHandle {
    /// Collects the samples gathered since the last dump. `None` once the
    /// profiler has stopped.
    pub fn dump(&self) -> Option<DumpResponse> {
        let (response_send, response_receive) = bounded(1);
        self.requests.send(response_send).ok()?;
        response_receive.recv().ok()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_errors.last()
    }

    pub fn process_last_errors(&self) -> HashMap<Pid, String> {
        self.last_errors.per_process()
    }

    pub fn stats(&self) -> &ProfilerStats {
        &self.stats
    }
}

pub struct Profiler {
    config: ProfilerConfig,
    maps: KernelMaps,
    collaborators: Collaborators,
    store: Arc<UnwindShardManager>,
    interpreters: Arc<InterpreterRegistry>,
    stats: Arc<ProfilerStats>,
    last_errors: Arc<LastErrors>,
    requests_send: Sender<DumpRequest>,
    requests: Receiver<DumpRequest>,
}

impl Profiler {
    pub fn new(config: ProfilerConfig, maps: KernelMaps, collaborators: Collaborators) -> Self {
        let stats = Arc::new(ProfilerStats::default());
        let interpreters = Arc::new(InterpreterRegistry::new(
            NonZeroUsize::new(config.interpreter_cache_size).unwrap_or(NonZeroUsize::MIN),
        ));
        let store = Arc::new(UnwindShardManager::new(
            &config,
            maps.clone(),
            &collaborators,
            interpreters.clone(),
            stats.clone(),
        ));
        let (requests_send, requests) = bounded(1);

        Profiler {
            config,
            maps,
            collaborators,
            store,
            interpreters,
            stats,
            last_errors: Arc::new(LastErrors::default()),
            requests_send,
            requests,
        }
    }

    pub fn handle(&self) -> ProfilerHandle {
        ProfilerHandle {
            requests: self.requests_send.clone(),
            stats: self.stats.clone(),
            last_errors: self.last_errors.clone(),
        }
    }

    pub fn store(&self) -> Arc<UnwindShardManager> {
        self.store.clone()
    }

    /// Runs the engine until `stop` receives or disconnects: the dispatcher
    /// and the unwind information batcher run on their own threads while this
    /// one serves dump requests, one profiling round each.
    pub fn run(self, events: Receiver<Vec<u8>>, lost: Receiver<u64>, stop: Receiver<()>) {
        let (unwind_requests_send, unwind_requests) = bounded(UNWIND_REQUESTS_QUEUE_SIZE);
        // Dropped to tell every thread to stop.
        let (shutdown_send, shutdown) = bounded::<()>(0);

        let dispatcher = EventDispatcher::new(
            &self.config,
            &self.collaborators,
            self.store.clone(),
            self.interpreters.clone(),
            self.stats.clone(),
            self.last_errors.clone(),
            unwind_requests_send,
        );
        let mut collector = ProfileCollector::new(self.maps.clone(), self.stats.clone());

        info!(
            "profiler running with {} workers, dwarf unwinding {}",
            self.config.workers,
            if self.config.dwarf_unwinding_enabled {
                "enabled"
            } else {
                "disabled"
            }
        );

        thread::scope(|scope| {
            let spawned = thread::Builder::new()
                .name("event-dispatcher".into())
                .spawn_scoped(scope, || dispatcher.run(&events, &lost, &shutdown));
            if let Err(e) = spawned {
                error!("could not spawn the event dispatcher: {}", e);
                return;
            }

            // The batcher owns the only receiver, so nobody stays blocked
            // sending to it once it returns.
            let dispatcher = &dispatcher;
            let shutdown = &shutdown;
            let quiet_period = self.config.unwind_request_quiet_period;
            let spawned = thread::Builder::new()
                .name("unwind-info-batcher".into())
                .spawn_scoped(scope, move || {
                    batch(&unwind_requests, quiet_period, shutdown, |pids| {
                        dispatcher.load_unwind_info_batch(&pids)
                    })
                });
            if let Err(e) = spawned {
                error!("could not spawn the unwind info batcher: {}", e);
                drop(shutdown_send);
                return;
            }

            loop {
                select! {
                    recv(stop) -> _ => break,
                    recv(self.requests) -> request => {
                        let Ok(response) = request else { break };
                        let dump = self.profiling_round(&mut collector);
                        if response.send(dump).is_err() {
                            debug!("dump requester went away");
                        }
                    }
                }
            }

            info!("stopping profiler");
            drop(shutdown_send);
        });
    }

    fn profiling_round(&self, collector: &mut ProfileCollector) -> DumpResponse {
        let _span = span!(Level::DEBUG, "profiling_round").entered();

        let processes = match collector.collect() {
            Ok(processes) => processes,
            Err(e) => {
                self.stats.incr(Counter::ProfilingRoundsFailed);
                warn!("failed to collect samples: {}", e);
                self.last_errors.set_last(Some(e.to_string()));
                return DumpResponse::default();
            }
        };
        self.store.finish_profiling_round();
        self.stats.incr(Counter::ProfilingRounds);
        self.last_errors.set_last(None);

        let mut interpreter_symbol_table = InterpreterSymbolTable::new();
        if self.config.interpreter_unwinding_enabled {
            match collector.interpreter_symbol_table(&processes) {
                Ok(table) => interpreter_symbol_table = table,
                Err(e) => debug!("failed to read the interpreter symbol table: {}", e),
            }
        }

        DumpResponse {
            processes,
            interpreter_symbol_table,
        }
    }
}
