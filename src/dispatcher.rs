use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, never, select, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, error, warn};

use nativeprof_object::ObjectFileError;

use crate::bpf::bindings::{
    REQUEST_PROCESS_MAPPINGS, REQUEST_REFRESH_PROC_INFO, REQUEST_UNWIND_INFORMATION,
};
use crate::error::Error as ProfilerError;
use crate::error_tracker::{ErrorTracker, LastErrors};
use crate::frame_pointers::FramePointerDetector;
use crate::interpreter::InterpreterRegistry;
use crate::process::Pid;
use crate::process_info::{ProcessData, ProcessInfoFetcher};
use crate::profiler::{Collaborators, ProfilerConfig};
use crate::shard::UnwindTableStore;
use crate::stats::{Counter, ProfilerStats};

/// A request from the tracer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelEvent {
    /// A process has no unwind information for the code it is running.
    UnwindInfo(Pid),
    /// A process we know nothing about was sampled.
    ProcessMappings(Pid),
    /// The tracer found a program counter outside of the known mappings.
    RefreshProcessInfo(Pid),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("empty event")]
    Empty,
    #[error("event of {0} bytes is too short")]
    Truncated(usize),
    #[error("unknown event {0:#x}")]
    Unknown(u64),
}

impl KernelEvent {
    pub fn parse(payload: &[u8]) -> Result<Self, EventError> {
        if payload.is_empty() {
            return Err(EventError::Empty);
        }
        let Some(bytes) = payload.get(..8) else {
            return Err(EventError::Truncated(payload.len()));
        };
        let mut raw = [0; 8];
        raw.copy_from_slice(bytes);
        let payload = u64::from_ne_bytes(raw);
        let pid = payload as u32 as Pid;

        if payload & REQUEST_UNWIND_INFORMATION != 0 {
            Ok(KernelEvent::UnwindInfo(pid))
        } else if payload & REQUEST_PROCESS_MAPPINGS != 0 {
            Ok(KernelEvent::ProcessMappings(pid))
        } else if payload & REQUEST_REFRESH_PROC_INFO != 0 {
            Ok(KernelEvent::RefreshProcessInfo(pid))
        } else {
            Err(EventError::Unknown(payload))
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let (flag, pid) = match *self {
            KernelEvent::UnwindInfo(pid) => (REQUEST_UNWIND_INFORMATION, pid),
            KernelEvent::ProcessMappings(pid) => (REQUEST_PROCESS_MAPPINGS, pid),
            KernelEvent::RefreshProcessInfo(pid) => (REQUEST_REFRESH_PROC_INFO, pid),
        };
        (flag | pid as u32 as u64).to_ne_bytes().to_vec()
    }
}

/// Pids with work queued or running.
#[derive(Clone, Default)]
struct InFlight(Arc<Mutex<HashSet<Pid>>>);

impl InFlight {
    fn try_claim(&self, pid: Pid) -> Option<InFlightGuard> {
        if !self.0.lock().unwrap().insert(pid) {
            return None;
        }
        Some(InFlightGuard {
            pid,
            in_flight: self.clone(),
        })
    }
}

/// Releases its pid when dropped, however the work went.
struct InFlightGuard {
    pid: Pid,
    in_flight: InFlight,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.0.lock().unwrap().remove(&self.pid);
    }
}

enum WorkItem {
    Prefetch(InFlightGuard),
    Refresh(InFlightGuard),
}

/// Sends `item` unless `stop` fires first. Returns whether it was sent.
fn send_or_stop<T>(sender: &Sender<T>, item: T, stop: &Receiver<()>) -> bool {
    select! {
        send(sender, item) -> result => result.is_ok(),
        recv(stop) -> _ => false,
    }
}

/// Routes the tracer's events: unwind information requests go to the batcher
/// through `unwind_requests`, process information requests are served by a
/// pool of workers.
pub struct EventDispatcher {
    workers: usize,
    dwarf_unwinding_enabled: bool,
    idle_interval: Duration,
    process_info: Arc<dyn ProcessInfoFetcher>,
    frame_pointers: Arc<dyn FramePointerDetector>,
    store: Arc<dyn UnwindTableStore>,
    interpreters: Arc<InterpreterRegistry>,
    stats: Arc<ProfilerStats>,
    last_errors: Arc<LastErrors>,
    text_section_errors: ErrorTracker,
    unwind_requests: Sender<Pid>,
}

impl EventDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &ProfilerConfig,
        collaborators: &Collaborators,
        store: Arc<dyn UnwindTableStore>,
        interpreters: Arc<InterpreterRegistry>,
        stats: Arc<ProfilerStats>,
        last_errors: Arc<LastErrors>,
        unwind_requests: Sender<Pid>,
    ) -> Self {
        EventDispatcher {
            workers: config.workers.max(1),
            dwarf_unwinding_enabled: config.dwarf_unwinding_enabled,
            idle_interval: config.event_idle_interval,
            process_info: collaborators.process_info.clone(),
            frame_pointers: collaborators.frame_pointers.clone(),
            store,
            interpreters,
            stats,
            last_errors,
            text_section_errors: ErrorTracker::new(
                "no_text_section",
                NonZeroUsize::new(config.error_tracker_size).unwrap_or(NonZeroUsize::MIN),
            ),
            unwind_requests,
        }
    }

    /// Dispatches events until `stop` fires or `events` disconnects, then
    /// waits for the workers to finish what they are doing. Every queue send
    /// gives up once `stop` fires.
    pub fn run(&self, events: &Receiver<Vec<u8>>, lost: &Receiver<u64>, stop: &Receiver<()>) {
        let (prefetch_send, prefetch_receive) = bounded(self.workers * 4);
        let (refresh_send, refresh_receive) = bounded(self.workers * 2);
        let fetching = InFlight::default();
        let refreshing = InFlight::default();

        thread::scope(|scope| {
            for i in 0..self.workers {
                let prefetch = prefetch_receive.clone();
                let refresh = refresh_receive.clone();
                let stop = stop.clone();
                let spawned = thread::Builder::new()
                    .name(format!("event-worker-{}", i))
                    .spawn_scoped(scope, move || self.work(&prefetch, &refresh, &stop));
                if let Err(e) = spawned {
                    error!("could not spawn event worker: {}", e);
                }
            }
            // Only the workers receive, sends fail once they are all gone.
            drop(prefetch_receive);
            drop(refresh_receive);

            let mut lost_open = true;
            let lost_closed = never();
            loop {
                let lost = if lost_open { lost } else { &lost_closed };
                select! {
                    recv(stop) -> _ => break,
                    recv(events) -> payload => match payload {
                        Ok(payload) => self.dispatch(
                            &payload,
                            &prefetch_send,
                            &refresh_send,
                            &fetching,
                            &refreshing,
                            stop,
                        ),
                        Err(_) => break,
                    },
                    recv(lost) -> count => match count {
                        Ok(count) => {
                            self.stats.add(Counter::EventsLost, count);
                            warn!("lost {} events", count);
                        }
                        Err(_) => lost_open = false,
                    },
                    default(self.idle_interval) => {}
                }
            }

            drop(prefetch_send);
            drop(refresh_send);
        });
    }

    fn dispatch(
        &self,
        payload: &[u8],
        prefetch: &Sender<WorkItem>,
        refresh: &Sender<WorkItem>,
        fetching: &InFlight,
        refreshing: &InFlight,
        stop: &Receiver<()>,
    ) {
        let event = match KernelEvent::parse(payload) {
            Ok(event) => event,
            Err(EventError::Empty) => {
                self.stats.incr(Counter::EventsEmpty);
                return;
            }
            Err(e) => {
                self.stats.incr(Counter::EventsUnknown);
                debug!("ignoring event: {}", e);
                return;
            }
        };

        match event {
            KernelEvent::UnwindInfo(pid) => {
                if !self.dwarf_unwinding_enabled {
                    return;
                }
                self.stats.incr(Counter::EventsUnwindInfo);
                if !send_or_stop(&self.unwind_requests, pid, stop) {
                    debug!("unwind info batcher is gone, dropping request for pid {}", pid);
                }
            }
            KernelEvent::ProcessMappings(pid) => {
                self.stats.incr(Counter::EventsProcessMappings);
                match fetching.try_claim(pid) {
                    Some(guard) => {
                        send_or_stop(prefetch, WorkItem::Prefetch(guard), stop);
                    }
                    None => self.stats.incr(Counter::EventsDeduplicated),
                }
            }
            KernelEvent::RefreshProcessInfo(pid) => {
                self.stats.incr(Counter::EventsRefreshProcessInfo);
                match refreshing.try_claim(pid) {
                    Some(guard) => {
                        send_or_stop(refresh, WorkItem::Refresh(guard), stop);
                    }
                    None => self.stats.incr(Counter::EventsDeduplicated),
                }
            }
        }
    }

    fn work(&self, prefetch: &Receiver<WorkItem>, refresh: &Receiver<WorkItem>, stop: &Receiver<()>) {
        loop {
            let item = select! {
                recv(stop) -> _ => return,
                recv(prefetch) -> item => item,
                recv(refresh) -> item => item,
            };
            let Ok(item) = item else {
                return;
            };

            match item {
                WorkItem::Prefetch(guard) => {
                    let _ = self.prefetch_process_info(guard.pid);
                }
                WorkItem::Refresh(guard) => self.refresh_process_info(guard.pid, stop),
            }
        }
    }

    fn register_interpreter(&self, data: &ProcessData) {
        if let Some(interpreter) = &data.interpreter {
            self.interpreters.add(data.pid, interpreter.clone());
        }
    }

    fn prefetch_process_info(&self, pid: Pid) -> Result<(), ProfilerError> {
        match self.process_info.fetch(pid) {
            Ok(data) => {
                self.register_interpreter(&data);
                Ok(())
            }
            Err(e) => {
                debug!("failed to prefetch process info for pid {}: {}", pid, e);
                Err(e)
            }
        }
    }

    fn refresh_process_info(&self, pid: Pid, stop: &Receiver<()>) {
        let data = match self.process_info.fetch_with_fresh_mappings(pid) {
            Ok(data) => data,
            Err(e) => {
                debug!("failed to fetch process info for pid {}: {}", pid, e);
                return;
            }
        };
        self.register_interpreter(&data);

        let Some(uses_frame_pointers) = self.default_uses_frame_pointers(pid) else {
            return;
        };

        match self.store.refresh(pid, data.mappings, uses_frame_pointers) {
            // New rows are persisted with the next batch.
            Ok(true) => {
                send_or_stop(&self.unwind_requests, pid, stop);
            }
            Ok(false) => {}
            Err(e) => self.record_add_error(pid, e),
        }
    }

    /// Whether the main executable of `pid` is likely to have frame pointers.
    /// `None` when that can't be known and the process should be left alone.
    fn default_uses_frame_pointers(&self, pid: Pid) -> Option<bool> {
        let executable = PathBuf::from(format!("/proc/{}/exe", pid));
        match self.frame_pointers.has_frame_pointers(&executable) {
            Ok(uses_frame_pointers) => Some(uses_frame_pointers),
            Err(e) if e.is_inconclusive() => {
                debug!(
                    "frame pointer detection for {} failed: {}, assuming none",
                    executable.display(),
                    e
                );
                Some(false)
            }
            Err(e) => {
                debug!(
                    "frame pointer detection for {} failed: {}",
                    executable.display(),
                    e
                );
                None
            }
        }
    }

    fn add_unwind_table_for_process(&self, pid: Pid) {
        let Some(uses_frame_pointers) = self.default_uses_frame_pointers(pid) else {
            return;
        };
        if self.prefetch_process_info(pid).is_err() {
            return;
        }

        debug!("adding unwind tables for pid {}", pid);
        match self
            .store
            .add_unwind_table_for_process(pid, None, true, uses_frame_pointers)
        {
            Ok(()) => self.last_errors.clear_for_process(pid),
            Err(e) => self.record_add_error(pid, e),
        }
    }

    fn record_add_error(&self, pid: Pid, e: ProfilerError) {
        match &e {
            ProfilerError::NeedMoreProfilingRounds => {
                self.stats.incr(Counter::UnwindAddNeedMoreRounds);
                debug!("unwind tables for pid {} have to wait: {}", pid, e);
            }
            ProfilerError::UnwindStateReset => {
                debug!("unwind state was reset while adding pid {}", pid);
            }
            e if e.is_procfs_race() => {
                self.stats.incr(Counter::UnwindAddProcfsRace);
                debug!("failed to add unwind table for pid {} due to a procfs race: {}", pid, e);
            }
            ProfilerError::TooManyExecutableMappings { .. } => {
                self.stats.incr(Counter::UnwindAddTooManyMappings);
                warn!("failed to add unwind table for pid {}: {}", pid, e);
            }
            ProfilerError::BuildId {
                source: ObjectFileError::TextSectionNotFound,
                ..
            } => {
                self.text_section_errors.track(pid, &e);
            }
            _ => {
                self.stats.incr(Counter::UnwindAddOther);
                error!("failed to add unwind table for pid {}: {}", pid, e);
            }
        }
        self.last_errors.set_for_process(pid, e.to_string());
    }

    /// Adds every pid of a batch, duplicates included, then writes the open
    /// shard once.
    pub fn load_unwind_info_batch(&self, pids: &[Pid]) {
        for pid in pids {
            self.add_unwind_table_for_process(*pid);
        }

        match self.store.persist_unwind_table() {
            Ok(()) => {}
            Err(ProfilerError::NeedMoreProfilingRounds) => {
                self.stats.incr(Counter::UnwindPersistNeedMoreRounds);
                debug!("persisting the unwind table has to wait for more profiling rounds");
            }
            Err(e) => {
                self.stats.incr(Counter::UnwindPersistOther);
                error!("persisting the unwind table failed: {}", e);
            }
        }
    }
}
