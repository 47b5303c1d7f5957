use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use libbpf_rs::PerfBufferBuilder;
use tracing::{debug, warn};

use crate::bpf::libbpf::PinnedMap;
use crate::bpf::maps::EVENTS_MAP;

const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Spawns a thread that polls the tracer's events perf buffer, forwarding
/// every payload to `events` and every lost-events notification to `lost`.
/// The thread exits once `stop` is disconnected.
pub fn spawn_events_reader(
    pinned_maps_dir: &Path,
    perf_buffer_bytes: usize,
    events: Sender<Vec<u8>>,
    lost: Sender<u64>,
    stop: Receiver<()>,
) -> Result<thread::JoinHandle<()>> {
    let map = PinnedMap::open(pinned_maps_dir, EVENTS_MAP)?;
    let pages = (perf_buffer_bytes / page_size::get()).max(1);

    thread::Builder::new()
        .name("events-reader".into())
        .spawn(move || {
            let perf_buffer = PerfBufferBuilder::new(map.handle())
                .pages(pages)
                .sample_cb(move |_cpu: i32, data: &[u8]| {
                    if events.send(data.to_vec()).is_err() {
                        debug!("events receiver is gone, dropping event");
                    }
                })
                .lost_cb(move |cpu: i32, count: u64| {
                    warn!("lost {} events on cpu {}", count, cpu);
                    let _ = lost.send(count);
                })
                .build();

            let perf_buffer = match perf_buffer {
                Ok(perf_buffer) => perf_buffer,
                Err(e) => {
                    warn!("could not set up the events perf buffer: {}", e);
                    return;
                }
            };

            loop {
                if !matches!(stop.try_recv(), Err(TryRecvError::Empty)) {
                    debug!("stopping events reader");
                    return;
                }
                if let Err(e) = perf_buffer.poll(POLL_TIMEOUT) {
                    debug!("polling the events perf buffer failed: {}", e);
                }
            }
        })
        .context("spawning events reader thread")
}
