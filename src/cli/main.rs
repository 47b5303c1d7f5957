use std::io::IsTerminal;
use std::num::NonZeroUsize;
use std::panic;
use std::path::Path;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{after, bounded, never, select, tick};
use nix::unistd::Uid;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::FmtSubscriber;

use nativeprof::bpf::events::spawn_events_reader;
use nativeprof::bpf::maps::KernelMaps;
use nativeprof::frame_pointers::{FramePointerDetector, ObjectFramePointerDetector};
use nativeprof::profiler::{Collaborators, DumpResponse, Profiler, ProfilerHandle};
use nativeprof::unwind_info::compact_unwind_info;
use nativeprof_object::ObjectFile;

mod args;
mod validators;

use crate::args::CliArgs;
use crate::args::LoggingLevel;

const EVENTS_QUEUE_SIZE: usize = 30;
const LOST_EVENTS_QUEUE_SIZE: usize = 10;

fn panic_thread_hook() {
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        std::process::exit(1);
    }));
}

fn main() -> Result<()> {
    panic_thread_hook();
    let args = CliArgs::parse();

    let level = match args.logging {
        LoggingLevel::Trace => Level::TRACE,
        LoggingLevel::Debug => Level::DEBUG,
        LoggingLevel::Info => Level::INFO,
        LoggingLevel::Warn => Level::WARN,
        LoggingLevel::Error => Level::ERROR,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_span_events(FmtSpan::ENTER | FmtSpan::CLOSE)
        .with_ansi(std::io::stdout().is_terminal())
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("setting default subscriber")?;

    if let Some(path) = &args.show_unwind_info {
        return show_unwind_info(path);
    }
    if let Some(path) = &args.show_info {
        return show_object_info(path);
    }

    if !Uid::current().is_root() {
        error!("root permissions are required to read the tracer's maps");
        std::process::exit(1);
    }

    let Some(pinned_maps_dir) = args.pinned_maps_dir.as_deref() else {
        anyhow::bail!("--pinned-maps-dir is required");
    };

    let config = args.profiler_config();
    let maps = KernelMaps::from_pinned(pinned_maps_dir, config.interpreter_unwinding_enabled)
        .context("opening pinned maps")?;

    let (events_send, events) = bounded(EVENTS_QUEUE_SIZE);
    let (lost_send, lost) = bounded(LOST_EVENTS_QUEUE_SIZE);
    let (reader_stop_send, reader_stop) = bounded::<()>(0);
    let reader = spawn_events_reader(
        pinned_maps_dir,
        config.perf_buffer_bytes,
        events_send,
        lost_send,
        reader_stop,
    )?;

    let profiler = Profiler::new(config, maps, Collaborators::system());
    let handle = profiler.handle();
    let (profiler_stop_send, profiler_stop) = bounded::<()>(0);
    let profiler_thread = thread::Builder::new()
        .name("profiler".into())
        .spawn(move || profiler.run(events, lost, profiler_stop))?;

    let (signal_send, signal) = bounded(1);
    ctrlc::set_handler(move || {
        info!("received Ctrl+C, stopping...");
        let _ = signal_send.try_send(());
    })
    .context("setting Ctrl-C handler")?;

    let deadline = args.duration.map_or_else(never, after);
    let ticker = tick(args.dump_interval);
    loop {
        select! {
            recv(signal) -> _ => break,
            recv(deadline) -> _ => break,
            recv(ticker) -> _ => {
                let Some(dump) = handle.dump() else {
                    warn!("profiler stopped unexpectedly");
                    break;
                };
                report(&handle, &dump);
            }
        }
    }

    drop(profiler_stop_send);
    drop(reader_stop_send);
    if profiler_thread.join().is_err() {
        error!("profiler thread panicked");
    }
    if reader.join().is_err() {
        error!("events reader thread panicked");
    }

    Ok(())
}

fn report(handle: &ProfilerHandle, dump: &DumpResponse) {
    let samples: usize = dump
        .processes
        .values()
        .map(|process| process.samples.len())
        .sum();
    info!(
        "profiling round: {} processes, {} distinct samples, {} interpreter symbols",
        dump.processes.len(),
        samples,
        dump.interpreter_symbol_table.len()
    );
    debug!("stats: {:?}", handle.stats().snapshot());

    if let Some(e) = handle.last_error() {
        warn!("last profiling round failed: {}", e);
    }
    for (pid, e) in handle.process_last_errors() {
        debug!("pid {}: {}", pid, e);
    }
}

fn show_unwind_info(path: &Path) -> Result<()> {
    let unwind_table = compact_unwind_info(path)?;
    for row in unwind_table.rows {
        println!(
            "pc: {:x} cfa_type: {:<2} fp_type: {:<2} cfa_offset: {:<4} fp_offset: {:<4} lr_offset: {:<4}",
            row.pc, row.cfa_type as u8, row.fp_type as u8, row.cfa_offset, row.fp_offset, row.lr_offset
        );
    }
    Ok(())
}

fn show_object_info(path: &Path) -> Result<()> {
    let object = ObjectFile::from_path(path)?;
    match object.build_id() {
        Ok(build_id) => println!("build id: {} ({:?})", build_id.id(), build_id.kind()),
        Err(e) => println!("build id: unavailable ({})", e),
    }
    println!("runtime: {:?}", object.runtime());
    println!("dynamic: {}", object.is_dynamic());

    let detector = ObjectFramePointerDetector::new(NonZeroUsize::MIN);
    match detector.has_frame_pointers(path) {
        Ok(has_frame_pointers) => println!("frame pointers: {}", has_frame_pointers),
        Err(e) => println!("frame pointers: unknown ({})", e),
    }
    Ok(())
}
