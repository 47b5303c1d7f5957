use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use nativeprof::profiler::ProfilerConfig;

use crate::validators::parse_duration;
use crate::validators::value_is_positive;
use crate::validators::value_is_power_of_two;

#[derive(clap::ValueEnum, Debug, Clone, Default)]
pub(crate) enum LoggingLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Parser, Debug)]
pub(crate) struct CliArgs {
    /// Show unwind info for given binary
    #[arg(long, value_name = "PATH_TO_BINARY",
        conflicts_with_all = ["show_info", "pinned_maps_dir"]
    )]
    pub(crate) show_unwind_info: Option<PathBuf>,
    /// Show build ID and frame pointer heuristic for given binary
    #[arg(long, value_name = "PATH_TO_BINARY", conflicts_with_all = ["pinned_maps_dir"])]
    pub(crate) show_info: Option<PathBuf>,
    /// Directory where the tracer pinned its maps
    #[arg(long, required_unless_present_any = ["show_unwind_info", "show_info"])]
    pub(crate) pinned_maps_dir: Option<PathBuf>,
    /// Set nativeprof's logging level
    #[arg(long, default_value_t, value_enum)]
    pub(crate) logging: LoggingLevel,
    /// How long to run in seconds, forever if not set
    #[arg(short = 'D', long, value_parser = parse_duration)]
    pub(crate) duration: Option<Duration>,
    /// Seconds between profiling rounds
    #[arg(long, default_value = "10", value_parser = parse_duration)]
    pub(crate) dump_interval: Duration,
    #[arg(long, default_value_t = ProfilerConfig::default().perf_buffer_bytes, value_name = "PERF_BUFFER_BYTES",
          help="Size of the events perf buffer, in bytes (must be a power of 2)",
          value_parser = value_is_power_of_two)]
    pub(crate) perf_buffer_bytes: usize,
    /// Threads serving process information requests
    #[arg(long, default_value_t = ProfilerConfig::default().workers, value_parser = value_is_positive)]
    pub(crate) workers: usize,
    /// Only unwind with frame pointers
    #[arg(long)]
    pub(crate) no_dwarf_unwinding: bool,
    /// Read the interpreter symbol table on every profiling round
    #[arg(long)]
    pub(crate) interpreter_unwinding: bool,
    #[arg(
        long,
        default_value_t = ProfilerConfig::default().shard_capacity,
        value_parser = value_is_positive,
        help = "rows per unwind table shard, must match the tracer"
    )]
    pub(crate) shard_capacity: usize,
    #[arg(
        long,
        default_value_t = ProfilerConfig::default().max_shards,
        value_parser = value_is_positive,
        help = "number of unwind table shards, must match the tracer"
    )]
    pub(crate) max_shards: usize,
    #[arg(
        long,
        default_value_t = ProfilerConfig::default().min_rounds_before_redoing_unwind_info,
        help = "profiling rounds to wait before dropping all unwind information once it's full"
    )]
    pub(crate) min_rounds_before_reset: u64,
}

impl CliArgs {
    pub(crate) fn profiler_config(&self) -> ProfilerConfig {
        ProfilerConfig {
            workers: self.workers,
            dwarf_unwinding_enabled: !self.no_dwarf_unwinding,
            interpreter_unwinding_enabled: self.interpreter_unwinding,
            shard_capacity: self.shard_capacity,
            max_shards: self.max_shards,
            min_rounds_before_redoing_unwind_info: self.min_rounds_before_reset,
            min_rounds_before_redoing_process_info: self.min_rounds_before_reset,
            perf_buffer_bytes: self.perf_buffer_bytes,
            ..Default::default()
        }
    }
}
