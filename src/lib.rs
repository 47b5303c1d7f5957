pub mod batcher;
pub mod bpf;
pub mod collector;
pub mod dispatcher;
pub mod error;
pub mod error_tracker;
pub mod frame_pointers;
pub mod interpreter;
pub mod object;
pub mod process;
pub mod process_info;
pub mod profiler;
pub mod shard;
pub mod stats;
pub mod unwind_info;
pub mod util;
