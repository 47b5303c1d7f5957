use std::sync::atomic::{AtomicU64, Ordering};

/// Everything the engine counts, mostly to tell apart the many ways in which
/// samples and unwind information can go missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    EventsUnwindInfo,
    EventsProcessMappings,
    EventsRefreshProcessInfo,
    EventsEmpty,
    EventsUnknown,
    EventsLost,
    EventsDeduplicated,
    StacksUserMissing,
    StacksKernelMissing,
    StacksBothMissing,
    StacksZeroCount,
    UnwindAddNeedMoreRounds,
    UnwindAddProcfsRace,
    UnwindAddTooManyMappings,
    UnwindAddOther,
    UnwindPersistNeedMoreRounds,
    UnwindPersistOther,
    ShardsPersisted,
    UnwindStateResets,
    ProcessInfoResets,
    ProfilingRounds,
    ProfilingRoundsFailed,
}

impl Counter {
    pub const ALL: [Counter; 22] = [
        Counter::EventsUnwindInfo,
        Counter::EventsProcessMappings,
        Counter::EventsRefreshProcessInfo,
        Counter::EventsEmpty,
        Counter::EventsUnknown,
        Counter::EventsLost,
        Counter::EventsDeduplicated,
        Counter::StacksUserMissing,
        Counter::StacksKernelMissing,
        Counter::StacksBothMissing,
        Counter::StacksZeroCount,
        Counter::UnwindAddNeedMoreRounds,
        Counter::UnwindAddProcfsRace,
        Counter::UnwindAddTooManyMappings,
        Counter::UnwindAddOther,
        Counter::UnwindPersistNeedMoreRounds,
        Counter::UnwindPersistOther,
        Counter::ShardsPersisted,
        Counter::UnwindStateResets,
        Counter::ProcessInfoResets,
        Counter::ProfilingRounds,
        Counter::ProfilingRoundsFailed,
    ];
}

pub struct ProfilerStats {
    counters: [AtomicU64; Counter::ALL.len()],
}

impl Default for ProfilerStats {
    fn default() -> Self {
        ProfilerStats {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl ProfilerStats {
    pub fn add(&self, counter: Counter, value: u64) {
        self.counters[counter as usize].fetch_add(value, Ordering::Relaxed);
    }

    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }

    /// Non-zero counters.
    pub fn snapshot(&self) -> Vec<(Counter, u64)> {
        Counter::ALL
            .iter()
            .map(|counter| (*counter, self.get(*counter)))
            .filter(|(_, value)| *value != 0)
            .collect()
    }
}
