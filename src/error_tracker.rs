use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Mutex, RwLock};

use lru::LruCache;
use tracing::{debug, error};

use crate::process::Pid;

/// Errors are logged loudly on their first occurrence and then once every
/// this many occurrences.
const LOUD_EVERY: u64 = 50;

/// Counts recurring errors by message so that the same failure hitting
/// thousands of processes does not flood the logs.
pub struct ErrorTracker {
    name: &'static str,
    encounters: Mutex<LruCache<String, u64>>,
}

impl ErrorTracker {
    pub fn new(name: &'static str, capacity: NonZeroUsize) -> Self {
        ErrorTracker {
            name,
            encounters: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Records one occurrence of `error` for `pid`, returning how many times
    /// this message has been seen.
    pub fn track(&self, pid: Pid, error: &dyn std::error::Error) -> u64 {
        let message = error.to_string();
        let encounters = {
            let mut cache = self.encounters.lock().unwrap();
            let count = cache.get(&message).copied().unwrap_or(0) + 1;
            cache.put(message.clone(), count);
            count
        };

        if encounters == 1 || encounters % LOUD_EVERY == 0 {
            error!(
                "[{}] pid {}: {} (seen {} times)",
                self.name, pid, message, encounters
            );
        } else {
            debug!(
                "[{}] pid {}: {} (seen {} times)",
                self.name, pid, message, encounters
            );
        }

        encounters
    }
}

/// The most recent error of the profiling loop, and of every process.
#[derive(Default)]
pub struct LastErrors {
    inner: RwLock<LastErrorsInner>,
}

#[derive(Default)]
struct LastErrorsInner {
    last: Option<String>,
    per_process: HashMap<Pid, String>,
}

impl LastErrors {
    pub fn set_last(&self, error: Option<String>) {
        self.inner.write().unwrap().last = error;
    }

    pub fn set_for_process(&self, pid: Pid, error: String) {
        self.inner
            .write()
            .unwrap()
            .per_process
            .insert(pid, error);
    }

    pub fn clear_for_process(&self, pid: Pid) {
        self.inner.write().unwrap().per_process.remove(&pid);
    }

    pub fn last(&self) -> Option<String> {
        self.inner.read().unwrap().last.clone()
    }

    pub fn per_process(&self) -> HashMap<Pid, String> {
        self.inner.read().unwrap().per_process.clone()
    }
}
