use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use tracing::debug;

use crate::process::Pid;

/// Interpreted runtimes the tracer can walk the stacks of. The values are
/// shared with the tracer, 0 meaning "no interpreter".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterpreterType {
    Ruby = 1,
    Python = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpreter {
    pub kind: InterpreterType,
    pub version: String,
    /// Address of the interpreter's main thread state, where the tracer starts walking.
    pub main_thread_address: u64,
}

/// Interpreters found in running processes.
pub struct InterpreterRegistry {
    interpreters: Mutex<LruCache<Pid, Interpreter>>,
}

impl InterpreterRegistry {
    pub fn new(capacity: NonZeroUsize) -> Self {
        InterpreterRegistry {
            interpreters: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Registers the interpreter of `pid`. Returns whether anything changed.
    pub fn add(&self, pid: Pid, interpreter: Interpreter) -> bool {
        let mut interpreters = self.interpreters.lock().unwrap();
        if interpreters.get(&pid) == Some(&interpreter) {
            return false;
        }
        debug!(
            "registering {:?} {} interpreter for pid {}",
            interpreter.kind, interpreter.version, pid
        );
        interpreters.put(pid, interpreter);
        true
    }

    pub fn get(&self, pid: Pid) -> Option<Interpreter> {
        self.interpreters.lock().unwrap().get(&pid).cloned()
    }

    /// Value of the interpreter type field of the process information.
    pub fn interpreter_type(&self, pid: Pid) -> u64 {
        self.interpreters
            .lock()
            .unwrap()
            .peek(&pid)
            .map_or(0, |interpreter| interpreter.kind as u64)
    }
}
