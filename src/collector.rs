use std::collections::HashMap;
use std::sync::Arc;

use itertools::Itertools;
use thiserror::Error;
use tracing::{debug, span, Level};

use crate::bpf::bindings::{
    decode_count, decode_stack_trace, decode_symbol_id, DecodeError, InterpreterSymbol,
    StackCountKey, MAX_STACK_DEPTH,
};
use crate::bpf::maps::{clear_map, KernelMaps};
use crate::error::Error;
use crate::process::Pid;
use crate::stats::{Counter, ProfilerStats};

/// User, kernel and interpreter stacks of a sample, back to back, each one
/// zero terminated unless it is full.
pub type CombinedStack = [u64; 3 * MAX_STACK_DEPTH];

/// Interpreter frames by the id the tracer gave them.
pub type InterpreterSymbolTable = HashMap<u32, InterpreterSymbol>;

#[derive(Debug, Error)]
pub enum StackError {
    #[error("stack id is 0, unwinding probably failed")]
    UnwindFailed,
    #[error("stack {0} not found")]
    Missing(u64),
    #[error("stack {id} is malformed: {source}")]
    Unrecoverable {
        id: u64,
        #[source]
        source: DecodeError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSample {
    pub tid: Pid,
    pub user_stack: Vec<u64>,
    pub kernel_stack: Vec<u64>,
    pub interpreter_stack: Vec<u64>,
    pub count: u64,
}

impl RawSample {
    fn from_combined(tid: Pid, stack: &CombinedStack, count: u64) -> Self {
        let (user, rest) = stack.split_at(MAX_STACK_DEPTH);
        let (kernel, interpreter) = rest.split_at(MAX_STACK_DEPTH);
        RawSample {
            tid,
            user_stack: until_zero(user),
            kernel_stack: until_zero(kernel),
            interpreter_stack: until_zero(interpreter),
            count,
        }
    }
}

fn until_zero(addresses: &[u64]) -> Vec<u64> {
    addresses
        .iter()
        .take_while(|address| **address != 0)
        .copied()
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessRawData {
    pub pid: Pid,
    pub samples: Vec<RawSample>,
}

/// Reads the samples the tracer aggregated during a profiling round.
pub struct ProfileCollector {
    maps: KernelMaps,
    stats: Arc<ProfilerStats>,
    symbols: InterpreterSymbolTable,
}

impl ProfileCollector {
    pub fn new(maps: KernelMaps, stats: Arc<ProfilerStats>) -> Self {
        ProfileCollector {
            maps,
            stats,
            symbols: InterpreterSymbolTable::new(),
        }
    }

    /// Copies the stack with `id` into `out`.
    pub fn read_stack(&self, id: u64, out: &mut [u64]) -> Result<(), StackError> {
        if id == 0 {
            return Err(StackError::UnwindFailed);
        }

        let bytes = match self.maps.stack_traces.lookup(&id.to_ne_bytes()) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Err(StackError::Missing(id)),
            Err(e) => {
                debug!("reading stack {} failed: {}", id, e);
                return Err(StackError::Missing(id));
            }
        };

        decode_stack_trace(&bytes, out)
            .map(|_| ())
            .map_err(|source| StackError::Unrecoverable { id, source })
    }

    /// Whether a stack was read. Malformed stacks abort the round.
    fn stack_found(&self, result: Result<(), StackError>, missing: Counter) -> Result<bool, Error> {
        match result {
            Ok(()) => Ok(true),
            Err(StackError::Unrecoverable { source, .. }) => Err(Error::Decode(source)),
            Err(e) => {
                self.stats.incr(missing);
                debug!("{}", e);
                Ok(false)
            }
        }
    }

    /// Aggregates the samples of the round by process, then clears the
    /// tracer's stack maps for the next round.
    pub fn collect(&self) -> Result<HashMap<Pid, ProcessRawData>, Error> {
        let _span = span!(Level::DEBUG, "collect").entered();

        let mut aggregated: HashMap<(Pid, Pid), HashMap<CombinedStack, u64>> = HashMap::new();
        for key_bytes in self.maps.stack_counts.keys()? {
            let key = StackCountKey::decode(&key_bytes)?;

            let mut stack: CombinedStack = [0; 3 * MAX_STACK_DEPTH];
            let (user, rest) = stack.split_at_mut(MAX_STACK_DEPTH);
            let (kernel, interpreter) = rest.split_at_mut(MAX_STACK_DEPTH);

            let user_found = self.stack_found(
                self.read_stack(key.user_stack_id, user),
                Counter::StacksUserMissing,
            )?;

            if key.interpreter_stack_id != 0 {
                if let Err(e) = self.read_stack(key.interpreter_stack_id, interpreter) {
                    debug!("failed to read interpreter stack: {}", e);
                }
            }

            let kernel_found = self.stack_found(
                self.read_stack(key.kernel_stack_id, kernel),
                Counter::StacksKernelMissing,
            )?;

            if !user_found && !kernel_found {
                self.stats.incr(Counter::StacksBothMissing);
                continue;
            }

            let Some(count) = self.maps.stack_counts.lookup(&key_bytes)? else {
                debug!("stack count for {:?} vanished", key);
                continue;
            };
            let count = decode_count(&count)?;
            if count == 0 {
                self.stats.incr(Counter::StacksZeroCount);
                continue;
            }

            *aggregated
                .entry((key.pid, key.tid))
                .or_default()
                .entry(stack)
                .or_insert(0) += count;
        }

        clear_map(self.maps.stack_traces.as_ref());
        clear_map(self.maps.stack_counts.as_ref());

        Ok(aggregated
            .into_iter()
            .flat_map(|((pid, tid), stacks)| {
                stacks
                    .into_iter()
                    .map(move |(stack, count)| (pid, RawSample::from_combined(tid, &stack, count)))
            })
            .into_group_map()
            .into_iter()
            .map(|(pid, samples)| (pid, ProcessRawData { pid, samples }))
            .collect())
    }

    /// The interpreter symbol table, re-read from the tracer only when
    /// `samples` reference a frame we have not seen yet.
    pub fn interpreter_symbol_table(
        &mut self,
        samples: &HashMap<Pid, ProcessRawData>,
    ) -> Result<InterpreterSymbolTable, Error> {
        let Some(symbol_table) = &self.maps.symbol_table else {
            return Ok(InterpreterSymbolTable::new());
        };

        let stale = self.symbols.is_empty()
            || samples
                .values()
                .flat_map(|data| &data.samples)
                .flat_map(|sample| &sample.interpreter_stack)
                .any(|id| !self.symbols.contains_key(&(*id as u32)));

        if stale {
            let mut symbols = InterpreterSymbolTable::new();
            for key in symbol_table.keys()? {
                let Some(value) = symbol_table.lookup(&key)? else {
                    continue;
                };
                symbols.insert(decode_symbol_id(&value)?, InterpreterSymbol::decode(&key)?);
            }
            self.symbols = symbols;
        }

        Ok(self.symbols.clone())
    }
}
