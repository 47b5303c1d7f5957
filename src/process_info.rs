use tracing::debug;

use crate::error::Error;
use crate::interpreter::Interpreter;
use crate::process::{ExecutableMappings, Pid, ProcessMappingsReader, ProcfsMappingsReader};

/// What we learn about a process when the tracer first asks about it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessData {
    pub pid: Pid,
    pub interpreter: Option<Interpreter>,
    /// Only set when fresh mappings were requested.
    pub mappings: Option<ExecutableMappings>,
}

/// Gathers process information, such as the interpreter a process runs.
pub trait ProcessInfoFetcher: Send + Sync {
    fn fetch(&self, pid: Pid) -> Result<ProcessData, Error>;
    fn fetch_with_fresh_mappings(&self, pid: Pid) -> Result<ProcessData, Error>;
}

/// Reads process information from procfs. Interpreter detection lives
/// outside of this crate, so no interpreter is ever reported.
#[derive(Debug, Default)]
pub struct ProcfsProcessInfoFetcher {
    mappings: ProcfsMappingsReader,
}

impl ProcessInfoFetcher for ProcfsProcessInfoFetcher {
    fn fetch(&self, pid: Pid) -> Result<ProcessData, Error> {
        let process = procfs::process::Process::new(pid).map_err(|e| Error::from_procfs(pid, e))?;
        if !process.is_alive() {
            return Err(Error::ProcessGone(pid));
        }

        Ok(ProcessData {
            pid,
            interpreter: None,
            mappings: None,
        })
    }

    fn fetch_with_fresh_mappings(&self, pid: Pid) -> Result<ProcessData, Error> {
        let mut data = self.fetch(pid)?;
        let mappings = self.mappings.executable_mappings(pid)?;
        debug!("pid {} has {} executable mappings", pid, mappings.len());
        data.mappings = Some(mappings);
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_self() {
        let fetcher = ProcfsProcessInfoFetcher::default();
        let pid = std::process::id() as Pid;

        let data = fetcher.fetch(pid).unwrap();
        assert_eq!(data.pid, pid);
        assert!(data.mappings.is_none());

        let data = fetcher.fetch_with_fresh_mappings(pid).unwrap();
        assert!(!data.mappings.unwrap().is_empty());
    }

    #[test]
    fn test_fetch_missing_process() {
        let fetcher = ProcfsProcessInfoFetcher::default();
        // Larger than the maximum pid the kernel hands out.
        let result = fetcher.fetch(i32::MAX);
        assert!(matches!(result, Err(Error::ProcessGone(_))));
    }
}
