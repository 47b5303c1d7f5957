use std::path::PathBuf;

use thiserror::Error;

use nativeprof_object::ObjectFileError;

use crate::bpf::bindings::DecodeError;
use crate::bpf::maps::MapError;
use crate::process::Pid;

#[derive(Debug, Error)]
pub enum Error {
    #[error("pid {pid} has {count} executable mappings, at most {max} are supported")]
    TooManyExecutableMappings { pid: Pid, count: usize, max: usize },
    #[error("not enough profiling rounds since the unwind information was last reset")]
    NeedMoreProfilingRounds,
    #[error("the unwind information was reset")]
    UnwindStateReset,
    #[error("a function in {path} has more unwind rows ({rows}) than a shard can hold")]
    UnwindTableTooLarge { path: PathBuf, rows: usize },
    #[error("could not get the build id of {path}: {source}")]
    BuildId {
        path: PathBuf,
        #[source]
        source: ObjectFileError,
    },
    #[error("process {0} is gone")]
    ProcessGone(Pid),
    #[error("reading procfs for pid {pid} failed: {reason}")]
    Procfs { pid: Pid, reason: String },
    #[error(transparent)]
    Map(#[from] MapError),
    #[error("malformed kernel record: {0}")]
    Decode(#[from] DecodeError),
}

impl Error {
    pub fn from_procfs(pid: Pid, error: procfs::ProcError) -> Self {
        match error {
            procfs::ProcError::NotFound(_) => Error::ProcessGone(pid),
            other => Error::Procfs {
                pid,
                reason: other.to_string(),
            },
        }
    }

    /// The process exited or unmapped an executable while we were reading it.
    pub fn is_procfs_race(&self) -> bool {
        match self {
            Error::ProcessGone(_) => true,
            Error::BuildId { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Expected errors that are logged at low severity and skipped.
    pub fn is_benign(&self) -> bool {
        self.is_procfs_race()
            || matches!(
                self,
                Error::NeedMoreProfilingRounds | Error::UnwindStateReset
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::from_procfs(1, procfs::ProcError::NotFound(None)).is_procfs_race());
        assert!(!Error::from_procfs(1, procfs::ProcError::Other("boom".into())).is_procfs_race());

        let gone = Error::BuildId {
            path: "/proc/1/root/bin/true".into(),
            source: ObjectFileError::Io(std::io::ErrorKind::NotFound.into()),
        };
        assert!(gone.is_procfs_race());

        let no_text = Error::BuildId {
            path: "/proc/1/root/bin/true".into(),
            source: ObjectFileError::TextSectionNotFound,
        };
        assert!(!no_text.is_benign());

        assert!(Error::NeedMoreProfilingRounds.is_benign());
        assert!(!Error::TooManyExecutableMappings {
            pid: 1,
            count: 400,
            max: 400
        }
        .is_benign());
    }
}
