use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Mutex;

use lru::LruCache;
use thiserror::Error;

use nativeprof_object::{BuildId, ObjectFile, ObjectFileError, Runtime};

#[derive(Debug, Error)]
pub enum FramePointerError {
    #[error("executable not found")]
    NotFound,
    #[error("executable has no symbols")]
    NoSymbols,
    #[error(transparent)]
    Object(ObjectFileError),
}

impl FramePointerError {
    /// Detection could not run, but unwinding can go ahead assuming the
    /// executable has no frame pointers.
    pub fn is_inconclusive(&self) -> bool {
        matches!(self, FramePointerError::NotFound | FramePointerError::NoSymbols)
    }
}

impl From<ObjectFileError> for FramePointerError {
    fn from(e: ObjectFileError) -> Self {
        if e.is_not_found() {
            FramePointerError::NotFound
        } else {
            FramePointerError::Object(e)
        }
    }
}

/// Guesses whether an executable was compiled with frame pointers.
pub trait FramePointerDetector: Send + Sync {
    fn has_frame_pointers(&self, executable: &Path) -> Result<bool, FramePointerError>;
}

/// Decides based on the runtime an object was built for. Verdicts are
/// cached by build id as `/proc/<pid>/exe` is typically shared by many
/// processes.
pub struct ObjectFramePointerDetector {
    verdicts: Mutex<LruCache<BuildId, bool>>,
}

impl ObjectFramePointerDetector {
    pub fn new(capacity: NonZeroUsize) -> Self {
        ObjectFramePointerDetector {
            verdicts: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn detect(object: &ObjectFile) -> Result<bool, FramePointerError> {
        if object.is_go() {
            return Ok(true);
        }
        if !object.has_symbols() {
            return Err(FramePointerError::NoSymbols);
        }
        Ok(object.runtime() == Runtime::V8)
    }
}

impl FramePointerDetector for ObjectFramePointerDetector {
    fn has_frame_pointers(&self, executable: &Path) -> Result<bool, FramePointerError> {
        let object = ObjectFile::from_path(executable)?;
        let build_id = match object.build_id() {
            Ok(build_id) => build_id,
            Err(_) => return Self::detect(&object),
        };

        if let Some(verdict) = self.verdicts.lock().unwrap().get(&build_id) {
            return Ok(*verdict);
        }

        let verdict = Self::detect(&object)?;
        self.verdicts.lock().unwrap().put(build_id, verdict);
        Ok(verdict)
    }
}
