use std::path::Path;

use nativeprof_object::{BuildId, ObjectFile, ObjectFileError};

/// What the unwind machinery needs to know about an executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub build_id: BuildId,
    /// Position independent (`ET_DYN`) objects are relocated at load time.
    pub is_dynamic: bool,
}

pub trait ObjectInspector: Send + Sync {
    fn inspect(&self, path: &Path) -> Result<ObjectSummary, ObjectFileError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ElfObjectInspector;

impl ObjectInspector for ElfObjectInspector {
    fn inspect(&self, path: &Path) -> Result<ObjectSummary, ObjectFileError> {
        let object = ObjectFile::from_path(path)?;
        Ok(ObjectSummary {
            build_id: object.build_id()?,
            is_dynamic: object.is_dynamic(),
        })
    }
}
