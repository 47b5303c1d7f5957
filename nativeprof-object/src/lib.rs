mod buildid;
mod object;

pub use object::ObjectFile;
pub use object::ObjectFileError;
pub use object::Runtime;

pub use buildid::BuildId;
pub use buildid::BuildIdKind;
