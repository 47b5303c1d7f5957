mod convert;
mod encoder;
mod optimize;
pub mod types;

use std::path::Path;

pub use convert::compact_unwind_info;
pub use convert::DwarfUnwindRowGenerator;
pub use convert::UnwindInfoError;
pub use encoder::CompactRowEncoder;
pub use encoder::RowDecodeError;

use crate::unwind_info::types::CompactUnwindRow;
use crate::util::Architecture;

/// The unwind rows of one executable, sorted by program counter.
#[derive(Debug, Clone, PartialEq)]
pub struct UnwindTable {
    pub rows: Vec<CompactUnwindRow>,
    pub arch: Architecture,
}

/// Produces the unwind rows of an executable. Every function's rows must be
/// followed by an end of function marker row.
pub trait UnwindRowGenerator: Send + Sync {
    fn generate(&self, path: &Path) -> Result<UnwindTable, UnwindInfoError>;
}
