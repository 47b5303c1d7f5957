use std::fs;
use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use ring::digest::{Context, Digest, SHA256};
use thiserror::Error;

use object::Object;
use object::ObjectKind;
use object::ObjectSection;
use object::ObjectSymbol;

use crate::BuildId;

#[derive(Debug, Error)]
pub enum ObjectFileError {
    #[error("could not read object file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse object file: {0}")]
    Parse(#[from] object::Error),
    #[error("no .text section found")]
    TextSectionNotFound,
}

impl ObjectFileError {
    /// Whether the file went away, typically because the process that mapped it exited.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ObjectFileError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Runtime {
    /// C, C++, Rust, Fortran
    CLike,
    /// Golang
    Go,
    /// V8, used by Node.js which is always compiled with frame pointers and has handwritten
    /// code sections that aren't covered by the unwind information
    V8,
}

#[derive(Debug)]
pub struct ObjectFile {
    /// Warning! `object` must always go above `mmap` to ensure it will be dropped
    /// before. Rust guarantees that fields are dropped in the order they are defined.
    object: object::File<'static>, // Its lifetime is tied to the `mmap` below.
    #[allow(dead_code)]
    mmap: Box<Mmap>,
}

impl ObjectFile {
    pub fn new(file: &File) -> Result<Self, ObjectFileError> {
        // Rust offers no guarantees on whether a "move" is done virtually or by memcpying,
        // so to ensure that the memory value is valid we store it in the heap.
        // Safety: Memory mapping files can cause issues if the file is modified or unmapped.
        let mmap = Box::new(unsafe { Mmap::map(file) }?);
        let object = object::File::parse(&**mmap)?;
        // Safety: The lifetime of `object` will outlive `mmap`'s. We ensure `mmap` lives as long as
        // `object` by defining `object` before.
        let object =
            unsafe { std::mem::transmute::<object::File<'_>, object::File<'static>>(object) };

        Ok(ObjectFile { object, mmap })
    }

    pub fn from_path(path: &Path) -> Result<Self, ObjectFileError> {
        let file = fs::File::open(path)?;
        Self::new(&file)
    }

    /// The GNU build id note if there is one, then Go's, falling back to a
    /// hash of the `.text` section.
    pub fn build_id(&self) -> Result<BuildId, ObjectFileError> {
        if let Some(note) = self.object.build_id()? {
            return Ok(BuildId::gnu(note));
        }
        if let Some(note) = self.go_build_id() {
            return Ok(BuildId::go(note));
        }
        text_section_hash(&self.object)
            .map(|digest| BuildId::code_hash(&digest))
            .ok_or(ObjectFileError::TextSectionNotFound)
    }

    fn go_build_id(&self) -> Option<&[u8]> {
        self.object
            .section_by_name(".note.go.buildid")
            .and_then(|section| section.data().ok())
    }

    /// Whether the object is position independent (`ET_DYN`), in which case
    /// its load address has to be taken into account.
    pub fn is_dynamic(&self) -> bool {
        self.object.kind() == ObjectKind::Dynamic
    }

    pub fn has_symbols(&self) -> bool {
        self.object.symbols().next().is_some()
    }

    pub fn runtime(&self) -> Runtime {
        if self.is_go() {
            return Runtime::Go;
        }

        for symbol in self.object.symbols() {
            let Ok(name) = symbol.name() else { continue };
            if name.starts_with("_ZZN2v88internal") {
                return Runtime::V8;
            }
        }
        Runtime::CLike
    }

    pub fn is_go(&self) -> bool {
        self.object.sections().any(|section| {
            matches!(
                section.name(),
                Ok(".gosymtab") | Ok(".gopclntab") | Ok(".note.go.buildid")
            )
        })
    }
}

fn text_section_hash(object: &object::File) -> Option<Digest> {
    let section = object.section_by_name(".text")?;
    let data = section.data().ok()?;

    let mut context = Context::new(&SHA256);
    context.update(data);
    Some(context.finish())
}
