use std::fmt;
use std::fmt::Display;
use std::fmt::Formatter;

use data_encoding::HEXLOWER;
use ring::digest::Digest;

/// Where a build id came from. Executables without a build id note are
/// identified by a hash of their code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildIdKind {
    Gnu,
    Go,
    CodeHash,
}

impl BuildIdKind {
    fn label(&self) -> &'static str {
        match self {
            BuildIdKind::Gnu => "gnu",
            BuildIdKind::Go => "go",
            BuildIdKind::CodeHash => "sha256",
        }
    }
}

/// Identifies the contents of an executable, so the same file mapped by
/// many processes, or installed under different paths, is recognized.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildId {
    kind: BuildIdKind,
    id: String,
}

impl BuildId {
    pub fn gnu(bytes: &[u8]) -> Self {
        BuildId {
            kind: BuildIdKind::Gnu,
            id: HEXLOWER.encode(bytes),
        }
    }

    /// The Go toolchain writes printable build ids, which are kept as they
    /// are unless they aren't valid UTF-8.
    pub fn go(bytes: &[u8]) -> Self {
        let id = match std::str::from_utf8(bytes) {
            Ok(text) => text.trim_end_matches('\0').to_string(),
            Err(_) => HEXLOWER.encode(bytes),
        };
        BuildId {
            kind: BuildIdKind::Go,
            id,
        }
    }

    pub fn code_hash(digest: &Digest) -> Self {
        BuildId {
            kind: BuildIdKind::CodeHash,
            id: HEXLOWER.encode(digest.as_ref()),
        }
    }

    pub fn kind(&self) -> BuildIdKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Display for BuildId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.kind.label(), self.id)
    }
}
