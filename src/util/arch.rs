/// Architectures the tracer can unwind. The width of an encoded unwind row
/// depends on it, as aarch64 rows also carry the link register offset.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Architecture {
    Arm64,
    X86,
}

impl Architecture {
    pub fn unwind_row_size(&self) -> usize {
        match self {
            Architecture::X86 => 14,
            Architecture::Arm64 => 16,
        }
    }
}

#[cfg(target_arch = "aarch64")]
pub fn architecture() -> Architecture {
    Architecture::Arm64
}

#[cfg(target_arch = "x86_64")]
pub fn architecture() -> Architecture {
    Architecture::X86
}
