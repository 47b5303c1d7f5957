use std::fs::File;
use std::path::Path;

use gimli::{CfaRule, CieOrFde, EhFrame, RegisterRule, UnwindContext, UnwindSection};
use memmap2::Mmap;
use object::{Object, ObjectSection};
use thiserror::Error;
use tracing::{debug, span, Level};

use crate::unwind_info::optimize::optimize;
use crate::unwind_info::types::*;
use crate::unwind_info::{UnwindRowGenerator, UnwindTable};
use crate::util::Architecture;

#[derive(Debug, Error)]
pub enum UnwindInfoError {
    #[error("could not read object file: {0}")]
    Io(#[from] std::io::Error),
    #[error("object file could not be parsed due to {0}")]
    ParsingObjectFile(String),
    #[error("unsupported architecture {0}")]
    UnsupportedArchitecture(String),
    #[error("no eh_frame section found")]
    EhFrameSectionNotFound,
    #[error("no FDEs found in .eh_frame data")]
    NoFDEsFound,
    #[error("malformed .eh_frame data: {0}")]
    Dwarf(#[from] gimli::Error),
}

impl UnwindInfoError {
    /// Whether the object simply carries no unwind information we can use,
    /// rather than something going wrong while reading it.
    pub fn is_missing_unwind_info(&self) -> bool {
        matches!(
            self,
            UnwindInfoError::EhFrameSectionNotFound | UnwindInfoError::NoFDEsFound
        )
    }
}

struct Registers {
    frame_pointer: gimli::Register,
    stack_pointer: gimli::Register,
    link_register: Option<gimli::Register>,
}

impl Registers {
    fn for_arch(arch: Architecture) -> Self {
        match arch {
            Architecture::X86 => Registers {
                frame_pointer: X86_FP,
                stack_pointer: X86_SP,
                link_register: None,
            },
            Architecture::Arm64 => Registers {
                frame_pointer: ARM64_FP,
                stack_pointer: ARM64_SP,
                link_register: Some(ARM64_LR),
            },
        }
    }
}

/// Generates unwind rows from the `.eh_frame` section of an executable.
#[derive(Debug, Default, Clone, Copy)]
pub struct DwarfUnwindRowGenerator;

impl UnwindRowGenerator for DwarfUnwindRowGenerator {
    fn generate(&self, path: &Path) -> Result<UnwindTable, UnwindInfoError> {
        compact_unwind_info(path)
    }
}

/// Returns the unwind rows for every function in `path`, sorted by address,
/// each function followed by an end of function marker.
pub fn compact_unwind_info(path: &Path) -> Result<UnwindTable, UnwindInfoError> {
    let _span = span!(Level::DEBUG, "processing unwind info").entered();

    let file = File::open(path)?;
    // Safety: the file might change under us, in which case we might produce bogus rows
    // but never read out of bounds.
    let mmap = unsafe { Mmap::map(&file)? };
    let object_file = object::File::parse(&mmap[..])
        .map_err(|e| UnwindInfoError::ParsingObjectFile(e.to_string()))?;

    let arch = match object_file.architecture() {
        object::Architecture::X86_64 => Architecture::X86,
        object::Architecture::Aarch64 => Architecture::Arm64,
        other => return Err(UnwindInfoError::UnsupportedArchitecture(format!("{:?}", other))),
    };
    let registers = Registers::for_arch(arch);

    let eh_frame_section = object_file
        .section_by_name(".eh_frame")
        .ok_or(UnwindInfoError::EhFrameSectionNotFound)?;

    let mut bases = gimli::BaseAddresses::default().set_eh_frame(eh_frame_section.address());
    if let Some(text) = object_file.section_by_name(".text") {
        bases = bases.set_text(text.address());
    }

    let endian = if object_file.is_little_endian() {
        gimli::RunTimeEndian::Little
    } else {
        gimli::RunTimeEndian::Big
    };

    let eh_frame_data = eh_frame_section
        .uncompressed_data()
        .map_err(|e| UnwindInfoError::ParsingObjectFile(e.to_string()))?;
    let mut eh_frame = EhFrame::new(&eh_frame_data, endian);
    if arch == Architecture::Arm64 {
        eh_frame.set_vendor(gimli::Vendor::AArch64);
    }

    let mut cur_cie = None;
    let mut pc_and_fde_offset = Vec::new();
    let mut entries_iter = eh_frame.entries(&bases);
    while let Ok(Some(entry)) = entries_iter.next() {
        match entry {
            CieOrFde::Cie(cie) => {
                cur_cie = Some(cie);
            }
            CieOrFde::Fde(partial_fde) => {
                let fde = partial_fde.parse(|eh_frame, bases, cie_offset| {
                    if let Some(cie) = &cur_cie {
                        if cie.offset() == cie_offset.0 {
                            return Ok(cie.clone());
                        }
                    }
                    let cie = eh_frame.cie_from_offset(bases, cie_offset);
                    if let Ok(cie) = &cie {
                        cur_cie = Some(cie.clone());
                    }
                    cie
                });

                if let Ok(fde) = fde {
                    pc_and_fde_offset.push((fde.initial_address(), fde.offset()));
                }
            }
        }
    }

    if pc_and_fde_offset.is_empty() {
        return Err(UnwindInfoError::NoFDEsFound);
    }
    pc_and_fde_offset.sort_by_key(|(pc, _)| *pc);

    let mut rows = Vec::new();
    let mut ctx = Box::new(UnwindContext::new());
    for (_, fde_offset) in pc_and_fde_offset {
        let fde = eh_frame.fde_from_offset(
            &bases,
            gimli::EhFrameOffset(fde_offset),
            EhFrame::cie_from_offset,
        )?;

        let mut table = match fde.rows(&eh_frame, &bases, &mut ctx) {
            Ok(table) => table,
            Err(e) => {
                debug!(
                    "skipping FDE at {:#x} in {}: {}",
                    fde.initial_address(),
                    path.display(),
                    e
                );
                continue;
            }
        };

        while let Ok(Some(row)) = table.next_row() {
            rows.push(compact_row(
                row,
                &eh_frame,
                &registers,
                fde.cie().return_address_register(),
            ));
        }
        rows.push(CompactUnwindRow::stop_unwinding(
            fde.initial_address() + fde.len(),
        ));
    }

    let rows_before = rows.len();
    let rows = optimize(rows);
    debug!(
        "Unwind info size ratio after optimizations {:.2}",
        rows.len() as f64 / rows_before as f64
    );

    Ok(UnwindTable { rows, arch })
}

fn compact_row<R: gimli::Reader>(
    row: &gimli::UnwindTableRow<R::Offset>,
    eh_frame: &EhFrame<R>,
    registers: &Registers,
    return_address_register: gimli::Register,
) -> CompactUnwindRow {
    let mut compact_row = CompactUnwindRow {
        pc: row.start_address(),
        ..Default::default()
    };

    match row.cfa() {
        CfaRule::RegisterAndOffset { register, offset } => {
            compact_row.cfa_type = if *register == registers.frame_pointer {
                CfaType::FramePointerOffset
            } else if *register == registers.stack_pointer {
                CfaType::StackPointerOffset
            } else {
                CfaType::UnsupportedRegisterOffset
            };

            match i16::try_from(*offset) {
                Ok(off) => compact_row.cfa_offset = off,
                Err(_) => compact_row.cfa_type = CfaType::OffsetDidNotFit,
            }
        }
        CfaRule::Expression(expression) => {
            let found_expression = expression
                .get(eh_frame)
                .ok()
                .and_then(|expression| expression.0.to_slice().ok().map(|s| s.to_vec()));

            compact_row.cfa_type = match found_expression.as_deref() {
                Some(bytes) if bytes == *PLT1 => CfaType::Plt1,
                Some(bytes) if bytes == *PLT2 => CfaType::Plt2,
                _ => CfaType::UnsupportedExpression,
            };
        }
    };

    match row.register(registers.frame_pointer) {
        RegisterRule::Undefined | RegisterRule::SameValue => {}
        RegisterRule::Offset(offset) => match i16::try_from(offset) {
            Ok(off) => {
                compact_row.fp_type = FpType::CfaOffset;
                compact_row.fp_offset = off;
            }
            Err(_) => compact_row.fp_type = FpType::OffsetDidNotFit,
        },
        RegisterRule::Register(_) => compact_row.fp_type = FpType::Register,
        RegisterRule::Expression(_) => compact_row.fp_type = FpType::Expression,
        _ => {}
    }

    if let Some(link_register) = registers.link_register {
        if let RegisterRule::Offset(offset) = row.register(link_register) {
            match i16::try_from(offset) {
                Ok(off) => compact_row.lr_offset = off,
                Err(_) => compact_row.cfa_type = CfaType::OffsetDidNotFit,
            }
        }
    }

    if row.register(return_address_register) == RegisterRule::Undefined {
        compact_row.fp_type = FpType::UndefinedReturnAddress;
    }

    compact_row
}
