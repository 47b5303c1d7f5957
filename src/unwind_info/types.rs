use lazy_static::lazy_static;

// The discriminants below are read by the tracer, which relies on these exact values.

#[repr(u8)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum CfaType {
    #[default]
    Unknown = 0,
    FramePointerOffset = 1,
    StackPointerOffset = 2,
    UnsupportedExpression = 3,
    Plt1 = 4,
    Plt2 = 5,
    DerefAndAdd = 6,
    EndFdeMarker = 7,
    UnsupportedRegisterOffset = 8,
    OffsetDidNotFit = 9,
}

impl TryFrom<u8> for CfaType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => CfaType::Unknown,
            1 => CfaType::FramePointerOffset,
            2 => CfaType::StackPointerOffset,
            3 => CfaType::UnsupportedExpression,
            4 => CfaType::Plt1,
            5 => CfaType::Plt2,
            6 => CfaType::DerefAndAdd,
            7 => CfaType::EndFdeMarker,
            8 => CfaType::UnsupportedRegisterOffset,
            9 => CfaType::OffsetDidNotFit,
            other => return Err(other),
        })
    }
}

/// How to recover the frame pointer ($rbp on x86_64, x29 on aarch64).
#[repr(u8)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum FpType {
    #[default]
    Unchanged = 0,
    CfaOffset = 1,
    Register = 2,
    Expression = 3,
    UndefinedReturnAddress = 4,
    OffsetDidNotFit = 5,
}

impl TryFrom<u8> for FpType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => FpType::Unchanged,
            1 => FpType::CfaOffset,
            2 => FpType::Register,
            3 => FpType::Expression,
            4 => FpType::UndefinedReturnAddress,
            5 => FpType::OffsetDidNotFit,
            other => return Err(other),
        })
    }
}

/// One row of unwind information, valid from `pc` until the next row's `pc`.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct CompactUnwindRow {
    pub pc: u64,
    pub cfa_type: CfaType,
    pub fp_type: FpType,
    pub cfa_offset: i16,
    pub fp_offset: i16,
    /// Only encoded for aarch64.
    pub lr_offset: i16,
}

impl CompactUnwindRow {
    pub fn stop_unwinding(last_addr: u64) -> CompactUnwindRow {
        CompactUnwindRow {
            pc: last_addr,
            cfa_type: CfaType::EndFdeMarker,
            ..Default::default()
        }
    }

    pub fn is_end_of_function_marker(&self) -> bool {
        self.cfa_type == CfaType::EndFdeMarker
    }
}

lazy_static! {
    pub static ref PLT1: [u8; 11] = [
        gimli::constants::DW_OP_breg7,
        gimli::constants::DW_OP_const1u,
        gimli::constants::DW_OP_breg16,
        gimli::DwOp(0), // ?
        gimli::constants::DW_OP_lit15,
        gimli::constants::DW_OP_and,
        gimli::constants::DW_OP_lit11,
        gimli::constants::DW_OP_ge,
        gimli::constants::DW_OP_lit3,
        gimli::constants::DW_OP_shl,
        gimli::constants::DW_OP_plus,
    ].map(|a| a.0);

    pub static ref PLT2: [u8; 11] = [
        gimli::constants::DW_OP_breg7,
        gimli::constants::DW_OP_const1u,
        gimli::constants::DW_OP_breg16,
        gimli::DwOp(0), // ?
        gimli::constants::DW_OP_lit15,
        gimli::constants::DW_OP_and,
        gimli::constants::DW_OP_lit10,
        gimli::constants::DW_OP_ge,
        gimli::constants::DW_OP_lit3,
        gimli::constants::DW_OP_shl,
        gimli::constants::DW_OP_plus,
    ].map(|a| a.0);
}

// Source: https://gitlab.com/x86-psABIs/x86-64-ABI/-/jobs/artifacts/d725a372/raw/x86-64-ABI/abi.pdf?job=build
// > Figure 3.36: DWARF Register Number Mapping
pub const X86_FP: gimli::Register = gimli::Register(6); // Frame Pointer ($rbp)
pub const X86_SP: gimli::Register = gimli::Register(7); // Stack Pointer ($rsp)

// Source: https://github.com/ARM-software/abi-aa/blob/05abf4f7/aadwarf64/aadwarf64.rst#41dwarf-register-names
pub const ARM64_FP: gimli::Register = gimli::Register(29); // Frame Pointer (x29)
pub const ARM64_LR: gimli::Register = gimli::Register(30); // Link Register (x30)
pub const ARM64_SP: gimli::Register = gimli::Register(31); // Stack Pointer (sp)
