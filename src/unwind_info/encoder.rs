use thiserror::Error;

use crate::unwind_info::types::{CfaType, CompactUnwindRow, FpType};
use crate::util::Architecture;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RowDecodeError {
    #[error("expected a {expected} bytes row, got {got} bytes")]
    WrongLength { expected: usize, got: usize },
    #[error("unknown cfa type {0}")]
    UnknownCfaType(u8),
    #[error("unknown frame pointer type {0}")]
    UnknownFpType(u8),
}

/// Encodes unwind rows into the packed, fixed-size records the tracer reads.
///
/// x86_64 rows take 14 bytes:
///
/// ```text
/// pc: u64 | cfa_type: u8 | fp_type: u8 | cfa_offset: i16 | fp_offset: i16
/// ```
///
/// aarch64 rows take 16 bytes, with the link register offset right after `pc`:
///
/// ```text
/// pc: u64 | lr_offset: i16 | cfa_type: u8 | fp_type: u8 | cfa_offset: i16 | fp_offset: i16
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CompactRowEncoder {
    arch: Architecture,
}

impl CompactRowEncoder {
    pub fn new(arch: Architecture) -> Self {
        CompactRowEncoder { arch }
    }

    pub fn arch(&self) -> Architecture {
        self.arch
    }

    pub fn row_size(&self) -> usize {
        self.arch.unwind_row_size()
    }

    /// Writes `row` into `out`, which must be exactly `row_size()` bytes long.
    pub fn encode(&self, row: &CompactUnwindRow, out: &mut [u8]) {
        assert_eq!(out.len(), self.row_size(), "row slot has the wrong size");

        out[0..8].copy_from_slice(&row.pc.to_ne_bytes());
        let rest = match self.arch {
            Architecture::X86 => &mut out[8..],
            Architecture::Arm64 => {
                out[8..10].copy_from_slice(&row.lr_offset.to_ne_bytes());
                &mut out[10..]
            }
        };
        rest[0] = row.cfa_type as u8;
        rest[1] = row.fp_type as u8;
        rest[2..4].copy_from_slice(&row.cfa_offset.to_ne_bytes());
        rest[4..6].copy_from_slice(&row.fp_offset.to_ne_bytes());
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<CompactUnwindRow, RowDecodeError> {
        if bytes.len() != self.row_size() {
            return Err(RowDecodeError::WrongLength {
                expected: self.row_size(),
                got: bytes.len(),
            });
        }

        let pc = u64::from_ne_bytes(read_array(&bytes[0..8]));
        let (lr_offset, rest) = match self.arch {
            Architecture::X86 => (0, &bytes[8..]),
            Architecture::Arm64 => (
                i16::from_ne_bytes(read_array(&bytes[8..10])),
                &bytes[10..],
            ),
        };

        Ok(CompactUnwindRow {
            pc,
            cfa_type: CfaType::try_from(rest[0]).map_err(RowDecodeError::UnknownCfaType)?,
            fp_type: FpType::try_from(rest[1]).map_err(RowDecodeError::UnknownFpType)?,
            cfa_offset: i16::from_ne_bytes(read_array(&rest[2..4])),
            fp_offset: i16::from_ne_bytes(read_array(&rest[4..6])),
            lr_offset,
        })
    }
}

/// Copies a slice whose length was already checked into a fixed-size array.
fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut array = [0; N];
    array.copy_from_slice(bytes);
    array
}
