//! Layouts of the values shared with the tracer. Every record is encoded field by
//! field in host byte order, without relying on Rust's struct layout.

use thiserror::Error;

use crate::process::Pid;

pub const MAX_STACK_DEPTH: usize = 127;

pub const REQUEST_UNWIND_INFORMATION: u64 = 1 << 63;
pub const REQUEST_PROCESS_MAPPINGS: u64 = 1 << 62;
pub const REQUEST_REFRESH_PROC_INFO: u64 = 1 << 61;

pub const MAPPING_TYPE_FILE: u64 = 0;
pub const MAPPING_TYPE_JITTED: u64 = 1;
pub const MAPPING_TYPE_SPECIAL: u64 = 2;

const PROCESS_INFO_HEADER_SIZE: usize = 4 * 8;
const MAPPING_RECORD_SIZE: usize = 5 * 8;
const CHUNK_DESCRIPTOR_SIZE: usize = 5 * 8;
pub const STACK_COUNT_KEY_SIZE: usize = 4 + 4 + 3 * 8;
pub const STACK_TRACE_SIZE: usize = 8 + MAX_STACK_DEPTH * 8;

const SYMBOL_CLASS_NAME_LEN: usize = 32;
const SYMBOL_METHOD_NAME_LEN: usize = 64;
const SYMBOL_PATH_LEN: usize = 128;
pub const INTERPRETER_SYMBOL_SIZE: usize =
    SYMBOL_CLASS_NAME_LEN + SYMBOL_METHOD_NAME_LEN + SYMBOL_PATH_LEN;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("expected {expected} bytes, got {got}")]
    WrongSize { expected: usize, got: usize },
    #[error("{count} mappings do not fit in {max}")]
    TooManyMappings { count: u64, max: usize },
}

fn check_size(bytes: &[u8], expected: usize) -> Result<(), DecodeError> {
    if bytes.len() != expected {
        return Err(DecodeError::WrongSize {
            expected,
            got: bytes.len(),
        });
    }
    Ok(())
}

/// Sequential reader over a buffer whose size was already validated.
struct FieldReader<'a> {
    bytes: &'a [u8],
}

impl<'a> FieldReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        FieldReader { bytes }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let (head, rest) = self.bytes.split_at(N);
        self.bytes = rest;
        let mut array = [0; N];
        array.copy_from_slice(head);
        array
    }

    fn u64(&mut self) -> u64 {
        u64::from_ne_bytes(self.take())
    }

    fn i32(&mut self) -> i32 {
        i32::from_ne_bytes(self.take())
    }

    fn c_string(&mut self, len: usize) -> String {
        let (head, rest) = self.bytes.split_at(len);
        self.bytes = rest;
        let end = head.iter().position(|b| *b == 0).unwrap_or(len);
        String::from_utf8_lossy(&head[..end]).into_owned()
    }
}

/// One executable mapping of a process, as the tracer sees it.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct MappingRecord {
    pub load_address: u64,
    pub begin: u64,
    pub end: u64,
    /// Handle of the executable's unwind information, 0 if there is none.
    pub executable_id: u64,
    pub kind: u64,
}

/// Per process information the tracer needs to unwind its stacks.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessInfoRecord {
    pub should_use_fp_by_default: bool,
    pub is_jit_compiler: bool,
    pub interpreter_type: u64,
    pub mappings: Vec<MappingRecord>,
}

impl ProcessInfoRecord {
    pub fn encoded_size(max_mappings: usize) -> usize {
        PROCESS_INFO_HEADER_SIZE + max_mappings * MAPPING_RECORD_SIZE
    }

    /// Writes the record into `out`, zero padding the unused mapping slots so
    /// the value always has the size the tracer expects.
    pub fn encode_into(&self, out: &mut Vec<u8>, max_mappings: usize) {
        assert!(
            self.mappings.len() <= max_mappings,
            "process info holds more mappings than the tracer accepts"
        );

        out.clear();
        out.extend_from_slice(&(self.should_use_fp_by_default as u64).to_ne_bytes());
        out.extend_from_slice(&(self.is_jit_compiler as u64).to_ne_bytes());
        out.extend_from_slice(&self.interpreter_type.to_ne_bytes());
        out.extend_from_slice(&(self.mappings.len() as u64).to_ne_bytes());
        for mapping in &self.mappings {
            for field in [
                mapping.load_address,
                mapping.begin,
                mapping.end,
                mapping.executable_id,
                mapping.kind,
            ] {
                out.extend_from_slice(&field.to_ne_bytes());
            }
        }
        out.resize(Self::encoded_size(max_mappings), 0);
    }

    pub fn decode(bytes: &[u8], max_mappings: usize) -> Result<Self, DecodeError> {
        check_size(bytes, Self::encoded_size(max_mappings))?;
        let mut reader = FieldReader::new(bytes);

        let should_use_fp_by_default = reader.u64() != 0;
        let is_jit_compiler = reader.u64() != 0;
        let interpreter_type = reader.u64();
        let len = reader.u64();
        if len > max_mappings as u64 {
            return Err(DecodeError::TooManyMappings {
                count: len,
                max: max_mappings,
            });
        }

        let mappings = (0..len)
            .map(|_| MappingRecord {
                load_address: reader.u64(),
                begin: reader.u64(),
                end: reader.u64(),
                executable_id: reader.u64(),
                kind: reader.u64(),
            })
            .collect();

        Ok(ProcessInfoRecord {
            should_use_fp_by_default,
            is_jit_compiler,
            interpreter_type,
            mappings,
        })
    }
}

/// Describes which rows of which shard hold the unwind information for a
/// range of program counters of one executable.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub low_pc: u64,
    pub high_pc: u64,
    pub shard_index: u64,
    pub low_index: u64,
    pub high_index: u64,
}

impl ChunkDescriptor {
    /// Encodes the chunk index value of an executable: `max_chunks` descriptors,
    /// the unused ones zeroed.
    pub fn encode_all(chunks: &[ChunkDescriptor], max_chunks: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(max_chunks * CHUNK_DESCRIPTOR_SIZE);
        for chunk in chunks.iter().take(max_chunks) {
            for field in [
                chunk.low_pc,
                chunk.high_pc,
                chunk.shard_index,
                chunk.low_index,
                chunk.high_index,
            ] {
                out.extend_from_slice(&field.to_ne_bytes());
            }
        }
        out.resize(max_chunks * CHUNK_DESCRIPTOR_SIZE, 0);
        out
    }

    /// Decodes a chunk index value, skipping unused slots.
    pub fn decode_all(bytes: &[u8], max_chunks: usize) -> Result<Vec<Self>, DecodeError> {
        check_size(bytes, max_chunks * CHUNK_DESCRIPTOR_SIZE)?;
        let mut reader = FieldReader::new(bytes);

        Ok((0..max_chunks)
            .map(|_| ChunkDescriptor {
                low_pc: reader.u64(),
                high_pc: reader.u64(),
                shard_index: reader.u64(),
                low_index: reader.u64(),
                high_index: reader.u64(),
            })
            .filter(|chunk| chunk.high_index != 0)
            .collect())
    }
}

/// Key of the stack count map, one per distinct (thread, stacks) tuple.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct StackCountKey {
    pub pid: Pid,
    pub tid: Pid,
    pub user_stack_id: u64,
    pub kernel_stack_id: u64,
    pub interpreter_stack_id: u64,
}

impl StackCountKey {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(STACK_COUNT_KEY_SIZE);
        out.extend_from_slice(&self.pid.to_ne_bytes());
        out.extend_from_slice(&self.tid.to_ne_bytes());
        out.extend_from_slice(&self.user_stack_id.to_ne_bytes());
        out.extend_from_slice(&self.kernel_stack_id.to_ne_bytes());
        out.extend_from_slice(&self.interpreter_stack_id.to_ne_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        check_size(bytes, STACK_COUNT_KEY_SIZE)?;
        let mut reader = FieldReader::new(bytes);
        Ok(StackCountKey {
            pid: reader.i32(),
            tid: reader.i32(),
            user_stack_id: reader.u64(),
            kernel_stack_id: reader.u64(),
            interpreter_stack_id: reader.u64(),
        })
    }
}

pub fn encode_count(count: u64) -> Vec<u8> {
    count.to_ne_bytes().to_vec()
}

pub fn decode_count(bytes: &[u8]) -> Result<u64, DecodeError> {
    check_size(bytes, 8)?;
    Ok(FieldReader::new(bytes).u64())
}

/// Value of the interpreter symbol map.
pub fn encode_symbol_id(id: u32) -> Vec<u8> {
    id.to_ne_bytes().to_vec()
}

pub fn decode_symbol_id(bytes: &[u8]) -> Result<u32, DecodeError> {
    check_size(bytes, 4)?;
    Ok(u32::from_ne_bytes(FieldReader::new(bytes).take()))
}

/// Encodes a stack trace value, `len` followed by `MAX_STACK_DEPTH` addresses.
pub fn encode_stack_trace(addresses: &[u64]) -> Vec<u8> {
    let len = addresses.len().min(MAX_STACK_DEPTH);
    let mut out = Vec::with_capacity(STACK_TRACE_SIZE);
    out.extend_from_slice(&(len as u64).to_ne_bytes());
    for address in &addresses[..len] {
        out.extend_from_slice(&address.to_ne_bytes());
    }
    out.resize(STACK_TRACE_SIZE, 0);
    out
}

/// Copies the addresses of a stack trace value into `out`, stopping at the
/// recorded length or at the first zero address. Returns how many were copied.
pub fn decode_stack_trace(bytes: &[u8], out: &mut [u64]) -> Result<usize, DecodeError> {
    check_size(bytes, STACK_TRACE_SIZE)?;
    let mut reader = FieldReader::new(bytes);

    let len = (reader.u64() as usize).min(MAX_STACK_DEPTH).min(out.len());
    for (i, slot) in out.iter_mut().enumerate().take(len) {
        let address = reader.u64();
        if address == 0 {
            return Ok(i);
        }
        *slot = address;
    }
    Ok(len)
}

/// A function of an interpreted language, as written by the tracer.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct InterpreterSymbol {
    pub class_name: String,
    pub method_name: String,
    pub path: String,
}

impl InterpreterSymbol {
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        check_size(bytes, INTERPRETER_SYMBOL_SIZE)?;
        let mut reader = FieldReader::new(bytes);
        Ok(InterpreterSymbol {
            class_name: reader.c_string(SYMBOL_CLASS_NAME_LEN),
            method_name: reader.c_string(SYMBOL_METHOD_NAME_LEN),
            path: reader.c_string(SYMBOL_PATH_LEN),
        })
    }

    /// Encodes the symbol, truncating fields that are too long.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(INTERPRETER_SYMBOL_SIZE);
        for (field, len) in [
            (&self.class_name, SYMBOL_CLASS_NAME_LEN),
            (&self.method_name, SYMBOL_METHOD_NAME_LEN),
            (&self.path, SYMBOL_PATH_LEN),
        ] {
            let start = out.len();
            let bytes = field.as_bytes();
            out.extend_from_slice(&bytes[..bytes.len().min(len - 1)]);
            out.resize(start + len, 0);
        }
        out
    }
}
