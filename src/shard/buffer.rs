use crate::unwind_info::types::CompactUnwindRow;
use crate::unwind_info::{CompactRowEncoder, RowDecodeError};

/// The open shard: a zero-initialized region of `capacity` encoded rows that
/// is filled front to back and written to the kernel as a whole.
pub struct ShardBuffer {
    encoder: CompactRowEncoder,
    capacity: usize,
    data: Vec<u8>,
    /// First row of the chunk being written.
    low_index: usize,
    /// One past the last written row.
    high_index: usize,
}

impl ShardBuffer {
    pub fn new(encoder: CompactRowEncoder, capacity: usize) -> Self {
        ShardBuffer {
            encoder,
            capacity,
            data: vec![0; capacity * encoder.row_size()],
            low_index: 0,
            high_index: 0,
        }
    }

    pub fn encoder(&self) -> &CompactRowEncoder {
        &self.encoder
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Rows written so far.
    pub fn len(&self) -> usize {
        self.high_index
    }

    pub fn is_empty(&self) -> bool {
        self.high_index == 0
    }

    pub fn available(&self) -> usize {
        self.capacity - self.high_index
    }

    /// Appends `rows` as a new chunk, returning its `[low, high)` row indices.
    pub fn push_rows(&mut self, rows: &[CompactUnwindRow]) -> (u64, u64) {
        assert!(
            rows.len() <= self.available(),
            "shard overflow: {} rows do not fit in {} available",
            rows.len(),
            self.available()
        );

        let row_size = self.encoder.row_size();
        self.low_index = self.high_index;
        let start = self.high_index * row_size;
        for (row, slot) in rows
            .iter()
            .zip(self.data[start..].chunks_exact_mut(row_size))
        {
            self.encoder.encode(row, slot);
        }
        self.high_index += rows.len();

        (self.low_index as u64, self.high_index as u64)
    }

    /// The whole buffer, as the kernel expects it.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn row(&self, index: usize) -> Result<CompactUnwindRow, RowDecodeError> {
        let row_size = self.encoder.row_size();
        self.encoder
            .decode(&self.data[index * row_size..(index + 1) * row_size])
    }

    /// Zeroes the written rows and rewinds the cursors.
    pub fn reset(&mut self) {
        let written = self.high_index * self.encoder.row_size();
        self.data[..written].fill(0);
        self.low_index = 0;
        self.high_index = 0;
    }
}
