//! Record boundary scanning and partition planning.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::record::{HEADER_SIZE, PAYLOAD_MAX, PAYLOAD_MIN};
use crate::sort::SortError;

const SCAN_BUF_SIZE: usize = 1024 * 1024;

/// The global record-offset table: the start offset of every record plus the
/// offset one past the last valid record (`end`). Produced once by the scan,
/// consumed by the partition planner.
#[derive(Debug, Clone)]
pub struct OffsetTable {
    offsets: Vec<u64>,
    end: u64,
}

impl OffsetTable {
    pub fn from_parts(offsets: Vec<u64>, end: u64) -> Self {
        OffsetTable { offsets, end }
    }

    pub fn record_count(&self) -> u64 {
        self.offsets.len() as u64
    }

    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    /// Byte offset of record `index`; `index == record_count()` yields the
    /// end of the valid region.
    pub fn offset(&self, index: u64) -> u64 {
        if index >= self.record_count() {
            self.end
        } else {
            self.offsets[index as usize]
        }
    }

    pub fn end(&self) -> u64 {
        self.end
    }
}

/// A half-open, record-aligned byte range of the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// Walks the input once, reading each header and advancing by `12 + L`, to
/// enumerate every record start offset. Stops cleanly at end of file; an
/// invalid length or a record overrunning the file logs a warning and
/// truncates the table at that record.
pub fn scan_offsets(path: &Path) -> Result<OffsetTable, SortError> {
    let file = File::open(path).map_err(|err| SortError::Open(path.to_path_buf(), err))?;
    let file_size = file.metadata().map_err(SortError::Read)?.len();
    let mut reader = BufReader::with_capacity(SCAN_BUF_SIZE, file);

    let mut offsets = Vec::new();
    let mut offset = 0u64;
    while offset + HEADER_SIZE as u64 <= file_size {
        let _key = reader.read_u64::<LittleEndian>().map_err(SortError::Read)?;
        let len = reader.read_u32::<LittleEndian>().map_err(SortError::Read)?;
        if !(PAYLOAD_MIN..=PAYLOAD_MAX).contains(&len) {
            log::warn!(
                "invalid record length {} at offset {}, truncating scan",
                len,
                offset
            );
            break;
        }
        let next = offset + HEADER_SIZE as u64 + len as u64;
        if next > file_size {
            log::warn!(
                "record at offset {} overruns end of file, truncating scan",
                offset
            );
            break;
        }
        offsets.push(offset);
        reader.seek_relative(len as i64).map_err(SortError::Read)?;
        offset = next;
    }

    Ok(OffsetTable { offsets, end: offset })
}

/// Record-index range `[start, end)` assigned to `rank`: every worker gets
/// `total / world` records and the first `total % world` workers get one
/// extra.
pub fn record_range(total: u64, world: usize, rank: usize) -> (u64, u64) {
    let world = world as u64;
    let rank = rank as u64;
    let per_rank = total / world;
    let remainder = total % world;
    let start = rank * per_rank + rank.min(remainder);
    let end = start + per_rank + u64::from(rank < remainder);
    (start, end)
}

/// Maps a worker's record-index range onto a record-aligned byte range.
pub fn byte_range(table: &OffsetTable, world: usize, rank: usize) -> ByteRange {
    let (first, last) = record_range(table.record_count(), world, rank);
    ByteRange {
        start: table.offset(first),
        end: table.offset(last),
    }
}

/// Greedily packs records into record-aligned chunks of at most `max_bytes`
/// each; a single record larger than the budget gets a chunk of its own.
pub fn budget_ranges(table: &OffsetTable, max_bytes: u64) -> Vec<ByteRange> {
    let total = table.record_count();
    let mut ranges = Vec::new();
    if total == 0 {
        return ranges;
    }

    let mut chunk_start = table.offset(0);
    for index in 0..total {
        let record_start = table.offset(index);
        let record_end = table.offset(index + 1);
        if record_end - chunk_start > max_bytes && record_start > chunk_start {
            ranges.push(ByteRange {
                start: chunk_start,
                end: record_start,
            });
            chunk_start = record_start;
        }
    }
    ranges.push(ByteRange {
        start: chunk_start,
        end: table.end(),
    });
    ranges
}
