//! Chunk indexing over the memory-mapped input and run file spill/read.
//!
//! A chunk is a record-aligned byte range of the input. Indexing walks the
//! range once and produces descriptors that alias the mapping; the payload
//! bytes are not copied until [`write_run`] streams the sorted descriptors
//! to a run file.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use memmap2::{Advice, Mmap};

use crate::record::{self, OwnedRecord, RecordError, RecordView, HEADER_SIZE};
use crate::sort::SortError;

/// Read/write buffer size for run files.
pub const RUN_BUF_SIZE: usize = 8 * 1024 * 1024;

/// Maps the input file read-only and hints the kernel that access will be
/// sequential.
pub fn map_input(path: &Path) -> Result<Mmap, SortError> {
    let file = File::open(path).map_err(|err| SortError::Open(path.to_path_buf(), err))?;
    let map = unsafe { Mmap::map(&file) }.map_err(SortError::Read)?;
    map.advise(Advice::Sequential).map_err(SortError::Read)?;
    Ok(map)
}

/// Where and why an index walk stopped early.
#[derive(Debug)]
pub struct Truncation {
    pub offset: u64,
    pub reason: RecordError,
}

/// The descriptors of one indexed chunk. `end` is the offset one past the
/// last indexed record; it equals the requested end offset unless the walk
/// was truncated.
pub struct ChunkIndex<'a> {
    pub records: Vec<RecordView<'a>>,
    pub truncation: Option<Truncation>,
    pub end: u64,
}

/// Walks `[start, end)` of `data` and produces a descriptor for every record
/// whose start lies in the range. On an invalid or overrunning record the
/// walk stops at that record and reports it; records already indexed are
/// kept.
pub fn index_chunk(data: &[u8], start: u64, end: u64) -> ChunkIndex<'_> {
    let limit = end.min(data.len() as u64);
    let mut records = Vec::new();
    let mut truncation = None;
    let mut offset = start;

    while offset < limit {
        let (key, len) = match record::decode_header(&data[offset as usize..]) {
            Ok(header) => header,
            Err(reason) => {
                truncation = Some(Truncation { offset, reason });
                break;
            }
        };
        let payload_start = offset as usize + HEADER_SIZE;
        let payload_end = payload_start + len as usize;
        if payload_end as u64 > data.len() as u64 {
            truncation = Some(Truncation {
                offset,
                reason: RecordError::UnexpectedEof,
            });
            break;
        }
        records.push(RecordView {
            key,
            payload: &data[payload_start..payload_end],
        });
        offset = payload_end as u64;
    }

    ChunkIndex {
        records,
        truncation,
        end: offset,
    }
}

/// Streams a descriptor slice to a new run file, flushing before close so
/// the file is immediately readable by a merge step.
pub fn write_run(path: &Path, records: &[RecordView<'_>]) -> Result<(), SortError> {
    let file = File::create(path).map_err(|err| SortError::Create(path.to_path_buf(), err))?;
    let mut writer = BufWriter::with_capacity(RUN_BUF_SIZE, file);
    for record in records {
        record.write_to(&mut writer).map_err(SortError::Write)?;
    }
    writer.flush().map_err(SortError::Write)?;
    Ok(())
}

/// Sequential reader over a run file.
pub struct RunReader {
    reader: BufReader<File>,
}

impl RunReader {
    pub fn open(path: &Path) -> Result<Self, SortError> {
        let file = File::open(path).map_err(|err| SortError::Open(path.to_path_buf(), err))?;
        Ok(RunReader {
            reader: BufReader::with_capacity(RUN_BUF_SIZE, file),
        })
    }

    /// Decodes the next record; `Ok(None)` on clean end of file.
    pub fn next_record(&mut self) -> Result<Option<OwnedRecord>, RecordError> {
        record::read_record(&mut self.reader)
    }
}
