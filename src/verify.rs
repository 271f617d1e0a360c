//! Sorted-file verification.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::record::{RecordError, HEADER_SIZE, PAYLOAD_MAX, PAYLOAD_MIN};
use crate::sort::SortError;

const VERIFY_BUF_SIZE: usize = 1024 * 1024;

/// Checks that `path` is a valid record sequence with non-decreasing keys
/// and returns the record count. Unlike the boundary scan, verification is
/// strict: an invalid length, a short record, or a key-order violation is
/// an error, not a truncation.
pub fn verify(path: &Path) -> Result<u64, SortError> {
    let file = File::open(path).map_err(|err| SortError::Open(path.to_path_buf(), err))?;
    let file_size = file.metadata().map_err(SortError::Read)?.len();
    let mut reader = BufReader::with_capacity(VERIFY_BUF_SIZE, file);

    let mut prev_key = 0u64;
    let mut records = 0u64;
    let mut offset = 0u64;
    while offset < file_size {
        if offset + HEADER_SIZE as u64 > file_size {
            return Err(SortError::Record(RecordError::UnexpectedEof));
        }
        let key = reader.read_u64::<LittleEndian>().map_err(SortError::Read)?;
        let len = reader.read_u32::<LittleEndian>().map_err(SortError::Read)?;
        if !(PAYLOAD_MIN..=PAYLOAD_MAX).contains(&len) {
            return Err(SortError::Record(RecordError::InvalidLength(len)));
        }
        let next = offset + HEADER_SIZE as u64 + len as u64;
        if next > file_size {
            return Err(SortError::Record(RecordError::UnexpectedEof));
        }
        if records > 0 && key < prev_key {
            return Err(SortError::KeyOrder {
                record: records,
                prev_key,
                key,
            });
        }

        reader.seek_relative(len as i64).map_err(SortError::Read)?;
        prev_key = key;
        records += 1;
        offset = next;

        if records % 1_000_000 == 0 {
            log::debug!("verified {} records", records);
        }
    }

    Ok(records)
}
