//! On-disk record format.
//!
//! A record is an 8-byte little-endian key, a 4-byte little-endian payload
//! length `L` with `PAYLOAD_MIN <= L <= PAYLOAD_MAX`, then `L` payload bytes.
//! There is no padding and no alignment guarantee, so all header decoding
//! goes through byte-wise little-endian reads.

use std::error::Error;
use std::fmt;
use std::io::{self, Read, Write};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

/// Smallest payload a valid record may carry.
pub const PAYLOAD_MIN: u32 = 8;
/// Largest payload a valid record may carry.
pub const PAYLOAD_MAX: u32 = 4096;
/// Encoded size of the key and length fields.
pub const HEADER_SIZE: usize = 12;

/// Record decoding error.
#[derive(Debug)]
pub enum RecordError {
    /// A declared payload length fell outside `[PAYLOAD_MIN, PAYLOAD_MAX]`.
    InvalidLength(u32),
    /// A header or payload was cut short mid-record.
    UnexpectedEof,
    /// Common I/O error.
    IO(io::Error),
}

impl Error for RecordError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RecordError::IO(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordError::InvalidLength(len) => {
                write!(f, "invalid record length {} (expected {}..={})", len, PAYLOAD_MIN, PAYLOAD_MAX)
            }
            RecordError::UnexpectedEof => write!(f, "record cut short by end of input"),
            RecordError::IO(err) => write!(f, "I/O operation failed: {}", err),
        }
    }
}

impl From<io::Error> for RecordError {
    fn from(err: io::Error) -> Self {
        RecordError::IO(err)
    }
}

/// A record descriptor borrowing its payload from the buffer it was indexed
/// from (typically the memory-mapped input). Valid only while that buffer is
/// held; sorting moves descriptors, never payload bytes.
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    pub key: u64,
    pub payload: &'a [u8],
}

impl<'a> RecordView<'a> {
    pub fn payload_len(&self) -> u32 {
        self.payload.len() as u32
    }

    /// Total encoded size of the record, header included.
    pub fn encoded_size(&self) -> u64 {
        HEADER_SIZE as u64 + self.payload.len() as u64
    }

    /// Writes the record verbatim: key, length, payload.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u64::<LittleEndian>(self.key)?;
        writer.write_u32::<LittleEndian>(self.payload_len())?;
        writer.write_all(self.payload)
    }
}

/// A record that owns its payload, used wherever a record has to outlive the
/// buffer it was decoded from (merge cursors, inter-worker transfer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedRecord {
    pub key: u64,
    pub payload: Vec<u8>,
}

impl OwnedRecord {
    pub fn encoded_size(&self) -> u64 {
        HEADER_SIZE as u64 + self.payload.len() as u64
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u64::<LittleEndian>(self.key)?;
        writer.write_u32::<LittleEndian>(self.payload.len() as u32)?;
        writer.write_all(&self.payload)
    }
}

/// Decodes a record header from the start of `bytes`. The source may be
/// unaligned; both fields are read byte-wise.
pub fn decode_header(bytes: &[u8]) -> Result<(u64, u32), RecordError> {
    if bytes.len() < HEADER_SIZE {
        return Err(RecordError::UnexpectedEof);
    }
    let key = LittleEndian::read_u64(&bytes[..8]);
    let len = LittleEndian::read_u32(&bytes[8..HEADER_SIZE]);
    if !(PAYLOAD_MIN..=PAYLOAD_MAX).contains(&len) {
        return Err(RecordError::InvalidLength(len));
    }
    Ok((key, len))
}

/// Reads one record from `reader`. Returns `Ok(None)` on a clean end of
/// input (zero bytes before the next header) and `UnexpectedEof` when the
/// input ends inside a header or payload.
pub fn read_record<R: Read>(reader: &mut R) -> Result<Option<OwnedRecord>, RecordError> {
    let mut header = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let n = reader.read(&mut header[filled..])?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(RecordError::UnexpectedEof)
            };
        }
        filled += n;
    }

    let (key, len) = decode_header(&header)?;
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            RecordError::UnexpectedEof
        } else {
            RecordError::IO(err)
        }
    })?;

    Ok(Some(OwnedRecord { key, payload }))
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use rstest::*;

    use super::{decode_header, read_record, OwnedRecord, RecordError, HEADER_SIZE};

    fn encoded(key: u64, payload: &[u8]) -> Vec<u8> {
        let record = OwnedRecord {
            key,
            payload: payload.to_vec(),
        };
        let mut buf = Vec::new();
        record.write_to(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_header_roundtrip() {
        let buf = encoded(0xDEAD_BEEF_0102_0304, b"AAAAAAAA");
        assert_eq!(buf.len(), HEADER_SIZE + 8);
        let (key, len) = decode_header(&buf).unwrap();
        assert_eq!(key, 0xDEAD_BEEF_0102_0304);
        assert_eq!(len, 8);
    }

    #[test]
    fn test_header_decode_is_alignment_free() {
        // Decode from an odd offset into a larger buffer.
        let mut buf = vec![0xFFu8; 3];
        buf.extend_from_slice(&encoded(7, b"12345678"));
        let (key, len) = decode_header(&buf[3..]).unwrap();
        assert_eq!((key, len), (7, 8));
    }

    #[rstest]
    #[case(0)]
    #[case(7)]
    #[case(4097)]
    #[case(u32::MAX)]
    fn test_invalid_length_rejected(#[case] bad_len: u32) {
        let mut buf = encoded(1, b"AAAAAAAA");
        buf[8..HEADER_SIZE].copy_from_slice(&bad_len.to_le_bytes());
        match decode_header(&buf) {
            Err(RecordError::InvalidLength(len)) => assert_eq!(len, bad_len),
            other => panic!("expected InvalidLength, got {:?}", other),
        }
    }

    #[test]
    fn test_read_record_clean_eof() {
        let mut reader = Cursor::new(Vec::new());
        assert!(read_record(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_read_record_short_payload() {
        let mut buf = encoded(1, b"AAAAAAAA");
        buf.truncate(buf.len() - 3);
        let mut reader = Cursor::new(buf);
        match read_record(&mut reader) {
            Err(RecordError::UnexpectedEof) => {}
            other => panic!("expected UnexpectedEof, got {:?}", other),
        }
    }

    #[test]
    fn test_read_record_short_header() {
        let mut reader = Cursor::new(vec![0u8; HEADER_SIZE - 5]);
        match read_record(&mut reader) {
            Err(RecordError::UnexpectedEof) => {}
            other => panic!("expected UnexpectedEof, got {:?}", other),
        }
    }

    #[test]
    fn test_read_record_roundtrip() {
        let mut buf = encoded(42, b"hello, sorted world!");
        buf.extend_from_slice(&encoded(7, b"AAAAAAAA"));
        let mut reader = Cursor::new(buf);

        let first = read_record(&mut reader).unwrap().unwrap();
        assert_eq!(first.key, 42);
        assert_eq!(first.payload, b"hello, sorted world!");

        let second = read_record(&mut reader).unwrap().unwrap();
        assert_eq!(second.key, 7);
        assert!(read_record(&mut reader).unwrap().is_none());
    }
}
