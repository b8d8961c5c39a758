//! Fixed-size record layout.

use std::cmp::Ordering;
use std::error::Error;
use std::fmt;
use std::fmt::{Debug, Display};
use std::io;

use log;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of a single record in bytes. Agreed upon by all nodes, never sent on the wire.
pub const RECORD_SIZE: usize = 100;
/// Size of the sort key prefix in bytes.
pub const KEY_SIZE: usize = 10;

/// Record decoding error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// Input length differs from [`RECORD_SIZE`].
    Malformed { expected: usize, actual: usize },
}

impl Error for RecordError {}

impl Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            RecordError::Malformed { expected, actual } => {
                write!(f, "malformed record: expected {} bytes, got {}", expected, actual)
            }
        }
    }
}

/// Immutable fixed-width record: a [`KEY_SIZE`] bytes key followed by an opaque payload.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Record {
    bytes: [u8; RECORD_SIZE],
}

impl Record {
    /// Creates a record from exactly [`RECORD_SIZE`] bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RecordError> {
        let bytes: [u8; RECORD_SIZE] = bytes.try_into().map_err(|_| RecordError::Malformed {
            expected: RECORD_SIZE,
            actual: bytes.len(),
        })?;

        return Ok(Record { bytes });
    }

    /// Record with every byte set to zero. Used as the body of end-of-stream frames.
    pub fn zeroed() -> Self {
        Record {
            bytes: [0; RECORD_SIZE],
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.bytes[..KEY_SIZE]
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[KEY_SIZE..]
    }

    pub fn as_bytes(&self) -> &[u8; RECORD_SIZE] {
        &self.bytes
    }

    /// Compares records by their key bytes only.
    pub fn cmp_key(&self, other: &Record) -> Ordering {
        self.key().cmp(other.key())
    }
}

impl From<[u8; RECORD_SIZE]> for Record {
    fn from(bytes: [u8; RECORD_SIZE]) -> Self {
        Record { bytes }
    }
}

impl Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Record(key=")?;
        for byte in self.key() {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

/// Extracts the key bytes of an encoded record.
pub fn extract_key(record: &[u8]) -> Result<&[u8], RecordError> {
    check_len(record)?;
    Ok(&record[..KEY_SIZE])
}

/// Extracts the payload bytes of an encoded record.
pub fn extract_payload(record: &[u8]) -> Result<&[u8], RecordError> {
    check_len(record)?;
    Ok(&record[KEY_SIZE..])
}

fn check_len(record: &[u8]) -> Result<(), RecordError> {
    if record.len() != RECORD_SIZE {
        return Err(RecordError::Malformed {
            expected: RECORD_SIZE,
            actual: record.len(),
        });
    }
    Ok(())
}

/// Reads records from a byte stream in successive [`RECORD_SIZE`] chunks.
///
/// The stream ends either on a clean EOF or on a trailing chunk shorter than a record.
/// The bytes of such a trailing chunk are dropped and reported by [`RecordReader::discarded_bytes`].
pub struct RecordReader<R> {
    reader: R,
    discarded: usize,
    exhausted: bool,
}

impl<R: AsyncRead + Unpin> RecordReader<R> {
    pub fn new(reader: R) -> Self {
        RecordReader {
            reader,
            discarded: 0,
            exhausted: false,
        }
    }

    /// Returns the next record, or [`None`] once the input is exhausted.
    pub async fn next_record(&mut self) -> io::Result<Option<Record>> {
        if self.exhausted {
            return Ok(None);
        }

        let mut bytes = [0u8; RECORD_SIZE];
        let mut filled = 0;
        while filled < RECORD_SIZE {
            let n = self.reader.read(&mut bytes[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled < RECORD_SIZE {
            self.exhausted = true;
            if filled > 0 {
                log::warn!("input ends with a partial record, {} trailing bytes discarded", filled);
                self.discarded = filled;
            }
            return Ok(None);
        }

        return Ok(Some(Record { bytes }));
    }

    /// Number of trailing bytes dropped because they did not form a whole record.
    pub fn discarded_bytes(&self) -> usize {
        self.discarded
    }
}
