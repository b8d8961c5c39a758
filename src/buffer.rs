//! Accumulation buffer.

use rayon;

use crate::record::Record;

/// Unordered collection of the records owned by a node.
///
/// The buffer has a single owner at any time: the shuffle drain loop while records arrive,
/// then the sorter which consumes it.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecordBuffer {
    inner: Vec<Record>,
}

impl RecordBuffer {
    pub fn new() -> Self {
        RecordBuffer { inner: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        RecordBuffer {
            inner: Vec::with_capacity(capacity),
        }
    }

    /// Adds a new record to the buffer.
    pub fn push(&mut self, record: Record) {
        self.inner.push(record);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn as_slice(&self) -> &[Record] {
        self.inner.as_slice()
    }

    pub fn into_vec(self) -> Vec<Record> {
        self.inner
    }
}

impl FromIterator<Record> for RecordBuffer {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        RecordBuffer {
            inner: Vec::from_iter(iter),
        }
    }
}

impl IntoIterator for RecordBuffer {
    type Item = Record;
    type IntoIter = <Vec<Record> as IntoIterator>::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

impl rayon::slice::ParallelSliceMut<Record> for RecordBuffer {
    fn as_parallel_slice_mut(&mut self) -> &mut [Record] {
        self.inner.as_mut_slice()
    }
}
