//! Key-prefix partitioner.

use crate::cluster::{validate_size, ClusterError, NodeId};
use crate::record::Record;

/// Maps records to their owning node using the most significant bits of the first key byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partitioner {
    cluster_size: usize,
    significant_bits: u32,
}

impl Partitioner {
    /// Creates a partitioner for a cluster of `cluster_size` nodes.
    /// The size must be a power of two not greater than 256.
    pub fn new(cluster_size: usize) -> Result<Self, ClusterError> {
        validate_size(cluster_size)?;

        return Ok(Partitioner {
            cluster_size,
            significant_bits: cluster_size.trailing_zeros(),
        });
    }

    pub fn cluster_size(&self) -> usize {
        self.cluster_size
    }

    /// Number of leading key bits that select a destination.
    pub fn significant_bits(&self) -> u32 {
        self.significant_bits
    }

    /// Destination of a record whose key starts with `first_key_byte`.
    pub fn destination_of_byte(&self, first_key_byte: u8) -> NodeId {
        // shifting by 8 is fine on u32 and yields 0 for a single-node cluster
        (u32::from(first_key_byte) >> (8 - self.significant_bits)) as NodeId
    }

    pub fn destination_of(&self, record: &Record) -> NodeId {
        self.destination_of_byte(record.key()[0])
    }
}
