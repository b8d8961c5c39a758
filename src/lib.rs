//! `net-sort` is a distributed sort over a fixed cluster of cooperating nodes.
//!
//! Every node reads its share of the input, sends each record to the node owning the record's
//! key range and sorts whatever it receives. Concatenating node outputs in node id order
//! yields the whole dataset in key order.
//!
//! # Overview
//!
//! * **Partitioning:**
//!   the owner of a record is given by the most significant bits of its first key byte, so the
//!   cluster size must be a power of two.
//! * **Transport:**
//!   one TCP connection per record, framed with a tag byte that marks data or end-of-stream.
//!   Dialing is retried, every frame is acknowledged once the owner has queued it.
//! * **Termination:**
//!   a node stops receiving once it has counted one end-of-stream signal per cluster member,
//!   or fails when the configured deadline elapses.
//! * **Multithreading support:**
//!   owned records are sorted on a `rayon` thread pool.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use net_sort::{Cluster, LocalSorterBuilder, ShuffleConfig, ShuffleNode};
//!
//! #[tokio::main]
//! async fn main() {
//!     let cluster = Cluster::from_path(Path::new("cluster.yaml")).unwrap();
//!     let sorter = Arc::new(LocalSorterBuilder::new().build().unwrap());
//!     let input = tokio::fs::File::open("input.bin").await.unwrap();
//!
//!     let node = ShuffleNode::bind(cluster, 0, ShuffleConfig::default()).await.unwrap();
//!     let report = node.run(input, sorter.clone()).await.unwrap();
//!
//!     sorter.write_to_path(&report.records, Path::new("output.bin")).unwrap();
//! }
//! ```

pub mod buffer;
pub mod cluster;
pub mod partition;
pub mod record;
pub mod shuffle;
pub mod sort;
pub mod transport;

pub use buffer::RecordBuffer;
pub use cluster::{Cluster, ClusterError, Node, NodeId};
pub use partition::Partitioner;
pub use record::{Record, RecordError, RecordReader, KEY_SIZE, RECORD_SIZE};
pub use shuffle::{Accumulator, SendStats, ShuffleConfig, ShuffleError, ShuffleNode, ShuffleReport, ShuffleState};
pub use sort::{LocalSorter, LocalSorterBuilder, SortError};
pub use transport::{Frame, FrameTag, Listener, PeerSender, RetryPolicy, TransportError};
