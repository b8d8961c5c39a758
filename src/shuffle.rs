//! Shuffle coordinator.
//!
//! A node listens for frames from its peers while streaming its own input to the owners
//! chosen by the [`Partitioner`]. Once every node, itself included, has signalled
//! end-of-stream, the records it owns are sorted.
//!
//! The drain loop is the only consumer of the inbound channel and the only owner of the
//! [`Accumulator`], so neither the buffer nor the sentinel counter needs a lock.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use log;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};

use crate::buffer::RecordBuffer;
use crate::cluster::{Cluster, ClusterError, NodeId};
use crate::partition::Partitioner;
use crate::record::{Record, RecordReader};
use crate::sort::LocalSorter;
use crate::transport::{Frame, Listener, PeerSender, RetryPolicy, TransportError};

/// Shuffle error.
#[derive(Debug)]
pub enum ShuffleError {
    /// Invalid cluster configuration or unknown node id.
    Cluster(ClusterError),
    /// Listener could not be bound.
    Transport(TransportError),
    /// Local input could not be read.
    Input(io::Error),
    /// Deadline elapsed before every end-of-stream sentinel was counted.
    Timeout { received: usize, expected: usize },
    /// Deadline elapsed after every end-of-stream sentinel was counted,
    /// while this node was still sending its own frames to peers.
    SendsPending { expected: usize },
    /// Inbound channel closed before every end-of-stream sentinel was counted.
    InboundClosed { received: usize, expected: usize },
    /// Background task panicked or was cancelled.
    Task(JoinError),
}

impl Error for ShuffleError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            ShuffleError::Cluster(err) => Some(err),
            ShuffleError::Transport(err) => Some(err),
            ShuffleError::Input(err) => Some(err),
            ShuffleError::Task(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for ShuffleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            ShuffleError::Cluster(err) => write!(f, "cluster configuration error: {}", err),
            ShuffleError::Transport(err) => write!(f, "transport error: {}", err),
            ShuffleError::Input(err) => write!(f, "input data stream error: {}", err),
            ShuffleError::Timeout { received, expected } => write!(
                f,
                "shuffle timed out with {} of {} end-of-stream signals received",
                received, expected
            ),
            ShuffleError::SendsPending { expected } => write!(
                f,
                "shuffle timed out with all {} end-of-stream signals received but own sends still pending",
                expected
            ),
            ShuffleError::InboundClosed { received, expected } => write!(
                f,
                "inbound channel closed with {} of {} end-of-stream signals received",
                received, expected
            ),
            ShuffleError::Task(err) => write!(f, "background task failed: {}", err),
        }
    }
}

impl From<ClusterError> for ShuffleError {
    fn from(err: ClusterError) -> Self {
        ShuffleError::Cluster(err)
    }
}

impl From<TransportError> for ShuffleError {
    fn from(err: TransportError) -> Self {
        ShuffleError::Transport(err)
    }
}

/// Runtime settings of a shuffle.
#[derive(Debug, Clone)]
pub struct ShuffleConfig {
    /// Overall limit on the exchange phase. [`None`] waits forever.
    pub deadline: Option<Duration>,
    /// Dial retry policy used for every frame.
    pub retry: RetryPolicy,
    /// Limit on a single connection's frame transfer and acknowledgment.
    pub io_timeout: Duration,
    /// Inbound channel capacity.
    pub channel_capacity: usize,
}

impl Default for ShuffleConfig {
    fn default() -> Self {
        ShuffleConfig {
            deadline: None,
            retry: RetryPolicy::default(),
            io_timeout: Duration::from_secs(5),
            channel_capacity: 1024,
        }
    }
}

/// Coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShuffleState {
    /// Resolved in the cluster, listener bound.
    Starting,
    /// Listening, sending and draining concurrently.
    Exchanging,
    /// Own input fully sent, waiting for the remaining end-of-stream signals.
    Draining,
    /// Every end-of-stream signal counted, ordering owned records.
    Sorting,
    Done,
}

/// Records and end-of-stream signals received by a node.
#[derive(Debug)]
pub struct Accumulator {
    buffer: RecordBuffer,
    sentinels: usize,
    expected: usize,
}

impl Accumulator {
    /// Creates an accumulator that completes after `expected` end-of-stream signals.
    pub fn new(expected: usize) -> Self {
        Accumulator {
            buffer: RecordBuffer::new(),
            sentinels: 0,
            expected,
        }
    }

    /// Accepts a frame and returns whether every end-of-stream signal has been counted.
    /// Signals are counted, not matched to senders: each peer is trusted to send exactly one.
    /// Frames arriving after completion are dropped.
    pub fn accept(&mut self, frame: Frame) -> bool {
        if self.is_complete() {
            log::warn!("frame received after shuffle completion dropped");
            return true;
        }

        if frame.is_end_of_stream() {
            self.sentinels += 1;
            log::debug!("end-of-stream {}/{} received", self.sentinels, self.expected);
        } else {
            self.buffer.push(frame.record);
        }

        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        self.sentinels >= self.expected
    }

    pub fn sentinels(&self) -> usize {
        self.sentinels
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn into_buffer(self) -> RecordBuffer {
        self.buffer
    }
}

/// Outcome of the sending side of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendStats {
    /// Whole records read from the input.
    pub records_read: usize,
    /// Records owned by the sending node itself.
    pub records_local: usize,
    /// Records owned by other nodes.
    pub records_remote: usize,
    /// Data frames that could not be delivered.
    pub records_abandoned: usize,
    /// End-of-stream frames that could not be delivered.
    pub sentinels_abandoned: usize,
    /// Trailing input bytes that did not form a whole record.
    pub discarded_bytes: usize,
}

/// Result of a completed shuffle.
#[derive(Debug)]
pub struct ShuffleReport {
    pub node_id: NodeId,
    pub stats: SendStats,
    /// Records owned by the node, ordered by key.
    pub records: Vec<Record>,
}

/// A cluster member taking part in a shuffle.
pub struct ShuffleNode {
    cluster: Arc<Cluster>,
    node_id: NodeId,
    partitioner: Partitioner,
    listener: Listener,
    config: ShuffleConfig,
    state: ShuffleState,
}

impl ShuffleNode {
    /// Resolves `node_id` in the cluster and binds its listener.
    /// Peers may send as soon as this returns.
    pub async fn bind(cluster: Cluster, node_id: NodeId, config: ShuffleConfig) -> Result<Self, ShuffleError> {
        let address = cluster.node(node_id)?.address();
        let listener = Listener::bind(&address, config.io_timeout).await?;

        Self::with_listener(cluster, node_id, listener, config)
    }

    /// Creates a node around an already bound listener.
    pub fn with_listener(
        cluster: Cluster,
        node_id: NodeId,
        listener: Listener,
        config: ShuffleConfig,
    ) -> Result<Self, ShuffleError> {
        let partitioner = Partitioner::new(cluster.size())?;
        cluster.node(node_id)?;
        log::info!(
            "node {} starting (cluster size: {}, significant bits: {})",
            node_id,
            cluster.size(),
            partitioner.significant_bits()
        );

        return Ok(ShuffleNode {
            cluster: Arc::new(cluster),
            node_id,
            partitioner,
            listener,
            config,
            state: ShuffleState::Starting,
        });
    }

    pub fn state(&self) -> ShuffleState {
        self.state
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Runs the whole shuffle: sends `input` to its owners, collects the records this node
    /// owns and sorts them with `sorter`.
    pub async fn run<R>(self, input: R, sorter: Arc<LocalSorter>) -> Result<ShuffleReport, ShuffleError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let ShuffleNode {
            cluster,
            node_id,
            partitioner,
            listener,
            config,
            mut state,
        } = self;

        let (inbound_tx, mut inbound_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener_task = tokio::spawn(listener.serve(inbound_tx, shutdown_rx));

        transition(node_id, &mut state, ShuffleState::Exchanging);
        let sender = PeerSender::new(config.retry, config.io_timeout);
        let mut send_task = tokio::spawn(send_all(cluster.clone(), node_id, partitioner, sender, input));

        let mut accumulator = Accumulator::new(cluster.size());
        let exchange = drain(node_id, &mut state, &mut inbound_rx, &mut send_task, &mut accumulator);
        let result = match config.deadline {
            Some(deadline) => {
                let outcome = tokio::time::timeout(deadline, exchange).await;
                match outcome {
                    Ok(result) => result,
                    Err(_) if accumulator.is_complete() => Err(ShuffleError::SendsPending {
                        expected: cluster.size(),
                    }),
                    Err(_) => Err(ShuffleError::Timeout {
                        received: accumulator.sentinels(),
                        expected: cluster.size(),
                    }),
                }
            }
            None => exchange.await,
        };

        // stop accepting; in-flight handlers finish on their own
        let _ = shutdown_tx.send(true);
        drop(inbound_rx);
        if result.is_err() {
            send_task.abort();
        }
        if let Err(err) = listener_task.await {
            log::error!("listener task failed: {}", err);
        }
        let stats = result?;

        if stats.records_abandoned > 0 || stats.sentinels_abandoned > 0 {
            log::warn!(
                "node {} abandoned {} records and {} end-of-stream signals, peer outputs may be incomplete",
                node_id,
                stats.records_abandoned,
                stats.sentinels_abandoned
            );
        }

        transition(node_id, &mut state, ShuffleState::Sorting);
        let buffer = accumulator.into_buffer();
        log::info!("node {} received {} records", node_id, buffer.len());
        let records = tokio::task::spawn_blocking(move || sorter.sort(buffer))
            .await
            .map_err(ShuffleError::Task)?;

        transition(node_id, &mut state, ShuffleState::Done);

        return Ok(ShuffleReport {
            node_id,
            stats,
            records,
        });
    }
}

fn transition(node_id: NodeId, state: &mut ShuffleState, next: ShuffleState) {
    log::info!("node {}: {:?} -> {:?}", node_id, state, next);
    *state = next;
}

/// Pulls frames off the inbound channel until every end-of-stream signal is counted,
/// watching the send task so that an input failure aborts the run.
async fn drain(
    node_id: NodeId,
    state: &mut ShuffleState,
    inbound: &mut mpsc::Receiver<Frame>,
    send_task: &mut JoinHandle<Result<SendStats, ShuffleError>>,
    accumulator: &mut Accumulator,
) -> Result<SendStats, ShuffleError> {
    let mut stats = None;

    while !accumulator.is_complete() {
        tokio::select! {
            joined = &mut *send_task, if stats.is_none() => {
                stats = Some(joined.map_err(ShuffleError::Task)??);
                transition(node_id, state, ShuffleState::Draining);
            }
            frame = inbound.recv() => match frame {
                Some(frame) => {
                    accumulator.accept(frame);
                }
                None => {
                    return Err(ShuffleError::InboundClosed {
                        received: accumulator.sentinels(),
                        expected: accumulator.expected,
                    })
                }
            },
        }
    }

    // every peer is done; our own sends to other peers may still be in flight
    match stats {
        Some(stats) => Ok(stats),
        None => send_task.await.map_err(ShuffleError::Task)?,
    }
}

/// Streams every input record to its owner, then an end-of-stream frame to every node.
async fn send_all<R>(
    cluster: Arc<Cluster>,
    node_id: NodeId,
    partitioner: Partitioner,
    sender: PeerSender,
    input: R,
) -> Result<SendStats, ShuffleError>
where
    R: AsyncRead + Unpin,
{
    let mut reader = RecordReader::new(input);
    let mut stats = SendStats::default();

    while let Some(record) = reader.next_record().await.map_err(ShuffleError::Input)? {
        stats.records_read += 1;
        let destination = partitioner.destination_of(&record);
        if destination == node_id {
            stats.records_local += 1;
        } else {
            stats.records_remote += 1;
        }

        let node = cluster.node(destination)?;
        if let Err(err) = sender.send(node, &Frame::data(record)).await {
            log::error!("record for node {} abandoned: {}", destination, err);
            stats.records_abandoned += 1;
        }
    }
    stats.discarded_bytes = reader.discarded_bytes();
    log::info!(
        "node {} sent {} records ({} local, {} remote)",
        node_id,
        stats.records_read,
        stats.records_local,
        stats.records_remote
    );

    for node in cluster.nodes() {
        if let Err(err) = sender.send(node, &Frame::end_of_stream()).await {
            log::error!("end-of-stream for node {} abandoned: {}", node.id, err);
            stats.sentinels_abandoned += 1;
        }
    }

    return Ok(stats);
}
