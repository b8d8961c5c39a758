//! Peer transport.
//!
//! Every TCP connection carries exactly one frame: a tag byte followed by a record.
//! The receiver answers with a single [`ACK`] byte once the frame has been queued on the
//! inbound channel, so a completed [`PeerSender::send`] means the owner holds the frame.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use log;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use crate::cluster::Node;
use crate::record::{Record, RECORD_SIZE};

/// Length of a frame on the wire: one tag byte and one record.
pub const FRAME_SIZE: usize = 1 + RECORD_SIZE;
/// Acknowledgment byte written by the receiver after a frame has been queued.
pub const ACK: u8 = 0x06;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Transport error. Local to the failing connection, never aborts a node by itself.
#[derive(Debug)]
pub enum TransportError {
    /// Common I/O error.
    IO(io::Error),
    /// Every dial attempt failed.
    Unreachable {
        address: String,
        attempts: u32,
        source: io::Error,
    },
    /// Connection closed before a whole frame was received.
    ShortFrame { received: usize, expected: usize },
    /// Frame tag byte is neither data nor end-of-stream.
    InvalidTag(u8),
    /// Peer closed the connection without acknowledging the frame.
    MissingAck,
    /// Connection stalled longer than the configured I/O timeout.
    Timeout(Duration),
    /// Inbound channel has no consumer anymore.
    ChannelClosed,
}

impl Error for TransportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            TransportError::IO(err) => Some(err),
            TransportError::Unreachable { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            TransportError::IO(err) => write!(f, "I/O operation failed: {}", err),
            TransportError::Unreachable {
                address,
                attempts,
                source,
            } => write!(f, "{} unreachable after {} attempts: {}", address, attempts, source),
            TransportError::ShortFrame { received, expected } => {
                write!(f, "short frame: received {} of {} bytes", received, expected)
            }
            TransportError::InvalidTag(tag) => write!(f, "invalid frame tag {}", tag),
            TransportError::MissingAck => write!(f, "frame not acknowledged by peer"),
            TransportError::Timeout(timeout) => write!(f, "connection stalled for more than {:?}", timeout),
            TransportError::ChannelClosed => write!(f, "inbound channel closed"),
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::IO(err)
    }
}

/// Frame kind, encoded as the first byte of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTag {
    Data = 0,
    EndOfStream = 1,
}

/// The only unit exchanged over a peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: FrameTag,
    pub record: Record,
}

impl Frame {
    pub fn data(record: Record) -> Self {
        Frame {
            tag: FrameTag::Data,
            record,
        }
    }

    /// End-of-stream sentinel. Carries a zeroed record.
    pub fn end_of_stream() -> Self {
        Frame {
            tag: FrameTag::EndOfStream,
            record: Record::zeroed(),
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.tag == FrameTag::EndOfStream
    }

    pub fn encode(&self) -> [u8; FRAME_SIZE] {
        let mut bytes = [0u8; FRAME_SIZE];
        bytes[0] = self.tag as u8;
        bytes[1..].copy_from_slice(self.record.as_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8; FRAME_SIZE]) -> Result<Self, TransportError> {
        let tag = match bytes[0] {
            0 => FrameTag::Data,
            1 => FrameTag::EndOfStream,
            tag => return Err(TransportError::InvalidTag(tag)),
        };
        let mut record = [0u8; RECORD_SIZE];
        record.copy_from_slice(&bytes[1..]);

        return Ok(Frame {
            tag,
            record: Record::from(record),
        });
    }
}

/// Reads exactly one frame, looping over partial reads.
/// A stream ending early yields [`TransportError::ShortFrame`], never a truncated frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, TransportError> {
    let mut bytes = [0u8; FRAME_SIZE];
    let mut received = 0;
    while received < FRAME_SIZE {
        let n = reader.read(&mut bytes[received..]).await?;
        if n == 0 {
            return Err(TransportError::ShortFrame {
                received,
                expected: FRAME_SIZE,
            });
        }
        received += n;
    }

    Frame::decode(&bytes)
}

/// Dial retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of dial attempts, at least one is always made.
    pub attempts: u32,
    /// Pause between two consecutive attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 10,
            backoff: Duration::from_millis(50),
        }
    }
}

/// Sending side of the transport. Opens one connection per frame.
#[derive(Debug, Clone)]
pub struct PeerSender {
    retry: RetryPolicy,
    io_timeout: Duration,
}

impl PeerSender {
    pub fn new(retry: RetryPolicy, io_timeout: Duration) -> Self {
        PeerSender { retry, io_timeout }
    }

    /// Sends a frame to a node and waits for its acknowledgment.
    ///
    /// Only dialing is retried: once the frame has been written it is never sent again,
    /// so a lost acknowledgment can not produce a duplicate.
    pub async fn send(&self, node: &Node, frame: &Frame) -> Result<(), TransportError> {
        let address = node.address();
        let mut stream = self.dial(&address).await?;

        match tokio::time::timeout(self.io_timeout, exchange(&mut stream, frame)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.io_timeout)),
        }
    }

    async fn dial(&self, address: &str) -> Result<TcpStream, TransportError> {
        let attempts = self.retry.attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let error = match tokio::time::timeout(self.io_timeout, TcpStream::connect(address)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(err)) => err,
                Err(_) => io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            };
            log::debug!("dialing {} failed (attempt {}/{}): {}", address, attempt, attempts, error);
            last_error = Some(error);

            if attempt < attempts {
                tokio::time::sleep(self.retry.backoff).await;
            }
        }

        Err(TransportError::Unreachable {
            address: address.to_string(),
            attempts,
            source: last_error.unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no dial attempt made")),
        })
    }
}

async fn exchange(stream: &mut TcpStream, frame: &Frame) -> Result<(), TransportError> {
    stream.write_all(&frame.encode()).await?;
    // half-close: the receiver sees the end of the frame, the ack still flows back
    stream.shutdown().await?;

    let mut ack = [0u8; 1];
    match stream.read(&mut ack).await? {
        1 if ack[0] == ACK => Ok(()),
        _ => Err(TransportError::MissingAck),
    }
}

/// Receiving side of the transport.
pub struct Listener {
    inner: TcpListener,
    io_timeout: Duration,
}

impl Listener {
    /// Binds to `address`. The listener accepts connections as soon as this returns,
    /// which is what peers rely on instead of a startup delay.
    pub async fn bind(address: &str, io_timeout: Duration) -> Result<Self, TransportError> {
        let inner = TcpListener::bind(address).await?;
        log::info!("listening on {}", inner.local_addr()?);

        return Ok(Listener { inner, io_timeout });
    }

    pub fn from_tcp(inner: TcpListener, io_timeout: Duration) -> Self {
        Listener { inner, io_timeout }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accepts connections until `shutdown` turns `true` or its sender is dropped.
    /// Each connection is handled by its own task which forwards one frame to `inbound`.
    pub async fn serve(self, inbound: mpsc::Sender<Frame>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        log::debug!("listener stopped");
                        return;
                    }
                }
                accepted = self.inner.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let inbound = inbound.clone();
                        let io_timeout = self.io_timeout;
                        tokio::spawn(async move {
                            if let Err(err) = handle_connection(stream, inbound, io_timeout).await {
                                log::error!("connection from {} dropped: {}", peer, err);
                            }
                        });
                    }
                    Err(err) => {
                        log::error!("accepting connection failed: {}", err);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    inbound: mpsc::Sender<Frame>,
    io_timeout: Duration,
) -> Result<(), TransportError> {
    let frame = tokio::time::timeout(io_timeout, read_frame(&mut stream))
        .await
        .map_err(|_| TransportError::Timeout(io_timeout))??;

    inbound.send(frame).await.map_err(|_| TransportError::ChannelClosed)?;

    tokio::time::timeout(io_timeout, stream.write_all(&[ACK]))
        .await
        .map_err(|_| TransportError::Timeout(io_timeout))??;

    Ok(())
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use rstest::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::{mpsc, watch};

    use super::{read_frame, Frame, FrameTag, Listener, PeerSender, RetryPolicy, TransportError, ACK, FRAME_SIZE};
    use crate::cluster::Node;
    use crate::record::{Record, RECORD_SIZE};

    const IO_TIMEOUT: Duration = Duration::from_secs(5);

    fn record(seed: u8) -> Record {
        let mut bytes = [0u8; RECORD_SIZE];
        for (idx, byte) in bytes.iter_mut().enumerate() {
            *byte = seed.wrapping_mul(31).wrapping_add(idx as u8);
        }
        Record::from(bytes)
    }

    async fn start_listener() -> (Node, mpsc::Receiver<Frame>, watch::Sender<bool>) {
        let listener = Listener::bind("127.0.0.1:0", IO_TIMEOUT).await.unwrap();
        let node = Node::new(0, "127.0.0.1", listener.local_addr().unwrap().port());
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(listener.serve(inbound_tx, shutdown_rx));

        (node, inbound_rx, shutdown_tx)
    }

    #[rstest]
    #[case(FrameTag::Data, 0)]
    #[case(FrameTag::EndOfStream, 1)]
    fn test_frame_layout(#[case] tag: FrameTag, #[case] tag_byte: u8) {
        let frame = Frame { tag, record: record(3) };
        let bytes = frame.encode();

        assert_eq!(bytes.len(), FRAME_SIZE);
        assert_eq!(bytes[0], tag_byte);
        assert_eq!(&bytes[1..], &record(3).as_bytes()[..]);
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_invalid_tag() {
        let mut bytes = Frame::data(record(1)).encode();
        bytes[0] = 7;
        assert!(matches!(Frame::decode(&bytes), Err(TransportError::InvalidTag(7))));
    }

    #[tokio::test]
    async fn test_short_frame() {
        let bytes = Frame::data(record(2)).encode();

        for len in [0, 1, FRAME_SIZE / 2, FRAME_SIZE - 1] {
            let mut reader = &bytes[..len];
            match read_frame(&mut reader).await {
                Err(TransportError::ShortFrame { received, expected }) => {
                    assert_eq!(received, len);
                    assert_eq!(expected, FRAME_SIZE);
                }
                other => panic!("unexpected result {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_send_is_content_preserving() {
        let (node, mut inbound, _shutdown) = start_listener().await;
        let sender = PeerSender::new(RetryPolicy::default(), IO_TIMEOUT);

        for seed in 0..5 {
            sender.send(&node, &Frame::data(record(seed))).await.unwrap();
        }
        sender.send(&node, &Frame::end_of_stream()).await.unwrap();

        for seed in 0..5 {
            let frame = inbound.recv().await.unwrap();
            assert_eq!(frame.tag, FrameTag::Data);
            assert_eq!(frame.record.key(), record(seed).key());
            assert_eq!(frame.record.payload(), record(seed).payload());
        }
        assert!(inbound.recv().await.unwrap().is_end_of_stream());
    }

    #[tokio::test]
    async fn test_fragmented_frame_is_assembled() {
        let (node, mut inbound, _shutdown) = start_listener().await;
        let bytes = Frame::data(record(9)).encode();

        let mut stream = TcpStream::connect(node.address()).await.unwrap();
        for part in bytes.chunks(13) {
            stream.write_all(part).await.unwrap();
            stream.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        stream.shutdown().await.unwrap();

        let mut ack = [0u8; 1];
        stream.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack[0], ACK);
        assert_eq!(inbound.recv().await.unwrap(), Frame::data(record(9)));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_not_forwarded() {
        assert_bad_frame_dropped(FRAME_SIZE / 2, 0).await;
    }

    #[tokio::test]
    async fn test_invalid_tag_is_not_forwarded() {
        assert_bad_frame_dropped(FRAME_SIZE, 5).await;
    }

    async fn assert_bad_frame_dropped(len: usize, tag: u8) {
        let (node, mut inbound, _shutdown) = start_listener().await;
        let mut bytes = Frame::data(record(4)).encode();
        bytes[0] = tag;

        let mut stream = TcpStream::connect(node.address()).await.unwrap();
        stream.write_all(&bytes[..len]).await.unwrap();
        stream.shutdown().await.unwrap();

        // no ack: the connection is closed without a reply
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert!(reply.is_empty());

        let received = tokio::time::timeout(Duration::from_millis(100), inbound.recv()).await;
        assert!(received.is_err(), "bad frame forwarded: {:?}", received);
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let node = Node::new(0, "127.0.0.1", listener.local_addr().unwrap().port());
        drop(listener);

        let retry = RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(5),
        };
        let sender = PeerSender::new(retry, IO_TIMEOUT);

        match sender.send(&node, &Frame::data(record(0))).await {
            Err(TransportError::Unreachable { attempts, address, .. }) => {
                assert_eq!(attempts, 3);
                assert_eq!(address, node.address());
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_without_ack() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let node = Node::new(0, "127.0.0.1", listener.local_addr().unwrap().port());
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await.unwrap();
            received
        });

        let sender = PeerSender::new(RetryPolicy::default(), IO_TIMEOUT);
        let result = sender.send(&node, &Frame::data(record(6))).await;

        assert!(matches!(result, Err(TransportError::MissingAck)), "{:?}", result);
        assert_eq!(server.await.unwrap(), Frame::data(record(6)).encode().to_vec());
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let node = Node::new(0, "127.0.0.1", listener.local_addr().unwrap().port());
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(stream);
        });

        let io_timeout = Duration::from_millis(300);
        let sender = PeerSender::new(RetryPolicy::default(), io_timeout);
        let result = tokio::time::timeout(Duration::from_secs(3), sender.send(&node, &Frame::end_of_stream()))
            .await
            .unwrap();

        match result {
            Err(TransportError::Timeout(limit)) => assert_eq!(limit, io_timeout),
            other => panic!("unexpected result {:?}", other),
        }
        server.abort();
    }

    #[tokio::test]
    async fn test_stalled_client_is_dropped() {
        let listener = Listener::bind("127.0.0.1:0", Duration::from_millis(200)).await.unwrap();
        let address = listener.local_addr().unwrap();
        let (inbound_tx, mut inbound_rx) = mpsc::channel(1);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(listener.serve(inbound_tx, shutdown_rx));

        // connects and never writes
        let mut stream = TcpStream::connect(address).await.unwrap();
        let mut reply = Vec::new();
        tokio::time::timeout(Duration::from_secs(3), stream.read_to_end(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert!(reply.is_empty());

        let received = tokio::time::timeout(Duration::from_millis(100), inbound_rx.recv()).await;
        assert!(received.is_err(), "frame forwarded: {:?}", received);
    }

    #[tokio::test]
    async fn test_dial_retry_reaches_late_listener() {
        let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = reserved.local_addr().unwrap();
        drop(reserved);

        let node = Node::new(0, "127.0.0.1", address.port());
        let retry = RetryPolicy {
            attempts: 50,
            backoff: Duration::from_millis(20),
        };
        let sender = PeerSender::new(retry, IO_TIMEOUT);
        let send = tokio::spawn(async move { sender.send(&node, &Frame::end_of_stream()).await });

        tokio::time::sleep(Duration::from_millis(60)).await;
        let listener = Listener::from_tcp(TcpListener::bind(address).await.unwrap(), IO_TIMEOUT);
        let (inbound_tx, mut inbound_rx) = mpsc::channel(1);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(listener.serve(inbound_tx, shutdown_rx));

        send.await.unwrap().unwrap();
        assert!(inbound_rx.recv().await.unwrap().is_end_of_stream());
    }

    #[tokio::test]
    async fn test_listener_shutdown() {
        let listener = Listener::bind("127.0.0.1:0", IO_TIMEOUT).await.unwrap();
        let (inbound_tx, _inbound_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let serving = tokio::spawn(listener.serve(inbound_tx, shutdown_rx));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), serving).await.unwrap().unwrap();
    }
}
