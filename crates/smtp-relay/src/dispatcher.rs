//! The non-blocking I/O contract that a session drives.
//!
//! A dispatcher is bound to one socket. Requests (`write`, `sendfile`)
//! are only enqueued by the calls on the [Dispatcher] trait; their
//! completion, along with any data read from the socket, is reported
//! asynchronously through the [EventStream] that was created alongside
//! the dispatcher.
use async_trait::async_trait;
use std::fs::File;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use upstream_pool::UpstreamAddress;

/// Lines longer than this are treated as a protocol error
pub const MAX_LINE_LEN: usize = 4096;

#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),
    #[error("Timed out after {0:?} waiting for the peer")]
    Timeout(Duration),
    #[error("Line is longer than {MAX_LINE_LEN} bytes")]
    LineTooLong,
    #[error("Dispatcher is no longer running")]
    NotRunning,
}

impl From<std::io::Error> for DispatchError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// How data read from the socket is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    /// Complete lines, including the line terminator
    Line,
    /// Whatever is available, up to the specified number of bytes
    Chunk(usize),
}

#[derive(Debug, Clone)]
pub enum DispatcherEvent {
    Line(Vec<u8>),
    WriteComplete,
    SendfileComplete { bytes: u64 },
    /// Reported exactly once per failure; the dispatcher stops afterwards
    Error(DispatchError),
    /// The peer closed the connection, or it was closed after a
    /// `close_after` write drained
    Closed,
}

pub type EventStream = UnboundedReceiver<DispatcherEvent>;
pub type EventSender = UnboundedSender<DispatcherEvent>;

pub trait Dispatcher: Send {
    /// Queues `data` for writing. `urgent` requests are placed ahead
    /// of anything not yet started. When `close_after` is set, the
    /// connection is shut down once the data has drained.
    /// The result reflects only the enqueue step.
    fn write(&mut self, data: Vec<u8>, urgent: bool, close_after: bool)
        -> Result<(), DispatchError>;

    /// Queues a transfer of `size` bytes from the start of `file`
    /// directly to the peer.
    fn sendfile(&mut self, file: &File, size: u64) -> Result<(), DispatchError>;

    /// Stops reading from the socket without closing it
    fn pause(&mut self);

    /// Re-arms reading from the socket
    fn resume(&mut self);

    fn is_paused(&self) -> bool;

    /// Detaches from the socket. Data that was already queued is still
    /// flushed before the socket is closed.
    fn release(self: Box<Self>);
}

/// Opens connections to upstreams
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        address: &UpstreamAddress,
        timeout: Duration,
    ) -> std::io::Result<(Box<dyn Dispatcher>, EventStream)>;
}
