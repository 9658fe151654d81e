use crate::dispatcher::{
    BufferMode, Connector, DispatchError, Dispatcher, DispatcherEvent, EventSender, EventStream,
    MAX_LINE_LEN,
};
use async_trait::async_trait;
use std::fs::File;
use std::io::{Error as IoError, ErrorKind as IoErrorKind, SeekFrom};
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use upstream_pool::UpstreamAddress;

/// A stream that can have the contents of a file written to it
#[async_trait]
pub trait FileSink: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Writes `size` bytes from the start of `file`.
    /// Fails with `TimedOut` when no progress is made for `idle_timeout`.
    async fn send_file(
        &mut self,
        file: File,
        size: u64,
        idle_timeout: Duration,
    ) -> std::io::Result<u64>;
}

/// Size of the userspace buffer used by [copy_file]
const COPY_CHUNK: usize = 64 * 1024;

/// Portable fallback: stream the file through a small userspace buffer
async fn copy_file<W>(
    dst: &mut W,
    file: File,
    size: u64,
    idle_timeout: Duration,
) -> std::io::Result<u64>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    let mut src = tokio::fs::File::from_std(file);
    src.seek(SeekFrom::Start(0)).await?;
    let mut src = src.take(size);
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut copied = 0u64;

    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        tokio::time::timeout(idle_timeout, dst.write_all(&buf[..n]))
            .await
            .map_err(|_| {
                IoError::new(
                    IoErrorKind::TimedOut,
                    format!("peer stopped reading after {copied} of {size} bytes"),
                )
            })??;
        copied += n as u64;
    }
    tokio::time::timeout(idle_timeout, dst.flush())
        .await
        .map_err(|_| IoError::new(IoErrorKind::TimedOut, "timed out flushing"))??;

    if copied < size {
        return Err(IoError::new(
            IoErrorKind::UnexpectedEof,
            format!("file ended after {copied} of {size} bytes"),
        ));
    }
    Ok(copied)
}

#[async_trait]
impl FileSink for TcpStream {
    async fn send_file(
        &mut self,
        file: File,
        size: u64,
        idle_timeout: Duration,
    ) -> std::io::Result<u64> {
        #[cfg(target_os = "linux")]
        {
            crate::sendfile_copy::sendfile_copy(&*self, &file, size, idle_timeout).await
        }
        #[cfg(not(target_os = "linux"))]
        {
            copy_file(self, file, size, idle_timeout).await
        }
    }
}

#[async_trait]
impl FileSink for UnixStream {
    async fn send_file(
        &mut self,
        file: File,
        size: u64,
        idle_timeout: Duration,
    ) -> std::io::Result<u64> {
        #[cfg(target_os = "linux")]
        {
            crate::sendfile_copy::sendfile_copy(&*self, &file, size, idle_timeout).await
        }
        #[cfg(not(target_os = "linux"))]
        {
            copy_file(self, file, size, idle_timeout).await
        }
    }
}

#[async_trait]
impl FileSink for tokio::io::DuplexStream {
    async fn send_file(
        &mut self,
        file: File,
        size: u64,
        idle_timeout: Duration,
    ) -> std::io::Result<u64> {
        copy_file(self, file, size, idle_timeout).await
    }
}

#[derive(Debug)]
enum Request {
    Write { data: Vec<u8>, close_after: bool },
    Sendfile { file: File, size: u64 },
}

/// A [Dispatcher] that drives a tokio stream from its own task.
/// Requests are processed strictly in order (urgent writes first),
/// and reading only happens while the dispatcher is not paused.
#[derive(Debug)]
pub struct StreamDispatcher {
    requests: UnboundedSender<Request>,
    urgent: UnboundedSender<Request>,
    paused: watch::Sender<bool>,
}

impl StreamDispatcher {
    pub fn spawn<S: FileSink>(
        stream: S,
        mode: BufferMode,
        idle_timeout: Duration,
    ) -> (Self, EventStream) {
        let (events_tx, events_rx) = unbounded_channel();
        let (requests_tx, requests_rx) = unbounded_channel();
        let (urgent_tx, urgent_rx) = unbounded_channel();
        let (paused_tx, paused_rx) = watch::channel(false);

        let worker = Worker {
            reader: BufReader::new(stream),
            mode,
            idle_timeout,
            events: events_tx,
            requests: requests_rx,
            urgent: urgent_rx,
            paused: paused_rx,
            line: Vec::new(),
        };
        tokio::spawn(worker.run());

        (
            Self {
                requests: requests_tx,
                urgent: urgent_tx,
                paused: paused_tx,
            },
            events_rx,
        )
    }
}

impl Dispatcher for StreamDispatcher {
    fn write(
        &mut self,
        data: Vec<u8>,
        urgent: bool,
        close_after: bool,
    ) -> Result<(), DispatchError> {
        let queue = if urgent { &self.urgent } else { &self.requests };
        queue
            .send(Request::Write { data, close_after })
            .map_err(|_| DispatchError::NotRunning)
    }

    fn sendfile(&mut self, file: &File, size: u64) -> Result<(), DispatchError> {
        let file = file.try_clone()?;
        self.requests
            .send(Request::Sendfile { file, size })
            .map_err(|_| DispatchError::NotRunning)
    }

    fn pause(&mut self) {
        self.paused.send_replace(true);
    }

    fn resume(&mut self) {
        self.paused.send_replace(false);
    }

    fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    fn release(self: Box<Self>) {
        // Dropping the senders lets the worker drain what was already
        // queued, after which it shuts the stream down.
    }
}

enum Step {
    Urgent(Option<Request>),
    Request(Option<Request>),
    PauseChanged(bool),
    Read(Result<Option<Vec<u8>>, DispatchError>),
}

struct Worker<S> {
    reader: BufReader<S>,
    mode: BufferMode,
    idle_timeout: Duration,
    events: EventSender,
    requests: UnboundedReceiver<Request>,
    urgent: UnboundedReceiver<Request>,
    paused: watch::Receiver<bool>,
    /// Partial line carried across reads
    line: Vec<u8>,
}

impl<S: FileSink> Worker<S> {
    async fn run(mut self) {
        let mut urgent_open = true;
        let mut released = false;

        loop {
            let paused = *self.paused.borrow_and_update();
            let step = tokio::select! {
                biased;
                req = self.urgent.recv(), if urgent_open => Step::Urgent(req),
                req = self.requests.recv() => Step::Request(req),
                changed = self.paused.changed(), if !released => Step::PauseChanged(changed.is_ok()),
                read = read_next(&mut self.reader, &mut self.line, self.mode, self.idle_timeout),
                    if !paused && !released => Step::Read(read),
            };

            let request = match step {
                Step::Urgent(None) => {
                    urgent_open = false;
                    continue;
                }
                Step::Urgent(Some(request)) | Step::Request(Some(request)) => request,
                Step::Request(None) => {
                    self.reader.get_mut().shutdown().await.ok();
                    return;
                }
                Step::PauseChanged(still_attached) => {
                    if !still_attached {
                        released = true;
                    }
                    continue;
                }
                Step::Read(Ok(Some(data))) => {
                    self.emit(DispatcherEvent::Line(data));
                    continue;
                }
                Step::Read(Ok(None)) => {
                    self.emit(DispatcherEvent::Closed);
                    return;
                }
                Step::Read(Err(err)) => {
                    self.emit(DispatcherEvent::Error(err));
                    return;
                }
            };

            if !self.process(request).await {
                return;
            }
        }
    }

    /// Returns false once the stream is finished with
    async fn process(&mut self, request: Request) -> bool {
        match request {
            Request::Write { data, close_after } => {
                let stream = self.reader.get_mut();
                let result = tokio::time::timeout(self.idle_timeout, async {
                    stream.write_all(&data).await?;
                    stream.flush().await
                })
                .await;

                match result {
                    Ok(Ok(())) => {
                        self.emit(DispatcherEvent::WriteComplete);
                    }
                    Ok(Err(err)) => {
                        self.emit(DispatcherEvent::Error(err.into()));
                        return false;
                    }
                    Err(_) => {
                        self.emit(DispatcherEvent::Error(DispatchError::Timeout(
                            self.idle_timeout,
                        )));
                        return false;
                    }
                }

                if close_after {
                    self.reader.get_mut().shutdown().await.ok();
                    self.emit(DispatcherEvent::Closed);
                    return false;
                }
                true
            }
            Request::Sendfile { file, size } => {
                let idle_timeout = self.idle_timeout;
                match self.reader.get_mut().send_file(file, size, idle_timeout).await {
                    Ok(bytes) => {
                        self.emit(DispatcherEvent::SendfileComplete { bytes });
                        true
                    }
                    Err(err) if err.kind() == IoErrorKind::TimedOut => {
                        tracing::debug!("bulk transfer stalled: {err}");
                        self.emit(DispatcherEvent::Error(DispatchError::Timeout(idle_timeout)));
                        false
                    }
                    Err(err) => {
                        self.emit(DispatcherEvent::Error(err.into()));
                        false
                    }
                }
            }
        }
    }

    fn emit(&self, event: DispatcherEvent) {
        // The session may already have detached; nobody is left to tell
        self.events.send(event).ok();
    }
}

async fn read_next<S: AsyncRead + Unpin>(
    reader: &mut BufReader<S>,
    line: &mut Vec<u8>,
    mode: BufferMode,
    idle_timeout: Duration,
) -> Result<Option<Vec<u8>>, DispatchError> {
    let read = async {
        match mode {
            BufferMode::Line => read_line(reader, line).await,
            BufferMode::Chunk(size) => {
                let mut buf = vec![0u8; size.max(1)];
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    return Ok(None);
                }
                buf.truncate(n);
                Ok(Some(buf))
            }
        }
    };

    match tokio::time::timeout(idle_timeout, read).await {
        Ok(result) => result,
        Err(_) => Err(DispatchError::Timeout(idle_timeout)),
    }
}

/// Accumulates into `line` until a newline is seen.
/// Safe to cancel: consumed bytes are always moved into `line` first.
async fn read_line<S: AsyncRead + Unpin>(
    reader: &mut BufReader<S>,
    line: &mut Vec<u8>,
) -> Result<Option<Vec<u8>>, DispatchError> {
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if line.is_empty() {
                return Ok(None);
            }
            // Unterminated final line
            return Ok(Some(std::mem::take(line)));
        }

        match available.iter().position(|&b| b == b'\n') {
            Some(idx) => {
                line.extend_from_slice(&available[..=idx]);
                reader.consume(idx + 1);
                if line.len() > MAX_LINE_LEN {
                    return Err(DispatchError::LineTooLong);
                }
                return Ok(Some(std::mem::take(line)));
            }
            None => {
                let n = available.len();
                line.extend_from_slice(available);
                reader.consume(n);
                if line.len() > MAX_LINE_LEN {
                    return Err(DispatchError::LineTooLong);
                }
            }
        }
    }
}

/// Connects to upstreams over TCP or unix domain sockets and binds
/// a line buffered [StreamDispatcher] to the new connection
#[derive(Debug, Clone)]
pub struct SocketConnector {
    pub idle_timeout: Duration,
}

#[async_trait]
impl Connector for SocketConnector {
    async fn connect(
        &self,
        address: &UpstreamAddress,
        timeout: Duration,
    ) -> std::io::Result<(Box<dyn Dispatcher>, EventStream)> {
        let timed_out = || {
            IoError::new(
                IoErrorKind::TimedOut,
                format!("timed out after {timeout:?} connecting to {address}"),
            )
        };

        match address {
            UpstreamAddress::Tcp(addr) => {
                let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
                    .await
                    .map_err(|_| timed_out())??;
                stream.set_nodelay(true)?;
                let (dispatcher, events) =
                    StreamDispatcher::spawn(stream, BufferMode::Line, self.idle_timeout);
                Ok((Box::new(dispatcher), events))
            }
            UpstreamAddress::Unix(path) => {
                let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
                    .await
                    .map_err(|_| timed_out())??;
                let (dispatcher, events) =
                    StreamDispatcher::spawn(stream, BufferMode::Line, self.idle_timeout);
                Ok((Box::new(dispatcher), events))
            }
        }
    }
}
