//! The per-connection relay state machine.
//!
//! A [Session] starts with a captured and scanned [Task]. It decides
//! whether to reject the message, and otherwise opens a connection to an
//! upstream, performs a minimal SMTP transaction there, streams the
//! captured bytes across with `sendfile` and relays the upstream's final
//! reply back to the client.
//!
//! Every completion from either dispatcher is funneled through
//! [Session::handle_event]; every terminal path ends in
//! [Session::teardown].
use crate::dispatcher::{Connector, DispatchError, Dispatcher, DispatcherEvent, EventStream};
use crate::scratch::ScratchPool;
use crate::task::{Task, TempStaging};
use relay_scoring::{aggregate, ActionPolicy, Verdict};
use std::fmt::Arguments;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use upstream_pool::{PoolError, SelectedUpstream, UpstreamPool};

/// Upper bound on an accumulated multi-line upstream reply
const MAX_REPLY_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Scanning has finished but no decision has been acted upon
    Initial,
    /// An upstream connection is being established or is in use
    WaitUpstream,
    /// The final reply has been queued to the client
    Closing,
    CriticalError,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    Idle,
    Greeting,
    Helo,
    MailFrom,
    RcptTo,
    Data,
    InSendfile,
    AfterData,
    Quit,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Rejected,
    Relayed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Upstream,
}

#[derive(Error, Debug, Clone)]
pub enum SmtpError {
    #[error("{0}")]
    UpstreamUnavailable(PoolError),
    #[error("cannot make a connection to {address}: {reason}")]
    UpstreamConnect { address: String, reason: String },
    #[error("sendfile failed: {0}")]
    File(String),
    #[error("upstream {address} failed: {reason}")]
    Upstream { address: String, reason: String },
    #[error("write to {side:?} failed: {error}")]
    Write { side: Side, error: DispatchError },
}

impl SmtpError {
    /// The reply sent to the client when this error ends the session
    pub fn client_reply(&self) -> &'static str {
        match self {
            Self::UpstreamUnavailable(_) | Self::UpstreamConnect { .. } => {
                "451 4.4.1 Upstream unavailable, try again later"
            }
            Self::File(_) => "451 4.3.0 Internal file error",
            Self::Upstream { .. } => "451 4.4.2 Upstream connection failed",
            Self::Write { .. } => "421 4.4.2 Connection error",
        }
    }
}

/// Process wide state that every session shares
pub struct RelayContext {
    pub pool: Arc<UpstreamPool>,
    pub policy: Arc<dyn ActionPolicy>,
    pub connector: Arc<dyn Connector>,
    /// Announced in our HELO to the upstream
    pub hostname: String,
    pub reject_message: String,
}

pub struct Session {
    pub(crate) ctx: Arc<RelayContext>,
    pub(crate) peer: String,
    pub(crate) started: Instant,
    pub(crate) task: Option<Task>,
    pub(crate) client: Option<Box<dyn Dispatcher>>,
    pub(crate) client_events: Option<EventStream>,
    pub(crate) upstream: Option<SelectedUpstream>,
    pub(crate) upstream_dispatcher: Option<Box<dyn Dispatcher>>,
    pub(crate) upstream_events: Option<EventStream>,
    pub(crate) staging: Option<TempStaging>,
    pub(crate) state: SessionState,
    pub(crate) upstream_state: UpstreamState,
    pub(crate) error: Option<SmtpError>,
    pub(crate) error_message: Option<String>,
    pub(crate) scratch: Option<ScratchPool>,
    /// Set once an upstream connection exists that teardown must finalize
    pub(crate) upstream_finalizer: bool,
    pub(crate) quit_sent: bool,
    pub(crate) torn_down: bool,
    reply: Vec<u8>,
    next_rcpt: usize,
    verdict: Option<Verdict>,
    outcome: Option<SessionOutcome>,
}

impl Session {
    pub fn new(
        ctx: Arc<RelayContext>,
        peer: impl Into<String>,
        task: Task,
        staging: Option<TempStaging>,
        client: Box<dyn Dispatcher>,
        client_events: EventStream,
    ) -> Self {
        Self {
            ctx,
            peer: peer.into(),
            started: Instant::now(),
            task: Some(task),
            client: Some(client),
            client_events: Some(client_events),
            upstream: None,
            upstream_dispatcher: None,
            upstream_events: None,
            staging,
            state: SessionState::Initial,
            upstream_state: UpstreamState::Idle,
            error: None,
            error_message: None,
            scratch: Some(ScratchPool::new()),
            upstream_finalizer: false,
            quit_sent: false,
            torn_down: false,
            reply: vec![],
            next_rcpt: 0,
            verdict: None,
            outcome: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn upstream_state(&self) -> UpstreamState {
        self.upstream_state
    }

    pub fn error(&self) -> Option<&SmtpError> {
        self.error.as_ref()
    }

    /// The rendered client-facing text for the recorded error
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn verdict(&self) -> Option<&Verdict> {
        self.verdict.as_ref()
    }

    pub fn outcome(&self) -> Option<SessionOutcome> {
        self.outcome
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Acts on the scan results and then processes dispatcher events
    /// until the session has been torn down
    pub async fn run(mut self) -> SessionOutcome {
        self.write_smtp_reply().await;

        while !self.torn_down {
            match self.next_event().await {
                Some((side, event)) => self.handle_event(side, event),
                None => {
                    tracing::warn!("{}: no dispatcher left to wait on", self.peer);
                    self.teardown();
                }
            }
        }

        tracing::debug!(
            "{}: session finished after {:?}",
            self.peer,
            self.started.elapsed()
        );
        self.outcome.unwrap_or(SessionOutcome::Failed)
    }

    /// Computes the verdict for the task and logs the audit line.
    /// A rejected message gets the reject text; anything else is
    /// forwarded to an upstream.
    /// Returns false if the session failed and has been torn down.
    pub async fn write_smtp_reply(&mut self) -> bool {
        let Some(task) = self.task.as_ref() else {
            tracing::error!("{}: no task to reply to", self.peer);
            self.teardown();
            return false;
        };

        let verdict = aggregate(task, self.ctx.policy.as_ref());
        tracing::info!("{}", verdict.log_line);
        let action = verdict.action;
        self.verdict.replace(verdict);

        if action.is_reject() {
            let ctx = Arc::clone(&self.ctx);
            let reply = self.line(format_args!("{}", ctx.reject_message));
            self.outcome.replace(SessionOutcome::Rejected);
            self.state = SessionState::Closing;
            if let Err(err) = self.write_client(reply, true) {
                tracing::error!("{}: {err}", self.peer);
                self.error.replace(err);
                self.teardown();
                return false;
            }
            return true;
        }

        match self.create_upstream_connection().await {
            Ok(()) => true,
            Err(err) => {
                self.fail(err);
                false
            }
        }
    }

    /// Selects an upstream and connects to it. On success the session
    /// waits for the upstream greeting.
    pub async fn create_upstream_connection(&mut self) -> Result<(), SmtpError> {
        if let Some(upstream) = &self.upstream {
            return Err(SmtpError::Upstream {
                address: upstream.to_string(),
                reason: "upstream connection is already established".to_string(),
            });
        }

        let now = Instant::now();
        let selected = match self.ctx.pool.select(now) {
            Ok(selected) => selected,
            Err(err) => {
                tracing::error!("{}: {err}", self.peer);
                return Err(SmtpError::UpstreamUnavailable(err));
            }
        };

        let timeout = self.ctx.pool.config().connect_timeout;
        match self.ctx.connector.connect(selected.address(), timeout).await {
            Ok((dispatcher, events)) => {
                tracing::debug!("{}: connected to upstream {selected}", self.peer);
                self.upstream.replace(selected);
                self.upstream_dispatcher.replace(dispatcher);
                self.upstream_events.replace(events);
                self.state = SessionState::WaitUpstream;
                self.upstream_state = UpstreamState::Greeting;
                self.upstream_finalizer = true;
                Ok(())
            }
            Err(err) => {
                tracing::error!(
                    "{}: cannot make a connection to {selected}: {err:#}",
                    self.peer
                );
                if let Err(err) = self.ctx.pool.mark_failure(&selected, now) {
                    tracing::warn!("{}: {err}", self.peer);
                }
                Err(SmtpError::UpstreamConnect {
                    address: selected.to_string(),
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Hands the socket over to the upstream leg and starts streaming
    /// the captured message to it. The client is always paused before
    /// the upstream is resumed.
    /// Returns false if the transfer could not be started, in which
    /// case the session has been torn down.
    pub fn send_upstream_message(&mut self) -> bool {
        if let Some(client) = self.client.as_mut() {
            client.pause();
        }
        if let Some(upstream) = self.upstream_dispatcher.as_mut() {
            upstream.resume();
        }

        self.upstream_state = UpstreamState::InSendfile;
        self.state = SessionState::WaitUpstream;

        let result = match (self.upstream_dispatcher.as_mut(), self.staging.as_ref()) {
            (Some(upstream), Some(staging)) => upstream
                .sendfile(&staging.file, staging.size)
                .map_err(|err| err.to_string()),
            (None, _) => Err("no upstream connection".to_string()),
            (_, None) => Err("no staged message".to_string()),
        };

        match result {
            Ok(()) => true,
            Err(reason) => {
                self.fail(SmtpError::File(reason));
                false
            }
        }
    }

    /// The single state transition function for completions and
    /// errors reported by either dispatcher
    pub fn handle_event(&mut self, side: Side, event: DispatcherEvent) {
        if self.torn_down {
            return;
        }
        tracing::trace!(
            ?side,
            ?event,
            state = ?self.state,
            upstream_state = ?self.upstream_state,
            "{}",
            self.peer
        );

        match (side, event) {
            (Side::Client, DispatcherEvent::WriteComplete) => {
                if self.state == SessionState::Closing {
                    self.teardown();
                }
            }
            (Side::Client, DispatcherEvent::Line(line)) => {
                tracing::trace!(
                    "{}: ignoring client input while relaying: {:?}",
                    self.peer,
                    String::from_utf8_lossy(&line)
                );
                self.recycle(line);
            }
            (Side::Client, DispatcherEvent::SendfileComplete { .. }) => {}
            (Side::Client, DispatcherEvent::Error(error)) => {
                if self.state == SessionState::Closing {
                    tracing::debug!("{}: client error while closing: {error}", self.peer);
                    self.teardown();
                } else {
                    self.fail(SmtpError::Write {
                        side: Side::Client,
                        error,
                    });
                }
            }
            (Side::Client, DispatcherEvent::Closed) => {
                if self.state != SessionState::Closing {
                    tracing::warn!("{}: client went away before the relay finished", self.peer);
                    self.outcome.replace(SessionOutcome::Failed);
                }
                self.teardown();
            }
            (Side::Upstream, DispatcherEvent::Line(line)) => self.upstream_line(line),
            (Side::Upstream, DispatcherEvent::WriteComplete) => {}
            (Side::Upstream, DispatcherEvent::SendfileComplete { bytes }) => {
                self.upstream_sendfile_complete(bytes)
            }
            (Side::Upstream, DispatcherEvent::Error(error)) => {
                self.upstream_lost(error.to_string())
            }
            (Side::Upstream, DispatcherEvent::Closed) => {
                self.upstream_lost("connection closed".to_string())
            }
        }
    }

    async fn next_event(&mut self) -> Option<(Side, DispatcherEvent)> {
        if self.client_events.is_none() && self.upstream_events.is_none() {
            return None;
        }

        let (side, event) = tokio::select! {
            biased;
            event = recv_event(&mut self.upstream_events) => (Side::Upstream, event),
            event = recv_event(&mut self.client_events) => (Side::Client, event),
        };

        match event {
            Some(event) => Some((side, event)),
            None => {
                // The dispatcher has stopped and dropped its sender
                match side {
                    Side::Client => self.client_events = None,
                    Side::Upstream => self.upstream_events = None,
                }
                Some((side, DispatcherEvent::Closed))
            }
        }
    }

    fn upstream_line(&mut self, line: Vec<u8>) {
        let parsed = parse_reply_line(&line);
        self.reply.extend_from_slice(&line);
        self.recycle(line);

        let code = match parsed {
            Some((code, true)) => code,
            Some((_, false)) if self.reply.len() <= MAX_REPLY_SIZE => return,
            Some((_, false)) => {
                self.upstream_failed("reply is too large".to_string());
                return;
            }
            None => {
                let reply = String::from_utf8_lossy(&self.reply).trim_end().to_string();
                self.upstream_failed(format!("malformed reply: {reply:?}"));
                return;
            }
        };

        let reply = std::mem::take(&mut self.reply);
        let ctx = Arc::clone(&self.ctx);

        match (self.upstream_state, code / 100) {
            (UpstreamState::Greeting, 2) => {
                let helo = self.line(format_args!("HELO {}", ctx.hostname));
                self.send_upstream(helo, UpstreamState::Helo);
            }
            (UpstreamState::Helo, 2) => {
                let sender = self
                    .task
                    .as_ref()
                    .map(|task| task.sender.clone())
                    .unwrap_or_default();
                let mail = self.line(format_args!("MAIL FROM:<{sender}>"));
                self.send_upstream(mail, UpstreamState::MailFrom);
            }
            (UpstreamState::MailFrom | UpstreamState::RcptTo, 2) => self.send_next_rcpt(),
            (UpstreamState::Data, 3) => {
                self.send_upstream_message();
            }
            (UpstreamState::AfterData, class) => {
                if class == 2 {
                    if let Some(upstream) = &self.upstream {
                        if let Err(err) = ctx.pool.mark_success(upstream) {
                            tracing::warn!("{}: {err}", self.peer);
                        }
                    }
                    self.outcome.replace(SessionOutcome::Relayed);
                } else {
                    tracing::warn!(
                        "{}: upstream did not accept the message: {}",
                        self.peer,
                        String::from_utf8_lossy(&reply).trim_end()
                    );
                    self.outcome.replace(SessionOutcome::Failed);
                }

                self.state = SessionState::Closing;
                if let Err(err) = self.write_client(reply, true) {
                    tracing::error!("{}: {err}", self.peer);
                    self.error.replace(err);
                    self.teardown();
                    return;
                }

                let quit = self.line(format_args!("QUIT"));
                self.quit_sent = true;
                self.send_upstream(quit, UpstreamState::Quit);
            }
            (UpstreamState::Quit, _) => {
                self.upstream_state = UpstreamState::End;
            }
            (UpstreamState::End | UpstreamState::Idle, _) => {
                tracing::trace!("{}: ignoring upstream reply {code}", self.peer);
            }
            (state, _) => {
                tracing::warn!(
                    "{}: unexpected upstream reply in {state:?}: {}",
                    self.peer,
                    String::from_utf8_lossy(&reply).trim_end()
                );
                let address = self.upstream_name();
                self.error.replace(SmtpError::Upstream {
                    address,
                    reason: format!("unexpected reply {code} in {state:?}"),
                });
                self.state = SessionState::CriticalError;
                self.outcome.replace(SessionOutcome::Failed);
                // The upstream's own reply is more useful to the client
                // than a generic error
                if let Err(err) = self.write_client(reply, true) {
                    tracing::warn!("{}: {err}", self.peer);
                }
                self.teardown();
            }
        }
    }

    fn send_next_rcpt(&mut self) {
        let rcpt = self
            .task
            .as_ref()
            .and_then(|task| task.recipients.get(self.next_rcpt).cloned());
        match rcpt {
            Some(rcpt) => {
                self.next_rcpt += 1;
                let line = self.line(format_args!("RCPT TO:<{rcpt}>"));
                self.send_upstream(line, UpstreamState::RcptTo);
            }
            None => {
                let line = self.line(format_args!("DATA"));
                self.send_upstream(line, UpstreamState::Data);
            }
        }
    }

    fn upstream_sendfile_complete(&mut self, bytes: u64) {
        if self.upstream_state != UpstreamState::InSendfile {
            return;
        }
        tracing::debug!("{}: sent {bytes} bytes to upstream", self.peer);

        let data = self
            .task
            .as_ref()
            .map(|task| task.message_bytes())
            .unwrap_or_default();
        let terminator = if data.is_empty() || data.ends_with(b"\n") {
            b".\r\n".to_vec()
        } else {
            b"\r\n.\r\n".to_vec()
        };
        self.send_upstream(terminator, UpstreamState::AfterData);
    }

    fn upstream_lost(&mut self, reason: String) {
        if self.state == SessionState::Closing
            || matches!(self.upstream_state, UpstreamState::Quit | UpstreamState::End)
        {
            tracing::debug!("{}: upstream finished: {reason}", self.peer);
            self.upstream_state = UpstreamState::End;
            return;
        }
        self.upstream_failed(reason);
    }

    /// Counts the failure against the upstream and fails the session
    fn upstream_failed(&mut self, reason: String) {
        if let Some(upstream) = &self.upstream {
            if let Err(err) = self.ctx.pool.mark_failure(upstream, Instant::now()) {
                tracing::warn!("{}: {err}", self.peer);
            }
        }
        let address = self.upstream_name();
        self.fail(SmtpError::Upstream { address, reason });
    }

    fn send_upstream(&mut self, data: Vec<u8>, next: UpstreamState) {
        let result = match self.upstream_dispatcher.as_mut() {
            Some(upstream) => upstream.write(data, false, false),
            None => Err(DispatchError::NotRunning),
        };
        match result {
            Ok(()) => self.upstream_state = next,
            Err(error) => self.fail(SmtpError::Write {
                side: Side::Upstream,
                error,
            }),
        }
    }

    fn write_client(&mut self, data: Vec<u8>, close_after: bool) -> Result<(), SmtpError> {
        let result = match self.client.as_mut() {
            Some(client) => client.write(data, false, close_after),
            None => Err(DispatchError::NotRunning),
        };
        result.map_err(|error| SmtpError::Write {
            side: Side::Client,
            error,
        })
    }

    /// Records `err`, makes a best-effort attempt to tell the client,
    /// and tears the session down
    fn fail(&mut self, err: SmtpError) {
        if self.torn_down {
            return;
        }
        tracing::error!("{}: {err}", self.peer);

        let reply = err.client_reply();
        let client_usable = !matches!(
            err,
            SmtpError::Write {
                side: Side::Client,
                ..
            }
        );
        self.error_message.replace(reply.to_string());
        self.error.replace(err);
        self.state = SessionState::CriticalError;
        self.outcome.replace(SessionOutcome::Failed);

        if client_usable {
            let line = self.line(format_args!("{reply}"));
            if let Err(err) = self.write_client(line, true) {
                tracing::warn!("{}: could not report the error: {err}", self.peer);
            }
        }
        self.teardown();
    }

    fn upstream_name(&self) -> String {
        self.upstream
            .as_ref()
            .map(|upstream| upstream.to_string())
            .unwrap_or_else(|| "<none>".to_string())
    }

    /// Formats a CRLF terminated protocol line
    pub(crate) fn line(&mut self, args: Arguments) -> Vec<u8> {
        match self.scratch.as_mut() {
            Some(scratch) => scratch.line(args),
            None => {
                let mut line = std::fmt::format(args).into_bytes();
                line.extend_from_slice(b"\r\n");
                line
            }
        }
    }

    fn recycle(&mut self, buf: Vec<u8>) {
        if let Some(scratch) = self.scratch.as_mut() {
            scratch.recycle(buf);
        }
    }
}

async fn recv_event(events: &mut Option<EventStream>) -> Option<DispatcherEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

/// Returns the reply code and whether this is the final line of the
/// reply, or None if the line does not start with a reply code
fn parse_reply_line(line: &[u8]) -> Option<(u16, bool)> {
    let digits = line.get(..3)?;
    if !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let code = digits
        .iter()
        .fold(0u16, |acc, d| acc * 10 + u16::from(d - b'0'));
    let is_final = !matches!(line.get(3), Some(b'-'));
    Some((code, is_final))
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::dispatcher::{BufferMode, EventSender};
    use crate::stream_dispatcher::StreamDispatcher;
    use crate::task::MappedMessage;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use relay_scoring::{ActionThresholds, MetricResult, ThresholdPolicy};
    use std::collections::HashMap;
    use std::fs::File;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::task::JoinHandle;
    use upstream_pool::{PoolConfig, UpstreamAddress};

    pub const REJECT: &str = "554 5.7.1 Message rejected as spam";

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        Write { data: Vec<u8>, close_after: bool },
        Sendfile { size: u64 },
        Pause,
        Resume,
        Release,
    }

    /// Calls made on every mock dispatcher, in the order they happened
    #[derive(Clone, Default)]
    pub struct Recorder(Arc<Mutex<Vec<(Side, Call)>>>);

    impl Recorder {
        fn push(&self, side: Side, call: Call) {
            self.0.lock().push((side, call));
        }

        pub fn calls(&self) -> Vec<(Side, Call)> {
            self.0.lock().clone()
        }

        pub fn calls_for(&self, side: Side) -> Vec<Call> {
            self.calls()
                .into_iter()
                .filter(|(s, _)| *s == side)
                .map(|(_, call)| call)
                .collect()
        }

        pub fn written(&self, side: Side) -> String {
            let mut text = String::new();
            for call in self.calls_for(side) {
                if let Call::Write { data, .. } = call {
                    text.push_str(&String::from_utf8_lossy(&data));
                }
            }
            text
        }
    }

    pub struct MockDispatcher {
        side: Side,
        recorder: Recorder,
        events: EventSender,
        paused: bool,
        fail_write: bool,
        fail_sendfile: bool,
    }

    impl MockDispatcher {
        pub fn new(side: Side, recorder: &Recorder) -> (Self, EventStream) {
            let (tx, rx) = unbounded_channel();
            (
                Self {
                    side,
                    recorder: recorder.clone(),
                    events: tx,
                    paused: false,
                    fail_write: false,
                    fail_sendfile: false,
                },
                rx,
            )
        }
    }

    impl Dispatcher for MockDispatcher {
        fn write(
            &mut self,
            data: Vec<u8>,
            _urgent: bool,
            close_after: bool,
        ) -> Result<(), DispatchError> {
            self.recorder
                .push(self.side, Call::Write { data, close_after });
            if self.fail_write {
                return Err(DispatchError::NotRunning);
            }
            self.events.send(DispatcherEvent::WriteComplete).ok();
            Ok(())
        }

        fn sendfile(&mut self, _file: &File, size: u64) -> Result<(), DispatchError> {
            self.recorder.push(self.side, Call::Sendfile { size });
            if self.fail_sendfile {
                return Err(std::io::Error::other("sendfile refused").into());
            }
            Ok(())
        }

        fn pause(&mut self) {
            self.paused = true;
            self.recorder.push(self.side, Call::Pause);
        }

        fn resume(&mut self) {
            self.paused = false;
            self.recorder.push(self.side, Call::Resume);
        }

        fn is_paused(&self) -> bool {
            self.paused
        }

        fn release(self: Box<Self>) {
            self.recorder.push(self.side, Call::Release);
        }
    }

    #[derive(Default)]
    pub struct MockConnector {
        pub recorder: Recorder,
        pub refuse: bool,
        pub fail_sendfile: bool,
        pub connects: Mutex<usize>,
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(
            &self,
            _address: &UpstreamAddress,
            _timeout: Duration,
        ) -> std::io::Result<(Box<dyn Dispatcher>, EventStream)> {
            *self.connects.lock() += 1;
            if self.refuse {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                ));
            }
            let (mut dispatcher, events) = MockDispatcher::new(Side::Upstream, &self.recorder);
            dispatcher.fail_sendfile = self.fail_sendfile;
            Ok((Box::new(dispatcher), events))
        }
    }

    pub fn context(servers: &[&str], connector: Arc<dyn Connector>) -> Arc<RelayContext> {
        let addresses = servers
            .iter()
            .map(|s| s.parse::<UpstreamAddress>().unwrap())
            .collect();
        Arc::new(RelayContext {
            pool: Arc::new(UpstreamPool::new(addresses, PoolConfig::default())),
            policy: Arc::new(ThresholdPolicy::new(
                HashMap::new(),
                ActionThresholds {
                    reject: Some(15.0),
                    add_header: Some(6.0),
                    ..Default::default()
                },
                vec![],
            )),
            connector,
            hostname: "relay.example.com".to_string(),
            reject_message: REJECT.to_string(),
        })
    }

    /// Stages `body` in a temp file and builds a task for it
    pub fn staged_task(
        dir: &std::path::Path,
        body: &[u8],
        metrics: Vec<MetricResult>,
    ) -> (Task, TempStaging) {
        let mut staging = TempStaging::create(dir).unwrap();
        staging.append(body).unwrap();
        staging.finish().unwrap();
        let message = MappedMessage::map(&staging.file).unwrap();
        let mut task = Task::new(
            "sender@example.com".to_string(),
            vec![
                "one@example.net".to_string(),
                "two@example.net".to_string(),
            ],
            message,
        );
        for metric in metrics {
            task.results.insert(metric.metric.clone(), metric);
        }
        (task, staging)
    }

    const BODY: &[u8] = b"Message-ID: <m1@example.com>\r\nSubject: hi\r\n\r\nhello\r\n";

    struct Harness {
        _dir: tempfile::TempDir,
        recorder: Recorder,
        connector: Arc<MockConnector>,
        session: Session,
        temp_path: std::path::PathBuf,
    }

    fn harness(metrics: Vec<MetricResult>, servers: &[&str], connector: MockConnector) -> Harness {
        harness_with_body(BODY, metrics, servers, connector)
    }

    fn harness_with_body(
        body: &[u8],
        metrics: Vec<MetricResult>,
        servers: &[&str],
        connector: MockConnector,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let recorder = connector.recorder.clone();
        let connector = Arc::new(connector);
        let ctx = context(servers, connector.clone());
        let (task, staging) = staged_task(dir.path(), body, metrics);
        let temp_path = staging.path.to_path_buf();
        let (client, client_events) = MockDispatcher::new(Side::Client, &recorder);
        let session = Session::new(
            ctx,
            "127.0.0.1:40000",
            task,
            Some(staging),
            Box::new(client),
            client_events,
        );
        Harness {
            _dir: dir,
            recorder,
            connector,
            session,
            temp_path,
        }
    }

    fn upstream_says(session: &mut Session, text: &str) {
        session.handle_event(Side::Upstream, DispatcherEvent::Line(text.as_bytes().to_vec()));
    }

    fn upstream_writes(recorder: &Recorder) -> Vec<String> {
        recorder
            .calls_for(Side::Upstream)
            .into_iter()
            .filter_map(|call| match call {
                Call::Write { data, .. } => Some(String::from_utf8_lossy(&data).to_string()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn spam_is_rejected_without_contacting_an_upstream() {
        let h = harness(
            vec![
                MetricResult::new("RBL", 20.0).with_symbols(["RBL_SPAMHAUS"]),
                MetricResult::new("BAYES", 0.5).with_symbols(["BAYES_HAM"]),
            ],
            &["127.0.0.1:2525"],
            MockConnector::default(),
        );
        let recorder = h.recorder.clone();
        let connector = h.connector.clone();
        let temp_path = h.temp_path.clone();

        let outcome = tokio::time::timeout(Duration::from_secs(5), h.session.run())
            .await
            .unwrap();

        k9::assert_equal!(outcome, SessionOutcome::Rejected);
        k9::assert_equal!(*connector.connects.lock(), 0);
        k9::assert_equal!(
            recorder.calls_for(Side::Client),
            vec![
                Call::Write {
                    data: format!("{REJECT}\r\n").into_bytes(),
                    close_after: true
                },
                Call::Release
            ]
        );
        k9::assert_equal!(recorder.calls_for(Side::Upstream), vec![]);
        assert!(!temp_path.exists());
    }

    #[tokio::test]
    async fn verdict_logs_every_metric() {
        let mut h = harness(
            vec![
                MetricResult::new("RBL", 20.0),
                MetricResult::new("BAYES", 0.5),
            ],
            &["127.0.0.1:2525"],
            MockConnector::default(),
        );
        assert!(h.session.write_smtp_reply().await);
        let verdict = h.session.verdict().unwrap();
        assert!(verdict.log_line.contains("(RBL: T (reject)"), "{}", verdict.log_line);
        assert!(verdict.log_line.contains("(BAYES: F (no action)"), "{}", verdict.log_line);
        assert!(verdict.log_line.starts_with("id: <m1@example.com>, "));
        k9::assert_equal!(h.session.state(), SessionState::Closing);
    }

    #[tokio::test]
    async fn clean_message_connects_and_streams() {
        let mut h = harness(
            vec![MetricResult::new("default", 1.0)],
            &["127.0.0.1:2525"],
            MockConnector::default(),
        );

        assert!(h.session.write_smtp_reply().await);
        k9::assert_equal!(*h.connector.connects.lock(), 1);
        k9::assert_equal!(h.session.state(), SessionState::WaitUpstream);
        k9::assert_equal!(h.session.upstream_state(), UpstreamState::Greeting);
        assert!(!h.recorder.written(Side::Client).contains(REJECT));

        assert!(h.session.send_upstream_message());
        k9::assert_equal!(h.session.upstream_state(), UpstreamState::InSendfile);
        k9::assert_equal!(h.session.state(), SessionState::WaitUpstream);
        k9::assert_equal!(
            h.recorder.calls(),
            vec![
                (Side::Client, Call::Pause),
                (Side::Upstream, Call::Resume),
                (
                    Side::Upstream,
                    Call::Sendfile {
                        size: BODY.len() as u64
                    }
                ),
            ]
        );
    }

    #[tokio::test]
    async fn upstream_transaction() {
        let mut h = harness(
            vec![MetricResult::new("default", 1.0)],
            &["127.0.0.1:2525"],
            MockConnector::default(),
        );
        assert!(h.session.write_smtp_reply().await);

        upstream_says(&mut h.session, "220-upstream\r\n");
        k9::assert_equal!(upstream_writes(&h.recorder), Vec::<String>::new());
        upstream_says(&mut h.session, "220 ready\r\n");
        upstream_says(&mut h.session, "250 hello\r\n");
        upstream_says(&mut h.session, "250 sender ok\r\n");
        upstream_says(&mut h.session, "250 rcpt ok\r\n");
        upstream_says(&mut h.session, "250 rcpt ok\r\n");
        upstream_says(&mut h.session, "354 go ahead\r\n");
        k9::assert_equal!(h.session.upstream_state(), UpstreamState::InSendfile);
        h.session.handle_event(
            Side::Upstream,
            DispatcherEvent::SendfileComplete {
                bytes: BODY.len() as u64,
            },
        );
        upstream_says(&mut h.session, "250 2.0.0 queued\r\n");

        k9::assert_equal!(
            upstream_writes(&h.recorder),
            vec![
                "HELO relay.example.com\r\n".to_string(),
                "MAIL FROM:<sender@example.com>\r\n".to_string(),
                "RCPT TO:<one@example.net>\r\n".to_string(),
                "RCPT TO:<two@example.net>\r\n".to_string(),
                "DATA\r\n".to_string(),
                ".\r\n".to_string(),
                "QUIT\r\n".to_string(),
            ]
        );
        k9::assert_equal!(h.recorder.written(Side::Client), "250 2.0.0 queued\r\n".to_string());
        k9::assert_equal!(h.session.outcome(), Some(SessionOutcome::Relayed));
        k9::assert_equal!(h.session.state(), SessionState::Closing);

        h.session
            .handle_event(Side::Client, DispatcherEvent::WriteComplete);
        assert!(h.session.is_torn_down());
        k9::assert_equal!(h.session.state(), SessionState::Terminated);
        // QUIT went out during the transaction, so teardown only releases
        k9::assert_equal!(upstream_writes(&h.recorder).len(), 7);
        assert!(h
            .recorder
            .calls_for(Side::Upstream)
            .contains(&Call::Release));
    }

    /// Drives a transaction for `body` up to the end of the bulk
    /// transfer and returns what was written after it
    async fn data_terminator(body: &[u8]) -> String {
        let mut h = harness_with_body(
            body,
            vec![MetricResult::new("default", 1.0)],
            &["127.0.0.1:2525"],
            MockConnector::default(),
        );
        assert!(h.session.write_smtp_reply().await);
        for reply in ["220 ready\r\n", "250 hello\r\n", "250 ok\r\n", "250 ok\r\n", "250 ok\r\n"] {
            upstream_says(&mut h.session, reply);
        }
        upstream_says(&mut h.session, "354 go ahead\r\n");
        h.session.handle_event(
            Side::Upstream,
            DispatcherEvent::SendfileComplete {
                bytes: body.len() as u64,
            },
        );
        k9::assert_equal!(h.session.upstream_state(), UpstreamState::AfterData);
        upstream_writes(&h.recorder).pop().unwrap()
    }

    #[tokio::test]
    async fn data_terminator_never_adds_a_line() {
        k9::assert_equal!(data_terminator(b"Subject: crlf\r\n\r\nbody\r\n").await, ".\r\n".to_string());
        k9::assert_equal!(data_terminator(b"Subject: lf\n\nbody\n").await, ".\r\n".to_string());
        k9::assert_equal!(
            data_terminator(b"Subject: open\r\n\r\nno newline").await,
            "\r\n.\r\n".to_string()
        );
    }

    #[tokio::test]
    async fn unexpected_reply_is_relayed_to_the_client() {
        let mut h = harness(
            vec![MetricResult::new("default", 1.0)],
            &["127.0.0.1:2525"],
            MockConnector::default(),
        );
        assert!(h.session.write_smtp_reply().await);
        upstream_says(&mut h.session, "554 no service here\r\n");

        k9::assert_equal!(
            h.recorder.calls_for(Side::Client),
            vec![
                Call::Write {
                    data: b"554 no service here\r\n".to_vec(),
                    close_after: true
                },
                Call::Release
            ]
        );
        k9::assert_equal!(h.session.state(), SessionState::CriticalError);
        k9::assert_equal!(h.session.outcome(), Some(SessionOutcome::Failed));
        assert!(h.session.is_torn_down());
        // Teardown sent QUIT on our behalf before releasing
        k9::assert_equal!(upstream_writes(&h.recorder), vec!["QUIT\r\n".to_string()]);
    }

    #[tokio::test]
    async fn sendfile_failure_is_critical() {
        let mut h = harness(
            vec![MetricResult::new("default", 1.0)],
            &["127.0.0.1:2525"],
            MockConnector {
                fail_sendfile: true,
                ..Default::default()
            },
        );
        assert!(h.session.write_smtp_reply().await);
        assert!(!h.session.send_upstream_message());

        assert!(matches!(h.session.error(), Some(SmtpError::File(_))));
        k9::assert_equal!(h.session.state(), SessionState::CriticalError);
        k9::assert_equal!(
            h.session.error_message(),
            Some("451 4.3.0 Internal file error")
        );
        k9::assert_equal!(
            h.recorder.calls_for(Side::Client),
            vec![
                Call::Pause,
                Call::Write {
                    data: b"451 4.3.0 Internal file error\r\n".to_vec(),
                    close_after: true
                },
                Call::Release
            ]
        );
        assert!(h.session.is_torn_down());
        assert!(!h.temp_path.exists());
        k9::assert_equal!(h.session.teardown(), None);
    }

    #[tokio::test]
    async fn sendfile_failure_with_dead_client_still_tears_down_once() {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(MockConnector {
            fail_sendfile: true,
            ..Default::default()
        });
        let recorder = connector.recorder.clone();
        let ctx = context(&["127.0.0.1:2525"], connector.clone());
        let (task, staging) = staged_task(dir.path(), BODY, vec![]);
        let (mut client, client_events) = MockDispatcher::new(Side::Client, &recorder);
        client.fail_write = true;
        let mut session = Session::new(
            ctx,
            "peer",
            task,
            Some(staging),
            Box::new(client),
            client_events,
        );

        assert!(session.write_smtp_reply().await);
        assert!(!session.send_upstream_message());
        session.handle_event(Side::Client, DispatcherEvent::Closed);
        k9::assert_equal!(session.teardown(), None);

        let releases = recorder
            .calls()
            .into_iter()
            .filter(|(_, call)| *call == Call::Release)
            .count();
        k9::assert_equal!(releases, 2);
    }

    #[tokio::test]
    async fn no_upstream_available() {
        let mut h = harness(
            vec![MetricResult::new("default", 1.0)],
            &[],
            MockConnector::default(),
        );
        assert!(!h.session.write_smtp_reply().await);
        assert!(matches!(
            h.session.error(),
            Some(SmtpError::UpstreamUnavailable(PoolError::NoUpstreamAvailable))
        ));
        k9::assert_equal!(*h.connector.connects.lock(), 0);
        k9::assert_equal!(
            h.recorder.written(Side::Client),
            "451 4.4.1 Upstream unavailable, try again later\r\n".to_string()
        );
        assert!(h.session.is_torn_down());
    }

    #[tokio::test]
    async fn connect_failure_counts_against_the_upstream() {
        let mut h = harness(
            vec![MetricResult::new("default", 1.0)],
            &["127.0.0.1:2525"],
            MockConnector {
                refuse: true,
                ..Default::default()
            },
        );
        assert!(!h.session.write_smtp_reply().await);
        assert!(matches!(
            h.session.error(),
            Some(SmtpError::UpstreamConnect { .. })
        ));
        let health = h.session.ctx.pool.snapshot();
        k9::assert_equal!(health[0].1.errors, 1);
        assert!(h.session.is_torn_down());
    }

    #[tokio::test]
    async fn upstream_dropping_mid_transaction_fails_the_session() {
        let mut h = harness(
            vec![MetricResult::new("default", 1.0)],
            &["127.0.0.1:2525"],
            MockConnector::default(),
        );
        assert!(h.session.write_smtp_reply().await);
        upstream_says(&mut h.session, "220 ready\r\n");
        h.session
            .handle_event(Side::Upstream, DispatcherEvent::Closed);

        assert!(matches!(h.session.error(), Some(SmtpError::Upstream { .. })));
        k9::assert_equal!(
            h.recorder.written(Side::Client),
            "451 4.4.2 Upstream connection failed\r\n".to_string()
        );
        k9::assert_equal!(h.session.ctx.pool.snapshot()[0].1.errors, 1);
    }

    #[test]
    fn reply_lines() {
        k9::assert_equal!(parse_reply_line(b"250 ok\r\n"), Some((250, true)));
        k9::assert_equal!(parse_reply_line(b"250-more\r\n"), Some((250, false)));
        k9::assert_equal!(parse_reply_line(b"354\r\n"), Some((354, true)));
        k9::assert_equal!(parse_reply_line(b"hello\r\n"), None);
        k9::assert_equal!(parse_reply_line(b"25"), None);
    }

    /// Accepts one SMTP transaction and returns the DATA payload
    pub fn fake_upstream<S>(peer: S) -> JoinHandle<Vec<u8>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(peer);
            let mut reader = BufReader::new(read);
            write.write_all(b"220 upstream ready\r\n").await.unwrap();

            let mut payload = vec![];
            let mut in_data = false;
            loop {
                let mut line = vec![];
                if reader.read_until(b'\n', &mut line).await.unwrap() == 0 {
                    break;
                }
                if in_data {
                    if line == b".\r\n" {
                        in_data = false;
                        write.write_all(b"250 2.0.0 queued as 42\r\n").await.unwrap();
                    } else {
                        payload.extend_from_slice(&line);
                    }
                    continue;
                }
                let verb = String::from_utf8_lossy(&line).to_ascii_uppercase();
                if verb.starts_with("DATA") {
                    in_data = true;
                    write.write_all(b"354 go ahead\r\n").await.unwrap();
                } else if verb.starts_with("QUIT") {
                    write.write_all(b"221 bye\r\n").await.unwrap();
                    break;
                } else {
                    write.write_all(b"250 ok\r\n").await.unwrap();
                }
            }
            payload
        })
    }

    #[derive(Default)]
    struct DuplexConnector {
        upstreams: Mutex<Vec<JoinHandle<Vec<u8>>>>,
    }

    #[async_trait]
    impl Connector for DuplexConnector {
        async fn connect(
            &self,
            _address: &UpstreamAddress,
            _timeout: Duration,
        ) -> std::io::Result<(Box<dyn Dispatcher>, EventStream)> {
            let (local, peer) = tokio::io::duplex(64 * 1024);
            self.upstreams.lock().push(fake_upstream(peer));
            let (dispatcher, events) =
                StreamDispatcher::spawn(local, BufferMode::Line, Duration::from_secs(5));
            Ok((Box::new(dispatcher), events))
        }
    }

    #[tokio::test]
    async fn relay_over_streams() {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(DuplexConnector::default());
        let ctx = context(&["127.0.0.1:2525"], connector.clone());
        let (task, staging) = staged_task(
            dir.path(),
            BODY,
            vec![MetricResult::new("default", 0.0)],
        );
        let temp_path = staging.path.to_path_buf();

        let (local, mut client_peer) = tokio::io::duplex(64 * 1024);
        let (client, client_events) =
            StreamDispatcher::spawn(local, BufferMode::Line, Duration::from_secs(5));
        let session = Session::new(
            ctx.clone(),
            "client",
            task,
            Some(staging),
            Box::new(client),
            client_events,
        );

        let outcome = tokio::time::timeout(Duration::from_secs(5), session.run())
            .await
            .unwrap();
        k9::assert_equal!(outcome, SessionOutcome::Relayed);

        let mut reply = String::new();
        client_peer.read_to_string(&mut reply).await.unwrap();
        k9::assert_equal!(reply, "250 2.0.0 queued as 42\r\n".to_string());

        let upstream = connector.upstreams.lock().pop().unwrap();
        let payload = upstream.await.unwrap();
        k9::assert_equal!(payload, BODY.to_vec());
        assert!(!temp_path.exists());
        k9::assert_equal!(ctx.pool.snapshot()[0].1.errors, 0);
    }
}
