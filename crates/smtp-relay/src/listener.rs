use crate::capture::{receive_message, CaptureConfig, CapturedMessage};
use crate::config::RelayConfig;
use crate::dispatcher::BufferMode;
use crate::scanner::{scan_task, RspamdScanner, Scanner};
use crate::session::{RelayContext, Session, SessionOutcome};
use crate::stream_dispatcher::{FileSink, SocketConnector, StreamDispatcher};
use crate::task::{MappedMessage, Task};
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use upstream_pool::UpstreamPool;

/// Everything needed to serve inbound connections
pub struct Relay {
    pub ctx: Arc<RelayContext>,
    pub capture: CaptureConfig,
    pub scanner: Option<Arc<dyn Scanner>>,
    pub smtp_timeout: Duration,
}

impl Relay {
    pub fn from_config(config: &RelayConfig) -> anyhow::Result<Self> {
        let pool = UpstreamPool::new(
            config.upstream.addresses()?,
            config.upstream.pool_config(),
        );
        let scanner = config
            .rspamd
            .as_ref()
            .map(|rspamd| Arc::new(RspamdScanner::new(rspamd)) as Arc<dyn Scanner>);
        if scanner.is_none() {
            tracing::warn!("no scanner configured, messages will be relayed unscanned");
        }

        Ok(Self {
            ctx: Arc::new(RelayContext {
                pool: Arc::new(pool),
                policy: Arc::new(config.policy()),
                connector: Arc::new(SocketConnector {
                    idle_timeout: config.smtp_timeout,
                }),
                hostname: config.hostname(),
                reject_message: config.reject_message.clone(),
            }),
            capture: config.capture_config(),
            scanner,
            smtp_timeout: config.smtp_timeout,
        })
    }

    /// Binds `endpoint` and serves it from a background task.
    /// Returns the bound address.
    pub async fn start_listener(self: &Arc<Self>, endpoint: SocketAddr) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(endpoint)
            .await
            .with_context(|| format!("failed to bind to {endpoint}"))?;

        let addr = listener.local_addr()?;
        tracing::info!("smtp listener on {addr:?}");

        let relay = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let (socket, peer_address) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::error!("accepting connection on {addr}: {err:#}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                if let Err(err) = socket.set_nodelay(true) {
                    tracing::debug!("{peer_address}: set_nodelay: {err:#}");
                }

                let relay = Arc::clone(&relay);
                tokio::spawn(async move {
                    let peer = peer_address.to_string();
                    match relay.handle_connection(socket, peer.clone()).await {
                        Ok(Some(outcome)) => tracing::debug!("{peer}: {outcome:?}"),
                        Ok(None) => tracing::debug!("{peer}: closed without a message"),
                        Err(err) => tracing::error!("{peer}: {err:#}"),
                    }
                });
            }
        });

        Ok(addr)
    }

    /// Captures a message from `stream`, scans it and runs the relay
    /// session for it
    pub async fn handle_connection<S: FileSink>(
        &self,
        stream: S,
        peer: String,
    ) -> anyhow::Result<Option<SessionOutcome>> {
        let (stream, captured) = receive_message(stream, &self.capture)
            .await
            .context("receiving message")?;
        let Some(CapturedMessage { envelope, staging }) = captured else {
            return Ok(None);
        };

        let message = MappedMessage::map(&staging.file)?;
        let mut task = Task::new(envelope.sender, envelope.recipients, message);
        tracing::debug!(
            "{peer}: captured {} bytes as qid <{}>",
            staging.size,
            task.queue_id
        );
        scan_task(self.scanner.as_deref(), &mut task).await;

        let (client, client_events) =
            StreamDispatcher::spawn(stream, BufferMode::Line, self.smtp_timeout);
        let session = Session::new(
            Arc::clone(&self.ctx),
            peer,
            task,
            Some(staging),
            Box::new(client),
            client_events,
        );
        Ok(Some(session.run().await))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::session::test::fake_upstream;
    use async_trait::async_trait;
    use relay_scoring::{ActionThresholds, MetricResult, ScanResults, ThresholdPolicy};
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use upstream_pool::{PoolConfig, UpstreamAddress};

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Fixed(f64);

    #[async_trait]
    impl Scanner for Fixed {
        async fn scan(&self, _task: &Task) -> anyhow::Result<ScanResults> {
            let mut results = ScanResults::new();
            results.insert("default".to_string(), MetricResult::new("default", self.0));
            Ok(results)
        }
    }

    fn relay(dir: &std::path::Path, upstream: SocketAddr, score: Option<f64>) -> Arc<Relay> {
        let pool = UpstreamPool::new(vec![UpstreamAddress::Tcp(upstream)], PoolConfig::default());
        Arc::new(Relay {
            ctx: Arc::new(RelayContext {
                pool: Arc::new(pool),
                policy: Arc::new(ThresholdPolicy::new(
                    HashMap::new(),
                    ActionThresholds {
                        reject: Some(15.0),
                        ..Default::default()
                    },
                    vec![],
                )),
                connector: Arc::new(SocketConnector {
                    idle_timeout: TIMEOUT,
                }),
                hostname: "relay.test".to_string(),
                reject_message: "554 5.7.1 Go away".to_string(),
            }),
            capture: CaptureConfig {
                hostname: "relay.test".to_string(),
                temp_dir: dir.to_path_buf(),
                max_message_size: 1024 * 1024,
                timeout: TIMEOUT,
            },
            scanner: score.map(|s| Arc::new(Fixed(s)) as Arc<dyn Scanner>),
            smtp_timeout: TIMEOUT,
        })
    }

    const CONVERSATION: &[u8] = b"HELO client.test\r\n\
        MAIL FROM:<a@example.com>\r\n\
        RCPT TO:<b@example.net>\r\n\
        DATA\r\n\
        Subject: relayed\r\n\r\n\
        line one\r\n\
        .\r\n";

    async fn converse(addr: SocketAddr) -> String {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(CONVERSATION).await.unwrap();
        let mut replies = String::new();
        tokio::time::timeout(TIMEOUT, client.read_to_string(&mut replies))
            .await
            .unwrap()
            .unwrap();
        replies
    }

    #[tokio::test]
    async fn relays_over_tcp() {
        let dir = tempfile::tempdir().unwrap();
        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();
        let upstream = tokio::spawn(async move {
            let (socket, _) = upstream_listener.accept().await.unwrap();
            fake_upstream(socket).await.unwrap()
        });

        let relay = relay(dir.path(), upstream_addr, Some(1.0));
        let addr = relay
            .start_listener("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let replies = converse(addr).await;
        assert!(
            replies.ends_with("354 End data with <CR><LF>.<CR><LF>\r\n250 2.0.0 queued as 42\r\n"),
            "{replies}"
        );

        let payload = tokio::time::timeout(TIMEOUT, upstream)
            .await
            .unwrap()
            .unwrap();
        k9::assert_equal!(payload, b"Subject: relayed\r\n\r\nline one\r\n".to_vec());
        k9::assert_equal!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn rejects_spam_over_tcp() {
        let dir = tempfile::tempdir().unwrap();
        // Nothing listens here; a rejected message must never get that far
        let unused: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let relay = relay(dir.path(), unused, Some(30.0));
        let addr = relay
            .start_listener("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let replies = converse(addr).await;
        assert!(replies.ends_with("354 End data with <CR><LF>.<CR><LF>\r\n554 5.7.1 Go away\r\n"), "{replies}");
        k9::assert_equal!(relay.ctx.pool.snapshot()[0].1.errors, 0);
    }

    #[tokio::test]
    async fn unscanned_message_is_relayed_over_duplex() {
        let dir = tempfile::tempdir().unwrap();
        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = upstream_listener.accept().await.unwrap();
            fake_upstream(socket).await.unwrap()
        });

        let relay = relay(dir.path(), upstream_addr, None);
        let (local, mut client) = tokio::io::duplex(64 * 1024);
        client.write_all(CONVERSATION).await.unwrap();

        let outcome = tokio::time::timeout(
            TIMEOUT,
            relay.handle_connection(local, "duplex".to_string()),
        )
        .await
        .unwrap()
        .unwrap();
        k9::assert_equal!(outcome, Some(SessionOutcome::Relayed));
    }
}
