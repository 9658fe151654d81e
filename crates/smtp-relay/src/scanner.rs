use crate::task::Task;
use anyhow::Context;
use async_trait::async_trait;
use relay_scoring::{MetricResult, ScanResults};
use rspamd_client::config::{Config, EnvelopeData};
use rspamd_client::scan_async;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// The metric that rspamd results are recorded under
pub const DEFAULT_METRIC: &str = "default";

/// A content scanner that scores captured messages
#[async_trait]
pub trait Scanner: Send + Sync {
    async fn scan(&self, task: &Task) -> anyhow::Result<ScanResults>;
}

/// Runs `scanner` (if any) over `task` and records the results.
/// Without a scanner, or when scanning fails, the task is marked as
/// skipped and will be relayed unless a settings rule says otherwise.
pub async fn scan_task(scanner: Option<&dyn Scanner>, task: &mut Task) {
    let Some(scanner) = scanner else {
        task.is_skipped = true;
        return;
    };

    match scanner.scan(task).await {
        Ok(results) => {
            task.results = results;
        }
        Err(err) => {
            tracing::error!(
                "qid: <{}>: scanning failed, message passes unscanned: {err:#}",
                task.queue_id
            );
            task.is_skipped = true;
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct RspamdConfig {
    pub base_url: url::Url,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default, with = "crate::config::opt_duration")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default = "default_true")]
    pub zstd: bool,
}

fn default_true() -> bool {
    true
}

pub struct RspamdScanner {
    config: Config,
}

impl RspamdScanner {
    pub fn new(config: &RspamdConfig) -> Self {
        Self {
            config: Config {
                base_url: config.base_url.to_string(),
                password: config.password.clone(),
                timeout: config.timeout.map(|t| t.as_secs_f64()).unwrap_or(30.0),
                retries: config.retries.unwrap_or(1),
                tls_settings: None,
                proxy_config: None,
                zstd: config.zstd,
                encryption_key: None,
            },
        }
    }
}

#[async_trait]
impl Scanner for RspamdScanner {
    async fn scan(&self, task: &Task) -> anyhow::Result<ScanResults> {
        let mut additional_headers = HashMap::new();
        additional_headers.insert("Queue-Id".to_string(), task.queue_id.clone());

        let envelope = EnvelopeData {
            from: Some(task.sender.clone()),
            rcpt: task.recipients.clone(),
            ip: None,
            user: task.user.clone(),
            helo: None,
            hostname: None,
            file_path: None,
            body_block: false,
            additional_headers,
        };

        let reply = scan_async(&self.config, task.unstuffed_message(), envelope)
            .await
            .with_context(|| format!("rspamd scan of qid <{}>", task.queue_id))?;

        tracing::debug!(
            "qid: <{}>: rspamd says {} with score {}",
            task.queue_id,
            reply.action,
            reply.score
        );

        let result = MetricResult::new(DEFAULT_METRIC, f64::from(reply.score))
            .with_symbols(reply.symbols.keys().cloned());
        let mut results = ScanResults::new();
        results.insert(DEFAULT_METRIC.to_string(), result);
        Ok(results)
    }
}
