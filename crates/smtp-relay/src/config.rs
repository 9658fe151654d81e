use crate::capture::CaptureConfig;
use crate::scanner::RspamdConfig;
use anyhow::Context;
use relay_scoring::{ActionThresholds, SettingsRule, ThresholdPolicy};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use upstream_pool::{PoolConfig, UpstreamAddress};

/// Thresholds under this metric name apply to any metric that has no
/// entry of its own
pub const FALLBACK_METRIC: &str = "default";

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    pub listen: Vec<SocketAddr>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default = "RelayConfig::default_reject_message")]
    pub reject_message: String,
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    #[serde(
        default = "RelayConfig::default_smtp_timeout",
        with = "duration"
    )]
    pub smtp_timeout: Duration,
    #[serde(default = "RelayConfig::default_max_message_size")]
    pub max_message_size: u64,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub rspamd: Option<RspamdConfig>,
    #[serde(default)]
    pub actions: HashMap<String, ActionThresholds>,
    #[serde(default)]
    pub settings: Vec<SettingsRule>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    pub servers: Vec<String>,
    #[serde(default = "UpstreamConfig::default_error_time", with = "duration")]
    pub error_time: Duration,
    #[serde(default = "UpstreamConfig::default_dead_time", with = "duration")]
    pub dead_time: Duration,
    #[serde(default = "UpstreamConfig::default_max_errors")]
    pub max_errors: u32,
    #[serde(
        default = "UpstreamConfig::default_connect_timeout",
        with = "duration"
    )]
    pub connect_timeout: Duration,
    #[serde(default = "UpstreamConfig::default_reset_errors_on_down")]
    pub reset_errors_on_down: bool,
}

impl UpstreamConfig {
    fn default_error_time() -> Duration {
        PoolConfig::default().error_time
    }
    fn default_dead_time() -> Duration {
        PoolConfig::default().dead_time
    }
    fn default_max_errors() -> u32 {
        PoolConfig::default().max_errors
    }
    fn default_connect_timeout() -> Duration {
        PoolConfig::default().connect_timeout
    }
    fn default_reset_errors_on_down() -> bool {
        PoolConfig::default().reset_errors_on_down
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            error_time: self.error_time,
            dead_time: self.dead_time,
            max_errors: self.max_errors,
            connect_timeout: self.connect_timeout,
            reset_errors_on_down: self.reset_errors_on_down,
        }
    }

    pub fn addresses(&self) -> anyhow::Result<Vec<UpstreamAddress>> {
        self.servers
            .iter()
            .map(|s| s.parse::<UpstreamAddress>().map_err(anyhow::Error::from))
            .collect()
    }
}

impl RelayConfig {
    fn default_reject_message() -> String {
        "554 5.7.1 Message rejected as spam".to_string()
    }
    fn default_smtp_timeout() -> Duration {
        Duration::from_secs(60)
    }
    fn default_max_message_size() -> u64 {
        50 * 1024 * 1024
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self =
            toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("validating {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.listen.is_empty() {
            anyhow::bail!("No listeners defined! set `listen` to at least one address");
        }
        if self.upstream.servers.is_empty() {
            anyhow::bail!("No upstreams defined! set `upstream.servers`");
        }
        self.upstream.addresses()?;
        if self.max_message_size == 0 {
            anyhow::bail!("max_message_size must be greater than zero");
        }
        if self.reject_message.contains(['\r', '\n']) {
            anyhow::bail!("reject_message must be a single line");
        }
        Ok(())
    }

    pub fn hostname(&self) -> String {
        match &self.hostname {
            Some(name) => name.clone(),
            None => gethostname::gethostname().to_string_lossy().to_string(),
        }
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn policy(&self) -> ThresholdPolicy {
        let fallback = self
            .actions
            .get(FALLBACK_METRIC)
            .cloned()
            .unwrap_or_default();
        ThresholdPolicy::new(self.actions.clone(), fallback, self.settings.clone())
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            hostname: self.hostname(),
            temp_dir: self.temp_dir(),
            max_message_size: self.max_message_size,
            timeout: self.smtp_timeout,
        }
    }
}

/// Durations are either humantime strings such as `"5m"`, or numbers
/// of seconds
struct DurationVisitor;

impl<'de> serde::de::Visitor<'de> for DurationVisitor {
    type Value = Duration;

    fn expecting(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str("a duration")
    }

    fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Duration, E> {
        Duration::try_from_secs_f64(v).map_err(|err| E::custom(format!("invalid duration: {err}")))
    }

    fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Duration, E> {
        Ok(Duration::from_secs(v))
    }

    fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Duration, E> {
        match u64::try_from(v) {
            Ok(secs) => Ok(Duration::from_secs(secs)),
            Err(err) => Err(E::custom(format!(
                "duration must either be a string or a \
                 positive integer specifying the number of seconds. \
                 (error: {err:#})"
            ))),
        }
    }

    fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Duration, E> {
        humantime::parse_duration(v)
            .map_err(|_| E::invalid_value(serde::de::Unexpected::Str(v), &self))
    }
}

pub mod duration {
    use serde::Deserializer;
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        d.deserialize_any(super::DurationVisitor)
    }
}

pub mod opt_duration {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    struct Wrap(#[serde(with = "super::duration")] Duration);

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<Wrap>::deserialize(d)?.map(|Wrap(d)| d))
    }
}
