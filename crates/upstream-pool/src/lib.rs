//! This crate tracks the set of backend mail servers that the relay
//! forwards accepted messages to.
//!
//! Selection is a plain round-robin over the configured list that skips
//! upstreams which are either inside their dead-time window or have
//! accumulated too many errors inside the error-time window.
//! It is a circuit breaker rather than a load balancer: ties among
//! eligible upstreams are resolved purely by rotation position.
//!
//! The pool is the only piece of state shared between sessions, so all
//! mutation happens behind a single mutex.
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("no upstreams suitable found")]
    NoUpstreamAvailable,
    #[error("invalid upstream address '{0}': expected ip:port, unix:/path or an absolute path")]
    InvalidAddress(String),
    #[error("upstream #{0} is not a member of this pool")]
    UnknownUpstream(usize),
}

/// Where an upstream can be reached.
/// Host names are deliberately not supported; the relay performs no
/// DNS resolution of its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UpstreamAddress {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl UpstreamAddress {
    pub fn is_unix(&self) -> bool {
        matches!(self, Self::Unix(_))
    }
}

impl FromStr for UpstreamAddress {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, PoolError> {
        let s = s.trim();
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(PoolError::InvalidAddress(s.to_string()));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if s.starts_with('/') {
            return Ok(Self::Unix(PathBuf::from(s)));
        }
        s.parse::<SocketAddr>()
            .map(Self::Tcp)
            .map_err(|_| PoolError::InvalidAddress(s.to_string()))
    }
}

impl std::fmt::Display for UpstreamAddress {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Unix(path) => write!(fmt, "unix:{}", path.display()),
            Self::Tcp(addr) => write!(fmt, "{addr}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Errors older than this no longer count against an upstream
    pub error_time: Duration,
    /// How long an upstream stays out of rotation once it is marked down
    pub dead_time: Duration,
    /// An upstream goes down once its error count exceeds this value
    /// inside of `error_time`
    pub max_errors: u32,
    /// Default timeout for establishing a connection to an upstream
    pub connect_timeout: Duration,
    /// Whether the error count restarts from zero when an upstream is
    /// marked down. When false, the count carries over and a revived
    /// upstream that fails again inside the error window goes straight
    /// back down.
    pub reset_errors_on_down: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            error_time: Duration::from_secs(10),
            dead_time: Duration::from_secs(300),
            max_errors: 10,
            connect_timeout: Duration::from_secs(10),
            reset_errors_on_down: true,
        }
    }
}

/// Health counters for a single upstream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamHealth {
    pub errors: u32,
    pub last_error: Option<Instant>,
    pub last_down: Option<Instant>,
}

impl UpstreamHealth {
    fn is_dead(&self, now: Instant, config: &PoolConfig) -> bool {
        match self.last_down {
            Some(down) => now.saturating_duration_since(down) < config.dead_time,
            None => false,
        }
    }

    fn is_over_error_limit(&self, now: Instant, config: &PoolConfig) -> bool {
        if self.errors <= config.max_errors {
            return false;
        }
        match self.last_error {
            Some(last) => now.saturating_duration_since(last) < config.error_time,
            None => false,
        }
    }

    pub fn is_eligible(&self, now: Instant, config: &PoolConfig) -> bool {
        !self.is_dead(now, config) && !self.is_over_error_limit(now, config)
    }
}

#[derive(Debug)]
struct Upstream {
    address: UpstreamAddress,
    health: UpstreamHealth,
}

#[derive(Debug)]
struct PoolState {
    upstreams: Vec<Upstream>,
    cursor: usize,
}

/// A handle to the upstream returned by [UpstreamPool::select].
/// It is used to report the outcome of the connection attempt back
/// to the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedUpstream {
    index: usize,
    address: UpstreamAddress,
}

impl SelectedUpstream {
    pub fn address(&self) -> &UpstreamAddress {
        &self.address
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl std::fmt::Display for SelectedUpstream {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.address.fmt(fmt)
    }
}

#[derive(Debug)]
pub struct UpstreamPool {
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl UpstreamPool {
    pub fn new(addresses: Vec<UpstreamAddress>, config: PoolConfig) -> Self {
        let upstreams = addresses
            .into_iter()
            .map(|address| Upstream {
                address,
                health: UpstreamHealth::default(),
            })
            .collect();
        Self {
            config,
            state: Mutex::new(PoolState {
                upstreams,
                cursor: 0,
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.state.lock().upstreams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the next eligible upstream, starting from the rotating
    /// cursor and wrapping around the list at most once.
    /// The cursor is advanced past the returned entry.
    /// Failure is reported to the caller; this method never retries.
    pub fn select(&self, now: Instant) -> Result<SelectedUpstream, PoolError> {
        let mut state = self.state.lock();
        let count = state.upstreams.len();

        for offset in 0..count {
            let index = (state.cursor + offset) % count;
            let upstream = &mut state.upstreams[index];

            if !upstream.health.is_eligible(now, &self.config) {
                continue;
            }

            if upstream.health.last_down.take().is_some() {
                tracing::info!(
                    "upstream {} revived after dead time of {:?}",
                    upstream.address,
                    self.config.dead_time
                );
                if self.config.reset_errors_on_down {
                    upstream.health.errors = 0;
                }
            }

            let selected = SelectedUpstream {
                index,
                address: upstream.address.clone(),
            };
            state.cursor = (index + 1) % count;
            return Ok(selected);
        }

        Err(PoolError::NoUpstreamAvailable)
    }

    /// Records a failed attempt to use `upstream`.
    /// Once the number of errors inside the error window exceeds
    /// `max_errors` the upstream is marked down for `dead_time`.
    pub fn mark_failure(&self, upstream: &SelectedUpstream, now: Instant) -> Result<(), PoolError> {
        let mut state = self.state.lock();
        let entry = state
            .upstreams
            .get_mut(upstream.index)
            .ok_or(PoolError::UnknownUpstream(upstream.index))?;
        let health = &mut entry.health;

        if let Some(last) = health.last_error {
            if now.saturating_duration_since(last) >= self.config.error_time {
                health.errors = 0;
            }
        }

        health.errors += 1;
        health.last_error.replace(now);

        if health.errors > self.config.max_errors {
            tracing::warn!(
                "upstream {} failed {} times within {:?}, marking down for {:?}",
                entry.address,
                health.errors,
                self.config.error_time,
                self.config.dead_time
            );
            health.last_down.replace(now);
            if self.config.reset_errors_on_down {
                health.errors = 0;
            }
        } else {
            tracing::debug!(
                "upstream {} error count is now {}",
                entry.address,
                health.errors
            );
        }

        Ok(())
    }

    /// Records a successful relay through `upstream`, clearing its
    /// error count.
    pub fn mark_success(&self, upstream: &SelectedUpstream) -> Result<(), PoolError> {
        let mut state = self.state.lock();
        let entry = state
            .upstreams
            .get_mut(upstream.index)
            .ok_or(PoolError::UnknownUpstream(upstream.index))?;
        entry.health.errors = 0;
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<(UpstreamAddress, UpstreamHealth)> {
        self.state
            .lock()
            .upstreams
            .iter()
            .map(|u| (u.address.clone(), u.health.clone()))
            .collect()
    }
}
