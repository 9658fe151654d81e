//! Turns the per-metric results produced by a content scanner into a
//! single verdict for a message, and renders the audit log line that
//! records how that verdict was reached.
use indexmap::IndexMap;
use std::collections::BTreeSet;
use std::time::Duration;

mod action;
mod aggregate;
mod log_buffer;
mod policy;

pub use action::Action;
pub use aggregate::{aggregate, Verdict, LOG_BUFFER_SIZE};
pub use log_buffer::LogBuffer;
pub use policy::{ActionPolicy, ActionThresholds, SettingsRule, Smoothing, ThresholdPolicy};

/// The score and triggered symbols produced by one named metric
#[derive(Debug, Clone, PartialEq)]
pub struct MetricResult {
    pub metric: String,
    pub score: f64,
    pub symbols: BTreeSet<String>,
}

impl MetricResult {
    pub fn new<S: Into<String>>(metric: S, score: f64) -> Self {
        Self {
            metric: metric.into(),
            score,
            symbols: BTreeSet::new(),
        }
    }

    pub fn with_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.symbols.extend(symbols.into_iter().map(Into::into));
        self
    }
}

/// Metric name -> result. Insertion order is preserved so that
/// iteration is deterministic, but callers must not attach meaning to it.
pub type ScanResults = IndexMap<String, MetricResult>;

/// The view of a scanned message that the aggregator and the
/// action policy need.
pub trait ScoredMessage {
    fn message_id(&self) -> &str;
    fn queue_id(&self) -> &str;
    fn user(&self) -> Option<&str>;
    fn recipients(&self) -> &[String];
    fn results(&self) -> &ScanResults;
    /// True when scanning was skipped for this message
    fn is_skipped(&self) -> bool;
    fn message_len(&self) -> usize;
    /// Time spent processing the message so far
    fn elapsed(&self) -> Duration;
}
