use crate::{Action, ActionPolicy, LogBuffer, MetricResult, ScoredMessage};
use std::fmt::Write;

/// Maximum length of the audit log line
pub const LOG_BUFFER_SIZE: usize = 1024;

/// The outcome of aggregating all of the metrics for a message
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    /// The most severe action across all metrics
    pub action: Action,
    /// The metric that produced `action`, if any metric was evaluated
    pub metric: Option<MetricResult>,
    /// The audit log line for this message
    pub log_line: String,
}

/// Evaluates every metric result of `message` against `policy`.
///
/// Settings overrides take precedence over the policy default for each
/// metric. The most severe action wins; when two metrics tie, the one
/// seen first is kept.
///
/// The returned log line has the form:
/// `id: <msgid>, qid: <qid>, user: u, (default: F (no action): [1.50/0.00/0.00] [SYM_A,SYM_B]), len: 100, time: 3.125ms,`
pub fn aggregate(message: &dyn ScoredMessage, policy: &dyn ActionPolicy) -> Verdict {
    let mut log = LogBuffer::with_capacity(LOG_BUFFER_SIZE);
    let mut action = Action::NoAction;
    let mut chosen: Option<&MetricResult> = None;

    // LogBuffer never reports an error; truncation is silent
    let _ = write!(
        log,
        "id: <{}>, qid: <{}>, ",
        message.message_id(),
        message.queue_id()
    );
    if let Some(user) = message.user() {
        let _ = write!(log, "user: {user}, ");
    }

    let elapsed_ms = message.elapsed().as_secs_f64() * 1000.0;

    for (name, result) in message.results() {
        let smoothing = policy.smoothing(name, result.score).unwrap_or_default();
        let metric_action = policy
            .check_metric_action_settings(message, name, result.score)
            .unwrap_or_else(|| {
                policy.check_metric_action(result.score, smoothing.smoothed, name)
            });

        if chosen.is_none() || metric_action < action {
            action = metric_action;
            chosen.replace(result);
        }

        if message.is_skipped() {
            let _ = write!(
                log,
                "({name}: S (default): [{:.2}/{:.2}/{:.2}] [",
                result.score, smoothing.smoothed, smoothing.raw
            );
        } else {
            let letter = if metric_action == Action::NoAction {
                'F'
            } else {
                'T'
            };
            let _ = write!(
                log,
                "({name}: {letter} ({metric_action}): [{:.2}/{:.2}/{:.2}] [",
                result.score, smoothing.smoothed, smoothing.raw
            );
        }

        for symbol in &result.symbols {
            let _ = write!(log, "{symbol},");
        }
        log.trim_trailing(',');

        let _ = write!(
            log,
            "]), len: {}, time: {elapsed_ms:.3}ms,",
            message.message_len()
        );
    }

    if chosen.is_none() {
        let _ = write!(
            log,
            "len: {}, time: {elapsed_ms:.3}ms,",
            message.message_len()
        );
    }

    Verdict {
        action,
        metric: chosen.cloned(),
        log_line: log.into_string(),
    }
}
