use crate::{Action, ScoredMessage};
use serde::Deserialize;
use std::collections::HashMap;

/// Auxiliary smoothing figures that some policies compute alongside
/// the raw score. They are recorded in the audit log line.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Smoothing {
    pub smoothed: f64,
    pub raw: f64,
}

/// Maps metric scores to actions.
pub trait ActionPolicy: Send + Sync {
    /// Consults per-user/per-recipient settings.
    /// Returns None when no settings apply to this message and metric.
    fn check_metric_action_settings(
        &self,
        message: &dyn ScoredMessage,
        metric: &str,
        score: f64,
    ) -> Option<Action>;

    /// The policy default action for `score` on `metric`
    fn check_metric_action(&self, score: f64, smoothing: f64, metric: &str) -> Action;

    fn smoothing(&self, _metric: &str, _score: f64) -> Option<Smoothing> {
        None
    }
}

/// The score at which each action begins to apply.
/// An unset threshold means that action is never chosen.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ActionThresholds {
    #[serde(default)]
    pub reject: Option<f64>,
    #[serde(default)]
    pub soft_reject: Option<f64>,
    #[serde(default)]
    pub rewrite_subject: Option<f64>,
    #[serde(default)]
    pub add_header: Option<f64>,
    #[serde(default)]
    pub greylist: Option<f64>,
}

impl ActionThresholds {
    /// Returns the most severe action whose threshold `score` reaches
    pub fn action_for(&self, score: f64) -> Action {
        let ordered = [
            (Action::Reject, self.reject),
            (Action::SoftReject, self.soft_reject),
            (Action::RewriteSubject, self.rewrite_subject),
            (Action::AddHeader, self.add_header),
            (Action::Greylist, self.greylist),
        ];
        ordered
            .into_iter()
            .find_map(|(action, threshold)| match threshold {
                Some(limit) if score >= limit => Some(action),
                _ => None,
            })
            .unwrap_or(Action::NoAction)
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Per-user or per-recipient overrides.
/// A rule applies when the authenticated user is listed in `users`,
/// or when any envelope recipient matches an entry in `recipients`.
/// Recipient entries starting with `@` match a whole domain.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct SettingsRule {
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub recipients: Vec<String>,
    /// Restricts the rule to one metric; applies to all when unset
    #[serde(default)]
    pub metric: Option<String>,
    /// Never act on messages matching this rule
    #[serde(default)]
    pub want_spam: bool,
    #[serde(default)]
    pub actions: ActionThresholds,
}

impl SettingsRule {
    fn matches(&self, message: &dyn ScoredMessage, metric: &str) -> bool {
        if let Some(only) = &self.metric {
            if only != metric {
                return false;
            }
        }

        if let Some(user) = message.user() {
            if self.users.iter().any(|u| u.eq_ignore_ascii_case(user)) {
                return true;
            }
        }

        message
            .recipients()
            .iter()
            .any(|rcpt| self.recipients.iter().any(|pat| recipient_matches(pat, rcpt)))
    }

    fn action_for(&self, score: f64) -> Option<Action> {
        if self.want_spam {
            return Some(Action::NoAction);
        }
        if self.actions.is_empty() {
            return None;
        }
        Some(self.actions.action_for(score))
    }
}

fn recipient_matches(pattern: &str, recipient: &str) -> bool {
    let recipient = recipient.trim_start_matches('<').trim_end_matches('>');
    if pattern.starts_with('@') {
        match recipient.rfind('@') {
            Some(idx) => recipient[idx..].eq_ignore_ascii_case(pattern),
            None => false,
        }
    } else {
        recipient.eq_ignore_ascii_case(pattern)
    }
}

/// A static, configuration driven [ActionPolicy]
#[derive(Debug, Clone, Default)]
pub struct ThresholdPolicy {
    metrics: HashMap<String, ActionThresholds>,
    fallback: ActionThresholds,
    settings: Vec<SettingsRule>,
}

impl ThresholdPolicy {
    pub fn new(
        metrics: HashMap<String, ActionThresholds>,
        fallback: ActionThresholds,
        settings: Vec<SettingsRule>,
    ) -> Self {
        Self {
            metrics,
            fallback,
            settings,
        }
    }

    fn thresholds(&self, metric: &str) -> &ActionThresholds {
        self.metrics.get(metric).unwrap_or(&self.fallback)
    }
}

impl ActionPolicy for ThresholdPolicy {
    fn check_metric_action_settings(
        &self,
        message: &dyn ScoredMessage,
        metric: &str,
        score: f64,
    ) -> Option<Action> {
        self.settings
            .iter()
            .filter(|rule| rule.matches(message, metric))
            .find_map(|rule| rule.action_for(score))
    }

    fn check_metric_action(&self, score: f64, _smoothing: f64, metric: &str) -> Action {
        self.thresholds(metric).action_for(score)
    }
}
