use serde::{Deserialize, Serialize};

/// The verdict for a message, ordered from most to least severe so
/// that `min` picks the harshest outcome.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    #[strum(serialize = "reject")]
    Reject,
    #[strum(serialize = "soft reject")]
    SoftReject,
    #[strum(serialize = "rewrite subject")]
    RewriteSubject,
    #[strum(serialize = "add header")]
    AddHeader,
    #[strum(serialize = "greylist")]
    Greylist,
    #[strum(serialize = "no action")]
    NoAction,
}

impl Action {
    /// True when this action is at or beyond the reject threshold
    pub fn is_reject(self) -> bool {
        self <= Action::Reject
    }

    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

impl Default for Action {
    fn default() -> Self {
        Self::NoAction
    }
}
