use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Number of a tracked issue (e.g., #42)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IssueId(u64);

impl IssueId {
    pub fn new(number: u64) -> Self {
        Self(number)
    }

    pub fn number(&self) -> u64 {
        self.0
    }
}

impl FromStr for IssueId {
    type Err = crate::error::SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .trim_start_matches('#')
            .parse::<u64>()
            .map(Self)
            .map_err(|_| crate::error::SyncError::Validation(format!("Invalid issue number: {s}")))
    }
}

impl fmt::Display for IssueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Open/closed state as reported by the issue tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    Open,
    Closed,
}

/// Snapshot of an issue as delivered by the tracker. Read-only to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: IssueId,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub state: IssueState,
    pub updated_at: DateTime<Utc>,
}

impl Issue {
    /// Creates an open issue with an empty body
    pub fn new(id: IssueId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            body: String::new(),
            state: IssueState::Open,
            updated_at: Utc::now(),
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn closed(mut self) -> Self {
        self.state = IssueState::Closed;
        self
    }

    pub fn is_open(&self) -> bool {
        self.state == IssueState::Open
    }
}

/// Lifecycle notification emitted by the issue tracker
#[derive(Debug, Clone)]
pub enum IssueEvent {
    Opened(Issue),
    Updated(Issue),
    Closed(Issue),
}

impl IssueEvent {
    pub fn issue(&self) -> &Issue {
        match self {
            Self::Opened(issue) | Self::Updated(issue) | Self::Closed(issue) => issue,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Opened(_) => "opened",
            Self::Updated(_) => "updated",
            Self::Closed(_) => "closed",
        }
    }
}
