// src/issue.rs
//! Typed issue records passed from the Health Monitor to the Auto-Healer and the
//! Escalation Engine. Nothing downstream parses log lines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Something the Health Monitor watches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Target {
    /// A cache key (already alias-resolved source id).
    CacheKey(String),
    /// A dependent service probed for liveness.
    Dependent(String),
    /// An upstream provider's throttle status.
    Provider(String),
    /// A resource threshold inside this process.
    Resource(String),
}

impl Target {
    pub fn id(&self) -> &str {
        match self {
            Target::CacheKey(s) | Target::Dependent(s) | Target::Provider(s) | Target::Resource(s) => s,
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            Target::CacheKey(_) => "cache",
            Target::Dependent(_) => "dependent",
            Target::Provider(_) => "provider",
            Target::Resource(_) => "resource",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.prefix(), self.id())
    }
}

/// Issue categories the healer knows how to match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueKind {
    StaleCache,
    DependentUnresponsive,
    RateLimited,
    ResourcePressure,
    /// Anything the monitor could not classify. Always escalated.
    Unknown,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::StaleCache => "stale-cache",
            IssueKind::DependentUnresponsive => "dependent-unresponsive",
            IssueKind::RateLimited => "rate-limited",
            IssueKind::ResourcePressure => "resource-pressure",
            IssueKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert pattern = issue kind on a given target. Counters and incidents are keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AlertPattern {
    pub kind: IssueKind,
    pub target: Target,
}

impl fmt::Display for AlertPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.kind, self.target)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub target: Target,
    pub detail: String,
    pub detected_at: DateTime<Utc>,
}

impl Issue {
    pub fn new(kind: IssueKind, target: Target, detail: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            target,
            detail: detail.into(),
            detected_at: at,
        }
    }

    pub fn pattern(&self) -> AlertPattern {
        AlertPattern {
            kind: self.kind,
            target: self.target.clone(),
        }
    }
}
