//! Trigger events that start a pipeline run.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, WheelhouseError};

/// The external event class that starts a pipeline run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEvent {
    PullRequest,
    Push,
    Release,
}

impl TriggerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerEvent::PullRequest => "pull_request",
            TriggerEvent::Push => "push",
            TriggerEvent::Release => "release",
        }
    }
}

impl std::fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TriggerEvent {
    type Err = WheelhouseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "pull_request" | "pr" => Ok(TriggerEvent::PullRequest),
            "push" => Ok(TriggerEvent::Push),
            "release" => Ok(TriggerEvent::Release),
            other => Err(WheelhouseError::UnknownEvent(other.to_string())),
        }
    }
}

/// An incoming event together with its metadata.
///
/// Immutable once constructed; every job of a run shares the same context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventContext {
    /// Unique id of this pipeline run.
    pub run_id: Uuid,
    pub event: TriggerEvent,
    /// Target branch, if the event source supplied one.
    pub branch: Option<String>,
    /// Release tag; required for `release` events.
    pub tag: Option<String>,
}

impl EventContext {
    /// Build a context, rejecting a release without a tag.
    pub fn new(event: TriggerEvent, branch: Option<String>, tag: Option<String>) -> Result<Self> {
        if event == TriggerEvent::Release && tag.as_deref().map_or(true, str::is_empty) {
            return Err(WheelhouseError::InvalidConfig(
                "release events require a release tag".to_string(),
            ));
        }
        Ok(Self {
            run_id: Uuid::new_v4(),
            event,
            branch,
            tag,
        })
    }

    pub fn pull_request(branch: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            event: TriggerEvent::PullRequest,
            branch: Some(branch.into()),
            tag: None,
        }
    }

    pub fn push(branch: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            event: TriggerEvent::Push,
            branch: Some(branch.into()),
            tag: None,
        }
    }

    pub fn release(tag: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            event: TriggerEvent::Release,
            branch: None,
            tag: Some(tag.into()),
        }
    }

    /// Path-safe reference for this event: the tag, the branch, or the run id.
    pub fn reference(&self) -> String {
        let raw = self
            .tag
            .as_deref()
            .or(self.branch.as_deref())
            .map(str::to_string)
            .unwrap_or_else(|| self.run_id.to_string());
        raw.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect()
    }
}
