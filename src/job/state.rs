//! Fetch job state machine.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FetchErrorKind;

/// Identifier of one fetch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of a fetch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Built and waiting for `invoke`.
    Configured,
    /// A fetch is running.
    Fetching,
    /// The last fetch returned its messages.
    Fetched,
    /// The last fetch failed or was cancelled.
    Failed,
}

impl JobState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, target),
            (Configured, Fetching) |
            (Fetching, Fetched) | (Fetching, Failed) |
            // A finished job may be invoked again
            (Fetched, Fetching) | (Failed, Fetching)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Fetched | Self::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Configured => "configured",
            Self::Fetching => "fetching",
            Self::Fetched => "fetched",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: JobState,
    pub to: JobState,
    pub timestamp: DateTime<Utc>,
    /// Set when entering `Failed`.
    pub error: Option<FetchErrorKind>,
}

/// Lifecycle record of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub state: JobState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Messages returned by the last successful fetch.
    pub fetched: usize,
    pub transitions: Vec<StateTransition>,
}

impl JobStatus {
    pub fn new() -> Self {
        Self {
            state: JobState::Configured,
            started_at: None,
            finished_at: None,
            fetched: 0,
            transitions: Vec::new(),
        }
    }

    pub(crate) fn transition_to(
        &mut self,
        new_state: JobState,
        error: Option<FetchErrorKind>,
    ) -> Result<(), String> {
        if !self.state.can_transition_to(new_state) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.state, new_state
            ));
        }

        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Utc::now(),
            error,
        });

        const MAX_TRANSITIONS: usize = 64;
        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        self.state = new_state;

        match new_state {
            JobState::Fetching => {
                self.started_at = Some(Utc::now());
                self.finished_at = None;
            }
            JobState::Fetched | JobState::Failed => {
                self.finished_at = Some(Utc::now());
            }
            JobState::Configured => {}
        }

        Ok(())
    }

    /// Duration of the current or last fetch.
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|start| {
            let end = self.finished_at.unwrap_or_else(Utc::now);
            end.signed_duration_since(start).to_std().unwrap_or_default()
        })
    }

    /// Kind of the error that ended the last fetch, if it failed.
    pub fn last_error(&self) -> Option<FetchErrorKind> {
        if self.state != JobState::Failed {
            return None;
        }
        self.transitions.last().and_then(|t| t.error)
    }
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::new()
    }
}
