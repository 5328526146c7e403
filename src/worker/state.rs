//! Worker session state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// State of a worker session as observed by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Worker started, no heartbeat seen yet.
    Spawned,
    /// At least one message received from the worker.
    Running,
    Completed,
    Failed,
    TimedOut,
    /// Worker is gone and its slot released.
    Terminated,
}

impl SessionState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: SessionState) -> bool {
        use SessionState::*;

        matches!(
            (self, target),
            // From Spawned (a worker can die before its first heartbeat)
            (Spawned, Running) | (Spawned, Failed) | (Spawned, TimedOut) |
            // From Running
            (Running, Completed) | (Running, Failed) | (Running, TimedOut) |
            // Outcomes always end in Terminated
            (Completed, Terminated) | (Failed, Terminated) | (TimedOut, Terminated)
        )
    }

    /// Completed, Failed or TimedOut: the attempt is decided.
    pub fn is_outcome(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spawned => "spawned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spawned" => Ok(Self::Spawned),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            "terminated" => Ok(Self::Terminated),
            other => Err(format!("unknown session state: {other}")),
        }
    }
}

/// A state transition event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: SessionState,
    pub to: SessionState,
    pub timestamp: DateTime<Utc>,
    /// Why the supervisor moved the session, if it said.
    pub reason: Option<String>,
}

/// One spawned worker's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSession {
    pub id: Uuid,
    /// Task this session runs an attempt of.
    pub task_id: Uuid,
    /// Which attempt of the task this session runs (1-based).
    pub attempt: u32,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    /// Set when the session reaches `Terminated`.
    pub ended_at: Option<DateTime<Utc>>,
    /// Highest arena usage reported by the worker, in bytes.
    pub peak_memory: u64,
    /// When the last heartbeat arrived; `None` until the first one.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Reason given for the most recent transition.
    pub reason: Option<String>,
    /// In-memory transition history; not persisted. The state machine
    /// bounds it at three entries.
    #[serde(skip)]
    pub transitions: Vec<StateTransition>,
}

impl WorkerSession {
    pub fn new(task_id: Uuid, attempt: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            attempt,
            state: SessionState::Spawned,
            started_at: Utc::now(),
            ended_at: None,
            peak_memory: 0,
            last_heartbeat: None,
            reason: None,
            transitions: Vec::new(),
        }
    }

    /// Transition to a new state.
    pub fn transition_to(
        &mut self,
        new_state: SessionState,
        reason: Option<String>,
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
            reason: reason.clone(),
        });

        self.state = new_state;
        if reason.is_some() {
            self.reason = reason;
        }
        if new_state.is_terminal() {
            self.ended_at = Some(Utc::now());
        }

        Ok(())
    }

    /// Record an observed memory figure, keeping the peak.
    pub fn observe_memory(&mut self, bytes: u64) {
        self.peak_memory = self.peak_memory.max(bytes);
    }

    /// Duration since the session started.
    pub fn elapsed(&self) -> Duration {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        let duration = end.signed_duration_since(self.started_at);
        Duration::from_millis(duration.num_milliseconds().max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_valid() {
        assert!(SessionState::Spawned.can_transition_to(SessionState::Running));
        assert!(SessionState::Spawned.can_transition_to(SessionState::TimedOut));
        assert!(SessionState::Running.can_transition_to(SessionState::Completed));
        assert!(SessionState::Running.can_transition_to(SessionState::Failed));
        assert!(SessionState::Running.can_transition_to(SessionState::TimedOut));
        assert!(SessionState::Completed.can_transition_to(SessionState::Terminated));
        assert!(SessionState::TimedOut.can_transition_to(SessionState::Terminated));
    }

    #[test]
    fn state_transitions_invalid() {
        assert!(!SessionState::Spawned.can_transition_to(SessionState::Completed));
        assert!(!SessionState::Running.can_transition_to(SessionState::Spawned));
        assert!(!SessionState::Running.can_transition_to(SessionState::Terminated));
        assert!(!SessionState::Completed.can_transition_to(SessionState::Failed));
        assert!(!SessionState::Terminated.can_transition_to(SessionState::Running));
    }

    #[test]
    fn session_lifecycle() {
        let mut session = WorkerSession::new(Uuid::new_v4(), 1);
        assert_eq!(session.state, SessionState::Spawned);

        session.transition_to(SessionState::Running, None).unwrap();
        session
            .transition_to(SessionState::Completed, Some("done".into()))
            .unwrap();
        assert!(session.ended_at.is_none());
        session.transition_to(SessionState::Terminated, None).unwrap();

        assert!(session.ended_at.is_some());
        assert_eq!(session.reason.as_deref(), Some("done"));
        assert_eq!(session.transitions.len(), 3);
    }

    #[test]
    fn invalid_transition_leaves_state() {
        let mut session = WorkerSession::new(Uuid::new_v4(), 1);
        let err = session
            .transition_to(SessionState::Terminated, None)
            .unwrap_err();
        assert!(err.contains("spawned"));
        assert_eq!(session.state, SessionState::Spawned);
    }

    #[test]
    fn peak_memory_is_monotone() {
        let mut session = WorkerSession::new(Uuid::new_v4(), 1);
        session.observe_memory(100);
        session.observe_memory(40);
        assert_eq!(session.peak_memory, 100);
    }

    #[test]
    fn session_state_serde() {
        let json = serde_json::to_string(&SessionState::TimedOut).unwrap();
        assert_eq!(json, "\"timed_out\"");
        assert_eq!("timed_out".parse::<SessionState>().unwrap(), SessionState::TimedOut);
    }
}
