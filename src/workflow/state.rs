/// Lifecycle state machines for runs, jobs, assignments and tasks
///
/// Every status is an exhaustive enum persisted as its upper-case name. Each
/// machine exposes a total transition function `on(event)`: every (state, event)
/// pair yields either the next state or an `InvalidTransition`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {machine} transition: {event} from {from}")]
pub struct InvalidTransition {
    pub machine: &'static str,
    pub from: String,
    pub event: String,
}

impl InvalidTransition {
    fn new(machine: &'static str, from: impl fmt::Debug, event: impl fmt::Debug) -> Self {
        Self {
            machine,
            from: format!("{:?}", from),
            event: format!("{:?}", event),
        }
    }
}

/// Error for status strings read back from the store that match no variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value '{value}'")]
pub struct UnknownStatus {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownStatus;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownStatus { kind: $kind, value: other.to_string() }),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Idle,
    Running,
    Completed,
    Aborted,
}

string_enum!(RunStatus, "run status", {
    Idle => "IDLE",
    Running => "RUNNING",
    Completed => "COMPLETED",
    Aborted => "ABORTED",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    Start,
    Finish,
    Abort,
}

impl RunStatus {
    pub fn on(self, event: RunEvent) -> Result<RunStatus, InvalidTransition> {
        use RunEvent::*;
        use RunStatus::*;
        match (self, event) {
            (Idle, Start) => Ok(Running),
            (Running, Finish) => Ok(Completed),
            (Idle | Running, Abort) => Ok(Aborted),
            (state, event) => Err(InvalidTransition::new("run", state, event)),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunType {
    Human,
    Simulated,
    PipelinedSimulated,
}

string_enum!(RunType, "run type", {
    Human => "HUMAN",
    Simulated => "SIMULATED",
    PipelinedSimulated => "PIPELINED_SIMULATED",
});

impl RunType {
    /// Pipelined runs stream partial results downstream before a human job closes.
    pub fn is_pipelined(self) -> bool {
        matches!(self, RunType::PipelinedSimulated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Idle,
    Running,
    Completed,
    Aborted,
}

string_enum!(JobStatus, "job status", {
    Idle => "IDLE",
    Running => "RUNNING",
    Completed => "COMPLETED",
    Aborted => "ABORTED",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    Start,
    Complete,
    Abort,
}

impl JobStatus {
    pub fn on(self, event: JobEvent) -> Result<JobStatus, InvalidTransition> {
        use JobEvent::*;
        use JobStatus::*;
        match (self, event) {
            (Idle, Start) => Ok(Running),
            (Running, Complete) => Ok(Completed),
            (Idle | Running, Abort) => Ok(Aborted),
            (state, event) => Err(InvalidTransition::new("job", state, event)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    Automatic,
    Human,
}

string_enum!(JobKind, "job kind", {
    Automatic => "AUTOMATIC",
    Human => "HUMAN",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignmentStatus {
    PendingAnnotation,
    Completed,
    Abandoned,
}

string_enum!(AssignmentStatus, "assignment status", {
    PendingAnnotation => "PENDING_ANNOTATION",
    Completed => "COMPLETED",
    Abandoned => "ABANDONED",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentEvent {
    /// Worker submitted a vote.
    Submit,
    /// Worker voluntarily gave the task back.
    Skip,
    /// The abandonment monitor reclaimed it.
    Timeout,
}

impl AssignmentStatus {
    pub fn on(self, event: AssignmentEvent) -> Result<AssignmentStatus, InvalidTransition> {
        use AssignmentEvent::*;
        use AssignmentStatus::*;
        match (self, event) {
            (PendingAnnotation, Submit) => Ok(Completed),
            (PendingAnnotation, Skip | Timeout) => Ok(Abandoned),
            (state, event) => Err(InvalidTransition::new("assignment", state, event)),
        }
    }
}

/// Whether a task can currently be handed out. Stored as the `done` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    /// Enough live assignments are out to possibly reach consensus.
    Saturate,
    /// A final label was committed.
    Finalize,
    /// An assignment was abandoned, or all holders voted without consensus.
    Reopen,
}

impl TaskState {
    pub fn from_done(done: bool) -> Self {
        if done {
            TaskState::Closed
        } else {
            TaskState::Open
        }
    }

    pub fn is_done(self) -> bool {
        matches!(self, TaskState::Closed)
    }

    /// Finalization is absorbing: a labeled task never reopens, whatever the event.
    pub fn on(self, event: TaskEvent, labeled: bool) -> Result<TaskState, InvalidTransition> {
        use TaskEvent::*;
        use TaskState::*;
        match (self, event) {
            (_, Finalize) => Ok(Closed),
            (_, Reopen) if labeled => Ok(Closed),
            (_, Reopen) => Ok(Open),
            (Open, Saturate) => Ok(Closed),
            (Closed, Saturate) => Err(InvalidTransition::new("task", self, event)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerKind {
    Regular,
    Steward,
}

string_enum!(WorkerKind, "worker kind", {
    Regular => "REGULAR",
    Steward => "STEWARD",
});
