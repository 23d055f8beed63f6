use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a managed instance.
///
/// The only legal edges are:
///
/// ```text
/// Running --idle--> Checkpointing --ok--> Suspended --request--> Restoring --ok--> Running
///                        |                                           |
///                        +--fail/timeout--> Running                  +--fatal--> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Running,
    Checkpointing,
    Suspended,
    Restoring,
    Failed,
}

impl InstanceState {
    pub const INITIAL: InstanceState = InstanceState::Running;

    pub const fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Running, Checkpointing)
                | (Checkpointing, Suspended)
                | (Checkpointing, Running)
                | (Suspended, Restoring)
                | (Restoring, Running)
                | (Restoring, Failed)
        )
    }

    /// A checkpoint or restore is currently running against the backend.
    pub const fn is_in_flight(self) -> bool {
        matches!(self, InstanceState::Checkpointing | InstanceState::Restoring)
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, InstanceState::Failed)
    }

    /// Requests for the instance must be buffered until a restore completes.
    pub const fn needs_wake(self) -> bool {
        matches!(self, InstanceState::Suspended | InstanceState::Restoring)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            InstanceState::Running => "running",
            InstanceState::Checkpointing => "checkpointing",
            InstanceState::Suspended => "suspended",
            InstanceState::Restoring => "restoring",
            InstanceState::Failed => "failed",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns the first illegal step of a state sequence, if any.
///
/// The sequence must start at [`InstanceState::INITIAL`].
pub fn first_illegal_step<I>(states: I) -> Option<(InstanceState, InstanceState)>
where
    I: IntoIterator<Item = InstanceState>,
{
    let mut previous = InstanceState::INITIAL;
    let mut iter = states.into_iter().peekable();

    if iter.peek() == Some(&InstanceState::INITIAL) {
        iter.next();
    }

    for next in iter {
        if !previous.can_transition_to(next) {
            return Some((previous, next));
        }
        previous = next;
    }
    None
}
