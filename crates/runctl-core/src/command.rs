//! Command and response value types
//!
//! A [`Command`] is a transient value carried down the control tree; a
//! [`CommandResponse`] is the aggregated result percolating back up. Both
//! mirror the JSON shapes exchanged with remote applications closely
//! enough that the wire layer only has to rename fields.

use serde::{Deserialize, Serialize};

/// Outcome of a command on a node, aggregated over its subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    /// Every addressed child reported success.
    Success,
    /// At least one addressed child never reported within the bound.
    Timeout,
    /// At least one addressed child reported an explicit failure.
    Failed,
    /// The trigger was not valid from the node's current state.
    InvalidTransition,
    /// The command was abandoned before dispatch (dead child, no force).
    Aborted,
}

impl StatusCode {
    pub fn is_success(&self) -> bool {
        matches!(self, StatusCode::Success)
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StatusCode::Success => "success",
            StatusCode::Timeout => "timeout",
            StatusCode::Failed => "failed",
            StatusCode::InvalidTransition => "invalid transition",
            StatusCode::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// A lifecycle command issued by an operator, propagated down the tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// Trigger name driving the state transition (`boot`, `conf`, ...).
    pub trigger: String,
    /// Opaque per-command payload forwarded to the remote applications.
    pub payload: serde_json::Value,
    /// Expected state on entry, forwarded on the wire.
    pub entry_state: String,
    /// Expected state on exit, forwarded on the wire.
    pub exit_state: String,
    /// Completion bound, in seconds (~1s resolution, see the node poll loop).
    pub timeout: u64,
    /// Operator override: proceed past dead children and failed
    /// preconditions, recording the failures instead of aborting.
    pub force: bool,
}

impl Command {
    pub fn new(trigger: impl Into<String>) -> Self {
        Self {
            trigger: trigger.into(),
            payload: serde_json::Value::Null,
            entry_state: "ANY".to_string(),
            exit_state: "ANY".to_string(),
            timeout: 60,
            force: false,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_states(mut self, entry: impl Into<String>, exit: impl Into<String>) -> Self {
        self.entry_state = entry.into();
        self.exit_state = exit.into();
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = seconds;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Derive a command with the same payload and flags but another trigger,
    /// used by the sequence executor.
    pub fn for_trigger(&self, trigger: impl Into<String>) -> Self {
        Self {
            trigger: trigger.into(),
            ..self.clone()
        }
    }
}

/// Result of a command on one node, delivered to the parent's mailbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub status: StatusCode,
    /// Name of the node this response originates from.
    pub node: String,
    /// Trigger the response answers.
    pub command: String,
    /// Node state once the command concluded.
    pub state: String,
    /// Children that never reported within the bound.
    pub timeouts: Vec<String>,
    /// Children that reported failure (or were dead and skipped under force).
    pub failed: Vec<String>,
    /// Human-readable error descriptions collected along the way.
    pub errors: Vec<String>,
}

impl CommandResponse {
    pub fn success(node: impl Into<String>, command: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            status: StatusCode::Success,
            node: node.into(),
            command: command.into(),
            state: state.into(),
            timeouts: Vec::new(),
            failed: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn failure(
        status: StatusCode,
        node: impl Into<String>,
        command: impl Into<String>,
        state: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            status,
            node: node.into(),
            command: command.into(),
            state: state.into(),
            timeouts: Vec::new(),
            failed: Vec::new(),
            errors: vec![error.into()],
        }
    }
}

/// Flags controlling how deep a [`can_execute`] traversal probes.
///
/// [`can_execute`]: crate::command::ExecCheck
#[derive(Debug, Clone, Copy)]
pub struct CheckOpts {
    /// Probe process liveness (descriptor + TCP ping) on leaf nodes.
    pub check_dead: bool,
    /// Refuse nodes whose errored flag is set.
    pub check_in_error: bool,
    /// Restrict the traversal to included children.
    pub only_included: bool,
}

impl CheckOpts {
    /// Full pre-dispatch validation: liveness, error flags, included only.
    pub fn full() -> Self {
        Self {
            check_dead: true,
            check_in_error: true,
            only_included: true,
        }
    }

    /// Transition-table check only, no liveness probing. Used by the
    /// sequence executor to decide whether a step applies at all.
    pub fn transitions_only() -> Self {
        Self {
            check_dead: false,
            check_in_error: true,
            only_included: true,
        }
    }
}

/// Result of a `can_execute` traversal; the first non-`CanExecute`
/// finding short-circuits the walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecCheck {
    CanExecute,
    /// The trigger has no acting transition from the node's current state.
    InvalidTransition {
        node: String,
        state: String,
        trigger: String,
    },
    /// The node has no live command channel yet (not booted).
    NotInitialised { node: String },
    /// The liveness probe failed for this node's process.
    Dead { node: String },
    /// The node (or an included descendant) is already in error.
    InError { node: String },
}

impl ExecCheck {
    pub fn is_ok(&self) -> bool {
        matches!(self, ExecCheck::CanExecute)
    }
}

impl std::fmt::Display for ExecCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecCheck::CanExecute => write!(f, "executable"),
            ExecCheck::InvalidTransition {
                node,
                state,
                trigger,
            } => write!(f, "'{trigger}' is not valid on '{node}' in state '{state}'"),
            ExecCheck::NotInitialised { node } => write!(f, "'{node}' is not initialised"),
            ExecCheck::Dead { node } => write!(f, "'{node}' is unreachable"),
            ExecCheck::InError { node } => write!(f, "'{node}' is in error"),
        }
    }
}
