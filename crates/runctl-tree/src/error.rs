//! Errors surfaced to the operator entry points

use runctl_core::{ExecCheck, FsmError};

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("cannot include '{0}': it is already included")]
    AlreadyIncluded(String),

    #[error("cannot exclude '{0}': it is already excluded")]
    AlreadyExcluded(String),

    #[error("command '{trigger}' refused: {check}")]
    NotExecutable { trigger: String, check: ExecCheck },

    #[error(transparent)]
    Fsm(#[from] FsmError),
}
