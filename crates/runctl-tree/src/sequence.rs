//! Fixed sequences of primitive triggers
//!
//! Operator macros like "stop the run" or "shut everything down" are
//! sequences of ordinary triggers run against the tree root one after
//! another. A step marked optional is skipped when its trigger does not
//! apply from the current state; a required step that does not apply, or
//! any step that fails, halts the sequence there.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use runctl_core::{CheckOpts, Command, CommandResponse};

use crate::node::Node;

/// One step of a command sequence.
#[derive(Debug, Clone)]
pub struct SequenceStep {
    pub trigger: String,
    /// Skipped, not fatal, when the trigger does not apply from the
    /// current state.
    pub optional: bool,
}

impl SequenceStep {
    pub fn required(trigger: impl Into<String>) -> Self {
        Self {
            trigger: trigger.into(),
            optional: false,
        }
    }

    pub fn optional(trigger: impl Into<String>) -> Self {
        Self {
            trigger: trigger.into(),
            optional: true,
        }
    }
}

/// A named, ordered list of steps with an inter-step settle delay.
#[derive(Debug, Clone)]
pub struct CommandSequence {
    pub name: String,
    pub steps: Vec<SequenceStep>,
    /// Pause between consecutive executed steps.
    pub interval: Duration,
}

impl CommandSequence {
    pub fn new(name: impl Into<String>, steps: Vec<SequenceStep>) -> Self {
        Self {
            name: name.into(),
            steps,
            interval: Duration::ZERO,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// End the ongoing run: a plain `stop`.
    pub fn stop_run() -> Self {
        Self::new("stop_run", vec![SequenceStep::required("stop")])
    }

    /// Tear everything down from whatever lifecycle point the tree is
    /// at: stop and scrap apply only when a run or a configuration is
    /// actually in place, terminate always must.
    pub fn shutdown() -> Self {
        Self::new(
            "shutdown",
            vec![
                SequenceStep::optional("stop"),
                SequenceStep::optional("scrap"),
                SequenceStep::required("terminate"),
            ],
        )
    }
}

/// What a sequence run did, step by step.
#[derive(Debug)]
pub struct SequenceOutcome {
    pub sequence: String,
    /// Responses of the steps that were dispatched, in order.
    pub executed: Vec<CommandResponse>,
    /// Optional steps skipped because their trigger did not apply.
    pub skipped: Vec<String>,
    /// Trigger the sequence halted on, if it did not run to the end.
    pub halted_on: Option<String>,
}

impl SequenceOutcome {
    pub fn completed(&self) -> bool {
        self.halted_on.is_none()
    }
}

/// Run `sequence` against `node`, deriving each step's command from
/// `base` (timeout, force and payload carry over, the trigger changes).
pub async fn run_sequence(
    node: &Arc<Node>,
    sequence: &CommandSequence,
    base: &Command,
) -> SequenceOutcome {
    let mut outcome = SequenceOutcome {
        sequence: sequence.name.clone(),
        executed: Vec::new(),
        skipped: Vec::new(),
        halted_on: None,
    };

    info!(sequence = %sequence.name, node = %node.name(), steps = sequence.steps.len(), "sequence started");

    for (index, step) in sequence.steps.iter().enumerate() {
        let applies = node
            .can_execute(&step.trigger, CheckOpts::transitions_only())
            .await
            .is_ok();

        if !applies {
            if step.optional {
                info!(sequence = %sequence.name, trigger = %step.trigger, "optional step skipped");
                outcome.skipped.push(step.trigger.clone());
                continue;
            }
            warn!(sequence = %sequence.name, trigger = %step.trigger, state = %node.state(), "required step does not apply");
            outcome.halted_on = Some(step.trigger.clone());
            break;
        }

        match node.execute(base.for_trigger(&step.trigger)).await {
            Ok(response) if response.status.is_success() => {
                outcome.executed.push(response);
            }
            Ok(response) => {
                warn!(sequence = %sequence.name, trigger = %step.trigger, status = %response.status, "step failed, halting");
                outcome.executed.push(response);
                outcome.halted_on = Some(step.trigger.clone());
                break;
            }
            Err(err) => {
                warn!(sequence = %sequence.name, trigger = %step.trigger, %err, "step refused, halting");
                outcome.halted_on = Some(step.trigger.clone());
                break;
            }
        }

        // Settle delay between steps, not after the last one.
        if !sequence.interval.is_zero() && index + 1 < sequence.steps.len() {
            tokio::time::sleep(sequence.interval).await;
        }
    }

    info!(
        sequence = %sequence.name,
        executed = outcome.executed.len(),
        skipped = outcome.skipped.len(),
        completed = outcome.completed(),
        "sequence finished"
    );
    outcome
}
