//! Finite-state-machine compiler
//!
//! A declarative `{states, transitions}` table is compiled once, at node
//! construction, into a [`Machine`]. Every declared transition is split in
//! two: an *acting* transition that moves the node into a synthesized
//! `<trigger>_ing` state, and a *finalizing* transition `end_<trigger>`
//! that completes it once the node has confirmed the work is done. Only
//! acting transitions are triggerable by an operator; finalizing
//! transitions are emitted internally. A universal terminal `error` state
//! is always present and reachable from any state via the error-report
//! path, never via a normal [`Machine::can`] check.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Name of the universal terminal error state.
pub const ERROR_STATE: &str = "error";

/// Suffix appended to a trigger name to form its acting state.
const ACTING_SUFFIX: &str = "_ing";

/// Declarative FSM configuration, as consumed from JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsmConfig {
    /// State names; insertion order is display order only, the first
    /// entry is the initial state.
    pub states: Vec<String>,
    /// Declared transitions, before the acting/finalizing split.
    pub transitions: Vec<TransitionConfig>,
}

/// One declared transition in the configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionConfig {
    pub trigger: String,
    pub source: String,
    pub dest: String,
}

impl FsmConfig {
    /// Parse a configuration from its JSON representation.
    pub fn from_json(raw: &str) -> Result<Self, FsmError> {
        serde_json::from_str(raw).map_err(FsmError::Parse)
    }
}

/// A compiled transition, keyed by trigger in the dispatch table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// State the trigger is valid from.
    pub source: String,
    /// Synthesized in-progress state (`<trigger>_ing`).
    pub acting: String,
    /// State reached once the finalizing transition fires.
    pub dest: String,
}

/// Errors rejected at machine construction time.
#[derive(Debug, thiserror::Error)]
pub enum FsmError {
    #[error("FSM configuration declares no states")]
    NoStates,

    #[error("duplicate state '{0}' in FSM configuration")]
    DuplicateState(String),

    #[error("state '{0}' is reserved (collides with the error state or a derived acting state)")]
    ReservedState(String),

    #[error("duplicate trigger '{0}' in FSM configuration")]
    DuplicateTrigger(String),

    #[error("transition '{trigger}' references unknown state '{state}'")]
    UnknownState { trigger: String, state: String },

    #[error("unknown trigger '{0}'")]
    UnknownTrigger(String),

    #[error("failed to parse FSM configuration: {0}")]
    Parse(#[source] serde_json::Error),
}

/// Compiled, immutable state machine.
///
/// Built once from an [`FsmConfig`]; lookups are a static dispatch table
/// keyed by trigger name, there is no per-instance method synthesis.
#[derive(Debug, Clone)]
pub struct Machine {
    /// All states: declared (in declaration order), then derived acting
    /// states, then `error`.
    states: Vec<String>,
    initial: String,
    table: HashMap<String, Transition>,
}

impl Machine {
    /// Compile a declarative configuration into a machine.
    ///
    /// Rejects configurations whose transitions reference states outside
    /// `states ∪ derived acting states`, duplicate trigger names, and
    /// state names that collide with the derived ones.
    pub fn build(cfg: &FsmConfig) -> Result<Self, FsmError> {
        if cfg.states.is_empty() {
            return Err(FsmError::NoStates);
        }

        let mut states: Vec<String> = Vec::with_capacity(cfg.states.len());
        for state in &cfg.states {
            if state == ERROR_STATE || state.ends_with(ACTING_SUFFIX) {
                return Err(FsmError::ReservedState(state.clone()));
            }
            if states.contains(state) {
                return Err(FsmError::DuplicateState(state.clone()));
            }
            states.push(state.clone());
        }

        let mut table: HashMap<String, Transition> = HashMap::new();
        let mut acting_states: Vec<String> = Vec::with_capacity(cfg.transitions.len());
        for t in &cfg.transitions {
            let acting = format!("{}{}", t.trigger, ACTING_SUFFIX);
            if table.contains_key(&t.trigger) {
                return Err(FsmError::DuplicateTrigger(t.trigger.clone()));
            }
            acting_states.push(acting.clone());
            table.insert(
                t.trigger.clone(),
                Transition {
                    source: t.source.clone(),
                    acting,
                    dest: t.dest.clone(),
                },
            );
        }

        // Sources and destinations may name declared states or any of the
        // derived acting states, nothing else.
        let known = |s: &str| states.iter().any(|k| k == s) || acting_states.iter().any(|k| k == s);
        for t in &cfg.transitions {
            for state in [&t.source, &t.dest] {
                if !known(state) {
                    return Err(FsmError::UnknownState {
                        trigger: t.trigger.clone(),
                        state: state.clone(),
                    });
                }
            }
        }

        states.extend(acting_states);
        states.push(ERROR_STATE.to_string());

        let initial = states[0].clone();
        debug!(
            states = states.len(),
            triggers = table.len(),
            "compiled state machine"
        );

        Ok(Self {
            states,
            initial,
            table,
        })
    }

    /// Whether `trigger` may fire from `state`.
    ///
    /// True only for *acting* transitions; the derived `end_<trigger>`
    /// finalizers and the error-report path are internal and never pass
    /// this check.
    pub fn can(&self, trigger: &str, state: &str) -> bool {
        self.table
            .get(trigger)
            .map(|t| t.source == state)
            .unwrap_or(false)
    }

    /// The initial state (first declared state).
    pub fn initial_state(&self) -> &str {
        &self.initial
    }

    /// All states in display order: declared, derived acting, `error`.
    pub fn states(&self) -> &[String] {
        &self.states
    }

    /// The in-progress state a trigger moves the node into.
    pub fn acting_state(&self, trigger: &str) -> Result<&str, FsmError> {
        self.table
            .get(trigger)
            .map(|t| t.acting.as_str())
            .ok_or_else(|| FsmError::UnknownTrigger(trigger.to_string()))
    }

    /// The state reached once a trigger's finalizing transition fires.
    pub fn target(&self, trigger: &str) -> Result<&str, FsmError> {
        self.table
            .get(trigger)
            .map(|t| t.dest.as_str())
            .ok_or_else(|| FsmError::UnknownTrigger(trigger.to_string()))
    }

    /// The state a trigger is valid from.
    pub fn source(&self, trigger: &str) -> Result<&str, FsmError> {
        self.table
            .get(trigger)
            .map(|t| t.source.as_str())
            .ok_or_else(|| FsmError::UnknownTrigger(trigger.to_string()))
    }

    /// All known trigger names, in no particular order.
    pub fn triggers(&self) -> impl Iterator<Item = &str> {
        self.table.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_config() -> FsmConfig {
        FsmConfig::from_json(
            r#"{
                "states": ["none", "initialised", "configured", "running"],
                "transitions": [
                    {"trigger": "boot",  "source": "none",        "dest": "initialised"},
                    {"trigger": "conf",  "source": "initialised", "dest": "configured"},
                    {"trigger": "start", "source": "configured",  "dest": "running"},
                    {"trigger": "stop",  "source": "running",     "dest": "configured"},
                    {"trigger": "scrap", "source": "configured",  "dest": "initialised"},
                    {"trigger": "terminate", "source": "initialised", "dest": "none"}
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn derives_acting_states_and_error() {
        let machine = Machine::build(&run_config()).unwrap();

        assert_eq!(machine.initial_state(), "none");
        assert!(machine.states().iter().any(|s| s == "boot_ing"));
        assert!(machine.states().iter().any(|s| s == "conf_ing"));
        assert_eq!(machine.states().last().unwrap(), ERROR_STATE);

        assert_eq!(machine.acting_state("conf").unwrap(), "conf_ing");
        assert_eq!(machine.target("conf").unwrap(), "configured");
        assert_eq!(machine.source("conf").unwrap(), "initialised");
    }

    #[test]
    fn can_only_accepts_acting_transitions() {
        let machine = Machine::build(&run_config()).unwrap();

        assert!(machine.can("boot", "none"));
        assert!(machine.can("conf", "initialised"));
        assert!(!machine.can("conf", "none"));
        assert!(!machine.can("start", "running"));

        // Finalizing transitions are internal.
        assert!(!machine.can("end_conf", "conf_ing"));
        // The error state is never a valid source.
        assert!(!machine.can("conf", ERROR_STATE));
    }

    #[test]
    fn rejects_unknown_states_at_build_time() {
        let cfg = FsmConfig {
            states: vec!["a".into(), "b".into()],
            transitions: vec![TransitionConfig {
                trigger: "go".into(),
                source: "a".into(),
                dest: "nowhere".into(),
            }],
        };
        assert!(matches!(
            Machine::build(&cfg),
            Err(FsmError::UnknownState { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_triggers() {
        let cfg = FsmConfig {
            states: vec!["a".into(), "b".into()],
            transitions: vec![
                TransitionConfig {
                    trigger: "go".into(),
                    source: "a".into(),
                    dest: "b".into(),
                },
                TransitionConfig {
                    trigger: "go".into(),
                    source: "b".into(),
                    dest: "a".into(),
                },
            ],
        };
        assert!(matches!(
            Machine::build(&cfg),
            Err(FsmError::DuplicateTrigger(_))
        ));
    }

    #[test]
    fn rejects_reserved_state_names() {
        let cfg = FsmConfig {
            states: vec!["a".into(), "error".into()],
            transitions: vec![],
        };
        assert!(matches!(
            Machine::build(&cfg),
            Err(FsmError::ReservedState(_))
        ));

        let cfg = FsmConfig {
            states: vec!["a".into(), "boot_ing".into()],
            transitions: vec![],
        };
        assert!(matches!(
            Machine::build(&cfg),
            Err(FsmError::ReservedState(_))
        ));
    }

    #[test]
    fn transition_may_target_a_derived_state() {
        // A declared transition is allowed to land in another trigger's
        // acting state; the derived set is part of the valid vocabulary.
        let cfg = FsmConfig {
            states: vec!["a".into(), "b".into()],
            transitions: vec![
                TransitionConfig {
                    trigger: "go".into(),
                    source: "a".into(),
                    dest: "b".into(),
                },
                TransitionConfig {
                    trigger: "jump".into(),
                    source: "b".into(),
                    dest: "go_ing".into(),
                },
            ],
        };
        assert!(Machine::build(&cfg).is_ok());
    }
}
