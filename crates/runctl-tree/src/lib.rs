//! # runctl-tree
//!
//! The hierarchical command-propagation engine of the runctl run-control
//! system: a tree of stateful nodes, each holding one compiled state
//! machine, that fans operator commands out to included children and
//! aggregates their completion reports under a timeout bound.
//!
//! - [`Node`]: generic tree element; composite nodes propagate to their
//!   children, subsystem nodes additionally boot/terminate the real
//!   processes behind their application children, application leaves talk
//!   to one remote process through a [`runctl_comm::Commander`].
//! - [`run_sequence`]: executor for fixed sequences of primitive
//!   triggers ("stop the run", "shut down") with optional steps.
//!
//! Failure isolation is structural: nothing is shared across sibling
//! subtrees, and a failed child never corrupts its siblings' state, it
//! only prevents the parent from finishing its own transition.

pub mod error;
pub mod node;
pub mod sequence;

mod dispatch;

pub use error::CommandError;
pub use node::{Node, NodeStatus};
pub use sequence::{run_sequence, CommandSequence, SequenceOutcome, SequenceStep};
