//! # runctl-core
//!
//! Core types and abstractions for the runctl run-control system.
//! This crate provides the vocabulary shared by all other components:
//! the finite-state-machine compiler that turns a declarative transition
//! table into a two-phase "start → in-progress → finish" protocol, and
//! the command/response value types exchanged across the control tree.

pub mod command;
pub mod fsm;

pub use command::{CheckOpts, Command, CommandResponse, ExecCheck, StatusCode};
pub use fsm::{FsmConfig, FsmError, Machine, Transition, TransitionConfig, ERROR_STATE};
