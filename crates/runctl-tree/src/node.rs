//! Tree of stateful nodes
//!
//! Every node owns one compiled [`Machine`] instance, an ordered set of
//! children, inclusion/error flags and an inbound mailbox that only its
//! direct children write to and only its own coordination logic drains.
//! Children are held as an owned, ordered collection; the only "back"
//! relation a dispatch task receives is a clone of the parent's mailbox
//! sender, which never participates in ownership or destruction order.
//!
//! A node processes one command to completion, including all descendant
//! fan-out, before accepting the next; there is no cross-command
//! concurrency within one node.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use runctl_core::{CheckOpts, CommandResponse, ExecCheck, Machine, ERROR_STATE};
use runctl_comm::{BootInfo, Commander, ProcessDescriptor, ProcessManager, ResponseListener};

use crate::error::CommandError;

/// A participant in the command tree.
pub struct Node {
    pub(crate) name: String,
    pub(crate) machine: Machine,
    pub(crate) state: RwLock<String>,
    pub(crate) included: AtomicBool,
    pub(crate) errored: AtomicBool,
    /// Per-trigger explicit child ordering override; unlisted children
    /// follow in declaration order.
    pub(crate) order: HashMap<String, Vec<String>>,
    pub(crate) mailbox_tx: mpsc::UnboundedSender<CommandResponse>,
    pub(crate) mailbox_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<CommandResponse>>,
    /// Serializes command processing on this node.
    pub(crate) busy: tokio::sync::Mutex<()>,
    pub(crate) kind: NodeKind,
}

pub(crate) enum NodeKind {
    /// Plain composite: fans commands out, owns no processes.
    Group {
        children: RwLock<Vec<Arc<Node>>>,
    },
    /// Composite responsible for booting/terminating the real processes
    /// behind its application children.
    Subsystem {
        children: RwLock<Vec<Arc<Node>>>,
        manager: tokio::sync::Mutex<Box<dyn ProcessManager>>,
        listener_port: u16,
        listener: RwLock<Option<Arc<ResponseListener>>>,
        boot_info: BootInfo,
        conf_location: String,
    },
    /// Leaf bound to one remote process; populated at subsystem boot.
    Application {
        commander: RwLock<Option<Arc<Commander>>>,
        process: RwLock<Option<ProcessDescriptor>>,
    },
}

impl Node {
    /// Build a plain composite node over pre-built children.
    pub fn group(
        name: impl Into<String>,
        machine: Machine,
        children: Vec<Arc<Node>>,
        order: HashMap<String, Vec<String>>,
    ) -> Arc<Self> {
        Arc::new(Self::new(
            name.into(),
            machine,
            order,
            NodeKind::Group {
                children: RwLock::new(children),
            },
        ))
    }

    /// Build a subsystem node. Its application children do not exist yet;
    /// they are created by the `boot` command and detached by `terminate`.
    pub fn subsystem(
        name: impl Into<String>,
        machine: Machine,
        manager: Box<dyn ProcessManager>,
        listener_port: u16,
        boot_info: BootInfo,
        conf_location: impl Into<String>,
        order: HashMap<String, Vec<String>>,
    ) -> Arc<Self> {
        Arc::new(Self::new(
            name.into(),
            machine,
            order,
            NodeKind::Subsystem {
                children: RwLock::new(Vec::new()),
                manager: tokio::sync::Mutex::new(manager),
                listener_port,
                listener: RwLock::new(None),
                boot_info,
                conf_location: conf_location.into(),
            },
        ))
    }

    /// Build an application leaf bound to a booted process.
    pub(crate) fn application(
        name: impl Into<String>,
        machine: Machine,
        commander: Arc<Commander>,
        process: ProcessDescriptor,
    ) -> Arc<Self> {
        Arc::new(Self::new(
            name.into(),
            machine,
            HashMap::new(),
            NodeKind::Application {
                commander: RwLock::new(Some(commander)),
                process: RwLock::new(Some(process)),
            },
        ))
    }

    fn new(name: String, machine: Machine, order: HashMap<String, Vec<String>>, kind: NodeKind) -> Self {
        let initial = machine.initial_state().to_string();
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        Self {
            name,
            machine,
            state: RwLock::new(initial),
            included: AtomicBool::new(true),
            errored: AtomicBool::new(false),
            order,
            mailbox_tx,
            mailbox_rx: tokio::sync::Mutex::new(mailbox_rx),
            busy: tokio::sync::Mutex::new(()),
            kind,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> String {
        self.state.read().clone()
    }

    pub fn included(&self) -> bool {
        self.included.load(Ordering::SeqCst)
    }

    pub fn errored(&self) -> bool {
        self.errored.load(Ordering::SeqCst)
    }

    pub fn is_application(&self) -> bool {
        matches!(self.kind, NodeKind::Application { .. })
    }

    /// Snapshot of the current children, in declaration order.
    pub fn children(&self) -> Vec<Arc<Node>> {
        match &self.kind {
            NodeKind::Group { children } | NodeKind::Subsystem { children, .. } => {
                children.read().clone()
            }
            NodeKind::Application { .. } => Vec::new(),
        }
    }

    /// Find a direct child by name.
    pub fn child(&self, name: &str) -> Option<Arc<Node>> {
        self.children().into_iter().find(|c| c.name() == name)
    }

    pub(crate) fn set_state(&self, state: &str) {
        let mut current = self.state.write();
        debug!(node = %self.name, from = %*current, to = %state, "state change");
        *current = state.to_string();
    }

    /// Move to the terminal error state and set the errored flag.
    pub(crate) fn fail(&self) {
        self.set_state(ERROR_STATE);
        self.errored.store(true, Ordering::SeqCst);
    }

    /// Re-admit this subtree into command propagation.
    ///
    /// Errors (and changes nothing) when the node is already included;
    /// descendants are set unconditionally. Re-inclusion does not
    /// retroactively validate the subtree's state; the next command's
    /// checks do that.
    pub fn include(&self) -> Result<(), CommandError> {
        if self.included() {
            error!(node = %self.name, "already included");
            return Err(CommandError::AlreadyIncluded(self.name.clone()));
        }
        self.set_included_recursive(true);
        info!(node = %self.name, "included");
        Ok(())
    }

    /// Freeze this subtree: skipped by every future `can_execute`/
    /// `trigger`/liveness traversal until re-included.
    pub fn exclude(&self) -> Result<(), CommandError> {
        if !self.included() {
            error!(node = %self.name, "already excluded");
            return Err(CommandError::AlreadyExcluded(self.name.clone()));
        }
        self.set_included_recursive(false);
        info!(node = %self.name, "excluded");
        Ok(())
    }

    fn set_included_recursive(&self, value: bool) {
        self.included.store(value, Ordering::SeqCst);
        for child in self.children() {
            child.set_included_recursive(value);
        }
    }

    /// Validate `trigger` against this node's machine and those of its
    /// included descendants. The first non-`CanExecute` finding is
    /// returned; no partial execution is attempted past it.
    pub fn can_execute<'a>(&'a self, trigger: &'a str, opts: CheckOpts) -> BoxFuture<'a, ExecCheck> {
        Box::pin(async move {
            if opts.check_in_error && self.errored() {
                return ExecCheck::InError {
                    node: self.name.clone(),
                };
            }

            let state = self.state();
            if !self.machine.can(trigger, &state) {
                return ExecCheck::InvalidTransition {
                    node: self.name.clone(),
                    state,
                    trigger: trigger.to_string(),
                };
            }

            if let NodeKind::Application { commander, process } = &self.kind {
                if opts.check_dead {
                    let commander = commander.read().clone();
                    let Some(commander) = commander else {
                        return ExecCheck::NotInitialised {
                            node: self.name.clone(),
                        };
                    };
                    let descriptor_alive =
                        process.read().as_ref().map(|d| d.is_alive()).unwrap_or(false);
                    if !descriptor_alive || !commander.ping().await {
                        return ExecCheck::Dead {
                            node: self.name.clone(),
                        };
                    }
                }
                return ExecCheck::CanExecute;
            }

            for child in self.children() {
                if opts.only_included && !child.included() {
                    continue;
                }
                let check = child.can_execute(trigger, opts).await;
                if !check.is_ok() {
                    return check;
                }
            }
            ExecCheck::CanExecute
        })
    }

    /// Full liveness of this subtree: every included application below it
    /// has a live process descriptor and answers the TCP probe.
    pub fn is_alive(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            match &self.kind {
                NodeKind::Application { commander, process } => {
                    let commander = commander.read().clone();
                    let Some(commander) = commander else {
                        return false;
                    };
                    let descriptor_alive =
                        process.read().as_ref().map(|d| d.is_alive()).unwrap_or(false);
                    descriptor_alive && commander.ping().await
                }
                _ => {
                    for child in self.children() {
                        if child.included() && !child.is_alive().await {
                            return false;
                        }
                    }
                    true
                }
            }
        })
    }

    /// Recompute the errored flag bottom-up.
    ///
    /// A composite node is errored if it sits in the error state itself,
    /// if any included child is errored, or if its included children
    /// disagree on their resulting state; divergence usually means a
    /// child silently failed outside the tracked command path.
    pub fn resolve_error(&self) -> bool {
        let errored = match &self.kind {
            NodeKind::Application { .. } => self.state() == ERROR_STATE,
            _ => {
                let mut child_errored = false;
                let mut states: Vec<String> = Vec::new();
                for child in self.children() {
                    if !child.included() {
                        continue;
                    }
                    child_errored |= child.resolve_error();
                    states.push(child.state());
                }
                let diverged = states.windows(2).any(|w| w[0] != w[1]);
                self.state() == ERROR_STATE || child_errored || diverged
            }
        };
        self.errored.store(errored, Ordering::SeqCst);
        errored
    }

    /// Children to address for `trigger`: the explicit per-trigger order
    /// when one is configured (unlisted children appended in declaration
    /// order), otherwise plain declaration order.
    pub(crate) fn dispatch_order(&self, trigger: &str) -> Vec<Arc<Node>> {
        let children = self.children();
        let Some(names) = self.order.get(trigger) else {
            return children;
        };
        let mut ordered: Vec<Arc<Node>> = Vec::with_capacity(children.len());
        for name in names {
            if let Some(child) = children.iter().find(|c| c.name() == name.as_str()) {
                ordered.push(Arc::clone(child));
            }
        }
        for child in &children {
            if !ordered.iter().any(|c| c.name() == child.name()) {
                ordered.push(Arc::clone(child));
            }
        }
        ordered
    }

    /// Discard mailbox content left over from an abandoned command cycle.
    pub(crate) async fn drain_mailbox(&self) {
        let mut rx = self.mailbox_rx.lock().await;
        let mut dropped = 0usize;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(node = %self.name, dropped, "discarded stale mailbox reports");
        }
    }

    /// Recursive status snapshot of this subtree.
    pub fn status_report(&self) -> NodeStatus {
        let (last_sent_command, last_ok_command) = match &self.kind {
            NodeKind::Application { commander, .. } => match commander.read().as_ref() {
                Some(c) => (c.last_sent_command(), c.last_ok_command()),
                None => (None, None),
            },
            _ => (None, None),
        };
        NodeStatus {
            name: self.name.clone(),
            state: self.state(),
            included: self.included(),
            errored: self.errored(),
            last_sent_command,
            last_ok_command,
            children: self.children().iter().map(|c| c.status_report()).collect(),
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("included", &self.included())
            .field("errored", &self.errored())
            .field("children", &self.children().len())
            .finish()
    }
}

/// Inspectable snapshot of one node, recursively over its subtree.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub name: String,
    pub state: String,
    pub included: bool,
    pub errored: bool,
    pub last_sent_command: Option<String>,
    pub last_ok_command: Option<String>,
    pub children: Vec<NodeStatus>,
}
