//! Command execution and propagation
//!
//! The dispatch cycle of a composite node is fire-then-poll: one task per
//! addressed child is spawned, each sending the child's aggregated
//! response into the parent's mailbox, and the parent polls that mailbox
//! on a ~1s grain until every child has reported or the command's
//! deadline passes. Children that never report are force-transitioned to
//! the error state.
//!
//! Subsystem nodes intercept the `boot` and `terminate` triggers: `boot`
//! creates the application children from the process manager's
//! descriptors, `terminate` detaches them and tears the processes down.
//! Every other trigger propagates like on a plain group.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tracing::{debug, error, info, warn};

use runctl_core::{CheckOpts, Command, CommandResponse, StatusCode};
use runctl_comm::{CommandReply, Commander, CommanderError, ResponseListener};

use crate::error::CommandError;
use crate::node::{Node, NodeKind};

/// Mailbox poll granularity.
const POLL_STEP: Duration = Duration::from_secs(1);

impl Node {
    /// Operator entry point: validate the whole subtree, then run the
    /// command.
    ///
    /// Validation covers transitions, error flags and process liveness;
    /// `force` bypasses it and lets the dispatch record failures instead
    /// of refusing up front.
    pub async fn execute(self: &Arc<Self>, command: Command) -> Result<CommandResponse, CommandError> {
        if !command.force {
            let check = self.can_execute(&command.trigger, CheckOpts::full()).await;
            if !check.is_ok() {
                error!(node = %self.name(), trigger = %command.trigger, %check, "command refused");
                return Err(CommandError::NotExecutable {
                    trigger: command.trigger.clone(),
                    check,
                });
            }
        }
        Ok(self.trigger(command).await)
    }

    /// Run a command on this subtree without the pre-dispatch validation
    /// of [`execute`](Self::execute); this is what a parent's dispatch
    /// task invokes on each child.
    ///
    /// Never panics and never blocks past the command's deadline (plus
    /// the ~1s poll grain); whatever happens below is folded into the
    /// returned [`CommandResponse`].
    pub fn trigger(self: &Arc<Self>, command: Command) -> BoxFuture<'static, CommandResponse> {
        let this = Arc::clone(self);
        Box::pin(async move { this.run_trigger(command).await })
    }

    async fn run_trigger(self: Arc<Self>, command: Command) -> CommandResponse {
        // One command at a time on this node.
        let _busy = self.busy.lock().await;
        let trigger = command.trigger.clone();

        let acting = match self.machine.acting_state(&trigger) {
            Ok(state) => state.to_string(),
            Err(err) => {
                return CommandResponse::failure(
                    StatusCode::InvalidTransition,
                    self.name(),
                    &trigger,
                    self.state(),
                    err.to_string(),
                )
            }
        };

        self.drain_mailbox().await;

        info!(node = %self.name(), %trigger, timeout = command.timeout, "command started");
        self.set_state(&acting);

        let mut response = match &self.kind {
            NodeKind::Application { .. } => self.dispatch_application(&command).await,
            NodeKind::Subsystem { .. } if trigger == "boot" => self.boot_subsystem(&command).await,
            NodeKind::Subsystem { .. } if trigger == "terminate" => {
                self.terminate_subsystem(&command).await
            }
            _ => self.propagate(&command).await,
        };

        if response.status.is_success() {
            match self.machine.target(&trigger) {
                Ok(dest) => {
                    let dest = dest.to_string();
                    self.set_state(&dest);
                    self.errored.store(false, Ordering::SeqCst);
                }
                // acting_state succeeded above, the trigger is known.
                Err(err) => {
                    response.status = StatusCode::Failed;
                    response.errors.push(err.to_string());
                    self.fail();
                }
            }
        } else {
            self.fail();
        }

        response.state = self.state();
        info!(
            node = %self.name(),
            %trigger,
            status = %response.status,
            state = %response.state,
            "command finished"
        );
        response
    }

    /// Fan a command out to the included children and aggregate their
    /// reports under the command's deadline.
    async fn propagate(self: &Arc<Self>, command: &Command) -> CommandResponse {
        let trigger = command.trigger.clone();
        let addressed: Vec<Arc<Node>> = self
            .dispatch_order(&trigger)
            .into_iter()
            .filter(|c| c.included())
            .collect();

        if addressed.is_empty() {
            return CommandResponse::success(self.name(), &trigger, self.state());
        }

        let mut failed: Vec<String> = Vec::new();
        let mut errors: Vec<String> = Vec::new();

        // Liveness pre-scan. A dead child abandons the whole command
        // unless the operator forces past it.
        let mut live: Vec<Arc<Node>> = Vec::with_capacity(addressed.len());
        for child in addressed {
            if child.is_alive().await {
                live.push(child);
            } else if command.force {
                warn!(node = %self.name(), child = %child.name(), "dead child skipped under force");
                errors.push(format!("'{}' is dead, skipped", child.name()));
                failed.push(child.name().to_string());
            } else {
                error!(node = %self.name(), child = %child.name(), %trigger, "dead child, aborting");
                return CommandResponse::failure(
                    StatusCode::Aborted,
                    self.name(),
                    &trigger,
                    self.state(),
                    format!("'{}' is dead, '{trigger}' aborted", child.name()),
                );
            }
        }

        let mut pending: HashSet<String> = live.iter().map(|c| c.name().to_string()).collect();
        for child in &live {
            let report = self.mailbox_tx.clone();
            let fut = child.trigger(command.clone());
            tokio::spawn(async move {
                // The parent may have given up on this cycle already.
                let _ = report.send(fut.await);
            });
        }

        let deadline = Instant::now() + Duration::from_secs(command.timeout);
        let mut timeouts: Vec<String> = Vec::new();
        let mut aborted = false;

        loop {
            {
                let mut mailbox = self.mailbox_rx.lock().await;
                while let Ok(report) = mailbox.try_recv() {
                    if !pending.remove(&report.node) {
                        debug!(node = %self.name(), from = %report.node, "unexpected report dropped");
                        continue;
                    }
                    debug!(node = %self.name(), from = %report.node, status = %report.status, "child reported");
                    match report.status {
                        StatusCode::Success => {}
                        StatusCode::Timeout => {
                            timeouts.push(report.node.clone());
                            errors.extend(report.errors);
                        }
                        StatusCode::Aborted => {
                            aborted = true;
                            failed.push(report.node.clone());
                            errors.extend(report.errors);
                        }
                        StatusCode::Failed | StatusCode::InvalidTransition => {
                            failed.push(report.node.clone());
                            errors.extend(report.errors);
                        }
                    }
                }
            }

            if pending.is_empty() {
                break;
            }
            // A failure or abort ends the wait for the rest of the batch
            // unless the operator forces the command through everywhere.
            if !command.force && (aborted || !failed.is_empty()) {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(POLL_STEP.min(deadline - now)).await;
        }

        // Whoever never reported, whether the bound expired or a sibling
        // failure ended the wait, is marked timed out and errored. Their
        // dispatch tasks keep running but the send lands in a drained
        // mailbox.
        for name in &pending {
            warn!(node = %self.name(), child = %name, %trigger, "no report before the command ended");
            timeouts.push(name.clone());
            errors.push(format!(
                "'{name}' did not report, timed out after {}s or abandoned on a sibling failure",
                command.timeout
            ));
            if let Some(child) = live.iter().find(|c| c.name() == name.as_str()) {
                child.fail();
            }
        }

        let status = if aborted {
            StatusCode::Aborted
        } else if !failed.is_empty() {
            StatusCode::Failed
        } else if !timeouts.is_empty() {
            StatusCode::Timeout
        } else {
            StatusCode::Success
        };

        CommandResponse {
            status,
            node: self.name().to_string(),
            command: trigger,
            state: self.state(),
            timeouts,
            failed,
            errors,
        }
    }

    /// Fan an out-of-band command to every included application below
    /// this node, bypassing the state machine entirely. No transition
    /// happens anywhere; the result is one reply per application, keyed
    /// by name.
    ///
    /// This is the expert escape hatch for commands the lifecycle does
    /// not model, such as rate changes or debug dumps. A delivery failure
    /// is folded into a failure reply for that application and the rest
    /// of the fan-out proceeds.
    pub fn send_custom_command<'a>(
        &'a self,
        cmd: &'a str,
        data: &'a serde_json::Value,
        timeout: u64,
    ) -> BoxFuture<'a, HashMap<String, CommandReply>> {
        Box::pin(async move {
            let mut replies = HashMap::new();
            match &self.kind {
                NodeKind::Application { .. } => {
                    // Serialize against lifecycle dispatch on this leaf so
                    // the reply queues cannot interleave.
                    let _busy = self.busy.lock().await;
                    let reply = self.custom_command_on_app(cmd, data, timeout).await;
                    replies.insert(self.name().to_string(), reply);
                }
                _ => {
                    for child in self.children() {
                        if child.included() {
                            replies.extend(child.send_custom_command(cmd, data, timeout).await);
                        }
                    }
                }
            }
            replies
        })
    }

    async fn custom_command_on_app(
        &self,
        cmd: &str,
        data: &serde_json::Value,
        timeout: u64,
    ) -> CommandReply {
        let failure = |result: String| CommandReply {
            appname: self.name().to_string(),
            success: false,
            result,
            data: serde_json::Value::Null,
        };

        let NodeKind::Application { commander, .. } = &self.kind else {
            return failure("not an application node".to_string());
        };
        let Some(commander) = commander.read().clone() else {
            return failure("no command channel, application was never booted".to_string());
        };

        info!(app = %self.name(), %cmd, "sending out-of-band command");
        if let Err(err) = commander
            .send_command(cmd, data.clone(), "ANY", "ANY")
            .await
        {
            return failure(err.to_string());
        }
        match commander.check_response(timeout).await {
            Ok(reply) => reply,
            Err(err) => failure(err.to_string()),
        }
    }

    /// Leaf dispatch: forward the command over the wire and wait for the
    /// asynchronous completion reply.
    async fn dispatch_application(&self, command: &Command) -> CommandResponse {
        let NodeKind::Application { commander, .. } = &self.kind else {
            return CommandResponse::failure(
                StatusCode::Failed,
                self.name(),
                &command.trigger,
                self.state(),
                "not an application node",
            );
        };

        let commander = commander.read().clone();
        let Some(commander) = commander else {
            return CommandResponse::failure(
                StatusCode::Failed,
                self.name(),
                &command.trigger,
                self.state(),
                "no command channel, application was never booted",
            );
        };

        if let Err(err) = commander
            .send_command(
                &command.trigger,
                command.payload.clone(),
                &command.entry_state,
                &command.exit_state,
            )
            .await
        {
            return CommandResponse::failure(
                StatusCode::Failed,
                self.name(),
                &command.trigger,
                self.state(),
                err.to_string(),
            );
        }

        match commander.check_response(command.timeout).await {
            Ok(reply) if reply.is_ok() => {
                CommandResponse::success(self.name(), &command.trigger, self.state())
            }
            Ok(reply) => CommandResponse::failure(
                StatusCode::Failed,
                self.name(),
                &command.trigger,
                self.state(),
                format!("'{}' answered: {}", self.name(), reply.result),
            ),
            Err(
                err @ (CommanderError::ResponseTimeout { .. } | CommanderError::NoResponse { .. }),
            ) => CommandResponse::failure(
                StatusCode::Timeout,
                self.name(),
                &command.trigger,
                self.state(),
                err.to_string(),
            ),
            Err(err) => CommandResponse::failure(
                StatusCode::Failed,
                self.name(),
                &command.trigger,
                self.state(),
                err.to_string(),
            ),
        }
    }

    /// Boot the subsystem's processes and materialize its application
    /// children from the returned descriptors.
    async fn boot_subsystem(&self, command: &Command) -> CommandResponse {
        let NodeKind::Subsystem {
            children,
            manager,
            listener_port,
            listener,
            boot_info,
            conf_location,
        } = &self.kind
        else {
            return CommandResponse::failure(
                StatusCode::Failed,
                self.name(),
                &command.trigger,
                self.state(),
                "not a subsystem node",
            );
        };

        // One listener per subsystem; a re-boot after terminate rebinds.
        let existing = listener.read().clone();
        let listener_arc = match existing {
            Some(l) => l,
            None => match ResponseListener::bind(*listener_port).await {
                Ok(l) => {
                    let l = Arc::new(l);
                    *listener.write() = Some(Arc::clone(&l));
                    l
                }
                Err(err) => {
                    return CommandResponse::failure(
                        StatusCode::Failed,
                        self.name(),
                        &command.trigger,
                        self.state(),
                        err.to_string(),
                    )
                }
            },
        };

        let mut descriptors = match manager
            .lock()
            .await
            .boot(boot_info, Duration::from_secs(command.timeout), conf_location)
            .await
        {
            Ok(descriptors) => descriptors,
            Err(err) => {
                return CommandResponse::failure(
                    StatusCode::Failed,
                    self.name(),
                    &command.trigger,
                    self.state(),
                    err.to_string(),
                )
            }
        };

        let mut booted: Vec<Arc<Node>> = Vec::with_capacity(boot_info.apps.len());
        let mut failed: Vec<String> = Vec::new();
        let mut errors: Vec<String> = Vec::new();

        for app in &boot_info.apps {
            let Some(descriptor) = descriptors.remove(&app.name) else {
                failed.push(app.name.clone());
                errors.push(format!("no process descriptor returned for '{}'", app.name));
                continue;
            };

            let (app_commander, slot) = Commander::new(
                &app.name,
                &descriptor.host,
                descriptor.port,
                listener_arc.port(),
            );
            if let Err(err) = listener_arc.register(&app.name, slot) {
                failed.push(app.name.clone());
                errors.push(err.to_string());
                continue;
            }

            let child = Node::application(
                &app.name,
                self.machine.clone(),
                Arc::new(app_commander),
                descriptor,
            );
            // The remote process comes up already initialised; only the
            // tree needs to catch up with it.
            if let Ok(dest) = self.machine.target(&command.trigger) {
                child.set_state(dest);
            }
            info!(subsystem = %self.name(), app = %app.name, "application booted");
            booted.push(child);
        }

        *children.write() = booted;

        let status = if failed.is_empty() {
            StatusCode::Success
        } else {
            StatusCode::Failed
        };
        CommandResponse {
            status,
            node: self.name().to_string(),
            command: command.trigger.clone(),
            state: self.state(),
            timeouts: Vec::new(),
            failed,
            errors,
        }
    }

    /// Detach the application children, stop the response listener and
    /// tear the subsystem's processes down.
    async fn terminate_subsystem(&self, command: &Command) -> CommandResponse {
        let NodeKind::Subsystem {
            children,
            manager,
            listener,
            ..
        } = &self.kind
        else {
            return CommandResponse::failure(
                StatusCode::Failed,
                self.name(),
                &command.trigger,
                self.state(),
                "not a subsystem node",
            );
        };

        let detached: Vec<Arc<Node>> = std::mem::take(&mut *children.write());
        if let Some(l) = listener.write().take() {
            for child in &detached {
                // Missing registrations are fine, the boot may have
                // partially failed.
                let _ = l.unregister(child.name());
            }
            l.terminate();
        }
        info!(subsystem = %self.name(), apps = detached.len(), "applications detached");

        if let Err(err) = manager.lock().await.terminate().await {
            return CommandResponse::failure(
                StatusCode::Failed,
                self.name(),
                &command.trigger,
                self.state(),
                err.to_string(),
            );
        }

        CommandResponse::success(self.name(), &command.trigger, self.state())
    }
}
