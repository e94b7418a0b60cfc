//! Per-process command sender and reply correlation
//!
//! One [`Commander`] exists per remote application. Sending is a fire-and-
//! forget HTTP POST; the asynchronous reply arrives through the
//! [`ReplySlot`] registered with the subsystem's response listener and is
//! collected with [`Commander::check_response`]. A separate TCP-connect
//! probe ([`Commander::ping`]) answers liveness questions without touching
//! the command channel.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::wire::{CommandReply, CommandRequest, ANSWER_PORT_HEADER};

/// How long the liveness probe waits for a TCP connect.
const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Failures local to one commander; the owning node converts them into a
/// status for that child, they never propagate as crashes.
#[derive(Debug, thiserror::Error)]
pub enum CommanderError {
    #[error("no response queued for '{app}'")]
    NoResponse { app: String },

    #[error("timed out after {seconds}s waiting for a reply from '{app}'")]
    ResponseTimeout { app: String, seconds: u64 },

    #[error("'{app}' rejected command '{trigger}' with HTTP status {status}")]
    Rejected {
        app: String,
        trigger: String,
        status: u16,
    },

    #[error("could not deliver command '{trigger}' to '{app}': {source}")]
    Unreachable {
        app: String,
        trigger: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("reply channel for '{app}' is closed")]
    ChannelClosed { app: String },
}

/// Sender half of a commander's private reply queue.
///
/// Handed to the response listener at registration time; the dispatcher
/// task delivers decoded replies through it.
#[derive(Debug, Clone)]
pub struct ReplySlot {
    tx: mpsc::UnboundedSender<CommandReply>,
}

impl ReplySlot {
    /// Deliver a reply; false if the owning commander is gone.
    pub fn deliver(&self, reply: CommandReply) -> bool {
        self.tx.send(reply).is_ok()
    }
}

/// Per-process command sender and private reply queue.
pub struct Commander {
    app: String,
    host: String,
    port: u16,
    answer_port: u16,
    client: reqwest::Client,
    replies: tokio::sync::Mutex<mpsc::UnboundedReceiver<CommandReply>>,
    in_flight: Mutex<Option<String>>,
    last_sent: Mutex<Option<String>>,
    last_ok: Mutex<Option<String>>,
}

impl Commander {
    /// Create a commander bound to one remote process, together with the
    /// [`ReplySlot`] to register with the response listener.
    pub fn new(
        app: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        answer_port: u16,
    ) -> (Self, ReplySlot) {
        let (tx, rx) = mpsc::unbounded_channel();
        let commander = Self {
            app: app.into(),
            host: host.into(),
            port,
            answer_port,
            client: reqwest::Client::new(),
            replies: tokio::sync::Mutex::new(rx),
            in_flight: Mutex::new(None),
            last_sent: Mutex::new(None),
            last_ok: Mutex::new(None),
        };
        (commander, ReplySlot { tx })
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Trigger of the request currently awaiting its reply, if any.
    pub fn in_flight(&self) -> Option<String> {
        self.in_flight.lock().clone()
    }

    /// Last trigger sent, successful or not.
    pub fn last_sent_command(&self) -> Option<String> {
        self.last_sent.lock().clone()
    }

    /// Last trigger that completed with an OK reply.
    pub fn last_ok_command(&self) -> Option<String> {
        self.last_ok.lock().clone()
    }

    /// Fire a command at the remote process without waiting for the
    /// asynchronous completion reply.
    ///
    /// Stale replies from an abandoned earlier cycle are discarded before
    /// sending, so the next [`check_response`](Self::check_response) only
    /// sees replies to this command or later ones.
    pub async fn send_command(
        &self,
        trigger: &str,
        payload: serde_json::Value,
        entry_state: &str,
        exit_state: &str,
    ) -> Result<(), CommanderError> {
        self.drain_stale_replies().await;

        let request = CommandRequest {
            id: trigger.to_string(),
            data: payload,
            entry_state: entry_state.to_string(),
            exit_state: exit_state.to_string(),
        };
        let url = format!("http://{}:{}/command", self.host, self.port);

        info!(app = %self.app, %trigger, %url, "sending command");

        *self.last_sent.lock() = Some(trigger.to_string());

        let response = self
            .client
            .post(&url)
            .header(ANSWER_PORT_HEADER, self.answer_port.to_string())
            .json(&request)
            .send()
            .await
            .map_err(|source| CommanderError::Unreachable {
                app: self.app.clone(),
                trigger: trigger.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(CommanderError::Rejected {
                app: self.app.clone(),
                trigger: trigger.to_string(),
                status: response.status().as_u16(),
            });
        }

        *self.in_flight.lock() = Some(trigger.to_string());
        Ok(())
    }

    /// Collect the asynchronous reply to the in-flight command.
    ///
    /// `timeout == 0` returns immediately, failing with
    /// [`CommanderError::NoResponse`] when nothing is queued; `timeout > 0`
    /// blocks up to that many seconds and fails with
    /// [`CommanderError::ResponseTimeout`]. On success the in-flight marker
    /// is cleared and the decoded reply returned.
    pub async fn check_response(&self, timeout: u64) -> Result<CommandReply, CommanderError> {
        let mut replies = self.replies.lock().await;

        let reply = if timeout == 0 {
            match replies.try_recv() {
                Ok(reply) => reply,
                Err(mpsc::error::TryRecvError::Empty) => {
                    return Err(CommanderError::NoResponse {
                        app: self.app.clone(),
                    })
                }
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return Err(CommanderError::ChannelClosed {
                        app: self.app.clone(),
                    })
                }
            }
        } else {
            match tokio::time::timeout(Duration::from_secs(timeout), replies.recv()).await {
                Ok(Some(reply)) => reply,
                Ok(None) => {
                    return Err(CommanderError::ChannelClosed {
                        app: self.app.clone(),
                    })
                }
                Err(_) => {
                    warn!(app = %self.app, timeout, "no reply within bound");
                    return Err(CommanderError::ResponseTimeout {
                        app: self.app.clone(),
                        seconds: timeout,
                    });
                }
            }
        };

        let cleared = self.in_flight.lock().take();
        debug!(
            app = %self.app,
            cmdid = reply.cmdid().unwrap_or("<none>"),
            answered = cleared.as_deref().unwrap_or("<none>"),
            ok = reply.is_ok(),
            "reply collected"
        );

        if reply.is_ok() {
            *self.last_ok.lock() = self.last_sent.lock().clone();
        }

        Ok(reply)
    }

    /// Synchronous liveness probe: can we open a TCP connection to the
    /// application's command port? Independent of the command channel.
    pub async fn ping(&self) -> bool {
        let addr = format!("{}:{}", self.host, self.port);
        matches!(
            tokio::time::timeout(PING_TIMEOUT, TcpStream::connect(&addr)).await,
            Ok(Ok(_))
        )
    }

    async fn drain_stale_replies(&self) {
        let mut replies = self.replies.lock().await;
        let mut dropped = 0usize;
        while replies.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!(app = %self.app, dropped, "discarded stale replies from a previous command cycle");
        }
    }
}

impl std::fmt::Debug for Commander {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Commander")
            .field("app", &self.app)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("answer_port", &self.answer_port)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn check_response_zero_timeout_fails_immediately() {
        let (commander, _slot) = Commander::new("app", "127.0.0.1", 1, 2);
        let err = commander.check_response(0).await.unwrap_err();
        assert!(matches!(err, CommanderError::NoResponse { .. }));
    }

    #[tokio::test]
    async fn delivered_reply_is_collected() {
        let (commander, slot) = Commander::new("app", "127.0.0.1", 1, 2);
        assert!(slot.deliver(CommandReply {
            appname: "app".into(),
            success: true,
            result: "OK".into(),
            data: serde_json::json!({ "cmdid": "conf" }),
        }));

        let reply = commander.check_response(0).await.unwrap();
        assert!(reply.is_ok());
        assert_eq!(reply.cmdid(), Some("conf"));
    }

    #[tokio::test]
    async fn timeout_is_reported_after_the_bound() {
        let (commander, _slot) = Commander::new("app", "127.0.0.1", 1, 2);
        let started = std::time::Instant::now();
        let err = commander.check_response(1).await.unwrap_err();
        assert!(matches!(err, CommanderError::ResponseTimeout { seconds: 1, .. }));
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn ping_reflects_tcp_reachability() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (commander, _slot) = Commander::new("app", "127.0.0.1", port, 0);
        assert!(commander.ping().await);

        drop(listener);
        // Nothing listens on the freed port anymore.
        let (dead, _slot) = Commander::new("app", "127.0.0.1", port, 0);
        assert!(!dead.ping().await);
    }

    #[tokio::test]
    async fn stale_replies_are_discarded_before_sending() {
        let (commander, slot) = Commander::new("app", "127.0.0.1", 1, 2);
        slot.deliver(CommandReply {
            appname: "app".into(),
            success: true,
            result: "OK".into(),
            data: serde_json::json!({ "cmdid": "old" }),
        });

        commander.drain_stale_replies().await;
        let err = commander.check_response(0).await.unwrap_err();
        assert!(matches!(err, CommanderError::NoResponse { .. }));
    }
}
