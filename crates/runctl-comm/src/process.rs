//! Consumed interface of the process bootstrapping backends
//!
//! The actual backends (SSH, cluster/container) live outside this system;
//! the control tree only depends on the contract below: boot a set of
//! named processes and report where they listen, tear them down on
//! terminate, and answer liveness questions through the descriptor.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ProcessManagerError {
    #[error("boot failed: {0}")]
    Boot(String),

    #[error("terminate failed: {0}")]
    Terminate(String),
}

/// Liveness handle for one OS- or cluster-level process.
pub trait ProcessHandle: Send + Sync {
    fn is_alive(&self) -> bool;
}

/// Where a booted process can be reached, plus its liveness handle.
pub struct ProcessDescriptor {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub handle: Box<dyn ProcessHandle>,
}

impl ProcessDescriptor {
    pub fn is_alive(&self) -> bool {
        self.handle.is_alive()
    }
}

impl std::fmt::Debug for ProcessDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessDescriptor")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Boot payload for one application; the configuration blob is opaque to
/// the core and forwarded to the backend untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppBootInfo {
    pub name: String,
    #[serde(default)]
    pub conf: serde_json::Value,
}

/// Everything a backend needs to boot one subsystem's processes.
///
/// Application order here is the subsystem's child declaration order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootInfo {
    pub apps: Vec<AppBootInfo>,
}

impl BootInfo {
    pub fn new(apps: Vec<AppBootInfo>) -> Self {
        Self { apps }
    }
}

/// Process bootstrapping/termination backend, implemented out of scope.
#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Boot every application in `boot_info`, returning a descriptor per
    /// application name.
    async fn boot(
        &mut self,
        boot_info: &BootInfo,
        timeout: Duration,
        conf_location: &str,
    ) -> Result<HashMap<String, ProcessDescriptor>, ProcessManagerError>;

    /// Tear down everything booted by this manager.
    async fn terminate(&mut self) -> Result<(), ProcessManagerError>;
}
