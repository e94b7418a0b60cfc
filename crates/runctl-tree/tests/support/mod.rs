//! In-process fake applications and a fake process manager, so the whole
//! control tree can be exercised over real HTTP without any external
//! processes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use tokio::task::JoinHandle;

use runctl_comm::{
    AppBootInfo, BootInfo, CommandReply, CommandRequest, ProcessDescriptor, ProcessHandle,
    ProcessManager, ProcessManagerError, ANSWER_PORT_HEADER,
};

/// Route tracing output through the test harness; safe to call from
/// every test, only the first call wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Reply with success after a short delay.
    Ok,
    /// Reply with an explicit failure.
    Fail,
    /// Accept commands but never post a reply.
    Silent,
}

/// One fake application process: an axum command endpoint that posts its
/// asynchronous reply back to the advertised answer port.
pub struct FakeApp {
    pub name: String,
    pub port: u16,
    alive: Arc<AtomicBool>,
    server: JoinHandle<()>,
}

impl FakeApp {
    pub async fn spawn(name: &str, behavior: Behavior) -> Self {
        let cfg = Arc::new(AppConfig {
            name: name.to_string(),
            behavior,
        });
        let router = Router::new()
            .route("/command", post(handle_command))
            .with_state(cfg);

        let socket = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            axum::serve(socket, router).await.unwrap();
        });

        Self {
            name: name.to_string(),
            port,
            alive: Arc::new(AtomicBool::new(true)),
            server,
        }
    }

    /// Simulate a process crash: the command port closes and the
    /// liveness handle reports dead.
    pub fn kill(&self) {
        self.server.abort();
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn handle(&self) -> Box<dyn ProcessHandle> {
        Box::new(FakeHandle {
            alive: Arc::clone(&self.alive),
        })
    }
}

impl Drop for FakeApp {
    fn drop(&mut self) {
        self.server.abort();
    }
}

struct FakeHandle {
    alive: Arc<AtomicBool>,
}

impl ProcessHandle for FakeHandle {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

struct AppConfig {
    name: String,
    behavior: Behavior,
}

async fn handle_command(
    State(cfg): State<Arc<AppConfig>>,
    headers: HeaderMap,
    Json(request): Json<CommandRequest>,
) -> &'static str {
    let answer_port: u16 = headers
        .get(ANSWER_PORT_HEADER)
        .expect("missing answer port header")
        .to_str()
        .unwrap()
        .parse()
        .unwrap();

    let (success, result) = match cfg.behavior {
        Behavior::Ok => (true, "OK".to_string()),
        Behavior::Fail => (false, format!("cannot {}", request.id)),
        Behavior::Silent => return "Accepted",
    };

    let reply = CommandReply {
        appname: cfg.name.clone(),
        success,
        result,
        data: serde_json::json!({ "cmdid": request.id }),
    };

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let url = format!("http://127.0.0.1:{answer_port}/response");
        reqwest::Client::new()
            .post(&url)
            .json(&reply)
            .send()
            .await
            .unwrap();
    });

    "Accepted"
}

/// Process manager backend that boots [`FakeApp`]s in-process.
///
/// Spawned apps are shared with the test through the handle returned by
/// [`FakeProcessManager::new`], so tests can kill individual processes
/// mid-lifecycle.
pub struct FakeProcessManager {
    behaviors: HashMap<String, Behavior>,
    spawned: Arc<Mutex<Vec<FakeApp>>>,
}

pub type SpawnedApps = Arc<Mutex<Vec<FakeApp>>>;

impl FakeProcessManager {
    /// Apps not named in `behaviors` reply with success.
    pub fn new(behaviors: HashMap<String, Behavior>) -> (Self, SpawnedApps) {
        let spawned: SpawnedApps = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                behaviors,
                spawned: Arc::clone(&spawned),
            },
            spawned,
        )
    }

    pub fn all_ok() -> (Self, SpawnedApps) {
        Self::new(HashMap::new())
    }
}

#[async_trait]
impl ProcessManager for FakeProcessManager {
    async fn boot(
        &mut self,
        boot_info: &BootInfo,
        _timeout: Duration,
        _conf_location: &str,
    ) -> Result<HashMap<String, ProcessDescriptor>, ProcessManagerError> {
        let mut apps: Vec<FakeApp> = Vec::with_capacity(boot_info.apps.len());
        let mut descriptors = HashMap::new();
        for app in &boot_info.apps {
            let behavior = self
                .behaviors
                .get(&app.name)
                .copied()
                .unwrap_or(Behavior::Ok);
            let fake = FakeApp::spawn(&app.name, behavior).await;
            descriptors.insert(
                app.name.clone(),
                ProcessDescriptor {
                    name: app.name.clone(),
                    host: "127.0.0.1".to_string(),
                    port: fake.port,
                    handle: fake.handle(),
                },
            );
            apps.push(fake);
        }
        self.spawned.lock().unwrap().extend(apps);
        Ok(descriptors)
    }

    async fn terminate(&mut self) -> Result<(), ProcessManagerError> {
        let apps = std::mem::take(&mut *self.spawned.lock().unwrap());
        for app in &apps {
            app.kill();
        }
        Ok(())
    }
}

/// Boot descriptor for a list of app names, no per-app configuration.
pub fn boot_info(names: &[&str]) -> BootInfo {
    BootInfo::new(
        names
            .iter()
            .map(|n| AppBootInfo {
                name: n.to_string(),
                conf: serde_json::Value::Null,
            })
            .collect(),
    )
}
