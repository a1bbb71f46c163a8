//! Child process supervisor.
//!
//! Owns the map of server name → running child. Children start lazily on
//! first demand; concurrent demands for the same server share one start
//! (single-flight), and an exited child is forgotten so the next demand
//! spawns a fresh one.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use serde::Serialize;
use serde_json::Value;

use super::errors::McpError;
use super::launcher::ChildLauncher;
use super::lifecycle::{self, ManagedServer, ServerState};
use super::types::ServerDescriptor;
use crate::config::{GatewayConfig, TimeoutConfig};

type StartResult = Result<Arc<ManagedServer>, McpError>;
type StartFuture = Shared<BoxFuture<'static, StartResult>>;

// ─── Slots ───────────────────────────────────────────────────────────────────

/// What the supervisor knows about one server. Absent means unstarted.
enum Slot {
    Starting { generation: u64, start: StartFuture },
    Ready { generation: u64, server: Arc<ManagedServer> },
}

impl Slot {
    fn generation(&self) -> u64 {
        match self {
            Slot::Starting { generation, .. } | Slot::Ready { generation, .. } => *generation,
        }
    }
}

/// Snapshot of one configured server for introspection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub name: String,
    /// `stopped`, `starting`, `ready`, or `exited`.
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub pending_requests: usize,
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

struct Inner {
    descriptors: BTreeMap<String, ServerDescriptor>,
    launcher: Arc<dyn ChildLauncher>,
    timeouts: TimeoutConfig,
    slots: Mutex<HashMap<String, Slot>>,
    next_generation: AtomicU64,
    shutting_down: AtomicBool,
}

/// Shared handle to the set of child servers. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        descriptors: BTreeMap<String, ServerDescriptor>,
        launcher: Arc<dyn ChildLauncher>,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                descriptors,
                launcher,
                timeouts,
                slots: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn from_config(config: &GatewayConfig, launcher: Arc<dyn ChildLauncher>) -> Self {
        Self::new(config.mcp_servers.clone(), launcher, config.timeouts)
    }

    pub fn timeouts(&self) -> &TimeoutConfig {
        &self.inner.timeouts
    }

    /// Names of enabled servers, sorted.
    pub fn enabled_servers(&self) -> Vec<String> {
        self.inner
            .descriptors
            .iter()
            .filter(|(_, d)| !d.disabled)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Whether `name` is configured and not disabled.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.inner
            .descriptors
            .get(name)
            .is_some_and(|d| !d.disabled)
    }

    /// Names of servers with a live, ready child, sorted.
    pub fn running_servers(&self) -> Vec<String> {
        let slots = self.inner.lock_slots();
        let mut names: Vec<String> = slots
            .iter()
            .filter_map(|(name, slot)| match slot {
                Slot::Ready { server, .. } if server.is_usable() => Some(name.clone()),
                _ => None,
            })
            .collect();
        names.sort();
        names
    }

    /// Status of every enabled server.
    pub fn statuses(&self) -> Vec<ServerStatus> {
        let slots = self.inner.lock_slots();
        self.enabled_servers()
            .into_iter()
            .map(|name| match slots.get(&name) {
                None => ServerStatus {
                    name,
                    state: "stopped".into(),
                    pid: None,
                    started_at: None,
                    pending_requests: 0,
                },
                Some(Slot::Starting { .. }) => ServerStatus {
                    name,
                    state: "starting".into(),
                    pid: None,
                    started_at: None,
                    pending_requests: 0,
                },
                Some(Slot::Ready { server, .. }) => ServerStatus {
                    name,
                    state: match server.state() {
                        ServerState::Exited => "exited".into(),
                        ServerState::Starting => "starting".into(),
                        ServerState::Ready => "ready".into(),
                    },
                    pid: server.pid(),
                    started_at: Some(server.created_at()),
                    pending_requests: server.pending_requests(),
                },
            })
            .collect()
    }

    /// Return the ready child for `name`, starting it if needed.
    ///
    /// Idempotent: while a start is in flight every caller awaits the same
    /// attempt, so at most one process is spawned per server at a time.
    /// The start itself runs in its own task; a caller that gives up does
    /// not abort it for the others.
    pub async fn ensure_started(&self, name: &str) -> StartResult {
        let descriptor = match self.inner.descriptors.get(name) {
            Some(d) if !d.disabled => d.clone(),
            _ => {
                return Err(McpError::UnknownServer {
                    name: name.to_string(),
                })
            }
        };
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(shutting_down(name));
        }

        let start = {
            let mut slots = self.inner.lock_slots();
            match slots.get(name) {
                Some(Slot::Ready { server, .. }) if server.is_usable() => {
                    return Ok(Arc::clone(server));
                }
                Some(Slot::Starting { start, .. }) => start.clone(),
                _ => {
                    let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
                    let start = Inner::begin_start(&self.inner, name, descriptor, generation);
                    slots.insert(
                        name.to_string(),
                        Slot::Starting {
                            generation,
                            start: start.clone(),
                        },
                    );
                    start
                }
            }
        };

        start.await
    }

    /// Send `method` to server `name` (starting it on demand) and return the result payload.
    pub async fn send_request(
        &self,
        name: &str,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, McpError> {
        let server = self.ensure_started(name).await?;
        server
            .request(method, params, self.inner.timeouts.request())
            .await
    }

    /// Stop every child and refuse further starts.
    ///
    /// Starts still in flight are awaited; their children are stopped as
    /// soon as they come up.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let drained: Vec<(String, Slot)> = self.inner.lock_slots().drain().collect();
        tracing::info!(servers = drained.len(), "shutting down child servers");

        let stops = drained.into_iter().map(|(name, slot)| async move {
            match slot {
                Slot::Ready { server, .. } => server.shutdown().await,
                Slot::Starting { start, .. } => {
                    let _ = start.await;
                }
            }
            tracing::debug!(server = %name, "child stopped");
        });
        join_all(stops).await;
    }
}

impl Inner {
    fn lock_slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn begin_start(
        this: &Arc<Self>,
        name: &str,
        descriptor: ServerDescriptor,
        generation: u64,
    ) -> StartFuture {
        let inner = Arc::clone(this);
        let task_name = name.to_string();
        let handle = tokio::spawn(async move {
            Inner::run_start(inner, task_name, descriptor, generation).await
        });

        let name = name.to_string();
        async move {
            handle.await.unwrap_or_else(|e| {
                Err(McpError::ServerNotReady {
                    name,
                    reason: format!("startup task failed: {e}"),
                })
            })
        }
        .boxed()
        .shared()
    }

    async fn run_start(
        this: Arc<Self>,
        name: String,
        descriptor: ServerDescriptor,
        generation: u64,
    ) -> StartResult {
        tracing::info!(server = %name, generation, "starting server on demand");
        let result =
            lifecycle::spawn_server(&name, &descriptor, this.launcher.as_ref(), &this.timeouts)
                .await;

        let server = match result {
            Ok(server) => server,
            Err(e) => {
                this.remove_if_current(&name, generation);
                tracing::warn!(server = %name, error = %e, "server failed to start");
                return Err(e);
            }
        };

        let promoted = {
            let mut slots = this.lock_slots();
            let current = slots
                .get(&name)
                .is_some_and(|slot| slot.generation() == generation);
            if current && !this.shutting_down.load(Ordering::SeqCst) {
                slots.insert(
                    name.clone(),
                    Slot::Ready {
                        generation,
                        server: Arc::clone(&server),
                    },
                );
                true
            } else {
                false
            }
        };

        if !promoted {
            server.shutdown().await;
            return Err(shutting_down(&name));
        }

        let mut state = server.subscribe_state();
        let weak: Weak<Inner> = Arc::downgrade(&this);
        let exit_name = name.clone();
        tokio::spawn(async move {
            let _ = state
                .wait_for(|s| *s == ServerState::Exited)
                .await
                .map(|_| ());
            if let Some(inner) = weak.upgrade() {
                if inner.remove_if_current(&exit_name, generation) {
                    tracing::info!(server = %exit_name, "server exited; next demand respawns it");
                }
            }
        });

        Ok(server)
    }

    /// Drop the slot for `name` if it still belongs to `generation`.
    fn remove_if_current(&self, name: &str, generation: u64) -> bool {
        let mut slots = self.lock_slots();
        if slots
            .get(name)
            .is_some_and(|slot| slot.generation() == generation)
        {
            slots.remove(name);
            true
        } else {
            false
        }
    }
}

fn shutting_down(name: &str) -> McpError {
    McpError::ServerNotReady {
        name: name.to_string(),
        reason: "gateway is shutting down".into(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
