//! In-memory MCP server children for tests.
//!
//! `FakeLauncher` implements `ChildLauncher` by wiring `tokio::io::duplex`
//! pipes to a task that speaks just enough of the protocol: `initialize`,
//! `tools/list`, and `tools/call` for the `echo`, `fail`, and `hang` tools.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::watch;

use super::errors::McpError;
use super::launcher::{ChildLauncher, ChildProcess, LaunchedChild};
use super::types::ServerDescriptor;

/// `Some(Some(code))` exits with a code, `Some(None)` simulates a kill.
type ExitCommand = Option<Option<i32>>;

/// Behaviour of one fake server.
#[derive(Debug, Clone)]
pub(crate) struct FakeServer {
    tools: Vec<Value>,
    answer_initialize: bool,
    announce_initialized: bool,
    stderr_line: Option<String>,
    fail_launch: bool,
    fail_tools_list: bool,
    launch_delay: Duration,
}

impl FakeServer {
    /// A well-behaved server exposing a single `echo` tool.
    pub(crate) fn echo() -> Self {
        Self::with_tools(vec![json!({
            "name": "echo",
            "description": "Echo a message back",
            "inputSchema": {
                "type": "object",
                "properties": { "message": { "type": "string" } },
                "required": ["message"]
            }
        })])
    }

    pub(crate) fn with_tools(tools: Vec<Value>) -> Self {
        Self {
            tools,
            answer_initialize: true,
            announce_initialized: false,
            stderr_line: None,
            fail_launch: false,
            fail_tools_list: false,
            launch_delay: Duration::ZERO,
        }
    }

    pub(crate) fn without_initialize_response(mut self) -> Self {
        self.answer_initialize = false;
        self
    }

    pub(crate) fn announcing_initialized(mut self) -> Self {
        self.announce_initialized = true;
        self
    }

    pub(crate) fn with_stderr(mut self, line: &str) -> Self {
        self.stderr_line = Some(line.to_string());
        self
    }

    pub(crate) fn failing_launch(mut self) -> Self {
        self.fail_launch = true;
        self
    }

    pub(crate) fn failing_tools_list(mut self) -> Self {
        self.fail_tools_list = true;
        self
    }

    pub(crate) fn with_launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }
}

/// Bookkeeping for the most recent instance of a fake server.
struct Instance {
    received: Arc<Mutex<Vec<Value>>>,
    exit_tx: watch::Sender<ExitCommand>,
    stopped: Arc<AtomicBool>,
}

/// `ChildLauncher` that runs fake servers in-process.
#[derive(Default)]
pub(crate) struct FakeLauncher {
    servers: HashMap<String, FakeServer>,
    launches: Mutex<HashMap<String, u32>>,
    instances: Mutex<HashMap<String, Instance>>,
    next_pid: AtomicU32,
}

impl FakeLauncher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_server(mut self, name: &str, server: FakeServer) -> Self {
        self.servers.insert(name.to_string(), server);
        self
    }

    /// Launch attempts made for `name`.
    pub(crate) fn launch_count(&self, name: &str) -> u32 {
        self.launches.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    /// Every message the latest instance of `name` received, in order.
    pub(crate) fn received(&self, name: &str) -> Vec<Value> {
        self.instances
            .lock()
            .unwrap()
            .get(name)
            .map(|i| i.received.lock().unwrap().clone())
            .unwrap_or_default()
    }

    pub(crate) fn received_methods(&self, name: &str) -> Vec<String> {
        self.received(name)
            .iter()
            .filter_map(|m| m["method"].as_str().map(String::from))
            .collect()
    }

    /// Whether the latest instance of `name` has terminated.
    pub(crate) fn is_stopped(&self, name: &str) -> bool {
        self.instances
            .lock()
            .unwrap()
            .get(name)
            .map(|i| i.stopped.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Make the latest instance of `name` exit with `code`.
    pub(crate) fn exit(&self, name: &str, code: i32) {
        if let Some(instance) = self.instances.lock().unwrap().get(name) {
            instance.exit_tx.send_replace(Some(Some(code)));
        }
    }

    /// Poll until the latest instance has received `count` `tools/call` requests.
    pub(crate) async fn wait_for_calls(&self, name: &str, count: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let calls = self
                .received_methods(name)
                .iter()
                .filter(|m| *m == "tools/call")
                .count();
            if calls >= count {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "server '{name}' saw {calls} calls, expected {count}"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl ChildLauncher for FakeLauncher {
    async fn launch(
        &self,
        name: &str,
        _descriptor: &ServerDescriptor,
    ) -> Result<LaunchedChild, McpError> {
        *self
            .launches
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default() += 1;

        let behaviour = self.servers.get(name).cloned().ok_or(McpError::SpawnFailed {
            name: name.to_string(),
            reason: "no such fake server".into(),
        })?;

        if !behaviour.launch_delay.is_zero() {
            tokio::time::sleep(behaviour.launch_delay).await;
        }
        if behaviour.fail_launch {
            return Err(McpError::SpawnFailed {
                name: name.to_string(),
                reason: "No such file or directory (os error 2)".into(),
            });
        }

        let (stdin_ours, stdin_child) = tokio::io::duplex(64 * 1024);
        let (stdout_child, stdout_ours) = tokio::io::duplex(64 * 1024);
        let (stderr_child, stderr_ours) = tokio::io::duplex(4 * 1024);
        let (exit_tx, exit_rx) = watch::channel::<ExitCommand>(None);
        let (exited_tx, exited_rx) = watch::channel::<ExitCommand>(None);

        let received = Arc::new(Mutex::new(Vec::new()));
        let stopped = Arc::new(AtomicBool::new(false));

        tokio::spawn(run_fake(
            name.to_string(),
            behaviour,
            FakePipes {
                stdin: stdin_child,
                stdout: stdout_child,
                stderr: stderr_child,
            },
            exit_rx,
            exited_tx,
            Arc::clone(&received),
            Arc::clone(&stopped),
        ));

        self.instances.lock().unwrap().insert(
            name.to_string(),
            Instance {
                received,
                exit_tx: exit_tx.clone(),
                stopped,
            },
        );

        Ok(LaunchedChild {
            stdin: Box::new(stdin_ours),
            stdout: Box::new(stdout_ours),
            stderr: Some(Box::new(stderr_ours)),
            process: Box::new(FakeProcess {
                pid: 10_000 + self.next_pid.fetch_add(1, Ordering::SeqCst),
                exit_tx,
                exited_rx,
            }),
        })
    }
}

struct FakeProcess {
    pid: u32,
    exit_tx: watch::Sender<ExitCommand>,
    exited_rx: watch::Receiver<ExitCommand>,
}

#[async_trait]
impl ChildProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        let status = self
            .exited_rx
            .wait_for(|s| s.is_some())
            .await
            .map(|s| *s)
            .ok()
            .flatten();
        Ok(status.flatten())
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.exit_tx.send_replace(Some(None));
        Ok(())
    }
}

struct FakePipes {
    stdin: DuplexStream,
    stdout: DuplexStream,
    stderr: DuplexStream,
}

async fn run_fake(
    name: String,
    behaviour: FakeServer,
    pipes: FakePipes,
    mut exit_rx: watch::Receiver<ExitCommand>,
    exited_tx: watch::Sender<ExitCommand>,
    received: Arc<Mutex<Vec<Value>>>,
    stopped: Arc<AtomicBool>,
) {
    let FakePipes {
        stdin,
        mut stdout,
        mut stderr,
    } = pipes;

    if let Some(line) = &behaviour.stderr_line {
        let _ = stderr.write_all(format!("{line}\n").as_bytes()).await;
    }

    let mut lines = BufReader::new(stdin).lines();
    let code: Option<i32> = loop {
        let line = tokio::select! {
            cmd = async { exit_rx.wait_for(|c| c.is_some()).await.map(|c| *c).ok().flatten() } => {
                break cmd.flatten();
            }
            line = lines.next_line() => line,
        };

        let Ok(Some(line)) = line else {
            // stdin closed: exit cleanly like a well-behaved server
            break Some(0);
        };
        let Ok(msg) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        received.lock().unwrap().push(msg.clone());

        for reply in respond(&name, &behaviour, &msg) {
            if stdout
                .write_all(format!("{reply}\n").as_bytes())
                .await
                .is_err()
            {
                break;
            }
        }
    };

    drop(stdout);
    drop(stderr);
    stopped.store(true, Ordering::SeqCst);
    exited_tx.send_replace(Some(code));
}

fn respond(name: &str, behaviour: &FakeServer, msg: &Value) -> Vec<Value> {
    let Some(id) = msg.get("id").cloned() else {
        return Vec::new();
    };
    let ok = |result: Value| json!({"jsonrpc": "2.0", "id": id, "result": result});
    let err = |code: i32, message: &str, data: Value| {
        json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message, "data": data}})
    };

    match msg["method"].as_str().unwrap_or_default() {
        "initialize" => {
            let mut out = Vec::new();
            if behaviour.announce_initialized {
                out.push(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}));
            }
            if behaviour.answer_initialize {
                out.push(ok(json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": name, "version": "1.0.0" }
                })));
            }
            out
        }
        "tools/list" if behaviour.fail_tools_list => {
            vec![err(-32603, "tools unavailable", Value::Null)]
        }
        "tools/list" => vec![ok(json!({ "tools": behaviour.tools }))],
        "tools/call" => match msg["params"]["name"].as_str().unwrap_or_default() {
            "echo" => {
                let text = msg["params"]["arguments"]["message"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                vec![ok(json!({
                    "content": [{ "type": "text", "text": text }],
                    "arguments": msg["params"]["arguments"].clone()
                }))]
            }
            "fail" => vec![err(-32000, "tool failed", json!({"detail": "boom"}))],
            "hang" => Vec::new(),
            other => vec![err(-32601, &format!("Unknown tool: {other}"), Value::Null)],
        },
        other => vec![err(-32601, &format!("Method not found: {other}"), Value::Null)],
    }
}
