pub mod config;
pub mod gateway;
pub mod mcp_client;

use std::path::{Path, PathBuf};

pub use gateway::Gateway;
pub use mcp_client::{McpClient, McpError};

/// Default filter when neither `--log-level` nor `RUST_LOG` is set.
const DEFAULT_LOG_FILTER: &str = "mcp_manager=info,warn";

/// Return the platform-standard data directory for the gateway.
///
/// - macOS: `~/Library/Application Support/mcp-manager/`
/// - Windows: `{FOLDERID_RoamingAppData}\mcp-manager\`
/// - Linux: `$XDG_DATA_HOME/mcp-manager/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.mcp-manager/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-manager");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-manager")
}

/// Default log file used by `--log-file` without a path.
pub fn default_log_path() -> PathBuf {
    data_dir().join("mcp-manager.log")
}

/// How logs are filtered, formatted, and where they go.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// `EnvFilter` directive; overrides `RUST_LOG`.
    pub level: Option<String>,
    /// Emit one JSON object per event.
    pub json: bool,
    /// Write to this file instead of stderr.
    pub file: Option<PathBuf>,
}

/// Initialize the tracing subscriber.
///
/// Logs never go to stdout: it carries protocol traffic in stdio mode.
/// With a log file:
/// 1. Rotates existing logs (mcp-manager.log → .1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh file with a line-flushing writer for crash resilience.
/// 3. Logs a startup banner with the log path for discoverability.
pub fn init_tracing(options: &LogOptions) -> std::io::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::EnvFilter;

    let filter = match &options.level {
        Some(level) => EnvFilter::try_new(level).map_err(std::io::Error::other)?,
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    };

    let (writer, ansi) = match &options.file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            rotate_log_file(path, 3);
            let log_file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            (BoxMakeWriter::new(FlushingWriter::new(log_file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true)
        .with_thread_ids(false);

    let installed = if options.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(std::io::Error::other)?;

    let log_file = options.file.as_ref().map(|p| p.display().to_string());
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?log_file,
        pid = std::process::id(),
        "=== mcp-manager starting ==="
    );
    Ok(())
}

/// Rotate log files: `mcp-manager.log` → `mcp-manager.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    // Delete the oldest
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    // Shift: .{n-1} → .{n}
    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    // Current → .1
    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// Without explicit flushing, the last lines before a crash or a killed
/// process can be lost.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
