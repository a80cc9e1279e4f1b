//! Backend process supervision: launch, output capture, exit watching,
//! forced termination and crash-recovery cleanup.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tauri::{AppHandle, Manager, State};

use crate::bridge::{self, OutboundMessage};
use crate::platform;

pub mod health;
pub mod port;

/// Environment override for the backend executable path.
const BACKEND_OVERRIDE_ENV: &str = "VLM_CAPTION_BACKEND";

#[cfg(windows)]
const BACKEND_BINARY: &str = "app.exe";
#[cfg(not(windows))]
const BACKEND_BINARY: &str = "app";

/// Captured output lines kept for diagnostics. Bounded so a chatty
/// backend can never grow shell memory without limit.
const OUTPUT_LOG_CAPACITY: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("no free port in range {start}-{end}")]
    NoPortAvailable { start: u16, end: u16 },

    #[error("backend executable not found at {path}")]
    ExecutableNotFound { path: PathBuf },

    #[error("failed to start backend process at {path}: {source}")]
    SpawnError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("backend did not become healthy within {waited:?} (last probe error: {last_error})")]
    HealthCheckTimeout { waited: Duration, last_error: String },

    #[error("backend process is already running")]
    AlreadyRunning,

    #[error("failed to resolve application path: {0}")]
    PathResolution(String),
}

/// Lifecycle of the supervised backend process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProcessState {
    Unstarted,
    Launching,
    Running,
    Terminating,
    Terminated,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputLine {
    pub timestamp_ms: u64,
    pub stream: OutputStream,
    pub line: String,
}

#[derive(Debug)]
struct Inner {
    state: ProcessState,
    child: Option<std::process::Child>,
    pid: Option<u32>,
    port: Option<u16>,
}

/// Process-scoped supervisor. Owns the backend child exclusively; the
/// webview only ever sees the port number, never the handle.
#[derive(Debug)]
pub struct BackendSupervisor {
    inner: Mutex<Inner>,
    output: Arc<Mutex<VecDeque<OutputLine>>>,
}

impl Default for BackendSupervisor {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ProcessState::Unstarted,
                child: None,
                pid: None,
                port: None,
            }),
            output: Arc::new(Mutex::new(VecDeque::new())),
        }
    }
}

impl BackendSupervisor {
    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Backend supervisor lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn port(&self) -> Option<u16> {
        self.lock_inner().port
    }

    pub fn state(&self) -> ProcessState {
        self.lock_inner().state
    }
}

/// Resolved invocation of the backend: interpreter + script in
/// development, packaged executable in production.
#[derive(Debug, Clone)]
pub struct BackendCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

fn override_command_from(path: &str) -> Result<BackendCommand, SupervisorError> {
    let program = PathBuf::from(path);
    if !program.exists() {
        return Err(SupervisorError::ExecutableNotFound { path: program });
    }
    let working_dir = program
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    Ok(BackendCommand {
        program,
        args: Vec::new(),
        working_dir,
    })
}

/// Resolve what to spawn. Pure function of the build-mode flag (plus the
/// explicit override); in production a missing executable fails here,
/// before any spawn is attempted.
pub fn resolve_backend_command(app: &AppHandle) -> Result<BackendCommand, SupervisorError> {
    if let Ok(path) = std::env::var(BACKEND_OVERRIDE_ENV) {
        return override_command_from(&path);
    }

    if cfg!(debug_assertions) {
        // Development: run the backend entry point with the system interpreter.
        let interpreter = which::which("python3")
            .or_else(|_| which::which("python"))
            .map_err(|_| SupervisorError::ExecutableNotFound {
                path: PathBuf::from("python3"),
            })?;
        let backend_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("backend");
        Ok(BackendCommand {
            program: interpreter,
            args: vec!["app.py".to_string()],
            working_dir: backend_dir,
        })
    } else {
        // Production: packaged executable under the resource directory.
        let resource_dir = app
            .path()
            .resource_dir()
            .map_err(|e| SupervisorError::PathResolution(e.to_string()))?;
        let backend_dir = resource_dir.join("backend");
        let program = backend_dir.join(BACKEND_BINARY);
        if !program.exists() {
            return Err(SupervisorError::ExecutableNotFound { path: program });
        }
        Ok(BackendCommand {
            program,
            args: Vec::new(),
            working_dir: backend_dir,
        })
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn push_output_line(
    buffer: &Arc<Mutex<VecDeque<OutputLine>>>,
    stream: OutputStream,
    line: String,
) {
    let Ok(mut buffer) = buffer.lock() else { return };
    if buffer.len() >= OUTPUT_LOG_CAPACITY {
        buffer.pop_front();
    }
    buffer.push_back(OutputLine {
        timestamp_ms: now_ms(),
        stream,
        line,
    });
}

/// Drain one child stream line-by-line into the diagnostic ring buffer.
/// Runs on its own thread so the backend is never blocked on a slow
/// diagnostic sink; per-stream arrival order is preserved.
fn spawn_drain_thread<R: Read + Send + 'static>(
    stream: R,
    origin: OutputStream,
    buffer: Arc<Mutex<VecDeque<OutputLine>>>,
) {
    std::thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            match origin {
                OutputStream::Stdout => log::info!("[backend stdout] {line}"),
                OutputStream::Stderr => log::warn!("[backend stderr] {line}"),
            }
            push_output_line(&buffer, origin, line);
        }
    });
}

fn spawn_supervised(
    supervisor: &BackendSupervisor,
    command: &BackendCommand,
    port: u16,
) -> Result<u32, SupervisorError> {
    let mut inner = supervisor.lock_inner();
    if matches!(
        inner.state,
        ProcessState::Launching | ProcessState::Running | ProcessState::Terminating
    ) {
        return Err(SupervisorError::AlreadyRunning);
    }
    inner.state = ProcessState::Launching;

    let mut cmd = platform::silent_command(&command.program);
    cmd.args(&command.args)
        .arg("--port")
        .arg(port.to_string())
        .current_dir(&command.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Start in its own process group so we can terminate the full tree.
        cmd.process_group(0);
    }
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        // silent_command sets CREATE_NO_WINDOW, but creation_flags replaces it.
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(source) => {
            inner.state = ProcessState::Failed;
            return Err(SupervisorError::SpawnError {
                path: command.program.clone(),
                source,
            });
        }
    };

    let pid = child.id();
    if let Some(stdout) = child.stdout.take() {
        spawn_drain_thread(stdout, OutputStream::Stdout, supervisor.output.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_drain_thread(stderr, OutputStream::Stderr, supervisor.output.clone());
    }

    inner.child = Some(child);
    inner.pid = Some(pid);
    inner.port = Some(port);
    inner.state = ProcessState::Running;
    log::info!("Backend process spawned with PID {pid} on port {port}");
    Ok(pid)
}

/// Launch the backend on the given port and start watching it.
pub fn launch(app: &AppHandle, port: u16) -> Result<u32, SupervisorError> {
    let supervisor = app.state::<BackendSupervisor>();
    let command = resolve_backend_command(app)?;
    log::info!(
        "Starting backend: {} {:?} (cwd {})",
        command.program.display(),
        command.args,
        command.working_dir.display()
    );
    let pid = spawn_supervised(&supervisor, &command, port)?;
    platform::track_backend_pid(pid);
    write_pid_file(app, pid, port);
    spawn_exit_watcher(app.clone());
    Ok(pid)
}

/// One poll of the exit watcher. Returns false when watching should stop.
fn poll_backend_exit(app: &AppHandle) -> bool {
    let supervisor = app.state::<BackendSupervisor>();
    let mut inner = supervisor.lock_inner();
    let Some(child) = inner.child.as_mut() else {
        return false;
    };
    match child.try_wait() {
        Ok(None) => true,
        Ok(Some(status)) => {
            if matches!(
                inner.state,
                ProcessState::Launching | ProcessState::Running
            ) {
                let code = status.code();
                inner.state = ProcessState::Failed;
                log::error!("Backend process exited unexpectedly with code {code:?}");
                drop(inner);
                bridge::emit(app, &OutboundMessage::BackendExit { code });
            }
            false
        }
        Err(e) => {
            log::warn!("Failed to poll backend process: {e}");
            false
        }
    }
}

/// Watch for an unexpected backend exit. A spawn failure is reported by
/// `launch` itself; this catches the process dying later.
fn spawn_exit_watcher(app: AppHandle) {
    std::thread::spawn(move || loop {
        std::thread::sleep(Duration::from_millis(500));
        if !poll_backend_exit(&app) {
            break;
        }
    });
}

/// Force-terminate the backend tree. Idempotent: calling this twice, or
/// on a process that never started, is a no-op. Failures are logged and
/// swallowed so shutdown can always complete.
pub fn terminate(supervisor: &BackendSupervisor) {
    let mut inner = supervisor.lock_inner();
    match inner.state {
        ProcessState::Unstarted | ProcessState::Terminating | ProcessState::Terminated => return,
        ProcessState::Failed => {
            // Already exited; just reap the child if it is still around.
            if let Some(child) = inner.child.as_mut() {
                let _ = child.wait();
            }
            return;
        }
        ProcessState::Launching | ProcessState::Running => {}
    }

    let Some(pid) = inner.pid else {
        inner.state = ProcessState::Terminated;
        return;
    };

    inner.state = ProcessState::Terminating;
    log::info!("Terminating backend process tree (PID {pid})");

    if let Err(e) = platform::kill_process_tree(pid) {
        log::warn!("Tree kill failed for PID {pid}: {e}");
        if let Err(e) = platform::kill_process(pid) {
            log::warn!("Direct kill failed for PID {pid}: {e}");
        }
    }

    if let Some(child) = inner.child.as_mut() {
        // Fallback direct child kill in case tree-kill is unsupported, then reap.
        let _ = child.kill();
        let _ = child.wait();
    }

    inner.state = ProcessState::Terminated;
    log::info!("Backend process terminated");
}

/// Shutdown entry point used by every exit trigger.
pub fn shutdown(app: &AppHandle) {
    let supervisor = app.state::<BackendSupervisor>();
    terminate(&supervisor);
    platform::clear_tracked_pid();
    remove_pid_file(app);
}

// ---------------------------------------------------------------------------
// PID file for crash-recovery cleanup
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct BackendPidRecord {
    shell_pid: u32,
    backend_pid: u32,
    port: u16,
}

fn pid_file_path(app: &AppHandle) -> Option<PathBuf> {
    app.path()
        .app_data_dir()
        .ok()
        .map(|d| d.join("backend.pid"))
}

fn write_pid_file(app: &AppHandle, backend_pid: u32, port: u16) {
    let Some(path) = pid_file_path(app) else { return };
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let record = BackendPidRecord {
        shell_pid: std::process::id(),
        backend_pid,
        port,
    };
    if let Ok(json) = serde_json::to_string(&record) {
        let _ = std::fs::write(&path, json);
    }
}

fn remove_pid_file(app: &AppHandle) {
    if let Some(path) = pid_file_path(app) {
        let _ = std::fs::remove_file(path);
    }
}

async fn is_healthy(client: &reqwest::Client, port: u16) -> bool {
    let url = format!("http://127.0.0.1:{port}/api/health");
    client
        .get(url)
        .timeout(Duration::from_millis(1200))
        .send()
        .await
        .map(|r| r.status().is_success())
        .unwrap_or(false)
}

/// Kill an orphaned backend left behind by a previous shell crash.
/// Call once at startup, before drawing a port lease.
pub async fn cleanup_orphaned_backend(app: &AppHandle, client: &reqwest::Client) {
    let Some(path) = pid_file_path(app) else { return };

    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(_) => return, // No PID file, nothing to clean up
    };

    let record: BackendPidRecord = match serde_json::from_str(&content) {
        Ok(r) => r,
        Err(_) => {
            let _ = std::fs::remove_file(&path);
            return;
        }
    };

    // If the shell instance that spawned the backend is still alive, leave it alone.
    if platform::is_process_alive(record.shell_pid) {
        log::debug!(
            "PID file exists but shell PID {} is still alive, another instance owns the backend",
            record.shell_pid
        );
        return;
    }

    // The shell is dead. Require the backend to be alive AND healthy on the
    // recorded port before killing; the health check guards against PID
    // recycling, an unrelated process won't answer the probe.
    if platform::is_process_alive(record.backend_pid) && is_healthy(client, record.port).await {
        log::info!(
            "Killing orphaned backend (PID {}) from crashed shell (PID {})",
            record.backend_pid,
            record.shell_pid
        );
        let _ = platform::kill_process_tree(record.backend_pid);
        tokio::time::sleep(Duration::from_millis(300)).await;
        if is_healthy(client, record.port).await {
            log::warn!("Backend still healthy after tree kill, trying direct kill");
            let _ = platform::kill_process(record.backend_pid);
        }
    } else {
        log::debug!(
            "Stale PID file (backend PID {} not alive or not healthy), cleaning up",
            record.backend_pid
        );
    }

    let _ = std::fs::remove_file(&path);
}

// ---------------------------------------------------------------------------
// Status commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub port: Option<u16>,
}

#[tauri::command]
pub async fn get_backend_status(
    supervisor: State<'_, BackendSupervisor>,
) -> Result<BackendStatus, String> {
    let inner = supervisor.lock_inner();
    Ok(BackendStatus {
        state: inner.state,
        pid: inner.pid,
        port: inner.port,
    })
}

#[tauri::command]
pub async fn get_backend_output(
    supervisor: State<'_, BackendSupervisor>,
) -> Result<Vec<OutputLine>, String> {
    let output = supervisor
        .output
        .lock()
        .map_err(|e| format!("Output log lock error: {e}"))?;
    Ok(output.iter().cloned().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_with_missing_path_fails_before_spawn() {
        let err = override_command_from("/definitely/not/a/real/backend")
            .expect_err("missing executable must be rejected");
        assert!(matches!(err, SupervisorError::ExecutableNotFound { .. }));
    }

    #[test]
    fn override_uses_parent_as_working_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exe = dir.path().join("app");
        std::fs::write(&exe, b"#!/bin/sh\n").expect("write");
        let command =
            override_command_from(exe.to_str().expect("utf8 path")).expect("existing path");
        assert_eq!(command.working_dir, dir.path());
        assert!(command.args.is_empty());
    }

    #[test]
    fn output_ring_is_bounded() {
        let buffer = Arc::new(Mutex::new(VecDeque::new()));
        for i in 0..(OUTPUT_LOG_CAPACITY + 10) {
            push_output_line(&buffer, OutputStream::Stdout, format!("line {i}"));
        }
        let buffer = buffer.lock().expect("lock");
        assert_eq!(buffer.len(), OUTPUT_LOG_CAPACITY);
        assert_eq!(buffer.front().expect("front").line, "line 10");
        assert_eq!(
            buffer.back().expect("back").line,
            format!("line {}", OUTPUT_LOG_CAPACITY + 9)
        );
    }

    #[test]
    fn terminate_before_launch_is_a_noop() {
        let supervisor = BackendSupervisor::default();
        terminate(&supervisor);
        terminate(&supervisor);
        assert_eq!(supervisor.state(), ProcessState::Unstarted);
    }

    #[cfg(unix)]
    fn sleep_command() -> BackendCommand {
        BackendCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), "sleep 30".to_string()],
            working_dir: PathBuf::from("."),
        }
    }

    #[cfg(unix)]
    #[test]
    fn terminate_is_idempotent() {
        let supervisor = BackendSupervisor::default();
        let pid = spawn_supervised(&supervisor, &sleep_command(), 5001).expect("spawn");
        assert_eq!(supervisor.state(), ProcessState::Running);
        assert_eq!(supervisor.port(), Some(5001));

        terminate(&supervisor);
        assert_eq!(supervisor.state(), ProcessState::Terminated);
        assert!(!platform::is_process_alive(pid));

        // Second invocation must not error or change the end state.
        terminate(&supervisor);
        assert_eq!(supervisor.state(), ProcessState::Terminated);
    }

    #[cfg(unix)]
    #[test]
    fn second_launch_while_running_is_rejected() {
        let supervisor = BackendSupervisor::default();
        spawn_supervised(&supervisor, &sleep_command(), 5002).expect("spawn");
        let err = spawn_supervised(&supervisor, &sleep_command(), 5003)
            .expect_err("double launch must fail");
        assert!(matches!(err, SupervisorError::AlreadyRunning));
        terminate(&supervisor);
    }

    #[cfg(unix)]
    #[test]
    fn spawn_failure_marks_failed() {
        let supervisor = BackendSupervisor::default();
        let command = BackendCommand {
            program: PathBuf::from("/definitely/not/a/real/backend"),
            args: Vec::new(),
            working_dir: PathBuf::from("."),
        };
        let err = spawn_supervised(&supervisor, &command, 5004).expect_err("spawn must fail");
        assert!(matches!(err, SupervisorError::SpawnError { .. }));
        assert_eq!(supervisor.state(), ProcessState::Failed);
    }
}
