//! Streaming run session: consumes the backend's run event-stream,
//! maintains the capped output buffer, and handles user cancellation.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use tauri::{AppHandle, Manager, State};
use tokio::sync::oneshot;

use crate::backend::BackendSupervisor;
use crate::bridge::{self, OutboundMessage};

/// Hard ceiling for the accumulated output buffer.
pub const BUFFER_CAP: usize = 10_000;
/// Size the buffer is cut back to (marker included) once the cap is hit.
pub const BUFFER_RETAIN: usize = 8_000;
pub const TRUNCATION_MARKER: &str = "[... earlier output truncated ...]\n";

const COMPLETION_MARKER: &str = "Captioning completed.";
const CANCELLED_NOTICE: &str = "Captioning cancelled by user.";
const CONNECTION_LOST: &str = "connection lost";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed { reason: String },
}

/// Accumulating output with front truncation at line boundaries.
#[derive(Debug, Default, Clone)]
pub struct OutputBuffer {
    text: String,
}

impl OutputBuffer {
    pub fn push_line(&mut self, line: &str) {
        self.text.push_str(line);
        if !line.ends_with('\n') {
            self.text.push('\n');
        }
        self.enforce_cap();
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Cut the buffer back from the front once it exceeds the cap,
    /// keeping the most recent output. The cut lands on a line boundary
    /// when one exists so no partial line is displayed, and the
    /// truncation marker appears exactly once at the start.
    fn enforce_cap(&mut self) {
        if self.text.len() <= BUFFER_CAP {
            return;
        }

        let body = self
            .text
            .strip_prefix(TRUNCATION_MARKER)
            .unwrap_or(&self.text);
        let budget = BUFFER_RETAIN - TRUNCATION_MARKER.len();

        let mut cut_from = body.len().saturating_sub(budget);
        while !body.is_char_boundary(cut_from) {
            cut_from += 1;
        }

        let tail_start = match body[cut_from..].find('\n') {
            // Drop the partial line the cut landed in.
            Some(i) if cut_from + i + 1 < body.len() => cut_from + i + 1,
            // One enormous line; keep the char-aligned tail of it.
            _ => cut_from,
        };

        let tail = body[tail_start..].to_string();
        self.text = format!("{TRUNCATION_MARKER}{tail}");
    }
}

#[derive(Debug)]
struct Session {
    state: RunState,
    buffer: OutputBuffer,
    frames_seen: u64,
    cancel: Option<oneshot::Sender<()>>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            state: RunState::Idle,
            buffer: OutputBuffer::default(),
            frames_seen: 0,
            cancel: None,
        }
    }
}

impl Session {
    /// Flip a running session to Cancelled, appending the user-visible
    /// notice exactly once. Returns false if the session was not running.
    fn mark_cancelled(&mut self) -> bool {
        if self.state != RunState::Running {
            return false;
        }
        self.buffer.push_line(CANCELLED_NOTICE);
        self.state = RunState::Cancelled;
        self.cancel = None;
        true
    }
}

#[derive(Debug, Default)]
pub struct RunSessionState {
    inner: Mutex<Session>,
}

impl RunSessionState {
    fn lock(&self) -> MutexGuard<'_, Session> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Run session lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Frame classification
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum Frame<'a> {
    Started(&'a str),
    Complete,
    Error(&'a str),
    Keepalive,
    Output(&'a str),
}

fn classify_frame(data: &str) -> Frame<'_> {
    if let Some(msg) = data.strip_prefix("[STARTED]") {
        Frame::Started(msg)
    } else if data.starts_with("[COMPLETE]") {
        Frame::Complete
    } else if let Some(msg) = data.strip_prefix("[ERROR]") {
        Frame::Error(msg)
    } else if data.starts_with("[KEEPALIVE]") {
        Frame::Keepalive
    } else {
        Frame::Output(data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FrameOutcome {
    Continue,
    Finished,
}

fn apply_frame(session: &mut Session, data: &str) -> FrameOutcome {
    session.frames_seen += 1;
    match classify_frame(data) {
        Frame::Started(msg) => {
            session.buffer.push_line(msg);
            FrameOutcome::Continue
        }
        Frame::Complete => {
            session.buffer.push_line(COMPLETION_MARKER);
            session.state = RunState::Completed;
            FrameOutcome::Finished
        }
        Frame::Error(msg) => {
            session.state = RunState::Failed {
                reason: msg.to_string(),
            };
            FrameOutcome::Finished
        }
        Frame::Keepalive => FrameOutcome::Continue,
        Frame::Output(line) => {
            session.buffer.push_line(line);
            FrameOutcome::Continue
        }
    }
}

/// Extract the payload of an SSE `data:` line; every other field
/// (comments, event names, ids) is ignored.
fn sse_data(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("data:")?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

// ---------------------------------------------------------------------------
// Stream consumption
// ---------------------------------------------------------------------------

fn process_frame(app: &AppHandle, data: &str) -> FrameOutcome {
    let session_state = app.state::<RunSessionState>();
    let mut session = session_state.lock();

    let keepalive = matches!(classify_frame(data), Frame::Keepalive);
    let outcome = apply_frame(&mut session, data);
    if outcome == FrameOutcome::Finished {
        session.cancel = None;
    }
    let buffer = session.buffer.as_str().to_string();
    let state = session.state.clone();
    drop(session);

    if !keepalive {
        bridge::emit(app, &OutboundMessage::RunOutput { buffer });
    }
    if outcome == FrameOutcome::Finished {
        log::info!("Run session finished: {state:?}");
        bridge::emit(app, &OutboundMessage::RunState { state });
    }
    outcome
}

fn fail_session(app: &AppHandle, reason: String) {
    let session_state = app.state::<RunSessionState>();
    let mut session = session_state.lock();
    if session.state != RunState::Running {
        return;
    }
    log::error!("Run session failed: {reason}");
    session.state = RunState::Failed { reason };
    session.cancel = None;
    let state = session.state.clone();
    drop(session);
    bridge::emit(app, &OutboundMessage::RunState { state });
}

fn cancel_session(app: &AppHandle) {
    let session_state = app.state::<RunSessionState>();
    let mut session = session_state.lock();
    if !session.mark_cancelled() {
        return;
    }
    let buffer = session.buffer.as_str().to_string();
    let state = session.state.clone();
    drop(session);
    log::info!("Run session cancelled by user");
    bridge::emit(app, &OutboundMessage::RunOutput { buffer });
    bridge::emit(app, &OutboundMessage::RunState { state });
}

/// Consume the run event-stream until a terminal frame, a transport
/// error, or user cancellation. Suspension points: the next stream
/// chunk and the cancel signal.
async fn stream_run(app: AppHandle, port: u16, mut cancel_rx: oneshot::Receiver<()>) {
    let url = format!("http://127.0.0.1:{port}/api/run/stream");

    let client = match reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            fail_session(&app, format!("failed to build HTTP client: {e}"));
            return;
        }
    };

    let response = match client.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => resp,
        Ok(resp) => {
            fail_session(&app, format!("run stream returned status {}", resp.status()));
            return;
        }
        Err(e) => {
            log::error!("Run stream connection failed: {e}");
            fail_session(&app, CONNECTION_LOST.to_string());
            return;
        }
    };

    let mut stream = response.bytes_stream();
    let mut pending = String::new();

    loop {
        tokio::select! {
            // Stop already acknowledged by the backend; force-close client-side.
            _ = &mut cancel_rx => {
                cancel_session(&app);
                return;
            }
            chunk = stream.next() => match chunk {
                Some(Ok(bytes)) => {
                    pending.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(pos) = pending.find('\n') {
                        let line: String = pending.drain(..=pos).collect();
                        let line = line.trim_end_matches(['\r', '\n']);
                        let Some(data) = sse_data(line) else { continue };
                        if process_frame(&app, data) == FrameOutcome::Finished {
                            return;
                        }
                    }
                }
                Some(Err(e)) => {
                    log::error!("Run stream transport error: {e}");
                    fail_session(&app, CONNECTION_LOST.to_string());
                    return;
                }
                None => {
                    log::warn!("Run stream ended without a completion frame");
                    fail_session(&app, CONNECTION_LOST.to_string());
                    return;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub state: RunState,
    pub buffer: String,
    pub frames_seen: u64,
}

#[tauri::command]
pub async fn start_run(
    app: AppHandle,
    supervisor: State<'_, BackendSupervisor>,
    session_state: State<'_, RunSessionState>,
) -> Result<(), String> {
    let port = supervisor
        .port()
        .ok_or("Backend is not running".to_string())?;

    let (cancel_tx, cancel_rx) = oneshot::channel();
    {
        let mut session = session_state.lock();
        if session.state == RunState::Running {
            return Err("A captioning run is already in progress".to_string());
        }
        // A new run replaces whatever the previous session left behind.
        *session = Session::default();
        session.state = RunState::Running;
        session.cancel = Some(cancel_tx);
    }

    bridge::emit(
        &app,
        &OutboundMessage::RunState {
            state: RunState::Running,
        },
    );
    bridge::emit(
        &app,
        &OutboundMessage::RunOutput {
            buffer: String::new(),
        },
    );

    log::info!("Run session started against port {port}");
    tauri::async_runtime::spawn(stream_run(app.clone(), port, cancel_rx));
    Ok(())
}

#[tauri::command]
pub async fn stop_run(
    supervisor: State<'_, BackendSupervisor>,
    session_state: State<'_, RunSessionState>,
) -> Result<(), String> {
    {
        let session = session_state.lock();
        if session.state != RunState::Running {
            return Err("No captioning run is in progress".to_string());
        }
    }

    let port = supervisor
        .port()
        .ok_or("Backend is not running".to_string())?;
    let url = format!("http://127.0.0.1:{port}/api/stop");

    // If the stop request fails the session stays Running and the stream
    // stays open; the job may still be progressing server-side.
    let client = reqwest::Client::new();
    let response = client
        .post(&url)
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .map_err(|e| format!("Stop request failed: {e}"))?;
    if !response.status().is_success() {
        return Err(format!("Stop request failed: status {}", response.status()));
    }

    let cancel = session_state.lock().cancel.take();
    if let Some(cancel) = cancel {
        let _ = cancel.send(());
    }
    log::info!("Stop acknowledged by backend, closing run stream");
    Ok(())
}

#[tauri::command]
pub async fn get_run_state(
    session_state: State<'_, RunSessionState>,
) -> Result<RunSnapshot, String> {
    let session = session_state.lock();
    Ok(RunSnapshot {
        state: session.state.clone(),
        buffer: session.buffer.as_str().to_string(),
        frames_seen: session.frames_seen,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_session() -> Session {
        let mut session = Session::default();
        session.state = RunState::Running;
        session
    }

    #[test]
    fn new_session_is_idle() {
        assert_eq!(Session::default().state, RunState::Idle);
    }

    #[test]
    fn classifies_control_prefixes() {
        assert_eq!(classify_frame("[STARTED]init"), Frame::Started("init"));
        assert_eq!(classify_frame("[COMPLETE]"), Frame::Complete);
        assert_eq!(classify_frame("[ERROR]boom"), Frame::Error("boom"));
        assert_eq!(classify_frame("[KEEPALIVE]"), Frame::Keepalive);
        assert_eq!(
            classify_frame("processing image 3/10"),
            Frame::Output("processing image 3/10")
        );
    }

    #[test]
    fn sse_data_lines_only() {
        assert_eq!(sse_data("data: hello"), Some("hello"));
        assert_eq!(sse_data("data:hello"), Some("hello"));
        assert_eq!(sse_data(": keepalive comment"), None);
        assert_eq!(sse_data("event: message"), None);
        assert_eq!(sse_data(""), None);
    }

    #[test]
    fn started_then_complete_reaches_completed() {
        let mut session = running_session();
        assert_eq!(apply_frame(&mut session, "[STARTED]init"), FrameOutcome::Continue);
        assert_eq!(session.state, RunState::Running);
        assert_eq!(apply_frame(&mut session, "[COMPLETE]"), FrameOutcome::Finished);
        assert_eq!(session.state, RunState::Completed);
        assert!(session.buffer.as_str().contains("init"));
        assert!(session.buffer.as_str().contains(COMPLETION_MARKER));
        assert_eq!(session.frames_seen, 2);
    }

    #[test]
    fn error_frame_records_reason_without_buffering_it() {
        let mut session = running_session();
        apply_frame(&mut session, "some output");
        assert_eq!(
            apply_frame(&mut session, "[ERROR]model crashed"),
            FrameOutcome::Finished
        );
        assert_eq!(
            session.state,
            RunState::Failed {
                reason: "model crashed".to_string()
            }
        );
        assert!(!session.buffer.as_str().contains("model crashed"));
    }

    #[test]
    fn keepalive_is_discarded() {
        let mut session = running_session();
        apply_frame(&mut session, "[KEEPALIVE]");
        assert!(session.buffer.is_empty());
        assert_eq!(session.state, RunState::Running);
        assert_eq!(session.frames_seen, 1);
    }

    #[test]
    fn cancellation_appends_exactly_one_notice() {
        let mut session = running_session();
        apply_frame(&mut session, "line one");

        assert!(session.mark_cancelled());
        assert_eq!(session.state, RunState::Cancelled);
        assert_eq!(
            session.buffer.as_str().matches(CANCELLED_NOTICE).count(),
            1
        );

        // A second cancellation is a no-op.
        assert!(!session.mark_cancelled());
        assert_eq!(
            session.buffer.as_str().matches(CANCELLED_NOTICE).count(),
            1
        );
    }

    #[test]
    fn buffer_truncates_from_the_front_at_a_line_boundary() {
        let mut buffer = OutputBuffer::default();
        let mut pushed = 0usize;
        let mut i = 0usize;
        let mut last_chunk_len = 0;
        while pushed < 12_000 {
            let line = format!("line {i:04} {}", "x".repeat(90));
            last_chunk_len = line.len() + 1;
            pushed += last_chunk_len;
            buffer.push_line(&line);
            i += 1;
        }

        assert!(buffer.len() <= BUFFER_RETAIN + last_chunk_len);
        assert!(buffer.as_str().starts_with(TRUNCATION_MARKER));
        assert_eq!(
            buffer.as_str().matches(TRUNCATION_MARKER).count(),
            1,
            "marker must appear exactly once"
        );

        // No partial line after the marker: the first retained line must
        // be a full "line NNNN ..." line.
        let after_marker = &buffer.as_str()[TRUNCATION_MARKER.len()..];
        assert!(after_marker.starts_with("line "), "partial line retained");
        // Most recent output is preserved.
        assert!(buffer.as_str().contains(&format!("line {:04}", i - 1)));
    }

    #[test]
    fn repeated_truncation_keeps_a_single_marker() {
        let mut buffer = OutputBuffer::default();
        for i in 0..1000 {
            buffer.push_line(&format!("entry {i:05} {}", "y".repeat(40)));
        }
        assert!(buffer.len() <= BUFFER_RETAIN);
        assert_eq!(buffer.as_str().matches(TRUNCATION_MARKER).count(), 1);
        assert!(buffer.as_str().contains("entry 00999"));
        assert!(!buffer.as_str().contains("entry 00000"));
    }

    #[test]
    fn single_oversized_line_is_cut_without_a_boundary() {
        let mut buffer = OutputBuffer::default();
        buffer.push_line(&"z".repeat(15_000));
        assert!(buffer.len() <= BUFFER_RETAIN);
        assert!(buffer.as_str().starts_with(TRUNCATION_MARKER));
        assert!(buffer.as_str().ends_with("z\n"));
    }
}
