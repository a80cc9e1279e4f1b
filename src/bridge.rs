//! Capability-restricted message bridge between the shell and the webview.
//!
//! Every message crossing to or from the presentation layer travels on a
//! named channel that must appear in the allow-list for its direction;
//! anything else is dropped without error. Handlers only ever see decoded
//! application data, never the transport event envelope.

use std::collections::HashSet;
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde_json::json;
use tauri::{AppHandle, Emitter, Listener};

use crate::run_session::RunState;

/// Channels the shell may emit to the webview.
pub const OUTBOUND_CHANNELS: &[&str] = &[
    "set-api-port",
    "checking-for-update",
    "update-available",
    "update-not-available",
    "download-progress",
    "update-downloaded",
    "update-error",
    "run-output",
    "run-state",
    "backend-exit",
];

/// Channels the webview may send to the shell.
pub const INBOUND_CHANNELS: &[&str] = &[
    "check-for-updates",
    "download-update",
    "quit-and-install",
];

static OUTBOUND_SET: Lazy<HashSet<&'static str>> =
    Lazy::new(|| OUTBOUND_CHANNELS.iter().copied().collect());
static INBOUND_SET: Lazy<HashSet<&'static str>> =
    Lazy::new(|| INBOUND_CHANNELS.iter().copied().collect());

pub fn outbound_allowed(channel: &str) -> bool {
    OUTBOUND_SET.contains(channel)
}

pub fn inbound_allowed(channel: &str) -> bool {
    INBOUND_SET.contains(channel)
}

/// One message to the presentation layer. Each variant maps to exactly
/// one outbound channel and an explicit payload schema.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    SetApiPort { port: u16 },
    CheckingForUpdate,
    UpdateAvailable { version: String, notes: Option<String> },
    UpdateNotAvailable,
    DownloadProgress { percent: f64 },
    UpdateDownloaded { version: String },
    UpdateError { message: String },
    RunOutput { buffer: String },
    RunState { state: RunState },
    BackendExit { code: Option<i32> },
}

impl OutboundMessage {
    pub fn channel(&self) -> &'static str {
        match self {
            Self::SetApiPort { .. } => "set-api-port",
            Self::CheckingForUpdate => "checking-for-update",
            Self::UpdateAvailable { .. } => "update-available",
            Self::UpdateNotAvailable => "update-not-available",
            Self::DownloadProgress { .. } => "download-progress",
            Self::UpdateDownloaded { .. } => "update-downloaded",
            Self::UpdateError { .. } => "update-error",
            Self::RunOutput { .. } => "run-output",
            Self::RunState { .. } => "run-state",
            Self::BackendExit { .. } => "backend-exit",
        }
    }

    fn payload(&self) -> serde_json::Value {
        match self {
            Self::SetApiPort { port } => json!({ "port": port }),
            Self::CheckingForUpdate => json!({}),
            Self::UpdateAvailable { version, notes } => {
                json!({ "version": version, "notes": notes })
            }
            Self::UpdateNotAvailable => json!({}),
            Self::DownloadProgress { percent } => json!({ "percent": percent }),
            Self::UpdateDownloaded { version } => json!({ "version": version }),
            Self::UpdateError { message } => json!({ "message": message }),
            Self::RunOutput { buffer } => json!({ "buffer": buffer }),
            Self::RunState { state } => json!({ "state": state }),
            Self::BackendExit { code } => json!({ "code": code }),
        }
    }
}

/// Emit a message to the webview. Messages on a channel missing from the
/// outbound allow-list are dropped silently; this is a security boundary,
/// not a debugging aid.
pub fn emit(app: &AppHandle, message: &OutboundMessage) {
    let channel = message.channel();
    if !outbound_allowed(channel) {
        log::trace!("Dropping message on unlisted outbound channel {channel}");
        return;
    }
    if let Err(e) = app.emit(channel, message.payload()) {
        log::error!("Failed to emit {channel}: {e}");
    }
}

/// One control command from the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundCommand {
    CheckForUpdates,
    DownloadUpdate,
    QuitAndInstall,
}

impl InboundCommand {
    pub fn from_channel(channel: &str) -> Option<Self> {
        match channel {
            "check-for-updates" => Some(Self::CheckForUpdates),
            "download-update" => Some(Self::DownloadUpdate),
            "quit-and-install" => Some(Self::QuitAndInstall),
            _ => None,
        }
    }
}

/// Register listeners for the inbound allow-list. Unlisted channels never
/// get a listener, so messages on them produce no callback and no error.
/// The handler receives the decoded command only; the event envelope
/// (ids, raw payload) is deliberately stripped.
pub fn listen_inbound<F>(app: &AppHandle, handler: F)
where
    F: Fn(&AppHandle, InboundCommand) + Send + Sync + 'static,
{
    let handler = Arc::new(handler);
    for channel in INBOUND_CHANNELS {
        let Some(command) = InboundCommand::from_channel(channel) else {
            continue;
        };
        let app_handle = app.clone();
        let handler = handler.clone();
        app.listen(*channel, move |_event| {
            log::debug!("Bridge command received: {command:?}");
            handler(&app_handle, command);
        });
    }
}
