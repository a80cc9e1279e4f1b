//! Update coordinator: drives the updater plugin from bridge commands and
//! relays every state transition back over the bridge.

use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tauri::{AppHandle, Manager, State};
use tauri_plugin_updater::UpdaterExt;

use crate::bridge::{self, InboundCommand, OutboundMessage};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum UpdateState {
    Checking,
    Available {
        version: String,
        notes: Option<String>,
    },
    NotAvailable,
    Downloading {
        percent: f64,
    },
    Downloaded {
        version: String,
    },
    Errored {
        reason: String,
    },
}

struct PendingUpdate {
    update: tauri_plugin_updater::Update,
    bytes: Option<Vec<u8>>,
}

/// Exactly one update state is live per process lifetime; later events
/// overwrite earlier ones, no history is retained.
pub struct UpdateCoordinator {
    state: Mutex<UpdateState>,
    pending: Mutex<Option<PendingUpdate>>,
}

impl Default for UpdateCoordinator {
    fn default() -> Self {
        Self {
            state: Mutex::new(UpdateState::NotAvailable),
            pending: Mutex::new(None),
        }
    }
}

impl UpdateCoordinator {
    fn lock_state(&self) -> MutexGuard<'_, UpdateState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Update state lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn set_pending(&self, pending: PendingUpdate) {
        if let Ok(mut guard) = self.pending.lock() {
            *guard = Some(pending);
        }
    }

    fn take_pending(&self) -> Option<PendingUpdate> {
        self.pending.lock().ok().and_then(|mut guard| guard.take())
    }
}

/// Manual re-entry into Checking is allowed from every settled state;
/// a check or download already in flight is not interrupted.
fn can_start_check(state: &UpdateState) -> bool {
    !matches!(
        state,
        UpdateState::Checking | UpdateState::Downloading { .. }
    )
}

fn can_start_download(state: &UpdateState) -> bool {
    matches!(state, UpdateState::Available { .. })
}

fn outbound_for(state: &UpdateState) -> OutboundMessage {
    match state {
        UpdateState::Checking => OutboundMessage::CheckingForUpdate,
        UpdateState::Available { version, notes } => OutboundMessage::UpdateAvailable {
            version: version.clone(),
            notes: notes.clone(),
        },
        UpdateState::NotAvailable => OutboundMessage::UpdateNotAvailable,
        UpdateState::Downloading { percent } => OutboundMessage::DownloadProgress {
            percent: *percent,
        },
        UpdateState::Downloaded { version } => OutboundMessage::UpdateDownloaded {
            version: version.clone(),
        },
        UpdateState::Errored { reason } => OutboundMessage::UpdateError {
            message: reason.clone(),
        },
    }
}

/// Replace the live state and relay it verbatim over the bridge.
fn set_state(app: &AppHandle, state: UpdateState) {
    let coordinator = app.state::<UpdateCoordinator>();
    let message = outbound_for(&state);
    *coordinator.lock_state() = state;
    bridge::emit(app, &message);
}

/// Entry point for the three inbound bridge channels. All of them are
/// no-ops in development builds so local iteration never contacts the
/// update feed.
pub fn handle_command(app: &AppHandle, command: InboundCommand) {
    if cfg!(debug_assertions) {
        log::debug!("Ignoring {command:?} in development build");
        return;
    }
    match command {
        InboundCommand::CheckForUpdates => start_check(app),
        InboundCommand::DownloadUpdate => start_download(app),
        InboundCommand::QuitAndInstall => quit_and_install(app),
    }
}

fn start_check(app: &AppHandle) {
    {
        let coordinator = app.state::<UpdateCoordinator>();
        let state = coordinator.lock_state();
        if !can_start_check(&state) {
            log::debug!("Update check ignored in state {:?}", *state);
            return;
        }
    }
    set_state(app, UpdateState::Checking);

    let app = app.clone();
    tauri::async_runtime::spawn(async move {
        let updater = match app.updater() {
            Ok(updater) => updater,
            Err(e) => {
                log::error!("Updater unavailable: {e}");
                set_state(&app, UpdateState::Errored { reason: e.to_string() });
                return;
            }
        };
        match updater.check().await {
            Ok(Some(update)) => {
                let version = update.version.clone();
                let notes = update.body.clone();
                log::info!("Update available: {version}");
                app.state::<UpdateCoordinator>().set_pending(PendingUpdate {
                    update,
                    bytes: None,
                });
                set_state(&app, UpdateState::Available { version, notes });
            }
            Ok(None) => {
                log::info!("No update available");
                set_state(&app, UpdateState::NotAvailable);
            }
            Err(e) => {
                log::error!("Update check failed: {e}");
                set_state(&app, UpdateState::Errored { reason: e.to_string() });
            }
        }
    });
}

fn start_download(app: &AppHandle) {
    let pending = {
        let coordinator = app.state::<UpdateCoordinator>();
        let state = coordinator.lock_state();
        if !can_start_download(&state) {
            log::debug!("Update download ignored in state {:?}", *state);
            return;
        }
        drop(state);
        coordinator.take_pending()
    };
    let Some(PendingUpdate { update, .. }) = pending else {
        log::warn!("download-update received with no pending update");
        return;
    };

    set_state(app, UpdateState::Downloading { percent: 0.0 });

    let app = app.clone();
    tauri::async_runtime::spawn(async move {
        let progress_app = app.clone();
        let mut received: u64 = 0;
        let result = update
            .download(
                move |chunk, total| {
                    received += chunk as u64;
                    let percent = total
                        .map(|t| (received as f64 / t as f64) * 100.0)
                        .unwrap_or(0.0)
                        .min(100.0);
                    set_state(&progress_app, UpdateState::Downloading { percent });
                },
                || log::debug!("Update download finished"),
            )
            .await;

        match result {
            Ok(bytes) => {
                let version = update.version.clone();
                log::info!("Update {version} downloaded ({} bytes)", bytes.len());
                app.state::<UpdateCoordinator>().set_pending(PendingUpdate {
                    update,
                    bytes: Some(bytes),
                });
                set_state(&app, UpdateState::Downloaded { version });
            }
            Err(e) => {
                log::error!("Update download failed: {e}");
                set_state(&app, UpdateState::Errored { reason: e.to_string() });
            }
        }
    });
}

fn quit_and_install(app: &AppHandle) {
    let app = app.clone();
    // Defer past the current tick so the command acknowledgment can flush
    // before the process goes away.
    tauri::async_runtime::spawn(async move {
        tokio::task::yield_now().await;
        let pending = app.state::<UpdateCoordinator>().take_pending();
        let Some(PendingUpdate {
            update,
            bytes: Some(bytes),
        }) = pending
        else {
            log::warn!("quit-and-install received with no downloaded update");
            return;
        };
        match update.install(bytes) {
            Ok(()) => {
                log::info!("Update installed, restarting");
                app.restart();
            }
            Err(e) => {
                log::error!("Update install failed: {e}");
                set_state(&app, UpdateState::Errored { reason: e.to_string() });
            }
        }
    });
}

#[tauri::command]
pub async fn get_update_state(
    coordinator: State<'_, UpdateCoordinator>,
) -> Result<UpdateState, String> {
    Ok(coordinator.lock_state().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_states() -> Vec<UpdateState> {
        vec![
            UpdateState::Checking,
            UpdateState::Available {
                version: "1.0.1".to_string(),
                notes: None,
            },
            UpdateState::NotAvailable,
            UpdateState::Downloading { percent: 50.0 },
            UpdateState::Downloaded {
                version: "1.0.1".to_string(),
            },
            UpdateState::Errored {
                reason: "offline".to_string(),
            },
        ]
    }

    #[test]
    fn every_state_maps_to_its_outbound_channel() {
        let expected = [
            "checking-for-update",
            "update-available",
            "update-not-available",
            "download-progress",
            "update-downloaded",
            "update-error",
        ];
        for (state, channel) in all_states().iter().zip(expected) {
            assert_eq!(outbound_for(state).channel(), channel);
        }
    }

    #[test]
    fn checking_reentry_from_settled_states_only() {
        assert!(can_start_check(&UpdateState::NotAvailable));
        assert!(can_start_check(&UpdateState::Errored {
            reason: "offline".to_string()
        }));
        assert!(can_start_check(&UpdateState::Available {
            version: "1.0.1".to_string(),
            notes: None,
        }));
        assert!(can_start_check(&UpdateState::Downloaded {
            version: "1.0.1".to_string()
        }));

        assert!(!can_start_check(&UpdateState::Checking));
        assert!(!can_start_check(&UpdateState::Downloading { percent: 10.0 }));
    }

    #[test]
    fn download_requires_an_available_update() {
        for state in all_states() {
            let expected = matches!(state, UpdateState::Available { .. });
            assert_eq!(can_start_download(&state), expected, "state {state:?}");
        }
    }

    #[test]
    fn coordinator_starts_quiescent() {
        let coordinator = UpdateCoordinator::default();
        assert_eq!(*coordinator.lock_state(), UpdateState::NotAvailable);
        assert!(coordinator.take_pending().is_none());
    }
}
