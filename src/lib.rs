use tauri::{AppHandle, Manager};
use tauri_plugin_dialog::{DialogExt, MessageDialogKind};

mod backend;
mod bridge;
mod platform;
mod run_session;
mod settings;
mod updater;

use backend::SupervisorError;
use bridge::OutboundMessage;

/// Bring the backend up: cleanup, port lease, spawn, health gate, then
/// announce the port to the webview. Any failure here is fatal to startup.
async fn start_backend_stack(app: AppHandle) -> Result<(), SupervisorError> {
    let settings = settings::load_or_default(&app);
    let client = reqwest::Client::new();

    // Kill any backend a crashed previous instance left behind.
    backend::cleanup_orphaned_backend(&app, &client).await;

    let port = backend::port::allocate(settings.port_range_start, settings.port_range_end)?;
    backend::launch(&app, port)?;

    // Loopback literal, not a hostname: no resolver in the startup path.
    let probe_url = format!("http://127.0.0.1:{port}/api/health");
    backend::health::await_ready(&client, &probe_url, &settings.health_gate()).await?;

    bridge::emit(&app, &OutboundMessage::SetApiPort { port });
    log::info!("Backend ready on port {port}");
    Ok(())
}

/// Startup failures are never retried: tell the user where the logs are,
/// then exit.
fn fail_startup(app: &AppHandle, error: &SupervisorError) {
    log::error!("Fatal startup error: {error}");
    backend::shutdown(app);

    let log_dir = app
        .path()
        .app_log_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "the application log directory".to_string());

    app.dialog()
        .message(format!(
            "Failed to start the captioning backend.\n\nPlease check the logs at:\n{log_dir}\n\nError: {error}"
        ))
        .title("Startup Error")
        .kind(MessageDialogKind::Error)
        .blocking_show();

    app.exit(1);
}

#[tauri::command]
async fn open_log_directory(app: AppHandle) -> Result<(), String> {
    use tauri_plugin_opener::OpenerExt;

    let log_dir = app
        .path()
        .app_log_dir()
        .map_err(|e| format!("Failed to resolve log directory: {e}"))?;
    app.opener()
        .open_path(log_dir.to_string_lossy().to_string(), None::<String>)
        .map_err(|e| format!("Failed to open log directory: {e}"))
}

#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    // Kill the backend even if the shell dies on a panic.
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        platform::emergency_kill_tracked();
        default_panic(info);
    }));

    // SIGINT/SIGTERM also take the backend tree down before we die.
    #[cfg(unix)]
    platform::install_exit_signal_handlers();

    tauri::Builder::default()
        .plugin(tauri_plugin_updater::Builder::new().build())
        .plugin(tauri_plugin_process::init())
        .plugin(
            tauri_plugin_log::Builder::new()
                // Use Debug level in development, Info in production
                .level(if cfg!(debug_assertions) {
                    log::LevelFilter::Debug
                } else {
                    log::LevelFilter::Info
                })
                // Silence noisy external crates
                .level_for("tauri_plugin_updater", log::LevelFilter::Warn)
                .level_for("reqwest", log::LevelFilter::Warn)
                .targets([
                    tauri_plugin_log::Target::new(tauri_plugin_log::TargetKind::Stdout),
                    tauri_plugin_log::Target::new(tauri_plugin_log::TargetKind::Webview),
                    tauri_plugin_log::Target::new(tauri_plugin_log::TargetKind::LogDir {
                        file_name: None,
                    }),
                ])
                .build(),
        )
        .plugin(tauri_plugin_dialog::init())
        .plugin(tauri_plugin_opener::init())
        .setup(|app| {
            log::info!("VLM Caption shell starting");

            app.manage(backend::BackendSupervisor::default());
            app.manage(run_session::RunSessionState::default());
            app.manage(updater::UpdateCoordinator::default());

            // Update control commands only ever arrive over the bridge.
            bridge::listen_inbound(app.handle(), updater::handle_command);

            let handle = app.handle().clone();
            tauri::async_runtime::spawn(async move {
                if let Err(e) = start_backend_stack(handle.clone()).await {
                    fail_startup(&handle, &e);
                }
            });

            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            settings::load_settings,
            settings::save_settings,
            backend::get_backend_status,
            backend::get_backend_output,
            run_session::start_run,
            run_session::stop_run,
            run_session::get_run_state,
            updater::get_update_state,
            open_log_directory,
        ])
        .build(tauri::generate_context!())
        .expect("error building tauri application")
        .run(|app_handle, event| match &event {
            tauri::RunEvent::Exit => {
                // Last chance before the host goes away: best-effort
                // synchronous kill (no-op when already terminated).
                backend::shutdown(app_handle);
            }
            tauri::RunEvent::ExitRequested { .. } => {
                backend::shutdown(app_handle);
            }
            tauri::RunEvent::WindowEvent { label, event, .. } => {
                if let tauri::WindowEvent::CloseRequested { .. } = event {
                    log::info!("Window {label} close requested, stopping backend");
                    backend::shutdown(app_handle);
                }
            }
            _ => {}
        });
}
