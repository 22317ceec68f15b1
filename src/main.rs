#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

#[cfg(windows)]
mod message_window;

use anyhow::Result;
use claritylayer::{log_info, Config};

struct Args {
    stream_logs: bool,
    safe_mode: bool,
    enable: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let has = |flag: &str| args.iter().any(|a| a == flag);
        Self {
            stream_logs: has("--stream-logs"),
            safe_mode: has("--safe-mode"),
            enable: has("--enable"),
        }
    }
}

fn main() -> Result<()> {
    let result = run_app();
    let _ = claritylayer_core::logger::finalize_logs();
    result
}

fn start_logging(args: &Args) -> Result<(Config, claritylayer::AppConfig)> {
    let config_store = Config::new()?;
    let config = config_store.load()?;
    if !config_store.config_path().exists() {
        config_store.save(&config)?;
    }

    let stream = args.stream_logs || config.stream_logs;
    claritylayer_core::logger::init_logger(
        config_store.logs_dir.clone(),
        "claritylayer",
        config.log_retention_count,
        stream,
    )?;

    log_info!("=== Clarity Layer Starting ===");
    if let Some(log_path) = claritylayer_core::logger::get_log_path() {
        log_info!("Log file: {}", log_path.display());
    }
    if stream {
        log_info!("Streaming mode enabled");
    } else {
        log_info!("Buffered mode - logs will be written to file on exit");
    }
    Ok((config_store, config))
}

#[cfg(not(windows))]
fn run_app() -> Result<()> {
    let args = Args::parse();
    let _ = start_logging(&args)?;
    claritylayer::log_error!("Clarity Layer only runs on Windows; nothing to do on this platform");
    Ok(())
}

#[cfg(windows)]
fn run_app() -> Result<()> {
    use anyhow::Context;
    use claritylayer::controller::ControllerOptions;
    use claritylayer::events::{HookKind, HookRegistry};
    use claritylayer::guard::{safe_mode_requested, Watchdog};
    use claritylayer::{log_warn, platform, StateManager};
    use std::sync::Arc;
    use std::time::Duration;
    use windows::Win32::UI::WindowsAndMessaging::{DispatchMessageW, PeekMessageW, TranslateMessage, MSG, PM_REMOVE, WM_QUIT};

    let args = Args::parse();
    let (config_store, config) = start_logging(&args)?;

    platform::prepare_process();

    let state = Arc::new(StateManager::open(&config_store.app_data_dir)?);
    let options = ControllerOptions::from_config(&config, Some(config_store.sounds_dir.clone()));
    let controller = platform::windows(&config, options)
        .context("Failed to start the overlay")?
        .with_state(Arc::clone(&state));

    let _watchdog = Watchdog::spawn(Arc::clone(controller.guard()))?;

    let safe_mode = safe_mode_requested(args.safe_mode);
    controller.guard().startup_check(safe_mode);

    let restore = config.restore_enabled_on_launch && state.read(|s| s.enhancement_enabled);
    if !safe_mode && (args.enable || restore) {
        log_info!("Enabling effects at launch");
        if let Err(e) = controller.enable(true) {
            log_warn!("Could not enable effects at launch: {}", e);
        }
    }

    let hooks = HookRegistry::new();
    let hook = hooks.install(HookKind::Display, controller.event_sender())?;
    let _window = message_window::MessageWindow::create(hook)?;

    log_info!("Entering main event loop");
    'main: loop {
        unsafe {
            let mut msg = MSG::default();
            while PeekMessageW(&mut msg, None, 0, 0, PM_REMOVE).as_bool() {
                if msg.message == WM_QUIT {
                    log_info!("WM_QUIT received, exiting");
                    break 'main;
                }
                let _ = TranslateMessage(&msg);
                DispatchMessageW(&msg);
            }
        }

        controller.pump_events();
        spin_sleep::sleep(Duration::from_millis(16));
    }

    controller.shutdown();
    log_info!("=== Clarity Layer Stopped ===");
    Ok(())
}
