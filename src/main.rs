use anyhow::{Context, Result};
use global_hotkey::GlobalHotKeyEvent;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use whispertrigger::app::{AppEvent, Controller};
use whispertrigger::audio::AudioCapture;
use whispertrigger::config::{Config, DevicePreference};
use whispertrigger::input::{HotkeyAction, HotkeyManager};
use whispertrigger::output::SystemOutput;
use whispertrigger::postprocess::PostProcessor;
use whispertrigger::transcription::worker::WorkerCommand;
use whispertrigger::transcription::{TranscriptionEngine, TranscriptionWorker};
use whispertrigger::{recordings, telemetry, transcription};

/// How often the main loop polls channels
const TICK_INTERVAL: Duration = Duration::from_millis(10);
/// How often the config file mtime is checked
const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    let force_cpu = std::env::args().any(|arg| arg == "--cpu");

    let mut config = Config::load_or_init()?;
    telemetry::init(&config.telemetry)?;
    tracing::info!("whispertrigger starting");

    if force_cpu {
        tracing::info!("--cpu flag set, accelerator disabled");
        config.model.device = DevicePreference::Cpu;
    }

    // Prune kept recordings from earlier runs
    if let Ok(dir) = recordings::recordings_dir() {
        if let Err(e) = recordings::cleanup_old_recordings(&dir, &config.recordings) {
            tracing::warn!("recording cleanup failed: {}", e);
        }
    }

    let model_path = transcription::resolve_model(config.model.size)
        .with_context(|| format!("could not resolve model '{}'", config.model.size.as_str()))?;

    let engine = TranscriptionEngine::new(
        &model_path,
        config.model.threads,
        config.model.beam_size,
        config.model.language.clone(),
        config.model.device,
    )?;

    let worker = TranscriptionWorker::spawn(
        Box::new(engine),
        PostProcessor::default(),
        config.postprocess.clone(),
    );
    let commands = worker.sender();

    let inject_paste = Arc::new(AtomicBool::new(config.output.inject_paste));
    let sink = SystemOutput::new(Arc::clone(&inject_paste));

    let capture = AudioCapture::new(config.audio.max_record_secs);
    let recordings_dir = if config.recordings.keep_recordings {
        recordings::recordings_dir().ok()
    } else {
        None
    };

    let mut controller = Controller::new(
        Box::new(capture),
        commands.clone(),
        Box::new(sink),
        &config.audio,
        recordings_dir,
    );

    let mut hotkeys = HotkeyManager::new(&config.hotkeys)?;

    let config_path = Config::config_path()?;
    let mut config_mtime = file_mtime(&config_path);
    let mut last_config_poll = Instant::now();

    tracing::info!("event loop starting (press Ctrl+C to exit)");

    let receiver = GlobalHotKeyEvent::receiver();
    'main: loop {
        // Poll for hotkey events
        while let Ok(event) = receiver.try_recv() {
            match hotkeys.resolve(&event) {
                Some(HotkeyAction::OpenSettings) => open_settings(&config_path),
                Some(HotkeyAction::Quit) => {
                    tracing::info!("quit hotkey pressed");
                    break 'main;
                }
                Some(action) => controller.handle(AppEvent::Hotkey(action)),
                None => {}
            }
        }

        // Drain completed transcriptions
        while let Some(worker_event) = worker.try_recv() {
            controller.handle(AppEvent::Worker(worker_event));
        }

        controller.handle(AppEvent::Tick);

        // Pick up edits to the config file
        if last_config_poll.elapsed() >= CONFIG_POLL_INTERVAL {
            last_config_poll = Instant::now();
            let mtime = file_mtime(&config_path);
            if mtime != config_mtime {
                config_mtime = mtime;
                reload_config(
                    &config_path,
                    &mut config,
                    force_cpu,
                    &mut hotkeys,
                    &mut controller,
                    &commands,
                    &inject_paste,
                );
            }
        }

        // Check for shutdown signal
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
            () = tokio::time::sleep(TICK_INTERVAL) => {
                // Poll interval (10ms to avoid busy-waiting)
            }
        }
    }

    worker.shutdown();
    Ok(())
}

fn file_mtime(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Apply a changed config file. A document that fails to parse or validate is
/// rejected and the running configuration stays in effect.
fn reload_config(
    path: &std::path::Path,
    config: &mut Config,
    force_cpu: bool,
    hotkeys: &mut HotkeyManager,
    controller: &mut Controller,
    commands: &std::sync::mpsc::Sender<WorkerCommand>,
    inject_paste: &Arc<AtomicBool>,
) {
    let mut new_config = Config::reload(path, config);
    if new_config == *config {
        return;
    }
    if force_cpu {
        new_config.model.device = DevicePreference::Cpu;
    }

    if new_config.hotkeys != config.hotkeys {
        if let Err(e) = hotkeys.rebind(&new_config.hotkeys) {
            tracing::warn!("hotkey rebind failed, keeping previous bindings: {}", e);
            new_config.hotkeys = config.hotkeys.clone();
        }
    }

    if new_config.postprocess != config.postprocess {
        let _ = commands.send(WorkerCommand::UpdateSettings(new_config.postprocess.clone()));
    }

    inject_paste.store(new_config.output.inject_paste, Ordering::Relaxed);
    controller.apply_config(&new_config.audio, &new_config.recordings);

    if new_config.model != config.model {
        tracing::warn!("model settings changed, restart to apply");
    }

    *config = new_config;
    tracing::info!("configuration reloaded");
}

/// Open the config file in the user's desktop editor.
fn open_settings(path: &std::path::Path) {
    match Command::new("xdg-open")
        .arg(path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(_) => tracing::info!(path = %path.display(), "opened settings"),
        Err(e) => tracing::warn!("failed to open settings: {}", e),
    }
}
