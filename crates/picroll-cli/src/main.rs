//! picroll CLI - terminal frontend for the picroll gallery cache
//!
//! Reads one command per line from stdin and polls the core snapshot to
//! report what is shown, download progress and errors.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use picroll_core::{
    CacheHandle, CacheService, CancelCategory, CoreEvent, CoreSnapshot, HttpGallery, Settings,
    TaskKind,
};
use tokio::io::{AsyncBufReadExt, BufReader};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

const HELP: &str = "commands: [n]ext, [p]revious, [s]ave, [c]ancel views, [ca]ncel all, [r]eload settings, [q]uit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Input {
    Next,
    Previous,
    Save,
    CancelViews,
    CancelAll,
    Reload,
    Quit,
    Help,
}

fn parse_input(line: &str) -> Option<Input> {
    match line.trim().to_lowercase().as_str() {
        "" | "n" | "next" => Some(Input::Next),
        "p" | "prev" | "previous" => Some(Input::Previous),
        "s" | "save" => Some(Input::Save),
        "c" | "cancel" => Some(Input::CancelViews),
        "ca" | "cancel all" => Some(Input::CancelAll),
        "r" | "reload" => Some(Input::Reload),
        "q" | "quit" | "exit" => Some(Input::Quit),
        "h" | "?" | "help" => Some(Input::Help),
        _ => None,
    }
}

fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("picroll")
        .join("settings.json")
}

fn load_settings() -> Settings {
    let path = settings_path();
    let json = match std::fs::read_to_string(&path) {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::info!("No settings at {}, using defaults", path.display());
            return Settings::default();
        }
        Err(e) => {
            log::warn!("Failed to read {}, using defaults: {}", path.display(), e);
            return Settings::default();
        }
    };
    match Settings::from_json_str(&json) {
        Ok(settings) => settings,
        Err(e) => {
            log::warn!("Failed to load settings, using defaults: {}", e);
            Settings::default()
        }
    }
}

fn format_size(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// One status line for the current snapshot
fn status_line(snapshot: &CoreSnapshot) -> String {
    let stats = &snapshot.stats;
    let shown = match &snapshot.current {
        Some(item) => format!(
            "#{} \"{}\" by {} ({}x{}, {})",
            item.descriptor.pid,
            item.descriptor.title,
            item.descriptor.author,
            item.width,
            item.height,
            format_size(item.content.len())
        ),
        None => match snapshot.progress.fastest(TaskKind::View) {
            Some((_, percent)) => format!("loading {:.0}%", percent),
            None if stats.fetching => "Fetching...".to_string(),
            None => "nothing to show".to_string(),
        },
    };

    let mut line = format!(
        "{} | ready {} loading {} of {} pending {} | history {}/{}",
        shown,
        stats.ready,
        stats.in_flight_view,
        stats.capacity,
        stats.pending,
        stats.history_len.min(stats.history_index + 1),
        stats.history_len
    );
    if stats.in_flight_export > 0 {
        line.push_str(&format!(" | saving {}", stats.in_flight_export));
    }
    line
}

async fn dispatch(
    handle: &CacheHandle,
    input: Input,
    suppress_warnings: &mut bool,
) -> picroll_core::Result<bool> {
    match input {
        Input::Next => handle.advance().await?,
        Input::Previous => handle.back().await?,
        Input::Save => handle.request_export().await?,
        Input::CancelViews => handle.cancel(CancelCategory::View).await?,
        Input::CancelAll => handle.cancel(CancelCategory::All).await?,
        Input::Reload => {
            let settings = load_settings();
            *suppress_warnings = settings.suppress_warnings;
            handle.apply_settings(settings).await?
        }
        Input::Help => println!("{}", HELP),
        Input::Quit => {
            handle.shutdown().await?;
            return Ok(false);
        }
    }
    Ok(true)
}

#[tokio::main]
async fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("Starting picroll v{}", env!("CARGO_PKG_VERSION"));

    let settings = load_settings();
    let mut suppress_warnings = settings.suppress_warnings;

    let gallery = match HttpGallery::new() {
        Ok(gallery) => gallery,
        Err(e) => {
            log::error!("Failed to create HTTP client: {}", e);
            std::process::exit(1);
        }
    };
    let (handle, events): (CacheHandle, async_channel::Receiver<CoreEvent>) =
        CacheService::new(Arc::new(gallery), settings).spawn();

    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let mut last_status = String::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let status = status_line(&handle.snapshot());
                if status != last_status {
                    println!("{}", status);
                    last_status = status;
                }
            }

            line = lines.next_line() => {
                let input = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        let _ = handle.shutdown().await;
                        break;
                    }
                    Err(e) => {
                        log::error!("Failed to read stdin: {}", e);
                        let _ = handle.shutdown().await;
                        break;
                    }
                };
                let Some(input) = parse_input(&input) else {
                    println!("{}", HELP);
                    continue;
                };
                match dispatch(&handle, input, &mut suppress_warnings).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        log::error!("Cache manager is gone: {}", e);
                        break;
                    }
                }
            }

            Ok(event) = events.recv() => {
                match event {
                    CoreEvent::Exported { path, .. } => println!("saved {}", path.display()),
                    CoreEvent::Error(error) => {
                        if !suppress_warnings || error.kind.is_informational() {
                            eprintln!("{}", error);
                        }
                    }
                }
            }
        }
    }

    log::info!("Bye");
}
