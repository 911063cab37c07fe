use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use folderwatch::config::Config;
use folderwatch::constants::{CHECK_LIST_LIMIT, DEFAULT_LOG_FILTER, LOG_FILE_NAME};
use folderwatch::{
    ChangeEvent, EventBus, FetchOptions, FolderEvent, HandlerError, MailBridge, MonitorEvent,
    MonitorNotice, MonitorRegistry, RegistrySettings, ScriptBridge,
};

fn setup_logging() {
    use std::fs::OpenOptions;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    // Try to create a log file in the data directory
    let log_file = Config::data_dir()
        .ok()
        .and_then(|dir| std::fs::create_dir_all(&dir).ok().map(|_| dir))
        .map(|dir| dir.join(LOG_FILE_NAME))
        .and_then(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .ok()
        });

    if let Some(file) = log_file {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false),
            )
            .init();
    } else {
        // Fallback to stderr if file logging fails
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_usage() {
    eprintln!(
        r#"folderwatch - Mail folder monitor

Usage: folderwatch [command] [args]

Commands:
    run [config]            Monitor every configured folder (default)
    check <folder> [config] Fetch one snapshot through the bridge and print it
    help                    Show this help message

Configuration file: ~/.config/folderwatch/config.toml
"#
    );
}

fn load_config(path: Option<&String>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(&PathBuf::from(path)),
        None => Config::load(),
    }
}

/// Bus subscriber that writes every event to the log.
fn log_event(event: &MonitorEvent) -> Result<(), HandlerError> {
    let folder = &event.folder;
    match &event.event {
        FolderEvent::Change(ChangeEvent::NewMessage { entry }) => {
            tracing::info!("[{}] new message {}: {}", folder, entry.identity, entry.subject)
        }
        FolderEvent::Change(ChangeEvent::StatusChanged {
            identity,
            new_is_read,
            ..
        }) => tracing::info!(
            "[{}] {} marked {}",
            folder,
            identity,
            if *new_is_read { "read" } else { "unread" }
        ),
        FolderEvent::Change(ChangeEvent::SubjectChanged {
            identity,
            previous_subject,
            new_subject,
        }) => tracing::info!(
            "[{}] {} subject '{}' -> '{}'",
            folder,
            identity,
            previous_subject,
            new_subject
        ),
        FolderEvent::Change(ChangeEvent::GenericModified { identity, .. }) => {
            tracing::info!("[{}] {} modified", folder, identity)
        }
        FolderEvent::Change(ChangeEvent::Deleted {
            identity,
            last_known_subject,
        }) => tracing::info!("[{}] {} deleted: {}", folder, identity, last_known_subject),
        FolderEvent::Change(ChangeEvent::CountChanged {
            previous_total,
            new_total,
            delta,
        }) => tracing::info!(
            "[{}] count {} -> {} ({:+})",
            folder,
            previous_total,
            new_total,
            delta
        ),
        FolderEvent::Notice(MonitorNotice::MonitoringStarted { total_count }) => {
            tracing::info!("[{}] monitoring started, {} messages", folder, total_count)
        }
        FolderEvent::Notice(MonitorNotice::ScanFailed {
            error,
            consecutive_failures,
            retry_in,
        }) => tracing::warn!(
            "[{}] scan failed ({} in a row, retry in {:?}): {}",
            folder,
            consecutive_failures,
            retry_in,
            error
        ),
        FolderEvent::Notice(MonitorNotice::Recovered { after_failures }) => {
            tracing::info!("[{}] recovered after {} failures", folder, after_failures)
        }
        FolderEvent::Notice(MonitorNotice::Stopped) => tracing::info!("[{}] stopped", folder),
    }
    Ok(())
}

async fn run_monitor(config: Config) -> Result<()> {
    if config.folders.is_empty() {
        anyhow::bail!("No folders configured. Add a [[folders]] entry to the config file.");
    }

    let config = Arc::new(config);
    let bridge = Arc::new(ScriptBridge::from_config(&config.bridge));
    let bus = Arc::new(EventBus::new());
    let registry = MonitorRegistry::new(bridge, bus, RegistrySettings::from_config(&config));

    registry.events().subscribe("*", log_event);

    #[cfg(feature = "notifications")]
    let notifier = {
        let (id, rx) = registry.events().subscribe_channel("*");
        let task = tokio::spawn(folderwatch::notification::run_notifier(
            Arc::clone(&config),
            rx,
        ));
        (id, task)
    };

    for folder in &config.folders {
        let interval = config.interval_for(folder);
        let outcome = registry
            .start_monitoring(&folder.path, interval)
            .with_context(|| format!("Failed to start monitoring '{}'", folder.path))?;
        tracing::debug!("'{}': {:?} every {:?}", folder.path, outcome, interval);
    }

    tracing::info!("Monitoring {} folders", registry.list_monitored().len());
    eprintln!(
        "Monitoring {} folders. Press Ctrl-C to stop.",
        registry.list_monitored().len()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    tracing::info!("Ctrl-C received, shutting down");
    registry.shutdown().await;

    #[cfg(feature = "notifications")]
    {
        let (id, task) = notifier;
        registry.events().unsubscribe(id);
        if let Err(e) = task.await {
            tracing::warn!("Notifier task ended abnormally: {}", e);
        }
    }

    Ok(())
}

async fn run_check(config: Config, folder: &str) -> Result<()> {
    let bridge = ScriptBridge::from_config(&config.bridge);
    let options = FetchOptions::new(config.bridge.max_items);

    let snapshot = bridge
        .fetch_snapshot(folder, &options)
        .await
        .with_context(|| format!("Bridge fetch for '{}' failed", folder))?;

    println!("Folder:   {}", snapshot.folder);
    println!("Captured: {}", snapshot.captured_at.to_rfc3339());
    println!(
        "Messages: {} returned of {} total, {} unread",
        snapshot.len(),
        snapshot.total_count,
        snapshot.unread_count()
    );
    if snapshot.is_truncated() {
        println!("          (truncated at max_items = {})", options.max_items);
    }

    for entry in snapshot.entries().iter().take(CHECK_LIST_LIMIT) {
        println!(
            "  {} {}  {}  {}",
            if entry.is_read { " " } else { "*" },
            entry.received_at.format("%Y-%m-%d %H:%M"),
            entry.identity,
            entry.subject
        );
    }
    if snapshot.len() > CHECK_LIST_LIMIT {
        println!("  ... {} more", snapshot.len() - CHECK_LIST_LIMIT);
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("help") | Some("--help") | Some("-h") => {
            print_usage();
            Ok(())
        }
        Some("check") => {
            let Some(folder) = args.get(2) else {
                eprintln!("Missing folder for 'check'");
                print_usage();
                std::process::exit(1);
            };
            setup_logging();
            let config = load_config(args.get(3))?;
            run_check(config, folder).await
        }
        Some("run") | None => {
            setup_logging();
            let config = load_config(args.get(2))?;
            config.ensure_dirs()?;
            run_monitor(config).await
        }
        Some(cmd) if !cmd.starts_with('-') && cmd.ends_with(".toml") => {
            // Bare config path: `folderwatch my.toml`
            setup_logging();
            let config = load_config(args.get(1))?;
            config.ensure_dirs()?;
            run_monitor(config).await
        }
        Some(cmd) => {
            eprintln!("Unknown command: {}", cmd);
            print_usage();
            std::process::exit(1);
        }
    }
}
