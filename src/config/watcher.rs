use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::GatewayConfig;
use crate::error::ConfigError;

/// Watch a configuration file and invoke `on_change` with each successfully
/// reloaded configuration. Parse and validation failures are logged and the
/// previous configuration stays active.
///
/// The parent directory is watched rather than the file itself so that
/// editors which replace the file (rename-over-write) are still observed.
pub fn watch<F>(path: impl AsRef<Path>, on_change: F) -> Result<(), ConfigError>
where
    F: Fn(GatewayConfig) + Send + 'static,
{
    let path: PathBuf = path.as_ref().to_path_buf();
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();

    let mut watcher: RecommendedWatcher =
        notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(e) => warn!(error = %e, "config watcher error"),
        })
        .map_err(|e| ConfigError::WatchError(e.to_string()))?;

    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .map_err(|e| ConfigError::WatchError(e.to_string()))?;

    tokio::spawn(async move {
        // Keep the watcher alive for the lifetime of the task.
        let _watcher = watcher;
        let file_name = path.file_name().map(|n| n.to_os_string());

        while let Some(event) = rx.recv().await {
            if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                continue;
            }
            let touches_config = event
                .paths
                .iter()
                .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
            if !touches_config {
                continue;
            }

            // Editors fire several events per save; let the writes settle.
            tokio::time::sleep(Duration::from_millis(100)).await;
            while rx.try_recv().is_ok() {}

            info!(path = %path.display(), "config file modified, reloading");
            match super::load(&path) {
                Ok(cfg) => on_change(cfg),
                Err(e) => error!(error = %e, "failed to reload config, keeping previous"),
            }
        }
    });

    Ok(())
}
