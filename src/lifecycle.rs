use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ConfigSnapshot;

/// Poll keyed storage (and, if configured, a local watch file) for a changed
/// [`ConfigSnapshot`], diff it against the live one, and swap it in (§4.13).
/// Readers take a clone of the snapshot once per request, so an in-flight
/// request is never affected by a reload landing mid-request.
pub fn spawn_reload_watcher(state: Arc<crate::AppState>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            poll_and_apply(&state).await;
        }
    })
}

async fn poll_and_apply(state: &Arc<crate::AppState>) {
    let candidate = load_candidate_snapshot(state);
    let Some(candidate) = candidate else { return };

    let current = state.config_snapshot.read().await.clone();
    let changed = current.diff(&candidate);
    if changed.is_empty() {
        return;
    }

    info!(fields = ?changed, "applying hot-reloaded configuration");
    *state.config_snapshot.write().await = candidate;
}

/// Preference order: an explicit watch file (if it parses), then keyed
/// storage. Either source missing or corrupt just means "no change" — a
/// reload poll is never allowed to crash the server.
fn load_candidate_snapshot(state: &Arc<crate::AppState>) -> Option<ConfigSnapshot> {
    if let Some(path) = &state.config.reload_watch_file {
        if let Some(snapshot) = read_watch_file(path) {
            return Some(snapshot);
        }
    }
    state.storage.get("INPUT")
}

fn read_watch_file(path: &Path) -> Option<ConfigSnapshot> {
    let bytes = std::fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(snapshot) => Some(snapshot),
        Err(err) => {
            warn!(%err, path = %path.display(), "reload watch file is not a valid configuration snapshot");
            None
        }
    }
}

/// Which termination signal woke the process, for the shutdown log line.
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

/// Wait for Ctrl+C or SIGTERM, whichever arrives first (§4.13 "Lifecycle
/// Controller").
pub async fn wait_for_shutdown_signal() -> ShutdownSignal {
    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => ShutdownSignal::Interrupt,
            _ = terminate.recv() => ShutdownSignal::Terminate,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        ShutdownSignal::Interrupt
    }
}

const MAX_SHUTDOWN_ATTEMPTS: u32 = 3;

/// Ordered graceful shutdown (§4.13): stop background tasks, persist webhook
/// state, retrying the persist step up to [`MAX_SHUTDOWN_ATTEMPTS`] times if
/// it fails, within a bounded total window before force-exiting with a
/// non-zero code so an operator's process supervisor can tell a clean
/// shutdown from a stuck one.
pub async fn graceful_shutdown(state: Arc<crate::AppState>, background_tasks: Vec<JoinHandle<()>>, force_exit_timeout: Duration) {
    let shutdown = async {
        for task in &background_tasks {
            task.abort();
        }

        for attempt in 1..=MAX_SHUTDOWN_ATTEMPTS {
            if state.webhooks.try_persist().await {
                info!(attempt, "graceful shutdown complete");
                return;
            }
            warn!(attempt, max_attempts = MAX_SHUTDOWN_ATTEMPTS, "failed to persist webhook state during shutdown");
        }
        warn!("giving up on persisting webhook state after {MAX_SHUTDOWN_ATTEMPTS} attempts");
    };

    if tokio::time::timeout(force_exit_timeout, shutdown).await.is_err() {
        warn!("graceful shutdown exceeded its deadline, forcing exit");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_watch_file_returns_none_for_missing_path() {
        assert!(read_watch_file(Path::new("/nonexistent/hookline-reload.json")).is_none());
    }

    #[test]
    fn read_watch_file_returns_none_for_corrupt_json() {
        let dir = std::env::temp_dir().join(format!("hookline-watch-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("reload.json");
        std::fs::write(&path, b"not json").unwrap();

        assert!(read_watch_file(&path).is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn read_watch_file_parses_valid_snapshot() {
        let dir = std::env::temp_dir().join(format!("hookline-watch-ok-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("reload.json");
        let snapshot = ConfigSnapshot::default();
        std::fs::write(&path, serde_json::to_vec(&snapshot).unwrap()).unwrap();

        let loaded = read_watch_file(&path).unwrap();
        assert_eq!(loaded, snapshot);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
