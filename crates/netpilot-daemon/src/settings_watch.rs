//! Reloads persisted settings when `settings.json` is edited out of band.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use netpilot_core::SettingsStore;

use crate::state::DaemonState;

/// Editors and our own atomic saves produce bursts of events.
const SETTLE: Duration = Duration::from_millis(250);

fn is_relevant(event: &Event, path: &Path) -> bool {
    matches!(
        event.kind,
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
    ) && event.paths.iter().any(|p| p == path)
}

pub fn spawn_settings_watcher(
    state: Arc<DaemonState>,
    cancel: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let root = state.config.root_path.clone();
    std::fs::create_dir_all(&root)
        .with_context(|| format!("creating settings dir {}", root.display()))?;
    let path: PathBuf = SettingsStore::new(&root).path().to_path_buf();

    let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = tx.send(res);
    })
    .context("creating settings watcher")?;
    watcher
        .watch(&root, RecursiveMode::NonRecursive)
        .with_context(|| format!("watching {}", root.display()))?;
    info!("Watching {} for changes", path.display());

    Ok(tokio::spawn(async move {
        let _watcher = watcher;
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                Ok(event) if is_relevant(&event, &path) => {}
                Ok(_) => continue,
                Err(err) => {
                    warn!("Settings watcher error: {}", err);
                    continue;
                }
            }
            tokio::time::sleep(SETTLE).await;
            while rx.try_recv().is_ok() {}
            debug!("{} changed", path.display());
            if let Err(err) = state.service.reload_settings() {
                warn!("Settings reload not queued: {}", err);
            }
        }
        debug!("Settings watcher stopped");
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RenameMode};

    #[test]
    fn renames_onto_the_settings_file_count() {
        let path = PathBuf::from("/var/lib/netpilot/settings.json");
        let renamed = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To)))
            .add_path(path.clone());
        assert!(is_relevant(&renamed, &path));

        let temp = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/var/lib/netpilot/settings.tmp"));
        assert!(!is_relevant(&temp, &path));
    }
}
