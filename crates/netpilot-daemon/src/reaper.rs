//! Releases feature requests and host routes held by processes that exited
//! without stopping them.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::state::DaemonState;

const REAP_INTERVAL: Duration = Duration::from_secs(5);

pub fn dead_pids(pids: &[u32], proc_root: &Path) -> Vec<u32> {
    pids.iter()
        .copied()
        .filter(|pid| !proc_root.join(pid.to_string()).exists())
        .collect()
}

pub fn spawn_reaper(state: Arc<DaemonState>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(REAP_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let live = state.service.live_requester_pids();
            for pid in dead_pids(&live, Path::new("/proc")) {
                info!("Requester pid {} exited, releasing its requests", pid);
                if let Err(err) = state.service.process_died(pid) {
                    warn!("Could not queue death of pid {}: {}", pid, err);
                    return;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn pids_without_proc_entries_are_dead() {
        let proc_root = TempDir::new().unwrap();
        std::fs::create_dir(proc_root.path().join("42")).unwrap();
        assert_eq!(dead_pids(&[42, 43], proc_root.path()), vec![43]);
    }
}
