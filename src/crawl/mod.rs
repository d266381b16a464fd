mod daemon;
mod native;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::HasteConfig;
use crate::snapshot::{FileTable, Snapshot};

pub use daemon::{CliDaemonClient, DaemonClient, DaemonDelta, DaemonFileChange, WatchProject};

/// What a crawl produced: the snapshot with its file table replaced by the
/// observed set, the entries dropped since the prior snapshot, and, when the
/// crawler can identify deltas, the set of added or modified entries.
/// `changed: None` forces a full re-extract downstream.
pub(crate) struct CrawlOutcome {
    pub snapshot: Snapshot,
    pub removed: FileTable,
    pub changed: Option<FileTable>,
}

/// Crawl the configured roots, preferring the daemon-backed delta crawler
/// and falling back to the native walker once if the daemon fails.
pub(crate) fn crawl(
    config: &HasteConfig,
    client: &Arc<dyn DaemonClient>,
    snapshot: Snapshot,
) -> Result<CrawlOutcome> {
    abort_on_symlink_daemon_conflict(config);

    let use_daemon = config.use_watchman
        && !config.enable_symlinks
        && !config.force_native_crawler
        && client.available();
    if !use_daemon {
        return native::crawl(config, snapshot);
    }

    let prior = snapshot.clone();
    match daemon::crawl(config, client.as_ref(), snapshot) {
        Ok(outcome) => Ok(outcome),
        Err(daemon_error) => {
            log::warn!(
                "hastemap: daemon crawl failed, retrying with the native crawler: {daemon_error:#}"
            );
            native::crawl(config, prior).with_context(|| {
                format!("native crawler failed after daemon failure ({daemon_error:#})")
            })
        }
    }
}

/// The daemon cannot honour symlink semantics; refusing to run is the only
/// safe answer when both are requested.
fn abort_on_symlink_daemon_conflict(config: &HasteConfig) {
    if !config.enable_symlinks {
        return;
    }
    for root in &config.roots {
        let marker = root.join(".watchmanconfig");
        if marker.exists() {
            log::error!(
                "hastemap: enable_symlinks is set but {} is managed by the indexing daemon; \
                 remove {} or disable enable_symlinks",
                root.display(),
                marker.display()
            );
            std::process::exit(1);
        }
    }
}

pub(crate) fn mtime_millis(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}
