use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};

use crate::config::HasteConfig;
use crate::snapshot::{FileEntry, FileTable, Snapshot, relative_path};

use super::CrawlOutcome;

/// A root registered with the daemon. The daemon may watch a parent of the
/// requested root; `relative_path` locates the root inside that watch.
#[derive(Debug, Clone)]
pub struct WatchProject {
    pub watch_root: PathBuf,
    pub relative_path: Option<String>,
}

/// One file the daemon reports as changed since a clock.
#[derive(Debug, Clone)]
pub struct DaemonFileChange {
    pub abs_path: PathBuf,
    pub exists: bool,
    pub mtime_ms: i64,
    pub size: u64,
    /// First sighting under the current watch.
    pub is_new: bool,
}

/// Result of a `since` query.
#[derive(Debug, Clone)]
pub struct DaemonDelta {
    pub clock: String,
    /// The daemon restarted and lost its state; the listing is a full
    /// enumeration rather than a delta.
    pub is_fresh_instance: bool,
    pub files: Vec<DaemonFileChange>,
}

/// Client for a watchman-style filesystem-indexing daemon. Injectable so
/// tests can substitute a scripted implementation.
pub trait DaemonClient: Send + Sync {
    /// Whether a daemon is reachable. Probed once per client.
    fn available(&self) -> bool;

    fn watch_project(&self, root: &Path) -> Result<WatchProject>;

    /// Current clock for a watch root.
    fn clock(&self, watch_root: &Path) -> Result<String>;

    /// Files changed since `since` (or a full listing when `since` is
    /// `None` or unknown to the daemon), filtered to `extensions`.
    fn query_since(
        &self,
        project: &WatchProject,
        since: Option<&str>,
        extensions: &[String],
    ) -> Result<DaemonDelta>;
}

/// Delta crawl backed by the daemon. Clock tokens are carried per watch root
/// in the snapshot so the next crawl only sees what changed.
pub(crate) fn crawl(
    config: &HasteConfig,
    client: &dyn DaemonClient,
    mut snapshot: Snapshot,
) -> Result<CrawlOutcome> {
    let mut changed = FileTable::new();
    let mut removed = FileTable::new();
    let mut any_fresh = false;

    for root in &config.roots {
        let project = client.watch_project(root)?;
        let clock_key = relative_path(&config.root_dir, &project.watch_root);
        let since = snapshot.clocks.get(&clock_key).cloned();
        let delta = client.query_since(&project, since.as_deref(), &config.extensions)?;
        if delta.is_fresh_instance {
            any_fresh = true;
        }

        let mut listed: HashSet<String> = HashSet::with_capacity(delta.files.len());
        for change in delta.files {
            let abs = &change.abs_path;
            if !config.has_configured_extension(abs) || config.is_ignored(abs) {
                continue;
            }
            let rel = relative_path(&config.root_dir, abs);
            if !change.exists {
                if let Some(prior) = snapshot.files.remove(&rel) {
                    removed.insert(rel, prior);
                }
                continue;
            }
            listed.insert(rel.clone());
            match snapshot.files.get(&rel) {
                Some(existing) if existing.mtime == change.mtime_ms => {}
                _ => {
                    let entry = FileEntry::placeholder(change.mtime_ms, change.size);
                    snapshot.files.insert(rel.clone(), entry.clone());
                    changed.insert(rel, entry);
                }
            }
        }

        if delta.is_fresh_instance {
            // A fresh enumeration is complete for this root: prior entries
            // it did not list are gone.
            let rel_root = relative_path(&config.root_dir, root);
            let prefix = if rel_root.is_empty() {
                String::new()
            } else {
                format!("{rel_root}/")
            };
            let stale: Vec<String> = snapshot
                .files
                .keys()
                .filter(|rel| rel.starts_with(&prefix) && !listed.contains(*rel))
                .cloned()
                .collect();
            for rel in stale {
                if let Some(prior) = snapshot.files.remove(&rel) {
                    removed.insert(rel, prior);
                }
            }
        }

        snapshot.clocks.insert(clock_key, delta.clock);
    }

    Ok(CrawlOutcome {
        snapshot,
        removed,
        changed: (!any_fresh).then_some(changed),
    })
}

/// Default client speaking JSON to the `watchman` CLI.
#[derive(Default)]
pub struct CliDaemonClient {
    probed: OnceLock<bool>,
}

impl CliDaemonClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn command(&self, request: &Value) -> Result<Value> {
        let mut child = Command::new("watchman")
            .args(["--no-pretty", "-j"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn watchman")?;
        let payload = serde_json::to_vec(request).context("failed to encode watchman request")?;
        child
            .stdin
            .as_mut()
            .context("watchman stdin unavailable")?
            .write_all(&payload)
            .context("failed to write watchman request")?;
        let output = child
            .wait_with_output()
            .context("failed to await watchman")?;
        if !output.status.success() {
            bail!(
                "watchman exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let value: Value = serde_json::from_slice(&output.stdout)
            .context("unparsable response from watchman")?;
        if let Some(error) = value.get("error").and_then(Value::as_str) {
            bail!("watchman error: {error}");
        }
        Ok(value)
    }
}

impl DaemonClient for CliDaemonClient {
    fn available(&self) -> bool {
        *self.probed.get_or_init(|| {
            Command::new("watchman")
                .arg("--version")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map(|status| status.success())
                .unwrap_or(false)
        })
    }

    fn watch_project(&self, root: &Path) -> Result<WatchProject> {
        let response = self.command(&json!(["watch-project", root.to_string_lossy()]))?;
        let watch = response
            .get("watch")
            .and_then(Value::as_str)
            .context("watch-project response missing the watch root")?;
        Ok(WatchProject {
            watch_root: PathBuf::from(watch),
            relative_path: response
                .get("relative_path")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    fn clock(&self, watch_root: &Path) -> Result<String> {
        let response = self.command(&json!(["clock", watch_root.to_string_lossy()]))?;
        response
            .get("clock")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("clock response missing the clock token")
    }

    fn query_since(
        &self,
        project: &WatchProject,
        since: Option<&str>,
        extensions: &[String],
    ) -> Result<DaemonDelta> {
        let mut anyof: Vec<Value> = vec![json!("anyof")];
        anyof.extend(extensions.iter().map(|ext| json!(["suffix", ext])));
        let mut query = json!({
            "expression": ["allof", ["type", "f"], anyof],
            "fields": ["name", "exists", "mtime_ms", "size", "new"],
        });
        if let Some(clock) = since {
            query["since"] = json!(clock);
        }
        if let Some(rel) = &project.relative_path {
            query["relative_root"] = json!(rel);
        }

        let response = self.command(&json!([
            "query",
            project.watch_root.to_string_lossy(),
            query
        ]))?;

        let base = match &project.relative_path {
            Some(rel) => project.watch_root.join(rel),
            None => project.watch_root.clone(),
        };
        let files = response
            .get("files")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        let name = entry.get("name").and_then(Value::as_str)?;
                        Some(DaemonFileChange {
                            abs_path: base.join(name),
                            exists: entry
                                .get("exists")
                                .and_then(Value::as_bool)
                                .unwrap_or(true),
                            mtime_ms: entry
                                .get("mtime_ms")
                                .and_then(Value::as_f64)
                                .map(|ms| ms as i64)
                                .unwrap_or(0),
                            size: entry.get("size").and_then(Value::as_u64).unwrap_or(0),
                            is_new: entry.get("new").and_then(Value::as_bool).unwrap_or(false),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(DaemonDelta {
            clock: response
                .get("clock")
                .and_then(Value::as_str)
                .context("query response missing the clock token")?
                .to_string(),
            is_fresh_instance: response
                .get("is_fresh_instance")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            files,
        })
    }
}
