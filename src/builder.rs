use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::Receiver;

use anyhow::{Context, Result, bail};

use crate::cache::{CacheHandle, snapshot_path};
use crate::config::HasteConfig;
use crate::crawl::{self, CliDaemonClient, CrawlOutcome, DaemonClient};
use crate::pipeline;
use crate::registry;
use crate::snapshot::{MockTable, ModuleTable, Snapshot, relative_path};
use crate::views::{HasteFS, ModuleMap};
use crate::watch::{ChangeEvent, SharedTables, Watcher};
use crate::worker::{WorkerContext, WorkerPool};

/// The views produced by a successful build.
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub haste_fs: HasteFS,
    pub module_map: ModuleMap,
}

/// A haste map instance: builds the index through the read → crawl →
/// extract → persist phases and, when configured, hands the result to the
/// watcher.
pub struct HasteMap {
    config: HasteConfig,
    cache: CacheHandle,
    client: Arc<dyn DaemonClient>,
    worker_ctx: Arc<WorkerContext>,
    built: Option<BuildResult>,
    watcher: Option<Watcher>,
    change_events: Option<Receiver<ChangeEvent>>,
}

impl HasteMap {
    pub fn new(config: HasteConfig) -> Result<Self> {
        Self::with_daemon_client(config, Arc::new(CliDaemonClient::new()))
    }

    /// Construct with an injected daemon client; the availability probe and
    /// every daemon interaction go through it.
    pub fn with_daemon_client(config: HasteConfig, client: Arc<dyn DaemonClient>) -> Result<Self> {
        let config = config.normalized();
        if config.name.is_empty() {
            bail!("a haste map needs a name");
        }
        if config.roots.is_empty() {
            bail!("a haste map needs at least one root");
        }
        if config.extensions.is_empty() {
            bail!("a haste map needs at least one file extension");
        }

        let cache = CacheHandle::new(cache_file_path(&config));
        let worker_ctx = Arc::new(WorkerContext {
            haste_impl: config.haste_impl.clone(),
            dependency_extractor: config.dependency_extractor.clone(),
        });
        Ok(Self {
            config,
            cache,
            client,
            worker_ctx,
            built: None,
            watcher: None,
            change_events: None,
        })
    }

    /// Location of this instance's snapshot blob.
    pub fn cache_path(&self) -> &Path {
        self.cache.path()
    }

    /// Build the index. Memoized: repeated calls return the completed result
    /// without touching the filesystem again.
    pub fn build(&mut self) -> Result<BuildResult> {
        if let Some(result) = &self.built {
            return Ok(result.clone());
        }
        let result = self.build_once()?;
        self.built = Some(result.clone());
        Ok(result)
    }

    fn build_once(&mut self) -> Result<BuildResult> {
        let prior = if self.config.reset_cache {
            Snapshot::empty()
        } else {
            self.cache.read()
        };

        let CrawlOutcome {
            mut snapshot,
            removed,
            changed,
        } = crawl::crawl(&self.config, &self.client, prior)?;

        for (rel, entry) in &removed {
            registry::recover_duplicates(
                &mut snapshot.map,
                &mut snapshot.duplicates,
                &self.config.platforms,
                rel,
                &entry.haste_id,
            );
        }

        // A delta-aware crawl with no removals mutates the carried tables in
        // place; anything else rebuilds them from scratch, rebinding
        // already-visited files from the prior table.
        let full_rebuild = changed.is_none() || !removed.is_empty();
        let (mut map, mut mocks, to_process, prior_map) = if full_rebuild {
            let prior_map = std::mem::take(&mut snapshot.map);
            let to_process: Vec<String> = snapshot.files.keys().cloned().collect();
            (ModuleTable::new(), MockTable::new(), to_process, Some(prior_map))
        } else {
            let to_process = changed
                .as_ref()
                .map(|changed| changed.keys().cloned().collect())
                .unwrap_or_default();
            (
                std::mem::take(&mut snapshot.map),
                std::mem::take(&mut snapshot.mocks),
                to_process,
                None,
            )
        };

        let mut pool = WorkerPool::new(Arc::clone(&self.worker_ctx), self.config.max_workers);
        let processed = pipeline::process_batch(
            &self.config,
            &mut pool,
            &mut snapshot.files,
            &mut snapshot.duplicates,
            &mut map,
            &mut mocks,
            prior_map.as_ref(),
            &to_process,
        );
        pool.cleanup();
        processed?;

        snapshot.map = map;
        snapshot.mocks = mocks;

        let should_persist = match &changed {
            None => true,
            Some(changed) => !changed.is_empty() || !removed.is_empty(),
        };
        if should_persist {
            self.cache
                .write(&snapshot)
                .context("failed to persist the haste map snapshot")?;
        }

        let files = Arc::new(snapshot.files);
        let map = Arc::new(snapshot.map);
        let mocks = Arc::new(snapshot.mocks);
        let duplicates = Arc::new(snapshot.duplicates);

        let haste_fs = HasteFS::new(self.config.root_dir.clone(), Arc::clone(&files));
        let module_map = ModuleMap::new(
            self.config.root_dir.clone(),
            Arc::clone(&map),
            Arc::clone(&mocks),
            Arc::clone(&duplicates),
        );

        if self.config.watch && self.watcher.is_none() {
            let (watcher, events) = Watcher::start(
                &self.config,
                Arc::clone(&self.worker_ctx),
                Arc::clone(&self.client),
                SharedTables {
                    files,
                    map,
                    mocks,
                    duplicates,
                },
            )?;
            self.watcher = Some(watcher);
            self.change_events = Some(events);
        }

        Ok(BuildResult {
            haste_fs,
            module_map,
        })
    }

    /// Receiver for watch-mode change frames. Available once after a build
    /// with `watch` configured.
    pub fn take_change_events(&mut self) -> Option<Receiver<ChangeEvent>> {
        self.change_events.take()
    }

    /// Tear down watch-mode resources. Idempotent; a map that never watched
    /// has nothing to do.
    pub fn end(&mut self) {
        if let Some(watcher) = &mut self.watcher {
            watcher.end();
        }
    }
}

impl Drop for HasteMap {
    fn drop(&mut self) {
        self.end();
    }
}

/// Assemble the cache key. Any change to a part lands on a different
/// snapshot path, so stale layouts are never read back.
fn cache_file_path(config: &HasteConfig) -> PathBuf {
    let mut roots: Vec<String> = config
        .roots
        .iter()
        .map(|root| relative_path(&config.root_dir, root))
        .collect();
    roots.sort();

    let key_parts = vec![
        env!("CARGO_PKG_VERSION").to_string(),
        config.name.clone(),
        config.root_dir.to_string_lossy().replace('\\', "/"),
        roots.join("|"),
        config.extensions.join("|"),
        config.platforms.join("|"),
        config.compute_sha1.to_string(),
        config
            .mocks_pattern
            .as_ref()
            .map(|pattern| pattern.as_str().to_string())
            .unwrap_or_default(),
        config
            .ignore_pattern
            .as_ref()
            .map(|pattern| pattern.cache_key_source())
            .unwrap_or_default(),
        config
            .haste_impl
            .as_ref()
            .map(|plugin| plugin.cache_key())
            .unwrap_or_default(),
        config
            .dependency_extractor
            .as_ref()
            .map(|plugin| plugin.cache_key())
            .unwrap_or_default(),
    ];
    snapshot_path(&config.cache_directory, &config.name, &key_parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(root: &Path) -> HasteConfig {
        let mut config = HasteConfig::new(
            "builder-test",
            root,
            vec![root.to_path_buf()],
            vec!["js".to_string()],
            vec![],
            1,
        );
        config.use_watchman = false;
        config
    }

    #[test]
    fn construction_rejects_missing_required_options() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = base_config(dir.path());
        config.extensions.clear();
        assert!(HasteMap::new(config).is_err());

        let mut config = base_config(dir.path());
        config.roots.clear();
        assert!(HasteMap::new(config).is_err());

        let mut config = base_config(dir.path());
        config.name = String::new();
        assert!(HasteMap::new(config).is_err());
    }

    #[test]
    fn cache_path_depends_on_every_key_part() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = HasteMap::new(base_config(dir.path())).expect("map");

        let mut config = base_config(dir.path());
        config.compute_sha1 = true;
        let with_sha1 = HasteMap::new(config).expect("map");
        assert_ne!(base.cache_path(), with_sha1.cache_path());

        let mut config = base_config(dir.path());
        config.platforms = vec!["ios".to_string()];
        let with_platform = HasteMap::new(config).expect("map");
        assert_ne!(base.cache_path(), with_platform.cache_path());

        let same = HasteMap::new(base_config(dir.path())).expect("map");
        assert_eq!(base.cache_path(), same.cache_path());
    }
}
