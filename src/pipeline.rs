use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::HasteConfig;
use crate::registry;
use crate::snapshot::{
    DuplicateTable, FileTable, MockTable, ModuleTable, PACKAGE_JSON, absolute_path,
    join_dependencies, mock_name, platform_slot, within_node_modules,
};
use crate::worker::{Job, WorkerContext, WorkerPool, WorkerRequest};

/// Run the per-file pipeline over `to_process`, dispatching extraction jobs
/// through `pool` and folding the replies into the tables one at a time, in
/// arrival order.
///
/// `map` and `mocks` are the tables being (re)built. `prior_map` carries the
/// previous module table during a full rebuild so files whose content was
/// already extracted can rebind their binding without re-parsing.
#[allow(clippy::too_many_arguments)]
pub(crate) fn process_batch(
    config: &HasteConfig,
    pool: &mut WorkerPool,
    files: &mut FileTable,
    duplicates: &mut DuplicateTable,
    map: &mut ModuleTable,
    mocks: &mut MockTable,
    prior_map: Option<&ModuleTable>,
    to_process: &[String],
) -> Result<()> {
    let mut requests = Vec::new();
    for rel in to_process {
        if let Some(request) = classify(config, files, map, mocks, prior_map, rel)? {
            requests.push((rel.clone(), request));
        }
    }

    for (rel, result) in pool.run(requests) {
        match result {
            Ok(reply) => {
                let Some(entry) = files.get_mut(&rel) else {
                    continue;
                };
                entry.visited = true;
                if let (Some(id), Some(module)) = (reply.id, reply.module) {
                    entry.haste_id = id.clone();
                    registry::set_module(
                        map,
                        duplicates,
                        &config.platforms,
                        config.throw_on_module_collision,
                        &id,
                        module,
                    )?;
                }
                if let Some(deps) = reply.deps {
                    entry.deps = join_dependencies(&deps);
                }
                if let Some(sha1) = reply.sha1 {
                    entry.sha1 = Some(sha1);
                }
            }
            // The file vanished between crawl and extraction; forget it.
            Err(failure) if failure.is_recoverable() => {
                files.remove(&rel);
            }
            Err(failure) => {
                return Err(failure).with_context(|| format!("failed to process {rel}"));
            }
        }
    }

    Ok(())
}

/// Decide what a single candidate file needs: nothing, a digest-only pass,
/// or full extraction. Mock registration and visited-file rebinding happen
/// inline.
fn classify(
    config: &HasteConfig,
    files: &FileTable,
    map: &mut ModuleTable,
    mocks: &mut MockTable,
    prior_map: Option<&ModuleTable>,
    rel: &str,
) -> Result<Option<WorkerRequest>> {
    let Some(entry) = files.get(rel) else {
        panic!("hastemap: file to process was not found in the haste map: {rel}");
    };

    let base_name = rel.rsplit('/').next().unwrap_or(rel);
    if config.skip_package_json && base_name == PACKAGE_JSON {
        return Ok(None);
    }

    let abs = absolute_path(&config.root_dir, rel);
    let compute_sha1 = config.compute_sha1 && entry.sha1.is_none();
    let job = || Job {
        abs_path: abs.clone(),
        relative_path: rel.to_string(),
        compute_dependencies: config.compute_dependencies,
        compute_sha1,
    };

    // Retained node_modules entries stay in the file table but are never
    // extracted; at most their digest is refreshed.
    if config.retain_all_files && within_node_modules(&abs) {
        if compute_sha1 {
            return Ok(Some(WorkerRequest::Sha1(job())));
        }
        return Ok(None);
    }

    if config.matches_mocks_pattern(&abs) {
        let name = mock_name(rel);
        registry::set_mock(mocks, config.throw_on_module_collision, &name, rel)?;
    }

    if entry.visited && !compute_sha1 {
        if entry.haste_id.is_empty() {
            return Ok(None);
        }
        if let Some(prior) = prior_map {
            let platform = platform_slot(rel, &config.platforms);
            if let Some(module) = prior
                .get(&entry.haste_id)
                .and_then(|by_platform| by_platform.get(platform))
            {
                map.entry(entry.haste_id.clone())
                    .or_default()
                    .insert(platform.to_string(), module.clone());
                return Ok(None);
            }
        }
        // The binding is contested or gone; re-extract to settle it.
    }

    Ok(Some(WorkerRequest::Extract(job())))
}

/// Convenience wrapper used by the watcher: run the pipeline for one file
/// with a one-shot in-band pool.
#[allow(clippy::too_many_arguments)]
pub(crate) fn process_single_in_band(
    config: &HasteConfig,
    worker_ctx: &Arc<WorkerContext>,
    files: &mut FileTable,
    duplicates: &mut DuplicateTable,
    map: &mut ModuleTable,
    mocks: &mut MockTable,
    rel: &str,
) -> Result<()> {
    let mut pool = WorkerPool::in_band(Arc::clone(worker_ctx));
    let result = process_batch(
        config,
        &mut pool,
        files,
        duplicates,
        map,
        mocks,
        None,
        &[rel.to_string()],
    );
    pool.cleanup();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;

    use crate::snapshot::{FileEntry, GENERIC_PLATFORM, ModuleEntry, ModuleKind};
    use crate::worker::WorkerContext;

    fn config_for(root: &std::path::Path) -> HasteConfig {
        HasteConfig::new(
            "pipeline-test",
            root,
            vec![root.to_path_buf()],
            vec!["js".to_string(), "json".to_string()],
            vec!["ios".to_string()],
            1,
        )
    }

    fn in_band_pool() -> WorkerPool {
        WorkerPool::in_band(Arc::new(WorkerContext {
            haste_impl: None,
            dependency_extractor: None,
        }))
    }

    fn run(
        config: &HasteConfig,
        files: &mut FileTable,
        duplicates: &mut DuplicateTable,
        map: &mut ModuleTable,
        mocks: &mut MockTable,
        prior_map: Option<&ModuleTable>,
        to_process: &[String],
    ) -> Result<()> {
        let mut pool = in_band_pool();
        process_batch(
            config, &mut pool, files, duplicates, map, mocks, prior_map, to_process,
        )
    }

    #[test]
    fn vanished_file_is_dropped_silently() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = config_for(dir.path());
        let mut files = FileTable::new();
        files.insert("gone.js".to_string(), FileEntry::placeholder(1, 1));
        let mut duplicates = DuplicateTable::new();
        let mut map = ModuleTable::new();
        let mut mocks = MockTable::new();

        run(
            &config,
            &mut files,
            &mut duplicates,
            &mut map,
            &mut mocks,
            None,
            &["gone.js".to_string()],
        )
        .expect("build survives");
        assert!(!files.contains_key("gone.js"));
        assert!(map.is_empty());
    }

    #[test]
    fn extraction_fills_entry_and_module_table() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join("Foo.js"),
            "/** @providesModule Foo */\nrequire('./dep');\n",
        )
        .expect("fixture");
        let config = config_for(dir.path());
        let mut files = FileTable::new();
        files.insert("Foo.js".to_string(), FileEntry::placeholder(1, 1));
        let mut duplicates = DuplicateTable::new();
        let mut map = ModuleTable::new();
        let mut mocks = MockTable::new();

        run(
            &config,
            &mut files,
            &mut duplicates,
            &mut map,
            &mut mocks,
            None,
            &["Foo.js".to_string()],
        )
        .expect("build");

        let entry = &files["Foo.js"];
        assert!(entry.visited);
        assert_eq!(entry.haste_id, "Foo");
        assert_eq!(entry.dependencies(), vec!["./dep".to_string()]);
        assert_eq!(map["Foo"][GENERIC_PLATFORM].path, "Foo.js");
    }

    #[test]
    fn skip_package_json_leaves_the_entry_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("package.json"), "{\"name\": \"pkg\"}").expect("fixture");
        let mut config = config_for(dir.path());
        config.skip_package_json = true;
        let mut files = FileTable::new();
        files.insert("package.json".to_string(), FileEntry::placeholder(1, 1));
        let mut duplicates = DuplicateTable::new();
        let mut map = ModuleTable::new();
        let mut mocks = MockTable::new();

        run(
            &config,
            &mut files,
            &mut duplicates,
            &mut map,
            &mut mocks,
            None,
            &["package.json".to_string()],
        )
        .expect("build");
        assert!(!files["package.json"].visited);
        assert!(map.is_empty());
    }

    #[test]
    fn retained_node_modules_skip_extraction() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = config_for(dir.path());
        config.retain_all_files = true;
        let rel = "node_modules/dep/index.js".to_string();
        let mut files = FileTable::new();
        files.insert(rel.clone(), FileEntry::placeholder(1, 1));
        let mut duplicates = DuplicateTable::new();
        let mut map = ModuleTable::new();
        let mut mocks = MockTable::new();

        // The file does not exist on disk; reaching the worker would drop it.
        run(
            &config,
            &mut files,
            &mut duplicates,
            &mut map,
            &mut mocks,
            None,
            &[rel.clone()],
        )
        .expect("build");
        assert!(files.contains_key(&rel));
        assert!(!files[&rel].visited);
    }

    #[test]
    fn retained_node_modules_still_get_digests() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rel = "node_modules/dep/index.js".to_string();
        fs::create_dir_all(dir.path().join("node_modules/dep")).expect("mkdir");
        fs::write(dir.path().join(&rel), "hello").expect("fixture");
        let mut config = config_for(dir.path());
        config.retain_all_files = true;
        config.compute_sha1 = true;
        let mut files = FileTable::new();
        files.insert(rel.clone(), FileEntry::placeholder(1, 1));
        let mut duplicates = DuplicateTable::new();
        let mut map = ModuleTable::new();
        let mut mocks = MockTable::new();

        run(
            &config,
            &mut files,
            &mut duplicates,
            &mut map,
            &mut mocks,
            None,
            &[rel.clone()],
        )
        .expect("build");
        assert_eq!(
            files[&rel].sha1.as_deref(),
            Some("aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d")
        );
        assert!(files[&rel].visited);
        assert!(files[&rel].haste_id.is_empty());
    }

    #[test]
    fn visited_file_rebinds_without_reading_the_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = config_for(dir.path());
        let mut files = FileTable::new();
        // Not present on disk: extraction would drop the entry, so a
        // surviving binding proves the fast path was taken.
        files.insert(
            "Foo.js".to_string(),
            FileEntry {
                haste_id: "Foo".to_string(),
                mtime: 1,
                size: 1,
                visited: true,
                deps: String::new(),
                sha1: None,
            },
        );
        let mut prior = ModuleTable::new();
        prior.entry("Foo".to_string()).or_default().insert(
            GENERIC_PLATFORM.to_string(),
            ModuleEntry {
                path: "Foo.js".to_string(),
                kind: ModuleKind::Module,
            },
        );
        let mut duplicates = DuplicateTable::new();
        let mut map = ModuleTable::new();
        let mut mocks = MockTable::new();

        run(
            &config,
            &mut files,
            &mut duplicates,
            &mut map,
            &mut mocks,
            Some(&prior),
            &["Foo.js".to_string()],
        )
        .expect("build");
        assert_eq!(map["Foo"][GENERIC_PLATFORM].path, "Foo.js");
        assert!(files.contains_key("Foo.js"));
    }

    #[test]
    fn mock_files_are_registered() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("__mocks__")).expect("mkdir");
        fs::write(dir.path().join("__mocks__/fs.js"), "module.exports = {};").expect("fixture");
        let mut config = config_for(dir.path());
        config.mocks_pattern = Some(regex::Regex::new(r"__mocks__/").expect("pattern"));
        let rel = "__mocks__/fs.js".to_string();
        let mut files = FileTable::new();
        files.insert(rel.clone(), FileEntry::placeholder(1, 1));
        let mut duplicates = DuplicateTable::new();
        let mut map = ModuleTable::new();
        let mut mocks = MockTable::new();

        run(
            &config,
            &mut files,
            &mut duplicates,
            &mut map,
            &mut mocks,
            None,
            &[rel.clone()],
        )
        .expect("build");
        assert_eq!(mocks["fs"], rel);
    }
}
