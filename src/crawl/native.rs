use std::sync::mpsc;

use anyhow::{Result, bail};
use ignore::{DirEntry, Error as IgnoreError, WalkBuilder, WalkState};

use crate::config::HasteConfig;
use crate::snapshot::{FileEntry, FileTable, Snapshot, relative_path};

use super::{CrawlOutcome, mtime_millis};

/// Walk the roots in parallel and reconcile the observed listing against the
/// prior file table. Entries whose mtime is unchanged keep their extracted
/// metadata; everything else becomes a fresh placeholder.
///
/// The native walker cannot identify deltas, so `changed` is `None`.
pub(crate) fn crawl(config: &HasteConfig, mut snapshot: Snapshot) -> Result<CrawlOutcome> {
    let mut roots = config.roots.iter();
    let Some(first_root) = roots.next() else {
        bail!("no roots configured");
    };
    let mut builder = WalkBuilder::new(first_root);
    for root in roots {
        builder.add(root);
    }
    builder
        .standard_filters(false)
        .hidden(false)
        .follow_links(config.enable_symlinks)
        .threads(crawl_threads());

    let (file_tx, file_rx) = mpsc::channel::<(String, i64, u64)>();
    builder.build_parallel().run(|| {
        let tx = file_tx.clone();
        Box::new(move |entry: Result<DirEntry, IgnoreError>| {
            let Ok(entry) = entry else {
                return WalkState::Continue;
            };
            let Some(file_type) = entry.file_type() else {
                return WalkState::Continue;
            };
            if !file_type.is_file() {
                return WalkState::Continue;
            }
            let path = entry.path();
            if !config.has_configured_extension(path) || config.is_ignored(path) {
                return WalkState::Continue;
            }
            let Ok(metadata) = entry.metadata() else {
                return WalkState::Continue;
            };
            let rel = relative_path(&config.root_dir, path);
            if tx.send((rel, mtime_millis(&metadata), metadata.len())).is_err() {
                return WalkState::Quit;
            }
            WalkState::Continue
        })
    });
    drop(file_tx);

    let mut files = FileTable::with_capacity(snapshot.files.len());
    while let Ok((rel, mtime, size)) = file_rx.recv() {
        // Overlapping roots can list a file twice; the first sighting wins.
        if files.contains_key(&rel) {
            continue;
        }
        match snapshot.files.remove(&rel) {
            Some(existing) if existing.mtime == mtime => {
                files.insert(rel, existing);
            }
            _ => {
                files.insert(rel, FileEntry::placeholder(mtime, size));
            }
        }
    }

    // Whatever the walk did not see no longer exists.
    let removed = std::mem::take(&mut snapshot.files);
    snapshot.files = files;

    Ok(CrawlOutcome {
        snapshot,
        removed,
        changed: None,
    })
}

fn crawl_threads() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}
