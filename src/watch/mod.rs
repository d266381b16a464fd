mod sources;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::config::HasteConfig;
use crate::crawl::DaemonClient;
use crate::pipeline;
use crate::registry;
use crate::snapshot::{
    DuplicateTable, FileEntry, FileTable, MockTable, ModuleTable, mock_name, platform_slot,
    relative_path,
};
use crate::views::{HasteFS, ModuleMap};
use crate::worker::WorkerContext;

use sources::{DispatcherMessage, RawWatchEvent, SourceHandle, SourceKind};

pub use sources::{FileStat, WatchEventKind};

/// Upper bound on how long a root's event source may take to become ready.
pub(crate) const MAX_WAIT_TIME: Duration = Duration::from_millis(240_000);
/// Coalescing window: queued events are flushed as one change frame at this
/// cadence.
pub(crate) const CHANGE_INTERVAL: Duration = Duration::from_millis(30);

/// One filesystem event as surfaced to subscribers.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub file_path: PathBuf,
    pub stat: Option<FileStat>,
}

/// A coalesced frame of changes. Both views derive from the same snapshot
/// version and do not observe later mutations.
#[derive(Clone)]
pub struct ChangeEvent {
    pub events: Vec<WatchEvent>,
    pub haste_fs: HasteFS,
    pub module_map: ModuleMap,
}

/// The index tables handed over from the builder, shared so published views
/// stay frozen while the watcher mutates its own copies on write.
pub(crate) struct SharedTables {
    pub files: Arc<FileTable>,
    pub map: Arc<ModuleTable>,
    pub mocks: Arc<MockTable>,
    pub duplicates: Arc<DuplicateTable>,
}

/// Watch-mode driver: one event source per root feeding a single dispatcher
/// thread that owns all index mutation.
pub(crate) struct Watcher {
    control_tx: Sender<DispatcherMessage>,
    dispatcher: Option<JoinHandle<()>>,
    sources: Vec<SourceHandle>,
    ended: bool,
}

impl Watcher {
    pub fn start(
        base_config: &HasteConfig,
        worker_ctx: Arc<WorkerContext>,
        client: Arc<dyn DaemonClient>,
        tables: SharedTables,
    ) -> Result<(Self, Receiver<ChangeEvent>)> {
        let config = Arc::new(base_config.for_watch_mode());
        let (event_tx, event_rx) = mpsc::channel();
        let (out_tx, out_rx) = mpsc::channel();

        let kind = if config.use_watchman
            && !config.enable_symlinks
            && !config.force_native_crawler
            && client.available()
        {
            SourceKind::Daemon
        } else {
            SourceKind::Native
        };

        let mut attached = Vec::with_capacity(config.roots.len());
        for root in &config.roots {
            attached.push(sources::attach(
                kind,
                &client,
                root,
                &config.extensions,
                event_tx.clone(),
            )?);
        }

        let state = DispatcherState::new(Arc::clone(&config), worker_ctx, tables, out_tx);
        let dispatcher = thread::spawn(move || state.run(event_rx));

        Ok((
            Self {
                control_tx: event_tx,
                dispatcher: Some(dispatcher),
                sources: attached,
                ended: false,
            },
            out_rx,
        ))
    }

    /// Stop the dispatcher and close every source. Idempotent.
    pub fn end(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        let _ = self.control_tx.send(DispatcherMessage::Stop);
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.join();
        }
        for source in self.sources.drain(..) {
            source.close();
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.end();
    }
}

/// Owns the live index in watch mode. All mutation happens here, one event
/// at a time; emission clones nothing until the next frame actually writes.
struct DispatcherState {
    config: Arc<HasteConfig>,
    worker_ctx: Arc<WorkerContext>,
    files: Arc<FileTable>,
    map: Arc<ModuleTable>,
    mocks: Arc<MockTable>,
    duplicates: Arc<DuplicateTable>,
    queue: Vec<WatchEvent>,
    out_tx: Sender<ChangeEvent>,
    last_flush: Instant,
}

impl DispatcherState {
    fn new(
        config: Arc<HasteConfig>,
        worker_ctx: Arc<WorkerContext>,
        tables: SharedTables,
        out_tx: Sender<ChangeEvent>,
    ) -> Self {
        Self {
            config,
            worker_ctx,
            files: tables.files,
            map: tables.map,
            mocks: tables.mocks,
            duplicates: tables.duplicates,
            queue: Vec::new(),
            out_tx,
            last_flush: Instant::now(),
        }
    }

    fn run(mut self, rx: Receiver<DispatcherMessage>) {
        loop {
            let timeout = CHANGE_INTERVAL.saturating_sub(self.last_flush.elapsed());
            match rx.recv_timeout(timeout) {
                Ok(DispatcherMessage::Event(event)) => self.handle_event(event),
                Ok(DispatcherMessage::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            if self.last_flush.elapsed() >= CHANGE_INTERVAL {
                self.flush();
            }
        }
    }

    fn handle_event(&mut self, event: RawWatchEvent) {
        let RawWatchEvent {
            kind,
            abs_path,
            stat,
        } = event;

        if !self.config.has_configured_extension(&abs_path) || self.config.is_ignored(&abs_path) {
            return;
        }
        let rel = relative_path(&self.config.root_dir, &abs_path);

        // Equal mtimes mean the content did not change; the event was
        // access-only noise.
        if kind == WatchEventKind::Change
            && let (Some(existing), Some(stat)) = (self.files.get(&rel), stat)
            && existing.mtime == stat.mtime
        {
            return;
        }

        // An equivalent event already awaits emission.
        if self.queue.iter().any(|queued| {
            queued.kind == kind
                && queued.file_path == abs_path
                && queued.stat.map(|s| s.mtime) == stat.map(|s| s.mtime)
        }) {
            return;
        }

        let removed_entry = Arc::make_mut(&mut self.files).remove(&rel);
        if let Some(old) = &removed_entry {
            if !old.haste_id.is_empty() {
                let map = Arc::make_mut(&mut self.map);
                let duplicates = Arc::make_mut(&mut self.duplicates);
                let platform = platform_slot(&rel, &self.config.platforms).to_string();
                if let Some(by_platform) = map.get_mut(&old.haste_id) {
                    if by_platform
                        .get(&platform)
                        .is_some_and(|module| module.path == rel)
                    {
                        by_platform.remove(&platform);
                    }
                    if by_platform.is_empty() {
                        map.remove(&old.haste_id);
                    }
                }
                registry::recover_duplicates(
                    map,
                    duplicates,
                    &self.config.platforms,
                    &rel,
                    &old.haste_id,
                );
            }
            if self.config.matches_mocks_pattern(&abs_path) {
                let name = mock_name(&rel);
                let mocks = Arc::make_mut(&mut self.mocks);
                if mocks.get(&name).is_some_and(|path| *path == rel) {
                    mocks.remove(&name);
                }
            }
        }

        if kind != WatchEventKind::Delete {
            let Some(stat) = stat else {
                return;
            };
            Arc::make_mut(&mut self.files)
                .insert(rel.clone(), FileEntry::placeholder(stat.mtime, stat.size));

            let files = Arc::make_mut(&mut self.files);
            let map = Arc::make_mut(&mut self.map);
            let mocks = Arc::make_mut(&mut self.mocks);
            let duplicates = Arc::make_mut(&mut self.duplicates);
            if let Err(error) = pipeline::process_single_in_band(
                &self.config,
                &self.worker_ctx,
                files,
                duplicates,
                map,
                mocks,
                &rel,
            ) {
                log::error!("hastemap: failed to process watch event for {rel}: {error:#}");
            }
        }

        self.queue.push(WatchEvent {
            kind,
            file_path: abs_path,
            stat,
        });
    }

    /// Emit one frame: a fresh pair of views around the current tables plus
    /// the accumulated events. The emitted views keep references to the
    /// tables, so the next frame's first mutation copies on write.
    fn flush(&mut self) {
        self.last_flush = Instant::now();
        if self.queue.is_empty() {
            return;
        }
        let events = std::mem::take(&mut self.queue);
        let haste_fs = HasteFS::new(self.config.root_dir.clone(), Arc::clone(&self.files));
        let module_map = ModuleMap::new(
            self.config.root_dir.clone(),
            Arc::clone(&self.map),
            Arc::clone(&self.mocks),
            Arc::clone(&self.duplicates),
        );
        let _ = self.out_tx.send(ChangeEvent {
            events,
            haste_fs,
            module_map,
        });
    }
}
