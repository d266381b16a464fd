use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};

use crate::crawl::{DaemonClient, mtime_millis};

use super::MAX_WAIT_TIME;

const DAEMON_POLL_INTERVAL: Duration = Duration::from_millis(100);
const POLLING_INTERVAL: Duration = Duration::from_millis(1_000);

/// What happened to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Add,
    Change,
    Delete,
}

/// Stat payload attached to add/change events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub mtime: i64,
    pub size: u64,
}

/// An event as delivered by a source, before any filtering.
#[derive(Debug)]
pub(crate) struct RawWatchEvent {
    pub kind: WatchEventKind,
    pub abs_path: PathBuf,
    pub stat: Option<FileStat>,
}

pub(crate) enum DispatcherMessage {
    Event(RawWatchEvent),
    Stop,
}

/// The three event-source variants, in selection priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SourceKind {
    Daemon,
    Native,
    Polling,
}

/// A live per-root event source. Closing drops the OS watcher or stops the
/// daemon poll thread.
pub(crate) struct SourceHandle {
    watcher: Option<Box<dyn Watcher + Send>>,
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SourceHandle {
    pub fn close(mut self) {
        self.watcher.take();
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Attach one source instance to `root`. The native variant falls back to
/// polling when the OS watcher cannot be created.
pub(crate) fn attach(
    kind: SourceKind,
    client: &Arc<dyn DaemonClient>,
    root: &Path,
    extensions: &[String],
    tx: Sender<DispatcherMessage>,
) -> Result<SourceHandle> {
    match kind {
        SourceKind::Daemon => attach_daemon(Arc::clone(client), root, extensions.to_vec(), tx),
        SourceKind::Native => match attach_notify(SourceKind::Native, root, tx.clone()) {
            Ok(handle) => Ok(handle),
            Err(error) => {
                log::warn!(
                    "hastemap: OS watcher unavailable for {}, falling back to polling: {error:#}",
                    root.display()
                );
                attach_notify(SourceKind::Polling, root, tx)
            }
        },
        SourceKind::Polling => attach_notify(SourceKind::Polling, root, tx),
    }
}

fn attach_notify(
    kind: SourceKind,
    root: &Path,
    tx: Sender<DispatcherMessage>,
) -> Result<SourceHandle> {
    let handler = notify_handler(tx);
    let mut watcher: Box<dyn Watcher + Send> = match kind {
        SourceKind::Polling => Box::new(
            PollWatcher::new(
                handler,
                NotifyConfig::default().with_poll_interval(POLLING_INTERVAL),
            )
            .context("failed to create the polling watcher")?,
        ),
        _ => Box::new(
            RecommendedWatcher::new(handler, NotifyConfig::default())
                .context("failed to create the OS watcher")?,
        ),
    };
    watcher
        .watch(root, RecursiveMode::Recursive)
        .with_context(|| format!("failed to watch {}", root.display()))?;
    Ok(SourceHandle {
        watcher: Some(watcher),
        stop_tx: None,
        thread: None,
    })
}

fn notify_handler(
    tx: Sender<DispatcherMessage>,
) -> impl Fn(notify::Result<notify::Event>) + Send + 'static {
    move |result| match result {
        Ok(event) => {
            for (kind, path) in translate(event) {
                let mut kind = kind;
                let stat = if kind == WatchEventKind::Delete {
                    None
                } else {
                    match fs::metadata(&path) {
                        Ok(metadata) if metadata.is_dir() => continue,
                        Ok(metadata) => Some(FileStat {
                            mtime: mtime_millis(&metadata),
                            size: metadata.len(),
                        }),
                        // Vanished before we could stat it.
                        Err(_) => {
                            kind = WatchEventKind::Delete;
                            None
                        }
                    }
                };
                let message = DispatcherMessage::Event(RawWatchEvent {
                    kind,
                    abs_path: path,
                    stat,
                });
                if tx.send(message).is_err() {
                    return;
                }
            }
        }
        Err(error) => log::warn!("hastemap: watch error: {error}"),
    }
}

fn translate(event: notify::Event) -> Vec<(WatchEventKind, PathBuf)> {
    let mut out = Vec::with_capacity(event.paths.len());
    match event.kind {
        EventKind::Create(_) => {
            for path in event.paths {
                out.push((WatchEventKind::Add, path));
            }
        }
        EventKind::Remove(_) => {
            for path in event.paths {
                out.push((WatchEventKind::Delete, path));
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            for path in event.paths {
                out.push((WatchEventKind::Delete, path));
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            for path in event.paths {
                out.push((WatchEventKind::Add, path));
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut paths = event.paths.into_iter();
            if let Some(from) = paths.next() {
                out.push((WatchEventKind::Delete, from));
            }
            if let Some(to) = paths.next() {
                out.push((WatchEventKind::Add, to));
            }
        }
        EventKind::Access(_) => {}
        _ => {
            for path in event.paths {
                out.push((WatchEventKind::Change, path));
            }
        }
    }
    out
}

/// Daemon-backed source: registers the root, records the current clock, and
/// polls for deltas. Readiness is the completed handshake, bounded by
/// [`MAX_WAIT_TIME`].
fn attach_daemon(
    client: Arc<dyn DaemonClient>,
    root: &Path,
    extensions: Vec<String>,
    tx: Sender<DispatcherMessage>,
) -> Result<SourceHandle> {
    let (ready_tx, ready_rx) = mpsc::channel();
    let (stop_tx, stop_rx) = mpsc::channel();
    let root_buf = root.to_path_buf();

    let thread = thread::spawn(move || {
        let project = match client.watch_project(&root_buf) {
            Ok(project) => project,
            Err(error) => {
                let _ = ready_tx.send(Err(error));
                return;
            }
        };
        let mut clock = match client.clock(&project.watch_root) {
            Ok(clock) => clock,
            Err(error) => {
                let _ = ready_tx.send(Err(error));
                return;
            }
        };
        let _ = ready_tx.send(Ok(()));

        loop {
            match stop_rx.recv_timeout(DAEMON_POLL_INTERVAL) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            match client.query_since(&project, Some(&clock), &extensions) {
                Ok(delta) => {
                    clock = delta.clock;
                    for change in delta.files {
                        let kind = if !change.exists {
                            WatchEventKind::Delete
                        } else if change.is_new {
                            WatchEventKind::Add
                        } else {
                            WatchEventKind::Change
                        };
                        let stat = change.exists.then_some(FileStat {
                            mtime: change.mtime_ms,
                            size: change.size,
                        });
                        let message = DispatcherMessage::Event(RawWatchEvent {
                            kind,
                            abs_path: change.abs_path,
                            stat,
                        });
                        if tx.send(message).is_err() {
                            return;
                        }
                    }
                }
                Err(error) => {
                    log::warn!("hastemap: daemon watch query failed: {error:#}");
                }
            }
        }
    });

    match ready_rx.recv_timeout(MAX_WAIT_TIME) {
        Ok(Ok(())) => Ok(SourceHandle {
            watcher: None,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        }),
        Ok(Err(error)) => {
            Err(error).with_context(|| format!("daemon watch failed for {}", root.display()))
        }
        Err(_) => bail!(
            "watcher for {} did not become ready within {}s",
            root.display(),
            MAX_WAIT_TIME.as_secs()
        ),
    }
}
