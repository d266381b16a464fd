//! A persistent, incrementally updated index of a source tree: which files
//! exist under a set of roots, and which file provides each declared haste
//! module id per platform. Builds reconcile against an on-disk snapshot and
//! an optional filesystem-indexing daemon; watch mode keeps the index live
//! and emits consistent change frames.

mod builder;
mod cache;
mod config;
mod crawl;
mod error;
mod pipeline;
mod plugins;
mod registry;
mod snapshot;
mod views;
mod watch;
mod worker;

pub use builder::{BuildResult, HasteMap};
pub use cache::snapshot_path;
pub use config::{HasteConfig, IgnorePattern};
pub use crawl::{CliDaemonClient, DaemonClient, DaemonDelta, DaemonFileChange, WatchProject};
pub use error::{AmbiguousModuleError, DuplicateError};
pub use plugins::{DependencyExtractor, HasteImpl};
pub use snapshot::{
    FileEntry, GENERIC_PLATFORM, ModuleEntry, ModuleKind, NATIVE_PLATFORM, Snapshot,
};
pub use views::{HasteFS, ModuleMap};
pub use watch::{ChangeEvent, FileStat, WatchEvent, WatchEventKind};
pub use worker::{Job, WorkerFailure, WorkerReply, default_extract};
