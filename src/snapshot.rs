use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Sentinel platform used when a file name carries no platform suffix.
pub const GENERIC_PLATFORM: &str = "g";
/// Platform consulted between a requested platform and the generic fallback.
pub const NATIVE_PLATFORM: &str = "native";

/// Delimiter used to pack the dependency list into a single string.
pub(crate) const DEPENDENCY_DELIM: char = '\0';

pub(crate) const PACKAGE_JSON: &str = "package.json";
pub(crate) const NODE_MODULES: &str = "node_modules";

/// Per-file metadata, keyed by root-relative path in the file table.
///
/// Persisted positionally as `[haste_id, mtime, size, visited, deps, sha1]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "FileEntryRepr", into = "FileEntryRepr")]
pub struct FileEntry {
    /// Module identifier declared by the file, or empty when none.
    pub haste_id: String,
    /// Modification time in milliseconds since the epoch.
    pub mtime: i64,
    /// File size in bytes.
    pub size: u64,
    /// True once extraction has succeeded for the current content.
    pub visited: bool,
    /// Dependency specifiers joined with [`DEPENDENCY_DELIM`].
    pub deps: String,
    /// Content digest, present iff SHA-1 computation was requested.
    pub sha1: Option<String>,
}

impl FileEntry {
    /// Entry for a file the crawler has seen but the pipeline has not.
    pub(crate) fn placeholder(mtime: i64, size: u64) -> Self {
        Self {
            haste_id: String::new(),
            mtime,
            size,
            visited: false,
            deps: String::new(),
            sha1: None,
        }
    }

    pub fn dependencies(&self) -> Vec<String> {
        split_dependencies(&self.deps)
    }
}

#[derive(Serialize, Deserialize)]
struct FileEntryRepr(String, i64, u64, u8, String, Option<String>);

impl From<FileEntry> for FileEntryRepr {
    fn from(entry: FileEntry) -> Self {
        Self(
            entry.haste_id,
            entry.mtime,
            entry.size,
            u8::from(entry.visited),
            entry.deps,
            entry.sha1,
        )
    }
}

impl From<FileEntryRepr> for FileEntry {
    fn from(repr: FileEntryRepr) -> Self {
        Self {
            haste_id: repr.0,
            mtime: repr.1,
            size: repr.2,
            visited: repr.3 != 0,
            deps: repr.4,
            sha1: repr.5,
        }
    }
}

/// Kind of binding a haste id resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum ModuleKind {
    Module,
    Package,
}

impl From<ModuleKind> for u8 {
    fn from(kind: ModuleKind) -> Self {
        match kind {
            ModuleKind::Module => 0,
            ModuleKind::Package => 1,
        }
    }
}

impl From<u8> for ModuleKind {
    fn from(value: u8) -> Self {
        if value == 1 {
            ModuleKind::Package
        } else {
            ModuleKind::Module
        }
    }
}

/// One binding of a haste id on a specific platform.
///
/// Persisted positionally as `[path, kind]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ModuleEntryRepr", into = "ModuleEntryRepr")]
pub struct ModuleEntry {
    /// Root-relative path of the providing file.
    pub path: String,
    pub kind: ModuleKind,
}

#[derive(Serialize, Deserialize)]
struct ModuleEntryRepr(String, ModuleKind);

impl From<ModuleEntry> for ModuleEntryRepr {
    fn from(entry: ModuleEntry) -> Self {
        Self(entry.path, entry.kind)
    }
}

impl From<ModuleEntryRepr> for ModuleEntry {
    fn from(repr: ModuleEntryRepr) -> Self {
        Self {
            path: repr.0,
            kind: repr.1,
        }
    }
}

/// Root-relative path → file metadata.
pub type FileTable = HashMap<String, FileEntry>;
/// Haste id → platform → winning binding.
pub type ModuleTable = HashMap<String, HashMap<String, ModuleEntry>>;
/// Mock name → root-relative path.
pub type MockTable = HashMap<String, String>;
/// Haste id → platform → contested paths and their kinds. Inner maps always
/// hold at least two entries.
pub type DuplicateTable = HashMap<String, HashMap<String, HashMap<String, ModuleKind>>>;
/// Watched root → opaque clock token handed back by the indexing daemon.
pub type ClockTable = HashMap<String, String>;

/// The full persisted index state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub clocks: ClockTable,
    pub files: FileTable,
    pub map: ModuleTable,
    pub mocks: MockTable,
    pub duplicates: DuplicateTable,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Extract the platform suffix of a file name, e.g. `ios` for
/// `Widget.ios.js`, when it names one of the configured platforms.
pub fn platform_for<'a>(path: &str, platforms: &'a [String]) -> Option<&'a str> {
    let last = path.rfind('.')?;
    let second_to_last = path[..last].rfind('.')?;
    let candidate = &path[second_to_last + 1..last];
    platforms
        .iter()
        .find(|platform| platform.as_str() == candidate)
        .map(String::as_str)
}

/// Platform slot a binding occupies: its suffix platform or the generic
/// sentinel.
pub fn platform_slot<'a>(path: &str, platforms: &'a [String]) -> &'a str {
    platform_for(path, platforms).unwrap_or(GENERIC_PLATFORM)
}

/// Mock name for a file matched by the mocks pattern: the base name without
/// its final extension.
pub fn mock_name(path: &str) -> String {
    let base = path.rsplit('/').next().unwrap_or(path);
    match base.rfind('.') {
        Some(index) if index > 0 => base[..index].to_string(),
        _ => base.to_string(),
    }
}

pub(crate) fn join_dependencies(deps: &[String]) -> String {
    deps.join(&DEPENDENCY_DELIM.to_string())
}

pub(crate) fn split_dependencies(deps: &str) -> Vec<String> {
    if deps.is_empty() {
        return Vec::new();
    }
    deps.split(DEPENDENCY_DELIM).map(str::to_string).collect()
}

/// Root-relative, forward-slash form of an absolute path.
pub(crate) fn relative_path(root_dir: &Path, abs: &Path) -> String {
    let relative = abs.strip_prefix(root_dir).unwrap_or(abs);
    relative.to_string_lossy().replace('\\', "/")
}

/// Absolute form of a table key.
pub(crate) fn absolute_path(root_dir: &Path, relative: &str) -> PathBuf {
    root_dir.join(relative)
}

/// True when any component of the path is a `node_modules` directory.
pub(crate) fn within_node_modules(path: &Path) -> bool {
    path.components()
        .any(|component| component.as_os_str() == NODE_MODULES)
}
