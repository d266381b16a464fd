use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;

use crate::error::AmbiguousModuleError;
use crate::snapshot::{
    DuplicateTable, FileEntry, FileTable, GENERIC_PLATFORM, MockTable, ModuleKind, ModuleTable,
    NATIVE_PLATFORM, absolute_path, relative_path,
};

/// Frozen view over the file table: which files exist and what the index
/// knows about them. Later index mutations are not observed.
#[derive(Debug, Clone)]
pub struct HasteFS {
    root_dir: PathBuf,
    files: Arc<FileTable>,
}

impl HasteFS {
    pub(crate) fn new(root_dir: PathBuf, files: Arc<FileTable>) -> Self {
        Self { root_dir, files }
    }

    fn entry(&self, file: &Path) -> Option<&FileEntry> {
        self.files.get(&relative_path(&self.root_dir, file))
    }

    pub fn exists(&self, file: &Path) -> bool {
        self.entry(file).is_some()
    }

    pub fn get_module_name(&self, file: &Path) -> Option<&str> {
        self.entry(file)
            .map(|entry| entry.haste_id.as_str())
            .filter(|id| !id.is_empty())
    }

    pub fn get_size(&self, file: &Path) -> Option<u64> {
        self.entry(file).map(|entry| entry.size)
    }

    pub fn get_sha1(&self, file: &Path) -> Option<&str> {
        self.entry(file).and_then(|entry| entry.sha1.as_deref())
    }

    pub fn get_dependencies(&self, file: &Path) -> Option<Vec<String>> {
        self.entry(file).map(FileEntry::dependencies)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Absolute paths of every indexed file.
    pub fn get_all_files(&self) -> Vec<PathBuf> {
        self.files
            .keys()
            .map(|rel| absolute_path(&self.root_dir, rel))
            .collect()
    }

    /// Absolute paths of files whose absolute form matches `pattern`.
    pub fn matches(&self, pattern: &Regex) -> Vec<PathBuf> {
        self.files
            .keys()
            .map(|rel| absolute_path(&self.root_dir, rel))
            .filter(|abs| pattern.is_match(&abs.to_string_lossy().replace('\\', "/")))
            .collect()
    }
}

/// Frozen view over the module and mock tables: locate `(id, platform)`.
/// A lookup landing on a contested key surfaces as an error, never a pick.
#[derive(Debug, Clone)]
pub struct ModuleMap {
    root_dir: PathBuf,
    map: Arc<ModuleTable>,
    mocks: Arc<MockTable>,
    duplicates: Arc<DuplicateTable>,
}

impl ModuleMap {
    pub(crate) fn new(
        root_dir: PathBuf,
        map: Arc<ModuleTable>,
        mocks: Arc<MockTable>,
        duplicates: Arc<DuplicateTable>,
    ) -> Self {
        Self {
            root_dir,
            map,
            mocks,
            duplicates,
        }
    }

    /// Resolve a module-kind binding. Platforms are consulted in order:
    /// the requested platform, then `native` when supported, then generic.
    pub fn get_module(
        &self,
        id: &str,
        platform: Option<&str>,
        supports_native_platform: bool,
    ) -> Result<Option<PathBuf>, AmbiguousModuleError> {
        self.lookup(id, platform, supports_native_platform, ModuleKind::Module)
    }

    /// Resolve a package-kind binding with the same platform order.
    pub fn get_package(
        &self,
        id: &str,
        platform: Option<&str>,
        supports_native_platform: bool,
    ) -> Result<Option<PathBuf>, AmbiguousModuleError> {
        self.lookup(id, platform, supports_native_platform, ModuleKind::Package)
    }

    pub fn get_mock_module(&self, name: &str) -> Option<PathBuf> {
        self.mocks
            .get(name)
            .map(|rel| absolute_path(&self.root_dir, rel))
    }

    fn lookup(
        &self,
        id: &str,
        platform: Option<&str>,
        supports_native_platform: bool,
        kind: ModuleKind,
    ) -> Result<Option<PathBuf>, AmbiguousModuleError> {
        let by_platform = self.map.get(id);
        let contested = self.duplicates.get(id);

        let mut candidates: Vec<&str> = Vec::with_capacity(3);
        if let Some(requested) = platform {
            candidates.push(requested);
        }
        if supports_native_platform && platform != Some(NATIVE_PLATFORM) {
            candidates.push(NATIVE_PLATFORM);
        }
        if platform != Some(GENERIC_PLATFORM) {
            candidates.push(GENERIC_PLATFORM);
        }

        for candidate in candidates {
            if let Some(paths) = contested.and_then(|by_platform| by_platform.get(candidate)) {
                let mut contenders: Vec<String> = paths.keys().cloned().collect();
                contenders.sort();
                return Err(AmbiguousModuleError {
                    id: id.to_string(),
                    platform: candidate.to_string(),
                    candidates: contenders,
                });
            }
            if let Some(module) = by_platform.and_then(|by_platform| by_platform.get(candidate))
                && module.kind == kind
            {
                return Ok(Some(absolute_path(&self.root_dir, &module.path)));
            }
        }
        Ok(None)
    }
}
