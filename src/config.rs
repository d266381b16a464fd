use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use indexmap::IndexSet;
use regex::Regex;

use crate::plugins::{DependencyExtractor, HasteImpl};

/// Paths inside VCS bookkeeping directories are never indexed.
static VCS_DIRECTORIES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[/\\]\.(git|hg)([/\\]|$)").expect("static pattern"));

/// User exclusion rule: either a pattern over the absolute path or an
/// arbitrary predicate.
#[derive(Clone)]
pub enum IgnorePattern {
    Pattern(Regex),
    Predicate(Arc<dyn Fn(&Path) -> bool + Send + Sync>),
}

impl IgnorePattern {
    fn matches(&self, abs: &Path, text: &str) -> bool {
        match self {
            IgnorePattern::Pattern(pattern) => pattern.is_match(text),
            IgnorePattern::Predicate(predicate) => predicate(abs),
        }
    }

    /// Stable source string mixed into the cache key. Predicates have no
    /// inspectable source, so any predicate-configured map shares one marker
    /// and relies on `reset_cache` when the predicate changes.
    pub(crate) fn cache_key_source(&self) -> String {
        match self {
            IgnorePattern::Pattern(pattern) => pattern.as_str().to_string(),
            IgnorePattern::Predicate(_) => "<predicate>".to_string(),
        }
    }
}

/// Configuration for a haste map instance.
#[derive(Clone)]
pub struct HasteConfig {
    /// Directory holding snapshot blobs. Defaults to the system temp dir.
    pub cache_directory: PathBuf,
    pub compute_dependencies: bool,
    pub compute_sha1: bool,
    pub dependency_extractor: Option<Arc<dyn DependencyExtractor>>,
    pub enable_symlinks: bool,
    /// File extensions to index, without leading dots. Ordered.
    pub extensions: Vec<String>,
    /// Skip the indexing daemon even when one is running.
    pub force_native_crawler: bool,
    pub haste_impl: Option<Arc<dyn HasteImpl>>,
    pub ignore_pattern: Option<IgnorePattern>,
    pub max_workers: usize,
    /// Pattern selecting manual-mock files, matched against absolute paths.
    pub mocks_pattern: Option<Regex>,
    /// Project name, part of the cache key and the snapshot file prefix.
    pub name: String,
    /// Recognized platform suffixes. Ordered.
    pub platforms: Vec<String>,
    pub reset_cache: bool,
    /// Keep `node_modules` entries in the file table without extracting them.
    pub retain_all_files: bool,
    pub root_dir: PathBuf,
    /// Directories to crawl. Ordered, de-duplicated during normalization.
    pub roots: Vec<PathBuf>,
    pub skip_package_json: bool,
    pub throw_on_module_collision: bool,
    pub use_watchman: bool,
    pub watch: bool,
}

impl HasteConfig {
    pub fn new(
        name: impl Into<String>,
        root_dir: impl Into<PathBuf>,
        roots: Vec<PathBuf>,
        extensions: Vec<String>,
        platforms: Vec<String>,
        max_workers: usize,
    ) -> Self {
        Self {
            cache_directory: std::env::temp_dir(),
            compute_dependencies: true,
            compute_sha1: false,
            dependency_extractor: None,
            enable_symlinks: false,
            extensions,
            force_native_crawler: false,
            haste_impl: None,
            ignore_pattern: None,
            max_workers,
            mocks_pattern: None,
            name: name.into(),
            platforms,
            reset_cache: false,
            retain_all_files: false,
            root_dir: root_dir.into(),
            roots,
            skip_package_json: false,
            throw_on_module_collision: false,
            use_watchman: true,
            watch: false,
        }
    }

    /// Absolutize and de-duplicate roots, normalize extensions.
    pub(crate) fn normalized(mut self) -> Self {
        let root_dir = self.root_dir.clone();
        let roots: IndexSet<PathBuf> = self
            .roots
            .drain(..)
            .map(|root| {
                if root.is_absolute() {
                    root
                } else {
                    root_dir.join(root)
                }
            })
            .collect();
        self.roots = roots.into_iter().collect();
        self.extensions = self
            .extensions
            .iter()
            .map(|ext| normalize_extension(ext))
            .filter(|ext| !ext.is_empty())
            .collect();
        self
    }

    /// Watch mode must not crash on races and must observe `node_modules`
    /// churn.
    pub(crate) fn for_watch_mode(&self) -> Self {
        let mut config = self.clone();
        config.throw_on_module_collision = false;
        config.retain_all_files = true;
        config
    }

    /// Composed exclusion filter over an absolute path.
    pub(crate) fn is_ignored(&self, abs: &Path) -> bool {
        let text = abs.to_string_lossy().replace('\\', "/");
        if VCS_DIRECTORIES.is_match(&text) {
            return true;
        }
        if let Some(pattern) = &self.ignore_pattern
            && pattern.matches(abs, &text)
        {
            return true;
        }
        !self.retain_all_files && text.contains("/node_modules/")
    }

    pub(crate) fn has_configured_extension(&self, abs: &Path) -> bool {
        let Some(extension) = abs.extension().and_then(|ext| ext.to_str()) else {
            return false;
        };
        let extension = extension.to_ascii_lowercase();
        self.extensions.iter().any(|ext| *ext == extension)
    }

    pub(crate) fn matches_mocks_pattern(&self, abs: &Path) -> bool {
        self.mocks_pattern
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(&abs.to_string_lossy().replace('\\', "/")))
    }
}

/// Normalize an extension by trimming and removing leading dots.
pub(crate) fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(root: &Path) -> HasteConfig {
        HasteConfig::new(
            "test",
            root,
            vec![root.to_path_buf()],
            vec!["js".to_string()],
            vec![],
            1,
        )
    }

    #[test]
    fn vcs_directories_are_always_ignored() {
        let config = config(Path::new("/project"));
        assert!(config.is_ignored(Path::new("/project/.git/HEAD")));
        assert!(config.is_ignored(Path::new("/project/.hg/store/data")));
        assert!(!config.is_ignored(Path::new("/project/src/git.js")));
    }

    #[test]
    fn node_modules_ignored_unless_retained() {
        let mut config = config(Path::new("/project"));
        assert!(config.is_ignored(Path::new("/project/node_modules/dep/index.js")));
        config.retain_all_files = true;
        assert!(!config.is_ignored(Path::new("/project/node_modules/dep/index.js")));
    }

    #[test]
    fn user_pattern_composes_with_builtins() {
        let mut config = config(Path::new("/project"));
        config.ignore_pattern = Some(IgnorePattern::Pattern(
            Regex::new(r"/generated/").expect("pattern"),
        ));
        assert!(config.is_ignored(Path::new("/project/generated/out.js")));
        assert!(config.is_ignored(Path::new("/project/.git/config")));
        assert!(!config.is_ignored(Path::new("/project/src/out.js")));
    }

    #[test]
    fn predicate_pattern_is_consulted() {
        let mut config = config(Path::new("/project"));
        config.ignore_pattern = Some(IgnorePattern::Predicate(Arc::new(|path: &Path| {
            path.ends_with("skip.js")
        })));
        assert!(config.is_ignored(Path::new("/project/a/skip.js")));
        assert!(!config.is_ignored(Path::new("/project/a/keep.js")));
    }

    #[test]
    fn normalization_dedupes_roots_and_extensions() {
        let mut config = config(Path::new("/project"));
        config.roots = vec![
            PathBuf::from("/project/src"),
            PathBuf::from("src"),
            PathBuf::from("/project/lib"),
        ];
        config.extensions = vec![".JS".to_string(), "ts".to_string(), String::new()];
        let config = config.normalized();
        assert_eq!(
            config.roots,
            vec![PathBuf::from("/project/src"), PathBuf::from("/project/lib")]
        );
        assert_eq!(config.extensions, vec!["js".to_string(), "ts".to_string()]);
    }
}
