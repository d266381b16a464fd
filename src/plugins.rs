use std::path::Path;

/// User-supplied source of haste names, resolved once at construction and
/// handed to workers as a shared capability.
pub trait HasteImpl: Send + Sync {
    /// Stable digest mixed into the snapshot cache key. Changing the
    /// implementation must change this value.
    fn cache_key(&self) -> String;

    /// Haste id declared by the file, if any.
    fn haste_name(&self, path: &Path) -> Option<String>;
}

/// User-supplied dependency scanner. The default scanner is passed in so an
/// implementation can delegate to it.
pub trait DependencyExtractor: Send + Sync {
    /// Stable digest mixed into the snapshot cache key.
    fn cache_key(&self) -> String;

    /// Dependency specifiers found in `code`, in first-seen order.
    fn extract(
        &self,
        code: &str,
        path: &Path,
        default_extract: fn(&str) -> Vec<String>,
    ) -> Vec<String>;
}
