use thiserror::Error;

/// Two files claim the same haste id (or mock name) on the same platform
/// while collisions are configured to be fatal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("duplicated files or mocks: {path_a} and {path_b}")]
pub struct DuplicateError {
    pub path_a: String,
    pub path_b: String,
}

impl DuplicateError {
    pub(crate) fn new(path_a: impl Into<String>, path_b: impl Into<String>) -> Self {
        Self {
            path_a: path_a.into(),
            path_b: path_b.into(),
        }
    }
}

/// A module lookup landed on a contested `(id, platform)` key. The resolver
/// must surface this instead of silently picking one of the candidates.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("the haste id `{id}` resolves to more than one file on platform `{platform}`: {}", .candidates.join(", "))]
pub struct AmbiguousModuleError {
    pub id: String,
    pub platform: String,
    /// Contested root-relative paths, sorted for stable output.
    pub candidates: Vec<String>,
}
