use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::LazyLock;

use indexmap::IndexSet;
use regex::Regex;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::snapshot::{ModuleEntry, ModuleKind, PACKAGE_JSON};

use super::WorkerContext;

/// One per-file extraction request.
#[derive(Debug, Clone)]
pub struct Job {
    pub abs_path: PathBuf,
    pub relative_path: String,
    pub compute_dependencies: bool,
    pub compute_sha1: bool,
}

/// Metadata produced for a single file.
#[derive(Debug, Clone, Default)]
pub struct WorkerReply {
    pub id: Option<String>,
    pub module: Option<ModuleEntry>,
    pub deps: Option<Vec<String>>,
    pub sha1: Option<String>,
}

#[derive(Debug, Error)]
pub enum WorkerFailure {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("worker crashed while processing {path} after {attempts} attempts: {message}")]
    Crashed {
        path: PathBuf,
        attempts: u32,
        message: String,
    },
}

impl WorkerFailure {
    /// True when the file vanished or became unreadable between crawl and
    /// extraction; such entries are silently dropped from the file table.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            WorkerFailure::Io { source, .. }
                if matches!(
                    source.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
                )
        )
    }
}

/// Full extraction: haste id, binding kind, dependencies, optional digest.
pub(crate) fn extract(job: &Job, ctx: &WorkerContext) -> Result<WorkerReply, WorkerFailure> {
    let bytes = read_file(job)?;
    let mut reply = WorkerReply::default();

    let base_name = job.relative_path.rsplit('/').next().unwrap_or("");
    if base_name == PACKAGE_JSON {
        // A named package binds its name as a package-kind haste id.
        let value: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|error| WorkerFailure::Parse {
                path: job.abs_path.clone(),
                message: error.to_string(),
            })?;
        if let Some(name) = value.get("name").and_then(|name| name.as_str()) {
            reply.id = Some(name.to_string());
            reply.module = Some(ModuleEntry {
                path: job.relative_path.clone(),
                kind: ModuleKind::Package,
            });
        }
    } else if !job.relative_path.ends_with(".node") {
        let code = String::from_utf8_lossy(&bytes);
        let id = match &ctx.haste_impl {
            Some(haste_impl) => haste_impl.haste_name(&job.abs_path),
            None => docblock_provides_module(&code),
        };
        if job.compute_dependencies {
            let deps = match &ctx.dependency_extractor {
                Some(extractor) => extractor.extract(&code, &job.abs_path, default_extract),
                None => default_extract(&code),
            };
            reply.deps = Some(deps);
        }
        if let Some(id) = id {
            reply.module = Some(ModuleEntry {
                path: job.relative_path.clone(),
                kind: ModuleKind::Module,
            });
            reply.id = Some(id);
        }
    }

    if job.compute_sha1 {
        reply.sha1 = Some(sha1_hex(&bytes));
    }
    Ok(reply)
}

/// Digest-only pass, used for retained `node_modules` files.
pub(crate) fn sha1_only(job: &Job) -> Result<WorkerReply, WorkerFailure> {
    let bytes = read_file(job)?;
    Ok(WorkerReply {
        sha1: Some(sha1_hex(&bytes)),
        ..WorkerReply::default()
    })
}

fn read_file(job: &Job) -> Result<Vec<u8>, WorkerFailure> {
    fs::read(&job.abs_path).map_err(|source| WorkerFailure::Io {
        path: job.abs_path.clone(),
        source,
    })
}

static DOCBLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(/\*\*(?s:.*?)\*/)").expect("static pattern"));
static PROVIDES_MODULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@providesModule\s+(\S+)").expect("static pattern"));

/// Haste id declared in the leading docblock, when no haste implementation
/// plugin is configured.
fn docblock_provides_module(code: &str) -> Option<String> {
    let block = DOCBLOCK.captures(code)?.get(1)?;
    let capture = PROVIDES_MODULE.captures(block.as_str())?;
    Some(capture[1].to_string())
}

static BLOCK_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)/\*.*?\*/").expect("static pattern"));
static LINE_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"//.*").expect("static pattern"));
static IMPORT_OR_EXPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\b(?:import|export)\s+(?:[^'";()]*?\sfrom\s+)?['"]([^'"]+)['"]"#)
        .expect("static pattern")
});
static DYNAMIC_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\bimport\s*\(\s*['"]([^'"]+)['"]\s*\)"#).expect("static pattern")
});
static REQUIRE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\brequire\s*\(\s*['"]([^'"]+)['"]\s*\)"#).expect("static pattern")
});
static JEST_REQUIRE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\bjest\s*\.\s*require(?:Actual|Mock)\s*\(\s*['"]([^'"]+)['"]\s*\)"#)
        .expect("static pattern")
});

/// Default dependency scanner: static `import`/`export … from`, dynamic
/// `import()`, `require()` and jest's require variants, with comments
/// stripped first. Specifiers are returned in first-seen order, de-duplicated.
pub fn default_extract(code: &str) -> Vec<String> {
    let without_blocks = BLOCK_COMMENT.replace_all(code, "");
    let stripped = LINE_COMMENT.replace_all(&without_blocks, "");

    let mut deps: IndexSet<String> = IndexSet::new();
    for pattern in [&*IMPORT_OR_EXPORT, &*DYNAMIC_IMPORT, &*REQUIRE, &*JEST_REQUIRE] {
        for capture in pattern.captures_iter(&stripped) {
            deps.insert(capture[1].to_string());
        }
    }
    deps.into_iter().collect()
}

fn sha1_hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;

    let digest = Sha1::digest(bytes);
    let mut hex = String::with_capacity(40);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;

    use crate::plugins::HasteImpl;

    fn write_job(dir: &Path, name: &str, content: &str) -> Job {
        let abs_path = dir.join(name);
        fs::write(&abs_path, content).expect("write fixture");
        Job {
            abs_path,
            relative_path: name.to_string(),
            compute_dependencies: true,
            compute_sha1: false,
        }
    }

    fn context() -> WorkerContext {
        WorkerContext {
            haste_impl: None,
            dependency_extractor: None,
        }
    }

    #[test]
    fn docblock_id_becomes_a_module_binding() {
        let dir = tempfile::tempdir().expect("tempdir");
        let job = write_job(
            dir.path(),
            "Foo.js",
            "/**\n * @providesModule Foo\n */\nconst a = require('./a');\n",
        );
        let reply = extract(&job, &context()).expect("extract");
        assert_eq!(reply.id.as_deref(), Some("Foo"));
        let module = reply.module.expect("module");
        assert_eq!(module.path, "Foo.js");
        assert_eq!(module.kind, ModuleKind::Module);
        assert_eq!(reply.deps, Some(vec!["./a".to_string()]));
    }

    #[test]
    fn provides_module_outside_the_docblock_is_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let job = write_job(
            dir.path(),
            "Bar.js",
            "const s = '@providesModule Bar';\nmodule.exports = s;\n",
        );
        let reply = extract(&job, &context()).expect("extract");
        assert!(reply.id.is_none());
        assert!(reply.module.is_none());
    }

    #[test]
    fn named_package_json_binds_as_package() {
        let dir = tempfile::tempdir().expect("tempdir");
        let job = write_job(dir.path(), "package.json", "{\"name\": \"my-pkg\"}");
        let reply = extract(&job, &context()).expect("extract");
        assert_eq!(reply.id.as_deref(), Some("my-pkg"));
        assert_eq!(reply.module.expect("module").kind, ModuleKind::Package);
    }

    #[test]
    fn unparsable_package_json_is_a_hard_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let job = write_job(dir.path(), "package.json", "{nope");
        let error = extract(&job, &context()).expect_err("parse failure");
        assert!(!error.is_recoverable());
    }

    #[test]
    fn missing_file_is_recoverable() {
        let job = Job {
            abs_path: PathBuf::from("/definitely/not/here.js"),
            relative_path: "here.js".to_string(),
            compute_dependencies: true,
            compute_sha1: false,
        };
        let error = extract(&job, &context()).expect_err("missing");
        assert!(error.is_recoverable());
    }

    #[test]
    fn haste_impl_overrides_the_docblock() {
        struct Fixed;
        impl HasteImpl for Fixed {
            fn cache_key(&self) -> String {
                "fixed".to_string()
            }
            fn haste_name(&self, _path: &Path) -> Option<String> {
                Some("FromPlugin".to_string())
            }
        }

        let dir = tempfile::tempdir().expect("tempdir");
        let job = write_job(dir.path(), "Any.js", "/** @providesModule Doc */\n");
        let ctx = WorkerContext {
            haste_impl: Some(Arc::new(Fixed)),
            dependency_extractor: None,
        };
        let reply = extract(&job, &ctx).expect("extract");
        assert_eq!(reply.id.as_deref(), Some("FromPlugin"));
    }

    #[test]
    fn default_extract_finds_all_specifier_forms() {
        let code = r#"
            import a from 'mod-a';
            import 'side-effect';
            export {b} from "mod-b";
            const c = require('mod-c');
            const d = import('mod-d');
            const e = jest.requireActual('mod-e');
            // const skipped = require('commented');
            /* const alsoSkipped = require('block-commented'); */
            const again = require('mod-a');
        "#;
        let deps = default_extract(code);
        assert_eq!(
            deps,
            vec!["mod-a", "side-effect", "mod-b", "mod-d", "mod-c", "mod-e"]
        );
    }

    #[test]
    fn sha1_matches_known_digest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut job = write_job(dir.path(), "hash.js", "hello");
        job.compute_sha1 = true;
        let reply = extract(&job, &context()).expect("extract");
        assert_eq!(
            reply.sha1.as_deref(),
            Some("aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d")
        );
        let sha_only = sha1_only(&job).expect("sha1");
        assert_eq!(sha_only.sha1, reply.sha1);
        assert!(sha_only.id.is_none());
    }
}
