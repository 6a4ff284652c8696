//! Safe computation extraction.
//!
//! Untrusted source goes through a fixed pipeline and either comes out as
//! an invocable [`ComputationHandle`] or as a single [`ExtractionFailure`]:
//!
//! 1. `syntax` parses it into a closed syntax tree
//! 2. `validator` checks every node against the allow-list and the
//!    capability registry
//! 3. `loader` persists the text, runs the module body in a restricted
//!    namespace and extracts the entry function
//!
//! Submitted code only ever runs inside `interpreter`, a tree-walking
//! evaluator with no access to the host.

pub mod handle;
pub mod interpreter;
pub mod loader;
pub mod syntax;
pub mod validator;

use std::path::PathBuf;

use thiserror::Error;
use tracing::warn;

use crate::config::Config;

pub use handle::{ComputationHandle, Output};
pub use loader::{LoadError, LoadOptions, UnitArena};
pub use validator::{Rejection, ValidationPolicy};

/// Submitted source text and the path it is stored under.
#[derive(Debug, Clone)]
pub struct SourceUnit {
    text: String,
    path: PathBuf,
}

impl SourceUnit {
    pub fn new(text: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            text: text.into(),
            path: path.into(),
        }
    }
}

/// Any reason a computation could not be extracted.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ExtractionFailure {
    pub message: String,
    #[source]
    pub cause: ExtractionCause,
}

#[derive(Debug, Error)]
pub enum ExtractionCause {
    #[error("source is {size} bytes, the limit is {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error(transparent)]
    Rejected(#[from] Rejection),
    #[error(transparent)]
    Load(#[from] LoadError),
}

impl From<ExtractionCause> for ExtractionFailure {
    fn from(cause: ExtractionCause) -> Self {
        Self {
            message: format!("Error while extracting computation: {cause}"),
            cause,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    pub policy: ValidationPolicy,
    pub load: LoadOptions,
    /// Sources longer than this are refused before parsing.
    pub max_source_bytes: Option<usize>,
}

impl ExtractOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            policy: ValidationPolicy {
                reject_dynamic_eval: config.sandbox.reject_dynamic_eval,
            },
            load: LoadOptions {
                entry_point: config.sandbox.entry_point.clone(),
                max_call_depth: config.sandbox.max_call_depth,
                retain_failed_sources: config.storage.retain_failed_sources,
                ..LoadOptions::default()
            },
            max_source_bytes: config.sandbox.max_source_bytes,
        }
    }
}

/// Validates, persists and loads a submitted computation.
///
/// Nothing is written when the source is rejected. On success the compiled
/// unit is registered in `arena` under a fresh [`loader::UnitId`].
pub fn extract_safe_computation(
    unit: &SourceUnit,
    arena: &UnitArena,
    options: &ExtractOptions,
) -> Result<ComputationHandle, ExtractionFailure> {
    extract(unit, arena, options).map_err(|cause| {
        warn!(
            "Extraction failed for {} ({} bytes): {cause}",
            unit.path.display(),
            unit.text.len()
        );
        ExtractionFailure::from(cause)
    })
}

fn extract(
    unit: &SourceUnit,
    arena: &UnitArena,
    options: &ExtractOptions,
) -> Result<ComputationHandle, ExtractionCause> {
    if let Some(limit) = options.max_source_bytes {
        if unit.text.len() > limit {
            return Err(ExtractionCause::TooLarge {
                size: unit.text.len(),
                limit,
            });
        }
    }
    let validated = validator::validate_source(&unit.text, &options.policy)?;
    Ok(loader::load(&validated, &unit.path, arena, &options.load)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;

    use crate::capabilities::{ArgsCapability, Capability, StateCapability};
    use crate::sandbox::interpreter::RuntimeError;

    const MEAN: &str = "\
def computation(state: State, args: Args):
    x = args[\"x\"]
    y = args[\"y\"]
    return state.mean(x), state.mean(y)
";

    fn dataset() -> Arc<ArgsCapability> {
        Arc::new(ArgsCapability::new([
            (
                "x".to_string(),
                vec![50.0, 52.0, 51.0, 53.0, 49.0, 54.0, 51.7734375],
            ),
            (
                "y".to_string(),
                vec![4.0, 4.5, 3.5, 4.0, 4.25, 3.75, 4.6015625],
            ),
        ]))
    }

    fn invoke(handle: &ComputationHandle) -> Result<Output, RuntimeError> {
        let args: Arc<dyn Capability> = dataset();
        handle.invoke(Arc::new(StateCapability::new()), args)
    }

    fn extract_in(dir: &Path, text: &str) -> Result<ComputationHandle, ExtractionFailure> {
        extract_safe_computation(
            &SourceUnit::new(text, dir.join("computation.py")),
            &UnitArena::new(),
            &ExtractOptions::default(),
        )
    }

    // ── Acceptance ───────────────────────────────────────

    #[test]
    fn test_mean_of_two_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let handle = extract_in(dir.path(), MEAN).unwrap();
        let Output::Tuple(means) = invoke(&handle).unwrap() else {
            panic!("expected a tuple");
        };
        assert_eq!(means.len(), 2);
        assert!((means[0] - 51.5390625).abs() < 1e-9);
        assert!((means[1] - 4.0859375).abs() < 1e-9);
    }

    #[test]
    fn test_registered_access_only_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let text = "\
def computation(state, args):
    x = args[0]
    with torch.no_grad():
        spread = torch.max(x) - torch.min(x)
    return state.median(x) + spread * 0
";
        let handle = extract_in(dir.path(), text).unwrap();
        assert_eq!(invoke(&handle).unwrap(), Output::Scalar(51.7734375));
    }

    // ── Rejection ────────────────────────────────────────

    #[test]
    fn test_import_is_rejected_before_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let text = "import os\ndef computation(state, args):\n    return 0\n";
        let failure = extract_in(dir.path(), text).unwrap_err();
        assert!(failure.message.contains("Import statements are not allowed."));
        assert!(matches!(
            failure.cause,
            ExtractionCause::Rejected(Rejection::Policy(_))
        ));
        assert!(!dir.path().join("computation.py").exists());
    }

    #[test]
    fn test_unregistered_receiver_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let text = "def computation(state, args):\n    return os.getcwd()\n";
        let failure = extract_in(dir.path(), text).unwrap_err();
        let ExtractionCause::Rejected(Rejection::Policy(violation)) = &failure.cause else {
            panic!("expected a policy violation, got {failure}");
        };
        assert!(violation.reason.contains("'getcwd'"));
        assert!(violation.reason.contains("'os'"));
        assert!(!dir.path().join("computation.py").exists());
    }

    #[test]
    fn test_syntax_error() {
        let dir = tempfile::tempdir().unwrap();
        let failure = extract_in(dir.path(), "def computation(state, args)\n    pass").unwrap_err();
        assert!(matches!(
            failure.cause,
            ExtractionCause::Rejected(Rejection::Syntax(_))
        ));
    }

    #[test]
    fn test_validation_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let text = "def computation(state, args):\n    return [v for v in args[0]]\n";
        let first = extract_in(dir.path(), text).unwrap_err();
        let second = extract_in(dir.path(), text).unwrap_err();
        assert_eq!(first.message, second.message);
    }

    #[test]
    fn test_source_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let options = ExtractOptions {
            max_source_bytes: Some(16),
            ..ExtractOptions::default()
        };
        let failure = extract_safe_computation(
            &SourceUnit::new(MEAN, dir.path().join("c.py")),
            &UnitArena::new(),
            &options,
        )
        .unwrap_err();
        assert!(matches!(failure.cause, ExtractionCause::TooLarge { limit: 16, .. }));
    }

    // ── Dynamic evaluation ───────────────────────────────

    #[test]
    fn test_eval_fails_at_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let text = "def computation(state, args):\n    return eval('1 + 1')\n";
        let handle = extract_in(dir.path(), text).unwrap();
        let err = invoke(&handle).unwrap_err();
        assert_eq!(
            err,
            RuntimeError::UnboundIdentifier {
                name: "eval".to_string()
            }
        );
    }

    #[test]
    fn test_eval_rejected_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let options = ExtractOptions {
            policy: ValidationPolicy {
                reject_dynamic_eval: true,
            },
            ..ExtractOptions::default()
        };
        let failure = extract_safe_computation(
            &SourceUnit::new(
                "def computation(state, args):\n    return exec('x = 1')\n",
                dir.path().join("c.py"),
            ),
            &UnitArena::new(),
            &options,
        )
        .unwrap_err();
        assert!(failure.message.contains("Use of exec() is not allowed."));
    }

    // ── Loading ──────────────────────────────────────────

    #[test]
    fn test_module_level_unbound_identifier_is_wrapped() {
        let dir = tempfile::tempdir().unwrap();
        let text = "x = eval('1')\ndef computation(state, args):\n    return x\n";
        let failure = extract_in(dir.path(), text).unwrap_err();
        assert!(matches!(
            failure.cause,
            ExtractionCause::Load(LoadError::Execution(RuntimeError::UnboundIdentifier { .. }))
        ));
    }

    #[test]
    fn test_wrong_arity() {
        let dir = tempfile::tempdir().unwrap();
        let failure =
            extract_in(dir.path(), "def computation(state):\n    return 0\n").unwrap_err();
        assert!(matches!(failure.cause, ExtractionCause::Load(LoadError::Arity { .. })));
    }

    #[test]
    fn test_failed_source_removed_when_not_retained() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.py");
        let mut options = ExtractOptions::default();
        options.load.retain_failed_sources = false;
        extract_safe_computation(
            &SourceUnit::new("def other(state, args):\n    return 0\n", &path),
            &UnitArena::new(),
            &options,
        )
        .unwrap_err();
        assert!(!path.exists());
    }

    #[test]
    fn test_colliding_paths_keep_their_own_body() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.py");
        let arena = UnitArena::new();
        let options = ExtractOptions::default();

        let handles: Vec<(f64, ComputationHandle)> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|n| {
                    let (path, arena, options) = (&path, &arena, &options);
                    scope.spawn(move || {
                        let text = format!("def computation(state, args):\n    return {n}\n");
                        let handle =
                            extract_safe_computation(&SourceUnit::new(text, path), arena, options)
                                .unwrap();
                        (n as f64, handle)
                    })
                })
                .collect();
            workers.into_iter().map(|worker| worker.join().unwrap()).collect()
        });

        assert_eq!(arena.len(), 8);
        for (expected, handle) in &handles {
            assert_eq!(invoke(handle).unwrap(), Output::Scalar(*expected));
            assert_eq!(handle.source_path(), path);
        }
    }
}
