/// Isolated loader.
///
/// Turns a validated source into a compiled unit: the text is persisted to
/// its storage path, the in-memory tree is executed inside a fresh
/// restricted namespace and the entry function is extracted. Units live in
/// an arena keyed by a per-load [`UnitId`], so two loads never share state
/// even when they share a storage path.
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capabilities::registry;
use crate::sandbox::handle::ComputationHandle;
use crate::sandbox::interpreter::{
    Cancellation, Closure, Interpreter, Namespace, RuntimeError, Value, BUILTINS,
};
use crate::sandbox::validator::ValidatedSource;

/// Identity of one load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(Uuid);

impl UnitId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot persist source to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("module execution failed: {0}")]
    Execution(#[source] RuntimeError),
    #[error("module does not define '{0}'")]
    MissingEntry(String),
    #[error("'{name}' is a {found}, not a function")]
    NotCallable { name: String, found: String },
    #[error("'{name}' must take {expected} parameters, it takes {found}")]
    Arity {
        name: String,
        expected: usize,
        found: usize,
    },
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub entry_point: String,
    pub max_call_depth: usize,
    /// Keep the persisted text when loading fails after the write.
    pub retain_failed_sources: bool,
    /// Stops the module body and every later invocation of the unit.
    pub cancellation: Cancellation,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            entry_point: "computation".to_string(),
            max_call_depth: 64,
            retain_failed_sources: true,
            cancellation: Cancellation::new(),
        }
    }
}

/// A loaded computation: its tree, the namespace left by the module body
/// and the extracted entry function.
pub struct CompiledUnit {
    pub(super) id: UnitId,
    pub(super) source_path: PathBuf,
    pub(super) loaded_at: DateTime<Utc>,
    pub(super) entry_name: String,
    pub(super) entry: Arc<Closure>,
    pub(super) namespace: Namespace,
    pub(super) max_call_depth: usize,
    pub(super) cancellation: Cancellation,
}

impl fmt::Debug for CompiledUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledUnit")
            .field("id", &self.id)
            .field("source_path", &self.source_path)
            .field("entry_name", &self.entry_name)
            .field("loaded_at", &self.loaded_at)
            .finish_non_exhaustive()
    }
}

/// Compiled units keyed by their load identity.
#[derive(Debug, Default)]
pub struct UnitArena {
    units: Mutex<HashMap<UnitId, Arc<CompiledUnit>>>,
}

impl UnitArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Drops the arena's reference. Handles keep their own.
    pub fn release(&self, id: &UnitId) -> Option<Arc<CompiledUnit>> {
        let released = self.lock().remove(id);
        if released.is_some() {
            debug!("Released unit {id}");
        }
        released
    }

    fn insert(&self, unit: Arc<CompiledUnit>) {
        self.lock().insert(unit.id, unit);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<UnitId, Arc<CompiledUnit>>> {
        self.units.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Safe primitives plus every global capability of the registry. Built
/// fresh for each load.
pub fn restricted_namespace() -> Namespace {
    let mut namespace: Namespace = BUILTINS
        .iter()
        .map(|builtin| (builtin.name.to_string(), Value::Builtin(*builtin)))
        .collect();
    namespace.extend(
        registry::global_bindings().map(|(receiver, value)| (receiver.to_string(), value)),
    );
    namespace
}

/// Persists, executes and registers a validated source.
pub fn load(
    source: &ValidatedSource,
    path: &Path,
    arena: &UnitArena,
    options: &LoadOptions,
) -> Result<ComputationHandle, LoadError> {
    persist(source.text(), path)?;

    match compile(source, path, options) {
        Ok(unit) => {
            let unit = Arc::new(unit);
            arena.insert(unit.clone());
            info!(
                "Loaded unit {} from {} (entry '{}')",
                unit.id,
                path.display(),
                unit.entry_name
            );
            Ok(ComputationHandle::new(unit))
        }
        Err(err) => {
            if !options.retain_failed_sources {
                discard(path);
            }
            Err(err)
        }
    }
}

fn persist(text: &str, path: &Path) -> Result<(), LoadError> {
    let wrap = |source| LoadError::Persist {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(wrap)?;
    }
    std::fs::write(path, text).map_err(wrap)?;
    debug!("Persisted {} bytes to {}", text.len(), path.display());
    Ok(())
}

fn discard(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed failed source {}", path.display()),
        Err(e) => warn!("Could not remove failed source {}: {e}", path.display()),
    }
}

/// Runs the module body of the in-memory tree. The persisted file is never
/// read back, so a concurrent write to the same path cannot swap bodies.
fn compile(
    source: &ValidatedSource,
    path: &Path,
    options: &LoadOptions,
) -> Result<CompiledUnit, LoadError> {
    let module = source.module();
    let mut interpreter = Interpreter::new(restricted_namespace(), options.max_call_depth)
        .with_cancellation(options.cancellation.clone());
    interpreter
        .exec_module(&module.body)
        .map_err(LoadError::Execution)?;
    let namespace = interpreter.into_namespace();

    let name = options.entry_point.clone();
    let entry = match namespace.get(&name) {
        None => return Err(LoadError::MissingEntry(name)),
        Some(Value::Function(closure)) => closure.clone(),
        Some(other) => {
            return Err(LoadError::NotCallable {
                name,
                found: other.type_name().to_string(),
            })
        }
    };
    let expected = registry::parameter_receivers().len();
    if entry.params.len() != expected {
        return Err(LoadError::Arity {
            name,
            expected,
            found: entry.params.len(),
        });
    }

    Ok(CompiledUnit {
        id: UnitId::new(),
        source_path: path.to_path_buf(),
        loaded_at: Utc::now(),
        entry_name: name,
        entry,
        namespace,
        max_call_depth: options.max_call_depth,
        cancellation: options.cancellation.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::validator::{validate_source, ValidationPolicy};

    fn validated(text: &str) -> ValidatedSource {
        validate_source(text, &ValidationPolicy::default()).unwrap()
    }

    // ── Namespace ────────────────────────────────────────

    #[test]
    fn test_namespace_holds_only_primitives_and_globals() {
        let namespace = restricted_namespace();
        for name in ["eval", "exec", "compile", "__import__", "open", "getattr", "globals"] {
            assert!(!namespace.contains_key(name), "{name} must not be bound");
        }
        assert_eq!(namespace.len(), BUILTINS.len() + registry::global_bindings().count());
    }

    #[test]
    fn test_every_global_capability_is_bound() {
        let namespace = restricted_namespace();
        for decl in registry::CAPABILITIES {
            match decl.binding {
                registry::Binding::Global(_) => assert!(namespace.contains_key(decl.receiver)),
                registry::Binding::Parameter(_) => {
                    assert!(!namespace.contains_key(decl.receiver))
                }
            }
        }
    }

    // ── Loading ──────────────────────────────────────────

    #[test]
    fn test_load_registers_unit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/computation.py");
        let arena = UnitArena::new();
        let text = "def computation(state, args):\n    return 1\n";

        let handle = load(&validated(text), &path, &arena, &LoadOptions::default()).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), text);
        assert_eq!(arena.len(), 1);

        let released = arena.release(&handle.unit_id()).unwrap();
        assert_eq!(released.id, handle.unit_id());
        assert_eq!(arena.len(), 0);
        assert!(arena.release(&handle.unit_id()).is_none());
        assert_eq!(handle.entry_name(), "computation");
    }

    #[test]
    fn test_cancelled_load_is_not_registered() {
        let dir = tempfile::tempdir().unwrap();
        let arena = UnitArena::new();
        let options = LoadOptions::default();
        options.cancellation.cancel();
        let err = load(
            &validated("def computation(state, args):\n    return 1\n"),
            &dir.path().join("c.py"),
            &arena,
            &options,
        )
        .unwrap_err();
        assert!(matches!(err, LoadError::Execution(RuntimeError::Cancelled)));
        assert_eq!(arena.len(), 0);
    }

    #[test]
    fn test_entry_checks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.py");
        let arena = UnitArena::new();
        let options = LoadOptions::default();

        let err = load(&validated("x = 1"), &path, &arena, &options).unwrap_err();
        assert!(matches!(err, LoadError::MissingEntry(ref name) if name == "computation"));

        let err = load(&validated("computation = 3"), &path, &arena, &options).unwrap_err();
        assert!(matches!(err, LoadError::NotCallable { ref found, .. } if found == "int"));

        let err = load(&validated("def computation(state):\n    pass"), &path, &arena, &options)
            .unwrap_err();
        assert!(matches!(err, LoadError::Arity { expected: 2, found: 1, .. }));
        assert_eq!(arena.len(), 0);
    }

    #[test]
    fn test_custom_entry_point() {
        let dir = tempfile::tempdir().unwrap();
        let options = LoadOptions {
            entry_point: "stats".to_string(),
            ..LoadOptions::default()
        };
        let handle = load(
            &validated("def stats(state, args):\n    return 0"),
            &dir.path().join("s.py"),
            &UnitArena::new(),
            &options,
        )
        .unwrap();
        assert_eq!(handle.entry_name(), "stats");
    }

    #[test]
    fn test_module_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(
            &validated("x = undefined_name\ndef computation(state, args):\n    pass"),
            &dir.path().join("c.py"),
            &UnitArena::new(),
            &LoadOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            LoadError::Execution(RuntimeError::UnboundIdentifier { .. })
        ));
    }

    #[test]
    fn test_failed_source_retention() {
        let dir = tempfile::tempdir().unwrap();
        let arena = UnitArena::new();
        let source = validated("x = 1");

        let kept = dir.path().join("kept.py");
        load(&source, &kept, &arena, &LoadOptions::default()).unwrap_err();
        assert!(kept.exists());

        let removed = dir.path().join("removed.py");
        let options = LoadOptions {
            retain_failed_sources: false,
            ..LoadOptions::default()
        };
        load(&source, &removed, &arena, &options).unwrap_err();
        assert!(!removed.exists());
    }

    #[test]
    fn test_persist_failure() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "").unwrap();
        let err = load(
            &validated("def computation(state, args):\n    pass"),
            &blocker.join("c.py"),
            &UnitArena::new(),
            &LoadOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, LoadError::Persist { .. }));
    }
}
