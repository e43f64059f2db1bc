//! Script lookup and compilation.
//!
//! A name resolves to, in order: source registered in memory, then
//! `<dir>/<name>.scr`, then the legacy `<dir>/<name>.cmd` and
//! `<dir>/<name>.wiz` (transpiled before compiling).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::constants::{LEGACY_EXTENSIONS, NATIVE_EXTENSION};
use crate::lock;

use super::compile::{compile, Program};
use super::legacy::transpile;
use super::ScriptError;

/// Finds and compiles scripts by name.
#[derive(Debug, Default)]
pub struct ScriptLoader {
    dir: Option<PathBuf>,
    inline: Mutex<HashMap<String, String>>,
}

impl ScriptLoader {
    /// Loader reading from `dir` (if any).
    #[must_use]
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            inline: Mutex::new(HashMap::new()),
        }
    }

    /// Script directory.
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Register native source under `name`, shadowing any file.
    pub fn register_source(&self, name: &str, source: impl Into<String>) {
        lock(&self.inline).insert(name.to_ascii_lowercase(), source.into());
    }

    /// Locate the file for `name`, if any.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;
        std::iter::once(NATIVE_EXTENSION)
            .chain(LEGACY_EXTENSIONS.iter().copied())
            .map(|ext| dir.join(format!("{name}.{ext}")))
            .find(|p| p.is_file())
    }

    /// Load and compile `name`.
    pub fn load(&self, name: &str) -> Result<Arc<Program>, ScriptError> {
        if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
            return Err(ScriptError::IllegalOperation(format!("invalid script name '{name}'")));
        }

        if let Some(source) = lock(&self.inline).get(&name.to_ascii_lowercase()).cloned() {
            return Ok(Arc::new(compile(&source)?));
        }

        let path = self
            .resolve(name)
            .ok_or_else(|| ScriptError::Runtime(format!("script '{name}' not found")))?;
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ScriptError::Runtime(format!("cannot read {}: {e}", path.display())))?;

        let is_legacy = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| LEGACY_EXTENSIONS.contains(&e));
        let program = if is_legacy {
            let out = transpile(&text);
            for (line, original) in &out.report {
                log::warn!("[Legacy] {}:{} dropped '{}'", name, line, original);
            }
            compile(&out.source)?
        } else {
            compile(&text)?
        };

        log::debug!("[Scripts] Compiled {} from {}", name, path.display());
        Ok(Arc::new(program))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_native_file_preferred_over_legacy() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("hunt.scr"), "native:\n echo native\n").unwrap();
        fs::write(dir.path().join("hunt.cmd"), "legacy:\n echo legacy\n").unwrap();
        let loader = ScriptLoader::new(Some(dir.path().to_path_buf()));
        let program = loader.load("hunt").unwrap();
        assert_eq!(program.label_names(), vec!["~start", "native"]);
    }

    #[test]
    fn test_legacy_file_is_transpiled() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("count.wiz"), "counter set 2\nput look %1\n").unwrap();
        let loader = ScriptLoader::new(Some(dir.path().to_path_buf()));
        let program = loader.load("count").unwrap();
        assert_eq!(program.block(0).len(), 2);
    }

    #[test]
    fn test_inline_source_and_errors() {
        let loader = ScriptLoader::new(None);
        loader.register_source("Greeter", "echo hi\n");
        assert!(loader.load("greeter").is_ok());
        assert!(matches!(loader.load("missing"), Err(ScriptError::Runtime(_))));
        assert!(matches!(loader.load("../etc/passwd"), Err(ScriptError::IllegalOperation(_))));

        loader.register_source("bad", "frobnicate\n");
        assert!(matches!(loader.load("bad"), Err(ScriptError::Syntax(_))));
    }
}
