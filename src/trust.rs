//! Trust decisions for scripts.
//!
//! Trusted scripts may use restricted operations (starting and killing other
//! scripts, injecting synthetic downstream lines). The store is consulted
//! whenever a script is started, so trust changes apply to the next run.

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};

use crate::lock;

/// Source of script trust decisions.
pub trait TrustStore: Send + Sync + std::fmt::Debug {
    /// Whether the named script is trusted.
    fn is_trusted(&self, name: &str) -> bool;
    /// Mark a script trusted.
    fn trust(&self, name: &str) -> Result<()>;
    /// Revoke trust.
    fn distrust(&self, name: &str) -> Result<()>;
    /// All trusted names, sorted.
    fn list(&self) -> Vec<String>;
}

/// Names are compared case-insensitively.
fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Volatile trust store, mainly for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryTrustStore {
    names: Mutex<BTreeSet<String>>,
}

impl MemoryTrustStore {
    /// Create a store pre-populated with `names`.
    pub fn with_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            names: Mutex::new(names.into_iter().map(|n| normalize(n.as_ref())).collect()),
        }
    }
}

impl TrustStore for MemoryTrustStore {
    fn is_trusted(&self, name: &str) -> bool {
        lock(&self.names).contains(&normalize(name))
    }

    fn trust(&self, name: &str) -> Result<()> {
        lock(&self.names).insert(normalize(name));
        Ok(())
    }

    fn distrust(&self, name: &str) -> Result<()> {
        lock(&self.names).remove(&normalize(name));
        Ok(())
    }

    fn list(&self) -> Vec<String> {
        lock(&self.names).iter().cloned().collect()
    }
}

/// Trust store persisted as a JSON array of names.
#[derive(Debug)]
pub struct FileTrustStore {
    path: PathBuf,
    names: Mutex<BTreeSet<String>>,
}

impl FileTrustStore {
    /// Open (or lazily create) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let names = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read trust file {}", path.display()))?;
            let list: Vec<String> = serde_json::from_str(&content)
                .with_context(|| format!("Invalid trust file {}", path.display()))?;
            list.iter().map(|n| normalize(n)).collect()
        } else {
            BTreeSet::new()
        };
        Ok(Self {
            path,
            names: Mutex::new(names),
        })
    }

    fn persist(&self, names: &BTreeSet<String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let list: Vec<&String> = names.iter().collect();
        fs::write(&self.path, serde_json::to_string_pretty(&list)?)
            .with_context(|| format!("Failed to write trust file {}", self.path.display()))
    }
}

impl TrustStore for FileTrustStore {
    fn is_trusted(&self, name: &str) -> bool {
        lock(&self.names).contains(&normalize(name))
    }

    fn trust(&self, name: &str) -> Result<()> {
        let mut names = lock(&self.names);
        if names.insert(normalize(name)) {
            self.persist(&names)?;
            log::info!("[Trust] Trusted script '{}'", name);
        }
        Ok(())
    }

    fn distrust(&self, name: &str) -> Result<()> {
        let mut names = lock(&self.names);
        if names.remove(&normalize(name)) {
            self.persist(&names)?;
            log::info!("[Trust] Distrusted script '{}'", name);
        }
        Ok(())
    }

    fn list(&self) -> Vec<String> {
        lock(&self.names).iter().cloned().collect()
    }
}
