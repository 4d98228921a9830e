//! Environment isolation provider
//!
//! Interface for allocating isolated working environments (directory, port
//! block, database name) used by maintenance jobs to stage archives and by
//! external tooling for sandboxed runs. The full worktree-backed provider
//! lives outside the core; the local provider here allocates plain
//! directories under the coordination root.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::{SwarmError, SwarmResult};

/// One allocated environment slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationSlot {
    pub name: String,
    pub dir: PathBuf,
    /// First port of a ten-port block reserved for the slot.
    pub port_base: u16,
    pub db_name: String,
}

/// Allocation interface; implementations must be safe to share across jobs.
pub trait IsolationProvider: Send + Sync {
    fn allocate(&self, name: &str) -> SwarmResult<IsolationSlot>;
    fn release(&self, name: &str) -> SwarmResult<()>;
}

/// Directory-backed provider rooted under `{coordination_dir}/isolation`.
pub struct LocalIsolation {
    root: PathBuf,
    state: Mutex<LocalState>,
}

struct LocalState {
    next_port: u16,
    active: HashMap<String, IsolationSlot>,
}

impl LocalIsolation {
    const PORT_BASE: u16 = 4000;
    const PORTS_PER_SLOT: u16 = 10;

    pub fn new(coordination_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: coordination_dir.into().join("isolation"),
            state: Mutex::new(LocalState {
                next_port: Self::PORT_BASE,
                active: HashMap::new(),
            }),
        }
    }
}

impl IsolationProvider for LocalIsolation {
    #[instrument(skip(self))]
    fn allocate(&self, name: &str) -> SwarmResult<IsolationSlot> {
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(SwarmError::Validation {
                field: "name".to_string(),
                reason: format!("invalid isolation slot name {name:?}"),
            });
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| SwarmError::Internal("isolation state poisoned".to_string()))?;
        if let Some(existing) = state.active.get(name) {
            debug!(name, "isolation slot already allocated");
            return Ok(existing.clone());
        }

        let dir = self.root.join(name);
        std::fs::create_dir_all(&dir)?;
        let slot = IsolationSlot {
            name: name.to_string(),
            dir,
            port_base: state.next_port,
            db_name: format!("swarmsh_{}", name.replace('-', "_")),
        };
        state.next_port += Self::PORTS_PER_SLOT;
        state.active.insert(name.to_string(), slot.clone());
        info!(name, port_base = slot.port_base, dir = %slot.dir.display(), "isolation slot allocated");
        Ok(slot)
    }

    #[instrument(skip(self))]
    fn release(&self, name: &str) -> SwarmResult<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| SwarmError::Internal("isolation state poisoned".to_string()))?;
        let slot = state.active.remove(name).ok_or_else(|| SwarmError::NotFound {
            kind: "isolation slot",
            id: name.to_string(),
        })?;
        if slot.dir.exists() {
            fs_extra::dir::remove(&slot.dir)
                .map_err(|e| SwarmError::Io(format!("remove isolation dir: {e}")))?;
        }
        info!(name, "isolation slot released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn allocate_creates_dir_and_assigns_distinct_ports() {
        let root = TempDir::new().unwrap();
        let provider = LocalIsolation::new(root.path());

        let a = provider.allocate("job-a").unwrap();
        let b = provider.allocate("job-b").unwrap();
        assert!(a.dir.exists());
        assert!(b.dir.exists());
        assert_ne!(a.port_base, b.port_base);
        assert_eq!(a.db_name, "swarmsh_job_a");
    }

    #[test]
    fn allocate_is_idempotent_per_name() {
        let root = TempDir::new().unwrap();
        let provider = LocalIsolation::new(root.path());
        let first = provider.allocate("job").unwrap();
        let second = provider.allocate("job").unwrap();
        assert_eq!(first.port_base, second.port_base);
    }

    #[test]
    fn release_removes_dir_and_forgets_slot() {
        let root = TempDir::new().unwrap();
        let provider = LocalIsolation::new(root.path());
        let slot = provider.allocate("job").unwrap();
        provider.release("job").unwrap();
        assert!(!slot.dir.exists());
        assert!(matches!(
            provider.release("job"),
            Err(SwarmError::NotFound { .. })
        ));
    }

    #[test]
    fn rejects_path_traversal_names() {
        let root = TempDir::new().unwrap();
        let provider = LocalIsolation::new(root.path());
        assert!(provider.allocate("../evil").is_err());
    }
}
