//! Photos Backup - Operation Guard
//!
//! Exactly one backup-family operation may run per engine. The flag lives
//! here, owned by the engine; everything else only observes it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{BackupError, BackupResult};

/// Backup-family operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Build,
    Restore,
    ScheduledBuild,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Build => "build",
            OperationKind::Restore => "restore",
            OperationKind::ScheduledBuild => "scheduled build",
        };
        f.write_str(name)
    }
}

/// Mutex-guarded "operation in progress" flag
#[derive(Debug, Default)]
pub struct OperationLock {
    running: Mutex<Option<OperationKind>>,
}

impl OperationLock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim the engine or fail immediately with `Busy`
    pub fn try_acquire(self: &Arc<Self>, kind: OperationKind) -> BackupResult<OperationGuard> {
        let mut running = self.running.lock();
        if let Some(current) = *running {
            log::info!("Rejecting {} request: {} in progress", kind, current);
            return Err(BackupError::Busy { running: current });
        }
        *running = Some(kind);
        Ok(OperationGuard {
            lock: Arc::clone(self),
            kind,
        })
    }

    /// Operation currently holding the engine, if any
    pub fn current(&self) -> Option<OperationKind> {
        *self.running.lock()
    }

    pub fn is_busy(&self) -> bool {
        self.current().is_some()
    }
}

/// Releases the operation flag on drop
#[derive(Debug)]
pub struct OperationGuard {
    lock: Arc<OperationLock>,
    kind: OperationKind,
}

impl OperationGuard {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        *self.lock.running.lock() = None;
    }
}

/// Cooperative cancellation flag, checked at photo-level checkpoints
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
