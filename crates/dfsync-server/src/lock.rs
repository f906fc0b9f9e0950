//! Write-lock arbitration.
//!
//! One table maps each filename to the client that may mutate it. Every
//! check-and-insert happens inside a single critical section of the table
//! mutex, so two clients racing for the same name can never both win.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{ServiceError, ServiceResult};

/// Result of an acquire attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// A new entry was created for the caller.
    Granted,
    /// The caller already held the lock.
    AlreadyHeld,
    /// Another client holds the lock.
    Denied(String),
}

/// Filename to owning-client table.
#[derive(Debug, Clone, Default)]
pub struct LockManager {
    table: Arc<Mutex<HashMap<String, String>>>,
}

impl LockManager {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to take the write lock on `filename` for `client_id`.
    pub fn acquire(&self, filename: &str, client_id: &str) -> AcquireOutcome {
        let mut table = self.table.lock();
        match table.get(filename) {
            None => {
                table.insert(filename.to_string(), client_id.to_string());
                debug!(file = filename, client_id, "write lock granted");
                AcquireOutcome::Granted
            }
            Some(holder) if holder == client_id => AcquireOutcome::AlreadyHeld,
            Some(holder) => AcquireOutcome::Denied(holder.clone()),
        }
    }

    /// Removes the entry for `filename`, whoever holds it.
    pub fn release(&self, filename: &str) {
        if let Some(holder) = self.table.lock().remove(filename) {
            debug!(file = filename, client_id = %holder, "write lock released");
        }
    }

    /// Confirms `client_id` holds the lock and hands out a lease that
    /// releases it when dropped.
    ///
    /// A missing or foreign entry is an ownership violation and leaves the
    /// table untouched.
    pub fn verify(&self, filename: &str, client_id: &str) -> ServiceResult<WriteLease> {
        let table = self.table.lock();
        match table.get(filename) {
            Some(holder) if holder == client_id => Ok(WriteLease {
                manager: self.clone(),
                filename: filename.to_string(),
            }),
            _ => Err(ServiceError::OwnershipViolation {
                name: filename.to_string(),
                client_id: client_id.to_string(),
            }),
        }
    }

    /// Current holder of `filename`, if any.
    pub fn holder(&self, filename: &str) -> Option<String> {
        self.table.lock().get(filename).cloned()
    }

    /// Number of held locks.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    /// True if no lock is held.
    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }
}

/// Proof of ownership for one Store or Delete. Dropping it releases the lock.
#[derive(Debug)]
pub struct WriteLease {
    manager: LockManager,
    filename: String,
}

impl WriteLease {
    /// The locked filename.
    pub fn filename(&self) -> &str {
        &self.filename
    }
}

impl Drop for WriteLease {
    fn drop(&mut self) {
        self.manager.release(&self.filename);
    }
}
