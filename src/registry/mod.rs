use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::LaunchSpec;
use crate::error::{FleetError, Result};
use crate::process::health::HealthStatus;
use crate::process::restart::RestartPolicy;
use crate::process::types::{ManagedProcess, ProcessState, ProcessStatus};

/// Stable identifier for a managed process, supplied at registration time
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessId(String);

impl ProcessId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProcessId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ProcessId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Authoritative mapping from process id to its launch configuration and
/// runtime record.
///
/// Every record sits behind its own async mutex; holding that lock is what
/// serializes state transitions for one process while leaving unrelated
/// processes fully parallel. The outer map lock is never held across an
/// await point.
pub struct ProcessRegistry {
    inner: RwLock<Inner>,
}

struct Inner {
    records: HashMap<ProcessId, Arc<Mutex<ManagedProcess>>>,
    order: Vec<ProcessId>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                records: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    /// Register a launch configuration under `id`.
    ///
    /// The new record starts in `stopped` state; nothing is spawned here.
    ///
    /// # Errors
    /// * `DuplicateId` - a record with this id already exists
    /// * `InvalidSpec` - the launch spec failed validation
    pub fn register(&self, id: ProcessId, spec: LaunchSpec, policy: RestartPolicy) -> Result<()> {
        spec.validate()?;

        let mut inner = self.inner.write().expect("registry lock poisoned");
        if inner.records.contains_key(&id) {
            return Err(FleetError::DuplicateId(id.to_string()));
        }

        let record = ManagedProcess::new(id.clone(), spec, policy);
        inner.records.insert(id.clone(), Arc::new(Mutex::new(record)));
        inner.order.push(id);
        Ok(())
    }

    /// Remove a record. Records are never removed implicitly on process
    /// exit; exits only transition state.
    pub fn deregister(&self, id: &ProcessId) -> Result<()> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        inner
            .records
            .remove(id)
            .ok_or_else(|| FleetError::NotFound(id.to_string()))?;
        inner.order.retain(|other| other != id);
        Ok(())
    }

    pub fn contains(&self, id: &ProcessId) -> bool {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.records.contains_key(id)
    }

    /// Registered ids in insertion order
    pub fn ids(&self) -> Vec<ProcessId> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.order.clone()
    }

    /// Handle to the locked record; supervisor-internal callers hold this
    /// across a spawn to keep the whole transition atomic.
    pub(crate) fn record(&self, id: &ProcessId) -> Result<Arc<Mutex<ManagedProcess>>> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| FleetError::NotFound(id.to_string()))
    }

    /// Run a transactional update against the locked record
    pub async fn update<T, F>(&self, id: &ProcessId, f: F) -> Result<T>
    where
        F: FnOnce(&mut ManagedProcess) -> Result<T>,
    {
        let record = self.record(id)?;
        let mut proc = record.lock().await;
        f(&mut proc)
    }

    /// Apply a validated state transition
    ///
    /// # Errors
    /// * `NotFound` - unknown id
    /// * `InvalidTransition` - target state unreachable from the current one
    pub async fn update_state(&self, id: &ProcessId, next: ProcessState) -> Result<()> {
        self.update(id, |proc| proc.set_state(next)).await
    }

    /// Record a restart event: appends to the history, bumps the restart
    /// counter and stamps `last_restart`.
    pub async fn append_restart(&self, id: &ProcessId, at: SystemTime) -> Result<()> {
        self.update(id, |proc| {
            let window = proc.policy.window();
            proc.history.record(at);
            proc.history.prune(window, at);
            proc.restart_count += 1;
            proc.last_restart = Some(at);
            Ok(())
        })
        .await
    }

    /// Status snapshot for one process
    pub async fn get(&self, id: &ProcessId) -> Result<ProcessStatus> {
        let record = self.record(id)?;
        let proc = record.lock().await;
        Ok(proc.status())
    }

    /// Health snapshot for one process
    pub async fn health(&self, id: &ProcessId) -> Result<HealthStatus> {
        let record = self.record(id)?;
        let proc = record.lock().await;
        Ok(proc.health.snapshot())
    }

    /// Status snapshots for all processes, in registration order
    pub async fn list(&self) -> Vec<ProcessStatus> {
        let entries: Vec<Arc<Mutex<ManagedProcess>>> = {
            let inner = self.inner.read().expect("registry lock poisoned");
            inner
                .order
                .iter()
                .filter_map(|id| inner.records.get(id).cloned())
                .collect()
        };

        let mut statuses = Vec::with_capacity(entries.len());
        for entry in entries {
            let proc = entry.lock().await;
            statuses.push(proc.status());
        }
        statuses
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}
