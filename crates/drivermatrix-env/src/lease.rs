//! Scoped environment acquisition
//!
//! An [`EnvironmentLease`] owns a provisioned environment until it is
//! released. Release tears the environment down exactly once. A lease that
//! is dropped without release (a cancelled tier future, a panic) spawns the
//! teardown onto the current runtime instead.
//!
//! Provisioning itself runs as its own task. When the acquiring future
//! times out or is dropped, that task still runs to completion and tears
//! down whatever it produced, so an environment created halfway through a
//! cancelled acquire is never left running.

use crate::{EnvError, Environment, ProvisionRequest, Provisioner, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Owned handle to a provisioned environment
pub struct EnvironmentLease {
    label: String,
    env: Arc<dyn Environment>,
    released: bool,
}

impl EnvironmentLease {
    /// Provision an environment, bounded by `timeout`.
    pub async fn acquire(
        provisioner: Arc<dyn Provisioner>,
        request: &ProvisionRequest,
        timeout: Duration,
    ) -> Result<Self> {
        let mut pending = PendingProvision::spawn(provisioner, request.clone());
        match tokio::time::timeout(timeout, pending.join()).await {
            Ok(env) => Ok(Self::new(request.label.clone(), env?)),
            Err(_) => Err(EnvError::ProvisionTimeout {
                label: request.label.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    pub fn new(label: impl Into<String>, env: Arc<dyn Environment>) -> Self {
        Self {
            label: label.into(),
            env,
            released: false,
        }
    }

    /// Shared handle to the leased environment.
    pub fn env(&self) -> Arc<dyn Environment> {
        self.env.clone()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Tear the environment down. Teardown errors are logged and never returned.
    pub async fn release(mut self) {
        self.released = true;
        if let Err(e) = self.env.teardown().await {
            warn!(label = %self.label, error = %e, "Environment teardown failed");
        }
    }
}

impl Drop for EnvironmentLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let env = self.env.clone();
        let label = std::mem::take(&mut self.label);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = env.teardown().await {
                        warn!(label = %label, error = %e, "Deferred environment teardown failed");
                    }
                });
            }
            Err(_) => warn!(label = %label, "Environment lease dropped outside a runtime; not torn down"),
        }
    }
}

/// A provisioning task nobody has collected yet. Dropped uncollected, it
/// hands the task to a reaper that tears down the late environment.
struct PendingProvision {
    label: String,
    task: Option<JoinHandle<Result<Arc<dyn Environment>>>>,
}

impl PendingProvision {
    fn spawn(provisioner: Arc<dyn Provisioner>, request: ProvisionRequest) -> Self {
        let label = request.label.clone();
        let task = tokio::spawn(async move { provisioner.provision(&request).await });
        Self {
            label,
            task: Some(task),
        }
    }

    async fn join(&mut self) -> Result<Arc<dyn Environment>> {
        let Some(task) = self.task.as_mut() else {
            return Err(EnvError::ProvisionTask {
                label: self.label.clone(),
                reason: "already collected".to_string(),
            });
        };
        let joined = task.await;
        self.task = None;
        joined.map_err(|e| EnvError::ProvisionTask {
            label: self.label.clone(),
            reason: e.to_string(),
        })?
    }
}

impl Drop for PendingProvision {
    fn drop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        let label = std::mem::take(&mut self.label);
        debug!(label = %label, "Provisioning abandoned; tearing down once it finishes");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Ok(Ok(env)) = task.await {
                        if let Err(e) = env.teardown().await {
                            warn!(label = %label, error = %e, "Teardown of abandoned environment failed");
                        }
                    }
                });
            }
            Err(_) => warn!(label = %label, "Provisioning abandoned outside a runtime; not torn down"),
        }
    }
}

impl std::fmt::Debug for EnvironmentLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentLease")
            .field("label", &self.label)
            .field("released", &self.released)
            .finish()
    }
}
