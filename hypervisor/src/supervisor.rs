//! Startup Supervisor: stop sandboxes left over from a previous run.
//!
//! Runs once before the orchestrator accepts work. Only instances under the
//! reserved name prefix are touched.

use tracing::{info, warn};

use crate::sandbox::{RuntimeError, SandboxRuntime};

/// Stop every running instance named `{prefix}-…`.
///
/// Returns the names that were stopped. A failure to stop one instance is
/// logged and does not stop the sweep; a failure to list is returned.
pub async fn cleanup_orphans(
    runtime: &dyn SandboxRuntime,
    prefix: &str,
) -> Result<Vec<String>, RuntimeError> {
    let head = format!("{prefix}-");
    let orphans: Vec<String> = runtime
        .list(prefix)
        .await?
        .into_iter()
        .filter(|name| name.starts_with(&head))
        .collect();
    if orphans.is_empty() {
        info!(prefix, "no orphaned sandboxes");
        return Ok(Vec::new());
    }

    let mut stopped = Vec::with_capacity(orphans.len());
    for name in orphans {
        match runtime.stop(&name).await {
            Ok(()) => {
                info!(instance = %name, "stopped orphaned sandbox");
                stopped.push(name);
            }
            Err(e) => warn!(instance = %name, error = %e, "failed to stop orphaned sandbox"),
        }
    }
    info!(prefix, count = stopped.len(), "orphan cleanup finished");
    Ok(stopped)
}
