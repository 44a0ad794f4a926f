//! Removal of everything a set of filters selects

use crate::protocol::Filter;
use container_runtime::{ContainerRuntime, RemoveOptions};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{info, warn};

/// A container or filter the sweep could not deal with
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepFailure {
    /// Container id, or the filter when listing itself failed
    pub target: String,
    /// Error reported by the runtime
    pub reason: String,
}

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Containers removed by this sweep
    pub removed: Vec<String>,
    /// Containers that were already gone when removal was attempted
    pub already_gone: Vec<String>,
    /// Containers or filters that failed
    pub failed: Vec<SweepFailure>,
}

impl SweepReport {
    /// Whether nothing failed
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Force-remove, with volumes, every container matched by any of `filters`.
///
/// Stopped containers are included. Errors on one container or filter are
/// recorded and never stop the rest of the sweep. Running the same sweep twice
/// is harmless: the second run finds nothing or counts containers as already
/// gone.
pub async fn sweep(runtime: &dyn ContainerRuntime, filters: &[Filter]) -> SweepReport {
    let mut report = SweepReport::default();
    let mut seen = BTreeSet::new();

    for filter in filters {
        let containers = match runtime.list(&filter.to_list_filter()).await {
            Ok(containers) => containers,
            Err(e) => {
                warn!(filter = %filter, error = %e, "Failed to list containers for filter");
                report.failed.push(SweepFailure {
                    target: filter.to_string(),
                    reason: e.to_string(),
                });
                continue;
            }
        };

        for container in containers {
            if !seen.insert(container.id.clone()) {
                continue;
            }

            let options = RemoveOptions {
                force: true,
                volumes: true,
            };
            match runtime.remove(&container.id, options).await {
                Ok(()) => {
                    info!(
                        container_id = %container.id,
                        image = %container.image,
                        "Removed container"
                    );
                    report.removed.push(container.id);
                }
                // a concurrent removal or auto-remove got there first
                Err(e) if e.is_not_found() || e.is_conflict() => {
                    info!(container_id = %container.id, "Container already gone");
                    report.already_gone.push(container.id);
                }
                Err(e) => {
                    warn!(container_id = %container.id, error = %e, "Failed to remove container");
                    report.failed.push(SweepFailure {
                        target: container.id,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    report
}
