//! Checkpoint writer
//!
//! Persists aggregated histograms as `AutoscalerCheckpoint` objects so a
//! restarted recommender does not lose its history. Writes happen under a
//! per-iteration deadline: the most overdue autoscalers go first, at least
//! `min_checkpoints` are written regardless of the deadline, and whatever
//! does not fit is picked up next iteration.

use chrono::{DateTime, Utc};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::crd::{AutoscalerCheckpoint, AutoscalerCheckpointSpec};
use crate::error::Error;
use crate::model::{AutoscalerId, ClusterModel};

/// Field manager used for server-side apply of checkpoints
const FIELD_MANAGER: &str = "rightsizer-recommender";

/// Writes aggregate state to the API server
pub struct CheckpointWriter {
    client: Client,
}

impl CheckpointWriter {
    /// Create a writer using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Write checkpoints, most-overdue autoscalers first. At least
    /// `min_checkpoints` objects are written even past the deadline; once
    /// the floor is met, each write races the remaining budget.
    /// Returns the number of checkpoints written.
    pub async fn store_checkpoints(
        &self,
        model: &mut ClusterModel,
        now: DateTime<Utc>,
        min_checkpoints: usize,
        deadline: Instant,
    ) -> usize {
        let order = order_by_staleness(model);
        let mut written = 0usize;

        'autoscalers: for id in order {
            let Some(autoscaler) = model.autoscaler(&id) else {
                continue;
            };
            let aggregates = model.aggregates_by_container_name(autoscaler);
            for (container_name, aggregate) in aggregates {
                if aggregate.is_empty() {
                    continue;
                }
                if written >= min_checkpoints && Instant::now() >= deadline {
                    warn!(
                        written,
                        "checkpoint deadline reached, remaining work deferred to next iteration"
                    );
                    break 'autoscalers;
                }
                let write = self.write_one(&id, &container_name, &aggregate, now);
                let result = if written >= min_checkpoints {
                    // Past the floor each write is cancellable at the deadline.
                    match tokio::time::timeout_at(deadline, write).await {
                        Ok(result) => result,
                        Err(_) => {
                            warn!(written, "checkpoint write cancelled at deadline");
                            break 'autoscalers;
                        }
                    }
                } else {
                    write.await
                };
                match result {
                    Ok(()) => written += 1,
                    Err(e) => {
                        warn!(
                            autoscaler = %id,
                            container = %container_name,
                            error = %e,
                            "failed to write checkpoint"
                        );
                    }
                }
            }
            if let Some(state) = model.autoscaler_mut(&id) {
                state.checkpoint_written = Some(now);
            }
        }
        debug!(written, "checkpoint pass complete");
        written
    }

    async fn write_one(
        &self,
        id: &AutoscalerId,
        container_name: &str,
        aggregate: &crate::model::AggregateContainerState,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let name = format!("{}-{}", id.name, container_name);
        let api: Api<AutoscalerCheckpoint> = Api::namespaced(self.client.clone(), &id.namespace);

        let mut checkpoint = AutoscalerCheckpoint::new(
            &name,
            AutoscalerCheckpointSpec {
                autoscaler_name: id.name.clone(),
                container_name: container_name.to_string(),
            },
        );
        checkpoint.metadata.namespace = Some(id.namespace.clone());

        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&checkpoint),
        )
        .await?;

        let mut status = aggregate.save_checkpoint();
        status.last_update_time = Some(now);
        api.patch_status(
            &name,
            &PatchParams::default(),
            &Patch::Merge(serde_json::json!({ "status": status })),
        )
        .await?;
        Ok(())
    }
}

/// Autoscaler ids ordered by time since their last checkpoint, oldest
/// first; never-checkpointed configs lead. The order guarantees progress
/// under persistent deadline pressure.
pub fn order_by_staleness(model: &ClusterModel) -> Vec<AutoscalerId> {
    let mut entries: Vec<(Option<DateTime<Utc>>, AutoscalerId)> = model
        .autoscalers()
        .map(|a| (a.checkpoint_written, a.id.clone()))
        .collect();
    entries.sort_by(|a, b| match (a.0, b.0) {
        (None, None) => a.1.cmp(&b.1),
        (None, Some(_)) => std::cmp::Ordering::Less,
        (Some(_), None) => std::cmp::Ordering::Greater,
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.1.cmp(&b.1)),
    });
    entries.into_iter().map(|(_, id)| id).collect()
}
