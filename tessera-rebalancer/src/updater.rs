//! Ideal state updater
//!
//! Applies a pure `current -> Option<next>` function to a table's ideal state
//! through compare-and-set. The state is re-read before every attempt, so a
//! conflicting write is retried against fresh state instead of being lost.

use tracing::{debug, instrument, warn};

use tessera_core::{IdealState, RetryPolicy, Result, SegmentAssignment, TesseraError};

use crate::cluster::ClusterStateStore;
use crate::metrics;

/// Outcome of an ideal state update
#[derive(Debug, Clone)]
pub struct IdealStateUpdate {
    /// State after the update (or the unchanged state)
    pub ideal_state: IdealState,
    /// Whether a write happened
    pub updated: bool,
    pub attempts: u32,
}

/// Update a table's ideal state with retries.
///
/// `updater` returns `None` (or an identical assignment) when there is nothing
/// to change. That is accepted when `no_change_ok` is set and an error
/// otherwise. Running out of attempts on version conflicts is
/// `ConcurrentModification`; a store failure on the last attempt is `Cluster`.
#[instrument(skip(store, updater, policy))]
pub async fn update_ideal_state<S, F>(
    store: &S,
    table: &str,
    updater: F,
    policy: &RetryPolicy,
    no_change_ok: bool,
) -> Result<IdealStateUpdate>
where
    S: ClusterStateStore + ?Sized,
    F: Fn(&SegmentAssignment) -> Option<SegmentAssignment> + Send + Sync,
{
    let max_attempts = policy.max_attempts();
    // Store failure of the latest attempt, as opposed to a version conflict
    let mut store_error: Option<String> = None;

    for attempt in 0..max_attempts {
        if attempt > 0 {
            tokio::time::sleep(policy.delay(attempt - 1)).await;
        }

        let current = match store.get_ideal_state(table).await {
            Ok(Some(current)) => current,
            Ok(None) => return Err(TesseraError::TableNotFound(table.to_string())),
            Err(e) => {
                warn!(table = %table, attempt, error = %e, "Failed to read ideal state");
                store_error = Some(format!("failed to read ideal state of {}: {}", table, e));
                continue;
            }
        };

        let next = match updater(&current.assignment) {
            Some(next) if next != current.assignment => next,
            _ if no_change_ok => {
                return Ok(IdealStateUpdate {
                    ideal_state: current,
                    updated: false,
                    attempts: attempt + 1,
                });
            }
            _ => {
                return Err(TesseraError::Cluster(format!(
                    "ideal state update for {} produced no change",
                    table
                )));
            }
        };

        match store
            .compare_and_set_ideal_state(table, current.version, next.clone())
            .await
        {
            Ok(true) => {
                debug!(table = %table, version = current.version + 1, attempt, "Ideal state updated");
                return Ok(IdealStateUpdate {
                    ideal_state: IdealState {
                        table_name: current.table_name,
                        version: current.version + 1,
                        assignment: next,
                    },
                    updated: true,
                    attempts: attempt + 1,
                });
            }
            Ok(false) => {
                store_error = None;
                metrics::record_ideal_state_conflict();
                debug!(table = %table, version = current.version, attempt, "Ideal state version conflict");
            }
            Err(e) => {
                warn!(table = %table, attempt, error = %e, "Failed to write ideal state");
                store_error = Some(format!("failed to write ideal state of {}: {}", table, e));
            }
        }
    }

    if let Some(e) = store_error {
        return Err(TesseraError::Cluster(e));
    }
    Err(TesseraError::ConcurrentModification {
        resource: table.to_string(),
        attempts: max_attempts,
    })
}
