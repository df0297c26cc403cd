use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::models::{EstimateFilter, EstimateId, EstimateStatus};
use crate::persistence::EstimateStore;
use crate::Result;

/// A triggered estimate with no recorded order past the grace period
///
/// Usually a crash between the claim and the gateway call. Needs a human:
/// the order may or may not exist on the exchange.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReconciliationAlert {
    pub estimate_id: EstimateId,
    pub symbol: String,
    pub triggered_at: DateTime<Utc>,
    pub age_secs: i64,
}

/// Report triggered estimates without an order; mutates nothing
pub async fn reconcile(
    store: &dyn EstimateStore,
    grace: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<ReconciliationAlert>> {
    let filter = EstimateFilter {
        status: Some(EstimateStatus::Triggered),
        ..Default::default()
    };

    let mut alerts = Vec::new();
    for estimate in store.list(&filter).await? {
        let age = now - estimate.updated_at;
        if age < grace {
            continue;
        }
        if !store.orders_for_estimate(estimate.id).await?.is_empty() {
            continue;
        }

        tracing::warn!(
            estimate_id = %estimate.id,
            symbol = %estimate.symbol,
            age_secs = age.num_seconds(),
            "Triggered estimate has no order"
        );
        alerts.push(ReconciliationAlert {
            estimate_id: estimate.id,
            symbol: estimate.symbol,
            triggered_at: estimate.updated_at,
            age_secs: age.num_seconds(),
        });
    }

    Ok(alerts)
}
