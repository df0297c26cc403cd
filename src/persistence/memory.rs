use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::{transition_allowed, EstimateStore};
use crate::error::EngineError;
use crate::models::{
    AuditEntry, EstimateFilter, EstimateId, EstimatePatch, EstimateStatus, NewEstimate, Order,
    Position, PriceEstimate, Side,
};
use crate::Result;

#[derive(Default)]
struct Inner {
    estimates: HashMap<EstimateId, PriceEstimate>,
    audit: HashMap<EstimateId, Vec<AuditEntry>>,
    orders: Vec<Order>,
    positions: HashMap<(String, Side), Position>,
}

/// Thread-safe in-process store
///
/// Every operation runs under one mutex, which makes `try_transition` and its
/// audit entry a single atomic step. The lock is never held across an await.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully formed estimate as-is (restores and tests)
    pub fn insert(&self, estimate: PriceEstimate) {
        self.inner.lock().estimates.insert(estimate.id, estimate);
    }

    fn modify_listening<F>(&self, id: EstimateId, f: F) -> Result<PriceEstimate>
    where
        F: FnOnce(&mut PriceEstimate) -> Result<()>,
    {
        let mut inner = self.inner.lock();
        let estimate = inner
            .estimates
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("estimate {}", id)))?;

        if estimate.status != EstimateStatus::Listening {
            return Err(EngineError::InvalidState {
                id,
                status: estimate.status,
            });
        }

        // Work on a copy so a failed edit leaves the record untouched
        let mut edited = estimate.clone();
        f(&mut edited)?;
        edited.updated_at = Utc::now();
        *estimate = edited.clone();
        Ok(edited)
    }
}

#[async_trait]
impl EstimateStore for MemoryStore {
    async fn list(&self, filter: &EstimateFilter) -> Result<Vec<PriceEstimate>> {
        let inner = self.inner.lock();
        let mut estimates: Vec<PriceEstimate> = inner
            .estimates
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        estimates.sort_by_key(|e| e.created_at);
        Ok(estimates)
    }

    async fn get(&self, id: EstimateId) -> Result<PriceEstimate> {
        self.inner
            .lock()
            .estimates
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("estimate {}", id)))
    }

    async fn create(&self, request: NewEstimate) -> Result<PriceEstimate> {
        let estimate = request.into_estimate()?;
        self.inner
            .lock()
            .estimates
            .insert(estimate.id, estimate.clone());

        tracing::info!(
            estimate_id = %estimate.id,
            symbol = %estimate.symbol,
            side = %estimate.side,
            action = %estimate.action_type,
            target = estimate.target_price,
            "Created price estimate"
        );
        Ok(estimate)
    }

    async fn update(&self, id: EstimateId, patch: &EstimatePatch) -> Result<PriceEstimate> {
        self.modify_listening(id, |e| patch.apply(e))
    }

    async fn disable(&self, id: EstimateId) -> Result<PriceEstimate> {
        self.modify_listening(id, |e| {
            e.enabled = false;
            Ok(())
        })
    }

    async fn enable(&self, id: EstimateId) -> Result<PriceEstimate> {
        self.modify_listening(id, |e| {
            e.enabled = true;
            Ok(())
        })
    }

    async fn reenable(&self, id: EstimateId) -> Result<PriceEstimate> {
        let mut inner = self.inner.lock();
        let estimate = inner
            .estimates
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("estimate {}", id)))?;

        let from = estimate.status;
        if !from.is_terminal() {
            return Err(EngineError::InvalidState { id, status: from });
        }

        let now = Utc::now();
        estimate.status = EstimateStatus::Listening;
        estimate.enabled = true;
        estimate.failure_reason = None;
        estimate.updated_at = now;
        let estimate = estimate.clone();

        inner.audit.entry(id).or_default().push(AuditEntry {
            estimate_id: id,
            from,
            to: EstimateStatus::Listening,
            reason: Some("re-enabled by user".to_string()),
            at: now,
        });
        Ok(estimate)
    }

    async fn delete(&self, id: EstimateId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .estimates
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(format!("estimate {}", id)))
    }

    async fn try_transition(
        &self,
        id: EstimateId,
        from: EstimateStatus,
        to: EstimateStatus,
        reason: Option<String>,
    ) -> Result<bool> {
        if !transition_allowed(from, to) {
            return Err(EngineError::Validation(format!(
                "transition {} -> {} is not allowed",
                from, to
            )));
        }

        let mut inner = self.inner.lock();
        let estimate = inner
            .estimates
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("estimate {}", id)))?;

        if estimate.status != from {
            return Ok(false);
        }

        let now = Utc::now();
        estimate.status = to;
        estimate.updated_at = now;
        if to == EstimateStatus::Failed {
            estimate.failure_reason = reason.clone();
        }

        inner.audit.entry(id).or_default().push(AuditEntry {
            estimate_id: id,
            from,
            to,
            reason,
            at: now,
        });
        Ok(true)
    }

    async fn audit_log(&self, id: EstimateId) -> Result<Vec<AuditEntry>> {
        Ok(self.inner.lock().audit.get(&id).cloned().unwrap_or_default())
    }

    async fn save_order(&self, order: &Order) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.orders.iter_mut().find(|o| o.id == order.id) {
            Some(existing) => *existing = order.clone(),
            None => inner.orders.push(order.clone()),
        }
        Ok(())
    }

    async fn orders_for_estimate(&self, id: EstimateId) -> Result<Vec<Order>> {
        Ok(self
            .inner
            .lock()
            .orders
            .iter()
            .filter(|o| o.estimate_id == Some(id))
            .cloned()
            .collect())
    }

    async fn save_position(&self, position: &Position) -> Result<()> {
        let mut inner = self.inner.lock();
        let key = (position.symbol.clone(), position.side);
        if position.size == 0.0 {
            inner.positions.remove(&key);
        } else {
            inner.positions.insert(key, position.clone());
        }
        Ok(())
    }

    async fn positions(&self) -> Result<Vec<Position>> {
        Ok(self.inner.lock().positions.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionType, MarginMode, OrderSide, OrderStatus, OrderType};
    use uuid::Uuid;

    async fn store_with_estimate() -> (MemoryStore, PriceEstimate) {
        let store = MemoryStore::new();
        let estimate = store
            .create(NewEstimate::condition("BTCUSDT", Side::Long, ActionType::Open, 60000.0))
            .await
            .unwrap();
        (store, estimate)
    }

    #[tokio::test]
    async fn test_get_unknown_is_not_found() {
        let store = MemoryStore::new();
        let result = store.get(Uuid::new_v4()).await;
        assert!(matches!(result, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let (store, estimate) = store_with_estimate().await;

        let won = store
            .try_transition(estimate.id, EstimateStatus::Listening, EstimateStatus::Triggered, None)
            .await
            .unwrap();
        let lost = store
            .try_transition(estimate.id, EstimateStatus::Listening, EstimateStatus::Triggered, None)
            .await
            .unwrap();

        assert!(won);
        assert!(!lost);
        assert_eq!(store.audit_log(estimate.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let (store, estimate) = store_with_estimate().await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .try_transition(
                        estimate.id,
                        EstimateStatus::Listening,
                        EstimateStatus::Triggered,
                        None,
                    )
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_edit_terminal_estimate_is_invalid_state() {
        let (store, estimate) = store_with_estimate().await;
        store
            .try_transition(estimate.id, EstimateStatus::Listening, EstimateStatus::Triggered, None)
            .await
            .unwrap();

        let patch = EstimatePatch {
            target_price: Some(59000.0),
            ..Default::default()
        };
        assert!(matches!(
            store.update(estimate.id, &patch).await,
            Err(EngineError::InvalidState { status: EstimateStatus::Triggered, .. })
        ));

        store
            .try_transition(
                estimate.id,
                EstimateStatus::Triggered,
                EstimateStatus::Failed,
                Some("rejected".to_string()),
            )
            .await
            .unwrap();
        assert!(matches!(
            store.disable(estimate.id).await,
            Err(EngineError::InvalidState { status: EstimateStatus::Failed, .. })
        ));
    }

    #[tokio::test]
    async fn test_disallowed_transition_is_rejected() {
        let (store, estimate) = store_with_estimate().await;
        let result = store
            .try_transition(estimate.id, EstimateStatus::Failed, EstimateStatus::Triggered, None)
            .await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn test_reenable_resets_failed() {
        let (store, estimate) = store_with_estimate().await;
        store
            .try_transition(
                estimate.id,
                EstimateStatus::Listening,
                EstimateStatus::Failed,
                Some("funding".to_string()),
            )
            .await
            .unwrap();
        assert_eq!(
            store.get(estimate.id).await.unwrap().failure_reason.as_deref(),
            Some("funding")
        );

        let restored = store.reenable(estimate.id).await.unwrap();
        assert_eq!(restored.status, EstimateStatus::Listening);
        assert!(restored.failure_reason.is_none());

        // Listening estimates are not terminal
        assert!(store.reenable(estimate.id).await.is_err());
    }

    #[tokio::test]
    async fn test_disable_hides_from_active_filter() {
        let (store, estimate) = store_with_estimate().await;
        store.disable(estimate.id).await.unwrap();

        let active = store.list(&EstimateFilter::active_for("BTCUSDT")).await.unwrap();
        assert!(active.is_empty());

        store.enable(estimate.id).await.unwrap();
        let active = store.list(&EstimateFilter::active_for("BTCUSDT")).await.unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn test_orders_and_positions() {
        let (store, estimate) = store_with_estimate().await;
        let now = Utc::now();
        let order = Order {
            id: Uuid::new_v4(),
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            position_side: Side::Long,
            order_type: OrderType::Limit,
            quantity: 0.01,
            executed_qty: 0.0,
            price: 60000.0,
            margin_mode: MarginMode::Cross,
            status: OrderStatus::New,
            estimate_id: Some(estimate.id),
            exchange_id: Some("42".to_string()),
            created_at: now,
            updated_at: now,
        };
        store.save_order(&order).await.unwrap();
        store.save_order(&order).await.unwrap();
        assert_eq!(store.orders_for_estimate(estimate.id).await.unwrap().len(), 1);

        let mut position = Position {
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            size: 0.01,
            entry_price: 60000.0,
            mark_price: 60100.0,
            unrealized_pnl: 1.0,
            leverage: 5,
            margin_mode: MarginMode::Cross,
            isolated_margin: 0.0,
            initial_margin: 120.0,
            maintenance_margin: 3.0,
            notional: 601.0,
            updated_at: now,
        };
        store.save_position(&position).await.unwrap();
        assert_eq!(store.positions().await.unwrap().len(), 1);

        position.size = 0.0;
        store.save_position(&position).await.unwrap();
        assert!(store.positions().await.unwrap().is_empty());
    }

    #[test]
    fn test_delete_removes_estimate() {
        tokio_test::block_on(async {
            let (store, estimate) = store_with_estimate().await;
            store.delete(estimate.id).await.unwrap();

            assert!(matches!(store.get(estimate.id).await, Err(EngineError::NotFound(_))));
            assert!(matches!(store.delete(estimate.id).await, Err(EngineError::NotFound(_))));
        });
    }
}
