// Estimate, order and position storage
pub mod memory;
pub mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use async_trait::async_trait;

use crate::models::{
    AuditEntry, EstimateFilter, EstimateId, EstimatePatch, EstimateStatus, NewEstimate, Order,
    Position, PriceEstimate,
};
use crate::Result;

/// Storage of estimates and everything produced by triggering them
///
/// `try_transition` is the only status mutation the engine uses. It is a
/// compare-and-set: it succeeds only while the stored status equals `from`,
/// and the matching audit entry is written in the same atomic step.
#[async_trait]
pub trait EstimateStore: Send + Sync {
    async fn list(&self, filter: &EstimateFilter) -> Result<Vec<PriceEstimate>>;

    /// `NotFound` for unknown ids
    async fn get(&self, id: EstimateId) -> Result<PriceEstimate>;

    async fn create(&self, request: NewEstimate) -> Result<PriceEstimate>;

    /// Edit a listening estimate; `InvalidState` otherwise
    async fn update(&self, id: EstimateId, patch: &EstimatePatch) -> Result<PriceEstimate>;

    /// Switch evaluation off for a listening estimate
    async fn disable(&self, id: EstimateId) -> Result<PriceEstimate>;

    /// Switch evaluation back on for a listening estimate
    async fn enable(&self, id: EstimateId) -> Result<PriceEstimate>;

    /// Reset a terminal estimate to listening
    async fn reenable(&self, id: EstimateId) -> Result<PriceEstimate>;

    /// User-initiated removal; never called by the engine
    async fn delete(&self, id: EstimateId) -> Result<()>;

    /// Returns `false` when the stored status is not `from` (claim lost)
    async fn try_transition(
        &self,
        id: EstimateId,
        from: EstimateStatus,
        to: EstimateStatus,
        reason: Option<String>,
    ) -> Result<bool>;

    async fn audit_log(&self, id: EstimateId) -> Result<Vec<AuditEntry>>;

    async fn save_order(&self, order: &Order) -> Result<()>;

    async fn orders_for_estimate(&self, id: EstimateId) -> Result<Vec<Order>>;

    /// Overwrite the mirror for `symbol + side`; a zero size removes it
    async fn save_position(&self, position: &Position) -> Result<()>;

    async fn positions(&self) -> Result<Vec<Position>>;
}

/// Allowed status changes
///
/// `triggered -> failed` is reserved for the dispatcher when the gateway call
/// behind a successful claim fails. Leaving a terminal state otherwise goes
/// through `reenable`.
pub fn transition_allowed(from: EstimateStatus, to: EstimateStatus) -> bool {
    matches!(
        (from, to),
        (EstimateStatus::Listening, EstimateStatus::Triggered)
            | (EstimateStatus::Listening, EstimateStatus::Failed)
            | (EstimateStatus::Triggered, EstimateStatus::Failed)
    )
}
