use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::collections::HashMap;
use tokio::time::{timeout, Duration};

use super::{transition_allowed, EstimateStore};
use crate::error::EngineError;
use crate::models::{
    AuditEntry, EstimateFilter, EstimateId, EstimatePatch, EstimateStatus, NewEstimate, Order,
    Position, PriceEstimate, Side,
};
use crate::Result;

const KEY_ESTIMATE: &str = "price_estimate";
const KEY_ESTIMATE_INDEX: &str = "price_estimates";
const KEY_AUDIT: &str = "estimate_audit";
const KEY_ORDER: &str = "order";
const KEY_ESTIMATE_ORDERS: &str = "estimate_orders";
const KEY_POSITION: &str = "position";
const KEY_POSITION_INDEX: &str = "positions";

/// Compare-and-set on the status field plus the audit append, in one script
///
/// KEYS[1] estimate hash, KEYS[2] audit list
/// ARGV: expected status, new status, updated_at, failure reason ('' = none), audit entry
/// Returns -1 when the estimate is missing, 0 when the claim is lost, 1 on success.
const TRANSITION_SCRIPT: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then return -1 end
if status ~= ARGV[1] then return 0 end
redis.call('HSET', KEYS[1], 'status', ARGV[2], 'updated_at', ARGV[3])
if ARGV[4] ~= '' then redis.call('HSET', KEYS[1], 'failure_reason', ARGV[4]) end
redis.call('RPUSH', KEYS[2], ARGV[5])
return 1
"#;

/// Record rewrite guarded by the current status
///
/// KEYS[1] estimate hash, KEYS[2] audit list
/// ARGV: expected status, new status ('' = keep), data, updated_at,
///       audit entry ('' = none), '1' to clear the failure reason
/// Same return codes as the transition script.
const GUARDED_WRITE_SCRIPT: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then return -1 end
if status ~= ARGV[1] then return 0 end
redis.call('HSET', KEYS[1], 'data', ARGV[3], 'updated_at', ARGV[4])
if ARGV[2] ~= '' then redis.call('HSET', KEYS[1], 'status', ARGV[2]) end
if ARGV[5] ~= '' then redis.call('RPUSH', KEYS[2], ARGV[5]) end
if ARGV[6] == '1' then redis.call('HDEL', KEYS[1], 'failure_reason') end
return 1
"#;

fn estimate_key(id: EstimateId) -> String {
    format!("{}:{}", KEY_ESTIMATE, id)
}

fn audit_key(id: EstimateId) -> String {
    format!("{}:{}", KEY_AUDIT, id)
}

fn position_key(symbol: &str, side: Side) -> String {
    let side = match side {
        Side::Long => "LONG",
        Side::Short => "SHORT",
    };
    format!("{}:{}:{}", KEY_POSITION, symbol, side)
}

/// Rebuild an estimate from its hash; status fields are authoritative over `data`
fn decode_estimate(fields: HashMap<String, String>) -> Result<Option<PriceEstimate>> {
    let Some(data) = fields.get("data") else {
        return Ok(None);
    };
    let mut estimate: PriceEstimate = serde_json::from_str(data)?;

    if let Some(status) = fields.get("status") {
        estimate.status = serde_json::from_value(serde_json::Value::String(status.clone()))?;
    }
    if let Some(updated_at) = fields.get("updated_at") {
        estimate.updated_at = DateTime::parse_from_rfc3339(updated_at)
            .map_err(|e| EngineError::Storage(format!("bad updated_at: {}", e)))?
            .with_timezone(&Utc);
    }
    estimate.failure_reason = fields.get("failure_reason").cloned();

    Ok(Some(estimate))
}

/// Redis-backed store
///
/// Each estimate lives in a hash `price_estimate:{id}` holding the JSON record
/// (`data`) next to the mutable `status`, `updated_at` and `failure_reason`
/// fields, so status changes never rewrite the record itself.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    transition: Script,
    guarded_write: Script,
}

impl RedisStore {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;

        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| EngineError::Storage("Redis connection timeout after 5 seconds".to_string()))??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            conn,
            transition: Script::new(TRANSITION_SCRIPT),
            guarded_write: Script::new(GUARDED_WRITE_SCRIPT),
        })
    }

    /// Raw fields of the `mark_price:{symbol}` hash; empty when absent
    pub async fn mark_price_fields(&self, symbol: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        let key = format!("mark_price:{}", symbol);
        Ok(conn.hgetall(&key).await?)
    }

    async fn write_guarded(
        &self,
        estimate: &PriceEstimate,
        expected: EstimateStatus,
        new_status: Option<EstimateStatus>,
        audit: Option<&AuditEntry>,
        clear_reason: bool,
    ) -> Result<i64> {
        let mut conn = self.conn.clone();
        let data = serde_json::to_string(estimate)?;
        let audit = match audit {
            Some(entry) => serde_json::to_string(entry)?,
            None => String::new(),
        };

        let outcome: i64 = self
            .guarded_write
            .key(estimate_key(estimate.id))
            .key(audit_key(estimate.id))
            .arg(expected.as_str())
            .arg(new_status.map(|s| s.as_str()).unwrap_or(""))
            .arg(data)
            .arg(estimate.updated_at.to_rfc3339())
            .arg(audit)
            .arg(if clear_reason { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;
        Ok(outcome)
    }

    /// Edit a listening estimate; the status check and the write are one script
    async fn modify_listening<F>(&self, id: EstimateId, f: F) -> Result<PriceEstimate>
    where
        F: FnOnce(&mut PriceEstimate) -> Result<()> + Send,
    {
        let mut estimate = self.get(id).await?;
        if estimate.status != EstimateStatus::Listening {
            return Err(EngineError::InvalidState {
                id,
                status: estimate.status,
            });
        }

        f(&mut estimate)?;
        estimate.updated_at = Utc::now();

        match self
            .write_guarded(&estimate, EstimateStatus::Listening, None, None, false)
            .await?
        {
            1 => Ok(estimate),
            -1 => Err(EngineError::NotFound(format!("estimate {}", id))),
            _ => {
                // Claimed between the read and the write
                let current = self.get(id).await?;
                Err(EngineError::InvalidState {
                    id,
                    status: current.status,
                })
            }
        }
    }
}

#[async_trait]
impl EstimateStore for RedisStore {
    async fn list(&self, filter: &EstimateFilter) -> Result<Vec<PriceEstimate>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(KEY_ESTIMATE_INDEX).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.hgetall(format!("{}:{}", KEY_ESTIMATE, id));
        }
        let rows: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;

        let mut estimates = Vec::new();
        for (id, row) in ids.iter().zip(rows) {
            match decode_estimate(row) {
                Ok(Some(estimate)) if filter.matches(&estimate) => estimates.push(estimate),
                Ok(_) => {}
                Err(e) => tracing::error!(estimate_id = %id, "Failed to decode estimate: {}", e),
            }
        }
        estimates.sort_by_key(|e| e.created_at);
        Ok(estimates)
    }

    async fn get(&self, id: EstimateId) -> Result<PriceEstimate> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(estimate_key(id)).await?;
        decode_estimate(fields)?.ok_or_else(|| EngineError::NotFound(format!("estimate {}", id)))
    }

    async fn create(&self, request: NewEstimate) -> Result<PriceEstimate> {
        let estimate = request.into_estimate()?;
        let mut conn = self.conn.clone();

        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(
                estimate_key(estimate.id),
                &[
                    ("data", serde_json::to_string(&estimate)?),
                    ("status", estimate.status.as_str().to_string()),
                    ("updated_at", estimate.updated_at.to_rfc3339()),
                ],
            )
            .ignore()
            .sadd(KEY_ESTIMATE_INDEX, estimate.id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await?;

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
        let patch = patch.clone();
        self.modify_listening(id, move |e| patch.apply(e)).await
    }

    async fn disable(&self, id: EstimateId) -> Result<PriceEstimate> {
        self.modify_listening(id, |e| {
            e.enabled = false;
            Ok(())
        })
        .await
    }

    async fn enable(&self, id: EstimateId) -> Result<PriceEstimate> {
        self.modify_listening(id, |e| {
            e.enabled = true;
            Ok(())
        })
        .await
    }

    async fn reenable(&self, id: EstimateId) -> Result<PriceEstimate> {
        let mut estimate = self.get(id).await?;
        let from = estimate.status;
        if !from.is_terminal() {
            return Err(EngineError::InvalidState { id, status: from });
        }

        let now = Utc::now();
        estimate.status = EstimateStatus::Listening;
        estimate.enabled = true;
        estimate.failure_reason = None;
        estimate.updated_at = now;

        let entry = AuditEntry {
            estimate_id: id,
            from,
            to: EstimateStatus::Listening,
            reason: Some("re-enabled by user".to_string()),
            at: now,
        };

        match self
            .write_guarded(&estimate, from, Some(EstimateStatus::Listening), Some(&entry), true)
            .await?
        {
            1 => Ok(estimate),
            -1 => Err(EngineError::NotFound(format!("estimate {}", id))),
            _ => {
                let current = self.get(id).await?;
                Err(EngineError::InvalidState {
                    id,
                    status: current.status,
                })
            }
        }
    }

    async fn delete(&self, id: EstimateId) -> Result<()> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.srem(KEY_ESTIMATE_INDEX, id.to_string()).await?;
        let _: () = conn.del(estimate_key(id)).await?;
        if removed == 0 {
            return Err(EngineError::NotFound(format!("estimate {}", id)));
        }
        Ok(())
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

        let now = Utc::now();
        let entry = AuditEntry {
            estimate_id: id,
            from,
            to,
            reason: reason.clone(),
            at: now,
        };
        let failure_reason = if to == EstimateStatus::Failed {
            reason.unwrap_or_default()
        } else {
            String::new()
        };

        let mut conn = self.conn.clone();
        let outcome: i64 = self
            .transition
            .key(estimate_key(id))
            .key(audit_key(id))
            .arg(from.as_str())
            .arg(to.as_str())
            .arg(now.to_rfc3339())
            .arg(failure_reason)
            .arg(serde_json::to_string(&entry)?)
            .invoke_async(&mut conn)
            .await?;

        match outcome {
            1 => Ok(true),
            0 => Ok(false),
            _ => Err(EngineError::NotFound(format!("estimate {}", id))),
        }
    }

    async fn audit_log(&self, id: EstimateId) -> Result<Vec<AuditEntry>> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.lrange(audit_key(id), 0, -1).await?;
        raw.iter()
            .map(|entry| serde_json::from_str(entry).map_err(EngineError::from))
            .collect()
    }

    async fn save_order(&self, order: &Order) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(format!("{}:{}", KEY_ORDER, order.id), serde_json::to_string(order)?)
            .ignore();
        if let Some(estimate_id) = order.estimate_id {
            pipe.sadd(
                format!("{}:{}", KEY_ESTIMATE_ORDERS, estimate_id),
                order.id.to_string(),
            )
            .ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;

        tracing::debug!(order_id = %order.id, symbol = %order.symbol, "Saved order to Redis");
        Ok(())
    }

    async fn orders_for_estimate(&self, id: EstimateId) -> Result<Vec<Order>> {
        let mut conn = self.conn.clone();
        let order_ids: Vec<String> = conn
            .smembers(format!("{}:{}", KEY_ESTIMATE_ORDERS, id))
            .await?;

        let mut orders = Vec::new();
        for order_id in order_ids {
            let raw: Option<String> = conn.get(format!("{}:{}", KEY_ORDER, order_id)).await?;
            if let Some(raw) = raw {
                orders.push(serde_json::from_str(&raw)?);
            }
        }
        Ok(orders)
    }

    async fn save_position(&self, position: &Position) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = position_key(&position.symbol, position.side);

        let _: () = if position.size == 0.0 {
            redis::pipe()
                .atomic()
                .del(&key)
                .ignore()
                .srem(KEY_POSITION_INDEX, &key)
                .ignore()
                .query_async(&mut conn)
                .await?
        } else {
            redis::pipe()
                .atomic()
                .set(&key, serde_json::to_string(position)?)
                .ignore()
                .sadd(KEY_POSITION_INDEX, &key)
                .ignore()
                .query_async(&mut conn)
                .await?
        };
        Ok(())
    }

    async fn positions(&self) -> Result<Vec<Position>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.smembers(KEY_POSITION_INDEX).await?;

        let mut positions = Vec::new();
        for key in keys {
            let raw: Option<String> = conn.get(&key).await?;
            match raw {
                Some(raw) => positions.push(serde_json::from_str(&raw)?),
                None => tracing::debug!("Position index points at missing key {}", key),
            }
        }
        Ok(positions)
    }
}
