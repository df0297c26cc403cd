use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use super::engine::Engine;
use crate::models::{EstimateFilter, EstimateStatus, PriceTick};
use crate::persistence::{EstimateStore, RedisStore};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarkPrice {
    pub price: f64,
    pub funding_rate: Option<f64>,
    /// Exchange time of the observation, when the source records one
    pub timestamp: Option<DateTime<Utc>>,
}

impl MarkPrice {
    /// Parse a `mark_price` hash (`mark_price`, `funding_rate`, and
    /// `timestamp` in epoch milliseconds); `None` without a positive price
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<MarkPrice> {
        let price = fields
            .get("mark_price")
            .and_then(|p| p.parse::<f64>().ok())
            .filter(|p| p.is_finite() && *p > 0.0)?;
        let funding_rate = fields.get("funding_rate").and_then(|f| f.parse::<f64>().ok());
        let timestamp = fields
            .get("timestamp")
            .and_then(|t| t.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis);

        Some(MarkPrice {
            price,
            funding_rate,
            timestamp,
        })
    }
}

/// Where the latest mark price of a symbol is read from
#[async_trait]
pub trait MarkPriceSource: Send + Sync {
    /// `None` when there is no usable price yet
    async fn mark_price(&self, symbol: &str) -> Result<Option<MarkPrice>>;
}

#[async_trait]
impl MarkPriceSource for RedisStore {
    async fn mark_price(&self, symbol: &str) -> Result<Option<MarkPrice>> {
        let fields = self.mark_price_fields(symbol).await?;
        Ok(MarkPrice::from_fields(&fields))
    }
}

/// Polls mark prices for every symbol with an active estimate and feeds
/// them into the engine
pub struct MarkPriceFeed {
    source: Arc<dyn MarkPriceSource>,
    store: Arc<dyn EstimateStore>,
    poll_interval: Duration,
}

impl MarkPriceFeed {
    pub fn new(
        source: Arc<dyn MarkPriceSource>,
        store: Arc<dyn EstimateStore>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            store,
            poll_interval,
        }
    }

    /// Symbols that currently have an enabled listening estimate
    pub async fn watched_symbols(&self) -> Result<Vec<String>> {
        let filter = EstimateFilter {
            symbol: None,
            status: Some(EstimateStatus::Listening),
            enabled: Some(true),
        };
        let symbols: BTreeSet<String> = self
            .store
            .list(&filter)
            .await?
            .into_iter()
            .map(|e| e.symbol)
            .collect();
        Ok(symbols.into_iter().collect())
    }

    /// One polling pass; returns the number of ticks submitted
    pub async fn poll_once(&self, engine: &Engine) -> Result<usize> {
        let mut submitted = 0;

        for symbol in self.watched_symbols().await? {
            let mark = match self.source.mark_price(&symbol).await {
                Ok(Some(mark)) if mark.price > 0.0 => mark,
                Ok(_) => {
                    tracing::debug!(symbol = %symbol, "No mark price");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(symbol = %symbol, error = %e, "Failed to read mark price");
                    continue;
                }
            };

            let tick = PriceTick {
                symbol: symbol.clone(),
                price: mark.price,
                funding_rate: mark.funding_rate,
                timestamp: mark.timestamp.unwrap_or_else(Utc::now),
            };
            if engine.submit(tick).await {
                submitted += 1;
            }
        }

        Ok(submitted)
    }

    /// Poll until `shutdown` flips to true
    pub async fn run(&self, engine: &Engine, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(interval = ?self.poll_interval, "Mark price feed starting");

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once(engine).await {
                        tracing::error!(error = %e, "Mark price poll failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Mark price feed stopped");
    }
}
