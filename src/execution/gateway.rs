use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::models::{OrderType, Side, Trade};

/// Open-trade capacity of the execution service
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TradeSlots {
    pub current: u32,
    pub max: u32,
}

impl TradeSlots {
    pub fn is_full(&self) -> bool {
        self.current >= self.max
    }
}

/// Entry order: opens a trade or adds to an existing one
#[derive(Debug, Clone, PartialEq)]
pub struct EntryRequest {
    pub pair: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: f64,
    /// Quote-currency stake; `None` lets the service use its default
    pub stake_amount: Option<f64>,
    pub leverage: u32,
    pub tag: String,
}

/// Full or partial close of a trade
#[derive(Debug, Clone, PartialEq)]
pub struct ExitRequest {
    pub trade_id: u64,
    pub order_type: OrderType,
    /// Base-currency amount; `None` closes everything
    pub amount: Option<f64>,
}

/// What the service reported for an accepted order
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GatewayFill {
    pub trade_id: Option<u64>,
    pub order_id: Option<String>,
    pub amount: f64,
    pub price: f64,
}

/// Seam between the trigger engine and whatever places the orders
///
/// Implementations return an error for anything that is not a confirmed
/// acceptance. The dispatcher never retries a failed placement.
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    async fn open_trades(&self) -> Result<Vec<Trade>, GatewayError>;

    async fn trade_slots(&self) -> Result<TradeSlots, GatewayError>;

    async fn place_entry(&self, request: &EntryRequest) -> Result<GatewayFill, GatewayError>;

    async fn close_or_reduce(&self, request: &ExitRequest) -> Result<GatewayFill, GatewayError>;
}

/// Exchange pair for a futures market id, e.g. `BTCUSDT` -> `BTC/USDT:USDT`
pub fn futures_pair(symbol: &str) -> String {
    let symbol = symbol.to_uppercase();
    for quote in ["USDT", "USDC", "BTC", "ETH"] {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return format!("{}/{}:{}", base, quote, quote);
            }
        }
    }
    format!("{}/USDT:USDT", symbol)
}
