use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::EngineError;

pub type EstimateId = Uuid;

/// Position direction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "long"),
            Side::Short => write!(f, "short"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Open,
    Addition,
    TakeProfit,
}

impl ActionType {
    /// Entries grow the position, take-profit shrinks it
    pub fn is_entry(&self) -> bool {
        matches!(self, ActionType::Open | ActionType::Addition)
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionType::Open => write!(f, "open"),
            ActionType::Addition => write!(f, "addition"),
            ActionType::TakeProfit => write!(f, "take_profit"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarginMode {
    Cross,
    Isolated,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    /// Fire on the first evaluation (manual one-shot actions)
    Immediate,
    /// Fire when the price reaches the target
    Condition,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EstimateStatus {
    Listening,
    Triggered,
    Failed,
}

impl EstimateStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EstimateStatus::Listening)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EstimateStatus::Listening => "listening",
            EstimateStatus::Triggered => "triggered",
            EstimateStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for EstimateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A standing conditional trade instruction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceEstimate {
    pub id: EstimateId,
    pub symbol: String, // Market id, e.g. BTCUSDT
    pub side: Side,
    pub action_type: ActionType,
    pub target_price: f64,
    pub percentage: f64, // 0-100
    pub leverage: u32,
    pub order_type: OrderType,
    pub margin_mode: MarginMode,
    pub trigger_type: TriggerType,
    pub enabled: bool,
    pub status: EstimateStatus,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub stake_amount: Option<f64>, // Quote currency margin for opens
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PriceEstimate {
    /// Listening and switched on
    pub fn is_active(&self) -> bool {
        self.enabled && self.status == EstimateStatus::Listening
    }

    /// Rules a stored estimate must satisfy after create and after every edit
    pub fn validate(&self) -> Result<(), EngineError> {
        validate_trigger(self.action_type, self.trigger_type, self.target_price, self.percentage)
    }
}

fn validate_trigger(
    action_type: ActionType,
    trigger_type: TriggerType,
    target_price: f64,
    percentage: f64,
) -> Result<(), EngineError> {
    match action_type {
        ActionType::Addition if percentage <= 0.0 => {
            return Err(EngineError::Validation(format!(
                "addition requires percentage > 0, got {:.2}",
                percentage
            )));
        }
        ActionType::TakeProfit if percentage <= 0.0 || percentage > 100.0 => {
            return Err(EngineError::Validation(format!(
                "take_profit requires percentage in (0, 100], got {:.2}",
                percentage
            )));
        }
        _ => {}
    }

    if trigger_type == TriggerType::Condition && target_price <= 0.0 {
        return Err(EngineError::Validation(
            "condition trigger requires target_price > 0".to_string(),
        ));
    }
    Ok(())
}

/// User request to create an estimate; unset fields take defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEstimate {
    pub symbol: String,
    pub side: Side,
    pub action_type: ActionType,
    #[serde(default)]
    pub target_price: f64,
    #[serde(default)]
    pub percentage: f64,
    #[serde(default)]
    pub leverage: u32,
    #[serde(default)]
    pub order_type: Option<OrderType>,
    #[serde(default)]
    pub margin_mode: Option<MarginMode>,
    #[serde(default)]
    pub trigger_type: Option<TriggerType>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub stake_amount: Option<f64>,
}

const DEFAULT_LEVERAGE: u32 = 5;

impl NewEstimate {
    /// Condition-triggered request with defaults for everything else
    pub fn condition(symbol: &str, side: Side, action_type: ActionType, target_price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            action_type,
            target_price,
            percentage: 0.0,
            leverage: 0,
            order_type: None,
            margin_mode: None,
            trigger_type: Some(TriggerType::Condition),
            tag: None,
            stake_amount: None,
        }
    }

    /// Validate and apply defaults, producing a listening, enabled estimate
    pub fn into_estimate(self) -> Result<PriceEstimate, EngineError> {
        let symbol = self.symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return Err(EngineError::Validation("symbol must not be empty".to_string()));
        }

        let trigger_type = self.trigger_type.unwrap_or(TriggerType::Condition);
        validate_trigger(self.action_type, trigger_type, self.target_price, self.percentage)?;

        if let Some(stake) = self.stake_amount {
            if stake < 0.0 {
                return Err(EngineError::Validation("stake_amount must not be negative".to_string()));
            }
        }

        let now = Utc::now();
        Ok(PriceEstimate {
            id: Uuid::new_v4(),
            symbol,
            side: self.side,
            action_type: self.action_type,
            target_price: self.target_price,
            percentage: self.percentage,
            leverage: if self.leverage == 0 { DEFAULT_LEVERAGE } else { self.leverage },
            order_type: self.order_type.unwrap_or(OrderType::Limit),
            margin_mode: self.margin_mode.unwrap_or(MarginMode::Cross),
            trigger_type,
            enabled: true,
            status: EstimateStatus::Listening,
            tag: self.tag.filter(|t| !t.is_empty()),
            stake_amount: self.stake_amount.filter(|s| *s > 0.0),
            failure_reason: None,
            created_at: now,
            updated_at: now,
        })
    }
}

/// User edit of a listening estimate; `None` leaves the field untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EstimatePatch {
    pub target_price: Option<f64>,
    pub percentage: Option<f64>,
    pub leverage: Option<u32>,
    pub order_type: Option<OrderType>,
    pub margin_mode: Option<MarginMode>,
    pub trigger_type: Option<TriggerType>,
    pub stake_amount: Option<f64>,
    pub tag: Option<String>,
}

impl EstimatePatch {
    /// Apply to `estimate` only if the edited record still validates
    pub fn apply(&self, estimate: &mut PriceEstimate) -> Result<(), EngineError> {
        let mut edited = estimate.clone();
        if let Some(target) = self.target_price {
            if target <= 0.0 {
                return Err(EngineError::Validation("target_price must be > 0".to_string()));
            }
            edited.target_price = target;
        }
        if let Some(pct) = self.percentage {
            if !(0.0..=100.0).contains(&pct) {
                return Err(EngineError::Validation("percentage must be within 0-100".to_string()));
            }
            edited.percentage = pct;
        }
        if let Some(leverage) = self.leverage {
            if leverage == 0 {
                return Err(EngineError::Validation("leverage must be > 0".to_string()));
            }
            edited.leverage = leverage;
        }
        if let Some(order_type) = self.order_type {
            edited.order_type = order_type;
        }
        if let Some(margin_mode) = self.margin_mode {
            edited.margin_mode = margin_mode;
        }
        if let Some(trigger_type) = self.trigger_type {
            edited.trigger_type = trigger_type;
        }
        if let Some(stake) = self.stake_amount {
            edited.stake_amount = Some(stake).filter(|s| *s > 0.0);
        }
        if let Some(tag) = &self.tag {
            edited.tag = Some(tag.clone()).filter(|t| !t.is_empty());
        }
        edited.validate()?;
        edited.updated_at = Utc::now();
        *estimate = edited;
        Ok(())
    }
}

/// Selection used by `EstimateStore::list`
#[derive(Debug, Clone, Default)]
pub struct EstimateFilter {
    pub symbol: Option<String>,
    pub status: Option<EstimateStatus>,
    pub enabled: Option<bool>,
}

impl EstimateFilter {
    /// Enabled, listening estimates for one symbol
    pub fn active_for(symbol: &str) -> Self {
        Self {
            symbol: Some(symbol.to_string()),
            status: Some(EstimateStatus::Listening),
            enabled: Some(true),
        }
    }

    pub fn matches(&self, estimate: &PriceEstimate) -> bool {
        self.symbol.as_ref().map_or(true, |s| *s == estimate.symbol)
            && self.status.map_or(true, |s| s == estimate.status)
            && self.enabled.map_or(true, |e| e == estimate.enabled)
    }
}

/// One status change, stored together with the change itself
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub estimate_id: EstimateId,
    pub from: EstimateStatus,
    pub to: EstimateStatus,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Single observation from the price feed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceTick {
    pub symbol: String,
    pub price: f64,
    #[serde(default)]
    pub funding_rate: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl PriceTick {
    pub fn new(symbol: &str, price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            price,
            funding_rate: None,
            timestamp: Utc::now(),
        }
    }

    /// A usable observation: finite and above zero
    pub fn has_valid_price(&self) -> bool {
        self.price.is_finite() && self.price > 0.0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    New,
    Filled,
    Cancelled,
}

/// Exchange-facing order record created by a trigger
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub position_side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    pub executed_qty: f64,
    pub price: f64,
    pub margin_mode: MarginMode,
    pub status: OrderStatus,
    pub estimate_id: Option<EstimateId>, // None for manual orders
    pub exchange_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Exchange-reported holding, replaced wholesale on refresh
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: u32,
    pub margin_mode: MarginMode,
    pub isolated_margin: f64,
    pub initial_margin: f64,
    pub maintenance_margin: f64,
    pub notional: f64,
    pub updated_at: DateTime<Utc>,
}

/// Open trade as reported by the execution service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trade {
    pub trade_id: u64,
    pub pair: String,
    pub is_open: bool,
    #[serde(default)]
    pub is_short: bool,
    pub amount: f64,
    #[serde(default)]
    pub leverage: Option<f64>,
    #[serde(default)]
    pub stake_amount: f64,
    #[serde(default)]
    pub open_rate: f64,
    #[serde(default)]
    pub orders: Vec<FillRecord>,
}

impl Trade {
    pub fn side(&self) -> Side {
        if self.is_short {
            Side::Short
        } else {
            Side::Long
        }
    }

    /// Reported leverage, 1.0 when absent
    pub fn leverage_or_one(&self) -> f64 {
        self.leverage.unwrap_or(1.0)
    }
}

/// Fill history entry of a trade
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FillRecord {
    #[serde(default)]
    pub order_id: String,
    pub ft_order_side: String, // buy | sell
    #[serde(default)]
    pub ft_order_tag: Option<String>,
    pub status: String, // closed == filled
    #[serde(default)]
    pub filled: f64,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub safe_price: Option<f64>,
    #[serde(default, rename = "average")]
    pub average_price: Option<f64>,
    #[serde(default)]
    pub cost: Option<f64>,
}

impl FillRecord {
    pub fn is_filled(&self) -> bool {
        self.status == "closed"
    }

    /// Best known execution price
    pub fn fill_price(&self) -> f64 {
        self.safe_price
            .or(self.average_price)
            .filter(|p| *p > 0.0)
            .unwrap_or(self.price)
    }
}
