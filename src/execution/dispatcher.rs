use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use super::evaluator::Satisfied;
use super::gateway::{futures_pair, EntryRequest, ExecutionGateway, ExitRequest, GatewayFill};
use crate::error::GatewayError;
use crate::models::{
    ActionType, EstimateStatus, Order, OrderSide, OrderStatus, OrderType, PriceEstimate, Side,
    Trade,
};
use crate::persistence::EstimateStore;
use crate::Result;

/// Result of the claim step
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// `listening -> triggered` succeeded, this caller owns the estimate
    Won,
    /// Someone else moved the estimate first
    Lost,
    /// Refused before any gateway call, estimate is now `failed`
    Refused(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Placed(Order),
    Failed(String),
    Refused(String),
    ClaimLost,
}

/// Turns satisfied estimates into orders
///
/// Claim and gateway call are separate steps. The claim is a
/// compare-and-set on the store, the call runs afterwards with no lock held
/// and is bounded by `timeout`.
#[derive(Clone)]
pub struct TriggerDispatcher {
    store: Arc<dyn EstimateStore>,
    gateway: Arc<dyn ExecutionGateway>,
    timeout: Duration,
    short_funding_threshold: f64,
}

impl TriggerDispatcher {
    pub fn new(
        store: Arc<dyn EstimateStore>,
        gateway: Arc<dyn ExecutionGateway>,
        timeout: Duration,
        short_funding_threshold: f64,
    ) -> Self {
        Self {
            store,
            gateway,
            timeout,
            short_funding_threshold,
        }
    }

    pub fn store(&self) -> &Arc<dyn EstimateStore> {
        &self.store
    }

    /// Claim `satisfied.estimate` for this caller
    pub async fn claim(&self, satisfied: &Satisfied) -> Result<Claim> {
        let estimate = &satisfied.estimate;

        // Shorts are not opened or added to while funding pays longs too much
        if let Some(reason) = self.funding_refusal(estimate, satisfied.funding_rate) {
            let moved = self
                .store
                .try_transition(
                    estimate.id,
                    EstimateStatus::Listening,
                    EstimateStatus::Failed,
                    Some(reason.clone()),
                )
                .await?;

            if !moved {
                return Ok(Claim::Lost);
            }
            tracing::warn!(
                estimate_id = %estimate.id,
                symbol = %estimate.symbol,
                side = %estimate.side,
                action = %estimate.action_type,
                reason = %reason,
                "Trigger refused"
            );
            return Ok(Claim::Refused(reason));
        }

        let won = self
            .store
            .try_transition(
                estimate.id,
                EstimateStatus::Listening,
                EstimateStatus::Triggered,
                None,
            )
            .await?;

        if !won {
            tracing::debug!(estimate_id = %estimate.id, "Claim lost");
            return Ok(Claim::Lost);
        }

        tracing::info!(
            estimate_id = %estimate.id,
            symbol = %estimate.symbol,
            side = %estimate.side,
            action = %estimate.action_type,
            price = satisfied.observed_price,
            target = estimate.target_price,
            "Estimate triggered"
        );
        Ok(Claim::Won)
    }

    fn funding_refusal(&self, estimate: &PriceEstimate, funding_rate: Option<f64>) -> Option<String> {
        let rate = funding_rate?;
        if estimate.side == Side::Short
            && estimate.action_type.is_entry()
            && rate < self.short_funding_threshold
        {
            Some(format!(
                "funding rate {:.4}% below threshold {:.4}%",
                rate * 100.0,
                self.short_funding_threshold * 100.0
            ))
        } else {
            None
        }
    }

    /// Place the order for an estimate this caller has claimed
    ///
    /// A gateway failure or timeout moves the estimate `triggered -> failed`
    /// with the reason attached. Nothing is retried.
    pub async fn execute(&self, satisfied: &Satisfied) -> Result<DispatchOutcome> {
        let estimate = &satisfied.estimate;

        let placed = match tokio::time::timeout(self.timeout, self.place(satisfied)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(self.timeout)),
        };

        match placed {
            Ok(order) => {
                self.store.save_order(&order).await?;
                tracing::info!(
                    estimate_id = %estimate.id,
                    symbol = %estimate.symbol,
                    order_id = %order.id,
                    exchange_id = ?order.exchange_id,
                    price = order.price,
                    "Order placed"
                );
                Ok(DispatchOutcome::Placed(order))
            }
            Err(err) => {
                let reason = err.reason();
                let moved = self
                    .store
                    .try_transition(
                        estimate.id,
                        EstimateStatus::Triggered,
                        EstimateStatus::Failed,
                        Some(reason.clone()),
                    )
                    .await?;
                if !moved {
                    tracing::error!(
                        estimate_id = %estimate.id,
                        "Estimate left triggered state during dispatch"
                    );
                }
                tracing::warn!(
                    estimate_id = %estimate.id,
                    symbol = %estimate.symbol,
                    action = %estimate.action_type,
                    reason = %reason,
                    "Dispatch failed"
                );
                Ok(DispatchOutcome::Failed(reason))
            }
        }
    }

    /// Claim then execute
    pub async fn dispatch(&self, satisfied: &Satisfied) -> Result<DispatchOutcome> {
        match self.claim(satisfied).await? {
            Claim::Won => self.execute(satisfied).await,
            Claim::Lost => Ok(DispatchOutcome::ClaimLost),
            Claim::Refused(reason) => Ok(DispatchOutcome::Refused(reason)),
        }
    }

    async fn place(&self, satisfied: &Satisfied) -> std::result::Result<Order, GatewayError> {
        let estimate = &satisfied.estimate;
        let price = satisfied.observed_price;
        let pair = futures_pair(&estimate.symbol);

        match estimate.action_type {
            ActionType::Open => {
                let trades = self.gateway.open_trades().await?;

                // Check 1: one trade per pair
                if trades.iter().any(|t| t.is_open && t.pair == pair) {
                    return Err(GatewayError::Rejected(format!(
                        "open trade already exists for {}",
                        pair
                    )));
                }

                // Check 2: free trade slot
                let slots = self.gateway.trade_slots().await?;
                if slots.is_full() {
                    return Err(GatewayError::Rejected(format!(
                        "no free trade slot ({}/{})",
                        slots.current, slots.max
                    )));
                }

                let request = EntryRequest {
                    pair,
                    side: estimate.side,
                    order_type: estimate.order_type,
                    price,
                    stake_amount: estimate.stake_amount,
                    leverage: estimate.leverage,
                    tag: entry_tag(estimate, "open"),
                };
                let fill = self.gateway.place_entry(&request).await?;
                Ok(build_order(estimate, &fill, estimate.order_type, price, fill.amount))
            }

            ActionType::Addition => {
                let trades = self.gateway.open_trades().await?;
                let trade = matching_trade(&trades, &pair, estimate.side)?;

                let stake = addition_stake(trade, estimate.percentage).ok_or_else(|| {
                    GatewayError::Rejected(format!("no filled entry on trade {}", trade.trade_id))
                })?;

                let request = EntryRequest {
                    pair,
                    side: estimate.side,
                    order_type: OrderType::Limit,
                    price,
                    stake_amount: Some(stake),
                    leverage: estimate.leverage,
                    tag: entry_tag(estimate, "add"),
                };
                let fill = self.gateway.place_entry(&request).await?;
                Ok(build_order(estimate, &fill, OrderType::Limit, price, fill.amount))
            }

            ActionType::TakeProfit => {
                let trades = self.gateway.open_trades().await?;
                let trade = matching_trade(&trades, &pair, estimate.side)?;

                let amount = if estimate.percentage > 0.0 && estimate.percentage < 100.0 {
                    Some(trade.amount * estimate.percentage / 100.0)
                } else {
                    None
                };

                let request = ExitRequest {
                    trade_id: trade.trade_id,
                    order_type: estimate.order_type,
                    amount,
                };
                let fill = self.gateway.close_or_reduce(&request).await?;
                let quantity = amount.unwrap_or(trade.amount);
                Ok(build_order(estimate, &fill, estimate.order_type, price, quantity))
            }
        }
    }
}

fn entry_tag(estimate: &PriceEstimate, prefix: &str) -> String {
    match &estimate.tag {
        Some(tag) if !tag.trim().is_empty() => tag.clone(),
        _ => format!("{}_{}", prefix, estimate.side),
    }
}

fn matching_trade<'a>(
    trades: &'a [Trade],
    pair: &str,
    side: Side,
) -> std::result::Result<&'a Trade, GatewayError> {
    trades
        .iter()
        .find(|t| t.is_open && t.pair == pair && t.side() == side)
        .ok_or_else(|| GatewayError::Rejected(format!("no open {} trade for {}", side, pair)))
}

/// Stake for an addition: margin of the first filled entry scaled by `percentage`
fn addition_stake(trade: &Trade, percentage: f64) -> Option<f64> {
    let entry_side = match trade.side() {
        Side::Long => "buy",
        Side::Short => "sell",
    };

    let first = trade
        .orders
        .iter()
        .find(|o| o.is_filled() && o.ft_order_side == entry_side)?;

    let cost = first.cost.unwrap_or(first.filled * first.fill_price());
    let leverage = trade.leverage_or_one();
    let margin = if leverage > 0.0 { cost / leverage } else { cost };

    let stake = margin * percentage / 100.0;
    (stake > 0.0).then_some(stake)
}

fn build_order(
    estimate: &PriceEstimate,
    fill: &GatewayFill,
    order_type: OrderType,
    observed_price: f64,
    quantity: f64,
) -> Order {
    let side = match (estimate.action_type.is_entry(), estimate.side) {
        (true, Side::Long) | (false, Side::Short) => OrderSide::Buy,
        (true, Side::Short) | (false, Side::Long) => OrderSide::Sell,
    };
    let exchange_id = fill
        .order_id
        .clone()
        .or_else(|| fill.trade_id.map(|id| id.to_string()));
    let now = Utc::now();

    Order {
        id: uuid::Uuid::new_v4(),
        symbol: estimate.symbol.clone(),
        side,
        position_side: estimate.side,
        order_type,
        quantity,
        executed_qty: 0.0,
        price: if fill.price > 0.0 { fill.price } else { observed_price },
        margin_mode: estimate.margin_mode,
        status: OrderStatus::New,
        estimate_id: Some(estimate.id),
        exchange_id,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::gateway::TradeSlots;
    use crate::models::{FillRecord, NewEstimate};
    use crate::persistence::MemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct ScriptedGateway {
        trades: Vec<Trade>,
        slots: Option<TradeSlots>,
        reject_with: Option<GatewayError>,
        delay: Option<Duration>,
        entries: Mutex<Vec<EntryRequest>>,
        exits: Mutex<Vec<ExitRequest>>,
    }

    #[async_trait]
    impl ExecutionGateway for ScriptedGateway {
        async fn open_trades(&self) -> std::result::Result<Vec<Trade>, GatewayError> {
            Ok(self.trades.clone())
        }

        async fn trade_slots(&self) -> std::result::Result<TradeSlots, GatewayError> {
            Ok(self.slots.unwrap_or(TradeSlots { current: 0, max: 5 }))
        }

        async fn place_entry(
            &self,
            request: &EntryRequest,
        ) -> std::result::Result<GatewayFill, GatewayError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(err) = &self.reject_with {
                return Err(err.clone());
            }
            self.entries.lock().push(request.clone());
            Ok(GatewayFill {
                trade_id: Some(1),
                order_id: Some("ex-1".to_string()),
                amount: 0.01,
                price: request.price,
            })
        }

        async fn close_or_reduce(
            &self,
            request: &ExitRequest,
        ) -> std::result::Result<GatewayFill, GatewayError> {
            self.exits.lock().push(request.clone());
            Ok(GatewayFill {
                trade_id: Some(request.trade_id),
                ..Default::default()
            })
        }
    }

    fn long_trade() -> Trade {
        Trade {
            trade_id: 9,
            pair: "BTC/USDT:USDT".to_string(),
            is_open: true,
            is_short: false,
            amount: 0.2,
            leverage: Some(4.0),
            stake_amount: 3000.0,
            open_rate: 60000.0,
            orders: vec![FillRecord {
                order_id: "o1".to_string(),
                ft_order_side: "buy".to_string(),
                ft_order_tag: Some("grind_1_entry".to_string()),
                status: "closed".to_string(),
                filled: 0.2,
                price: 60000.0,
                safe_price: None,
                average_price: None,
                cost: Some(12000.0),
            }],
        }
    }

    async fn setup(
        gateway: ScriptedGateway,
        request: NewEstimate,
    ) -> (TriggerDispatcher, Arc<MemoryStore>, Arc<ScriptedGateway>, PriceEstimate) {
        let store = Arc::new(MemoryStore::new());
        let estimate = store.create(request).await.unwrap();
        let gateway = Arc::new(gateway);
        let dispatcher = TriggerDispatcher::new(
            store.clone(),
            gateway.clone(),
            Duration::from_millis(200),
            -0.002,
        );
        (dispatcher, store, gateway, estimate)
    }

    fn satisfied(estimate: &PriceEstimate, price: f64) -> Satisfied {
        Satisfied {
            estimate: estimate.clone(),
            observed_price: price,
            funding_rate: None,
        }
    }

    #[tokio::test]
    async fn test_open_places_order_with_estimate_id() {
        let request = NewEstimate::condition("BTCUSDT", Side::Long, ActionType::Open, 60000.0);
        let (dispatcher, store, gateway, estimate) =
            setup(ScriptedGateway::default(), request).await;

        let outcome = dispatcher.dispatch(&satisfied(&estimate, 59900.0)).await.unwrap();

        let DispatchOutcome::Placed(order) = outcome else {
            panic!("expected placed, got {:?}", outcome);
        };
        assert_eq!(order.estimate_id, Some(estimate.id));
        assert_eq!(order.side, OrderSide::Buy);
        assert_eq!(store.get(estimate.id).await.unwrap().status, EstimateStatus::Triggered);
        assert_eq!(store.orders_for_estimate(estimate.id).await.unwrap().len(), 1);

        let entries = gateway.entries.lock();
        assert_eq!(entries[0].pair, "BTC/USDT:USDT");
        assert_eq!(entries[0].tag, "open_long");
        assert_eq!(entries[0].price, 59900.0);
    }

    #[tokio::test]
    async fn test_rejected_ends_failed_without_order() {
        let gateway = ScriptedGateway {
            reject_with: Some(GatewayError::Rejected("insufficient balance".to_string())),
            ..Default::default()
        };
        let request = NewEstimate::condition("BTCUSDT", Side::Long, ActionType::Open, 60000.0);
        let (dispatcher, store, _, estimate) = setup(gateway, request).await;

        let outcome = dispatcher.dispatch(&satisfied(&estimate, 59900.0)).await.unwrap();

        assert!(matches!(outcome, DispatchOutcome::Failed(ref r) if r.contains("insufficient")));
        let stored = store.get(estimate.id).await.unwrap();
        assert_eq!(stored.status, EstimateStatus::Failed);
        assert!(stored.failure_reason.unwrap().contains("insufficient balance"));
        assert!(store.orders_for_estimate(estimate.id).await.unwrap().is_empty());

        let audit = store.audit_log(estimate.id).await.unwrap();
        assert_eq!(audit.len(), 2);
        assert_eq!(audit[1].from, EstimateStatus::Triggered);
        assert_eq!(audit[1].to, EstimateStatus::Failed);
    }

    #[tokio::test]
    async fn test_slow_gateway_times_out() {
        let gateway = ScriptedGateway {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let request = NewEstimate::condition("BTCUSDT", Side::Long, ActionType::Open, 60000.0);
        let (dispatcher, store, _, estimate) = setup(gateway, request).await;

        let outcome = dispatcher.dispatch(&satisfied(&estimate, 59900.0)).await.unwrap();

        assert!(matches!(outcome, DispatchOutcome::Failed(ref r) if r.contains("timed out")));
        assert_eq!(store.get(estimate.id).await.unwrap().status, EstimateStatus::Failed);
    }

    #[tokio::test]
    async fn test_second_dispatch_loses_claim() {
        let request = NewEstimate::condition("BTCUSDT", Side::Long, ActionType::Open, 60000.0);
        let (dispatcher, _, gateway, estimate) = setup(ScriptedGateway::default(), request).await;

        let first = dispatcher.dispatch(&satisfied(&estimate, 59900.0)).await.unwrap();
        let second = dispatcher.dispatch(&satisfied(&estimate, 59800.0)).await.unwrap();

        assert!(matches!(first, DispatchOutcome::Placed(_)));
        assert_eq!(second, DispatchOutcome::ClaimLost);
        assert_eq!(gateway.entries.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_open_refused_when_pair_has_trade() {
        let gateway = ScriptedGateway {
            trades: vec![long_trade()],
            ..Default::default()
        };
        let request = NewEstimate::condition("BTCUSDT", Side::Long, ActionType::Open, 60000.0);
        let (dispatcher, store, _, estimate) = setup(gateway, request).await;

        let outcome = dispatcher.dispatch(&satisfied(&estimate, 59900.0)).await.unwrap();

        assert!(matches!(outcome, DispatchOutcome::Failed(ref r) if r.contains("already exists")));
        assert_eq!(store.get(estimate.id).await.unwrap().status, EstimateStatus::Failed);
    }

    #[tokio::test]
    async fn test_open_refused_when_slots_full() {
        let gateway = ScriptedGateway {
            slots: Some(TradeSlots { current: 3, max: 3 }),
            ..Default::default()
        };
        let request = NewEstimate::condition("ETHUSDT", Side::Short, ActionType::Open, 3000.0);
        let (dispatcher, _, _, estimate) = setup(gateway, request).await;

        let outcome = dispatcher.dispatch(&satisfied(&estimate, 3010.0)).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Failed(ref r) if r.contains("slot")));
    }

    #[tokio::test]
    async fn test_addition_stake_from_first_entry_margin() {
        let gateway = ScriptedGateway {
            trades: vec![long_trade()],
            ..Default::default()
        };
        let mut request =
            NewEstimate::condition("BTCUSDT", Side::Long, ActionType::Addition, 58000.0);
        request.percentage = 50.0;
        request.tag = Some("grind_2_entry".to_string());
        let (dispatcher, _, gateway, estimate) = setup(gateway, request).await;

        dispatcher.dispatch(&satisfied(&estimate, 57900.0)).await.unwrap();

        let entries = gateway.entries.lock();
        // 12000 cost / 4x leverage = 3000 margin, half of it
        assert_eq!(entries[0].stake_amount, Some(1500.0));
        assert_eq!(entries[0].order_type, OrderType::Limit);
        assert_eq!(entries[0].tag, "grind_2_entry");
    }

    #[tokio::test]
    async fn test_addition_without_trade_fails() {
        let mut request =
            NewEstimate::condition("BTCUSDT", Side::Short, ActionType::Addition, 62000.0);
        request.percentage = 50.0;
        let gateway = ScriptedGateway {
            trades: vec![long_trade()],
            ..Default::default()
        };
        let (dispatcher, _, _, estimate) = setup(gateway, request).await;

        let outcome = dispatcher.dispatch(&satisfied(&estimate, 62100.0)).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Failed(ref r) if r.contains("no open short")));
    }

    #[tokio::test]
    async fn test_take_profit_partial_amount() {
        let gateway = ScriptedGateway {
            trades: vec![long_trade()],
            ..Default::default()
        };
        let mut request =
            NewEstimate::condition("BTCUSDT", Side::Long, ActionType::TakeProfit, 65000.0);
        request.percentage = 25.0;
        let (dispatcher, _, gateway, estimate) = setup(gateway, request).await;

        let outcome = dispatcher.dispatch(&satisfied(&estimate, 65100.0)).await.unwrap();

        let DispatchOutcome::Placed(order) = outcome else {
            panic!("expected placed, got {:?}", outcome);
        };
        assert_eq!(order.side, OrderSide::Sell);
        let exits = gateway.exits.lock();
        assert_eq!(exits[0].trade_id, 9);
        assert!((exits[0].amount.unwrap() - 0.05).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_full_take_profit_closes_all() {
        let gateway = ScriptedGateway {
            trades: vec![long_trade()],
            ..Default::default()
        };
        let mut request =
            NewEstimate::condition("BTCUSDT", Side::Long, ActionType::TakeProfit, 65000.0);
        request.percentage = 100.0;
        let (dispatcher, _, gateway, estimate) = setup(gateway, request).await;

        dispatcher.dispatch(&satisfied(&estimate, 65100.0)).await.unwrap();
        assert_eq!(gateway.exits.lock()[0].amount, None);
    }

    #[tokio::test]
    async fn test_negative_funding_refuses_short_entry() {
        let request = NewEstimate::condition("BTCUSDT", Side::Short, ActionType::Open, 60000.0);
        let (dispatcher, store, gateway, estimate) =
            setup(ScriptedGateway::default(), request).await;

        let mut hit = satisfied(&estimate, 60100.0);
        hit.funding_rate = Some(-0.005);
        let outcome = dispatcher.dispatch(&hit).await.unwrap();

        assert!(matches!(outcome, DispatchOutcome::Refused(ref r) if r.contains("funding")));
        assert_eq!(store.get(estimate.id).await.unwrap().status, EstimateStatus::Failed);
        assert!(gateway.entries.lock().is_empty());
    }

    #[tokio::test]
    async fn test_funding_guard_ignores_longs() {
        let request = NewEstimate::condition("BTCUSDT", Side::Long, ActionType::Open, 60000.0);
        let (dispatcher, _, _, estimate) = setup(ScriptedGateway::default(), request).await;

        let mut hit = satisfied(&estimate, 59900.0);
        hit.funding_rate = Some(-0.01);
        assert!(matches!(
            dispatcher.dispatch(&hit).await.unwrap(),
            DispatchOutcome::Placed(_)
        ));
    }
}
