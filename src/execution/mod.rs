// Tick evaluation, trigger dispatch and the execution-service client
pub mod dispatcher;
pub mod engine;
pub mod evaluator;
pub mod freqtrade;
pub mod gateway;
pub mod price_feed;
pub mod reconcile;

pub use dispatcher::{Claim, DispatchOutcome, TriggerDispatcher};
pub use engine::Engine;
pub use evaluator::{ConditionEvaluator, CrossingRule, CrossingRules, Satisfied};
pub use freqtrade::FreqtradeGateway;
pub use gateway::{
    futures_pair, EntryRequest, ExecutionGateway, ExitRequest, GatewayFill, TradeSlots,
};
pub use price_feed::{MarkPrice, MarkPriceFeed, MarkPriceSource};
pub use reconcile::{reconcile, ReconciliationAlert};
