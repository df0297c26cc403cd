use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::models::{ActionType, EstimateId, PriceEstimate, PriceTick, Side, TriggerType};

/// Which way an entry target is approached
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CrossingRule {
    /// Buy the dip / sell the rip: long entries fire at or below the target,
    /// short entries at or above it
    Favorable,
    /// Opposite of `Favorable`: long entries fire at or above the target
    Breakout,
    /// Fire when price reaches the target from the side it was on when the
    /// estimate was first observed
    Toward,
}

/// Per action type crossing rules for entries
///
/// Take-profit always fires in the profit direction of its side.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CrossingRules {
    pub open: CrossingRule,
    pub addition: CrossingRule,
}

impl Default for CrossingRules {
    fn default() -> Self {
        Self {
            open: CrossingRule::Favorable,
            addition: CrossingRule::Favorable,
        }
    }
}

/// Direction the price has to travel to reach the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Down,
    Up,
}

impl CrossingRules {
    /// Required direction for `estimate`, given the anchor price for `Toward`
    pub fn direction(&self, estimate: &PriceEstimate, anchor: f64) -> Direction {
        let favorable = match estimate.side {
            Side::Long => Direction::Down,
            Side::Short => Direction::Up,
        };

        let rule = match estimate.action_type {
            ActionType::Open => self.open,
            ActionType::Addition => self.addition,
            ActionType::TakeProfit => {
                return match estimate.side {
                    Side::Long => Direction::Up,
                    Side::Short => Direction::Down,
                };
            }
        };

        match rule {
            CrossingRule::Favorable => favorable,
            CrossingRule::Breakout => match favorable {
                Direction::Down => Direction::Up,
                Direction::Up => Direction::Down,
            },
            CrossingRule::Toward if anchor >= estimate.target_price => Direction::Down,
            CrossingRule::Toward => Direction::Up,
        }
    }
}

/// True when `current` sits at or beyond `target` in `direction`
///
/// Tested against the far side of the target, so a level jumped over
/// between two ticks still counts.
pub fn crossed(direction: Direction, current: f64, target: f64) -> bool {
    match direction {
        Direction::Down => current <= target,
        Direction::Up => current >= target,
    }
}

/// A listening estimate whose condition holds at `observed_price`
#[derive(Debug, Clone, PartialEq)]
pub struct Satisfied {
    pub estimate: PriceEstimate,
    pub observed_price: f64,
    pub funding_rate: Option<f64>,
}

/// Condition evaluation for one symbol
///
/// Keeps the previous observed price and the per-estimate anchors used by the
/// `Toward` rule. Ticks must be fed in order; it never touches the store.
#[derive(Debug)]
pub struct ConditionEvaluator {
    symbol: String,
    rules: CrossingRules,
    previous: Option<f64>,
    anchors: HashMap<EstimateId, f64>,
}

impl ConditionEvaluator {
    pub fn new(symbol: &str, rules: CrossingRules) -> Self {
        Self {
            symbol: symbol.to_string(),
            rules,
            previous: None,
            anchors: HashMap::new(),
        }
    }

    pub fn previous_price(&self) -> Option<f64> {
        self.previous
    }

    /// Satisfied estimates among `estimates` at `tick`
    ///
    /// Estimates that are not active (disabled or already claimed) are
    /// skipped, so repeating a tick has no side effects. A tick without a
    /// valid price satisfies nothing and does not replace the previous price.
    pub fn evaluate(&mut self, tick: &PriceTick, estimates: &[PriceEstimate]) -> Vec<Satisfied> {
        if !tick.has_valid_price() {
            return Vec::new();
        }
        let current = tick.price;
        let previous = self.previous;

        // Forget anchors of estimates that are gone or no longer listening
        self.anchors
            .retain(|id, _| estimates.iter().any(|e| e.id == *id && e.is_active()));

        let mut satisfied = Vec::new();

        for estimate in estimates {
            if estimate.symbol != self.symbol || !estimate.is_active() {
                continue;
            }

            let fire = match estimate.trigger_type {
                TriggerType::Immediate => true,
                TriggerType::Condition => {
                    let anchor = *self
                        .anchors
                        .entry(estimate.id)
                        .or_insert_with(|| previous.unwrap_or(current));
                    let direction = self.rules.direction(estimate, anchor);
                    crossed(direction, current, estimate.target_price)
                }
            };

            tracing::debug!(
                estimate_id = %estimate.id,
                symbol = %estimate.symbol,
                price = current,
                previous = ?previous,
                target = estimate.target_price,
                fire,
                "Evaluated estimate"
            );

            if fire {
                satisfied.push(Satisfied {
                    estimate: estimate.clone(),
                    observed_price: current,
                    funding_rate: tick.funding_rate,
                });
            }
        }

        self.previous = Some(current);
        satisfied
    }
}
