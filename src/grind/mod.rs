// Grind tier classification of a trade's fill history
use serde::{Deserialize, Serialize};

use crate::models::{FillRecord, Trade};

/// Aggregate over the orders attributed to one tier
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GrindStatus {
    pub has_entry: bool,
    pub has_exit: bool,
    pub entry_count: u32,
    pub total_amount: f64,
    pub total_cost: f64,
    pub stake_amount: f64,
    /// Weighted average entry price, `None` when nothing is filled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_rate: Option<f64>,
    pub percentage: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TradeGrindSummary {
    pub grind_1: GrindStatus,
    pub grind_2: GrindStatus,
    pub grind_3: GrindStatus,
    pub grind_x: GrindStatus,
}

impl TradeGrindSummary {
    pub fn tier(&self, tier: GrindTier) -> &GrindStatus {
        match tier {
            GrindTier::One => &self.grind_1,
            GrindTier::Two => &self.grind_2,
            GrindTier::Three => &self.grind_3,
            GrindTier::X => &self.grind_x,
        }
    }

    fn tier_mut(&mut self, tier: GrindTier) -> &mut GrindStatus {
        match tier {
            GrindTier::One => &mut self.grind_1,
            GrindTier::Two => &mut self.grind_2,
            GrindTier::Three => &mut self.grind_3,
            GrindTier::X => &mut self.grind_x,
        }
    }

    fn tiers_mut(&mut self) -> [&mut GrindStatus; 4] {
        [
            &mut self.grind_1,
            &mut self.grind_2,
            &mut self.grind_3,
            &mut self.grind_x,
        ]
    }
}

/// Closed set of tiers; anything unattributable lands in `X`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GrindTier {
    One,
    Two,
    Three,
    X,
}

impl GrindTier {
    pub const ALL: [GrindTier; 4] = [GrindTier::One, GrindTier::Two, GrindTier::Three, GrindTier::X];

    fn index(&self) -> usize {
        match self {
            GrindTier::One => 0,
            GrindTier::Two => 1,
            GrindTier::Three => 2,
            GrindTier::X => 3,
        }
    }

    fn from_label(label: &str) -> Option<GrindTier> {
        match label {
            "1" => Some(GrindTier::One),
            "2" => Some(GrindTier::Two),
            "3" => Some(GrindTier::Three),
            "x" => Some(GrindTier::X),
            _ => None,
        }
    }
}

/// Meaning of an order tag once parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagKind {
    Entry(GrindTier),
    Exit(GrindTier),
    Other,
}

/// Parse `grind_<n>[_entry|_exit|_derisk]`; only the first word of the tag counts
fn parse_tag(tag: &str) -> TagKind {
    let word = tag.split_whitespace().next().unwrap_or("");
    let Some(rest) = word.strip_prefix("grind_") else {
        return TagKind::Other;
    };

    let (label, suffix) = match rest.split_once('_') {
        Some((label, suffix)) => (label, Some(suffix)),
        None => (rest, None),
    };

    let Some(tier) = GrindTier::from_label(label) else {
        return TagKind::Other;
    };

    match suffix {
        None | Some("entry") if tier != GrindTier::X => TagKind::Entry(tier),
        Some("exit") | Some("derisk") => TagKind::Exit(tier),
        _ => TagKind::Other,
    }
}

/// Buckets a trade's filled orders into grind tiers
///
/// Pure: the same order list always produces the same summary.
#[derive(Debug, Clone, Copy)]
pub struct GrindClassifier {
    /// When set, entries older than a tier's latest exit are treated as closed out
    pub reset_on_exit: bool,
}

impl Default for GrindClassifier {
    fn default() -> Self {
        Self { reset_on_exit: true }
    }
}

impl GrindClassifier {
    pub fn new(reset_on_exit: bool) -> Self {
        Self { reset_on_exit }
    }

    /// Summary for a trade reported by the execution service
    pub fn summarize_trade(&self, trade: &Trade) -> TradeGrindSummary {
        self.summarize(&trade.orders, trade.is_short, trade.leverage_or_one())
    }

    /// Classify `orders` (oldest first) of a long or short trade
    pub fn summarize(&self, orders: &[FillRecord], is_short: bool, leverage: f64) -> TradeGrindSummary {
        let (entry_side, exit_side) = if is_short { ("sell", "buy") } else { ("buy", "sell") };

        let mut summary = TradeGrindSummary::default();
        let mut exit_seen = [false; 4];

        // Newest first so that a tier's latest exit is seen before the entries it closed
        for order in orders.iter().rev().filter(|o| o.is_filled()) {
            let kind = order.ft_order_tag.as_deref().map(parse_tag).unwrap_or(TagKind::Other);

            if order.ft_order_side == entry_side {
                let tier = match kind {
                    TagKind::Entry(tier) => tier,
                    _ => GrindTier::X,
                };
                if self.reset_on_exit && exit_seen[tier.index()] {
                    continue;
                }
                let status = summary.tier_mut(tier);
                status.has_entry = true;
                status.entry_count += 1;
                status.total_amount += order.filled;
                status.total_cost += order.filled * order.fill_price();
            } else if order.ft_order_side == exit_side {
                match kind {
                    TagKind::Exit(tier) => {
                        exit_seen[tier.index()] = true;
                        summary.tier_mut(tier).has_exit = true;
                    }
                    // An untagged exit is flagged on X but closes out no entries
                    _ => summary.grind_x.has_exit = true,
                }
            }
        }

        let grand_total: f64 = GrindTier::ALL.iter().map(|t| summary.tier(*t).total_cost).sum();

        for status in summary.tiers_mut() {
            status.open_rate = if status.total_amount > 0.0 {
                Some(status.total_cost / status.total_amount)
            } else {
                None
            };
            status.stake_amount = if leverage > 0.0 {
                status.total_cost / leverage
            } else {
                status.total_cost
            };
            status.percentage = if grand_total > 0.0 {
                status.total_cost / grand_total * 100.0
            } else {
                0.0
            };
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(side: &str, tag: Option<&str>, filled: f64, price: f64) -> FillRecord {
        FillRecord {
            order_id: format!("{}-{}", side, price),
            ft_order_side: side.to_string(),
            ft_order_tag: tag.map(|t| t.to_string()),
            status: "closed".to_string(),
            filled,
            price,
            safe_price: Some(price),
            average_price: None,
            cost: Some(filled * price),
        }
    }

    #[test]
    fn test_parse_tag() {
        assert_eq!(parse_tag("grind_1_entry"), TagKind::Entry(GrindTier::One));
        assert_eq!(parse_tag("grind_2"), TagKind::Entry(GrindTier::Two));
        assert_eq!(parse_tag("grind_3_derisk extra words"), TagKind::Exit(GrindTier::Three));
        assert_eq!(parse_tag("grind_x_exit"), TagKind::Exit(GrindTier::X));
        assert_eq!(parse_tag("grind_x"), TagKind::Other);
        assert_eq!(parse_tag("grind_7_entry"), TagKind::Other);
        assert_eq!(parse_tag("open_long"), TagKind::Other);
        assert_eq!(parse_tag(""), TagKind::Other);
    }

    #[test]
    fn test_two_tiers_and_exit() {
        let orders = vec![
            fill("buy", Some("grind_1"), 1.0, 100.0),
            fill("buy", Some("grind_2"), 3.0, 100.0),
            fill("sell", None, 0.5, 110.0),
        ];

        let summary = GrindClassifier::default().summarize(&orders, false, 1.0);

        assert!((summary.grind_1.percentage - 25.0).abs() < 1e-9);
        assert!((summary.grind_2.percentage - 75.0).abs() < 1e-9);
        assert!(summary.grind_x.has_exit);
        assert!(!summary.grind_x.has_entry);
        assert!(!summary.grind_1.has_exit);
        assert_eq!(summary.grind_1.entry_count, 1);
        assert_eq!(summary.grind_2.total_cost, 300.0);
    }

    #[test]
    fn test_percentages_sum_to_hundred() {
        let orders = vec![
            fill("buy", Some("open_long"), 0.7, 61000.0),
            fill("buy", Some("grind_1_entry"), 0.1, 59000.0),
            fill("buy", Some("grind_2_entry"), 0.2, 57500.0),
            fill("buy", Some("grind_3_entry"), 0.3, 55250.0),
            fill("buy", Some("grind_1_entry"), 0.1, 58000.0),
        ];

        let summary = GrindClassifier::default().summarize(&orders, false, 3.0);
        let total: f64 = GrindTier::ALL.iter().map(|t| summary.tier(*t).percentage).sum();

        assert!((total - 100.0).abs() < 1e-6);
        assert_eq!(summary.grind_1.entry_count, 2);
        assert_eq!(summary.grind_x.entry_count, 1);
    }

    #[test]
    fn test_empty_trade_has_zero_everything() {
        let summary = GrindClassifier::default().summarize(&[], false, 5.0);

        for tier in GrindTier::ALL {
            let status = summary.tier(tier);
            assert_eq!(status.percentage, 0.0);
            assert_eq!(status.open_rate, None);
            assert!(!status.has_entry);
        }
    }

    #[test]
    fn test_open_rate_is_weighted_average() {
        let orders = vec![
            fill("buy", Some("grind_1_entry"), 1.0, 100.0),
            fill("buy", Some("grind_1_entry"), 3.0, 80.0),
        ];

        let summary = GrindClassifier::default().summarize(&orders, false, 2.0);

        assert_eq!(summary.grind_1.open_rate, Some(85.0));
        assert_eq!(summary.grind_1.stake_amount, 170.0);
    }

    #[test]
    fn test_zero_leverage_uses_cost_as_stake() {
        let orders = vec![fill("buy", Some("grind_2_entry"), 2.0, 50.0)];
        let summary = GrindClassifier::default().summarize(&orders, false, 0.0);
        assert_eq!(summary.grind_2.stake_amount, 100.0);
    }

    #[test]
    fn test_short_trade_sides_are_swapped() {
        let orders = vec![
            fill("sell", Some("grind_1_entry"), 1.0, 200.0),
            fill("buy", Some("grind_1_exit"), 1.0, 190.0),
        ];

        let summary = GrindClassifier::new(false).summarize(&orders, true, 1.0);

        assert!(summary.grind_1.has_entry);
        assert!(summary.grind_1.has_exit);
        assert_eq!(summary.grind_1.total_cost, 200.0);
    }

    #[test]
    fn test_entries_before_exit_are_closed_out() {
        let orders = vec![
            fill("buy", Some("grind_1_entry"), 1.0, 100.0),
            fill("sell", Some("grind_1_exit"), 1.0, 105.0),
            fill("buy", Some("grind_1_entry"), 2.0, 98.0),
        ];

        let summary = GrindClassifier::default().summarize(&orders, false, 1.0);
        assert_eq!(summary.grind_1.entry_count, 1);
        assert_eq!(summary.grind_1.total_amount, 2.0);
        assert!(summary.grind_1.has_exit);

        let summary = GrindClassifier::new(false).summarize(&orders, false, 1.0);
        assert_eq!(summary.grind_1.entry_count, 2);
    }

    #[test]
    fn test_untagged_exit_keeps_catch_all_entries() {
        let orders = vec![
            fill("buy", Some("open_long"), 1.0, 100.0),
            fill("buy", Some("grind_1_entry"), 1.0, 100.0),
            fill("sell", None, 0.5, 110.0),
        ];

        let summary = GrindClassifier::default().summarize(&orders, false, 1.0);

        assert!(summary.grind_x.has_exit);
        assert_eq!(summary.grind_x.entry_count, 1);
        assert_eq!(summary.grind_x.total_cost, 100.0);
        assert!((summary.grind_x.percentage - 50.0).abs() < 1e-9);
        assert!((summary.grind_1.percentage - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_explicit_grind_x_exit_closes_out_catch_all() {
        let orders = vec![
            fill("buy", Some("open_long"), 1.0, 100.0),
            fill("sell", Some("grind_x_exit"), 1.0, 110.0),
            fill("buy", None, 2.0, 90.0),
        ];

        let summary = GrindClassifier::default().summarize(&orders, false, 1.0);

        assert_eq!(summary.grind_x.entry_count, 1);
        assert_eq!(summary.grind_x.total_cost, 180.0);
    }

    #[test]
    fn test_unfilled_orders_are_ignored() {
        let mut pending = fill("buy", Some("grind_3_entry"), 0.0, 100.0);
        pending.status = "open".to_string();

        let summary = GrindClassifier::default().summarize(&[pending], false, 1.0);
        assert!(!summary.grind_3.has_entry);
    }

    #[test]
    fn test_deterministic() {
        let orders = vec![
            fill("buy", Some("grind_1"), 1.0, 100.0),
            fill("buy", Some("weird tag"), 1.0, 120.0),
            fill("sell", Some("grind_2_derisk"), 1.0, 130.0),
        ];
        let classifier = GrindClassifier::default();
        assert_eq!(
            classifier.summarize(&orders, false, 2.0),
            classifier.summarize(&orders, false, 2.0)
        );
    }
}
