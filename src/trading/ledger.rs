//! Per-address position ledger: outcome shares by market plus a cash balance.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::api::PositionRecord;

/// Market and outcome key that routes lookups to the cash balance.
pub const CASH_KEY: &str = "CASH";

/// Outcome quantities keyed by market, then outcome.
pub type PositionMap = HashMap<String, HashMap<String, Decimal>>;

/// Copier over target quantity. Zero when the target holds nothing.
pub fn copy_ratio(copier: Decimal, target: Decimal) -> Result<Decimal> {
    if target.is_zero() {
        return Ok(Decimal::ZERO);
    }
    copier
        .checked_div(target)
        .ok_or_else(|| anyhow!("Ratio overflow: {} / {}", copier, target))
}

/// In-memory model of one wallet.
///
/// Positions are replaced wholesale by a refresh or nudged by local deltas.
/// Both take the write lock for the full mutation, so readers only ever see
/// a complete map.
#[derive(Debug)]
pub struct PositionLedger {
    address: String,
    positions: RwLock<PositionMap>,
    cash: RwLock<Decimal>,
}

impl PositionLedger {
    /// Create an empty ledger for `address`.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            positions: RwLock::new(HashMap::new()),
            cash: RwLock::new(Decimal::ZERO),
        }
    }

    /// Wallet this ledger models.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Quantity held, or zero if absent. `(CASH, CASH)` returns the cash balance.
    pub async fn get(&self, market_id: &str, outcome_id: &str) -> Decimal {
        if market_id == CASH_KEY && outcome_id == CASH_KEY {
            return self.cash().await;
        }
        self.positions
            .read()
            .await
            .get(market_id)
            .and_then(|outcomes| outcomes.get(outcome_id))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Current cash balance.
    pub async fn cash(&self) -> Decimal {
        *self.cash.read().await
    }

    /// Overwrite the cash balance, clamping negatives to zero.
    pub async fn set_cash(&self, amount: Decimal) {
        if amount < Decimal::ZERO {
            warn!(address = %self.address, amount = %amount, "Negative cash balance, clamping to 0");
        }
        *self.cash.write().await = amount.max(Decimal::ZERO);
    }

    /// Swap in a full snapshot. Zero-sized records are left out.
    pub async fn replace_positions(&self, records: Vec<PositionRecord>) -> usize {
        let mut fresh: PositionMap = HashMap::new();
        for record in records {
            if record.size <= Decimal::ZERO {
                continue;
            }
            let held = fresh
                .entry(record.market_id)
                .or_default()
                .entry(record.outcome_id)
                .or_insert(Decimal::ZERO);
            *held = held.checked_add(record.size).unwrap_or(Decimal::MAX);
        }

        let markets = fresh.len();
        *self.positions.write().await = fresh;
        markets
    }

    /// Add or subtract `amount`, clamping at zero. Returns the new quantity.
    pub async fn apply_delta(
        &self,
        market_id: &str,
        outcome_id: &str,
        amount: Decimal,
        is_add: bool,
    ) -> Decimal {
        let mut positions = self.positions.write().await;
        apply_locked(&self.address, &mut positions, market_id, outcome_id, amount, is_add)
    }

    /// Add `amount` to each listed outcome of a market.
    pub async fn add_to_outcomes(&self, market_id: &str, outcome_ids: &[String], amount: Decimal) {
        let mut positions = self.positions.write().await;
        for outcome_id in outcome_ids {
            apply_locked(&self.address, &mut positions, market_id, outcome_id, amount, true);
        }
    }

    /// Subtract `amount` from every outcome currently held in a market.
    pub async fn reduce_market(&self, market_id: &str, amount: Decimal) {
        let mut positions = self.positions.write().await;
        let outcome_ids: Vec<String> = match positions.get(market_id) {
            Some(outcomes) => outcomes.keys().cloned().collect(),
            None => return,
        };
        for outcome_id in &outcome_ids {
            apply_locked(&self.address, &mut positions, market_id, outcome_id, amount, false);
        }
    }

    /// Smaller side of a two-outcome market, zero for any other shape.
    pub async fn mergeable_amount(&self, market_id: &str) -> Decimal {
        let positions = self.positions.read().await;
        match positions.get(market_id) {
            Some(outcomes) if outcomes.len() == 2 => outcomes
                .values()
                .copied()
                .min()
                .unwrap_or(Decimal::ZERO),
            _ => Decimal::ZERO,
        }
    }

    /// Whether any outcome of the market is still held.
    pub async fn is_redeemable(&self, market_id: &str) -> bool {
        self.positions
            .read()
            .await
            .get(market_id)
            .map(|outcomes| outcomes.values().any(|q| !q.is_zero()))
            .unwrap_or(false)
    }

    /// Number of markets with a nonzero position.
    pub async fn market_count(&self) -> usize {
        self.positions.read().await.len()
    }

    #[cfg(test)]
    pub async fn snapshot(&self) -> PositionMap {
        self.positions.read().await.clone()
    }
}

fn apply_locked(
    address: &str,
    positions: &mut PositionMap,
    market_id: &str,
    outcome_id: &str,
    amount: Decimal,
    is_add: bool,
) -> Decimal {
    let outcomes = positions.entry(market_id.to_string()).or_default();
    let current = outcomes.get(outcome_id).copied().unwrap_or(Decimal::ZERO);
    let mut updated = if is_add {
        current.checked_add(amount).unwrap_or_else(|| {
            warn!(address = %address, market = %market_id, outcome = %outcome_id, "Position overflowed, saturating");
            Decimal::MAX
        })
    } else {
        current.checked_sub(amount).unwrap_or(Decimal::ZERO)
    };

    if updated < Decimal::ZERO {
        warn!(
            address = %address,
            market = %market_id,
            outcome = %outcome_id,
            value = %updated,
            "Position went negative, clamping to 0"
        );
        updated = Decimal::ZERO;
    }

    if updated.is_zero() {
        outcomes.remove(outcome_id);
    } else {
        outcomes.insert(outcome_id.to_string(), updated);
    }
    if outcomes.is_empty() {
        positions.remove(market_id);
        debug!(address = %address, market = %market_id, "Pruned empty market");
    }

    updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn record(market: &str, outcome: &str, size: Decimal) -> PositionRecord {
        PositionRecord {
            market_id: market.to_string(),
            outcome_id: outcome.to_string(),
            size,
        }
    }

    #[tokio::test]
    async fn test_get_absent_is_zero() {
        let ledger = PositionLedger::new("0xabc");
        assert_eq!(ledger.get("m", "o").await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_cash_sentinel_routes_to_balance() {
        let ledger = PositionLedger::new("0xabc");
        ledger.set_cash(dec!(250)).await;
        ledger.replace_positions(vec![record("m", CASH_KEY, dec!(3))]).await;

        assert_eq!(ledger.get(CASH_KEY, CASH_KEY).await, dec!(250));
        assert_eq!(ledger.get("m", CASH_KEY).await, dec!(3));
    }

    #[tokio::test]
    async fn test_delta_never_goes_negative() {
        let ledger = PositionLedger::new("0xabc");
        let steps = [
            (dec!(5), true),
            (dec!(7), false),
            (dec!(2), true),
            (dec!(1.5), false),
            (dec!(10), false),
            (dec!(0.25), true),
        ];
        for (amount, is_add) in steps {
            let value = ledger.apply_delta("m", "o", amount, is_add).await;
            assert!(value >= Decimal::ZERO);
            assert!(ledger.get("m", "o").await >= Decimal::ZERO);
        }
        assert_eq!(ledger.get("m", "o").await, dec!(0.25));
    }

    #[tokio::test]
    async fn test_clamped_delta_prunes_market() {
        let ledger = PositionLedger::new("0xabc");
        ledger.apply_delta("m", "o", dec!(4), true).await;
        assert_eq!(ledger.apply_delta("m", "o", dec!(9), false).await, Decimal::ZERO);
        assert_eq!(ledger.market_count().await, 0);
        assert!(ledger.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_delta_saturates_on_overflow() {
        let ledger = PositionLedger::new("0xabc");
        ledger.apply_delta("m", "o", Decimal::MAX, true).await;
        assert_eq!(ledger.apply_delta("m", "o", dec!(1), true).await, Decimal::MAX);
        assert_eq!(ledger.apply_delta("m", "o", Decimal::MAX, false).await, Decimal::ZERO);
        assert_eq!(ledger.market_count().await, 0);
    }

    #[tokio::test]
    async fn test_mergeable_amount_requires_two_outcomes() {
        let ledger = PositionLedger::new("0xabc");
        ledger.apply_delta("m", "yes", dec!(10), true).await;
        assert_eq!(ledger.mergeable_amount("m").await, Decimal::ZERO);

        ledger.apply_delta("m", "no", dec!(4), true).await;
        assert_eq!(ledger.mergeable_amount("m").await, dec!(4));

        ledger.apply_delta("m", "other", dec!(1), true).await;
        assert_eq!(ledger.mergeable_amount("m").await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_redeemable() {
        let ledger = PositionLedger::new("0xabc");
        assert!(!ledger.is_redeemable("m").await);
        ledger.apply_delta("m", "yes", dec!(1), true).await;
        assert!(ledger.is_redeemable("m").await);
    }

    #[tokio::test]
    async fn test_replace_positions_swaps_whole_map() {
        let ledger = PositionLedger::new("0xabc");
        ledger.apply_delta("old", "o", dec!(1), true).await;

        let markets = ledger
            .replace_positions(vec![
                record("a", "1", dec!(2)),
                record("a", "2", dec!(3)),
                record("b", "1", Decimal::ZERO),
            ])
            .await;

        assert_eq!(markets, 1);
        assert_eq!(ledger.get("old", "o").await, Decimal::ZERO);
        assert_eq!(ledger.mergeable_amount("a").await, dec!(2));
    }

    #[tokio::test]
    async fn test_reduce_market_hits_every_outcome() {
        let ledger = PositionLedger::new("0xabc");
        ledger.add_to_outcomes("m", &["1".to_string(), "2".to_string()], dec!(10)).await;
        ledger.apply_delta("m", "2", dec!(5), true).await;

        ledger.reduce_market("m", dec!(10)).await;
        assert_eq!(ledger.get("m", "1").await, Decimal::ZERO);
        assert_eq!(ledger.get("m", "2").await, dec!(5));
        assert_eq!(ledger.market_count().await, 1);

        ledger.reduce_market("missing", dec!(1)).await;
        assert_eq!(ledger.market_count().await, 1);
    }

    #[test]
    fn test_ratio_zero_denominator() {
        for numerator in [Decimal::ZERO, dec!(1), dec!(123456.789)] {
            assert_eq!(copy_ratio(numerator, Decimal::ZERO).unwrap(), Decimal::ZERO);
        }
        assert_eq!(copy_ratio(dec!(50), dec!(500)).unwrap(), dec!(0.1));
    }
}
