//! Copy engine: turns the target's activity into proportionally sized actions.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::api::{ChainExecutor, OrderSubmitter, TokenResolver};
use crate::models::{
    ActivityEvent, ActivityKind, ChainOperation, CopyAction, OrderIntent, OrderLifetime,
    OrderSizing, TradeSide,
};

use super::ledger::{copy_ratio, CASH_KEY};
use super::{CopyConfig, PositionLedger};

/// How long the run loop waits on the channel before rechecking the stop signal.
const RECV_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct Counters {
    copied: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

/// Engine statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineStats {
    pub running: bool,
    pub copied: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Downstream services the engine hands actions to.
#[derive(Clone)]
pub struct Executors {
    pub orders: Arc<dyn OrderSubmitter>,
    pub chain: Arc<dyn ChainExecutor>,
    pub resolver: Arc<dyn TokenResolver>,
}

/// Copy-trading engine state.
pub struct CopyEngine {
    config: CopyConfig,
    copier: Arc<PositionLedger>,
    target: Arc<PositionLedger>,
    executors: Executors,
    counters: Counters,
    running: AtomicBool,
}

impl CopyEngine {
    /// Create a new copy engine.
    pub fn new(
        config: CopyConfig,
        copier: Arc<PositionLedger>,
        target: Arc<PositionLedger>,
        executors: Executors,
    ) -> Self {
        Self {
            config,
            copier,
            target,
            executors,
            counters: Counters::default(),
            running: AtomicBool::new(false),
        }
    }

    /// Get current engine statistics.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            running: self.running.load(Ordering::SeqCst),
            copied: self.counters.copied.load(Ordering::SeqCst),
            skipped: self.counters.skipped.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
        }
    }

    /// Consume events one at a time until the channel closes, the stop
    /// signal is set, or processing hits a fatal error.
    pub async fn run(
        &self,
        mut rx: mpsc::Receiver<ActivityEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        info!("Starting copy engine");

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }
            match timeout(RECV_WAIT, rx.recv()).await {
                Ok(Some(event)) => {
                    if let Err(e) = self.process(&event).await {
                        error!(error = %e, kind = %event.tag(), "Fatal error in copy engine");
                        break Err(e);
                    }
                }
                Ok(None) => {
                    info!("Event channel closed");
                    break Ok(());
                }
                Err(_) => continue,
            }
        };

        self.running.store(false, Ordering::SeqCst);
        info!("Copy engine stopped");
        result
    }

    /// Decide, update the target's shadow ledger, then dispatch.
    pub async fn process(&self, event: &ActivityEvent) -> Result<()> {
        let action = self.decide(event).await?;
        self.apply_shadow_delta(event).await;

        match action {
            Some(action) => self.dispatch(action).await,
            None => {
                self.counters.skipped.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    /// Size the copier's response to one event. `None` means skip.
    pub async fn decide(&self, event: &ActivityEvent) -> Result<Option<CopyAction>> {
        match (event.kind, event.side) {
            (ActivityKind::Trade, Some(TradeSide::Buy)) => self.decide_buy(event).await,
            (ActivityKind::Trade, Some(TradeSide::Sell)) => self.decide_sell(event).await,
            (ActivityKind::Trade, None) => {
                warn!(market = %event.market_id, "Trade without a side, skipping");
                Ok(None)
            }
            (ActivityKind::Split, _) => self.decide_split(event).await,
            (ActivityKind::Merge, _) => self.decide_merge(event).await,
            (ActivityKind::Redeem, _) => self.decide_redeem(event).await,
            (ActivityKind::Reward | ActivityKind::Conversion | ActivityKind::Unknown, _) => {
                debug!(kind = event.kind.as_str(), "No copy policy for activity, skipping");
                Ok(None)
            }
        }
    }

    async fn cash_ratio(&self) -> Result<Decimal> {
        self.ratio(CASH_KEY, CASH_KEY).await
    }

    async fn ratio(&self, market_id: &str, outcome_id: &str) -> Result<Decimal> {
        let copier = self.copier.get(market_id, outcome_id).await;
        let target = self.target.get(market_id, outcome_id).await;
        if target.is_zero() {
            warn!(market = %market_id, outcome = %outcome_id, "Target holds nothing, ratio is 0");
        }
        let ratio = copy_ratio(copier, target)?;
        debug!(ratio = %ratio, copier = %copier, target = %target, "Copy ratio");
        Ok(ratio)
    }

    async fn decide_buy(&self, event: &ActivityEvent) -> Result<Option<CopyAction>> {
        let ratio = self.cash_ratio().await?;
        let amount = checked_mul(event.cash_size, ratio)?;
        if amount.is_zero() {
            info!(market = %event.label, "Calculated buy amount is 0, skipping BUY");
            return Ok(None);
        }

        let available = self.copier.cash().await;
        if amount > available {
            info!(amount = %amount, available = %available, "Not enough USDC, skipping BUY");
            return Ok(None);
        }

        let (sizing, lifetime) = if amount > self.config.min_market_order {
            (OrderSizing::Market { amount }, OrderLifetime::FillOrKill)
        } else {
            // Below the market-order floor: buy shares at the ceiling instead.
            let shares = checked_mul(event.share_size, ratio)?.max(self.config.min_limit_shares);
            (
                OrderSizing::Limit {
                    shares,
                    price: self.config.limit_price_ceiling,
                },
                OrderLifetime::GoodTillCancelled,
            )
        };

        Ok(Some(CopyAction::Order(OrderIntent {
            token_id: event.outcome_id.clone(),
            side: TradeSide::Buy,
            sizing,
            lifetime,
        })))
    }

    async fn decide_sell(&self, event: &ActivityEvent) -> Result<Option<CopyAction>> {
        let copier_available = self.copier.get(&event.market_id, &event.outcome_id).await;
        let target_available = self.target.get(&event.market_id, &event.outcome_id).await;
        let ratio = self.ratio(&event.market_id, &event.outcome_id).await?;
        let proportional = checked_mul(event.share_size, ratio)?;

        let amount = if event.share_size >= target_available || proportional > copier_available {
            copier_available
        } else {
            proportional
        };
        if amount.is_zero() {
            info!(market = %event.label, "Calculated sell amount is 0, skipping SELL");
            return Ok(None);
        }

        Ok(Some(CopyAction::Order(OrderIntent {
            token_id: event.outcome_id.clone(),
            side: TradeSide::Sell,
            sizing: OrderSizing::Market { amount },
            lifetime: OrderLifetime::FillOrKill,
        })))
    }

    async fn decide_split(&self, event: &ActivityEvent) -> Result<Option<CopyAction>> {
        let ratio = self.cash_ratio().await?;
        let amount = checked_mul(event.cash_size, ratio)?;
        if amount.is_zero() {
            info!(market = %event.market_id, "Calculated split amount is 0, skipping SPLIT");
            return Ok(None);
        }
        Ok(Some(CopyAction::Chain(ChainOperation::split(&event.market_id, amount))))
    }

    async fn decide_merge(&self, event: &ActivityEvent) -> Result<Option<CopyAction>> {
        let target_mergeable = self.target.mergeable_amount(&event.market_id).await;
        let copier_mergeable = self.copier.mergeable_amount(&event.market_id).await;
        if target_mergeable.is_zero() || copier_mergeable.is_zero() {
            info!(market = %event.market_id, "No mergeable positions, skipping MERGE");
            return Ok(None);
        }

        let amount = if event.share_size >= target_mergeable {
            copier_mergeable
        } else {
            let ratio = copy_ratio(copier_mergeable, target_mergeable)?;
            checked_mul(event.share_size, ratio)?.min(copier_mergeable)
        };
        if amount.is_zero() {
            info!(market = %event.market_id, "Calculated merge amount is 0, skipping MERGE");
            return Ok(None);
        }
        Ok(Some(CopyAction::Chain(ChainOperation::merge(&event.market_id, amount))))
    }

    async fn decide_redeem(&self, event: &ActivityEvent) -> Result<Option<CopyAction>> {
        if !self.target.is_redeemable(&event.market_id).await {
            debug!(market = %event.market_id, "No redeemable positions, skipping REDEEM");
            return Ok(None);
        }
        Ok(Some(CopyAction::Chain(ChainOperation::redeem(&event.market_id))))
    }

    /// Mirror the event's raw effect into the target's ledger.
    async fn apply_shadow_delta(&self, event: &ActivityEvent) {
        let market = &event.market_id;
        match (event.kind, event.side) {
            (ActivityKind::Trade, Some(side)) => {
                let is_add = side == TradeSide::Buy;
                self.target
                    .apply_delta(market, &event.outcome_id, event.share_size, is_add)
                    .await;
            }
            (ActivityKind::Split, _) => match self.executors.resolver.outcome_ids(market).await {
                Ok(outcomes) => {
                    self.target
                        .add_to_outcomes(market, &outcomes, event.share_size)
                        .await
                }
                Err(e) => warn!(market = %market, error = %e, "Token lookup failed, target ledger not updated"),
            },
            (ActivityKind::Merge | ActivityKind::Redeem, _) => {
                self.target.reduce_market(market, event.share_size).await;
            }
            (kind, _) => {
                warn!(kind = kind.as_str(), "Unsupported activity type for position update");
            }
        }
    }

    async fn dispatch(&self, action: CopyAction) {
        info!(action = %action, "Copying");
        let result = match &action {
            CopyAction::Order(order) => self.executors.orders.submit(order).await,
            CopyAction::Chain(operation) => self.executors.chain.execute(operation).await,
        };

        match result {
            Ok(receipt) if receipt.success => {
                self.counters.copied.fetch_add(1, Ordering::SeqCst);
                info!(action = %action, reference = ?receipt.reference, "Copy executed");
            }
            Ok(receipt) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                error!(action = %action, message = %receipt.message, "Copy rejected");
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                error!(action = %action, error = %e, "Copy submission failed");
            }
        }
    }
}

fn checked_mul(a: Decimal, b: Decimal) -> Result<Decimal> {
    a.checked_mul(b)
        .ok_or_else(|| anyhow!("Decimal overflow: {} * {}", a, b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::testing::{buy, event, sell, RecordingExecutor, StaticResolver};
    use rust_decimal_macros::dec;
    use tokio_test::{assert_err, assert_ok};

    struct Harness {
        engine: Arc<CopyEngine>,
        copier: Arc<PositionLedger>,
        target: Arc<PositionLedger>,
        executor: Arc<RecordingExecutor>,
    }

    fn harness_with(executor: RecordingExecutor) -> Harness {
        let copier = Arc::new(PositionLedger::new("0xcopier"));
        let target = Arc::new(PositionLedger::new("0xtarget"));
        let executor = Arc::new(executor);
        let resolver = StaticResolver::default().with_market("m", &["yes", "no"]);
        let engine = CopyEngine::new(
            CopyConfig::default(),
            copier.clone(),
            target.clone(),
            Executors {
                orders: executor.clone(),
                chain: executor.clone(),
                resolver: Arc::new(resolver),
            },
        );
        Harness {
            engine: Arc::new(engine),
            copier,
            target,
            executor,
        }
    }

    fn harness() -> Harness {
        harness_with(RecordingExecutor::default())
    }

    fn order(action: Option<CopyAction>) -> OrderIntent {
        match action {
            Some(CopyAction::Order(order)) => order,
            other => panic!("expected an order, got {:?}", other),
        }
    }

    fn chain(action: Option<CopyAction>) -> ChainOperation {
        match action {
            Some(CopyAction::Chain(op)) => op,
            other => panic!("expected a chain operation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_buy_above_floor_is_cash_market_order() {
        let h = harness();
        h.target.set_cash(dec!(500)).await;
        h.copier.set_cash(dec!(50)).await;

        let action = h.engine.decide(&buy("m", "x", dec!(100), dec!(50), 1)).await.unwrap();
        let intent = order(action);
        assert_eq!(intent.sizing, OrderSizing::Market { amount: dec!(5) });
        assert_eq!(intent.lifetime, OrderLifetime::FillOrKill);
        assert_eq!(intent.side, TradeSide::Buy);
        assert_eq!(intent.token_id, "x");
    }

    #[tokio::test]
    async fn test_small_buy_becomes_ceiling_limit() {
        let h = harness();
        h.target.set_cash(dec!(500)).await;
        h.copier.set_cash(dec!(5)).await;

        let action = h.engine.decide(&buy("m", "x", dec!(100), dec!(50), 1)).await.unwrap();
        let intent = order(action);
        assert_eq!(
            intent.sizing,
            OrderSizing::Limit {
                shares: dec!(1.02),
                price: dec!(0.99)
            }
        );
        assert_eq!(intent.lifetime, OrderLifetime::GoodTillCancelled);
    }

    #[tokio::test]
    async fn test_buy_skipped_when_target_has_no_cash() {
        let h = harness();
        h.copier.set_cash(dec!(50)).await;
        let action = h.engine.decide(&buy("m", "x", dec!(100), dec!(50), 1)).await.unwrap();
        assert!(action.is_none());
    }

    #[tokio::test]
    async fn test_buy_skipped_when_copier_short_of_cash() {
        let h = harness();
        h.target.set_cash(dec!(100)).await;
        h.copier.set_cash(dec!(50)).await;

        // ratio 0.5 of a $200 buy is $100, more than the copier holds
        let action = h.engine.decide(&buy("m", "x", dec!(400), dec!(200), 1)).await.unwrap();
        assert!(action.is_none());
    }

    #[tokio::test]
    async fn test_full_exit_sells_everything() {
        let h = harness();
        h.target.apply_delta("m", "x", dec!(100), true).await;
        h.copier.apply_delta("m", "x", dec!(37), true).await;

        let intent = order(h.engine.decide(&sell("m", "x", dec!(100), dec!(40), 1)).await.unwrap());
        assert_eq!(intent.sizing, OrderSizing::Market { amount: dec!(37) });
        assert_eq!(intent.side, TradeSide::Sell);
    }

    #[tokio::test]
    async fn test_partial_sell_is_proportional() {
        let h = harness();
        h.target.apply_delta("m", "x", dec!(100), true).await;
        h.copier.apply_delta("m", "x", dec!(10), true).await;

        let intent = order(h.engine.decide(&sell("m", "x", dec!(40), dec!(20), 1)).await.unwrap());
        assert_eq!(intent.sizing, OrderSizing::Market { amount: dec!(4) });
    }

    #[tokio::test]
    async fn test_sell_with_nothing_held_is_skipped() {
        let h = harness();
        h.target.apply_delta("m", "x", dec!(100), true).await;
        let action = h.engine.decide(&sell("m", "x", dec!(100), dec!(50), 1)).await.unwrap();
        assert!(action.is_none());
    }

    #[tokio::test]
    async fn test_split_uses_cash_ratio() {
        let h = harness();
        h.target.set_cash(dec!(1000)).await;
        h.copier.set_cash(dec!(100)).await;
        let split = event(ActivityKind::Split, None, "m", "", dec!(20), dec!(20), 1);

        let op = chain(h.engine.decide(&split).await.unwrap());
        assert_eq!(op, ChainOperation::split("m", dec!(2)));
    }

    #[tokio::test]
    async fn test_merge_partial_is_scaled_and_clamped() {
        let h = harness();
        h.target.add_to_outcomes("m", &["yes".into(), "no".into()], dec!(100)).await;
        h.copier.add_to_outcomes("m", &["yes".into(), "no".into()], dec!(20)).await;
        let merge = event(ActivityKind::Merge, None, "m", "", dec!(25), dec!(25), 1);

        let op = chain(h.engine.decide(&merge).await.unwrap());
        assert_eq!(op, ChainOperation::merge("m", dec!(5)));
    }

    #[tokio::test]
    async fn test_merge_all_takes_copier_mergeable() {
        let h = harness();
        h.target.add_to_outcomes("m", &["yes".into(), "no".into()], dec!(100)).await;
        h.copier.add_to_outcomes("m", &["yes".into(), "no".into()], dec!(20)).await;
        h.copier.apply_delta("m", "no", dec!(5), false).await;
        let merge = event(ActivityKind::Merge, None, "m", "", dec!(100), dec!(100), 1);

        let op = chain(h.engine.decide(&merge).await.unwrap());
        assert_eq!(op, ChainOperation::merge("m", dec!(15)));
    }

    #[tokio::test]
    async fn test_merge_skipped_without_pairs() {
        let h = harness();
        h.target.add_to_outcomes("m", &["yes".into(), "no".into()], dec!(100)).await;
        h.copier.apply_delta("m", "yes", dec!(20), true).await;
        let merge = event(ActivityKind::Merge, None, "m", "", dec!(10), dec!(10), 1);
        assert!(h.engine.decide(&merge).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_redeem_follows_target_ledger() {
        let h = harness();
        let redeem = event(ActivityKind::Redeem, None, "m", "", dec!(10), dec!(10), 1);
        assert!(h.engine.decide(&redeem).await.unwrap().is_none());

        h.target.apply_delta("m", "yes", dec!(10), true).await;
        let op = chain(h.engine.decide(&redeem).await.unwrap());
        assert_eq!(op, ChainOperation::redeem("m"));
    }

    #[tokio::test]
    async fn test_conversion_is_a_no_op() {
        let h = harness();
        h.target.apply_delta("m", "yes", dec!(10), true).await;
        let conversion = event(ActivityKind::Conversion, None, "m", "yes", dec!(10), dec!(5), 1);

        assert_ok!(h.engine.process(&conversion).await);
        assert!(h.executor.actions().await.is_empty());
        assert_eq!(h.target.get("m", "yes").await, dec!(10));
        assert_eq!(h.engine.stats().skipped, 1);
    }

    #[tokio::test]
    async fn test_shadow_ledger_updates_even_when_skipped() {
        let h = harness();
        // Copier has no cash, so the buy is skipped.
        h.target.set_cash(dec!(100)).await;
        assert_ok!(h.engine.process(&buy("m", "yes", dec!(30), dec!(15), 1)).await);
        assert_eq!(h.target.get("m", "yes").await, dec!(30));
        assert!(h.executor.actions().await.is_empty());

        assert_ok!(h.engine.process(&sell("m", "yes", dec!(50), dec!(25), 2)).await);
        assert_eq!(h.target.get("m", "yes").await, Decimal::ZERO);
        assert_eq!(h.target.market_count().await, 0);
    }

    #[tokio::test]
    async fn test_split_and_merge_shadow_deltas() {
        let h = harness();
        let split = event(ActivityKind::Split, None, "m", "", dec!(10), dec!(10), 1);
        assert_ok!(h.engine.process(&split).await);
        assert_eq!(h.target.get("m", "yes").await, dec!(10));
        assert_eq!(h.target.get("m", "no").await, dec!(10));

        let merge = event(ActivityKind::Merge, None, "m", "", dec!(4), dec!(4), 2);
        assert_ok!(h.engine.process(&merge).await);
        assert_eq!(h.target.mergeable_amount("m").await, dec!(6));

        let unknown_split = event(ActivityKind::Split, None, "other", "", dec!(10), dec!(10), 3);
        assert_ok!(h.engine.process(&unknown_split).await);
        assert_eq!(h.target.market_count().await, 1);
    }

    #[tokio::test]
    async fn test_dispatch_counts_outcomes() {
        let h = harness();
        h.target.set_cash(dec!(100)).await;
        h.copier.set_cash(dec!(100)).await;
        assert_ok!(h.engine.process(&buy("m", "yes", dec!(20), dec!(10), 1)).await);

        let actions = h.executor.actions().await;
        assert_eq!(actions.len(), 1);
        assert_eq!(
            order(Some(actions[0].clone())).sizing,
            OrderSizing::Market { amount: dec!(10) }
        );
        assert_eq!(h.engine.stats().copied, 1);

        let rejecting = harness_with(RecordingExecutor::rejecting());
        rejecting.target.set_cash(dec!(100)).await;
        rejecting.copier.set_cash(dec!(100)).await;
        assert_ok!(rejecting.engine.process(&buy("m", "yes", dec!(20), dec!(10), 1)).await);
        let stats = rejecting.engine.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.copied, 0);
    }

    #[tokio::test]
    async fn test_overflow_is_fatal() {
        let h = harness();
        h.target.set_cash(dec!(0.0000000001)).await;
        h.copier.set_cash(Decimal::MAX).await;
        let huge = buy("m", "yes", Decimal::MAX, Decimal::MAX, 1);
        assert_err!(h.engine.decide(&huge).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_processes_in_order_and_stops() {
        let h = harness();
        h.target.set_cash(dec!(100)).await;
        h.copier.set_cash(dec!(100)).await;

        let (tx, rx) = mpsc::channel(4);
        let (stop, shutdown) = watch::channel(false);
        let engine = h.engine.clone();
        let handle = tokio::spawn(async move { engine.run(rx, shutdown).await });

        tx.send(buy("m", "yes", dec!(20), dec!(10), 1)).await.unwrap();
        tx.send(sell("m", "yes", dec!(20), dec!(10), 2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let actions = h.executor.actions().await;
        assert_eq!(actions.len(), 1);
        assert_eq!(h.target.get("m", "yes").await, Decimal::ZERO);
        assert!(h.engine.stats().running);

        stop.send(true).unwrap();
        assert_ok!(handle.await.unwrap());
        assert!(!h.engine.stats().running);
    }
}
