//! Copy sizing configuration.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Sizing policy and feed paging for the copy pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyConfig {
    /// Buys above this USDC amount go out as cash-sized market orders
    pub min_market_order: Decimal,

    /// Price used for small share-sized buys
    pub limit_price_ceiling: Decimal,

    /// Smallest share count for a limit buy (clears the $1 order floor at the ceiling)
    pub min_limit_shares: Decimal,

    /// Number of activity records requested per poll
    pub activity_page_size: u32,

    /// Number of positions requested per page
    pub positions_page_size: u32,

    /// Positions smaller than this are not returned by the feed
    pub positions_size_threshold: Decimal,

    /// Activity request timeout (seconds)
    pub activity_timeout_secs: u64,

    /// Positions request timeout (seconds)
    pub positions_timeout_secs: u64,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            min_market_order: dec!(1),
            limit_price_ceiling: dec!(0.99),
            min_limit_shares: dec!(1.02),
            activity_page_size: 100,
            positions_page_size: 500,
            positions_size_threshold: dec!(0.1),
            activity_timeout_secs: 5,
            positions_timeout_secs: 10,
        }
    }
}
