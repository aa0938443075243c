//! Activity events observed on the target wallet.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Kind of on-exchange activity reported by the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActivityKind {
    Trade,
    Split,
    Merge,
    Redeem,
    Reward,
    Conversion,
    Unknown,
}

impl ActivityKind {
    /// Map the feed's `type` field. Yield payouts are treated as rewards.
    pub fn from_feed(value: &str) -> Self {
        match value.to_uppercase().as_str() {
            "TRADE" => Self::Trade,
            "SPLIT" => Self::Split,
            "MERGE" => Self::Merge,
            "REDEEM" => Self::Redeem,
            "REWARD" | "YIELD" => Self::Reward,
            "CONVERSION" => Self::Conversion,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trade => "TRADE",
            Self::Split => "SPLIT",
            Self::Merge => "MERGE",
            Self::Redeem => "REDEEM",
            Self::Reward => "REWARD",
            Self::Conversion => "CONVERSION",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// Direction of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn from_feed(value: &str) -> Option<Self> {
        match value.to_uppercase().as_str() {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }
}

/// Events with equal keys that arrive back to back are coalesced.
type MergeKey<'a> = (ActivityKind, Option<TradeSide>, &'a str, &'a str);

/// One observed action by the target address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub kind: ActivityKind,

    /// Only present for trades
    pub side: Option<TradeSide>,

    /// Market condition ID
    pub market_id: String,

    /// Outcome token ID
    pub outcome_id: String,

    /// Number of outcome shares
    pub share_size: Decimal,

    /// Cash-equivalent value in USDC
    pub cash_size: Decimal,

    /// Unit price (0.0 to 1.0)
    pub price: Decimal,

    /// Seconds since epoch
    pub observed_at: i64,

    /// Market title for display
    #[serde(default)]
    pub label: String,
}

impl ActivityEvent {
    pub fn merge_key(&self) -> MergeKey<'_> {
        (self.kind, self.side, &self.market_id, &self.outcome_id)
    }

    pub fn is_reward(&self) -> bool {
        self.kind == ActivityKind::Reward
    }

    /// Fold a later compatible event into this one.
    ///
    /// Sizes add up, the price becomes the share-weighted average of both
    /// prices and the timestamp the later of the two. Returns `false` and
    /// leaves `self` untouched if any sum overflows.
    pub fn absorb(&mut self, other: &ActivityEvent) -> bool {
        let Some(total_shares) = self.share_size.checked_add(other.share_size) else {
            return false;
        };
        let Some(cash_size) = self.cash_size.checked_add(other.cash_size) else {
            return false;
        };
        let price = if total_shares.is_zero() {
            self.price
        } else {
            let weighted = self
                .price
                .checked_mul(self.share_size)
                .zip(other.price.checked_mul(other.share_size))
                .and_then(|(a, b)| a.checked_add(b))
                .and_then(|sum| sum.checked_div(total_shares));
            match weighted {
                Some(price) => price,
                None => return false,
            }
        };

        self.price = price;
        self.share_size = total_shares;
        self.cash_size = cash_size;
        self.observed_at = self.observed_at.max(other.observed_at);
        true
    }

    /// Short tag like `TRADE|BUY` for log lines.
    pub fn tag(&self) -> String {
        match self.side {
            Some(side) => format!("{}|{}", self.kind.as_str(), side.as_str()),
            None => self.kind.as_str().to_string(),
        }
    }
}
