//! Sized actions produced by the copy engine.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::TradeSide;

/// How an order is sized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSizing {
    /// Market order for a USDC amount (buys) or share amount (sells)
    Market { amount: Decimal },
    /// Limit order for a number of shares at a fixed price
    Limit { shares: Decimal, price: Decimal },
}

/// Order lifetime policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderLifetime {
    FillOrKill,
    GoodTillCancelled,
}

/// A trade to submit to the order book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub token_id: String,
    pub side: TradeSide,
    pub sizing: OrderSizing,
    pub lifetime: OrderLifetime,
}

/// On-chain conditional-token operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainOperationKind {
    Split,
    Merge,
    Redeem,
}

impl ChainOperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Split => "Split",
            Self::Merge => "Merge",
            Self::Redeem => "Redeem",
        }
    }
}

/// An operation executed through the relayer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainOperation {
    pub kind: ChainOperationKind,
    pub market_id: String,
    /// USDC amount; redemptions always take the whole holding
    pub amount: Option<Decimal>,
}

impl ChainOperation {
    pub fn split(market_id: &str, amount: Decimal) -> Self {
        Self {
            kind: ChainOperationKind::Split,
            market_id: market_id.to_string(),
            amount: Some(amount),
        }
    }

    pub fn merge(market_id: &str, amount: Decimal) -> Self {
        Self {
            kind: ChainOperationKind::Merge,
            market_id: market_id.to_string(),
            amount: Some(amount),
        }
    }

    pub fn redeem(market_id: &str) -> Self {
        Self {
            kind: ChainOperationKind::Redeem,
            market_id: market_id.to_string(),
            amount: None,
        }
    }
}

/// What the copier does in response to one event.
#[derive(Debug, Clone, PartialEq)]
pub enum CopyAction {
    Order(OrderIntent),
    Chain(ChainOperation),
}

impl fmt::Display for CopyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CopyAction::Order(order) => match order.sizing {
                OrderSizing::Market { amount } => match order.side {
                    TradeSide::Buy => write!(f, "BUY ${} of {}", amount, order.token_id),
                    TradeSide::Sell => write!(f, "SELL {} shares of {}", amount, order.token_id),
                },
                OrderSizing::Limit { shares, price } => write!(
                    f,
                    "{} {} shares of {} @ {}",
                    order.side.as_str(),
                    shares,
                    order.token_id,
                    price
                ),
            },
            CopyAction::Chain(op) => match op.amount {
                Some(amount) => write!(f, "{} {} of {}", op.kind.as_str(), amount, op.market_id),
                None => write!(f, "{} {}", op.kind.as_str(), op.market_id),
            },
        }
    }
}
