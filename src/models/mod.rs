//! Data models for activity events and the actions derived from them.

mod action;
mod activity;

pub use action::{ChainOperation, ChainOperationKind, CopyAction, OrderIntent, OrderLifetime, OrderSizing};
pub use activity::{ActivityEvent, ActivityKind, TradeSide};
