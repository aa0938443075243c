//! Executor that logs actions instead of sending them.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::models::{ChainOperation, CopyAction, OrderIntent};

use super::types::SubmissionReceipt;
use super::{ChainExecutor, OrderSubmitter};

/// Accepts every order and operation without touching the network.
#[derive(Debug, Default)]
pub struct DryRunExecutor {
    submitted: AtomicU64,
}

impl DryRunExecutor {
    /// Create a new dry-run executor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of actions accepted so far.
    #[cfg(test)]
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    fn accept(&self, action: CopyAction) -> SubmissionReceipt {
        let n = self.submitted.fetch_add(1, Ordering::Relaxed) + 1;
        info!(action = %action, "[DRY RUN] Would execute");
        SubmissionReceipt::accepted(Some(format!("dry-run-{}", n)))
    }
}

#[async_trait]
impl OrderSubmitter for DryRunExecutor {
    async fn submit(&self, order: &OrderIntent) -> Result<SubmissionReceipt> {
        Ok(self.accept(CopyAction::Order(order.clone())))
    }
}

#[async_trait]
impl ChainExecutor for DryRunExecutor {
    async fn execute(&self, operation: &ChainOperation) -> Result<SubmissionReceipt> {
        Ok(self.accept(CopyAction::Chain(operation.clone())))
    }
}
