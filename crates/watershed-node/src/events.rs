//! Post-commit ledger events.
//!
//! Events are published only after the ledger write has committed. Delivery
//! is best effort: with no subscriber, or a lagging one, events are dropped
//! and the ledger is unaffected.

use serde::Serialize;
use tokio::sync::broadcast;
use watershed_ledger::{LoanType, Money};

/// Something that happened to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LedgerEvent {
    LoanOriginated {
        loan_id: String,
        borrower_id: String,
        loan_type: LoanType,
        amount: Money,
    },
    LoanFunded {
        loan_id: String,
        borrower_id: String,
        community_funded: Money,
    },
    RepaymentApplied {
        loan_id: String,
        borrower_id: String,
        amount: Money,
    },
    FundingLockReleased {
        loan_id: String,
        borrower_id: String,
    },
    LoanCompleted {
        loan_id: String,
        borrower_id: String,
    },
}

/// Broadcast channel for ledger events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LedgerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Never fails.
    pub fn publish(&self, event: LedgerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.tx.subscribe()
    }
}

/// Hand events to the badge/streak system.
///
/// Gamification lives outside this node; the hook records each event for
/// it and never reports back. Runs until the bus is dropped.
pub async fn run_badge_hook(mut rx: broadcast::Receiver<LedgerEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(payload) => tracing::info!(target: "watershed_node::badges", %payload, "badge check"),
                Err(e) => tracing::debug!("Dropping unserializable event: {}", e),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Badge hook lagged, {} events skipped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
