//! Boundary to the transaction ledger.
//!
//! The ledger owns its rows; the outbox only checks existence and reacts
//! to removals. When a referenced transaction disappears, the events
//! that described it keep their full history with the reference cleared.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::types::{Lifecycle, TransactionId};

/// A ledger row as the outbox sees it.
///
/// Monetary amounts are integer minor units (cents), never floating
/// point, so financial sums carry no representation error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub amount_minor: i64,
    pub currency: String,
    pub lifecycle: Lifecycle,
}

/// Read-only view of the ledger, consulted when reconciling stale
/// references.
#[async_trait]
pub trait LedgerView: Send + Sync {
    async fn transaction_exists(&self, id: &TransactionId) -> Result<bool, StoreError>;
}

/// In-memory ledger for tests and examples.
#[derive(Default)]
pub struct InMemoryLedger {
    ids: Mutex<HashSet<TransactionId>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, id: impl Into<String>) -> TransactionId {
        let id = TransactionId(id.into());
        self.ids.lock().await.insert(id.clone());
        id
    }

    /// Remove a transaction. The caller is responsible for telling the
    /// outbox (`Outbox::on_transaction_deleted`) so references get
    /// cleared.
    pub async fn remove(&self, id: &TransactionId) -> bool {
        self.ids.lock().await.remove(id)
    }
}

#[async_trait]
impl LedgerView for InMemoryLedger {
    async fn transaction_exists(&self, id: &TransactionId) -> Result<bool, StoreError> {
        Ok(self.ids.lock().await.contains(id))
    }
}
