use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::Costs;
use crate::store::{Store, StoreError};

const LEDGERS: &str = "ledgers";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient tokens: {required} required, {available} available")]
    Insufficient { required: u64, available: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    ParametricGeneration,
    ImageTo3d,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Purchase,
    Spend,
    FreeGeneration,
    Refund,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub kind: TransactionKind,
    pub tokens: u64,
    pub reference: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub balance: u64,
    pub free_used: u32,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceView {
    pub balance: u64,
    pub free_generations_remaining: u32,
}

/// What a successful charge consumed, so it can be refunded exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charge {
    FreeGeneration,
    Tokens(u64),
}

/// Per-user token balances persisted as JSON records.
pub struct TokenLedger {
    store: Store,
    free_generations: u32,
    costs: Costs,
    write: Mutex<()>,
}

impl TokenLedger {
    pub fn new(store: Store, free_generations: u32, costs: Costs) -> Self {
        Self {
            store,
            free_generations,
            costs,
            write: Mutex::new(()),
        }
    }

    pub fn cost(&self, operation: Operation) -> u64 {
        match operation {
            Operation::ParametricGeneration => self.costs.parametric,
            Operation::ImageTo3d => self.costs.image,
        }
    }

    async fn load(&self, user_id: &str) -> Result<LedgerRecord, LedgerError> {
        Ok(self
            .store
            .read_record(LEDGERS, user_id)
            .await?
            .unwrap_or_default())
    }

    async fn save(&self, user_id: &str, record: &LedgerRecord) -> Result<(), LedgerError> {
        Ok(self.store.write_record(LEDGERS, user_id, record).await?)
    }

    fn view(&self, record: &LedgerRecord) -> BalanceView {
        BalanceView {
            balance: record.balance,
            free_generations_remaining: self.free_generations.saturating_sub(record.free_used),
        }
    }

    pub async fn balance(&self, user_id: &str) -> Result<BalanceView, LedgerError> {
        let record = self.load(user_id).await?;
        Ok(self.view(&record))
    }

    /// Consumes a free generation if any remain, otherwise the operation's cost.
    pub async fn charge(
        &self,
        user_id: &str,
        operation: Operation,
        reference: &str,
    ) -> Result<Charge, LedgerError> {
        let _guard = self.write.lock().await;
        let mut record = self.load(user_id).await?;

        let charge = if record.free_used < self.free_generations {
            record.free_used += 1;
            Charge::FreeGeneration
        } else {
            let required = self.cost(operation);
            if record.balance < required {
                return Err(LedgerError::Insufficient {
                    required,
                    available: record.balance,
                });
            }
            record.balance -= required;
            Charge::Tokens(required)
        };

        let (kind, tokens) = match charge {
            Charge::FreeGeneration => (TransactionKind::FreeGeneration, 0),
            Charge::Tokens(tokens) => (TransactionKind::Spend, tokens),
        };
        record.transactions.push(Transaction {
            kind,
            tokens,
            reference: reference.to_string(),
            at: Utc::now(),
        });
        self.save(user_id, &record).await?;
        info!(user_id, reference, ?charge, balance = record.balance, "tokens charged");
        Ok(charge)
    }

    /// Gives back exactly what `charge` took.
    pub async fn refund(
        &self,
        user_id: &str,
        charge: Charge,
        reference: &str,
    ) -> Result<(), LedgerError> {
        let _guard = self.write.lock().await;
        let mut record = self.load(user_id).await?;
        let tokens = match charge {
            Charge::FreeGeneration => {
                record.free_used = record.free_used.saturating_sub(1);
                0
            }
            Charge::Tokens(tokens) => {
                record.balance += tokens;
                tokens
            }
        };
        record.transactions.push(Transaction {
            kind: TransactionKind::Refund,
            tokens,
            reference: reference.to_string(),
            at: Utc::now(),
        });
        self.save(user_id, &record).await?;
        info!(user_id, reference, ?charge, "charge refunded");
        Ok(())
    }

    /// Adds purchased tokens and returns the new balance.
    pub async fn credit(
        &self,
        user_id: &str,
        tokens: u64,
        reference: &str,
    ) -> Result<u64, LedgerError> {
        let _guard = self.write.lock().await;
        let mut record = self.load(user_id).await?;
        record.balance += tokens;
        record.transactions.push(Transaction {
            kind: TransactionKind::Purchase,
            tokens,
            reference: reference.to_string(),
            at: Utc::now(),
        });
        self.save(user_id, &record).await?;
        info!(user_id, reference, tokens, balance = record.balance, "tokens credited");
        Ok(record.balance)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Costs;
    use crate::store::Store;

    use super::{Charge, LedgerError, Operation, TokenLedger};

    async fn ledger(dir: &tempfile::TempDir, free: u32) -> TokenLedger {
        let store = Store::open(dir.path()).await.expect("store opens");
        TokenLedger::new(store, free, Costs::default())
    }

    #[tokio::test]
    async fn free_generations_are_used_before_tokens() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let ledger = ledger(&dir, 2).await;

        let fresh = ledger.balance("u1").await.expect("balance");
        assert_eq!(fresh.balance, 0);
        assert_eq!(fresh.free_generations_remaining, 2);

        for _ in 0..2 {
            assert_eq!(
                ledger
                    .charge("u1", Operation::ParametricGeneration, "m")
                    .await
                    .expect("free charge"),
                Charge::FreeGeneration
            );
        }
        let err = ledger
            .charge("u1", Operation::ParametricGeneration, "m")
            .await
            .expect_err("no tokens left");
        assert!(matches!(
            err,
            LedgerError::Insufficient {
                required: 5,
                available: 0
            }
        ));

        assert_eq!(ledger.credit("u1", 30, "order_1").await.expect("credit"), 30);
        assert_eq!(
            ledger
                .charge("u1", Operation::ImageTo3d, "img")
                .await
                .expect("paid charge"),
            Charge::Tokens(20)
        );
        let after = ledger.balance("u1").await.expect("balance");
        assert_eq!(after.balance, 10);
        assert_eq!(after.free_generations_remaining, 0);
    }

    #[tokio::test]
    async fn refund_restores_what_was_taken() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let ledger = ledger(&dir, 1).await;

        let free = ledger
            .charge("u1", Operation::ParametricGeneration, "m")
            .await
            .expect("free charge");
        ledger.refund("u1", free, "m").await.expect("refund");
        assert_eq!(
            ledger
                .balance("u1")
                .await
                .expect("balance")
                .free_generations_remaining,
            1
        );

        ledger.credit("u1", 5, "order_1").await.expect("credit");
        ledger
            .charge("u1", Operation::ParametricGeneration, "a")
            .await
            .expect("free");
        let paid = ledger
            .charge("u1", Operation::ParametricGeneration, "b")
            .await
            .expect("paid");
        ledger.refund("u1", paid, "b").await.expect("refund");
        assert_eq!(ledger.balance("u1").await.expect("balance").balance, 5);
    }

    #[tokio::test]
    async fn balances_persist_across_instances() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        ledger(&dir, 0)
            .await
            .credit("u1", 50, "order_1")
            .await
            .expect("credit");
        assert_eq!(
            ledger(&dir, 0).await.balance("u1").await.expect("balance").balance,
            50
        );
    }
}
