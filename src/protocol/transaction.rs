//! Transaction control.
//!
//! Status changes only after the bridge confirms the statement. A failed
//! statement leaves the status as it was; a lost connection disconnects.

use super::{BridgeDriver, Protocol, TransactionStatus};
use crate::error::{Error, ErrorCode, Result};

impl<D: BridgeDriver> Protocol<D> {
    // ==================== TRANSACTION CONTROL ====================

    /// Begin a transaction.
    pub async fn begin(&mut self) -> Result<()> {
        self.transition("BEGIN", TransactionStatus::Idle, TransactionStatus::Transaction)
            .await
    }

    /// Commit the current transaction.
    pub async fn commit(&mut self) -> Result<()> {
        self.transition("COMMIT", TransactionStatus::Transaction, TransactionStatus::Idle)
            .await
    }

    /// Roll back the current transaction.
    pub async fn rollback(&mut self) -> Result<()> {
        self.transition("ROLLBACK", TransactionStatus::Transaction, TransactionStatus::Idle)
            .await
    }

    async fn transition(
        &mut self,
        statement: &str,
        from: TransactionStatus,
        to: TransactionStatus,
    ) -> Result<()> {
        let current = self.session()?.status;
        if current != from {
            return Err(Error::statement(
                format!("cannot {} while {}", statement, current),
                ErrorCode::InvalidTransactionState,
            ));
        }

        self.call(statement, &[], false).await?;

        if let Some(session) = self.session.as_mut() {
            session.status = to;
        }
        Ok(())
    }
}
