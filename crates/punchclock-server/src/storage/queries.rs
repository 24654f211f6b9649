//! Terminal and token queries for the Punchclock server.

use super::db::{AttendanceDatabase, DatabaseError};
use super::models::{Terminal, TokenConsumption, TokenIssuance};

/// Parameters for recording a freshly issued token.
#[derive(Debug, Clone)]
pub struct NewIssuance<'a> {
    pub terminal_id: &'a str,
    pub token: &'a str,
    pub payload: &'a str,
    pub signature: &'a str,
    pub nonce: &'a str,
    pub generated_at: i64,
    pub expires_at: i64,
}

impl AttendanceDatabase {
    // =========================================================================
    // Terminal queries
    // =========================================================================

    /// Register a terminal.
    pub async fn create_terminal(
        &self,
        id: &str,
        public_id: &str,
        name: &str,
        location: Option<&str>,
        now: i64,
    ) -> Result<Terminal, DatabaseError> {
        sqlx::query(
            "INSERT INTO terminals (id, public_id, name, location, active, created_at, updated_at) VALUES (?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(id)
        .bind(public_id)
        .bind(name)
        .bind(location)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_terminal_by_public_id(public_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Terminal {public_id}")))
    }

    /// Look up a terminal by the id printed in its tokens.
    pub async fn get_terminal_by_public_id(
        &self,
        public_id: &str,
    ) -> Result<Option<Terminal>, DatabaseError> {
        let terminal = sqlx::query_as::<_, Terminal>("SELECT * FROM terminals WHERE public_id = ?")
            .bind(public_id)
            .fetch_optional(self.pool())
            .await?;

        Ok(terminal)
    }

    pub async fn list_active_terminals(&self) -> Result<Vec<Terminal>, DatabaseError> {
        let terminals = sqlx::query_as::<_, Terminal>(
            "SELECT * FROM terminals WHERE active = 1 ORDER BY created_at ASC",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(terminals)
    }

    /// Enable or soft-disable a terminal. Returns false if it does not exist.
    pub async fn set_terminal_active(
        &self,
        public_id: &str,
        active: bool,
        now: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE terminals SET active = ?, updated_at = ? WHERE public_id = ?")
            .bind(active)
            .bind(now)
            .bind(public_id)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Token issuance queries
    // =========================================================================

    /// Persist an issued token.
    pub async fn insert_issuance(&self, issuance: &NewIssuance<'_>) -> Result<i64, DatabaseError> {
        let result = sqlx::query(
            "INSERT INTO token_issuances (terminal_id, token, payload, signature, nonce, generated_at, expires_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(issuance.terminal_id)
        .bind(issuance.token)
        .bind(issuance.payload)
        .bind(issuance.signature)
        .bind(issuance.nonce)
        .bind(issuance.generated_at)
        .bind(issuance.expires_at)
        .execute(self.pool())
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Most recently generated issuance of a terminal that is neither
    /// consumed nor expired at `now`.
    pub async fn current_issuance(
        &self,
        terminal_id: &str,
        now: i64,
    ) -> Result<Option<TokenIssuance>, DatabaseError> {
        let issuance = sqlx::query_as::<_, TokenIssuance>(
            "SELECT * FROM token_issuances WHERE terminal_id = ? AND consumed = 0 AND expires_at > ? ORDER BY generated_at DESC, id DESC LIMIT 1",
        )
        .bind(terminal_id)
        .bind(now)
        .fetch_optional(self.pool())
        .await?;

        Ok(issuance)
    }

    pub async fn get_issuance_by_nonce(
        &self,
        nonce: &str,
    ) -> Result<Option<TokenIssuance>, DatabaseError> {
        let issuance =
            sqlx::query_as::<_, TokenIssuance>("SELECT * FROM token_issuances WHERE nonce = ?")
                .bind(nonce)
                .fetch_optional(self.pool())
                .await?;

        Ok(issuance)
    }

    /// Mark an issuance consumed and write the permanent audit row, in one
    /// transaction. Returns false if the issuance was already consumed.
    pub async fn consume_issuance(
        &self,
        terminal_id: &str,
        nonce: &str,
        subject_id: &str,
        now: i64,
    ) -> Result<bool, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let updated = sqlx::query(
            "UPDATE token_issuances SET consumed = 1, consumed_by = ?, consumed_at = ? WHERE nonce = ? AND consumed = 0",
        )
        .bind(subject_id)
        .bind(now)
        .bind(nonce)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO token_consumptions (terminal_id, nonce, subject_id, consumed_at) VALUES (?, ?, ?, ?)",
        )
        .bind(terminal_id)
        .bind(nonce)
        .bind(subject_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    pub async fn get_consumption(
        &self,
        nonce: &str,
    ) -> Result<Option<TokenConsumption>, DatabaseError> {
        let consumption =
            sqlx::query_as::<_, TokenConsumption>("SELECT * FROM token_consumptions WHERE nonce = ?")
                .bind(nonce)
                .fetch_optional(self.pool())
                .await?;

        Ok(consumption)
    }

    /// Delete unconsumed issuances that expired before `cutoff`. Consumed
    /// rows and the consumption audit trail are kept.
    pub async fn delete_expired_issuances(&self, cutoff: i64) -> Result<u64, DatabaseError> {
        let result =
            sqlx::query("DELETE FROM token_issuances WHERE consumed = 0 AND expires_at < ?")
                .bind(cutoff)
                .execute(self.pool())
                .await?;

        Ok(result.rows_affected())
    }

    pub async fn count_issuances(&self, terminal_id: &str) -> Result<i64, DatabaseError> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM token_issuances WHERE terminal_id = ?")
                .bind(terminal_id)
                .fetch_one(self.pool())
                .await?;

        Ok(row.0)
    }
}
