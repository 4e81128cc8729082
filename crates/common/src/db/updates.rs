//! The append-only signed update log. Rows are never mutated.

use sqlx::{Executor, Row, Sqlite};

use super::{Database, DbError};

/// Append a signed update to the log.
pub async fn insert_signed_update<'e, E>(
    ex: E,
    update_id: u64,
    signed_update_json: &str,
) -> Result<(), DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("INSERT OR REPLACE INTO updates (update_id, signed_update_json) VALUES (?, ?)")
        .bind(update_id as i64)
        .bind(signed_update_json)
        .execute(ex)
        .await?;
    Ok(())
}

impl Database {
    /// The highest-numbered signed update in the log, if any.
    pub async fn latest_update(&self) -> Result<Option<String>, DbError> {
        let row = sqlx::query(
            "SELECT signed_update_json FROM updates ORDER BY update_id DESC LIMIT 1",
        )
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|r| r.get("signed_update_json")))
    }

    pub async fn update_by_id(&self, update_id: u64) -> Result<Option<String>, DbError> {
        let row = sqlx::query("SELECT signed_update_json FROM updates WHERE update_id = ?")
            .bind(update_id as i64)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(|r| r.get("signed_update_json")))
    }
}
