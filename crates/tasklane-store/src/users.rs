use chrono::DateTime;
use rusqlite::{params, OptionalExtension, Transaction};
use tasklane_types::User;

use crate::error::{StoreError, StoreResult};

/// User persistence over a caller-owned transaction.
pub trait UserRepository: Send + Sync {
    fn find_by_id(&self, tx: &Transaction<'_>, id: &str) -> StoreResult<Option<User>>;

    /// Inserts `user`, or refreshes `email` and `sign_in_name` of the existing
    /// row with the same id. The creation time of an existing row is kept.
    fn upsert(&self, tx: &Transaction<'_>, user: &User) -> StoreResult<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteUserRepository;

impl UserRepository for SqliteUserRepository {
    fn find_by_id(&self, tx: &Transaction<'_>, id: &str) -> StoreResult<Option<User>> {
        let row = tx
            .query_row(
                "SELECT id, email, sign_in_name, created_at FROM users WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, email, sign_in_name, created_at)) = row else {
            return Ok(None);
        };
        let created_time = DateTime::from_timestamp_millis(created_at).ok_or_else(|| {
            StoreError::CorruptRow(format!("user {id} has invalid created_at {created_at}"))
        })?;
        Ok(Some(User {
            id,
            email,
            sign_in_name,
            created_time,
        }))
    }

    fn upsert(&self, tx: &Transaction<'_>, user: &User) -> StoreResult<()> {
        tx.execute(
            "INSERT INTO users (id, email, sign_in_name, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                email = excluded.email,
                sign_in_name = excluded.sign_in_name",
            params![
                user.id,
                user.email,
                user.sign_in_name,
                user.created_time.timestamp_millis(),
            ],
        )?;
        Ok(())
    }
}
