//! PostgreSQL roster (`roster_entries` table, see `migrations/`).

use async_trait::async_trait;
use sqlx::PgPool;

use gift_common::error::AppError;
use gift_common::traits::RosterStore;
use gift_common::types::{FundsRecipient, RosterEntry, UserId, normalize_handle};

/// Roster backed by the `roster_entries` table.
#[derive(Clone)]
pub struct PgRosterStore {
    pool: PgPool,
}

#[derive(Debug, sqlx::FromRow)]
struct RosterRow {
    id: i64,
    tg_id: Option<i64>,
    tg_username: Option<String>,
    name: String,
    birthday: Option<String>,
    notify_day: i32,
    notify_month: i32,
    notify_time: Option<String>,
    amount: Option<i64>,
    funds_handle: String,
    funds_phone: String,
    funds_bank: String,
}

impl From<RosterRow> for RosterEntry {
    fn from(row: RosterRow) -> Self {
        RosterEntry {
            id: row.id,
            tg_id: row.tg_id,
            tg_username: row.tg_username,
            name: row.name,
            birthday: row.birthday,
            // Table constraints keep these in 1..=31 / 1..=12.
            notify_day: u32::try_from(row.notify_day).unwrap_or(0),
            notify_month: u32::try_from(row.notify_month).unwrap_or(0),
            notify_time: row.notify_time,
            amount: row.amount,
            funds: FundsRecipient {
                handle: row.funds_handle,
                phone: row.funds_phone,
                bank: row.funds_bank,
            },
        }
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, tg_id, tg_username, name, birthday, notify_day, notify_month,
           notify_time, amount, funds_handle, funds_phone, funds_bank
    FROM roster_entries
"#;

impl PgRosterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Roster(format!("migration failed: {e}")))?;
        tracing::info!("Roster migrations applied");
        Ok(())
    }

    /// Insert a row and return it with its assigned key.
    pub async fn insert(&self, entry: &RosterEntry) -> Result<RosterEntry, AppError> {
        let notify_day = int_column("notify_day", entry.notify_day)?;
        let notify_month = int_column("notify_month", entry.notify_month)?;

        let row: RosterRow = sqlx::query_as(
            r#"
            INSERT INTO roster_entries
                (tg_id, tg_username, name, birthday, notify_day, notify_month,
                 notify_time, amount, funds_handle, funds_phone, funds_bank)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id, tg_id, tg_username, name, birthday, notify_day, notify_month,
                      notify_time, amount, funds_handle, funds_phone, funds_bank
            "#,
        )
        .bind(entry.tg_id)
        .bind(&entry.tg_username)
        .bind(&entry.name)
        .bind(&entry.birthday)
        .bind(notify_day)
        .bind(notify_month)
        .bind(&entry.notify_time)
        .bind(entry.amount)
        .bind(&entry.funds.handle)
        .bind(&entry.funds.phone)
        .bind(&entry.funds.bank)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }
}

/// Narrow a `u32` field to the table's `INTEGER` column.
fn int_column(field: &str, value: u32) -> Result<i32, AppError> {
    i32::try_from(value)
        .map_err(|_| AppError::Data(format!("{field} {value} does not fit the roster table")))
}

#[async_trait]
impl RosterStore for PgRosterStore {
    async fn find_by_identity(&self, id: UserId) -> Result<Option<RosterEntry>, AppError> {
        let row: Option<RosterRow> =
            sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE tg_id = $1 ORDER BY id LIMIT 1"))
                .bind(id.get())
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(Into::into))
    }

    async fn find_by_handle(&self, handle: &str) -> Result<Option<RosterEntry>, AppError> {
        let Some(handle) = normalize_handle(handle) else {
            return Ok(None);
        };

        let row: Option<RosterRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE LOWER(tg_username) = LOWER($1) ORDER BY id LIMIT 1"
        ))
        .bind(handle)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn all(&self) -> Result<Vec<RosterEntry>, AppError> {
        let rows: Vec<RosterRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn bind_identity(
        &self,
        entry_id: i64,
        id: UserId,
        handle: Option<&str>,
    ) -> Result<(), AppError> {
        let handle = handle.and_then(normalize_handle);

        let result = sqlx::query(
            r#"
            UPDATE roster_entries
            SET tg_id = $1, tg_username = COALESCE($2, tg_username), updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(id.get())
        .bind(handle)
        .bind(entry_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::Roster(format!("roster entry {entry_id} not found")));
        }

        tracing::info!(entry_id, user_id = %id, "Identity bound in roster table");
        Ok(())
    }
}
