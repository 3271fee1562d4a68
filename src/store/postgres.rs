//! PostgreSQL store
//!
//! Row locks are `SELECT ... FOR UPDATE` taken when a unit begins; status
//! writes are CAS updates (`WHERE status = $expected`) so a lost race shows up
//! as zero affected rows rather than an overwrite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgExecutor, Postgres, Row, Transaction};
use std::time::Duration;
use tracing::{debug, info};

use super::{AtomicUnit, InsertOutcome, PointsStore, StatusUpdate, StoreError, UnitScope};
use crate::core_types::{LedgerEntryId, Points, TransferId, UserId};
use crate::ledger::{EventType, LedgerEntry, NewLedgerEntry};
use crate::transfer::{FailReason, Transfer, TransferRequest, TransferStatus};

/// The account table belongs to the user service; this creates the columns the
/// engine relies on when bootstrapping an empty database.
const CREATE_USERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id BIGINT PRIMARY KEY,
    points_balance BIGINT NOT NULL DEFAULT 0 CHECK (points_balance >= 0),
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_TRANSFERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS transfers (
    id BIGSERIAL PRIMARY KEY,
    from_user_id BIGINT NOT NULL REFERENCES users(id),
    to_user_id BIGINT NOT NULL REFERENCES users(id),
    amount BIGINT NOT NULL CHECK (amount > 0),
    status TEXT NOT NULL CHECK (status IN ('pending','processing','completed','failed','cancelled','reversed')),
    note TEXT,
    idempotency_key TEXT NOT NULL UNIQUE,
    reversal_of BIGINT REFERENCES transfers(id),
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    completed_at TIMESTAMPTZ,
    fail_reason TEXT,
    CHECK (from_user_id <> to_user_id)
)
"#;

const CREATE_LEDGER_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS point_ledger (
    id BIGSERIAL PRIMARY KEY,
    user_id BIGINT NOT NULL REFERENCES users(id),
    change BIGINT NOT NULL,
    balance_after BIGINT NOT NULL CHECK (balance_after >= 0),
    event_type TEXT NOT NULL CHECK (event_type IN ('transfer_out','transfer_in','adjust','earn','redeem','reversal_out','reversal_in')),
    transfer_id BIGINT REFERENCES transfers(id),
    reference TEXT,
    metadata TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp()
)
"#;

const CREATE_INDEXES: [&str; 3] = [
    "CREATE INDEX IF NOT EXISTS idx_point_ledger_user ON point_ledger (user_id, id)",
    "CREATE INDEX IF NOT EXISTS idx_point_ledger_transfer ON point_ledger (transfer_id)",
    "CREATE INDEX IF NOT EXISTS idx_transfers_open ON transfers (updated_at) WHERE status IN ('pending','processing')",
];

const TRANSFER_COLUMNS: &str = "id, from_user_id, to_user_id, amount, status, note, \
    idempotency_key, reversal_of, created_at, updated_at, completed_at, fail_reason";

const LEDGER_COLUMNS: &str =
    "id, user_id, change, balance_after, event_type, transfer_id, reference, metadata, created_at";

fn to_db_id(id: u64) -> Result<i64, StoreError> {
    i64::try_from(id).map_err(|_| StoreError::Constraint(format!("id {} out of BIGINT range", id)))
}

fn from_db_id(id: i64) -> Result<u64, StoreError> {
    u64::try_from(id).map_err(|_| StoreError::Corrupt(format!("negative id {}", id)))
}

fn row_to_transfer(row: &PgRow) -> Result<Transfer, StoreError> {
    let status: String = row.try_get("status")?;
    let status = status.parse::<TransferStatus>().map_err(StoreError::Corrupt)?;
    let fail_reason = row
        .try_get::<Option<String>, _>("fail_reason")?
        .map(|r| r.parse::<FailReason>())
        .transpose()
        .map_err(StoreError::Corrupt)?;
    let reversal_of = row
        .try_get::<Option<i64>, _>("reversal_of")?
        .map(from_db_id)
        .transpose()?;

    Ok(Transfer {
        id: from_db_id(row.try_get("id")?)?,
        from_user_id: from_db_id(row.try_get("from_user_id")?)?,
        to_user_id: from_db_id(row.try_get("to_user_id")?)?,
        amount: row.try_get("amount")?,
        status,
        idempotency_key: row.try_get("idempotency_key")?,
        note: row.try_get("note")?,
        reversal_of,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
        fail_reason,
    })
}

fn row_to_entry(row: &PgRow) -> Result<LedgerEntry, StoreError> {
    let event_type: String = row.try_get("event_type")?;
    let transfer_id = row
        .try_get::<Option<i64>, _>("transfer_id")?
        .map(from_db_id)
        .transpose()?;

    Ok(LedgerEntry {
        id: from_db_id(row.try_get("id")?)?,
        user_id: from_db_id(row.try_get("user_id")?)?,
        change: row.try_get("change")?,
        balance_after: row.try_get("balance_after")?,
        event_type: event_type
            .parse::<EventType>()
            .map_err(StoreError::Corrupt)?,
        transfer_id,
        reference: row.try_get("reference")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
    })
}

async fn fetch_transfer<'e, E: PgExecutor<'e>>(
    executor: E,
    id: TransferId,
) -> Result<Option<Transfer>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM transfers WHERE id = $1",
        TRANSFER_COLUMNS
    ))
    .bind(to_db_id(id)?)
    .fetch_optional(executor)
    .await?;

    row.as_ref().map(row_to_transfer).transpose()
}

/// Atomic CAS update: only applies if the current status matches `expected`
async fn cas_status<'e, E: PgExecutor<'e>>(
    executor: E,
    id: TransferId,
    expected: TransferStatus,
    update: StatusUpdate,
) -> Result<Option<Transfer>, StoreError> {
    update.check_edge(expected)?;
    let row = sqlx::query(&format!(
        r#"
        UPDATE transfers
        SET status = $1,
            fail_reason = CASE WHEN $1 = 'failed' THEN $2 ELSE fail_reason END,
            completed_at = CASE WHEN $1 = 'completed' THEN NOW() ELSE completed_at END,
            updated_at = NOW()
        WHERE id = $3 AND status = $4
        RETURNING {}
        "#,
        TRANSFER_COLUMNS
    ))
    .bind(update.status.as_str())
    .bind(update.fail_reason.map(|r| r.as_str()))
    .bind(to_db_id(id)?)
    .bind(expected.as_str())
    .fetch_optional(executor)
    .await?;

    row.as_ref().map(row_to_transfer).transpose()
}

/// PostgreSQL-backed [`PointsStore`]
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a connection pool
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        info!("PostgreSQL connection pool established");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if missing
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in [CREATE_USERS_TABLE, CREATE_TRANSFERS_TABLE, CREATE_LEDGER_TABLE]
            .into_iter()
            .chain(CREATE_INDEXES)
        {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("points ledger schema ready");
        Ok(())
    }
}

#[async_trait]
impl PointsStore for PgStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn begin(&self, scope: &UnitScope) -> Result<Box<dyn AtomicUnit>, StoreError> {
        let mut tx = self.pool.begin().await?;

        if let Some(id) = scope.transfer_id {
            sqlx::query("SELECT id FROM transfers WHERE id = $1 FOR UPDATE")
                .bind(to_db_id(id)?)
                .fetch_optional(&mut *tx)
                .await?;
        }

        let accounts = scope.lock_order();
        if !accounts.is_empty() {
            let ids = accounts
                .iter()
                .map(|id| to_db_id(*id))
                .collect::<Result<Vec<i64>, _>>()?;
            let locked: Vec<i64> =
                sqlx::query_scalar("SELECT id FROM users WHERE id = ANY($1) ORDER BY id FOR UPDATE")
                    .bind(ids.as_slice())
                    .fetch_all(&mut *tx)
                    .await?;
            if let Some(missing) = ids.iter().find(|id| !locked.contains(id)) {
                return Err(StoreError::UserNotFound(from_db_id(*missing)?));
            }
        }

        debug!(?scope, "postgres unit opened");
        Ok(Box::new(PgUnit {
            tx: Some(tx),
            scope: scope.clone(),
        }))
    }

    async fn get_balance(&self, user_id: UserId) -> Result<Points, StoreError> {
        sqlx::query_scalar::<_, i64>("SELECT points_balance FROM users WHERE id = $1")
            .bind(to_db_id(user_id)?)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::UserNotFound(user_id))
    }

    async fn user_exists(&self, user_id: UserId) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE id = $1)")
            .bind(to_db_id(user_id)?)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn insert_transfer(
        &self,
        request: &TransferRequest,
    ) -> Result<InsertOutcome, StoreError> {
        // The unique index on idempotency_key is the claim; a concurrent insert
        // for the same key waits here until the first one commits.
        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO transfers
                (from_user_id, to_user_id, amount, status, note, idempotency_key, reversal_of)
            VALUES ($1, $2, $3, 'pending', $4, $5, $6)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING {}
            "#,
            TRANSFER_COLUMNS
        ))
        .bind(to_db_id(request.from_user_id)?)
        .bind(to_db_id(request.to_user_id)?)
        .bind(request.amount)
        .bind(&request.note)
        .bind(&request.idempotency_key)
        .bind(request.reversal_of.map(to_db_id).transpose()?)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(InsertOutcome::Created(row_to_transfer(&row)?));
        }

        self.get_transfer_by_key(&request.idempotency_key)
            .await?
            .map(InsertOutcome::Existing)
            .ok_or_else(|| {
                StoreError::Corrupt(format!(
                    "idempotency key {} conflicted but no row found",
                    request.idempotency_key
                ))
            })
    }

    async fn get_transfer(&self, id: TransferId) -> Result<Option<Transfer>, StoreError> {
        fetch_transfer(&self.pool, id).await
    }

    async fn get_transfer_by_key(&self, key: &str) -> Result<Option<Transfer>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM transfers WHERE idempotency_key = $1",
            TRANSFER_COLUMNS
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_transfer).transpose()
    }

    async fn update_status(
        &self,
        id: TransferId,
        expected: TransferStatus,
        update: StatusUpdate,
    ) -> Result<Option<Transfer>, StoreError> {
        cas_status(&self.pool, id, expected, update).await
    }

    async fn latest_entry_id(&self, user_id: UserId) -> Result<Option<LedgerEntryId>, StoreError> {
        let latest: Option<i64> =
            sqlx::query_scalar("SELECT MAX(id) FROM point_ledger WHERE user_id = $1")
                .bind(to_db_id(user_id)?)
                .fetch_one(&self.pool)
                .await?;
        latest.map(from_db_id).transpose()
    }

    async fn ledger_page(
        &self,
        user_id: UserId,
        after: Option<LedgerEntryId>,
        up_to: LedgerEntryId,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM point_ledger
            WHERE user_id = $1 AND id > $2 AND id <= $3
            ORDER BY id ASC
            LIMIT $4
            "#,
            LEDGER_COLUMNS
        ))
        .bind(to_db_id(user_id)?)
        .bind(after.map(to_db_id).transpose()?.unwrap_or(0))
        .bind(to_db_id(up_to)?)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_entry).collect()
    }

    async fn entries_for_transfer(
        &self,
        transfer_id: TransferId,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM point_ledger WHERE transfer_id = $1 ORDER BY id ASC",
            LEDGER_COLUMNS
        ))
        .bind(to_db_id(transfer_id)?)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_entry).collect()
    }

    async fn list_stale(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transfer>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM transfers
            WHERE status IN ('pending', 'processing') AND updated_at < $1
            ORDER BY updated_at ASC
            LIMIT $2
            "#,
            TRANSFER_COLUMNS
        ))
        .bind(older_than)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_transfer).collect()
    }
}

/// Unit backed by one database transaction; dropping it rolls back
struct PgUnit {
    tx: Option<Transaction<'static, Postgres>>,
    scope: UnitScope,
}

impl PgUnit {
    fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>, StoreError> {
        self.tx.as_mut().ok_or(StoreError::UnitFinished)
    }
}

#[async_trait]
impl AtomicUnit for PgUnit {
    async fn balance(&mut self, user_id: UserId) -> Result<Points, StoreError> {
        let id = to_db_id(user_id)?;
        let tx = self.tx()?;
        sqlx::query_scalar::<_, i64>("SELECT points_balance FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or(StoreError::UserNotFound(user_id))
    }

    async fn apply_delta(&mut self, user_id: UserId, delta: Points) -> Result<Points, StoreError> {
        if !self.scope.covers_account(user_id) {
            return Err(StoreError::Constraint(format!(
                "account {} is not locked by this unit",
                user_id
            )));
        }
        let id = to_db_id(user_id)?;
        let tx = self.tx()?;
        sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE users
            SET points_balance = points_balance + $2, updated_at = NOW()
            WHERE id = $1
            RETURNING points_balance
            "#,
        )
        .bind(id)
        .bind(delta)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(StoreError::UserNotFound(user_id))
    }

    async fn append_entries(
        &mut self,
        entries: &[NewLedgerEntry],
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let tx = self.tx()?;
        let mut written = Vec::with_capacity(entries.len());
        for entry in entries {
            let row = sqlx::query(
                r#"
                INSERT INTO point_ledger
                    (user_id, change, balance_after, event_type, transfer_id, reference, metadata)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING id, created_at
                "#,
            )
            .bind(to_db_id(entry.user_id)?)
            .bind(entry.change)
            .bind(entry.balance_after)
            .bind(entry.event_type.as_str())
            .bind(entry.transfer_id.map(to_db_id).transpose()?)
            .bind(&entry.reference)
            .bind(&entry.metadata)
            .fetch_one(&mut **tx)
            .await?;

            let id = from_db_id(row.try_get("id")?)?;
            let created_at: DateTime<Utc> = row.try_get("created_at")?;
            written.push(entry.clone().into_entry(id, created_at));
        }
        Ok(written)
    }

    async fn transfer(&mut self, id: TransferId) -> Result<Option<Transfer>, StoreError> {
        let tx = self.tx()?;
        fetch_transfer(&mut **tx, id).await
    }

    async fn update_status(
        &mut self,
        id: TransferId,
        expected: TransferStatus,
        update: StatusUpdate,
    ) -> Result<Option<Transfer>, StoreError> {
        let tx = self.tx()?;
        cas_status(&mut **tx, id, expected, update).await
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::UnitFinished)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::UnitFinished)?;
        tx.rollback().await?;
        Ok(())
    }
}
