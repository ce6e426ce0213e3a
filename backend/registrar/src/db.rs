//! Database layer: migrations, draft snapshots, payment orders and reconciliations.

use std::str::FromStr;

use chrono::{Duration, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use tracing::info;

use crate::callback::{Outcome, ReconciliationResult};
use crate::draft::{DraftSnapshot, FieldErrors, RegistrationDraft};
use crate::errors::Result;
use crate::order::{OrderId, OrderStatus, PaymentOrder};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);

    // Every connection to `:memory:` opens its own database.
    let max_connections = if url.contains(":memory:") { 1 } else { 5 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

// ─────────────────────────────────────────────────────────
// Draft snapshots
// ─────────────────────────────────────────────────────────

/// Store (or replace) the snapshot for an order. The expiry restarts on every write.
pub async fn save_draft(
    pool: &SqlitePool,
    order_id: &OrderId,
    snapshot: &DraftSnapshot,
    ttl: Duration,
) -> Result<()> {
    let now = Utc::now().timestamp();
    let payload = serde_json::to_string(&snapshot.draft)?;
    let errors = serde_json::to_string(&snapshot.errors)?;

    sqlx::query(
        r#"
        INSERT INTO draft_snapshots (order_id, payload, field_errors, created_at, expires_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT (order_id) DO UPDATE SET
            payload      = excluded.payload,
            field_errors = excluded.field_errors,
            expires_at   = excluded.expires_at
        "#,
    )
    .bind(order_id)
    .bind(payload)
    .bind(errors)
    .bind(now)
    .bind(now + ttl.num_seconds())
    .execute(pool)
    .await?;
    Ok(())
}

/// Read a snapshot that has not expired yet.
pub async fn load_draft(pool: &SqlitePool, order_id: &OrderId) -> Result<Option<DraftSnapshot>> {
    let row: Option<(String, String)> = sqlx::query_as(
        "SELECT payload, field_errors FROM draft_snapshots WHERE order_id = ?1 AND expires_at > ?2",
    )
    .bind(order_id)
    .bind(Utc::now().timestamp())
    .fetch_optional(pool)
    .await?;

    match row {
        Some((payload, errors)) => {
            let draft: RegistrationDraft = serde_json::from_str(&payload)?;
            let errors: FieldErrors = serde_json::from_str(&errors)?;
            Ok(Some(DraftSnapshot { draft, errors }))
        }
        None => Ok(None),
    }
}

pub async fn clear_draft(pool: &SqlitePool, order_id: &OrderId) -> Result<bool> {
    let rows = sqlx::query("DELETE FROM draft_snapshots WHERE order_id = ?1")
        .bind(order_id)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(rows > 0)
}

pub async fn delete_expired_drafts(pool: &SqlitePool, now: i64) -> Result<u64> {
    let rows = sqlx::query("DELETE FROM draft_snapshots WHERE expires_at <= ?1")
        .bind(now)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Payment orders
// ─────────────────────────────────────────────────────────

/// Insert the order unless a row for its identifier already exists.
/// Returns `true` when this call created the row.
pub async fn insert_order(pool: &SqlitePool, order: &PaymentOrder) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        INSERT INTO payment_orders
            (order_id, registration_id, gateway_order_id, amount, currency, status,
             failure_reason, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT (order_id) DO NOTHING
        "#,
    )
    .bind(&order.order_id)
    .bind(&order.registration_id)
    .bind(&order.gateway_order_id)
    .bind(&order.amount)
    .bind(&order.currency)
    .bind(order.status)
    .bind(&order.failure_reason)
    .bind(order.created_at)
    .bind(order.updated_at)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

/// Atomically take the order for a new payment attempt, moving it to
/// `pending`. Fails (returns `false`) for verified orders and while another
/// claim newer than `stale_before` is held.
pub async fn claim_attempt(
    pool: &SqlitePool,
    order_id: &OrderId,
    now: i64,
    stale_before: i64,
) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        UPDATE payment_orders
        SET    status = ?1, attempt_claimed_at = ?2, updated_at = ?2
        WHERE  order_id = ?3
          AND  status <> ?4
          AND  (attempt_claimed_at IS NULL OR attempt_claimed_at < ?5)
        "#,
    )
    .bind(OrderStatus::Pending)
    .bind(now)
    .bind(order_id)
    .bind(OrderStatus::Verified)
    .bind(stale_before)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

pub async fn get_order(pool: &SqlitePool, order_id: &OrderId) -> Result<Option<PaymentOrder>> {
    let row = sqlx::query_as::<_, PaymentOrder>(
        r#"
        SELECT order_id, registration_id, gateway_order_id, amount, currency, status,
               failure_reason, created_at, updated_at
        FROM   payment_orders
        WHERE  order_id = ?1
        "#,
    )
    .bind(order_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Unconditional status write; releases any attempt claim. Lifecycle rules
/// live in [`crate::order::transition`].
pub async fn set_order_status(
    pool: &SqlitePool,
    order_id: &OrderId,
    status: OrderStatus,
    failure_reason: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE payment_orders
        SET    status = ?1, failure_reason = ?2, updated_at = ?3, attempt_claimed_at = NULL
        WHERE  order_id = ?4
        "#,
    )
    .bind(status)
    .bind(failure_reason)
    .bind(Utc::now().timestamp())
    .bind(order_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record the backend registration id. An id already on the order is kept.
pub async fn set_registration_id(
    pool: &SqlitePool,
    order_id: &OrderId,
    registration_id: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE payment_orders SET registration_id = ?1, updated_at = ?2
        WHERE  order_id = ?3 AND registration_id IS NULL
        "#,
    )
    .bind(registration_id)
    .bind(Utc::now().timestamp())
    .bind(order_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_gateway_order_id(
    pool: &SqlitePool,
    order_id: &OrderId,
    gateway_order_id: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE payment_orders SET gateway_order_id = ?1, updated_at = ?2 WHERE order_id = ?3",
    )
    .bind(gateway_order_id)
    .bind(Utc::now().timestamp())
    .bind(order_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Redirected orders that have not heard back since `cutoff` become abandoned.
pub async fn mark_abandoned(pool: &SqlitePool, cutoff: i64) -> Result<u64> {
    let rows = sqlx::query(
        r#"
        UPDATE payment_orders
        SET    status = ?1, failure_reason = 'No payment callback received', updated_at = ?2
        WHERE  status = ?3 AND updated_at < ?4
        "#,
    )
    .bind(OrderStatus::Abandoned)
    .bind(Utc::now().timestamp())
    .bind(OrderStatus::Redirected)
    .bind(cutoff)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Reconciliations
// ─────────────────────────────────────────────────────────

/// Record a callback outcome. A definitive outcome (success / failure) is
/// never overwritten; a pending or unknown one is replaced by a later answer.
///
/// Returns `true` when the row was inserted or changed.
pub async fn record_reconciliation(
    pool: &SqlitePool,
    result: &ReconciliationResult,
    transaction_ref: Option<&str>,
) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        INSERT INTO reconciliations
            (order_id, transaction_ref, outcome, transaction_id, status_code,
             error_description, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT (order_id, transaction_ref) DO UPDATE SET
            outcome           = excluded.outcome,
            transaction_id    = excluded.transaction_id,
            status_code       = excluded.status_code,
            error_description = excluded.error_description
        WHERE reconciliations.outcome NOT IN ('success', 'failure')
        "#,
    )
    .bind(&result.order_id)
    .bind(transaction_ref.unwrap_or(""))
    .bind(result.outcome)
    .bind(&result.transaction_id)
    .bind(&result.status_code)
    .bind(&result.error_description)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

pub async fn get_reconciliation(
    pool: &SqlitePool,
    order_id: &OrderId,
    transaction_ref: Option<&str>,
) -> Result<Option<Outcome>> {
    let row: Option<(Outcome,)> = sqlx::query_as(
        "SELECT outcome FROM reconciliations WHERE order_id = ?1 AND transaction_ref = ?2",
    )
    .bind(order_id)
    .bind(transaction_ref.unwrap_or(""))
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(outcome,)| outcome))
}

#[cfg(test)]
pub async fn count_reconciliations(pool: &SqlitePool, order_id: &OrderId) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM reconciliations WHERE order_id = ?1")
        .bind(order_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
