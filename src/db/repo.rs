use super::model::{DocQuery, Document, OutboxMessage};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::str::FromStr;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let in_memory = normalized.starts_with("sqlite::memory");
    let mut options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {}", normalized))?
        .create_if_missing(true);
    let mut pool_options = SqlitePoolOptions::new();
    if in_memory {
        // Every connection to :memory: is its own database; keep exactly one alive.
        pool_options = pool_options
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    } else {
        // WAL and stricter durability for file-backed stores.
        options = options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
    }
    let pool = pool_options.connect_with(options).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn health_check(pool: &Pool) -> Result<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Dedup records
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn is_handled(pool: &Pool, content_id: &str) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM handled_content WHERE id = ?")
        .bind(content_id)
        .fetch_optional(pool)
        .await?;
    Ok(found.is_some())
}

/// Conditional insert of a dedup record. Returns `false` when a record for
/// `content_id` already exists, which callers treat as "skip".
#[instrument(skip_all)]
pub async fn claim_handled(
    pool: &Pool,
    content_id: &str,
    score: Option<f64>,
    url: Option<&str>,
    handled_at: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "INSERT OR IGNORE INTO handled_content (id, handled_at, score, url) VALUES (?, ?, ?, ?)",
    )
    .bind(content_id)
    .bind(handled_at)
    .bind(score)
    .bind(url)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Undo a claim whose publish failed. Never removes a record that already
/// carries a reply or a reply claim.
#[instrument(skip_all)]
pub async fn release_claim(pool: &Pool, content_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM handled_content WHERE id = ? AND replied_at IS NULL AND reply_claimed_at IS NULL")
        .bind(content_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn mark_replied(
    pool: &Pool,
    content_id: &str,
    reply_id: &str,
    replied_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO handled_content (id, handled_at, replied_at, reply_id) VALUES (?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET replied_at = excluded.replied_at, reply_id = excluded.reply_id",
    )
    .bind(content_id)
    .bind(replied_at)
    .bind(replied_at)
    .bind(reply_id)
    .execute(pool)
    .await
    .context("failed to persist reply marker")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn has_replied(pool: &Pool, content_id: &str) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM handled_content WHERE id = ? AND replied_at IS NOT NULL",
    )
    .bind(content_id)
    .fetch_optional(pool)
    .await?;
    Ok(found.is_some())
}

/// Take the right to post the reply for `content_id`. Returns `false` when a
/// reply was already posted or another delivery holds the claim.
#[instrument(skip_all)]
pub async fn claim_reply(pool: &Pool, content_id: &str, claimed_at: DateTime<Utc>) -> Result<bool> {
    let res = sqlx::query(
        "INSERT INTO handled_content (id, handled_at, reply_claimed_at) VALUES (?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET reply_claimed_at = excluded.reply_claimed_at \
         WHERE handled_content.replied_at IS NULL AND handled_content.reply_claimed_at IS NULL",
    )
    .bind(content_id)
    .bind(claimed_at)
    .bind(claimed_at)
    .execute(pool)
    .await
    .context("failed to claim reply")?;
    Ok(res.rows_affected() == 1)
}

/// Give the reply claim back after a post that did not go out.
#[instrument(skip_all)]
pub async fn release_reply_claim(pool: &Pool, content_id: &str) -> Result<()> {
    sqlx::query(
        "UPDATE handled_content SET reply_claimed_at = NULL WHERE id = ? AND replied_at IS NULL",
    )
    .bind(content_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Delete dedup records older than `cutoff`. Returns the number removed.
#[instrument(skip_all)]
pub async fn prune_handled_before(pool: &Pool, cutoff: DateTime<Utc>) -> Result<u64> {
    let res = sqlx::query("DELETE FROM handled_content WHERE datetime(handled_at) < datetime(?)")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

pub async fn count_handled(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM handled_content")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn count_replied(pool: &Pool) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM handled_content WHERE replied_at IS NOT NULL")
            .fetch_one(pool)
            .await?;
    Ok(count)
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn get_document(pool: &Pool, collection: &str, id: &str) -> Result<Option<Document>> {
    let row = sqlx::query(
        "SELECT collection, id, body, updated_at FROM documents WHERE collection = ? AND id = ?",
    )
    .bind(collection)
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.map(|r| document_from_row(&r)).transpose()
}

#[instrument(skip_all)]
pub async fn set_document(pool: &Pool, collection: &str, id: &str, body: &Value) -> Result<()> {
    if !body.is_object() {
        return Err(anyhow!("document {}/{} must be a JSON object", collection, id));
    }
    sqlx::query(
        "INSERT INTO documents (collection, id, body, updated_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT(collection, id) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
    )
    .bind(collection)
    .bind(id)
    .bind(body.to_string())
    .bind(Utc::now())
    .execute(pool)
    .await
    .with_context(|| format!("failed to write document {}/{}", collection, id))?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn query_documents(pool: &Pool, query: &DocQuery) -> Result<Vec<Document>> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT collection, id, body, updated_at FROM documents WHERE collection = ",
    );
    qb.push_bind(query.collection.clone());

    for (field, value) in &query.filters {
        qb.push(" AND json_extract(body, ");
        qb.push_bind(json_path(field)?);
        qb.push(")");
        match value {
            Value::Null => {
                qb.push(" IS NULL");
            }
            Value::Bool(b) => {
                qb.push(" = ");
                qb.push_bind(i64::from(*b));
            }
            Value::Number(n) => {
                qb.push(" = ");
                if let Some(i) = n.as_i64() {
                    qb.push_bind(i);
                } else {
                    qb.push_bind(n.as_f64().unwrap_or_default());
                }
            }
            Value::String(s) => {
                qb.push(" = ");
                qb.push_bind(s.clone());
            }
            other => {
                qb.push(" = ");
                qb.push_bind(other.to_string());
            }
        }
    }

    match &query.order_by {
        Some((field, order)) => {
            qb.push(" ORDER BY json_extract(body, ");
            qb.push_bind(json_path(field)?);
            qb.push(") ");
            qb.push(order.as_sql());
            qb.push(", id ASC");
        }
        None => {
            qb.push(" ORDER BY datetime(updated_at) DESC, id ASC");
        }
    }
    qb.push(" LIMIT ");
    qb.push_bind(i64::from(query.limit));

    let rows = qb.build().fetch_all(pool).await?;
    rows.iter().map(document_from_row).collect()
}

pub async fn count_documents(pool: &Pool, collection: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE collection = ?")
        .bind(collection)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

fn json_path(field: &str) -> Result<String> {
    let valid = !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(anyhow!("invalid document field name '{}'", field));
    }
    Ok(format!("$.{}", field))
}

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    let body: String = row.get("body");
    Ok(Document {
        collection: row.get("collection"),
        id: row.get("id"),
        body: serde_json::from_str(&body).context("stored document is not valid JSON")?,
        updated_at: row.try_get("updated_at").unwrap_or_else(|_| Utc::now()),
    })
}

// ---------------------------------------------------------------------------
// Reply budget
// ---------------------------------------------------------------------------

/// Compare-and-swap increment: succeeds only while `count < max`.
#[instrument(skip_all)]
pub async fn try_reserve_budget(pool: &Pool, window_key: &str, max: u32) -> Result<bool> {
    sqlx::query("INSERT OR IGNORE INTO reply_budget (window_key, count) VALUES (?, 0)")
        .bind(window_key)
        .execute(pool)
        .await?;
    let res = sqlx::query(
        "UPDATE reply_budget SET count = count + 1, updated_at = CURRENT_TIMESTAMP \
         WHERE window_key = ? AND count < ?",
    )
    .bind(window_key)
    .bind(i64::from(max))
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Give back a reservation whose post did not go through.
#[instrument(skip_all)]
pub async fn release_budget(pool: &Pool, window_key: &str) -> Result<()> {
    sqlx::query(
        "UPDATE reply_budget SET count = count - 1, updated_at = CURRENT_TIMESTAMP \
         WHERE window_key = ? AND count > 0",
    )
    .bind(window_key)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn budget_count(pool: &Pool, window_key: &str) -> Result<u32> {
    let count: Option<i64> =
        sqlx::query_scalar("SELECT count FROM reply_budget WHERE window_key = ?")
            .bind(window_key)
            .fetch_optional(pool)
            .await?;
    Ok(count.unwrap_or(0).max(0) as u32)
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn enqueue_message(
    pool: &Pool,
    message_id: &str,
    candidate_id: &str,
    data: &str,
    due_at: DateTime<Utc>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO outbox (message_id, candidate_id, data, attempt, due_at) VALUES (?, ?, ?, 0, ?) RETURNING id",
    )
    .bind(message_id)
    .bind(candidate_id)
    .bind(data)
    .bind(due_at)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn next_due_message(pool: &Pool) -> Result<Option<OutboxMessage>> {
    let row = sqlx::query(
        "SELECT id, message_id, candidate_id, data, attempt FROM outbox \
         WHERE datetime(due_at) <= CURRENT_TIMESTAMP ORDER BY datetime(due_at) ASC, id ASC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| OutboxMessage {
        id: row.get("id"),
        message_id: row.get("message_id"),
        candidate_id: row.get("candidate_id"),
        data: row.get("data"),
        attempt: row.get("attempt"),
    }))
}

#[instrument(skip_all)]
pub async fn delete_message(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM outbox WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Exponential backoff: 5s * 2^attempt, capped at `max_cap_secs` (no cap if <= 0).
#[instrument(skip_all)]
pub async fn backoff_message_with_cap(
    pool: &Pool,
    id: i64,
    attempt: i32,
    max_cap_secs: i64,
) -> Result<()> {
    let secs = backoff_secs(attempt, max_cap_secs);
    sqlx::query(
        "UPDATE outbox SET attempt = ?, due_at = datetime('now', ? || ' seconds') WHERE id = ?",
    )
    .bind(attempt + 1)
    .bind(secs)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub fn backoff_secs(attempt: i32, max_cap_secs: i64) -> i64 {
    let secs = 5_i64 * (1_i64 << attempt.clamp(0, 10));
    if max_cap_secs <= 0 {
        secs
    } else {
        secs.min(max_cap_secs)
    }
}

pub async fn count_pending_messages(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Highest attempt count among pending messages, 0 when the outbox is empty.
pub async fn max_pending_attempt(pool: &Pool) -> Result<i32> {
    let attempt: Option<i32> = sqlx::query_scalar("SELECT MAX(attempt) FROM outbox")
        .fetch_one(pool)
        .await?;
    Ok(attempt.unwrap_or(0))
}
