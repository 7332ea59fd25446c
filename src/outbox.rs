use crate::db::{self, collections, OutboxMessage, Pool};
use crate::pipeline::Pipeline;
use crate::queue;
use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tracing::{error, info, instrument, warn};

/// Process the next due outbox message, if any. Returns `true` when a message
/// was handled (delivered, backed off, or dead-lettered).
#[instrument(skip_all)]
pub async fn process_next_message(
    pool: &Pool,
    pipeline: &Pipeline,
    max_backoff_secs: i64,
    max_attempts: i32,
) -> Result<bool> {
    let Some(msg) = db::next_due_message(pool).await? else {
        return Ok(false);
    };

    let queued = match queue::decode_data(&msg.data) {
        Ok(q) => q,
        Err(err) => {
            // Retrying cannot fix a payload that does not decode.
            error!(%err, id = msg.id, message_id = %msg.message_id, "undecodable outbox message");
            dead_letter(pool, &msg, &err.to_string()).await?;
            return Ok(true);
        }
    };

    match pipeline.process(&queued).await {
        Ok(report) => {
            db::delete_message(pool, msg.id).await?;
            info!(
                id = msg.id,
                candidate_id = %report.candidate_id,
                posted = report.reply.as_ref().map(|r| r.posted).unwrap_or(false),
                "outbox message delivered"
            );
        }
        Err(err) => {
            let attempt = msg.attempt + 1;
            if max_attempts > 0 && attempt >= max_attempts {
                error!(?err, id = msg.id, attempt, "outbox message exhausted retries");
                dead_letter(pool, &msg, &format!("{err:#}")).await?;
            } else {
                warn!(?err, id = msg.id, attempt = msg.attempt, "outbox delivery failed; backoff");
                db::backoff_message_with_cap(pool, msg.id, msg.attempt, max_backoff_secs).await?;
            }
        }
    }
    Ok(true)
}

async fn dead_letter(pool: &Pool, msg: &OutboxMessage, reason: &str) -> Result<()> {
    let body = json!({
        "messageId": msg.message_id,
        "candidateId": msg.candidate_id,
        "data": msg.data,
        "attempt": msg.attempt,
        "reason": reason,
        "deadLetteredAt": Utc::now().to_rfc3339(),
    });
    db::set_document(pool, collections::DEAD_LETTERS, &msg.message_id, &body).await?;
    db::delete_message(pool, msg.id).await?;
    Ok(())
}
