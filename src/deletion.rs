//! Deletion worker (§4.9): fires the presigned DELETEs queued by upload
//! cancellation, upload-complete failure, and aggregation for both
//! replaced sources and aborted partial results.

use std::time::Duration;

use time::OffsetDateTime;

use crate::db::MetaStore;
use crate::error::Result;

const BATCH_LIMIT: i64 = 256;

/// Runs until the process exits; callers spawn this as a background task.
/// A failed DELETE leaves its row in place for the next cycle — the
/// presigned URL's TTL is chosen up front to outlive any realistic number
/// of retry cycles (§4.9).
#[tracing::instrument(level = "info", skip(meta, http))]
pub async fn run(meta: &MetaStore, http: &reqwest::Client, poll_interval: Duration) {
    loop {
        if let Err(e) = run_once(meta, http).await {
            tracing::warn!(error = %e, "deletion worker cycle failed, retrying next interval");
        }
        tokio::time::sleep(poll_interval).await;
    }
}

async fn run_once(meta: &MetaStore, http: &reqwest::Client) -> Result<()> {
    let due = meta.due_deletions(OffsetDateTime::now_utc(), BATCH_LIMIT).await?;
    if due.is_empty() {
        return Ok(());
    }
    tracing::debug!(count = due.len(), "firing due deletions");

    for row in due {
        match http.delete(&row.presigned_delete_url).send().await {
            Ok(res) if res.status().is_success() || res.status().as_u16() == 404 => {
                meta.delete_deletion_row(row.id).await?;
            }
            Ok(res) => {
                tracing::warn!(key = %row.object_key, status = %res.status(), "deletion attempt failed, will retry");
            }
            Err(e) => {
                tracing::warn!(key = %row.object_key, error = %e, "deletion request failed, will retry");
            }
        }
    }
    Ok(())
}
