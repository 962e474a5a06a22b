//! Aggregation engine (§4.7): replaces N contiguous dataranges covering
//! `[lo, hi]` with a single new datarange, re-indexing entries with
//! shifted offsets but copying payload bytes verbatim.

use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::cache::{self, IndexCache};
use crate::db::{AggregateUpload, Datarange, MetaStore};
use crate::error::{Error, Result};
use crate::keys;
use crate::s3client::{CompletedPartInput, S3Capability};
use crate::tar_index::{self, Entry};
use crate::upload::MULTIPART_THRESHOLD_BYTES;

const PRESIGN_TTL: Duration = Duration::from_secs(3600);
/// Single-object ceiling for directly addressable aggregates (§4.8); the
/// optimizer never proposes a run whose merge would exceed this, but the
/// engine itself doesn't re-enforce it — that's the optimizer's job.
pub const MAX_AGGREGATE_BYTES: u64 = 2 * 1024 * 1024 * 1024;

pub struct StartResult {
    pub aggregate_upload_id: Uuid,
    pub use_direct_put: bool,
    pub presigned_data_put_url: Option<String>,
    pub presigned_multipart_upload_id: Option<String>,
    pub part_urls: Vec<String>,
    pub presigned_index_put_url: String,
    pub total_size_bytes: i64,
}

#[tracing::instrument(level = "info", skip(meta, cache, s3))]
pub async fn start(meta: &MetaStore, cache: &IndexCache, s3: &S3Capability, dataset: &str, lo: i64, hi: i64) -> Result<StartResult> {
    let mut tx = meta.begin().await?;
    MetaStore::lock_dataset(&mut tx, dataset).await?;
    let sources = MetaStore::check_full_coverage(&mut tx, dataset, lo, hi).await?;

    let counter = MetaStore::increment_upload_counter(&mut tx, dataset).await?;
    let agg_data_key = keys::data_key(dataset, lo, hi, counter);
    let agg_index_key = keys::index_key(dataset, lo, hi, counter);

    let total_size = compute_total_size(cache, s3, dataset, &sources).await?;

    let use_direct_put = total_size < MULTIPART_THRESHOLD_BYTES;
    let presigned_index_put_url = s3.presign_put(&agg_index_key, PRESIGN_TTL).await?;

    let (presigned_data_put_url, presigned_multipart_upload_id, part_urls, multipart_id_to_store) = if use_direct_put {
        let url = s3.presign_put(&agg_data_key, PRESIGN_TTL).await?;
        (Some(url), None, Vec::new(), None)
    } else {
        let upload_id_s3 = s3.initiate_multipart(&agg_data_key).await?;
        let part_count = (total_size / MULTIPART_THRESHOLD_BYTES).max(1);
        let mut urls = Vec::with_capacity(part_count as usize);
        for part_number in 1..=part_count as i32 {
            urls.push(s3.presign_upload_part(&agg_data_key, &upload_id_s3, part_number, PRESIGN_TTL).await?);
        }
        (None, Some(upload_id_s3.clone()), urls, Some(upload_id_s3))
    };

    let id = Uuid::new_v4();
    let source_ids: Vec<Uuid> = sources.iter().map(|s| s.id).collect();
    MetaStore::insert_aggregate_upload(
        &mut tx,
        id,
        dataset,
        multipart_id_to_store.as_deref(),
        &agg_data_key,
        &agg_index_key,
        lo,
        hi,
        total_size as i64,
        counter,
        &source_ids,
    )
    .await?;

    tx.commit().await.map_err(Error::from)?;

    Ok(StartResult {
        aggregate_upload_id: id,
        use_direct_put,
        presigned_data_put_url,
        presigned_multipart_upload_id,
        part_urls,
        presigned_index_put_url,
        total_size_bytes: total_size as i64,
    })
}

/// Sum of the exact byte-range spans the download planner (§4.6) would
/// emit for each source, plus one 2x512 trailer — not simply the sum of
/// source sizes, since each source's own trailer is excluded here.
async fn compute_total_size(cache: &IndexCache, s3: &S3Capability, dataset: &str, sources: &[Datarange]) -> Result<u64> {
    let mut total = 0u64;
    for d in sources {
        let key = cache::cache_key(dataset, d.min_key, d.max_key, d.upload_counter);
        let index_bytes = cache.get_or_fetch(&key, s3, &d.index_key).await?;
        let n = tar_index::entry_count(&index_bytes)?;
        let first = tar_index::lookup(&index_bytes, 0)?;
        let last = tar_index::lookup(&index_bytes, n - 1)?;
        let (_, end) = last.padded_span();
        total += end - first.header_offset + 1;
    }
    total += 1024;
    Ok(total)
}

/// Worker-driven execution (§4.7): streams each source's payload span,
/// re-indexes with shifted offsets, and uploads the concatenated result.
/// Runs inside the service with real S3 credentials rather than via the
/// presigned URLs handed back from `start`, which exist only so external
/// callers can observe the operation's shape.
#[tracing::instrument(level = "info", skip(meta, cache, s3))]
pub async fn execute(
    meta: &MetaStore,
    cache: &IndexCache,
    s3: &S3Capability,
    aggregate_upload_id: Uuid,
    max_parallelism: usize,
    max_retries: u32,
) -> Result<()> {
    let agg = meta.get_aggregate_upload(aggregate_upload_id).await?;
    let sources = meta.dataranges_by_ids(&agg.source_datarange_ids).await?;

    let fetched: Vec<Result<(Bytes, Vec<Entry>)>> = stream::iter(sources.iter().map(|d| {
        let dataset = agg.dataset_name.clone();
        async move { fetch_source_span(cache, s3, &dataset, d, max_retries).await }
    }))
    .buffered(max_parallelism.max(1))
    .collect()
    .await;

    let mut out = Vec::with_capacity(agg.total_size_bytes.max(0) as usize);
    let mut entries = Vec::new();
    let mut running_offset: u64 = 0;
    for result in fetched {
        let (bytes, local_entries) = result?;
        for e in local_entries {
            entries.push(Entry { header_offset: running_offset + e.header_offset, header_blocks: e.header_blocks, size: e.size });
        }
        running_offset += bytes.len() as u64;
        out.extend_from_slice(&bytes);
    }
    out.extend(std::iter::repeat(0u8).take(1024));

    upload_output(s3, &agg, out, max_retries).await?;

    let new_index = tar_index::encode_all(&entries);
    with_retries(max_retries, || async { s3.put_object(&agg.index_key, Bytes::from(new_index.clone())).await }).await?;

    Ok(())
}

/// Fetches one source's full payload span and returns it alongside its
/// entries re-based to start at offset 0 within that span, so the caller
/// only needs to add its own running offset.
async fn fetch_source_span(cache: &IndexCache, s3: &S3Capability, dataset: &str, d: &Datarange, max_retries: u32) -> Result<(Bytes, Vec<Entry>)> {
    let key = cache::cache_key(dataset, d.min_key, d.max_key, d.upload_counter);
    let index_bytes = cache.get_or_fetch(&key, s3, &d.index_key).await?;
    let n = tar_index::entry_count(&index_bytes)?;
    let first = tar_index::lookup(&index_bytes, 0)?;
    let last = tar_index::lookup(&index_bytes, n - 1)?;
    let byte_start = first.header_offset;
    let (_, byte_end) = last.padded_span();

    let mut local_entries = Vec::with_capacity(n);
    for i in 0..n {
        let e = tar_index::lookup(&index_bytes, i)?;
        local_entries.push(Entry { header_offset: e.header_offset - byte_start, header_blocks: e.header_blocks, size: e.size });
    }

    let data_key = d.data_key.clone();
    let bytes = with_retries(max_retries, || async {
        use tokio::io::AsyncReadExt;
        let mut reader = s3.get_object(&data_key, Some((byte_start, byte_end))).await?;
        let mut buf = Vec::with_capacity((byte_end - byte_start + 1) as usize);
        reader.read_to_end(&mut buf).await.map_err(|e| Error::Transient(anyhow::anyhow!("reading source span {data_key}: {e}")))?;
        Ok(Bytes::from(buf))
    })
    .await?;

    Ok((bytes, local_entries))
}

async fn upload_output(s3: &S3Capability, agg: &AggregateUpload, out: Vec<u8>, max_retries: u32) -> Result<()> {
    let out = Bytes::from(out);
    match &agg.multipart_upload_id {
        None => {
            let data_key = agg.data_key.clone();
            with_retries(max_retries, || {
                let out = out.clone();
                let data_key = data_key.clone();
                async move { s3.put_object(&data_key, out).await }
            })
            .await?;
        }
        Some(upload_id) => {
            let mut parts = Vec::new();
            let mut part_number = 1;
            let mut offset = 0usize;
            while offset < out.len() {
                let end = (offset + MULTIPART_THRESHOLD_BYTES as usize).min(out.len());
                let chunk = out.slice(offset..end);
                let data_key = agg.data_key.clone();
                let etag = with_retries(max_retries, || {
                    let chunk = chunk.clone();
                    let data_key = data_key.clone();
                    async move { s3.upload_part(&data_key, upload_id, part_number, chunk).await }
                })
                .await?;
                parts.push(CompletedPartInput { part_number, e_tag: etag });
                part_number += 1;
                offset = end;
            }
            s3.complete_multipart(&agg.data_key, upload_id, parts).await?;
        }
    }
    Ok(())
}

/// Bounded exponential backoff for the one error class the core retries
/// on its own (§7): `Transient` S3 5xx / network blips.
async fn with_retries<T, F, Fut>(max_retries: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < max_retries => {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(100 * 2u64.pow(attempt))).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[tracing::instrument(level = "info", skip(meta, s3))]
pub async fn complete(meta: &MetaStore, s3: &S3Capability, aggregate_upload_id: Uuid, deletion_grace: Duration) -> Result<()> {
    let agg = meta.get_aggregate_upload(aggregate_upload_id).await?;

    let head = s3
        .head_object(&agg.data_key)
        .await?
        .ok_or_else(|| Error::UploadFailed(format!("aggregate data object {} missing after complete", agg.data_key)))?;
    if head.size != agg.total_size_bytes as u64 {
        return Err(Error::UploadFailed(format!(
            "aggregate object {} is {} bytes, expected {}",
            agg.data_key, head.size, agg.total_size_bytes
        )));
    }

    let dataset = meta.get_dataset(&agg.dataset_name).await?;
    let sources = meta.dataranges_by_ids(&agg.source_datarange_ids).await?;

    let mut tx = meta.begin().await?;
    MetaStore::insert_datarange(
        &mut tx,
        Uuid::new_v4(),
        &agg.dataset_name,
        &agg.data_key,
        &agg.index_key,
        agg.first_datapoint_index,
        agg.last_datapoint_index,
        head.size as i64,
        agg.upload_counter,
    )
    .await?;

    let source_ids: Vec<Uuid> = sources.iter().map(|s| s.id).collect();
    MetaStore::delete_dataranges(&mut tx, &source_ids).await?;

    let delete_after = OffsetDateTime::now_utc() + deletion_grace;
    for source in &sources {
        for key in [&source.data_key, &source.index_key] {
            let url = s3.presign_delete(key, deletion_grace + Duration::from_secs(3600)).await?;
            MetaStore::enqueue_deletion(&mut tx, &dataset.bucket_config_name, key, &url, delete_after).await?;
        }
    }

    MetaStore::delete_aggregate_upload(&mut tx, agg.id).await?;
    tx.commit().await.map_err(Error::from)?;
    Ok(())
}

/// Cancellation on worker failure (§4.7): the partial aggregate objects
/// are scheduled for deletion; sources remain intact.
#[tracing::instrument(level = "info", skip(meta, s3))]
pub async fn cancel(meta: &MetaStore, s3: &S3Capability, aggregate_upload_id: Uuid, deletion_grace: Duration) -> Result<()> {
    let agg = meta.get_aggregate_upload(aggregate_upload_id).await?;

    if let Some(multipart_id) = &agg.multipart_upload_id {
        let _ = s3.abort_multipart(&agg.data_key, multipart_id).await;
    }

    let dataset = meta.get_dataset(&agg.dataset_name).await?;
    let delete_after = OffsetDateTime::now_utc() + deletion_grace;

    let mut tx = meta.begin().await?;
    for key in [&agg.data_key, &agg.index_key] {
        let url = s3.presign_delete(key, deletion_grace + Duration::from_secs(3600)).await?;
        MetaStore::enqueue_deletion(&mut tx, &dataset.bucket_config_name, key, &url, delete_after).await?;
    }
    MetaStore::delete_aggregate_upload(&mut tx, agg.id).await?;
    tx.commit().await.map_err(Error::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retries_transient_errors_up_to_the_limit() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<()> = with_retries(2, || {
            let attempts = &attempts;
            async move {
                attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Err(Error::Transient(anyhow::anyhow!("simulated blip")))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_non_transient_errors() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<()> = with_retries(5, || {
            let attempts = &attempts;
            async move {
                attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Err(Error::InvalidPayload("not retryable".to_owned()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
