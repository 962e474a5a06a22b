//! Upload coordinator (§4.5): the two-phase start/complete/cancel flow
//! that turns a claimed datapoint range into a committed datarange.

use std::time::Duration;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::{DatarangeUpload, MetaStore};
use crate::error::{Error, Result};
use crate::keys;
use crate::s3client::{CompletedPartInput, S3Capability};
use crate::tar_index;

/// Same value used as both the minimum multipart part size and the
/// direct/multipart boundary (§9 adopted convention).
pub const MULTIPART_THRESHOLD_BYTES: u64 = 5 * 1024 * 1024;

const PRESIGN_TTL: Duration = Duration::from_secs(3600);

pub struct StartResult {
    pub upload_id: Uuid,
    pub use_direct_put: bool,
    pub presigned_data_put_url: Option<String>,
    pub presigned_multipart_upload_id: Option<String>,
    pub part_urls: Vec<String>,
    pub presigned_index_put_url: String,
}

/// One client-supplied `(part_number, e_tag)` pair, required to complete a
/// multipart upload (§4.5 step 2 of Complete).
pub struct PartId {
    pub part_number: i32,
    pub e_tag: String,
}

#[tracing::instrument(level = "info", skip(meta, s3))]
pub async fn start(
    meta: &MetaStore,
    s3: &S3Capability,
    dataset: &str,
    first_datapoint_index: i64,
    number_of_datapoints: i64,
    claimed_size_bytes: i64,
) -> Result<StartResult> {
    validate_request(number_of_datapoints)?;
    let lo = first_datapoint_index;
    let hi = first_datapoint_index + number_of_datapoints - 1;

    let mut tx = meta.begin().await?;
    MetaStore::lock_dataset(&mut tx, dataset).await?;
    meta.get_dataset(dataset).await?;

    if MetaStore::overlaps_existing(&mut tx, dataset, lo, hi).await? {
        return Err(Error::DatarangeOverlap(format!("[{lo}, {hi}] overlaps an existing datarange or upload in {dataset}")));
    }

    let counter = MetaStore::increment_upload_counter(&mut tx, dataset).await?;
    let data_key = keys::data_key(dataset, lo, hi, counter);
    let index_key = keys::index_key(dataset, lo, hi, counter);
    let upload_id = Uuid::new_v4();

    let use_direct_put = (claimed_size_bytes as u64) < MULTIPART_THRESHOLD_BYTES;
    let presigned_index_put_url = s3.presign_put(&index_key, PRESIGN_TTL).await?;

    let (presigned_data_put_url, presigned_multipart_upload_id, part_urls, multipart_id_to_store) = if use_direct_put {
        let url = s3.presign_put(&data_key, PRESIGN_TTL).await?;
        (Some(url), None, Vec::new(), None)
    } else {
        let upload_id_s3 = s3.initiate_multipart(&data_key).await?;
        let urls = presign_parts(s3, &data_key, &upload_id_s3, claimed_size_bytes as u64).await?;
        (None, Some(upload_id_s3.clone()), urls, Some(upload_id_s3))
    };

    MetaStore::insert_datarange_upload(
        &mut tx,
        upload_id,
        dataset,
        multipart_id_to_store.as_deref(),
        &data_key,
        &index_key,
        first_datapoint_index,
        number_of_datapoints,
        claimed_size_bytes,
        counter,
    )
    .await?;

    tx.commit().await.map_err(Error::from)?;

    Ok(StartResult {
        upload_id,
        use_direct_put,
        presigned_data_put_url,
        presigned_multipart_upload_id,
        part_urls,
        presigned_index_put_url,
    })
}

fn validate_request(number_of_datapoints: i64) -> Result<()> {
    if number_of_datapoints <= 0 {
        return Err(Error::InvalidPayload("number_of_datapoints must be > 0".to_owned()));
    }
    Ok(())
}

/// Splits `total_size` into parts of at least `MULTIPART_THRESHOLD_BYTES`
/// (the final part may be smaller) and presigns one upload-part URL each.
async fn presign_parts(s3: &S3Capability, key: &str, upload_id: &str, total_size: u64) -> Result<Vec<String>> {
    let part_count = (total_size / MULTIPART_THRESHOLD_BYTES).max(1);
    let mut urls = Vec::with_capacity(part_count as usize);
    for part_number in 1..=part_count as i32 {
        urls.push(s3.presign_upload_part(key, upload_id, part_number, PRESIGN_TTL).await?);
    }
    Ok(urls)
}

#[tracing::instrument(level = "info", skip(meta, s3, part_ids))]
pub async fn complete(
    meta: &MetaStore,
    s3: &S3Capability,
    upload_id: Uuid,
    part_ids: Vec<PartId>,
    deletion_grace: Duration,
) -> Result<()> {
    let upload = meta.get_datarange_upload(upload_id).await?;

    if let Some(multipart_id) = &upload.multipart_upload_id {
        let parts = part_ids
            .into_iter()
            .map(|p| CompletedPartInput { part_number: p.part_number, e_tag: p.e_tag })
            .collect();
        s3.complete_multipart(&upload.data_key, multipart_id, parts).await?;
    }

    if let Err(e) = verify_and_commit(meta, s3, &upload).await {
        abort(meta, s3, &upload, deletion_grace).await?;
        return Err(e);
    }

    Ok(())
}

/// Rebuilds the index from a TAR stream and checks it against the upload's
/// claim (§4.5 Complete step 4): the entry count must match, and the last
/// entry's end-of-payload, block-aligned, plus the 2x512 archive trailer
/// must account for the whole of `data_object_size`. `tar_index::build`
/// stops at the first all-zero block and never looks past it, so without
/// this second check a TAR with a valid entry prefix followed by arbitrary
/// trailing bytes (and a `claimed_size_bytes` padded to match) would pass.
/// Free of S3/DB access so it can be exercised directly with an in-memory
/// TAR.
pub async fn validate_tar_against_claim<R: tokio::io::AsyncRead + Unpin>(
    reader: R,
    first_datapoint_index: i64,
    number_of_datapoints: i64,
    data_object_size: u64,
) -> Result<Vec<u8>> {
    let rebuilt_index = tar_index::build(reader, Some(first_datapoint_index as u64)).await?;

    let entry_count = tar_index::entry_count(&rebuilt_index)?;
    if entry_count as i64 != number_of_datapoints {
        return Err(Error::InvalidPayload(format!("has {entry_count} entries, claimed {number_of_datapoints}")));
    }

    let last = tar_index::lookup(&rebuilt_index, entry_count - 1)?;
    let expected_size = last.next_offset() + 1024;
    if expected_size != data_object_size {
        return Err(Error::InvalidPayload(format!(
            "is {data_object_size} bytes, expected {expected_size} (last entry's padded \
             end plus the 2x512 trailer); trailing data after the archive terminator?"
        )));
    }

    Ok(rebuilt_index)
}

async fn verify_and_commit(meta: &MetaStore, s3: &S3Capability, upload: &DatarangeUpload) -> Result<()> {
    let data_head = s3
        .head_object(&upload.data_key)
        .await?
        .ok_or_else(|| Error::UploadFailed(format!("data object {} missing after complete", upload.data_key)))?;
    if data_head.size != upload.claimed_size_bytes as u64 {
        return Err(Error::InvalidPayload(format!(
            "data object {} is {} bytes, claimed {}",
            upload.data_key, data_head.size, upload.claimed_size_bytes
        )));
    }
    s3.head_object(&upload.index_key)
        .await?
        .ok_or_else(|| Error::UploadFailed(format!("index object {} missing after complete", upload.index_key)))?;

    // Stream the full TAR in validation mode: this reconstructs the index
    // from scratch, checking every filename and key as it goes, bounded to
    // one pass over the object regardless of its size.
    let reader = s3.get_object(&upload.data_key, None).await?;
    let rebuilt_index = validate_tar_against_claim(
        reader,
        upload.first_datapoint_index,
        upload.number_of_datapoints,
        data_head.size,
    )
    .await
    .map_err(|e| match e {
        Error::InvalidPayload(msg) => Error::InvalidPayload(format!("TAR {}: {msg}", upload.data_key)),
        other => other,
    })?;

    let mut index_reader = s3.get_object(&upload.index_key, None).await?;
    let uploaded_index = {
        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        index_reader
            .read_to_end(&mut buf)
            .await
            .map_err(|e| Error::InvalidPayload(format!("reading uploaded index {}: {e}", upload.index_key)))?;
        buf
    };
    if uploaded_index != rebuilt_index {
        return Err(Error::InvalidPayload(format!(
            "uploaded index {} does not match the TAR's actual structure",
            upload.index_key
        )));
    }

    let lo = upload.first_datapoint_index;
    let hi = upload.first_datapoint_index + upload.number_of_datapoints - 1;

    let mut tx = meta.begin().await?;
    MetaStore::insert_datarange(
        &mut tx,
        Uuid::new_v4(),
        &upload.dataset_name,
        &upload.data_key,
        &upload.index_key,
        lo,
        hi,
        data_head.size as i64,
        upload.upload_counter,
    )
    .await?;
    MetaStore::delete_datarange_upload(&mut tx, upload.id).await?;
    tx.commit().await.map_err(Error::from)?;

    Ok(())
}

#[tracing::instrument(level = "info", skip(meta, s3))]
pub async fn cancel(meta: &MetaStore, s3: &S3Capability, upload_id: Uuid, deletion_grace: Duration) -> Result<()> {
    let upload = meta.get_datarange_upload(upload_id).await?;
    abort(meta, s3, &upload, deletion_grace).await
}

async fn abort(meta: &MetaStore, s3: &S3Capability, upload: &DatarangeUpload, deletion_grace: Duration) -> Result<()> {
    if let Some(multipart_id) = &upload.multipart_upload_id {
        // Best-effort: a failed abort leaves an orphaned multipart upload,
        // which S3 lifecycle rules or a later bucket scan can clean up.
        let _ = s3.abort_multipart(&upload.data_key, multipart_id).await;
    }

    let dataset = meta.get_dataset(&upload.dataset_name).await?;

    let mut tx = meta.begin().await?;
    enqueue_with_grace(&mut tx, &dataset.bucket_config_name, s3, &upload.data_key, deletion_grace).await?;
    enqueue_with_grace(&mut tx, &dataset.bucket_config_name, s3, &upload.index_key, deletion_grace).await?;
    MetaStore::delete_datarange_upload(&mut tx, upload.id).await?;
    tx.commit().await.map_err(Error::from)?;
    Ok(())
}

pub(crate) async fn enqueue_with_grace(
    tx: &mut crate::db::Tx<'_>,
    bucket_config_name: &str,
    s3: &S3Capability,
    key: &str,
    grace: Duration,
) -> Result<()> {
    let delete_after = OffsetDateTime::now_utc() + grace;
    // The DELETE itself is presigned well past the grace period so it is
    // still valid whenever the deletion worker actually fires it.
    let url = s3.presign_delete(key, grace + Duration::from_secs(3600)).await?;
    MetaStore::enqueue_deletion(tx, bucket_config_name, key, &url, delete_after).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_datapoint_request() {
        // number_of_datapoints <= 0 must fail before any S3 or DB call;
        // exercised directly since `start` requires a live pool otherwise.
        assert!(matches!(validate_request(0), Err(Error::InvalidPayload(_))));
        assert!(matches!(validate_request(-5), Err(Error::InvalidPayload(_))));
        assert!(validate_request(1).is_ok());
    }
}
