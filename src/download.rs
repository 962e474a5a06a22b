//! Range-to-bytes translation using cached indices (§4.6). Given a
//! requested datapoint interval, computes the minimal set of presigned
//! byte-range GETs over datarange TAR files that reconstruct a valid TAR
//! stream once concatenated and trailed with two zero blocks.

use std::time::Duration;

use crate::cache::IndexCache;
use crate::db::{MetaStore, Tx};
use crate::error::Result;
use crate::s3client::S3Capability;
use crate::tar_index;

#[derive(Debug, Clone)]
pub struct Segment {
    pub presigned_url: String,
    pub start: u64,
    pub end: u64,
}

/// TTL handed to every presigned GET the planner returns; must outlive
/// the client's expected download duration (§4.6, §9).
pub const DOWNLOAD_URL_TTL: Duration = Duration::from_secs(6 * 3600);

#[tracing::instrument(level = "info", skip(meta, cache, s3))]
pub async fn plan_download(
    meta: &MetaStore,
    cache: &IndexCache,
    s3: &S3Capability,
    dataset: &str,
    first: i64,
    last: i64,
) -> Result<Vec<Segment>> {
    let mut tx: Tx<'_> = meta.begin().await?;
    let dataranges = MetaStore::dataranges_overlapping(&mut tx, dataset, first, last).await?;
    tx.commit().await.map_err(crate::error::Error::from)?;

    let mut segments = Vec::new();
    for d in dataranges {
        let local_first = first.max(d.min_key);
        let local_last = last.min(d.max_key);
        if local_first > local_last {
            continue; // entirely in a gap relative to this datarange
        }

        let key = crate::cache::cache_key(dataset, d.min_key, d.max_key, d.upload_counter);
        let index_bytes = cache.get_or_fetch(&key, s3, &d.index_key).await?;

        let i = (local_first - d.min_key) as usize;
        let j = (local_last - d.min_key) as usize;
        let entry_i = tar_index::lookup(&index_bytes, i)?;
        let entry_j = tar_index::lookup(&index_bytes, j)?;

        let byte_start = entry_i.header_offset;
        let (_, byte_end) = entry_j.padded_span();

        let url = s3.presign_get(&d.data_key, Some((byte_start, byte_end)), DOWNLOAD_URL_TTL).await?;
        segments.push(Segment { presigned_url: url, start: byte_start, end: byte_end });
    }

    Ok(segments)
}
