//! Dataset-level operations that span the metadata store and S3 but don't
//! belong to the upload/aggregation/download flows: creation passthrough
//! lives in `MetaStore` directly, but `clear` needs a live `S3Capability`
//! to presign the deletions it enqueues (§15).

use time::OffsetDateTime;

use crate::db::MetaStore;
use crate::error::Result;
use crate::s3client::S3Capability;

/// Schedules every datarange's two object keys for immediate deletion,
/// then removes the datarange and dataset rows. No grace period: a caller
/// invoking `clear` is intentionally emptying the dataset, so there's no
/// in-flight download to protect.
#[tracing::instrument(level = "info", skip(meta, s3))]
pub async fn clear(meta: &MetaStore, s3: &S3Capability, dataset: &str) -> Result<()> {
    let bucket_config_name = meta.get_dataset(dataset).await?.bucket_config_name;
    let dataranges = meta.list_dataranges(dataset).await?;
    let now = OffsetDateTime::now_utc();

    let mut tx = meta.begin().await?;
    for d in &dataranges {
        for key in [&d.data_key, &d.index_key] {
            let url = s3.presign_delete(key, std::time::Duration::from_secs(3600)).await?;
            MetaStore::enqueue_deletion(&mut tx, &bucket_config_name, key, &url, now).await?;
        }
    }
    let ids: Vec<uuid::Uuid> = dataranges.iter().map(|d| d.id).collect();
    MetaStore::delete_dataranges(&mut tx, &ids).await?;
    tx.commit().await.map_err(crate::error::Error::from)?;

    meta.delete_dataset(dataset).await
}
