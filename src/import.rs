//! Bucket import reconciliation (§14): scans a bucket for TAR objects the
//! metadata store doesn't know about yet and reconstructs dataset and
//! datarange rows from them. Idempotent — already-known keys are skipped.

use std::collections::HashMap;

use uuid::Uuid;

use crate::db::MetaStore;
use crate::error::Result;
use crate::keys;
use crate::s3client::S3Capability;
use crate::tar_index;

pub struct ImportSummary {
    pub datasets_created: usize,
    pub dataranges_created: usize,
}

#[tracing::instrument(level = "info", skip(meta, s3))]
pub async fn import_bucket(meta: &MetaStore, s3: &S3Capability, bucket_config_name: &str) -> Result<ImportSummary> {
    let top = s3.list("datas3t/", Some("/")).await?;
    let mut datasets_created = 0;
    let mut dataranges_created = 0;
    let mut max_counter_seen: HashMap<String, i64> = HashMap::new();

    for prefix in &top.common_prefixes {
        let Some(dataset) = prefix.strip_prefix("datas3t/").and_then(|s| s.strip_suffix('/')) else { continue };

        if meta.get_dataset(dataset).await.is_err() {
            meta.create_dataset(dataset, bucket_config_name).await?;
            datasets_created += 1;
        }

        let existing: std::collections::HashSet<String> =
            meta.list_dataranges(dataset).await?.into_iter().map(|d| d.data_key).collect();

        let datarange_prefix = format!("datas3t/{dataset}/dataranges/");
        let listing = s3.list(&datarange_prefix, None).await?;

        for key in listing.keys.iter().filter(|k| k.ends_with(".tar")) {
            if existing.contains(key) {
                continue;
            }
            let Some((min_key, max_key, counter)) = keys::parse_data_key(dataset, key) else { continue };

            let head = match s3.head_object(key).await? {
                Some(h) => h,
                None => continue, // listed but vanished between List and Head; skip this cycle
            };

            // Derive the actual key range from the lightweight `.index`
            // sibling rather than trusting the object key or re-parsing
            // the full TAR, per §14: the index content is authoritative,
            // the key is just a hint, and datapoints within one TAR are
            // contiguous starting at min_key (§3), so entry_count alone
            // is enough to derive max_key.
            let index_key = format!("{}.index", key.trim_end_matches(".tar"));
            let mut index_reader = match s3.get_object(&index_key, None).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(%key, %index_key, error = %e, "skipping import candidate with unreadable index");
                    continue;
                }
            };
            let index_bytes = {
                use tokio::io::AsyncReadExt;
                let mut buf = Vec::new();
                if let Err(e) = index_reader.read_to_end(&mut buf).await {
                    tracing::warn!(%key, %index_key, error = %e, "skipping import candidate with unreadable index");
                    continue;
                }
                buf
            };
            let entry_count = match tar_index::entry_count(&index_bytes) {
                Ok(n) => n as i64,
                Err(e) => {
                    tracing::warn!(%key, %index_key, error = %e, "skipping import candidate with malformed index");
                    continue;
                }
            };
            let derived_max_key = min_key + entry_count - 1;
            if derived_max_key != max_key {
                tracing::warn!(%key, derived_max_key, max_key, "object key's max_key disagrees with its index content, using derived value");
            }

            let mut tx = meta.begin().await?;
            MetaStore::insert_datarange(&mut tx, Uuid::new_v4(), dataset, key, &index_key, min_key, derived_max_key, head.size as i64, counter)
                .await?;
            tx.commit().await.map_err(crate::error::Error::from)?;
            dataranges_created += 1;

            let slot = max_counter_seen.entry(dataset.to_owned()).or_insert(0);
            *slot = (*slot).max(counter);
        }
    }

    for (dataset, max_seen) in max_counter_seen {
        let mut tx = meta.begin().await?;
        MetaStore::bump_upload_counter_to_at_least(&mut tx, &dataset, max_seen).await?;
        tx.commit().await.map_err(crate::error::Error::from)?;
    }

    Ok(ImportSummary { datasets_created, dataranges_created })
}
