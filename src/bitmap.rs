//! Present-datapoint-key bitmap (§16): a `RoaringTreemap` over all
//! committed dataranges of one dataset, serialized for the `/bitmap`
//! endpoint.

use roaring::RoaringTreemap;

use crate::db::MetaStore;
use crate::error::{Error, Result};

#[tracing::instrument(level = "info", skip(meta))]
pub async fn build(meta: &MetaStore, dataset: &str) -> Result<Vec<u8>> {
    let dataranges = meta.list_dataranges(dataset).await?;

    let mut bitmap = RoaringTreemap::new();
    for d in &dataranges {
        bitmap.insert_range(d.min_key as u64..=d.max_key as u64);
    }

    let mut buf = Vec::new();
    bitmap
        .serialize_into(&mut buf)
        .map_err(|e| Error::Fatal(anyhow::anyhow!("serializing bitmap for {dataset}: {e}")))?;
    Ok(buf)
}
