pub mod models;

use sqlx::postgres::PgPool;
use sqlx::{Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{try_, Error, Result};

pub use models::*;

/// Transactional backing for the data model (§4.3). Every method that
/// mutates more than one row either takes an open transaction or opens
/// and commits its own, so overlap/coverage/upload-counter checks stay
/// linearizable per dataset (§5).
#[derive(Debug, Clone)]
pub struct MetaStore {
    pool: PgPool,
}

pub type Tx<'a> = Transaction<'a, Postgres>;

impl MetaStore {
    pub async fn connect(db_url: &str) -> Result<Self> {
        let pool = try_!(PgPool::connect(db_url).await);
        try_!(sqlx::migrate!("./migrations").run(&pool).await);
        Ok(Self { pool })
    }

    /// Wraps an already-migrated pool (used by `#[sqlx::test]`-driven
    /// integration tests, which provision and migrate the pool for us).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn begin(&self) -> Result<Tx<'static>> {
        Ok(try_!(self.pool.begin().await))
    }

    /// Serializes all overlap/coverage/upload-counter work for one
    /// dataset within the current transaction. Cheap, and avoids needing
    /// a database-level SERIALIZABLE isolation level everywhere.
    #[tracing::instrument(level = "debug", skip(tx))]
    pub async fn lock_dataset(tx: &mut Tx<'_>, dataset: &str) -> Result<()> {
        try_!(
            sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
                .bind(dataset)
                .execute(&mut **tx)
                .await
        );
        Ok(())
    }

    // ---- bucket configs -------------------------------------------------

    #[tracing::instrument(level = "info", skip(self, access_key_encrypted, secret_key_encrypted))]
    pub async fn create_bucket_config(
        &self,
        name: &str,
        endpoint: &str,
        bucket: &str,
        access_key_encrypted: &str,
        secret_key_encrypted: &str,
    ) -> Result<()> {
        let res = sqlx::query(
            "INSERT INTO bucket_configs (name, endpoint, bucket, access_key_encrypted, secret_key_encrypted) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(name)
        .bind(endpoint)
        .bind(bucket)
        .bind(access_key_encrypted)
        .bind(secret_key_encrypted)
        .execute(&self.pool)
        .await;
        match res {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(Error::conflict(format!("bucket config {name} already exists")))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_bucket_config(&self, name: &str) -> Result<BucketConfig> {
        let row = try_!(
            sqlx::query_as::<_, BucketConfig>(
                "SELECT name, endpoint, bucket, access_key_encrypted, secret_key_encrypted FROM bucket_configs WHERE name = $1"
            )
            .bind(name)
            .fetch_optional(&self.pool)
            .await
        );
        row.ok_or_else(|| Error::not_found(format!("bucket config {name} not found")))
    }

    pub async fn list_bucket_configs(&self) -> Result<Vec<BucketConfig>> {
        Ok(try_!(
            sqlx::query_as::<_, BucketConfig>(
                "SELECT name, endpoint, bucket, access_key_encrypted, secret_key_encrypted FROM bucket_configs ORDER BY name"
            )
            .fetch_all(&self.pool)
            .await
        ))
    }

    // ---- datasets ---------------------------------------------------------

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn create_dataset(&self, name: &str, bucket_config_name: &str) -> Result<()> {
        try_!(self.get_bucket_config(bucket_config_name).await.map(|_| ()));
        let res = sqlx::query("INSERT INTO datasets (name, bucket_config_name, upload_counter) VALUES ($1, $2, 0)")
            .bind(name)
            .bind(bucket_config_name)
            .execute(&self.pool)
            .await;
        match res {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(Error::conflict(format!("dataset {name} already exists")))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_dataset(&self, name: &str) -> Result<Dataset> {
        let row = try_!(
            sqlx::query_as::<_, Dataset>("SELECT name, bucket_config_name, upload_counter FROM datasets WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await
        );
        row.ok_or_else(|| Error::not_found(format!("dataset {name} not found")))
    }

    pub async fn list_datasets(&self) -> Result<Vec<Dataset>> {
        Ok(try_!(
            sqlx::query_as::<_, Dataset>("SELECT name, bucket_config_name, upload_counter FROM datasets ORDER BY name")
                .fetch_all(&self.pool)
                .await
        ))
    }

    pub async fn dataset_stats(&self, name: &str) -> Result<DatasetStats> {
        let row: (i64, i64, Option<i64>, Option<i64>, i64) = try_!(
            sqlx::query_as(
                "SELECT COUNT(*), COALESCE(SUM(max_key - min_key + 1), 0), MIN(min_key), MAX(max_key), COALESCE(SUM(size_bytes), 0) \
                 FROM dataranges WHERE dataset_name = $1",
            )
            .bind(name)
            .fetch_one(&self.pool)
            .await
        );
        Ok(DatasetStats {
            name: name.to_owned(),
            datarange_count: row.0,
            total_datapoints: row.1,
            min_key: row.2,
            max_key: row.3,
            total_bytes: row.4,
        })
    }

    /// Deletable only when it has zero dataranges (§3); the optional
    /// "clear" flow enqueues deletions for all dataranges first and then
    /// calls this.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn delete_dataset(&self, name: &str) -> Result<()> {
        let count: i64 = try_!(
            sqlx::query_scalar("SELECT COUNT(*) FROM dataranges WHERE dataset_name = $1")
                .bind(name)
                .fetch_one(&self.pool)
                .await
        );
        if count > 0 {
            return Err(Error::conflict(format!("dataset {name} still has {count} dataranges")));
        }
        let res = try_!(sqlx::query("DELETE FROM datasets WHERE name = $1").bind(name).execute(&self.pool).await);
        if res.rows_affected() == 0 {
            return Err(Error::not_found(format!("dataset {name} not found")));
        }
        Ok(())
    }

    // ---- dataranges ---------------------------------------------------------

    /// Does `[lo, hi]` overlap any committed datarange or pending upload
    /// of this dataset? Call within a transaction that already holds the
    /// dataset's advisory lock.
    #[tracing::instrument(level = "debug", skip(tx))]
    pub async fn overlaps_existing(tx: &mut Tx<'_>, dataset: &str, lo: i64, hi: i64) -> Result<bool> {
        let datarange_hit: Option<i64> = try_!(
            sqlx::query_scalar(
                "SELECT 1 FROM dataranges WHERE dataset_name = $1 AND NOT (max_key < $2 OR min_key > $3) LIMIT 1",
            )
            .bind(dataset)
            .bind(lo)
            .bind(hi)
            .fetch_optional(&mut **tx)
            .await
        );
        if datarange_hit.is_some() {
            return Ok(true);
        }
        let upload_hit: Option<i64> = try_!(
            sqlx::query_scalar(
                "SELECT 1 FROM datarange_uploads WHERE dataset_name = $1 \
                 AND NOT (first_datapoint_index + number_of_datapoints - 1 < $2 OR first_datapoint_index > $3) LIMIT 1",
            )
            .bind(dataset)
            .bind(lo)
            .bind(hi)
            .fetch_optional(&mut **tx)
            .await
        );
        Ok(upload_hit.is_some())
    }

    /// "does the set of dataranges contained in dataset D fully cover
    /// `[lo, hi]` with no gaps, requiring at least 2 sources?" (§4.3)
    #[tracing::instrument(level = "debug", skip(tx))]
    pub async fn check_full_coverage(tx: &mut Tx<'_>, dataset: &str, lo: i64, hi: i64) -> Result<Vec<Datarange>> {
        let sources = try_!(
            sqlx::query_as::<_, Datarange>(
                "SELECT id, dataset_name, data_key, index_key, min_key, max_key, size_bytes, upload_counter FROM dataranges \
                 WHERE dataset_name = $1 AND min_key >= $2 AND max_key <= $3 ORDER BY min_key",
            )
            .bind(dataset)
            .bind(lo)
            .bind(hi)
            .fetch_all(&mut **tx)
            .await
        );

        if sources.len() < 2 {
            return Err(Error::NotFullyCovered(format!(
                "[{lo}, {hi}] has only {} source(s) in dataset {dataset}, need at least 2",
                sources.len()
            )));
        }
        if sources[0].min_key != lo || sources[sources.len() - 1].max_key != hi {
            return Err(Error::NotFullyCovered(format!("[{lo}, {hi}] is not covered edge-to-edge in dataset {dataset}")));
        }
        for pair in sources.windows(2) {
            if pair[1].min_key != pair[0].max_key + 1 {
                return Err(Error::NotFullyCovered(format!(
                    "gap between {} and {} in dataset {dataset}",
                    pair[0].max_key, pair[1].min_key
                )));
            }
        }
        Ok(sources)
    }

    #[tracing::instrument(level = "debug", skip(tx))]
    pub async fn dataranges_overlapping(tx: &mut Tx<'_>, dataset: &str, lo: i64, hi: i64) -> Result<Vec<Datarange>> {
        Ok(try_!(
            sqlx::query_as::<_, Datarange>(
                "SELECT id, dataset_name, data_key, index_key, min_key, max_key, size_bytes, upload_counter FROM dataranges \
                 WHERE dataset_name = $1 AND NOT (max_key < $2 OR min_key > $3) ORDER BY min_key",
            )
            .bind(dataset)
            .bind(lo)
            .bind(hi)
            .fetch_all(&mut **tx)
            .await
        ))
    }

    /// Fetches dataranges by id, ordered by `min_key` — used by the
    /// aggregation worker to replay its source list in TAR-concatenation
    /// order.
    pub async fn dataranges_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Datarange>> {
        Ok(try_!(
            sqlx::query_as::<_, Datarange>(
                "SELECT id, dataset_name, data_key, index_key, min_key, max_key, size_bytes, upload_counter FROM dataranges \
                 WHERE id = ANY($1) ORDER BY min_key",
            )
            .bind(ids)
            .fetch_all(&self.pool)
            .await
        ))
    }

    pub async fn list_dataranges(&self, dataset: &str) -> Result<Vec<Datarange>> {
        Ok(try_!(
            sqlx::query_as::<_, Datarange>(
                "SELECT id, dataset_name, data_key, index_key, min_key, max_key, size_bytes, upload_counter FROM dataranges \
                 WHERE dataset_name = $1 ORDER BY min_key",
            )
            .bind(dataset)
            .fetch_all(&self.pool)
            .await
        ))
    }

    #[tracing::instrument(level = "debug", skip(tx))]
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_datarange(
        tx: &mut Tx<'_>,
        id: Uuid,
        dataset: &str,
        data_key: &str,
        index_key: &str,
        min_key: i64,
        max_key: i64,
        size_bytes: i64,
        upload_counter: i64,
    ) -> Result<()> {
        try_!(
            sqlx::query(
                "INSERT INTO dataranges (id, dataset_name, data_key, index_key, min_key, max_key, size_bytes, upload_counter) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(id)
            .bind(dataset)
            .bind(data_key)
            .bind(index_key)
            .bind(min_key)
            .bind(max_key)
            .bind(size_bytes)
            .bind(upload_counter)
            .execute(&mut **tx)
            .await
        );
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(tx))]
    pub async fn delete_dataranges(tx: &mut Tx<'_>, ids: &[Uuid]) -> Result<()> {
        try_!(sqlx::query("DELETE FROM dataranges WHERE id = ANY($1)").bind(ids).execute(&mut **tx).await);
        Ok(())
    }

    /// Atomic increment, returning the new value (§4.3); strictly
    /// increasing within the dataset, which is what makes minted object
    /// keys collision-free.
    #[tracing::instrument(level = "debug", skip(tx))]
    pub async fn increment_upload_counter(tx: &mut Tx<'_>, dataset: &str) -> Result<i64> {
        let new_value: i64 = try_!(
            sqlx::query_scalar("UPDATE datasets SET upload_counter = upload_counter + 1 WHERE name = $1 RETURNING upload_counter")
                .bind(dataset)
                .fetch_one(&mut **tx)
                .await
        );
        Ok(new_value)
    }

    /// Used by `import` (§6): only ever raises the counter, never lowers
    /// it, so an import after live traffic can't re-mint a used key.
    #[tracing::instrument(level = "debug", skip(tx))]
    pub async fn bump_upload_counter_to_at_least(tx: &mut Tx<'_>, dataset: &str, value: i64) -> Result<()> {
        try_!(
            sqlx::query("UPDATE datasets SET upload_counter = GREATEST(upload_counter, $2) WHERE name = $1")
                .bind(dataset)
                .bind(value)
                .execute(&mut **tx)
                .await
        );
        Ok(())
    }

    // ---- datarange uploads --------------------------------------------------

    #[tracing::instrument(level = "debug", skip(tx))]
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_datarange_upload(
        tx: &mut Tx<'_>,
        id: Uuid,
        dataset: &str,
        multipart_upload_id: Option<&str>,
        data_key: &str,
        index_key: &str,
        first_datapoint_index: i64,
        number_of_datapoints: i64,
        claimed_size_bytes: i64,
        upload_counter: i64,
    ) -> Result<()> {
        try_!(
            sqlx::query(
                "INSERT INTO datarange_uploads \
                 (id, dataset_name, multipart_upload_id, data_key, index_key, first_datapoint_index, number_of_datapoints, claimed_size_bytes, upload_counter) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(id)
            .bind(dataset)
            .bind(multipart_upload_id)
            .bind(data_key)
            .bind(index_key)
            .bind(first_datapoint_index)
            .bind(number_of_datapoints)
            .bind(claimed_size_bytes)
            .bind(upload_counter)
            .execute(&mut **tx)
            .await
        );
        Ok(())
    }

    pub async fn get_datarange_upload(&self, id: Uuid) -> Result<DatarangeUpload> {
        let row = try_!(
            sqlx::query_as::<_, DatarangeUpload>(
                "SELECT id, dataset_name, multipart_upload_id, data_key, index_key, first_datapoint_index, \
                 number_of_datapoints, claimed_size_bytes, upload_counter FROM datarange_uploads WHERE id = $1",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await
        );
        row.ok_or_else(|| Error::not_found(format!("upload {id} not found")))
    }

    #[tracing::instrument(level = "debug", skip(tx))]
    pub async fn delete_datarange_upload(tx: &mut Tx<'_>, id: Uuid) -> Result<()> {
        try_!(sqlx::query("DELETE FROM datarange_uploads WHERE id = $1").bind(id).execute(&mut **tx).await);
        Ok(())
    }

    // ---- aggregate uploads --------------------------------------------------

    #[tracing::instrument(level = "debug", skip(tx, source_ids))]
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_aggregate_upload(
        tx: &mut Tx<'_>,
        id: Uuid,
        dataset: &str,
        multipart_upload_id: Option<&str>,
        data_key: &str,
        index_key: &str,
        first_datapoint_index: i64,
        last_datapoint_index: i64,
        total_size_bytes: i64,
        upload_counter: i64,
        source_ids: &[Uuid],
    ) -> Result<()> {
        try_!(
            sqlx::query(
                "INSERT INTO aggregate_uploads \
                 (id, dataset_name, multipart_upload_id, data_key, index_key, first_datapoint_index, last_datapoint_index, total_size_bytes, upload_counter, source_datarange_ids) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(id)
            .bind(dataset)
            .bind(multipart_upload_id)
            .bind(data_key)
            .bind(index_key)
            .bind(first_datapoint_index)
            .bind(last_datapoint_index)
            .bind(total_size_bytes)
            .bind(upload_counter)
            .bind(source_ids)
            .execute(&mut **tx)
            .await
        );
        Ok(())
    }

    pub async fn get_aggregate_upload(&self, id: Uuid) -> Result<AggregateUpload> {
        let row = try_!(
            sqlx::query_as::<_, AggregateUpload>(
                "SELECT id, dataset_name, multipart_upload_id, data_key, index_key, first_datapoint_index, \
                 last_datapoint_index, total_size_bytes, upload_counter, source_datarange_ids FROM aggregate_uploads WHERE id = $1",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await
        );
        row.ok_or_else(|| Error::not_found(format!("aggregate upload {id} not found")))
    }

    #[tracing::instrument(level = "debug", skip(tx))]
    pub async fn delete_aggregate_upload(tx: &mut Tx<'_>, id: Uuid) -> Result<()> {
        try_!(sqlx::query("DELETE FROM aggregate_uploads WHERE id = $1").bind(id).execute(&mut **tx).await);
        Ok(())
    }

    // ---- deletion queue --------------------------------------------------

    #[tracing::instrument(level = "debug", skip(tx, presigned_delete_url))]
    pub async fn enqueue_deletion(
        tx: &mut Tx<'_>,
        bucket_config_name: &str,
        object_key: &str,
        presigned_delete_url: &str,
        delete_after: OffsetDateTime,
    ) -> Result<()> {
        try_!(
            sqlx::query(
                "INSERT INTO keys_to_delete (id, bucket_config_name, object_key, presigned_delete_url, delete_after) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(Uuid::new_v4())
            .bind(bucket_config_name)
            .bind(object_key)
            .bind(presigned_delete_url)
            .bind(delete_after)
            .execute(&mut **tx)
            .await
        );
        Ok(())
    }

    pub async fn due_deletions(&self, now: OffsetDateTime, limit: i64) -> Result<Vec<KeyToDelete>> {
        Ok(try_!(
            sqlx::query_as::<_, KeyToDelete>(
                "SELECT id, bucket_config_name, object_key, presigned_delete_url, delete_after FROM keys_to_delete \
                 WHERE delete_after <= $1 ORDER BY delete_after LIMIT $2",
            )
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        ))
    }

    pub async fn delete_deletion_row(&self, id: Uuid) -> Result<()> {
        try_!(sqlx::query("DELETE FROM keys_to_delete WHERE id = $1").bind(id).execute(&self.pool).await);
        Ok(())
    }
}
