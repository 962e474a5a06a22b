use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BucketConfig {
    pub name: String,
    pub endpoint: String,
    pub bucket: String,
    pub access_key_encrypted: String,
    pub secret_key_encrypted: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Dataset {
    pub name: String,
    pub bucket_config_name: String,
    pub upload_counter: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Datarange {
    pub id: Uuid,
    pub dataset_name: String,
    pub data_key: String,
    pub index_key: String,
    pub min_key: i64,
    pub max_key: i64,
    pub size_bytes: i64,
    pub upload_counter: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DatarangeUpload {
    pub id: Uuid,
    pub dataset_name: String,
    pub multipart_upload_id: Option<String>,
    pub data_key: String,
    pub index_key: String,
    pub first_datapoint_index: i64,
    pub number_of_datapoints: i64,
    pub claimed_size_bytes: i64,
    pub upload_counter: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AggregateUpload {
    pub id: Uuid,
    pub dataset_name: String,
    pub multipart_upload_id: Option<String>,
    pub data_key: String,
    pub index_key: String,
    pub first_datapoint_index: i64,
    pub last_datapoint_index: i64,
    pub total_size_bytes: i64,
    pub upload_counter: i64,
    pub source_datarange_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct KeyToDelete {
    pub id: Uuid,
    pub bucket_config_name: String,
    pub object_key: String,
    pub presigned_delete_url: String,
    pub delete_after: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct DatasetStats {
    pub name: String,
    pub datarange_count: i64,
    pub total_datapoints: i64,
    pub min_key: Option<i64>,
    pub max_key: Option<i64>,
    pub total_bytes: i64,
}
