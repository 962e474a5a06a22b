use base64::Engine;
use config::{Config, Environment};
use serde::Deserialize;
use sha2::{Digest, Sha256};

/// Process-wide settings, loaded once at startup and handed out as an
/// `Arc<Settings>`. Layers environment variables over the defaults below
/// using the `config` crate, recognizing the env vars named in the
/// external interface: `DB_URL`, `CACHE_DIR`, `ENCRYPTION_KEY`, optional
/// `ADDR`.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub db_url: String,
    pub cache_dir: String,
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity_bytes: u64,
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: u64,
    #[serde(default = "default_deletion_grace")]
    pub deletion_grace_seconds: i64,

    /// Derived from `ENCRYPTION_KEY` after deserialization; never itself
    /// read from the config source.
    #[serde(skip)]
    pub encryption_key: [u8; 32],
}

fn default_addr() -> String {
    "0.0.0.0:8080".to_owned()
}

fn default_cache_capacity() -> u64 {
    1024 * 1024 * 1024
}

/// 5 MiB: used as both the minimum multipart part size and the
/// direct-vs-multipart threshold.
fn default_multipart_threshold() -> u64 {
    5 * 1024 * 1024
}

fn default_deletion_grace() -> i64 {
    // Must exceed the longest presigned-URL TTL the download planner hands
    // out (6h, `download::DOWNLOAD_URL_TTL`), so a download in flight never
    // loses its backing object before the URL itself would have expired.
    7 * 3600
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        let cfg = Config::builder()
            .set_default("addr", default_addr())?
            .set_default("cache_capacity_bytes", default_cache_capacity())?
            .set_default("multipart_threshold_bytes", default_multipart_threshold())?
            .set_default("deletion_grace_seconds", default_deletion_grace())?
            .add_source(Environment::default().try_parsing(true))
            .build()?;

        let mut settings: Settings = cfg.try_deserialize()?;

        let key_b64 = std::env::var("ENCRYPTION_KEY").map_err(|_| anyhow::anyhow!("ENCRYPTION_KEY is not set"))?;
        let key_bytes = base64::engine::general_purpose::STANDARD
            .decode(key_b64.trim())
            .map_err(|e| anyhow::anyhow!("ENCRYPTION_KEY is not valid base64: {e}"))?;
        if key_bytes.len() != 32 {
            return Err(anyhow::anyhow!("ENCRYPTION_KEY must decode to exactly 32 bytes"));
        }

        // The raw key is hashed so that any well-formed 32-byte secret
        // yields a well-distributed AEAD key, per the design notes.
        let mut hasher = Sha256::new();
        hasher.update(&key_bytes);
        settings.encryption_key = hasher.finalize().into();

        Ok(settings)
    }
}
