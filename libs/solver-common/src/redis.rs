use crate::storage::{BlobEntry, BlobStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use std::path::Path;
use tracing::debug;

/// Redis key semantics for the blob store - every blob key is stored under
/// a fixed namespace so SCAN/DEL never touch unrelated data.
pub const BLOB_NAMESPACE: &str = "solver:blob:";

/// Keys scanned per SCAN round trip
const SCAN_BATCH: usize = 500;

/// Generate the Redis key for a blob key
pub fn redis_key(key: &str) -> String {
    format!("{}{}", BLOB_NAMESPACE, key)
}

/// Escape glob metacharacters so a blob prefix matches literally in SCAN MATCH
pub fn match_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(BLOB_NAMESPACE.len() + prefix.len() + 1);
    pattern.push_str(BLOB_NAMESPACE);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

/// Blob store backed by plain Redis string values.
///
/// Files are stored whole (`SET`), listed with `SCAN` + `STRLEN`. This is
/// meant for modest per-session data; the quota keeps it bounded.
#[derive(Clone)]
pub struct RedisBlobStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisBlobStore {
    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .with_context(|| format!("Invalid Redis URL: {}", redis_url))?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        Ok(Self::new(conn))
    }

    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = match_pattern(prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .context("Redis SCAN failed")?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

#[async_trait]
impl BlobStore for RedisBlobStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>> {
        let mut conn = self.conn.clone();
        let mut entries = Vec::new();
        for redis_key in self.scan_keys(prefix).await? {
            let size: u64 = conn.strlen(&redis_key).await?;
            let key = redis_key
                .strip_prefix(BLOB_NAMESPACE)
                .unwrap_or(&redis_key)
                .to_string();
            entries.push(BlobEntry { key, size });
        }
        Ok(entries)
    }

    async fn download(&self, key: &str, local_path: &Path) -> Result<()> {
        let mut conn = self.conn.clone();
        let payload: Option<Vec<u8>> = conn.get(redis_key(key)).await?;
        let payload = payload.with_context(|| format!("Blob not found: {}", key))?;
        tokio::fs::write(local_path, payload)
            .await
            .with_context(|| format!("Failed to write {}", local_path.display()))?;
        Ok(())
    }

    async fn upload(&self, local_path: &Path, key: &str) -> Result<()> {
        let payload = tokio::fs::read(local_path)
            .await
            .with_context(|| format!("Failed to read {}", local_path.display()))?;
        let mut conn = self.conn.clone();
        let _: () = conn.set(redis_key(key), payload).await?;
        Ok(())
    }

    async fn delete(&self, prefix: &str) -> Result<()> {
        let keys = self.scan_keys(prefix).await?;
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        for chunk in keys.chunks(SCAN_BATCH) {
            let _: () = conn.del(chunk.to_vec()).await?;
        }
        debug!(prefix, keys = keys.len(), "Deleted blobs");
        Ok(())
    }
}
