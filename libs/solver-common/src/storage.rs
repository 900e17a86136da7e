use crate::types::SessionId;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Remote key layout - defines only naming, not transport.
/// Inputs live under `inputs/{session}/{file}`; outputs are salted with a
/// per-run token so the same filename produced twice never collides.

pub const INPUTS_NAMESPACE: &str = "inputs";
pub const OUTPUTS_NAMESPACE: &str = "outputs";

pub fn input_prefix(session: &SessionId) -> String {
    format!("{}/{}/", INPUTS_NAMESPACE, session)
}

pub fn input_key(session: &SessionId, filename: &str) -> String {
    format!("{}{}", input_prefix(session), filename)
}

pub fn output_prefix(session: &SessionId) -> String {
    format!("{}/{}/", OUTPUTS_NAMESPACE, session)
}

pub fn output_key(session: &SessionId, run_token: &Uuid, filename: &str) -> String {
    format!("{}{}/{}", output_prefix(session), run_token, filename)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    pub key: String,
    pub size: u64,
}

/// Remote blob store contract.
///
/// Implementations may be unavailable at any time; callers degrade to
/// local-only operation instead of failing the request.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Human readable backend name for logs.
    fn name(&self) -> &'static str;

    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>>;

    async fn download(&self, key: &str, local_path: &Path) -> Result<()>;

    async fn upload(&self, local_path: &Path, key: &str) -> Result<()>;

    /// Delete every blob whose key starts with `prefix`. Deleting nothing is not an error.
    async fn delete(&self, prefix: &str) -> Result<()>;
}

/// Blob store backed by a directory tree; keys map to relative paths.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.split('/').any(|part| part == ".." || part == ".") || key.starts_with('/') {
            anyhow::bail!("Refusing blob key with relative segments: {}", key);
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>> {
        // Walk from the deepest directory the prefix names, then filter.
        let dir_part = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let start = self.path_for(dir_part)?;
        let mut entries = Vec::new();
        for (relative, size) in walk_files(&start).await? {
            let key = if dir_part.is_empty() {
                relative
            } else {
                format!("{}/{}", dir_part, relative)
            };
            if key.starts_with(prefix) {
                entries.push(BlobEntry { key, size });
            }
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn download(&self, key: &str, local_path: &Path) -> Result<()> {
        let source = self.path_for(key)?;
        tokio::fs::copy(&source, local_path)
            .await
            .with_context(|| format!("Failed to download blob {}", key))?;
        Ok(())
    }

    async fn upload(&self, local_path: &Path, key: &str) -> Result<()> {
        let target = self.path_for(key)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local_path, &target)
            .await
            .with_context(|| format!("Failed to upload {} as {}", local_path.display(), key))?;
        Ok(())
    }

    async fn delete(&self, prefix: &str) -> Result<()> {
        for entry in self.list(prefix).await? {
            match tokio::fs::remove_file(self.path_for(&entry.key)?).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("Failed to delete blob {}", entry.key)),
            }
        }
        // Drop the now-empty directory when the prefix names one.
        if let Some(dir) = prefix.strip_suffix('/') {
            let path = self.path_for(dir)?;
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("Failed to remove {}", path.display())),
            }
        }
        Ok(())
    }
}

/// Recursively list regular files below `dir` as (`a/b.txt`, size) pairs.
/// A missing directory lists as empty.
pub async fn walk_files(dir: &Path) -> Result<Vec<(String, u64)>> {
    let mut files = Vec::new();
    let mut pending = vec![(dir.to_path_buf(), String::new())];

    while let Some((current, relative)) = pending.pop() {
        let mut reader = match tokio::fs::read_dir(&current).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", current.display())),
        };
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let child_relative = if relative.is_empty() {
                name
            } else {
                format!("{}/{}", relative, name)
            };
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push((entry.path(), child_relative));
            } else if file_type.is_file() {
                let size = entry.metadata().await?.len();
                files.push((child_relative, size));
            }
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(raw: &str) -> SessionId {
        SessionId::parse(raw).unwrap()
    }

    #[test]
    fn test_key_naming() {
        let s = session("abc");
        assert_eq!(input_prefix(&s), "inputs/abc/");
        assert_eq!(input_key(&s, "data.csv"), "inputs/abc/data.csv");
        assert_eq!(output_prefix(&s), "outputs/abc/");
    }

    #[test]
    fn test_output_keys_are_salted() {
        let s = session("abc");
        let first = output_key(&s, &Uuid::new_v4(), "result.csv");
        let second = output_key(&s, &Uuid::new_v4(), "result.csv");
        assert_ne!(first, second);
        assert!(first.starts_with("outputs/abc/"));
        assert!(first.ends_with("/result.csv"));
    }

    #[tokio::test]
    async fn test_fs_store_roundtrip_and_prefix_delete() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(remote.path());

        let source = local.path().join("data.csv");
        tokio::fs::write(&source, b"a,b\n1,2\n").await.unwrap();
        store.upload(&source, "inputs/s1/data.csv").await.unwrap();
        store.upload(&source, "inputs/s2/data.csv").await.unwrap();

        let listed = store.list("inputs/s1/").await.unwrap();
        assert_eq!(
            listed,
            vec![BlobEntry { key: "inputs/s1/data.csv".to_string(), size: 8 }]
        );

        let target = local.path().join("copy.csv");
        store.download("inputs/s1/data.csv", &target).await.unwrap();
        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"a,b\n1,2\n");

        store.delete("inputs/s1/").await.unwrap();
        assert!(store.list("inputs/s1/").await.unwrap().is_empty());
        assert_eq!(store.list("inputs/s2/").await.unwrap().len(), 1);

        // Deleting again is a no-op.
        store.delete("inputs/s1/").await.unwrap();
    }

    #[tokio::test]
    async fn test_fs_store_lists_nested_output_keys() {
        let remote = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(remote.path());
        let source = local.path().join("plot.png");
        tokio::fs::write(&source, b"png").await.unwrap();

        let s = session("s1");
        let key = output_key(&s, &Uuid::new_v4(), "plot.png");
        store.upload(&source, &key).await.unwrap();

        let listed = store.list(&output_prefix(&s)).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, key);
    }

    #[tokio::test]
    async fn test_fs_store_rejects_traversal() {
        let remote = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(remote.path());
        assert!(store.list("../etc/").await.is_err());
    }
}
