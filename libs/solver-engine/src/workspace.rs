/// Workspace Manager - per-session `inputs/` + `outputs/` directories
///
/// Inputs are only ever added to (synced down from the blob store or
/// admitted through uploads). Outputs are wiped before every submission so
/// that harvesting returns exactly what the current submission produced.
use anyhow::{Context, Result};
use solver_common::storage::{self, walk_files, BlobStore};
use solver_common::types::{FileRef, SessionId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const INPUTS_DIR: &str = "inputs";
pub const OUTPUTS_DIR: &str = "outputs";

/// Marker for input files still being written. Such files are never
/// accepted as input names, synced down, or counted towards usage.
const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    pub root: PathBuf,
    pub inputs: PathBuf,
    pub outputs: PathBuf,
}

/// What a teardown managed to remove.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub local_removed: bool,
    pub remote_removed: bool,
}

pub struct Workspace {
    root: PathBuf,
    store: Option<Arc<dyn BlobStore>>,
}

/// Reduce a caller-supplied name to a bare file name.
pub fn sanitize_filename(raw: &str) -> Option<String> {
    let name = raw.rsplit(['/', '\\']).next()?.trim();
    if name.is_empty() || name == "." || name == ".." || name.ends_with(PARTIAL_SUFFIX) {
        return None;
    }
    Some(name.to_string())
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>, store: Option<Arc<dyn BlobStore>>) -> Self {
        Self {
            root: root.into(),
            store,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn has_remote(&self) -> bool {
        self.store.is_some()
    }

    pub fn paths(&self, session: &SessionId) -> SessionPaths {
        let root = self.root.join(session.as_str());
        SessionPaths {
            inputs: root.join(INPUTS_DIR),
            outputs: root.join(OUTPUTS_DIR),
            root,
        }
    }

    /// Create the session's directory pair if it does not exist yet.
    pub async fn ensure(&self, session: &SessionId) -> Result<SessionPaths> {
        let paths = self.paths(session);
        tokio::fs::create_dir_all(&paths.inputs)
            .await
            .with_context(|| format!("Failed to create {}", paths.inputs.display()))?;
        tokio::fs::create_dir_all(&paths.outputs)
            .await
            .with_context(|| format!("Failed to create {}", paths.outputs.display()))?;
        Ok(paths)
    }

    /// Mark the session as used now; the reaper reads this back as mtime.
    pub async fn touch(&self, session: &SessionId) -> Result<()> {
        let root = self.paths(session).root;
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            std::fs::File::open(&root)?.set_modified(SystemTime::now())
        })
        .await
        .context("touch task panicked")?
        .context("Failed to update session mtime")
    }

    /// Pull remote inputs that are missing locally or differ in size.
    /// Never deletes local files. Returns the number of files fetched.
    pub async fn refresh_inputs(&self, session: &SessionId) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let paths = self.ensure(session).await?;
        let prefix = storage::input_prefix(session);
        let remote = store
            .list(&prefix)
            .await
            .with_context(|| format!("Failed to list remote inputs via {}", store.name()))?;
        let local: HashMap<String, u64> = walk_files(&paths.inputs).await?.into_iter().collect();

        let mut fetched = 0;
        for entry in remote {
            let Some(name) = entry.key.strip_prefix(&prefix) else {
                continue;
            };
            if name.is_empty() || name.contains('/') || sanitize_filename(name).is_none() {
                continue;
            }
            if local.get(name) == Some(&entry.size) {
                continue;
            }

            // Download beside the target, then rename, so a failed sync
            // leaves the previous copy intact.
            let target = paths.inputs.join(name);
            let partial = paths.inputs.join(format!("{}{}", name, PARTIAL_SUFFIX));
            match store.download(&entry.key, &partial).await {
                Ok(()) => {
                    tokio::fs::rename(&partial, &target).await?;
                    fetched += 1;
                }
                Err(e) => {
                    let _ = tokio::fs::remove_file(&partial).await;
                    warn!(session = %session, key = %entry.key, error = %e, "Input sync failed");
                }
            }
        }

        if fetched > 0 {
            debug!(session = %session, fetched, "Synced remote inputs");
        }
        Ok(fetched)
    }

    /// Empty the outputs directory (the directory itself stays).
    pub async fn clear_outputs(&self, session: &SessionId) -> Result<()> {
        let paths = self.ensure(session).await?;
        let mut reader = tokio::fs::read_dir(&paths.outputs).await?;
        while let Some(entry) = reader.next_entry().await? {
            let path = entry.path();
            let removed = if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            removed.with_context(|| format!("Failed to clear {}", path.display()))?;
        }
        Ok(())
    }

    /// Upload every file in the outputs directory under a fresh run token.
    /// Files that cannot be uploaded are reported by local path instead.
    pub async fn harvest_outputs(&self, session: &SessionId) -> Result<Vec<FileRef>> {
        let paths = self.paths(session);
        let produced = walk_files(&paths.outputs).await?;
        if produced.is_empty() {
            return Ok(Vec::new());
        }

        let run_token = Uuid::new_v4();
        let mut files = Vec::with_capacity(produced.len());
        for (name, _size) in produced {
            let local_path = paths.outputs.join(&name);
            let local_ref = FileRef {
                name: name.clone(),
                remote_path: local_path.display().to_string(),
                local_only: true,
            };

            let Some(store) = &self.store else {
                files.push(local_ref);
                continue;
            };
            let key = storage::output_key(session, &run_token, &name);
            match store.upload(&local_path, &key).await {
                Ok(()) => files.push(FileRef {
                    name,
                    remote_path: key,
                    local_only: false,
                }),
                Err(e) => {
                    warn!(session = %session, file = %name, error = %e, "Output upload failed, returning local path");
                    files.push(local_ref);
                }
            }
        }
        Ok(files)
    }

    /// Persist an admitted input file locally and (when configured) remotely.
    /// A remote failure leaves nothing behind.
    pub async fn store_input(&self, session: &SessionId, filename: &str, bytes: &[u8]) -> Result<PathBuf> {
        let paths = self.ensure(session).await?;
        let target = paths.inputs.join(filename);
        let partial = paths.inputs.join(format!("{}{}", filename, PARTIAL_SUFFIX));
        tokio::fs::write(&partial, bytes)
            .await
            .with_context(|| format!("Failed to write {}", partial.display()))?;

        if let Some(store) = &self.store {
            let key = storage::input_key(session, filename);
            if let Err(e) = store.upload(&partial, &key).await {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e).with_context(|| format!("Failed to upload input via {}", store.name()));
            }
        }

        tokio::fs::rename(&partial, &target).await?;
        Ok(target)
    }

    /// Bytes currently stored for a session. Inputs count once per name
    /// (the larger of the local and remote copy); outputs count the remote
    /// history when a store exists, otherwise the local directory.
    pub async fn usage(&self, session: &SessionId) -> Result<u64> {
        let paths = self.paths(session);
        let mut inputs: HashMap<String, u64> = walk_files(&paths.inputs)
            .await?
            .into_iter()
            .filter(|(name, _)| !name.ends_with(PARTIAL_SUFFIX))
            .collect();

        let outputs = match &self.store {
            Some(store) => {
                let prefix = storage::input_prefix(session);
                for entry in store.list(&prefix).await? {
                    if let Some(name) = entry.key.strip_prefix(&prefix) {
                        let size = inputs.entry(name.to_string()).or_insert(0);
                        *size = (*size).max(entry.size);
                    }
                }
                store
                    .list(&storage::output_prefix(session))
                    .await?
                    .iter()
                    .map(|entry| entry.size)
                    .sum::<u64>()
            }
            None => walk_files(&paths.outputs)
                .await?
                .iter()
                .map(|(_, size)| size)
                .sum(),
        };

        Ok(inputs.values().sum::<u64>() + outputs)
    }

    /// Remove local and remote data. Missing data is not an error; remote
    /// failures are logged and reported, never raised.
    pub async fn destroy(&self, session: &SessionId) -> CleanupReport {
        let root = self.paths(session).root;
        let local_removed = match tokio::fs::remove_dir_all(&root).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!(session = %session, error = %e, "Failed to remove local workspace");
                false
            }
        };

        let remote_removed = match &self.store {
            None => true,
            Some(store) => {
                let mut ok = true;
                for prefix in [storage::input_prefix(session), storage::output_prefix(session)] {
                    if let Err(e) = store.delete(&prefix).await {
                        warn!(session = %session, prefix = %prefix, error = %e, "Failed to delete remote data");
                        ok = false;
                    }
                }
                ok
            }
        };

        info!(session = %session, local_removed, remote_removed, "Session data removed");
        CleanupReport {
            local_removed,
            remote_removed,
        }
    }

    /// Every session that currently has a local workspace.
    pub async fn sessions(&self) -> Result<Vec<SessionId>> {
        let mut reader = match tokio::fs::read_dir(&self.root).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", self.root.display())),
        };
        let mut sessions = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Ok(session) = SessionId::parse(&entry.file_name().to_string_lossy()) {
                sessions.push(session);
            }
        }
        sessions.sort();
        Ok(sessions)
    }

    /// Newest modification time across the session's directories, or `None`
    /// when the workspace does not exist.
    pub async fn last_touched(&self, session: &SessionId) -> Result<Option<SystemTime>> {
        let paths = self.paths(session);
        let mut newest: Option<SystemTime> = None;
        for dir in [&paths.root, &paths.inputs, &paths.outputs] {
            match tokio::fs::metadata(dir).await {
                Ok(meta) => {
                    let modified = meta.modified()?;
                    newest = Some(newest.map_or(modified, |current| current.max(modified)));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("Failed to stat {}", dir.display())),
            }
        }
        Ok(newest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solver_common::storage::FsBlobStore;

    struct Fixture {
        _local: tempfile::TempDir,
        _remote: tempfile::TempDir,
        store: Arc<FsBlobStore>,
        workspace: Workspace,
    }

    fn fixture() -> Fixture {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let store = Arc::new(FsBlobStore::new(remote.path()));
        let workspace = Workspace::new(local.path(), Some(store.clone() as Arc<dyn BlobStore>));
        Fixture { _local: local, _remote: remote, store, workspace }
    }

    fn session(raw: &str) -> SessionId {
        SessionId::parse(raw).unwrap()
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("data.csv").as_deref(), Some("data.csv"));
        assert_eq!(sanitize_filename("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(sanitize_filename("C:\\tmp\\x.txt").as_deref(), Some("x.txt"));
        assert_eq!(sanitize_filename(".."), None);
        assert_eq!(sanitize_filename("dir/"), None);
        assert_eq!(sanitize_filename("x.partial"), None);
    }

    #[tokio::test]
    async fn test_clear_outputs_removes_everything() {
        let f = fixture();
        let s = session("s1");
        let paths = f.workspace.ensure(&s).await.unwrap();
        tokio::fs::write(paths.outputs.join("old.csv"), b"x").await.unwrap();
        tokio::fs::create_dir_all(paths.outputs.join("nested")).await.unwrap();
        tokio::fs::write(paths.outputs.join("nested/p.png"), b"x").await.unwrap();

        f.workspace.clear_outputs(&s).await.unwrap();

        assert!(paths.outputs.exists());
        assert!(walk_files(&paths.outputs).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_harvest_uses_unique_keys_per_run() {
        let f = fixture();
        let s = session("s1");
        let paths = f.workspace.ensure(&s).await.unwrap();

        tokio::fs::write(paths.outputs.join("result.csv"), b"1").await.unwrap();
        let first = f.workspace.harvest_outputs(&s).await.unwrap();
        f.workspace.clear_outputs(&s).await.unwrap();
        tokio::fs::write(paths.outputs.join("result.csv"), b"2").await.unwrap();
        let second = f.workspace.harvest_outputs(&s).await.unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(first[0].name, "result.csv");
        assert!(!first[0].local_only);
        assert_ne!(first[0].remote_path, second[0].remote_path);
        assert_eq!(f.store.list(&storage::output_prefix(&s)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_harvest_without_store_returns_local_refs() {
        let local = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(local.path(), None);
        let s = session("s1");
        let paths = workspace.ensure(&s).await.unwrap();
        tokio::fs::write(paths.outputs.join("plot.png"), b"png").await.unwrap();

        let files = workspace.harvest_outputs(&s).await.unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].local_only);
        assert!(files[0].remote_path.ends_with("plot.png"));
    }

    #[tokio::test]
    async fn test_refresh_inputs_is_additive() {
        let f = fixture();
        let s = session("s1");
        let paths = f.workspace.ensure(&s).await.unwrap();

        // Local-only file must survive; remote file must arrive.
        tokio::fs::write(paths.inputs.join("local.txt"), b"keep").await.unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let upload = scratch.path().join("remote.csv");
        tokio::fs::write(&upload, b"a,b").await.unwrap();
        f.store.upload(&upload, &storage::input_key(&s, "remote.csv")).await.unwrap();

        assert_eq!(f.workspace.refresh_inputs(&s).await.unwrap(), 1);
        assert_eq!(tokio::fs::read(paths.inputs.join("remote.csv")).await.unwrap(), b"a,b");
        assert_eq!(tokio::fs::read(paths.inputs.join("local.txt")).await.unwrap(), b"keep");

        // Same size: nothing to do.
        assert_eq!(f.workspace.refresh_inputs(&s).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_store_input_and_usage() {
        let f = fixture();
        let s = session("s1");
        f.workspace.store_input(&s, "data.csv", b"0123456789").await.unwrap();
        assert_eq!(f.store.list(&storage::input_prefix(&s)).await.unwrap().len(), 1);
        // Counted once even though it exists locally and remotely.
        assert_eq!(f.workspace.usage(&s).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_partial_inputs_are_not_counted() {
        let local = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(local.path(), None);
        let s = session("s1");
        let paths = workspace.ensure(&s).await.unwrap();
        tokio::fs::write(paths.inputs.join("data.csv.partial"), b"half").await.unwrap();
        tokio::fs::write(paths.inputs.join("done.csv"), b"ab").await.unwrap();

        assert_eq!(workspace.usage(&s).await.unwrap(), 2);
        assert_eq!(sanitize_filename("data.csv.partial"), None);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let f = fixture();
        let s = session("s1");
        f.workspace.store_input(&s, "data.csv", b"abc").await.unwrap();

        let first = f.workspace.destroy(&s).await;
        let second = f.workspace.destroy(&s).await;
        assert_eq!(first, CleanupReport { local_removed: true, remote_removed: true });
        assert_eq!(second, first);
        assert!(!f.workspace.paths(&s).root.exists());
        assert!(f.store.list(&storage::input_prefix(&s)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sessions_and_last_touched() {
        let f = fixture();
        let a = session("a");
        f.workspace.ensure(&a).await.unwrap();
        f.workspace.touch(&a).await.unwrap();

        assert_eq!(f.workspace.sessions().await.unwrap(), vec![a.clone()]);
        assert!(f.workspace.last_touched(&a).await.unwrap().is_some());
        assert_eq!(f.workspace.last_touched(&session("missing")).await.unwrap(), None);
    }
}
