// CLI commands, run against an in-process execution coordinator
use anyhow::{bail, Context as _, Result};
use solver_common::config::EngineConfig;
use solver_common::redis::RedisBlobStore;
use solver_common::storage::{BlobStore, FsBlobStore};
use solver_common::types::ExecutionResult;
use solver_engine::reaper::Reaper;
use solver_engine::ExecutionCoordinator;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

pub struct Context {
    pub config: EngineConfig,
    pub coordinator: ExecutionCoordinator,
}

impl Context {
    pub async fn from_env() -> Result<Self> {
        let config = EngineConfig::from_env().context("Invalid configuration")?;
        let store: Option<Arc<dyn BlobStore>> = match (&config.redis_url, &config.blob_dir) {
            (Some(url), _) => Some(Arc::new(RedisBlobStore::connect(url).await?)),
            (None, Some(dir)) => Some(Arc::new(FsBlobStore::new(dir.clone()))),
            (None, None) => None,
        };
        let backend = solver_engine::backend_from_config(&config)?;
        let coordinator = ExecutionCoordinator::new(&config, backend, store);
        Ok(Self { config, coordinator })
    }
}

fn print_result(result: &ExecutionResult) {
    print!("{}", result.output);
    if !result.error.is_empty() {
        eprint!("{}", result.error);
        if !result.error.ends_with('\n') {
            eprintln!();
        }
    }
    if !result.artifacts.is_empty() {
        println!("🖼️  {} image(s) rendered", result.artifacts.len());
    }
    for file in &result.files {
        let marker = if file.local_only { " (local only)" } else { "" };
        println!("📄 {} -> {}{}", file.name, file.remote_path, marker);
    }
}

/// Run each file (or stdin) as one submission against the same session
pub async fn run(ctx: &Context, session: &str, timeout_secs: u64, json: bool, files: &[PathBuf]) -> Result<()> {
    let mut sources = Vec::new();
    if files.is_empty() {
        let mut code = String::new();
        std::io::stdin()
            .read_to_string(&mut code)
            .context("Failed to read code from stdin")?;
        sources.push(code);
    }
    for path in files {
        let code = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        sources.push(code);
    }

    let timeout = ctx.config.effective_timeout(timeout_secs);
    let mut failures = 0;
    for code in sources {
        let result = ctx.coordinator.execute(session, &code, timeout).await;
        if !result.is_success() {
            failures += 1;
        }
        if json {
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            print_result(&result);
        }
    }

    if failures > 0 {
        bail!("{} submission(s) reported an error", failures);
    }
    Ok(())
}

pub async fn upload(ctx: &Context, session: &str, file: &Path, name: Option<&str>) -> Result<()> {
    let bytes = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let filename = match name {
        Some(name) => name.to_string(),
        None => file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("Upload path has no file name")?,
    };

    match ctx.coordinator.admit_file(session, &filename, &bytes).await {
        Ok(admitted) => {
            println!(
                "✅ Uploaded '{}' ({} bytes), session now uses {} of {} bytes",
                admitted.filename,
                admitted.bytes,
                admitted.usage_bytes,
                ctx.config.quota_bytes
            );
            Ok(())
        }
        Err(rejection) => {
            println!("❌ Upload rejected");
            bail!(rejection)
        }
    }
}

pub async fn usage(ctx: &Context, session: &str) -> Result<()> {
    let report = ctx.coordinator.usage(session).await?;
    println!(
        "📊 Session '{}' uses {} of {} bytes",
        report.session_id, report.used_bytes, report.ceiling_bytes
    );
    Ok(())
}

pub async fn cleanup(ctx: &Context, session: &str) {
    let response = ctx.coordinator.teardown(session).await;
    println!("🗑️  Session '{}' removed", response.session_id);
    if !response.local_removed {
        println!("⚠️  Local workspace could not be fully removed");
    }
    if !response.remote_removed {
        println!("⚠️  Remote data could not be fully removed");
    }
}

pub async fn reap(ctx: &Context, retention_secs: Option<u64>) {
    let retention = retention_secs
        .map(Duration::from_secs)
        .unwrap_or(ctx.config.retention);
    let reaper = Reaper::new(ctx.coordinator.registry().clone(), retention, ctx.config.reaper_interval);
    let reaped = reaper.reap_once(SystemTime::now()).await;
    if reaped.is_empty() {
        println!("✅ No idle sessions");
        return;
    }
    for session in &reaped {
        println!("🗑️  Reaped {}", session);
    }
    println!("✅ {} session(s) reaped", reaped.len());
}
