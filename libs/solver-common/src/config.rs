// Engine configuration, read from the environment
use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which interpreter backend hosts the per-session workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Local `python3` child process per worker
    Process,
    /// One Docker container per worker generation
    Docker,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "process" | "local" => Ok(BackendKind::Process),
            "docker" => Ok(BackendKind::Docker),
            other => bail!("Unknown backend '{}' (valid options: process, docker)", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workspace_root: PathBuf,
    pub backend: BackendKind,
    pub python_bin: String,
    pub docker_image: String,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
    pub quota_bytes: u64,
    pub retention: Duration,
    pub reaper_interval: Duration,
    pub read_deadline: Duration,
    pub startup_timeout: Duration,
    pub default_timeout: Duration,
    pub max_timeout: Duration,
    pub max_code_bytes: usize,
    pub max_upload_bytes: usize,
    pub redis_url: Option<String>,
    pub blob_dir: Option<PathBuf>,
    pub bind_addr: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("./workspaces"),
            backend: BackendKind::Process,
            python_bin: "python3".to_string(),
            docker_image: "solver-python:latest".to_string(),
            memory_limit_mb: 512,
            cpu_limit: 1.0,
            quota_bytes: 100 * 1024 * 1024,
            retention: Duration::from_secs(24 * 60 * 60),
            reaper_interval: Duration::from_secs(60 * 60),
            read_deadline: Duration::from_secs(120),
            startup_timeout: Duration::from_secs(60),
            default_timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(600),
            max_code_bytes: 1024 * 1024,
            max_upload_bytes: 50 * 1024 * 1024,
            redis_url: None,
            blob_dir: None,
            bind_addr: "0.0.0.0:8000".to_string(),
        }
    }
}

impl EngineConfig {
    /// Build the configuration from `SOLVER_*` / `REDIS_URL` variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` but with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| -> Result<Duration> {
            Ok(Duration::from_secs(parse_or(&lookup, key, default.as_secs())?))
        };

        let config = Self {
            workspace_root: lookup("SOLVER_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            backend: parse_or(&lookup, "SOLVER_BACKEND", defaults.backend)?,
            python_bin: lookup("SOLVER_PYTHON").unwrap_or(defaults.python_bin),
            docker_image: lookup("SOLVER_DOCKER_IMAGE").unwrap_or(defaults.docker_image),
            memory_limit_mb: parse_or(&lookup, "SOLVER_MEMORY_LIMIT_MB", defaults.memory_limit_mb)?,
            cpu_limit: parse_or(&lookup, "SOLVER_CPU_LIMIT", defaults.cpu_limit)?,
            quota_bytes: parse_or(&lookup, "SOLVER_QUOTA_BYTES", defaults.quota_bytes)?,
            retention: secs("SOLVER_RETENTION_SECS", defaults.retention)?,
            reaper_interval: secs("SOLVER_REAPER_INTERVAL_SECS", defaults.reaper_interval)?,
            read_deadline: secs("SOLVER_READ_DEADLINE_SECS", defaults.read_deadline)?,
            startup_timeout: secs("SOLVER_STARTUP_TIMEOUT_SECS", defaults.startup_timeout)?,
            default_timeout: secs("SOLVER_DEFAULT_TIMEOUT_SECS", defaults.default_timeout)?,
            max_timeout: secs("SOLVER_MAX_TIMEOUT_SECS", defaults.max_timeout)?,
            max_code_bytes: parse_or(&lookup, "SOLVER_MAX_CODE_BYTES", defaults.max_code_bytes)?,
            max_upload_bytes: parse_or(&lookup, "SOLVER_MAX_UPLOAD_BYTES", defaults.max_upload_bytes)?,
            redis_url: lookup("REDIS_URL").filter(|url| !url.is_empty()),
            blob_dir: lookup("SOLVER_BLOB_DIR")
                .filter(|dir| !dir.is_empty())
                .map(PathBuf::from),
            bind_addr: lookup("SOLVER_BIND").unwrap_or(defaults.bind_addr),
        };

        if config.reaper_interval.is_zero() {
            bail!("SOLVER_REAPER_INTERVAL_SECS must be greater than zero");
        }
        if config.default_timeout > config.max_timeout {
            bail!(
                "SOLVER_DEFAULT_TIMEOUT_SECS ({}s) exceeds SOLVER_MAX_TIMEOUT_SECS ({}s)",
                config.default_timeout.as_secs(),
                config.max_timeout.as_secs()
            );
        }

        Ok(config)
    }

    /// Resolve a caller-chosen timeout: 0 means the default, anything above
    /// the maximum is clamped.
    pub fn effective_timeout(&self, requested_seconds: u64) -> Duration {
        if requested_seconds == 0 {
            return self.default_timeout;
        }
        Duration::from_secs(requested_seconds).min(self.max_timeout)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Invalid value '{}' for {}", raw, key)),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = EngineConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.backend, BackendKind::Process);
        assert_eq!(config.retention, Duration::from_secs(86400));
        assert_eq!(config.reaper_interval, Duration::from_secs(3600));
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("SOLVER_BACKEND", "Docker"),
            ("SOLVER_QUOTA_BYTES", "2048"),
            ("SOLVER_RETENTION_SECS", "60"),
            ("REDIS_URL", "redis://cache:6379"),
        ]))
        .unwrap();
        assert_eq!(config.backend, BackendKind::Docker);
        assert_eq!(config.quota_bytes, 2048);
        assert_eq!(config.retention, Duration::from_secs(60));
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
    }

    #[test]
    fn test_invalid_value_is_an_error() {
        let err = EngineConfig::from_lookup(lookup_from(&[("SOLVER_QUOTA_BYTES", "lots")]))
            .unwrap_err();
        assert!(format!("{:#}", err).contains("SOLVER_QUOTA_BYTES"));
        assert!(EngineConfig::from_lookup(lookup_from(&[("SOLVER_BACKEND", "vm")])).is_err());
    }

    #[test]
    fn test_effective_timeout() {
        let config = EngineConfig::default();
        assert_eq!(config.effective_timeout(0), Duration::from_secs(30));
        assert_eq!(config.effective_timeout(5), Duration::from_secs(5));
        assert_eq!(config.effective_timeout(100_000), Duration::from_secs(600));
    }
}
