/// Docker backend - one container per worker generation
///
/// **Container Rules:**
/// 1. Pulls the interpreter image if not present
/// 2. Creates a container with security constraints:
///    - Network disabled
///    - CPU/memory limits enforced
///    - Only the session workspace mounted (at `/workspace`)
/// 3. Keeps the container alive with a sleeping init process
/// 4. Starts the driver through an attached exec and streams its stdout
/// 5. Killing the worker force-removes the whole container
use crate::backend::{InterpreterBackend, WorkerIo, WorkerProcess, EVENT_CHANNEL_CAPACITY};
use crate::protocol::{decode_event, LineBuffer, DRIVER_SOURCE};
use crate::workspace::SessionPaths;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use solver_common::config::EngineConfig;
use solver_common::types::SessionId;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const CONTAINER_WORKDIR: &str = "/workspace";

/// Bootstrap that decodes the driver from the environment, so the driver
/// never has to be baked into the image.
const DRIVER_BOOTSTRAP: &str =
    "import base64, os; exec(compile(base64.b64decode(os.environ['SOLVER_DRIVER']), '<driver>', 'exec'))";

pub struct DockerBackend {
    docker: Docker,
    image: String,
    memory_limit_bytes: i64,
    nano_cpus: i64,
}

impl DockerBackend {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon")?;

        Ok(Self {
            docker,
            image: config.docker_image.clone(),
            memory_limit_bytes: i64::from(config.memory_limit_mb) * 1024 * 1024,
            nano_cpus: (f64::from(config.cpu_limit) * 1_000_000_000.0) as i64,
        })
    }

    /// Ensure the interpreter image is available (pull if needed)
    async fn ensure_image(&self) -> Result<()> {
        if self.docker.inspect_image(&self.image).await.is_ok() {
            debug!(image = %self.image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %self.image, "Image cache miss, pulling now");
        let options = Some(CreateImageOptions {
            from_image: self.image.as_str(),
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.context("Failed to pull Docker image")?;
        }

        info!(image = %self.image, "Image pulled successfully");
        Ok(())
    }

    async fn remove(docker: &Docker, container_id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match docker.remove_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove container {}", container_id)),
        }
    }
}

/// Container handle; removes the container on kill, or on drop as a fallback
/// when the worker is abandoned without an explicit kill.
struct ContainerProcess {
    docker: Docker,
    container_id: String,
    removed: bool,
}

#[async_trait]
impl WorkerProcess for ContainerProcess {
    fn describe(&self) -> String {
        format!("container:{}", &self.container_id[..self.container_id.len().min(12)])
    }

    async fn kill(&mut self) -> Result<()> {
        if self.removed {
            return Ok(());
        }
        DockerBackend::remove(&self.docker, &self.container_id).await?;
        self.removed = true;
        Ok(())
    }
}

impl Drop for ContainerProcess {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        // Cannot be async in Drop; hand the removal to the runtime.
        let docker = self.docker.clone();
        let container_id = self.container_id.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = DockerBackend::remove(&docker, &container_id).await {
                    warn!(container = %container_id, error = %e, "Failed to clean up container");
                }
            });
        }
    }
}

#[async_trait]
impl InterpreterBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn spawn(&self, session: &SessionId, paths: &SessionPaths) -> Result<WorkerIo> {
        self.ensure_image()
            .await
            .with_context(|| format!("Failed to ensure Docker image '{}' is available", self.image))?;

        let host_root = tokio::fs::canonicalize(&paths.root)
            .await
            .with_context(|| format!("Workspace {} is missing", paths.root.display()))?;
        let container_name = format!("solver-{}-{}", session, uuid::Uuid::new_v4().simple());

        let config = Config {
            image: Some(self.image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            entrypoint: Some(vec![]),
            working_dir: Some(CONTAINER_WORKDIR.to_string()),
            network_disabled: Some(true),
            host_config: Some(bollard::models::HostConfig {
                memory: Some(self.memory_limit_bytes),
                nano_cpus: Some(self.nano_cpus),
                binds: Some(vec![format!("{}:{}", host_root.display(), CONTAINER_WORKDIR)]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };
        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .context("Failed to create Docker container")?;

        // Guard first, so every early return below removes the container.
        let process = ContainerProcess {
            docker: self.docker.clone(),
            container_id: container.id.clone(),
            removed: false,
        };

        self.docker
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start Docker container")?;

        let exec_config = CreateExecOptions {
            cmd: Some(vec![
                "python3".to_string(),
                "-u".to_string(),
                "-c".to_string(),
                DRIVER_BOOTSTRAP.to_string(),
            ]),
            env: Some(vec![
                format!("SOLVER_DRIVER={}", general_purpose::STANDARD.encode(DRIVER_SOURCE)),
                "MPLBACKEND=Agg".to_string(),
            ]),
            working_dir: Some(CONTAINER_WORKDIR.to_string()),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(&container.id, exec_config)
            .await
            .context("Failed to create driver exec")?;

        let start_config = StartExecOptions {
            detach: false,
            ..Default::default()
        };
        let (mut output, input) = match self.docker.start_exec(&exec.id, Some(start_config)).await? {
            StartExecResults::Attached { output, input } => (output, input),
            StartExecResults::Detached => anyhow::bail!("Driver exec started detached"),
        };

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let label = process.describe();
        tokio::spawn(async move {
            let mut lines = LineBuffer::new();
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => {
                        for line in lines.push(&message) {
                            match decode_event(&line) {
                                Some(event) => {
                                    if tx.send(event).await.is_err() {
                                        return;
                                    }
                                }
                                None => debug!(worker = %label, "Ignoring non-protocol line"),
                            }
                        }
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        debug!(worker = %label, "worker stderr: {}", String::from_utf8_lossy(&message).trim_end());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(worker = %label, error = %e, "Error reading driver output");
                        return;
                    }
                }
            }
        });

        info!(session = %session, container = %process.describe(), "Interpreter container started");

        Ok(WorkerIo {
            input,
            events: rx,
            process: Box::new(process),
        })
    }
}
