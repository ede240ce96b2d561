//! Container-based step execution using Docker.

use crate::cancel::CancellationSignal;
use crate::runner::{
    OutputLine, OutputStream, RunnerConfig, StepContext, StepResult, StepRunner, Termination,
    expire,
};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use futures::StreamExt;
use stagehand_core::{Error, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Directory the job sandbox is mounted at inside the container.
pub const CONTAINER_WORKDIR: &str = "/workspace";

/// Container runner for executing commands in Docker containers.
pub struct ContainerRunner {
    docker: Docker,
    config: RunnerConfig,
}

impl ContainerRunner {
    /// Create a new container runner.
    pub fn new(config: RunnerConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Internal(format!("Failed to connect to Docker: {}", e)))?;

        Ok(Self { docker, config })
    }

    /// Create with an existing Docker client.
    pub fn with_docker(docker: Docker, config: RunnerConfig) -> Self {
        Self { docker, config }
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut pull = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = pull.next().await {
            progress.map_err(|e| Error::Internal(format!("Failed to pull {}: {}", image, e)))?;
        }
        Ok(())
    }

    async fn remove(&self, container_name: &str) {
        let remove_options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        if let Err(e) = self
            .docker
            .remove_container(container_name, Some(remove_options))
            .await
        {
            warn!(container = %container_name, error = %e, "Failed to remove container");
        }
    }
}

#[async_trait]
impl StepRunner for ContainerRunner {
    async fn execute(
        &self,
        ctx: &StepContext,
        output_tx: mpsc::Sender<OutputLine>,
        mut cancel: CancellationSignal,
    ) -> Result<StepResult> {
        let start = std::time::Instant::now();
        let image = ctx
            .image
            .clone()
            .unwrap_or_else(|| self.config.default_image.clone());
        let container_name = format!("stagehand-{}-{}", ctx.job.replace(' ', "-"), uuid::Uuid::new_v4());

        info!(
            job = %ctx.job,
            image = %image,
            container = %container_name,
            command = %ctx.command,
            "Starting container execution"
        );

        self.ensure_image(&image).await?;

        let env: Vec<String> = ctx
            .variables
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let container_config = Config {
            image: Some(image.clone()),
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                ctx.command.clone(),
            ]),
            env: Some(env),
            working_dir: Some(CONTAINER_WORKDIR.to_string()),
            host_config: Some(bollard::models::HostConfig {
                binds: Some(vec![format!(
                    "{}:{}",
                    ctx.workspace.display(),
                    CONTAINER_WORKDIR
                )]),
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        self.docker
            .create_container(Some(create_options), container_config)
            .await
            .map_err(|e| Error::Internal(format!("Failed to create container: {}", e)))?;

        if let Err(e) = self
            .docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await
        {
            self.remove(&container_name).await;
            return Err(Error::Internal(format!("Failed to start container: {}", e)));
        }

        // Logs stream on their own task so the wait below can observe
        // cancellation while output is still flowing.
        let log_options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let docker = self.docker.clone();
        let log_container = container_name.clone();
        let job = ctx.job.clone();
        let log_handle = tokio::spawn(async move {
            let mut log_stream = docker.logs(&log_container, Some(log_options));
            let mut stdout_line_num = 0u32;
            let mut stderr_line_num = 0u32;

            while let Some(log_result) = log_stream.next().await {
                let (stream, message, line_number) = match log_result {
                    Ok(LogOutput::StdOut { message }) => {
                        stdout_line_num += 1;
                        (OutputStream::Stdout, message, stdout_line_num)
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr_line_num += 1;
                        (OutputStream::Stderr, message, stderr_line_num)
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(error = %e, "Error reading container logs");
                        break;
                    }
                };
                let output = OutputLine {
                    job: job.clone(),
                    stream,
                    content: String::from_utf8_lossy(&message).trim_end().to_string(),
                    line_number,
                    timestamp: chrono::Utc::now(),
                };
                if output_tx.send(output).await.is_err() {
                    break;
                }
            }
        });

        let wait_options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait_stream = self
            .docker
            .wait_container(&container_name, Some(wait_options));

        let mut terminated = None;
        let wait_result = tokio::select! {
            result = wait_stream.next() => result,
            _ = expire(ctx.timeout) => {
                warn!(job = %ctx.job, "Container execution timed out");
                terminated = Some(Termination::TimedOut);
                None
            }
            _ = cancel.cancelled() => {
                info!(job = %ctx.job, "Cancellation requested, killing container");
                terminated = Some(Termination::Cancelled);
                None
            }
        };
        drop(wait_stream);

        if terminated.is_some() {
            let _ = self
                .docker
                .kill_container::<String>(&container_name, None)
                .await;
            log_handle.abort();
        }
        let _ = log_handle.await;

        let duration_ms = start.elapsed().as_millis() as u64;
        let outcome = match terminated {
            Some(reason) => Ok(StepResult::terminated(reason, duration_ms)),
            None => match wait_result {
                Some(Ok(response)) => Ok(StepResult::exited(response.status_code as i32, duration_ms)),
                // Non-zero exits surface as an error carrying the status code
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                    Ok(StepResult::exited(code as i32, duration_ms))
                }
                Some(Err(e)) => Err(Error::Internal(format!("Container wait failed: {}", e))),
                None => Err(Error::Internal(
                    "Container wait returned no result".to_string(),
                )),
            },
        };

        self.remove(&container_name).await;

        if let Ok(result) = &outcome {
            debug!(
                container = %container_name,
                exit_code = result.exit_code,
                duration_ms,
                "Container execution completed"
            );
        }
        outcome
    }

    fn name(&self) -> &'static str {
        "docker"
    }
}
