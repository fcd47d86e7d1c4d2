use std::{ffi::OsString, path::Path};

use async_trait::async_trait;
use bollard::{
    Docker,
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecOptions, StartExecResults},
    models::{ContainerCreateBody, HostConfig},
    query_parameters::{
        CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
        RemoveContainerOptionsBuilder, StartContainerOptions, StopContainerOptionsBuilder,
    },
};
use bollard::container::LogOutput;
use futures_util::StreamExt;
use shell::{OutputBuffer, STDOUT_TAIL_BYTES};
use tokio::process::Command;
use tracing::{debug, info};

use crate::engine::{
    ContainerEngine, ContainerInfo, ContainerRequest, EngineError, ExecOutput, MountInfo,
};

const DOCKER_CLI: &str = "docker";
const STOP_TIMEOUT_SECS: i32 = 5;

/// Docker engine over the local daemon socket. Image builds, archive loads
/// and file copies go through the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
    cli: String,
}

impl DockerEngine {
    pub fn connect_local() -> Result<Self, EngineError> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|source| EngineError::Unreachable {
                message: source.to_string(),
            })?;
        Ok(Self {
            docker,
            cli: DOCKER_CLI.to_owned(),
        })
    }

    pub async fn ping(&self) -> Result<(), EngineError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|source| EngineError::Unreachable {
                message: source.to_string(),
            })
    }

    async fn run_cli(
        &self,
        operation: &'static str,
        target: &str,
        args: Vec<OsString>,
    ) -> Result<Vec<u8>, EngineError> {
        debug!(operation, target, "invoking docker cli");
        let output = Command::new(&self.cli)
            .args(&args)
            .output()
            .await
            .map_err(|source| EngineError::Unreachable {
                message: format!("failed to run `{}`: {source}", self.cli),
            })?;
        if !output.status.success() {
            return Err(EngineError::operation(
                operation,
                target,
                String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            ));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ensure_image(&self, image: &str) -> Result<(), EngineError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(error) if is_not_found_error(&error) => {}
            Err(error) => return Err(classify("inspect_image", image, error)),
        }

        info!(image, "pulling sandbox image");
        let mut pull = self.docker.create_image(
            Some(CreateImageOptionsBuilder::new().from_image(image).build()),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            progress.map_err(|error| classify("pull_image", image, error))?;
        }
        Ok(())
    }

    async fn build_image(
        &self,
        dockerfile: &Path,
        context: &Path,
        tag: &str,
    ) -> Result<(), EngineError> {
        info!(tag, dockerfile = %dockerfile.display(), "building sandbox image");
        self.run_cli(
            "build_image",
            tag,
            vec![
                "build".into(),
                "-f".into(),
                dockerfile.into(),
                "-t".into(),
                tag.into(),
                context.into(),
            ],
        )
        .await
        .map(|_| ())
    }

    async fn load_image(&self, archive: &Path) -> Result<String, EngineError> {
        let target = archive.to_string_lossy().into_owned();
        let stdout = self
            .run_cli(
                "load_image",
                &target,
                vec!["load".into(), "-i".into(), archive.into()],
            )
            .await?;
        parse_loaded_image(&String::from_utf8_lossy(&stdout)).ok_or_else(|| {
            EngineError::operation(
                "load_image",
                &target,
                "docker load did not report a loaded image",
            )
        })
    }

    async fn create_container(&self, request: &ContainerRequest) -> Result<String, EngineError> {
        let body = ContainerCreateBody {
            image: Some(request.image.clone()),
            cmd: Some(vec!["sleep".to_owned(), "infinity".to_owned()]),
            labels: Some(request.labels.clone()),
            working_dir: request.working_dir.clone(),
            host_config: Some(HostConfig {
                binds: Some(request.binds.clone()),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };
        let created = self
            .docker
            .create_container(
                Some(
                    CreateContainerOptionsBuilder::new()
                        .name(&request.name)
                        .build(),
                ),
                body,
            )
            .await
            .map_err(|error| classify("create_container", &request.name, error))?;
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(|error| classify("start_container", id, error))
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, EngineError> {
        let inspected = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|error| classify("inspect_container", id, error))?;
        let running = inspected
            .state
            .and_then(|state| state.running)
            .unwrap_or(false);
        let mounts = inspected
            .mounts
            .unwrap_or_default()
            .into_iter()
            .filter_map(|mount| {
                Some(MountInfo {
                    source: mount.source?,
                    destination: mount.destination?,
                })
            })
            .collect();
        Ok(ContainerInfo { running, mounts })
    }

    async fn copy_into(
        &self,
        id: &str,
        source: &Path,
        destination: &str,
    ) -> Result<(), EngineError> {
        self.run_cli(
            "copy_into",
            id,
            vec![
                "cp".into(),
                source.into(),
                format!("{id}:{destination}").into(),
            ],
        )
        .await
        .map(|_| ())
    }

    async fn exec(
        &self,
        id: &str,
        argv: &[String],
        capture_limit: usize,
    ) -> Result<ExecOutput, EngineError> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(argv.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|error| classify("create_exec", id, error))?;

        let mut stdout = OutputBuffer::new(capture_limit, STDOUT_TAIL_BYTES);
        let mut stderr = OutputBuffer::new(capture_limit, 0);
        if let StartExecResults::Attached {
            output: mut stream, ..
        } = self
            .docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await
            .map_err(|error| classify("start_exec", id, error))?
        {
            while let Some(chunk) = stream.next().await {
                match chunk.map_err(|error| classify("read_exec_output", id, error))? {
                    LogOutput::StdOut { message } => stdout.push(&message),
                    LogOutput::StdErr { message } => stderr.push(&message),
                    _ => {}
                }
            }
        }

        let inspected = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|error| classify("inspect_exec", id, error))?;
        Ok(ExecOutput {
            stdout: stdout.finish(),
            stderr: stderr.finish(),
            exit_code: inspected.exit_code,
        })
    }

    async fn stop_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .stop_container(
                id,
                Some(
                    StopContainerOptionsBuilder::new()
                        .t(STOP_TIMEOUT_SECS)
                        .build(),
                ),
            )
            .await
            .map_err(|error| classify("stop_container", id, error))
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .remove_container(
                id,
                Some(
                    RemoveContainerOptionsBuilder::new()
                        .force(true)
                        .v(true)
                        .link(false)
                        .build(),
                ),
            )
            .await
            .map_err(|error| classify("remove_container", id, error))
    }
}

fn is_not_found_error(error: &BollardError) -> bool {
    match error {
        BollardError::DockerResponseServerError { status_code, .. } => *status_code == 404,
        _ => false,
    }
}

fn classify(operation: &'static str, target: &str, error: BollardError) -> EngineError {
    match error {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => EngineError::NotFound {
            operation,
            target: target.to_owned(),
        },
        BollardError::DockerResponseServerError {
            status_code: 409,
            message,
        } => EngineError::Conflict {
            operation,
            target: target.to_owned(),
            message,
        },
        BollardError::DockerResponseServerError { message, .. } => {
            EngineError::operation(operation, target, message)
        }
        other => EngineError::Unreachable {
            message: format!("{operation} `{target}`: {other}"),
        },
    }
}

/// Reads the image reference from `docker load` output, preferring a
/// named image over a bare id.
pub(crate) fn parse_loaded_image(stdout: &str) -> Option<String> {
    let named = stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix("Loaded image:"))
        .last();
    let by_id = stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix("Loaded image ID:"))
        .last();
    named
        .or(by_id)
        .map(str::trim)
        .filter(|image| !image.is_empty())
        .map(ToOwned::to_owned)
}
