//! Docker implementation of the sandbox driver, via bollard.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use bollard::{
    Docker,
    models::{ContainerCreateBody, HostConfig},
    query_parameters::{
        CreateContainerOptions, CreateImageOptions, InspectContainerOptions, KillContainerOptions,
        ListContainersOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    },
};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use super::{ContainerHandle, ContainerSpec, DriverError, SandboxDriver};
use crate::{
    http_client::ContainerClient,
    objects::{CodePayload, LogLine, LogStream},
    retry::retry_until_deadline,
};

/// Label marking containers owned by this invoker, used to find orphans
/// after a crash.
const MANAGED_LABEL: &str = "invokerd.managed";

/// Port the action proxy listens on inside the container.
const ACTION_PROXY_PORT: u16 = 8080;

const CREATE_TIMEOUT: Duration = Duration::from_secs(60);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct DockerDriver {
    docker: Docker,
    network: Option<String>,
    client: ContainerClient,
}

impl DockerDriver {
    /// Connect to the Docker daemon. Supported addresses: unix sockets
    /// (`unix:///var/run/docker.sock` or a bare path) and `tcp://`/`http://`
    /// endpoints; `None` uses the local defaults.
    pub fn new(
        address: Option<&str>,
        network: Option<String>,
        max_response_bytes: usize,
    ) -> anyhow::Result<Self> {
        let docker = match address {
            None => Docker::connect_with_local_defaults()?,
            Some(addr) if addr.starts_with("tcp://") || addr.starts_with("http://") => {
                let addr = addr
                    .trim_start_matches("tcp://")
                    .trim_start_matches("http://");
                Docker::connect_with_http(
                    &format!("http://{}", addr),
                    120,
                    bollard::API_DEFAULT_VERSION,
                )?
            }
            Some(addr) => {
                let socket = addr.trim_start_matches("unix://");
                Docker::connect_with_socket(socket, 120, bollard::API_DEFAULT_VERSION)?
            }
        };
        Ok(Self {
            docker,
            network,
            client: ContainerClient::new(max_response_bytes),
        })
    }

    async fn image_exists(&self, image: &str) -> Result<bool, DriverError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(DriverError::Create(format!(
                "failed to inspect image {}: {}",
                image, e
            ))),
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<(), DriverError> {
        if self.image_exists(image).await? {
            return Ok(());
        }

        info!(image = %image, "pulling image");
        let options = CreateImageOptions {
            from_image: Some(image.to_string()),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            if let Err(e) = result {
                return Err(DriverError::Create(format!(
                    "failed to pull image {}: {}",
                    image, e
                )));
            }
        }
        Ok(())
    }

    async fn container_ip(&self, name: &str) -> Result<String, DriverError> {
        let inspect = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| DriverError::Create(format!("failed to inspect {}: {}", name, e)))?;

        let networks = inspect
            .network_settings
            .and_then(|ns| ns.networks)
            .ok_or_else(|| DriverError::Create(format!("{} has no network settings", name)))?;

        for (_name, endpoint) in networks {
            if let Some(ip) = endpoint.ip_address
                && !ip.is_empty()
            {
                return Ok(ip);
            }
        }
        Err(DriverError::Create(format!("{} has no IP address", name)))
    }

    fn build_host_config(&self, memory_mb: u64) -> HostConfig {
        let memory = Some((memory_mb * 1024 * 1024) as i64);
        HostConfig {
            memory,
            // memory_swap == memory means zero swap.
            memory_swap: memory,
            network_mode: self.network.clone(),
            ..Default::default()
        }
    }

    /// Wait until the action proxy inside the container accepts connections.
    async fn wait_reachable(&self, address: &str) -> anyhow::Result<()> {
        let address = address.to_string();
        retry_until_deadline(
            CREATE_TIMEOUT,
            READY_POLL_INTERVAL,
            "waiting for container to accept connections",
            || {
                let address = address.clone();
                async move {
                    tokio::net::TcpStream::connect(&address).await?;
                    Ok(())
                }
            },
        )
        .await
    }
}

#[async_trait]
impl SandboxDriver for DockerDriver {
    async fn create(&self, spec: ContainerSpec) -> Result<ContainerHandle, DriverError> {
        self.ensure_image(&spec.image).await?;

        let mut labels: HashMap<String, String> = spec.labels.iter().cloned().collect();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: Some(spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()),
            labels: Some(labels),
            host_config: Some(self.build_host_config(spec.memory_mb)),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: Some(spec.name.clone()),
            platform: String::new(),
        };

        self.docker
            .create_container(Some(options), body)
            .await
            .map_err(|e| DriverError::Create(format!("failed to create {}: {}", spec.name, e)))?;

        if let Err(e) = self
            .docker
            .start_container(&spec.name, None::<StartContainerOptions>)
            .await
        {
            // Created but never started; do not leak it.
            let _ = self
                .docker
                .remove_container(
                    &spec.name,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(DriverError::Create(format!(
                "failed to start {}: {}",
                spec.name, e
            )));
        }

        let ip = self.container_ip(&spec.name).await?;
        let address = format!("{}:{}", ip, ACTION_PROXY_PORT);

        self.wait_reachable(&address)
            .await
            .map_err(|e| DriverError::Create(e.to_string()))?;

        debug!(container = %spec.name, address = %address, "container started");
        Ok(ContainerHandle {
            id: spec.name,
            address,
            kind: spec.kind,
            memory_mb: spec.memory_mb,
        })
    }

    async fn init(
        &self,
        handle: &ContainerHandle,
        payload: &CodePayload,
    ) -> Result<(), DriverError> {
        let value = serde_json::to_value(payload)
            .map_err(|e| DriverError::Init {
                diagnostic: format!("unserializable code payload: {}", e),
            })?;
        self.client.init(&handle.address, &value).await
    }

    async fn run(
        &self,
        handle: &ContainerHandle,
        args: &serde_json::Value,
        deadline: Duration,
    ) -> Result<super::RunOutcome, DriverError> {
        self.client.run(&handle.address, args, deadline).await
    }

    async fn pause(&self, handle: &ContainerHandle) -> Result<(), DriverError> {
        self.docker
            .pause_container(&handle.id)
            .await
            .map_err(|e| DriverError::Other(format!("pause failed: {}", e)))
    }

    async fn resume(&self, handle: &ContainerHandle) -> Result<(), DriverError> {
        self.docker
            .unpause_container(&handle.id)
            .await
            .map_err(|e| DriverError::Other(format!("resume failed: {}", e)))
    }

    async fn destroy(&self, handle: &ContainerHandle) -> Result<(), DriverError> {
        let _ = self
            .docker
            .kill_container(
                &handle.id,
                Some(KillContainerOptions {
                    signal: "SIGKILL".to_string(),
                }),
            )
            .await;

        match self
            .docker
            .remove_container(
                &handle.id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // Already gone counts as destroyed.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(DriverError::Other(format!(
                "failed to remove {}: {}",
                handle.id, e
            ))),
        }
    }

    async fn logs(
        &self,
        handle: &ContainerHandle,
        since: DateTime<Utc>,
    ) -> Result<Vec<LogLine>, DriverError> {
        let options = LogsOptions {
            stdout: true,
            stderr: true,
            since: since.timestamp() as i32,
            timestamps: true,
            tail: "all".to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.logs(&handle.id, Some(options));
        let mut lines = Vec::new();
        while let Some(result) = stream.next().await {
            match result {
                Ok(output) => {
                    let (stream_kind, message) = match output {
                        bollard::container::LogOutput::StdOut { message } => {
                            (LogStream::Stdout, message)
                        }
                        bollard::container::LogOutput::StdErr { message } => {
                            (LogStream::Stderr, message)
                        }
                        _ => continue,
                    };
                    let text = String::from_utf8_lossy(&message);
                    for raw in text.lines() {
                        if let Some(line) = parse_timestamped_line(raw, stream_kind) {
                            lines.push(line);
                        }
                    }
                }
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => break,
                Err(e) => {
                    warn!(container = %handle.id, error = %e, "log fetch failed");
                    break;
                }
            }
        }
        Ok(lines)
    }

    async fn list_containers(&self) -> Result<Vec<String>, DriverError> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}=true", MANAGED_LABEL)],
        );

        let options = ListContainersOptions {
            all: true,
            filters: Some(filters),
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| DriverError::Other(format!("failed to list containers: {}", e)))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                c.names
                    .and_then(|names| names.first().cloned())
                    .map(|name| name.trim_start_matches('/').to_string())
            })
            .collect())
    }
}

/// Split a Docker log line with a leading RFC3339 timestamp into a
/// normalized [`LogLine`]. Lines without a parseable timestamp keep the
/// fetch time instead of being dropped.
fn parse_timestamped_line(raw: &str, stream: LogStream) -> Option<LogLine> {
    let raw = raw.trim_end_matches(['\r', '\n']);
    if raw.is_empty() {
        return None;
    }
    match raw.split_once(' ') {
        Some((ts, rest)) => match DateTime::parse_from_rfc3339(ts) {
            Ok(time) => Some(LogLine {
                time: time.with_timezone(&Utc),
                stream,
                log: rest.to_string(),
            }),
            Err(_) => Some(LogLine {
                time: Utc::now(),
                stream,
                log: raw.to_string(),
            }),
        },
        None => Some(LogLine {
            time: Utc::now(),
            stream,
            log: raw.to_string(),
        }),
    }
}
