//! Container runtime control plane.
//!
//! Thin wrapper over the bollard Docker API used for the operations the
//! compose CLI does not cover well: daemon reachability, image presence and
//! pre-pulling, and querying the running containers of one isolation scope
//! via compose project labels. Connection handling falls back from the
//! local Docker defaults to rootless and system Podman sockets.

use async_trait::async_trait;
use bollard::Docker;
use futures::stream::StreamExt;
use std::collections::HashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Compose label naming the project a container belongs to.
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// Compose label naming the service a container runs.
pub const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";

/// Runtime control plane errors.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("container runtime API error: {0}")]
    Api(#[from] bollard::errors::Error),

    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
}

/// Runtime queries the deployment flow depends on.
///
/// Production code uses [`DockerRuntime`]; tests substitute a static probe.
#[async_trait]
pub trait RuntimeProbe: Send + Sync {
    /// Verify the daemon responds.
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// Make sure an image is available locally, pulling when missing.
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Compose service names with a running container in `project`.
    async fn running_services(&self, project: &str) -> Result<Vec<String>, RuntimeError>;
}

/// bollard-backed runtime probe.
///
/// Connects lazily on first use: bootstrap may have to install the daemon
/// before it can be reached, so construction must never touch the socket.
#[derive(Default)]
pub struct DockerRuntime {
    docker: OnceCell<Docker>,
}

impl DockerRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// The connected client, establishing the connection on first call.
    async fn handle(&self) -> Result<&Docker, RuntimeError> {
        self.docker.get_or_try_init(Self::connect).await
    }

    /// Connect to the local Docker daemon, falling back to Podman sockets.
    async fn connect() -> Result<Docker, RuntimeError> {
        debug!("connecting to container runtime");

        match Docker::connect_with_local_defaults() {
            Ok(docker) => {
                info!("connected to container runtime via local defaults");
                return Ok(docker);
            }
            Err(e) => debug!("local defaults failed: {e}"),
        }

        if let Ok(home) = std::env::var("HOME") {
            let socket = format!("unix://{home}/run/podman/podman.sock");
            match Docker::connect_with_socket(&socket, 120, bollard::API_DEFAULT_VERSION) {
                Ok(docker) => {
                    info!("connected to Podman via rootless socket");
                    return Ok(docker);
                }
                Err(e) => debug!("rootless Podman socket failed: {e}"),
            }
        }

        let system_socket = "unix:///run/podman/podman.sock";
        match Docker::connect_with_socket(system_socket, 120, bollard::API_DEFAULT_VERSION) {
            Ok(docker) => {
                info!("connected to Podman via system socket");
                Ok(docker)
            }
            Err(e) => {
                debug!("system Podman socket failed: {e}");
                Err(RuntimeError::Unavailable(
                    "failed to connect to Docker or Podman; is the daemon running?".to_string(),
                ))
            }
        }
    }

    /// Check if an image exists locally.
    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        match self.handle().await?.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(RuntimeError::Api(e)),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        info!("pulling image: {image}");

        let mut stream = self.handle().await?.create_image(
            Some(bollard::image::CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(status) = progress.status {
                        debug!("pull status: {status}");
                    }
                }
                Err(e) => return Err(RuntimeError::Api(e)),
            }
        }

        info!("pulled image: {image}");
        Ok(())
    }
}

#[async_trait]
impl RuntimeProbe for DockerRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.handle()
            .await?
            .ping()
            .await
            .map_err(|e| RuntimeError::Unavailable(format!("daemon ping failed: {e}")))?;
        debug!("container runtime ping successful");
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        if self.image_exists(image).await? {
            debug!("image {image} already present");
            return Ok(());
        }
        self.pull_image(image).await
    }

    async fn running_services(&self, project: &str) -> Result<Vec<String>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{COMPOSE_PROJECT_LABEL}={project}")],
        );
        filters.insert("status".to_string(), vec!["running".to_string()]);

        let containers = self
            .handle()
            .await?
            .list_containers(Some(bollard::container::ListContainersOptions {
                all: false,
                filters,
                ..Default::default()
            }))
            .await?;

        let mut services: Vec<String> = Vec::new();
        for container in containers {
            let Some(labels) = container.labels else {
                continue;
            };
            if let Some(service) = labels.get(COMPOSE_SERVICE_LABEL) {
                if !services.iter().any(|s| s == service) {
                    services.push(service.clone());
                }
            }
        }
        services.sort();
        Ok(services)
    }
}

/// Static probe for tests: always reachable, never pulls, reports a fixed
/// running set.
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// A [`RuntimeProbe`] answering from fixed data.
    #[derive(Default)]
    pub struct StaticProbe {
        running: Vec<String>,
        ensured_images: Mutex<Vec<String>>,
    }

    impl StaticProbe {
        pub fn new() -> Self {
            Self::default()
        }

        /// Probe reporting these services as running for any project.
        pub fn with_running<I, S>(services: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            Self {
                running: services.into_iter().map(Into::into).collect(),
                ensured_images: Mutex::new(Vec::new()),
            }
        }

        /// Images `ensure_image` was asked for.
        pub fn ensured_images(&self) -> Vec<String> {
            self.ensured_images.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RuntimeProbe for StaticProbe {
        async fn ping(&self) -> Result<(), RuntimeError> {
            Ok(())
        }

        async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
            self.ensured_images.lock().unwrap().push(image.to_string());
            Ok(())
        }

        async fn running_services(&self, _project: &str) -> Result<Vec<String>, RuntimeError> {
            Ok(self.running.clone())
        }
    }
}
