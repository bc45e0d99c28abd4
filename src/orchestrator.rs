//! Deployment orchestration.
//!
//! Sequences one deployment request through its stages: resolve the source,
//! plan ingress (pure validation, before anything on the host changes),
//! bootstrap the host, execute against the runtime, reconcile ingress, and
//! report a final status. Every stage failure short-circuits the rest,
//! except certificate issuance, which degrades the result instead of
//! failing it.

use crate::bootstrap::{BootstrapError, HostBootstrapper, HostRequirements};
use crate::execute::{DeploymentExecutor, ExecError, RetryPolicy, probe_free_ports};
use crate::ingress::{self, IngressError, IngressPlan, IngressSummary, ProxyConfigurator};
use crate::paths::ManagedPaths;
use crate::request::{AccessMode, DeploymentRequest, IngressMode, RequestError, SourceKind};
use crate::runner::CommandRunner;
use crate::runtime::RuntimeProbe;
use crate::source::{SourceError, SourceResolver};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

/// Top-level deployment error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("invalid request: {0}")]
    Request(#[from] RequestError),

    #[error("source invalid: {0}")]
    Source(#[from] SourceError),

    #[error("host bootstrap failed: {0}")]
    Bootstrap(#[from] BootstrapError),

    #[error("{0}")]
    Deployment(#[from] ExecError),

    #[error("{0}")]
    Ingress(#[from] IngressError),
}

impl DeployError {
    /// Stable kind name, reported alongside the non-zero exit status.
    pub fn kind(&self) -> &'static str {
        match self {
            DeployError::Request(_) => "invalid-request",
            DeployError::Source(_) => "source-invalid",
            DeployError::Bootstrap(_) => "bootstrap-failed",
            DeployError::Deployment(_) => "deployment-failed",
            DeployError::Ingress(IngressError::Invalid(_)) => "invalid-access-configuration",
            DeployError::Ingress(_) => "ingress-failed",
        }
    }

    /// Whether this failure was a transient budget running out, worth
    /// retrying later without changing the request.
    pub fn transient_exhausted(&self) -> bool {
        matches!(
            self,
            DeployError::Deployment(ExecError::TransientExhausted { .. })
        )
    }
}

/// Final state of a deployment that did not fail outright.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum DeployStatus {
    /// Everything the request asked for is in place.
    Deployed,
    /// Running and reachable, but part of the intent is unmet.
    Degraded { reason: String },
}

/// Outcome of a successful (possibly degraded) deployment.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentResult {
    pub status: DeployStatus,
    pub service_name: String,
    pub service_key: String,
    pub source_kind: SourceKind,
    /// Effective compose file the deployment ran from.
    pub compose_path: PathBuf,
    /// Compose services running in the isolation scope after apply.
    pub running_services: Vec<String>,
    /// Managed artifacts written during this run.
    pub generated_paths: Vec<PathBuf>,
    /// Ingress reconciliation outcome, when a proxy was planned.
    pub ingress: Option<IngressSummary>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Sequences deployment stages against one host.
pub struct Deployer<'a> {
    runner: &'a dyn CommandRunner,
    probe: &'a dyn RuntimeProbe,
    paths: ManagedPaths,
}

impl<'a> Deployer<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        probe: &'a dyn RuntimeProbe,
        paths: ManagedPaths,
    ) -> Self {
        Self {
            runner,
            probe,
            paths,
        }
    }

    /// Run one deployment request to completion.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError`] with the failing stage's taxonomy kind.
    pub async fn deploy(&self, request: DeploymentRequest) -> Result<DeploymentResult, DeployError> {
        let started_at = Utc::now();
        let request = request.validated()?;
        let service_key = request.service_key();
        info!(
            service = %request.service_name,
            key = %service_key,
            access = %request.access_mode,
            ingress = %request.ingress_mode,
            "starting deployment"
        );

        // The request's base dir wins over the constructed default; system
        // roots (daemon config, nginx dirs) stay as injected.
        let mut paths = self.paths.clone();
        paths.base_dir = request.base_dir.clone();

        let resolver = SourceResolver::new(paths.clone());
        let resolved = resolver.resolve(&request)?;

        // Ingress intent is validated before the host is mutated.
        let plan = ingress::plan(&request, &resolved)?;

        let requirements = host_requirements(&request, plan.as_ref());
        let bootstrapper = HostBootstrapper::new(self.runner, self.probe, &paths);
        bootstrapper.run(&requirements).await?;

        let executor =
            DeploymentExecutor::new(self.runner, self.probe, RetryPolicy::from_request(&request));
        let already_running = executor.running_services(&service_key).await?;
        if already_running.is_empty() {
            probe_free_ports(&required_port_bindings(&request, plan.as_ref()))
                .map_err(DeployError::Deployment)?;
        } else {
            info!(
                "scope '{service_key}' already has {} running service(s); converging in place",
                already_running.len()
            );
        }
        executor.apply(&resolved, &service_key).await?;

        let ingress_summary = match &plan {
            Some(plan) => {
                let configurator = ProxyConfigurator::new(self.runner, &paths);
                Some(configurator.apply(plan, &service_key).await?)
            }
            None => None,
        };

        let running_services = executor.running_services(&service_key).await?;

        let status = match ingress_summary
            .as_ref()
            .and_then(|s| s.certificate_error.as_ref())
        {
            Some(cert_error) => DeployStatus::Degraded {
                reason: format!("certificate issuance failed: {cert_error}"),
            },
            None => DeployStatus::Deployed,
        };

        let mut generated_paths = Vec::new();
        if resolved.generated {
            generated_paths.push(resolved.compose_path.clone());
        }
        if let Some(summary) = &ingress_summary {
            generated_paths.extend(summary.written_paths.iter().cloned());
        }

        info!(service = %request.service_name, status = ?status, "deployment finished");

        Ok(DeploymentResult {
            status,
            service_name: request.service_name.clone(),
            service_key,
            source_kind: resolved.kind,
            compose_path: resolved.compose_path.clone(),
            running_services,
            generated_paths,
            ingress: ingress_summary,
            started_at,
            finished_at: Utc::now(),
        })
    }
}

/// What this particular deployment needs from the host.
fn host_requirements(request: &DeploymentRequest, plan: Option<&IngressPlan>) -> HostRequirements {
    HostRequirements {
        tune_daemon: request.tune_docker_daemon,
        tailscale: request.access_mode == AccessMode::Tailscale,
        host_proxy: plan.is_some_and(|p| p.mode != IngressMode::Managed),
        managed_proxy: plan.is_some_and(|p| p.mode == IngressMode::Managed),
    }
}

/// Host ports this deployment will publish, checked before the first apply.
fn required_port_bindings(
    request: &DeploymentRequest,
    plan: Option<&IngressPlan>,
) -> Vec<(String, u16)> {
    let mut bindings = Vec::new();
    if let Some(host_port) = request.host_port {
        bindings.push((request.effective_bind_host().to_string(), host_port));
    }
    if let Some(plan) = plan {
        // Host-nginx modes reuse the ports the host proxy already owns.
        if plan.mode == IngressMode::Managed {
            bindings.push((plan.bind_host.clone(), plan.http_port));
            if let Some(https_port) = plan.https_port {
                bindings.push((plan.bind_host.clone(), https_port));
            }
        }
    }
    bindings
}
