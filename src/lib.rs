//! # Shipyard
//!
//! Single-host Docker service deployment: point it at a directory holding a
//! compose file or a bare Dockerfile, describe how the service should be
//! reachable, and it converges the host to a running deployment: container
//! runtime installed and tuned, firewall egress open, service applied under
//! an isolation scope, and a reverse proxy (none, managed containers, or
//! host nginx) reconciled to the declared routes.
//!
//! ## Architecture Overview
//!
//! Deployment flows through one pipeline, each stage owned by a module:
//!
//! - **[`request`]**: the immutable [`DeploymentRequest`] and its validation
//! - **[`source`]**: source classification and compose normalization
//! - **[`bootstrap`]**: idempotent host preparation (check-then-act steps)
//! - **[`execute`]**: compose project apply with transient-failure retry
//! - **[`ingress`]**: proxy planning, nginx rendering, reconciliation
//! - **[`orchestrator`]**: stage sequencing and the final status
//!
//! Host interaction goes through two seams, [`runner`] for subprocesses
//! and [`runtime`] for the Docker API, so the whole flow is testable with
//! scripted doubles.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use shipyard::{Deployer, DeploymentRequest, HostRunner, DockerRuntime, ManagedPaths};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runner = HostRunner::new();
//!     let runtime = DockerRuntime::new();
//!     let deployer = Deployer::new(&runner, &runtime, ManagedPaths::default());
//!
//!     let request = DeploymentRequest::new("my-api", "/srv/my-api");
//!     let result = deployer.deploy(request).await?;
//!     println!("deployed: {:?}", result.status);
//!     Ok(())
//! }
//! ```

/// Deployment request model and structural validation.
pub mod request;

/// Managed filesystem locations, keyed by service name.
pub mod paths;

/// Host command execution seam.
pub mod runner;

/// Container runtime control plane (bollard).
pub mod runtime;

/// Source directory resolution and compose introspection.
pub mod source;

/// Idempotent host preparation.
pub mod bootstrap;

/// Compose project apply with bounded retry.
pub mod execute;

/// Ingress planning, rendering, and reconciliation.
pub mod ingress;

/// Stage sequencing and deployment results.
pub mod orchestrator;

/// Batch command-line interface.
pub mod cli;

// Re-export the request model
pub use request::{
    AccessMode, DeploymentRequest, IngressMode, ProxyRoute, RequestError, SourceKind,
};

// Re-export the pipeline stages
pub use bootstrap::{BootstrapError, HostBootstrapper, HostRequirements, HostState};
pub use execute::{DeploymentExecutor, ExecError, FailureKind, RetryPolicy};
pub use ingress::{IngressError, IngressPlan, IngressSummary, ProxyConfigurator};
pub use orchestrator::{DeployError, DeployStatus, Deployer, DeploymentResult};
pub use source::{ResolvedSource, SourceError, SourceResolver};

// Re-export the host seams
pub use paths::ManagedPaths;
pub use runner::{CommandOutput, CommandRunner, HostCommand, HostRunner, RunnerError};
pub use runtime::{DockerRuntime, RuntimeError, RuntimeProbe};
