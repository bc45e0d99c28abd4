//! Deployment execution against the container runtime.
//!
//! Applies a resolved source's selected services under the service-name
//! isolation scope with `docker compose -p <key> … up -d --build`. The
//! project key guarantees convergence: rerunning the same request updates
//! resources in place instead of duplicating them. Transient registry and
//! network failures are retried with bounded linear backoff; everything
//! else aborts immediately.

mod classify;

pub use classify::{FailureKind, classify_failure};

use crate::request::DeploymentRequest;
use crate::runner::{CommandRunner, HostCommand, RunnerError};
use crate::runtime::{RuntimeError, RuntimeProbe};
use crate::source::ResolvedSource;
use std::net::TcpListener;
use std::time::Duration;
use tracing::{info, warn};

/// Execution failures.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// Retries for a transient failure ran out.
    #[error("deployment failed after {attempts} attempts; last transient error: {last_error}")]
    TransientExhausted { attempts: u32, last_error: String },

    /// A failure retrying cannot fix.
    #[error("deployment failed: {0}")]
    Fatal(String),

    /// A required host port is bound outside this isolation scope.
    #[error("host port {bind_host}:{port} is already in use: {reason}")]
    PortConflict {
        bind_host: String,
        port: u16,
        reason: String,
    },

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl ExecError {
    /// Whether this failure exhausted the transient-retry budget (as
    /// opposed to failing fatally on first classification).
    pub fn transient_exhausted(&self) -> bool {
        matches!(self, ExecError::TransientExhausted { .. })
    }
}

/// Retry budget for transient registry/network failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total tries = retries + 1.
    pub max_retries: u32,
    /// Base backoff; attempt n waits n times this before the next try.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_request(request: &DeploymentRequest) -> Self {
        Self {
            max_retries: request.registry_retries,
            backoff: Duration::from_secs(request.retry_backoff_seconds),
        }
    }

    /// Linear backoff before the attempt following failed attempt `n`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff * attempt
    }
}

/// Applies resolved sources to the runtime under an isolation scope.
pub struct DeploymentExecutor<'a> {
    runner: &'a dyn CommandRunner,
    probe: &'a dyn RuntimeProbe,
    policy: RetryPolicy,
}

impl<'a> DeploymentExecutor<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        probe: &'a dyn RuntimeProbe,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            runner,
            probe,
            policy,
        }
    }

    /// The project-apply command for a resolved source.
    fn compose_up_command(resolved: &ResolvedSource, service_key: &str) -> HostCommand {
        let mut args: Vec<String> = vec![
            "compose".to_string(),
            "-p".to_string(),
            service_key.to_string(),
            "-f".to_string(),
            resolved.compose_path.display().to_string(),
            "up".to_string(),
            "-d".to_string(),
            "--build".to_string(),
        ];
        // A proper subset is named explicitly; a full selection means the
        // compose default (everything) and stays implicit.
        if !resolved.selected.is_empty() && resolved.selected.len() != resolved.services.len() {
            args.extend(resolved.selected.iter().cloned());
        }
        HostCommand::new("docker", args).with_working_dir(&resolved.compose_dir)
    }

    /// Bring the selected services to the running state, retrying transient
    /// failures up to the policy budget.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::TransientExhausted`] when retries run out, or
    /// [`ExecError::Fatal`] immediately on a non-retryable failure.
    pub async fn apply(
        &self,
        resolved: &ResolvedSource,
        service_key: &str,
    ) -> Result<(), ExecError> {
        let command = Self::compose_up_command(resolved, service_key);
        let mut attempt: u32 = 1;

        loop {
            info!(attempt, "applying compose project '{service_key}'");
            let output = self.runner.run(command.clone()).await?;
            if output.success() {
                info!("compose project '{service_key}' is up");
                return Ok(());
            }

            let diagnostics = output.combined();
            let last_error = diagnostics.trim().to_string();
            match classify_failure(&diagnostics) {
                FailureKind::Fatal => return Err(ExecError::Fatal(last_error)),
                FailureKind::Transient => {
                    if attempt > self.policy.max_retries {
                        return Err(ExecError::TransientExhausted {
                            attempts: attempt,
                            last_error,
                        });
                    }
                    let delay = self.policy.delay_after(attempt);
                    warn!(
                        attempt,
                        "transient failure applying '{service_key}', retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Compose services currently running inside the isolation scope.
    pub async fn running_services(&self, service_key: &str) -> Result<Vec<String>, ExecError> {
        Ok(self.probe.running_services(service_key).await?)
    }
}

/// Verify each `(bind_host, port)` pair can still be bound.
///
/// Called only when the isolation scope has nothing running yet; on a
/// convergent rerun the scope's own containers legitimately hold these
/// ports.
///
/// # Errors
///
/// Returns [`ExecError::PortConflict`] for the first unbindable port.
pub fn probe_free_ports(bindings: &[(String, u16)]) -> Result<(), ExecError> {
    for (bind_host, port) in bindings {
        match TcpListener::bind((bind_host.as_str(), *port)) {
            Ok(listener) => drop(listener),
            Err(e) => {
                return Err(ExecError::PortConflict {
                    bind_host: bind_host.clone(),
                    port: *port,
                    reason: e.to_string(),
                });
            }
        }
    }
    Ok(())
}
