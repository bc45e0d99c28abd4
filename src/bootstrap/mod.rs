//! Host preparation.
//!
//! Brings the host to a state sufficient to run a deployment and its
//! ingress mode. Every step observes before it writes, and the whole stage
//! is monotonic: rerunning never removes a capability a previous run
//! established, it only adds or repairs one. Any step failure aborts the
//! deployment before execution; a half-bootstrapped host must not proceed.

mod daemon;
mod firewall;
mod packages;

pub use daemon::{
    FALLBACK_DNS, MAX_CONCURRENT_TRANSFERS, ensure_daemon_tuning, merged_daemon_config,
    read_daemon_config,
};
pub use firewall::{EGRESS_RULES, EgressRule, ensure_egress_rules};
pub use packages::{
    ensure_base_packages, ensure_docker, ensure_host_proxy_packages, ensure_tailscale,
};

use crate::paths::ManagedPaths;
use crate::runner::{CommandRunner, RunnerError};
use crate::runtime::{RuntimeError, RuntimeProbe};
use tracing::info;

/// Bootstrap failures. Fatal: execution must not start on a host where a
/// precondition step failed.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("bootstrap step '{step}' failed: {reason}")]
    Step { step: String, reason: String },

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("bootstrap I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

impl BootstrapError {
    pub(crate) fn step(step: &str, reason: &str) -> Self {
        Self::Step {
            step: step.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Capabilities observed on the host before bootstrap mutates anything.
#[derive(Debug, Clone, Default)]
pub struct HostState {
    pub docker_present: bool,
    pub nginx_present: bool,
    pub certbot_present: bool,
    pub tailscale_present: bool,
    pub iptables_present: bool,
}

impl HostState {
    /// Probe the host for the binaries the bootstrap steps care about.
    pub fn observe() -> Self {
        Self {
            docker_present: which::which("docker").is_ok(),
            nginx_present: which::which("nginx").is_ok(),
            certbot_present: which::which("certbot").is_ok(),
            tailscale_present: which::which("tailscale").is_ok(),
            iptables_present: which::which("iptables").is_ok(),
        }
    }
}

/// What a specific deployment needs from the host.
#[derive(Debug, Clone, Default)]
pub struct HostRequirements {
    /// Merge registry-hardening settings into the daemon configuration.
    pub tune_daemon: bool,
    /// Ensure the tailnet client is installed and joined.
    pub tailscale: bool,
    /// Ensure host nginx + certbot packages (external-nginx/takeover).
    pub host_proxy: bool,
    /// Pre-pull the managed proxy images (managed ingress).
    pub managed_proxy: bool,
}

/// Runs the bootstrap steps in order against one host.
pub struct HostBootstrapper<'a> {
    runner: &'a dyn CommandRunner,
    probe: &'a dyn RuntimeProbe,
    paths: &'a ManagedPaths,
}

impl<'a> HostBootstrapper<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        probe: &'a dyn RuntimeProbe,
        paths: &'a ManagedPaths,
    ) -> Self {
        Self {
            runner,
            probe,
            paths,
        }
    }

    /// Bring the host to a state sufficient for the requested deployment.
    ///
    /// Returns the host state observed before any mutation.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError`] on the first failing step.
    pub async fn run(&self, requirements: &HostRequirements) -> Result<HostState, BootstrapError> {
        let state = HostState::observe();

        info!("bootstrap: base packages");
        ensure_base_packages(self.runner).await?;

        info!("bootstrap: container runtime");
        ensure_docker(self.runner, &state).await?;
        self.probe.ping().await?;

        if requirements.tune_daemon {
            info!("bootstrap: daemon network tuning");
            ensure_daemon_tuning(self.runner, self.paths).await?;
        }

        info!("bootstrap: firewall egress rules");
        ensure_egress_rules(self.runner, &state).await?;

        if requirements.tailscale {
            info!("bootstrap: tailscale");
            ensure_tailscale(self.runner, &state).await?;
        }

        if requirements.host_proxy {
            info!("bootstrap: host proxy packages");
            ensure_host_proxy_packages(self.runner, &state).await?;
        }

        if requirements.managed_proxy {
            info!("bootstrap: managed proxy images");
            self.probe
                .ensure_image(crate::ingress::NGINX_PROXY_IMAGE)
                .await?;
            self.probe
                .ensure_image(crate::ingress::CERTBOT_IMAGE)
                .await?;
        }

        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::ScriptedRunner;
    use crate::runtime::testing::StaticProbe;

    fn paths(dir: &tempfile::TempDir) -> ManagedPaths {
        let mut paths = ManagedPaths::with_base_dir(dir.path());
        paths.docker_config_dir = dir.path().join("docker");
        paths.nginx_config_dir = dir.path().join("nginx");
        paths
    }

    #[tokio::test]
    async fn test_run_orders_required_steps() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths(&dir);
        let runner = ScriptedRunner::new();
        let probe = StaticProbe::new();

        let bootstrapper = HostBootstrapper::new(&runner, &probe, &paths);
        bootstrapper
            .run(&HostRequirements {
                tune_daemon: true,
                tailscale: true,
                host_proxy: false,
                managed_proxy: true,
            })
            .await
            .unwrap();

        let calls = runner.calls();
        let apt_idx = calls.iter().position(|c| c.contains("apt-get update")).unwrap();
        let tuning_idx = calls
            .iter()
            .position(|c| c.contains("systemctl restart docker"))
            .unwrap();
        let tailscale_idx = calls
            .iter()
            .position(|c| c.contains("tailscale status"))
            .unwrap();
        assert!(apt_idx < tuning_idx);
        assert!(tuning_idx < tailscale_idx);
        assert!(paths.daemon_config_path().exists());
        assert_eq!(
            probe.ensured_images(),
            vec![
                crate::ingress::NGINX_PROXY_IMAGE.to_string(),
                crate::ingress::CERTBOT_IMAGE.to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_daemon_tuning_skipped_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths(&dir);
        let runner = ScriptedRunner::new();
        let probe = StaticProbe::new();

        let bootstrapper = HostBootstrapper::new(&runner, &probe, &paths);
        bootstrapper
            .run(&HostRequirements::default())
            .await
            .unwrap();

        assert!(!paths.daemon_config_path().exists());
        assert!(runner.calls_matching("systemctl restart docker").is_empty());
    }
}
