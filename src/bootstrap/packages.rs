//! Package and client installation steps.
//!
//! Each function is check-then-act: a capability that is already present is
//! verified and left alone, never reinstalled or downgraded.

use crate::bootstrap::{BootstrapError, HostState};
use crate::runner::{CommandOutput, CommandRunner, HostCommand};
use tracing::{debug, info};

fn apt_install(packages: &[&str]) -> HostCommand {
    let mut args = vec!["install".to_string(), "-y".to_string()];
    args.extend(packages.iter().map(|p| p.to_string()));
    HostCommand::new("apt-get", args).with_env("DEBIAN_FRONTEND", "noninteractive")
}

fn require_success(step: &str, output: &CommandOutput) -> Result<(), BootstrapError> {
    if output.success() {
        Ok(())
    } else {
        Err(BootstrapError::step(step, &output.combined()))
    }
}

/// Base packages the installers below depend on.
pub async fn ensure_base_packages(runner: &dyn CommandRunner) -> Result<(), BootstrapError> {
    let update = runner
        .run(HostCommand::new("apt-get", ["update", "-y"]).with_env("DEBIAN_FRONTEND", "noninteractive"))
        .await?;
    require_success("base packages", &update)?;

    let install = runner
        .run(apt_install(&["ca-certificates", "curl", "gnupg"]))
        .await?;
    require_success("base packages", &install)
}

/// Install the container runtime when missing or without the compose plugin.
pub async fn ensure_docker(
    runner: &dyn CommandRunner,
    state: &HostState,
) -> Result<(), BootstrapError> {
    if state.docker_present {
        let compose = runner
            .run(HostCommand::new("docker", ["compose", "version"]))
            .await?;
        if compose.success() {
            debug!("docker with compose plugin already installed");
            return Ok(());
        }
    }

    info!("installing docker via vendor convenience script");
    let install = runner
        .run(HostCommand::new(
            "sh",
            ["-c", "curl -fsSL https://get.docker.com | sh"],
        ))
        .await?;
    require_success("install docker", &install)?;

    let enable = runner
        .run(HostCommand::new("systemctl", ["enable", "--now", "docker"]))
        .await?;
    require_success("install docker", &enable)
}

/// Install and join the tailnet client; a joined node is a no-op.
pub async fn ensure_tailscale(
    runner: &dyn CommandRunner,
    state: &HostState,
) -> Result<(), BootstrapError> {
    if !state.tailscale_present {
        info!("installing tailscale");
        let install = runner
            .run(HostCommand::new(
                "sh",
                ["-c", "curl -fsSL https://tailscale.com/install.sh | sh"],
            ))
            .await?;
        require_success("install tailscale", &install)?;
    }

    let status = runner
        .run(HostCommand::new("tailscale", ["status"]))
        .await?;
    let needs_join = !status.success()
        || status.combined().contains("Logged out")
        || status.combined().contains("Stopped");
    if !needs_join {
        debug!("tailscale already joined");
        return Ok(());
    }

    info!("joining tailnet");
    let up = runner.run(HostCommand::new("tailscale", ["up"])).await?;
    require_success("tailscale up", &up)
}

/// Install host nginx + certbot for external-nginx/takeover ingress.
pub async fn ensure_host_proxy_packages(
    runner: &dyn CommandRunner,
    state: &HostState,
) -> Result<(), BootstrapError> {
    if state.nginx_present && state.certbot_present {
        debug!("host nginx and certbot already installed");
        return Ok(());
    }
    info!("installing nginx and certbot");
    let install = runner.run(apt_install(&["nginx", "certbot"])).await?;
    require_success("install nginx/certbot", &install)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::ScriptedRunner;

    #[tokio::test]
    async fn test_docker_present_with_compose_is_noop() {
        let runner = ScriptedRunner::new();
        let state = HostState {
            docker_present: true,
            ..HostState::default()
        };

        ensure_docker(&runner, &state).await.unwrap();
        assert!(runner.calls_matching("get.docker.com").is_empty());
    }

    #[tokio::test]
    async fn test_docker_missing_triggers_install() {
        let runner = ScriptedRunner::new();
        let state = HostState::default();

        ensure_docker(&runner, &state).await.unwrap();
        assert_eq!(runner.calls_matching("get.docker.com").len(), 1);
        assert_eq!(runner.calls_matching("systemctl enable --now docker").len(), 1);
    }

    #[tokio::test]
    async fn test_docker_without_compose_plugin_reinstalls() {
        let runner = ScriptedRunner::new().respond(
            "docker compose version",
            CommandOutput::failed(1, "unknown command"),
        );
        let state = HostState {
            docker_present: true,
            ..HostState::default()
        };

        ensure_docker(&runner, &state).await.unwrap();
        assert_eq!(runner.calls_matching("get.docker.com").len(), 1);
    }

    #[tokio::test]
    async fn test_tailscale_joined_is_noop() {
        let runner = ScriptedRunner::new().respond(
            "tailscale status",
            CommandOutput {
                stdout: "100.x.y.z host linux -".to_string(),
                stderr: String::new(),
                exit_code: 0,
            },
        );
        let state = HostState {
            tailscale_present: true,
            ..HostState::default()
        };

        ensure_tailscale(&runner, &state).await.unwrap();
        assert!(runner.calls_matching("tailscale up").is_empty());
        assert!(runner.calls_matching("install.sh").is_empty());
    }

    #[tokio::test]
    async fn test_tailscale_logged_out_joins() {
        let runner = ScriptedRunner::new().respond(
            "tailscale status",
            CommandOutput {
                stdout: "Logged out.".to_string(),
                stderr: String::new(),
                exit_code: 1,
            },
        );
        let state = HostState {
            tailscale_present: true,
            ..HostState::default()
        };

        ensure_tailscale(&runner, &state).await.unwrap();
        assert_eq!(runner.calls_matching("tailscale up").len(), 1);
    }

    #[tokio::test]
    async fn test_host_proxy_packages_present_is_noop() {
        let runner = ScriptedRunner::new();
        let state = HostState {
            nginx_present: true,
            certbot_present: true,
            ..HostState::default()
        };

        ensure_host_proxy_packages(&runner, &state).await.unwrap();
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_base_package_failure_is_fatal() {
        let runner = ScriptedRunner::new()
            .respond("apt-get update", CommandOutput::failed(100, "mirror unreachable"));

        let result = ensure_base_packages(&runner).await;
        assert!(matches!(result, Err(BootstrapError::Step { .. })));
    }
}
