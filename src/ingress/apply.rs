//! Ingress plan application and reconciliation.
//!
//! Each ingress mode has its own reconciliation rule:
//!
//! - `managed` runs nginx (+ certbot) as containers in the deployment
//!   scope; the proxy is reloaded only when the rendered configuration
//!   differs from the previously applied file.
//! - `external-nginx` writes a site file and reloads the host proxy, never
//!   stopping it.
//! - `takeover` stops the host proxy, replaces its site configuration, and
//!   starts it again.
//!
//! Certificate issuance runs HTTP-01 against the proxy on port 80.
//! Issuance failure degrades the deployment instead of failing it: the
//! HTTP-only configuration stays applied and reachable.

use crate::ingress::{IngressError, IngressPlan, RenderTarget, render_proxy_compose, render_server_config};
use crate::paths::ManagedPaths;
use crate::request::IngressMode;
use crate::runner::{CommandOutput, CommandRunner, HostCommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// What ingress reconciliation ended up doing.
#[derive(Debug, Clone, Serialize)]
pub struct IngressSummary {
    /// Mode that was applied.
    pub mode: IngressMode,
    /// Applied route summaries (`host/path->upstream:port`).
    pub routes: Vec<String>,
    /// Whether TLS termination is active.
    pub tls_active: bool,
    /// Issuance failure, when TLS was requested but not achieved.
    pub certificate_error: Option<String>,
    /// Managed artifacts written during reconciliation.
    pub written_paths: Vec<PathBuf>,
    /// External HTTP port.
    pub http_port: u16,
    /// External HTTPS port, when TLS is planned.
    pub https_port: Option<u16>,
}

fn write_file(path: &Path, content: &str) -> Result<(), IngressError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

fn require_success(step: &str, output: &CommandOutput) -> Result<(), IngressError> {
    if output.success() {
        Ok(())
    } else {
        Err(IngressError::apply_step(step, &output.combined()))
    }
}

/// Applies [`IngressPlan`]s against the host and the managed proxy.
pub struct ProxyConfigurator<'a> {
    runner: &'a dyn CommandRunner,
    paths: &'a ManagedPaths,
}

impl<'a> ProxyConfigurator<'a> {
    pub fn new(runner: &'a dyn CommandRunner, paths: &'a ManagedPaths) -> Self {
        Self { runner, paths }
    }

    /// Apply a plan for a service.
    ///
    /// # Errors
    ///
    /// Returns [`IngressError`] when reconciliation itself fails.
    /// Certificate issuance failure is not an error: it is reported in the
    /// summary and leaves the HTTP-only configuration applied.
    pub async fn apply(
        &self,
        plan: &IngressPlan,
        service_key: &str,
    ) -> Result<IngressSummary, IngressError> {
        match plan.mode {
            IngressMode::Managed => self.apply_managed(plan, service_key).await,
            IngressMode::ExternalNginx => self.apply_host_site(plan, service_key, false).await,
            IngressMode::Takeover => self.apply_host_site(plan, service_key, true).await,
        }
    }

    async fn apply_managed(
        &self,
        plan: &IngressPlan,
        service_key: &str,
    ) -> Result<IngressSummary, IngressError> {
        let conf_path = self.paths.managed_nginx_conf_path(service_key);
        let overlay_path = self.paths.proxy_compose_path(service_key);
        std::fs::create_dir_all(self.paths.certbot_webroot_path(service_key))?;
        if plan.tls.is_some() {
            std::fs::create_dir_all(self.paths.certbot_state_path(service_key))?;
        }

        let mut summary = IngressSummary {
            mode: plan.mode,
            routes: plan.route_summaries(),
            tls_active: false,
            certificate_error: None,
            written_paths: vec![conf_path.clone(), overlay_path.clone()],
            http_port: plan.http_port,
            https_port: plan.https_port,
        };

        write_file(
            &overlay_path,
            &render_proxy_compose(plan, self.paths, service_key),
        )?;

        let cert_ready = plan.tls.as_ref().is_some_and(|tls| {
            self.paths
                .managed_cert_path(service_key, &tls.primary_domain)
                .exists()
        });

        let previous = std::fs::read_to_string(&conf_path).ok();
        let first_phase =
            render_server_config(plan, &RenderTarget::Managed, cert_ready);
        let changed = previous.as_deref() != Some(first_phase.as_str());
        write_file(&conf_path, &first_phase)?;

        let up = self
            .runner
            .run(self.compose_overlay_command(service_key, &overlay_path, &["up", "-d"]))
            .await?;
        require_success("managed proxy up", &up)?;
        if changed {
            info!("managed proxy configuration changed; reloading");
            self.reload_managed(service_key, &overlay_path).await?;
        }

        if cert_ready {
            // Certificates exist from a previous run; renewal belongs to the
            // printed renew command, not the deploy path.
            summary.tls_active = true;
            return Ok(summary);
        }

        let Some(tls) = &plan.tls else {
            return Ok(summary);
        };

        match self.issue_managed_certificates(plan, service_key, &overlay_path).await {
            Ok(()) => {
                let tls_conf = render_server_config(plan, &RenderTarget::Managed, true);
                write_file(&conf_path, &tls_conf)?;
                self.reload_managed(service_key, &overlay_path).await?;
                summary.tls_active = true;
                info!("TLS active for {}", tls.primary_domain);
            }
            Err(e) => {
                warn!("certificate issuance failed, staying on HTTP: {e}");
                summary.certificate_error = Some(e.to_string());
            }
        }

        Ok(summary)
    }

    fn compose_overlay_command(
        &self,
        service_key: &str,
        overlay_path: &Path,
        tail: &[&str],
    ) -> HostCommand {
        let mut args: Vec<String> = vec![
            "compose".to_string(),
            "-p".to_string(),
            service_key.to_string(),
            "-f".to_string(),
            overlay_path.display().to_string(),
        ];
        args.extend(tail.iter().map(|s| s.to_string()));
        HostCommand::new("docker", args)
            .with_working_dir(self.paths.service_dir(service_key))
    }

    async fn reload_managed(
        &self,
        service_key: &str,
        overlay_path: &Path,
    ) -> Result<(), IngressError> {
        let reload = self
            .runner
            .run(self.compose_overlay_command(
                service_key,
                overlay_path,
                &["exec", "-T", "ingress", "nginx", "-s", "reload"],
            ))
            .await?;
        require_success("managed proxy reload", &reload)
    }

    async fn issue_managed_certificates(
        &self,
        plan: &IngressPlan,
        service_key: &str,
        overlay_path: &Path,
    ) -> Result<(), IngressError> {
        let tls = plan.tls.as_ref().expect("issuance requires a tls plan");

        let mut tail: Vec<String> = [
            "run", "--rm", "certbot", "certonly", "--webroot", "-w", "/var/www/certbot",
            "--non-interactive", "--agree-tos", "--no-eff-email", "--keep-until-expiring",
            "-m",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        tail.push(tls.contact_email.clone());
        for domain in &tls.domains {
            tail.push("-d".to_string());
            tail.push(domain.clone());
        }
        let tail_refs: Vec<&str> = tail.iter().map(String::as_str).collect();

        let output = self
            .runner
            .run(self.compose_overlay_command(service_key, overlay_path, &tail_refs))
            .await?;
        if output.success() {
            Ok(())
        } else {
            Err(IngressError::Certificate(output.combined().trim().to_string()))
        }
    }

    async fn apply_host_site(
        &self,
        plan: &IngressPlan,
        service_key: &str,
        takeover: bool,
    ) -> Result<IngressSummary, IngressError> {
        let site_path = self.paths.host_site_available_path(service_key);
        let enabled_path = self.paths.host_site_enabled_path(service_key);
        let webroot = self.paths.host_certbot_webroot_path(service_key);
        std::fs::create_dir_all(&webroot)?;

        let mut summary = IngressSummary {
            mode: plan.mode,
            routes: plan.route_summaries(),
            tls_active: false,
            certificate_error: None,
            written_paths: vec![site_path.clone()],
            http_port: 80,
            https_port: plan.tls.as_ref().map(|_| 443),
        };

        let cert_ready = plan
            .tls
            .as_ref()
            .is_some_and(|tls| self.paths.host_cert_path(&tls.primary_domain).exists());

        if takeover {
            let stop = self
                .runner
                .run(HostCommand::new("systemctl", ["stop", "nginx"]))
                .await?;
            require_success("stop host nginx", &stop)?;
        }

        let target = RenderTarget::HostSite {
            webroot: webroot.clone(),
        };
        let config = render_server_config(plan, &target, cert_ready);
        write_file(&site_path, &config)?;
        self.ensure_site_enabled(&site_path, &enabled_path)?;
        self.check_host_nginx_config().await?;

        if takeover {
            let start = self
                .runner
                .run(HostCommand::new("systemctl", ["start", "nginx"]))
                .await?;
            require_success("start host nginx", &start)?;
        } else {
            let reload = self
                .runner
                .run(HostCommand::new("systemctl", ["reload", "nginx"]))
                .await?;
            require_success("reload host nginx", &reload)?;
        }

        if cert_ready {
            summary.tls_active = true;
            return Ok(summary);
        }
        let Some(tls) = &plan.tls else {
            return Ok(summary);
        };

        match self.issue_host_certificates(&webroot, tls).await {
            Ok(()) => {
                let tls_conf = render_server_config(plan, &target, true);
                write_file(&site_path, &tls_conf)?;
                self.check_host_nginx_config().await?;
                let reload = self
                    .runner
                    .run(HostCommand::new("systemctl", ["reload", "nginx"]))
                    .await?;
                require_success("reload host nginx", &reload)?;
                summary.tls_active = true;
                info!("TLS active for {}", tls.primary_domain);
            }
            Err(e) => {
                warn!("certificate issuance failed, staying on HTTP: {e}");
                summary.certificate_error = Some(e.to_string());
            }
        }

        Ok(summary)
    }

    fn ensure_site_enabled(
        &self,
        site_path: &Path,
        enabled_path: &Path,
    ) -> Result<(), IngressError> {
        if let Some(parent) = enabled_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if enabled_path.exists() {
            return Ok(());
        }
        std::os::unix::fs::symlink(site_path, enabled_path)?;
        Ok(())
    }

    async fn check_host_nginx_config(&self) -> Result<(), IngressError> {
        let check = self.runner.run(HostCommand::new("nginx", ["-t"])).await?;
        require_success("nginx -t", &check)
    }

    async fn issue_host_certificates(
        &self,
        webroot: &Path,
        tls: &crate::ingress::TlsConfig,
    ) -> Result<(), IngressError> {
        let mut args: Vec<String> = vec![
            "certonly".to_string(),
            "--webroot".to_string(),
            "-w".to_string(),
            webroot.display().to_string(),
            "--non-interactive".to_string(),
            "--agree-tos".to_string(),
            "--no-eff-email".to_string(),
            "--keep-until-expiring".to_string(),
            "-m".to_string(),
            tls.contact_email.clone(),
        ];
        for domain in &tls.domains {
            args.push("-d".to_string());
            args.push(domain.clone());
        }

        let output = self.runner.run(HostCommand::new("certbot", args)).await?;
        if output.success() {
            Ok(())
        } else {
            Err(IngressError::Certificate(output.combined().trim().to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingress::TlsConfig;
    use crate::request::ProxyRoute;
    use crate::runner::testing::ScriptedRunner;

    fn test_paths(dir: &tempfile::TempDir) -> ManagedPaths {
        let mut paths = ManagedPaths::with_base_dir(dir.path().join("services"));
        paths.docker_config_dir = dir.path().join("docker");
        paths.nginx_config_dir = dir.path().join("nginx");
        paths.letsencrypt_dir = dir.path().join("letsencrypt");
        paths
    }

    fn managed_plan(tls: bool) -> IngressPlan {
        IngressPlan {
            mode: IngressMode::Managed,
            routes: vec![ProxyRoute::new(
                if tls { "api.example.com" } else { "_" },
                "web",
                8080,
            )],
            tls: tls.then(|| TlsConfig {
                primary_domain: "api.example.com".to_string(),
                contact_email: "ops@example.com".to_string(),
                domains: vec!["api.example.com".to_string()],
            }),
            auth_token: None,
            http_port: 80,
            https_port: tls.then_some(443),
            bind_host: if tls { "0.0.0.0" } else { "127.0.0.1" }.to_string(),
        }
    }

    #[tokio::test]
    async fn test_managed_apply_writes_and_starts() {
        let dir = tempfile::tempdir().unwrap();
        let paths = test_paths(&dir);
        let runner = ScriptedRunner::new();
        let configurator = ProxyConfigurator::new(&runner, &paths);

        let summary = configurator.apply(&managed_plan(false), "app").await.unwrap();

        assert!(paths.managed_nginx_conf_path("app").exists());
        assert!(paths.proxy_compose_path("app").exists());
        assert!(!summary.tls_active);
        assert_eq!(runner.calls_matching("up -d").len(), 1);
        assert_eq!(runner.calls_matching("nginx -s reload").len(), 1);
    }

    #[tokio::test]
    async fn test_managed_apply_skips_reload_when_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let paths = test_paths(&dir);
        let runner = ScriptedRunner::new();
        let configurator = ProxyConfigurator::new(&runner, &paths);

        configurator.apply(&managed_plan(false), "app").await.unwrap();
        configurator.apply(&managed_plan(false), "app").await.unwrap();

        // up -d runs each time (idempotent), the reload only on change.
        assert_eq!(runner.calls_matching("up -d").len(), 2);
        assert_eq!(runner.calls_matching("nginx -s reload").len(), 1);
    }

    #[tokio::test]
    async fn test_managed_tls_issues_and_activates() {
        let dir = tempfile::tempdir().unwrap();
        let paths = test_paths(&dir);
        let runner = ScriptedRunner::new();
        let configurator = ProxyConfigurator::new(&runner, &paths);

        let summary = configurator.apply(&managed_plan(true), "app").await.unwrap();

        assert!(summary.tls_active);
        assert!(summary.certificate_error.is_none());
        assert_eq!(runner.calls_matching("certonly").len(), 1);
        let conf = std::fs::read_to_string(paths.managed_nginx_conf_path("app")).unwrap();
        assert!(conf.contains("listen 443 ssl;"));
    }

    #[tokio::test]
    async fn test_managed_cert_failure_degrades_to_http() {
        let dir = tempfile::tempdir().unwrap();
        let paths = test_paths(&dir);
        let runner = ScriptedRunner::new().respond(
            "certonly",
            CommandOutput::failed(1, "Challenge failed for domain api.example.com"),
        );
        let configurator = ProxyConfigurator::new(&runner, &paths);

        let summary = configurator.apply(&managed_plan(true), "app").await.unwrap();

        assert!(!summary.tls_active);
        assert!(summary.certificate_error.as_ref().unwrap().contains("Challenge failed"));
        let conf = std::fs::read_to_string(paths.managed_nginx_conf_path("app")).unwrap();
        assert!(!conf.contains("listen 443"));
        assert!(conf.contains("proxy_pass http://web:8080;"));
    }

    #[tokio::test]
    async fn test_managed_existing_cert_skips_issuance() {
        let dir = tempfile::tempdir().unwrap();
        let paths = test_paths(&dir);
        let cert = paths.managed_cert_path("app", "api.example.com");
        std::fs::create_dir_all(cert.parent().unwrap()).unwrap();
        std::fs::write(&cert, "cert\n").unwrap();

        let runner = ScriptedRunner::new();
        let configurator = ProxyConfigurator::new(&runner, &paths);
        let summary = configurator.apply(&managed_plan(true), "app").await.unwrap();

        assert!(summary.tls_active);
        assert!(runner.calls_matching("certonly").is_empty());
    }

    fn host_plan(mode: IngressMode) -> IngressPlan {
        IngressPlan {
            mode,
            routes: vec![ProxyRoute::new("api.example.com", "127.0.0.1", 18080)],
            tls: Some(TlsConfig {
                primary_domain: "api.example.com".to_string(),
                contact_email: "ops@example.com".to_string(),
                domains: vec!["api.example.com".to_string()],
            }),
            auth_token: None,
            http_port: 80,
            https_port: Some(443),
            bind_host: "0.0.0.0".to_string(),
        }
    }

    #[tokio::test]
    async fn test_external_nginx_reloads_never_stops() {
        let dir = tempfile::tempdir().unwrap();
        let paths = test_paths(&dir);
        let runner = ScriptedRunner::new();
        let configurator = ProxyConfigurator::new(&runner, &paths);

        let summary = configurator
            .apply(&host_plan(IngressMode::ExternalNginx), "app")
            .await
            .unwrap();

        assert!(summary.tls_active);
        assert!(paths.host_site_available_path("app").exists());
        assert!(paths.host_site_enabled_path("app").exists());
        assert!(runner.calls_matching("systemctl stop nginx").is_empty());
        assert!(!runner.calls_matching("systemctl reload nginx").is_empty());
        assert_eq!(runner.calls_matching("nginx -t").len(), 2);
    }

    #[tokio::test]
    async fn test_takeover_stops_and_starts() {
        let dir = tempfile::tempdir().unwrap();
        let paths = test_paths(&dir);
        let runner = ScriptedRunner::new();
        let configurator = ProxyConfigurator::new(&runner, &paths);

        configurator
            .apply(&host_plan(IngressMode::Takeover), "app")
            .await
            .unwrap();

        let calls = runner.calls();
        let stop = calls
            .iter()
            .position(|c| c == "systemctl stop nginx")
            .unwrap();
        let start = calls
            .iter()
            .position(|c| c == "systemctl start nginx")
            .unwrap();
        assert!(stop < start);
    }

    #[tokio::test]
    async fn test_host_nginx_config_check_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let paths = test_paths(&dir);
        let runner = ScriptedRunner::new()
            .respond("nginx -t", CommandOutput::failed(1, "unexpected token"));
        let configurator = ProxyConfigurator::new(&runner, &paths);

        let result = configurator
            .apply(&host_plan(IngressMode::ExternalNginx), "app")
            .await;
        assert!(matches!(result, Err(IngressError::Apply { .. })));
    }
}
