//! Human-readable deployment summary.

use crate::orchestrator::{DeployStatus, DeploymentResult};
use crate::request::{DeploymentRequest, IngressMode, SourceKind};
use shell_escape::escape;
use std::borrow::Cow;
use std::path::Path;

fn sh(value: &str) -> String {
    escape(Cow::Borrowed(value)).to_string()
}

fn sh_path(path: &Path) -> String {
    sh(&path.display().to_string())
}

/// Print the post-deployment summary and follow-up commands.
pub fn print_summary(request: &DeploymentRequest, result: &DeploymentResult) {
    println!();
    println!("+----------------------------------------------------+");
    match result.status {
        DeployStatus::Deployed => {
            println!("| Deployment complete                                |");
        }
        DeployStatus::Degraded { .. } => {
            println!("| Deployment complete (degraded)                     |");
        }
    }
    println!("+----------------------------------------------------+");
    println!();
    println!("Service name : {}", result.service_name);
    println!("Source dir   : {}", request.source_dir.display());
    println!("Source kind  : {}", result.source_kind);
    println!("Access mode  : {}", request.access_mode);
    println!("Ingress mode : {}", request.ingress_mode);
    println!("Project dir  : {}", request.base_dir.join(&result.service_key).display());
    println!(
        "Retries      : {} (backoff {}s)",
        request.registry_retries, request.retry_backoff_seconds
    );
    println!(
        "Daemon tune  : {}",
        if request.tune_docker_daemon { "enabled" } else { "disabled" }
    );
    println!("Compose file : {}", result.compose_path.display());
    if result.source_kind == SourceKind::Compose {
        if request.compose_services.is_empty() {
            println!("Services     : all");
        } else {
            println!("Services     : {}", request.compose_services.join(", "));
        }
    }
    if result.running_services.is_empty() {
        println!("Running      : (none reported)");
    } else {
        println!("Running      : {}", result.running_services.join(", "));
    }

    if let Some(ingress) = &result.ingress {
        match ingress.mode {
            IngressMode::Managed => {
                if let Some(https_port) = ingress.https_port {
                    println!("Proxy ports  : {}->{}", ingress.http_port, https_port);
                } else {
                    println!("Proxy port   : {}", ingress.http_port);
                }
            }
            IngressMode::ExternalNginx | IngressMode::Takeover => {
                if ingress.https_port.is_some() {
                    println!("Proxy ports  : 80->443 (host nginx)");
                } else {
                    println!("Proxy port   : 80 (host nginx)");
                }
            }
        }
        if let Some(domain) = &request.domain {
            println!("Domain       : {domain}");
            println!(
                "TLS          : {}",
                if ingress.tls_active { "active" } else { "unavailable (HTTP only)" }
            );
        }
        println!(
            "Auth token   : {}",
            if request.auth_token.is_some() { "enabled" } else { "disabled" }
        );
        println!("Proxy routes : {}", ingress.routes.join(", "));
    } else {
        println!("Proxy        : none");
    }

    if let DeployStatus::Degraded { reason } = &result.status {
        println!();
        println!("Degraded     : {reason}");
    }

    println!();
    println!("Useful commands:");
    let mut compose_files = vec![result.compose_path.clone()];
    let managed_overlay = result.ingress.as_ref().and_then(|ingress| {
        (ingress.mode == IngressMode::Managed)
            .then(|| request.base_dir.join(&result.service_key))
            .map(|dir| dir.join(crate::paths::PROXY_COMPOSE_FILE))
    });
    if let Some(overlay) = &managed_overlay {
        compose_files.push(overlay.clone());
    }
    let files_arg = compose_files
        .iter()
        .map(|p| format!("-f {}", sh_path(p)))
        .collect::<Vec<_>>()
        .join(" ");
    let mut services_arg = String::new();
    if result.source_kind == SourceKind::Compose && !request.compose_services.is_empty() {
        for service in &request.compose_services {
            services_arg.push(' ');
            services_arg.push_str(&sh(service));
        }
    }
    let key = sh(&result.service_key);
    println!("  docker compose -p {key} {files_arg} ps{services_arg}");
    println!("  docker compose -p {key} {files_arg} logs -f{services_arg}");

    if let Some(ingress) = &result.ingress {
        if ingress.tls_active {
            match ingress.mode {
                IngressMode::Managed => println!(
                    "  docker compose -p {key} {files_arg} run --rm certbot renew && \
                     docker compose -p {key} {files_arg} exec -T ingress nginx -s reload"
                ),
                IngressMode::ExternalNginx | IngressMode::Takeover => {
                    println!("  certbot renew && nginx -t && systemctl reload nginx");
                }
            }
        }
    }
    println!();
}
