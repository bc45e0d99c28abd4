//! Ingress planning and reconciliation.
//!
//! Translates access mode + routing intent into an [`IngressPlan`] and
//! applies it: no proxy at all, an nginx + certbot pair managed inside the
//! deployment scope, or a host-level nginx updated non-disruptively
//! (`external-nginx`) or taken over (`takeover`). Planning is pure and
//! fails fast: every [`IngressError::Invalid`] is raised before anything
//! on the host has been touched.

mod apply;
mod nginx;

pub use apply::{IngressSummary, ProxyConfigurator};
pub use nginx::{RenderTarget, render_proxy_compose, render_server_config};

use crate::request::{
    AccessMode, DeploymentRequest, IngressMode, ProxyRoute, SourceKind, is_valid_domain,
};
use crate::runner::RunnerError;
use crate::source::ResolvedSource;

/// Managed ingress proxy image.
pub const NGINX_PROXY_IMAGE: &str = "nginx:1.27-alpine";

/// Managed certificate issuance image.
pub const CERTBOT_IMAGE: &str = "certbot/certbot:latest";

/// Ingress planning and reconciliation errors.
#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    /// The request's access/routing intent is contradictory or unsafe.
    /// Raised before any proxy mutation; fully recoverable by adjusting
    /// the request.
    #[error("invalid access configuration: {0}")]
    Invalid(String),

    /// Certificate issuance failed. Degraded, not fatal: the service stays
    /// reachable over HTTP while TLS is unavailable.
    #[error("certificate issuance failed: {0}")]
    Certificate(String),

    /// A reconciliation step against the proxy failed.
    #[error("ingress step '{step}' failed: {reason}")]
    Apply { step: String, reason: String },

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("ingress I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

impl IngressError {
    fn invalid(reason: &str) -> Self {
        Self::Invalid(reason.to_string())
    }

    pub(crate) fn apply_step(step: &str, reason: &str) -> Self {
        Self::Apply {
            step: step.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// TLS intent of a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    /// Domain certificates are stored under.
    pub primary_domain: String,
    /// ACME registration contact.
    pub contact_email: String,
    /// Every domain the certificate must cover.
    pub domains: Vec<String>,
}

/// A concrete ingress configuration, ready to apply.
#[derive(Debug, Clone)]
pub struct IngressPlan {
    /// Which component owns the proxy lifecycle.
    pub mode: IngressMode,
    /// Routes, unique by (host, path-prefix); never empty.
    pub routes: Vec<ProxyRoute>,
    /// Certificate issuance intent, when a domain is set.
    pub tls: Option<TlsConfig>,
    /// Bearer token every proxied location enforces.
    pub auth_token: Option<String>,
    /// External HTTP port (managed mode).
    pub http_port: u16,
    /// External HTTPS port (managed mode, TLS only).
    pub https_port: Option<u16>,
    /// Address the managed proxy binds on the host.
    pub bind_host: String,
}

impl IngressPlan {
    /// Whether certificate issuance is part of this plan.
    pub fn tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    /// Route summaries for reporting.
    pub fn route_summaries(&self) -> Vec<String> {
        self.routes.iter().map(ProxyRoute::summary).collect()
    }
}

/// Build the ingress plan for a request, or `None` when no proxy is wanted.
///
/// # Errors
///
/// Returns [`IngressError::Invalid`] for contradictory or unsafe intent.
/// Nothing has been mutated when this fails.
pub fn plan(
    request: &DeploymentRequest,
    resolved: &ResolvedSource,
) -> Result<Option<IngressPlan>, IngressError> {
    if !request.proxy_active() {
        return plan_without_proxy(request, resolved);
    }

    if request.tls_enabled() {
        if request.access_mode != AccessMode::Public {
            return Err(IngressError::invalid(
                "domain/certbot mode requires access_mode=public for HTTP-01 reachability",
            ));
        }
        if request.certbot_email.is_none() {
            return Err(IngressError::invalid("domain requires certbot_email"));
        }
    }
    if request.ingress_mode != IngressMode::Managed {
        if request.access_mode != AccessMode::Public {
            return Err(IngressError::invalid(
                "ingress_mode external-nginx/takeover requires access_mode=public",
            ));
        }
        if request.proxy_http_port.is_some() || request.proxy_https_port.is_some() {
            return Err(IngressError::invalid(
                "proxy_http_port/proxy_https_port are only used with ingress_mode=managed",
            ));
        }
    }
    if request.proxy_https_port.is_some() && !request.tls_enabled() {
        return Err(IngressError::invalid(
            "proxy_https_port requires domain/certbot mode",
        ));
    }

    let routes = if request.proxy_routes.is_empty() {
        vec![derive_default_route(request, resolved)?]
    } else {
        validate_explicit_routes(request, resolved)?;
        request.proxy_routes.clone()
    };

    let mut seen: Vec<(&str, &str)> = Vec::new();
    for route in &routes {
        let key = route.key();
        if seen.contains(&key) {
            return Err(IngressError::Invalid(format!(
                "duplicate route for {}{}",
                route.host, route.path_prefix
            )));
        }
        seen.push(key);
    }

    let tls = match (&request.domain, &request.certbot_email) {
        (Some(domain), Some(email)) => {
            for route in &routes {
                if !is_valid_domain(&route.host) {
                    return Err(IngressError::Invalid(format!(
                        "route host '{}' must be a valid DNS name for certbot HTTP-01",
                        route.host
                    )));
                }
            }
            let mut domains = vec![domain.clone()];
            for route in &routes {
                if !domains.contains(&route.host) {
                    domains.push(route.host.clone());
                }
            }
            Some(TlsConfig {
                primary_domain: domain.clone(),
                contact_email: email.clone(),
                domains,
            })
        }
        _ => None,
    };

    let http_port = request.proxy_http_port.unwrap_or(80);
    let https_port = tls
        .as_ref()
        .map(|_| request.proxy_https_port.unwrap_or(443));
    if request.ingress_mode == IngressMode::Managed && https_port == Some(http_port) {
        return Err(IngressError::invalid(
            "proxy_http_port and proxy_https_port must be different",
        ));
    }

    let bind_host = if request.access_mode == AccessMode::Public {
        "0.0.0.0".to_string()
    } else {
        request.bind_host.clone()
    };

    Ok(Some(IngressPlan {
        mode: request.ingress_mode,
        routes,
        tls,
        auth_token: request.auth_token.clone(),
        http_port,
        https_port,
        bind_host,
    }))
}

/// No domain, token, or routes: either a plain deployment or a rejection.
fn plan_without_proxy(
    request: &DeploymentRequest,
    resolved: &ResolvedSource,
) -> Result<Option<IngressPlan>, IngressError> {
    if request.proxy_http_port.is_some()
        || request.proxy_https_port.is_some()
        || request.proxy_upstream_service.is_some()
        || request.proxy_upstream_port.is_some()
        || request.ingress_mode != IngressMode::Managed
    {
        return Err(IngressError::invalid(
            "auth/proxy settings require domain, auth_token, or proxy routes",
        ));
    }

    match request.access_mode {
        AccessMode::Localhost => Ok(None),
        AccessMode::Tailscale => {
            // Private network, but a multi-service deployment with nothing
            // routing to it has no defined entry point.
            if resolved.kind == SourceKind::Compose && resolved.effective_services().len() > 1 {
                return Err(IngressError::invalid(
                    "tailscale access for a multi-service compose source requires proxy routes \
                     or an unambiguous upstream (domain or auth_token enables the proxy)",
                ));
            }
            Ok(None)
        }
        AccessMode::Public => Err(IngressError::invalid(
            "public access requires an auth_token, a domain, or explicit proxy routes; \
             a bare public deployment is rejected as unsafe",
        )),
    }
}

/// Derive the single default route when none are given explicitly.
fn derive_default_route(
    request: &DeploymentRequest,
    resolved: &ResolvedSource,
) -> Result<ProxyRoute, IngressError> {
    let host = request.domain.clone().unwrap_or_else(|| "_".to_string());

    if request.ingress_mode != IngressMode::Managed {
        // Host nginx can only reach host-published ports.
        if resolved.kind == SourceKind::Dockerfile {
            if let Some(host_port) = request.host_port {
                return Ok(ProxyRoute::new(&host, "127.0.0.1", host_port));
            }
        }
        return Err(IngressError::invalid(
            "external-nginx/takeover requires explicit proxy routes \
             (or a dockerfile source with host_port set)",
        ));
    }

    let upstream = default_upstream_service(request, resolved)?;
    let port = request
        .proxy_upstream_port
        .or(request.container_port)
        .or_else(|| resolved.container_ports.get(&upstream).copied())
        .ok_or_else(|| {
            IngressError::invalid(
                "could not infer the upstream port; set proxy_upstream_port \
                 (or container_port for dockerfile sources)",
            )
        })?;

    Ok(ProxyRoute::new(&host, &upstream, port))
}

fn default_upstream_service(
    request: &DeploymentRequest,
    resolved: &ResolvedSource,
) -> Result<String, IngressError> {
    if resolved.kind == SourceKind::Dockerfile {
        return Ok(request.service_key());
    }

    if let Some(service) = &request.proxy_upstream_service {
        if !resolved.services.is_empty() && !resolved.services.iter().any(|s| s == service) {
            let mut known = resolved.services.clone();
            known.sort();
            return Err(IngressError::Invalid(format!(
                "proxy_upstream_service must be one of: {}",
                known.join(", ")
            )));
        }
        if !resolved.selected.is_empty() && !resolved.selected.iter().any(|s| s == service) {
            return Err(IngressError::invalid(
                "proxy_upstream_service must be included in the selected compose services",
            ));
        }
        return Ok(service.clone());
    }

    let candidates = resolved.effective_services();
    match candidates {
        [single] => Ok(single.clone()),
        [] => Err(IngressError::invalid(
            "could not infer the upstream service; set proxy_upstream_service",
        )),
        _ => Err(IngressError::invalid(
            "multiple compose services selected; add explicit proxy routes \
             or set proxy_upstream_service",
        )),
    }
}

/// Checks only applicable to explicitly-specified routes.
fn validate_explicit_routes(
    request: &DeploymentRequest,
    resolved: &ResolvedSource,
) -> Result<(), IngressError> {
    for route in &request.proxy_routes {
        let is_compose_service = resolved.services.iter().any(|s| s == &route.upstream_host);

        if request.ingress_mode == IngressMode::Managed {
            if resolved.kind == SourceKind::Compose
                && is_compose_service
                && !resolved.selected.is_empty()
                && !resolved.selected.iter().any(|s| s == &route.upstream_host)
            {
                return Err(IngressError::Invalid(format!(
                    "route upstream '{}' must be included in the selected compose services",
                    route.upstream_host
                )));
            }
        } else if resolved.kind == SourceKind::Compose && is_compose_service {
            return Err(IngressError::Invalid(format!(
                "external-nginx/takeover cannot reach compose service names \
                 ('{}'); use a host-reachable upstream like 127.0.0.1:<published-port>",
                route.upstream_host
            )));
        }
    }
    Ok(())
}
