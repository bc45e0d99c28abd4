//! Deployment request model.
//!
//! A [`DeploymentRequest`] is built once per invocation (by the CLI or an
//! embedding caller), validated, and then treated as immutable by every
//! later stage. Validation here is purely structural: it never touches the
//! filesystem or the host. Source-directory checks belong to
//! [`crate::source`] and access/ingress relationship rules to
//! [`crate::ingress`], which both run before any host mutation.

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::LazyLock;

static SERVICE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$").unwrap());
static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?\.)+[A-Za-z]{2,63}$").unwrap()
});
static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());
static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._~+\-]{8,}$").unwrap());
static SERVER_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9*_.-]+$").unwrap());
static UPSTREAM_HOST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.-]+$").unwrap());
static PATH_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/[A-Za-z0-9._~!$&'()*+,;=:@%/\-]*$").unwrap());

/// How the source directory should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// Prefer a compose file, fall back to a Dockerfile.
    Auto,
    /// Require an existing compose file.
    Compose,
    /// Require a Dockerfile; a compose definition is generated.
    Dockerfile,
}

/// Intended reachability boundary of the deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum AccessMode {
    /// Loopback only.
    Localhost,
    /// Private tailnet interface.
    Tailscale,
    /// All interfaces / public internet.
    Public,
}

/// Which component owns the reverse-proxy lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum IngressMode {
    /// nginx + certbot run as containers inside the deployment scope.
    Managed,
    /// Existing host nginx, updated with a reload (never stopped).
    ExternalNginx,
    /// Host nginx is stopped, reconfigured, and started again.
    Takeover,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Auto => write!(f, "auto"),
            SourceKind::Compose => write!(f, "compose"),
            SourceKind::Dockerfile => write!(f, "dockerfile"),
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::Localhost => write!(f, "localhost"),
            AccessMode::Tailscale => write!(f, "tailscale"),
            AccessMode::Public => write!(f, "public"),
        }
    }
}

impl fmt::Display for IngressMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngressMode::Managed => write!(f, "managed"),
            IngressMode::ExternalNginx => write!(f, "external-nginx"),
            IngressMode::Takeover => write!(f, "takeover"),
        }
    }
}

/// Request validation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RequestError {
    #[error("service_name {0:?} is invalid. Use letters, numbers, '.', '_', '-'")]
    InvalidServiceName(String),

    #[error("host_port and container_port must be set together")]
    PortsNotPaired,

    #[error("{field} must be between 1 and 65535")]
    PortOutOfRange { field: &'static str },

    #[error("bind_host must not be empty")]
    EmptyBindHost,

    #[error("registry_retries must be >= 1")]
    RetriesTooLow,

    #[error("retry_backoff_seconds must be >= 1")]
    BackoffTooLow,

    #[error("compose service selection must not contain empty names")]
    EmptySelectionEntry,

    #[error("auth_token must be >= 8 chars and only contain [A-Za-z0-9._~+-]")]
    InvalidToken,

    #[error("domain {0:?} must be a valid DNS name, e.g. api.example.com")]
    InvalidDomain(String),

    #[error("certbot_email {0:?} must be a valid email address")]
    InvalidEmail(String),

    #[error("certbot_email requires domain")]
    EmailWithoutDomain,

    #[error("proxy_upstream_service {0:?} is invalid. Use letters, numbers, '.', '_', '-'")]
    InvalidUpstreamService(String),

    #[error("proxy_routes cannot be combined with proxy_upstream_service/proxy_upstream_port")]
    RoutesWithUpstreamOverride,

    #[error(transparent)]
    Route(#[from] RouteParseError),
}

/// Errors from parsing a `<host>[/path]=<upstream>:<port>` route spec.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RouteParseError {
    #[error("proxy route must not be empty")]
    Empty,

    #[error("proxy route format must be '<host>[/path]=<upstream-host>:<port>'")]
    MissingSeparator,

    #[error("proxy route host must be a hostname/wildcard server name like app.example.com")]
    InvalidHost,

    #[error("proxy route path is invalid. Use URL path prefixes like /service or /api/v1")]
    InvalidPath,

    #[error("proxy route target must include a port, e.g. api:8080")]
    MissingPort,

    #[error("proxy route upstream host is invalid. Use letters, numbers, '.', '_', '-'")]
    InvalidUpstreamHost,

    #[error("proxy route upstream port must be an integer between 1 and 65535")]
    InvalidUpstreamPort,
}

/// One hostname/path-prefix route to an upstream target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRoute {
    /// Server name the proxy matches (or `_` as catch-all).
    pub host: String,
    /// Normalized URL path prefix, `/` for the whole host.
    pub path_prefix: String,
    /// Upstream host (compose service name or host-reachable address).
    pub upstream_host: String,
    /// Upstream TCP port.
    pub upstream_port: u16,
}

impl ProxyRoute {
    /// Build a whole-host route.
    pub fn new(host: &str, upstream_host: &str, upstream_port: u16) -> Self {
        Self {
            host: host.to_string(),
            path_prefix: "/".to_string(),
            upstream_host: upstream_host.to_string(),
            upstream_port,
        }
    }

    /// Parse a `<host>[/path]=<upstream-host>:<port>` spec.
    pub fn parse(raw: &str) -> Result<Self, RouteParseError> {
        let text = raw.trim();
        if text.is_empty() {
            return Err(RouteParseError::Empty);
        }
        let (host_part, target_part) =
            text.split_once('=').ok_or(RouteParseError::MissingSeparator)?;

        let host_field = host_part.trim().to_lowercase();
        let (host, path_prefix) = match host_field.split_once('/') {
            Some((host, path)) => (host.trim().to_string(), normalize_path_prefix(path)?),
            None => (host_field, "/".to_string()),
        };
        if host.is_empty() || !SERVER_NAME_RE.is_match(&host) {
            return Err(RouteParseError::InvalidHost);
        }

        let target = target_part.trim();
        let (upstream_host, port_text) =
            target.rsplit_once(':').ok_or(RouteParseError::MissingPort)?;
        let upstream_host = upstream_host.trim();
        if upstream_host.is_empty() || !UPSTREAM_HOST_RE.is_match(upstream_host) {
            return Err(RouteParseError::InvalidUpstreamHost);
        }
        let upstream_port: u16 = port_text
            .trim()
            .parse()
            .map_err(|_| RouteParseError::InvalidUpstreamPort)?;
        if upstream_port == 0 {
            return Err(RouteParseError::InvalidUpstreamPort);
        }

        Ok(Self {
            host,
            path_prefix,
            upstream_host: upstream_host.to_string(),
            upstream_port,
        })
    }

    /// The (host, path-prefix) pair identifying this route within a plan.
    pub fn key(&self) -> (&str, &str) {
        (&self.host, &self.path_prefix)
    }

    /// Human-oriented `host/path->upstream:port` rendering.
    pub fn summary(&self) -> String {
        format!(
            "{}{}->{}:{}",
            self.host, self.path_prefix, self.upstream_host, self.upstream_port
        )
    }
}

impl fmt::Display for ProxyRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path_prefix == "/" {
            write!(f, "{}={}:{}", self.host, self.upstream_host, self.upstream_port)
        } else {
            write!(
                f,
                "{}{}={}:{}",
                self.host, self.path_prefix, self.upstream_host, self.upstream_port
            )
        }
    }
}

fn normalize_path_prefix(raw: &str) -> Result<String, RouteParseError> {
    let text = raw.trim();
    if text.is_empty() {
        return Ok("/".to_string());
    }
    let mut path = String::with_capacity(text.len() + 1);
    if !text.starts_with('/') {
        path.push('/');
    }
    // Collapse duplicate slashes while copying.
    let mut prev_slash = path.ends_with('/');
    for ch in text.chars() {
        if ch == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        path.push(ch);
    }
    if path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    if !PATH_PREFIX_RE.is_match(&path) {
        return Err(RouteParseError::InvalidPath);
    }
    Ok(path)
}

/// Normalize a service name into a compose project key.
///
/// Compose project names are lowercase with a limited charset; the result
/// is also used as the isolation scope for every resource of a deployment.
pub fn normalize_service_key(service_name: &str) -> String {
    let mut key = String::with_capacity(service_name.len());
    for ch in service_name.to_lowercase().chars() {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_' || ch == '-' {
            key.push(ch);
        } else {
            key.push('-');
        }
    }
    let trimmed = key.trim_matches(|c| c == '-' || c == '_');
    if trimmed.is_empty() {
        "service".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Returns true when `text` looks like a DNS name certbot can issue for.
pub fn is_valid_domain(text: &str) -> bool {
    text.len() <= 253 && DOMAIN_RE.is_match(text)
}

/// One deployment invocation, fully described.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRequest {
    /// Unique isolation key for this deployment on the host.
    pub service_name: String,
    /// Directory containing the compose file or Dockerfile.
    pub source_dir: PathBuf,
    /// How to interpret the source directory.
    pub source_kind: SourceKind,
    /// Base directory for generated per-service artifacts.
    pub base_dir: PathBuf,
    /// Published host port (Dockerfile sources; paired with `container_port`).
    pub host_port: Option<u16>,
    /// Container port behind `host_port`.
    pub container_port: Option<u16>,
    /// Host address generated port mappings bind to.
    pub bind_host: String,
    /// Reachability boundary.
    pub access_mode: AccessMode,
    /// Reverse-proxy ownership.
    pub ingress_mode: IngressMode,
    /// Compose services to deploy; empty means all.
    pub compose_services: Vec<String>,
    /// Public domain; enables TLS via ACME HTTP-01.
    pub domain: Option<String>,
    /// Certificate contact email, required with `domain`.
    pub certbot_email: Option<String>,
    /// Bearer token enforced at the proxy.
    pub auth_token: Option<String>,
    /// Managed proxy external HTTP port (default 80).
    pub proxy_http_port: Option<u16>,
    /// Managed proxy external HTTPS port (default 443).
    pub proxy_https_port: Option<u16>,
    /// Explicit hostname/path routes.
    pub proxy_routes: Vec<ProxyRoute>,
    /// Default upstream compose service when no routes are given.
    pub proxy_upstream_service: Option<String>,
    /// Default upstream port when no routes are given.
    pub proxy_upstream_port: Option<u16>,
    /// Retry attempts for transient registry/network failures.
    pub registry_retries: u32,
    /// Initial backoff in seconds; attempt n waits n times this.
    pub retry_backoff_seconds: u64,
    /// Merge registry-hardening settings into the docker daemon config.
    pub tune_docker_daemon: bool,
}

impl DeploymentRequest {
    /// A request with the same defaults the batch CLI applies.
    pub fn new<P: Into<PathBuf>>(service_name: &str, source_dir: P) -> Self {
        Self {
            service_name: service_name.to_string(),
            source_dir: source_dir.into(),
            source_kind: SourceKind::Auto,
            base_dir: PathBuf::from(crate::paths::DEFAULT_BASE_DIR),
            host_port: None,
            container_port: None,
            bind_host: "127.0.0.1".to_string(),
            access_mode: AccessMode::Localhost,
            ingress_mode: IngressMode::Managed,
            compose_services: Vec::new(),
            domain: None,
            certbot_email: None,
            auth_token: None,
            proxy_http_port: None,
            proxy_https_port: None,
            proxy_routes: Vec::new(),
            proxy_upstream_service: None,
            proxy_upstream_port: None,
            registry_retries: 4,
            retry_backoff_seconds: 5,
            tune_docker_daemon: true,
        }
    }

    /// Normalize free-form fields and check every structural invariant.
    ///
    /// # Errors
    ///
    /// Returns the first [`RequestError`] encountered; nothing has been
    /// touched on the host when this fails.
    pub fn validated(mut self) -> Result<Self, RequestError> {
        if !SERVICE_NAME_RE.is_match(&self.service_name) {
            return Err(RequestError::InvalidServiceName(self.service_name.clone()));
        }

        if self.host_port.is_some() != self.container_port.is_some() {
            return Err(RequestError::PortsNotPaired);
        }
        for (field, port) in [
            ("host_port", self.host_port),
            ("container_port", self.container_port),
            ("proxy_http_port", self.proxy_http_port),
            ("proxy_https_port", self.proxy_https_port),
            ("proxy_upstream_port", self.proxy_upstream_port),
        ] {
            if port == Some(0) {
                return Err(RequestError::PortOutOfRange { field });
            }
        }

        self.bind_host = self.bind_host.trim().to_string();
        if self.bind_host.is_empty() {
            return Err(RequestError::EmptyBindHost);
        }

        if self.registry_retries < 1 {
            return Err(RequestError::RetriesTooLow);
        }
        if self.retry_backoff_seconds < 1 {
            return Err(RequestError::BackoffTooLow);
        }

        let mut selected: Vec<String> = Vec::new();
        for name in &self.compose_services {
            let name = name.trim();
            if name.is_empty() {
                return Err(RequestError::EmptySelectionEntry);
            }
            if !selected.iter().any(|s| s == name) {
                selected.push(name.to_string());
            }
        }
        self.compose_services = selected;

        if let Some(token) = &self.auth_token {
            let token = token.trim().to_string();
            if !TOKEN_RE.is_match(&token) {
                return Err(RequestError::InvalidToken);
            }
            self.auth_token = Some(token);
        }

        if let Some(domain) = &self.domain {
            let domain = domain.trim().to_lowercase();
            if !is_valid_domain(&domain) {
                return Err(RequestError::InvalidDomain(domain));
            }
            self.domain = Some(domain);
        }
        if let Some(email) = &self.certbot_email {
            let email = email.trim().to_lowercase();
            if self.domain.is_none() {
                return Err(RequestError::EmailWithoutDomain);
            }
            if !EMAIL_RE.is_match(&email) {
                return Err(RequestError::InvalidEmail(email));
            }
            self.certbot_email = Some(email);
        }

        if let Some(service) = &self.proxy_upstream_service {
            let service = service.trim().to_string();
            if !SERVICE_NAME_RE.is_match(&service) {
                return Err(RequestError::InvalidUpstreamService(service));
            }
            self.proxy_upstream_service = Some(service);
        }
        if !self.proxy_routes.is_empty()
            && (self.proxy_upstream_service.is_some() || self.proxy_upstream_port.is_some())
        {
            return Err(RequestError::RoutesWithUpstreamOverride);
        }

        Ok(self)
    }

    /// The isolation scope / compose project key for this deployment.
    pub fn service_key(&self) -> String {
        normalize_service_key(&self.service_name)
    }

    /// Whether TLS certificate issuance is requested.
    pub fn tls_enabled(&self) -> bool {
        self.domain.is_some()
    }

    /// Whether anything activates the reverse proxy.
    pub fn proxy_active(&self) -> bool {
        self.domain.is_some() || self.auth_token.is_some() || !self.proxy_routes.is_empty()
    }

    /// Bind address generated port mappings should use.
    pub fn effective_bind_host(&self) -> &str {
        if self.access_mode == AccessMode::Public {
            "0.0.0.0"
        } else {
            &self.bind_host
        }
    }
}
