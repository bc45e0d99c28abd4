//! Command line argument parsing.
//!
//! One `deploy` subcommand mirrors the library's [`DeploymentRequest`]
//! field for field; `show-config` prints the configuration discovery
//! hierarchy. Flag defaults that are not fixed here come from a discovered
//! defaults file (see [`crate::cli::config`]).

use crate::cli::config::Defaults;
use crate::paths::DEFAULT_BASE_DIR;
use crate::request::{
    AccessMode, DeploymentRequest, IngressMode, ProxyRoute, RequestError, SourceKind,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "shipyard")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Deploy a Docker microservice from a directory with a compose file or Dockerfile")]
#[command(arg_required_else_help = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Deploy a service from a source directory
    Deploy(DeployArgs),
    /// Show configuration discovery information
    ShowConfig,
}

#[derive(Debug, clap::Args)]
pub struct DeployArgs {
    /// Service name; the isolation key for every resource of this deployment
    #[arg(long = "service-name", value_name = "NAME")]
    pub service_name: String,

    /// Directory containing the compose file or Dockerfile
    #[arg(long = "source-dir", value_name = "DIR")]
    pub source_dir: PathBuf,

    /// Source format
    #[arg(long = "source-kind", value_enum, default_value_t = SourceKind::Auto)]
    pub source_kind: SourceKind,

    /// Deployment state directory, one subdirectory per service name
    #[arg(long = "base-dir", value_name = "DIR")]
    pub base_dir: Option<PathBuf>,

    /// Published host port (Dockerfile sources; requires --container-port)
    #[arg(long = "host-port", value_name = "PORT")]
    pub host_port: Option<u16>,

    /// Container port behind --host-port
    #[arg(long = "container-port", value_name = "PORT")]
    pub container_port: Option<u16>,

    /// Host bind address for generated compose port mappings
    #[arg(long = "bind-host", value_name = "HOST")]
    pub bind_host: Option<String>,

    /// Network exposure profile
    #[arg(long = "access-mode", value_enum, default_value_t = AccessMode::Localhost)]
    pub access_mode: AccessMode,

    /// Reverse-proxy ownership
    #[arg(long = "ingress-mode", value_enum, default_value_t = IngressMode::Managed)]
    pub ingress_mode: IngressMode,

    /// Compose service to deploy; repeat for multiple (default: all)
    #[arg(long = "compose-service", value_name = "NAME")]
    pub compose_services: Vec<String>,

    /// Enable the reverse proxy + certbot for this public domain
    #[arg(long = "domain", value_name = "DOMAIN")]
    pub domain: Option<String>,

    /// Email address used for Let's Encrypt registration
    #[arg(long = "certbot-email", value_name = "EMAIL")]
    pub certbot_email: Option<String>,

    /// Require `Authorization: Bearer <token>` at the proxy
    #[arg(long = "auth-token", value_name = "TOKEN")]
    pub auth_token: Option<String>,

    /// Hostname-based proxy route; repeat for multiple
    #[arg(long = "proxy-route", value_name = "HOST[/PATH]=UPSTREAM:PORT")]
    pub proxy_routes: Vec<String>,

    /// Upstream compose service for the proxy (compose sources only)
    #[arg(long = "proxy-upstream-service", value_name = "NAME")]
    pub proxy_upstream_service: Option<String>,

    /// Upstream container port for the proxy
    #[arg(long = "proxy-upstream-port", value_name = "PORT")]
    pub proxy_upstream_port: Option<u16>,

    /// External host HTTP port for the managed proxy (default: 80)
    #[arg(long = "proxy-http-port", value_name = "PORT")]
    pub proxy_http_port: Option<u16>,

    /// External host HTTPS port for the managed proxy TLS (default: 443)
    #[arg(long = "proxy-https-port", value_name = "PORT")]
    pub proxy_https_port: Option<u16>,

    /// Retry attempts for compose pull/build/up operations (default: 4)
    #[arg(long = "registry-retries", value_name = "N")]
    pub registry_retries: Option<u32>,

    /// Initial retry backoff for registry/network errors (default: 5)
    #[arg(long = "retry-backoff-seconds", value_name = "SEC")]
    pub retry_backoff_seconds: Option<u64>,

    /// Skip docker daemon network hardening
    #[arg(long = "no-docker-daemon-tuning")]
    pub no_docker_daemon_tuning: bool,

    /// Print the deployment result as JSON instead of the summary
    #[arg(long = "json")]
    pub json: bool,
}

impl DeployArgs {
    /// Build the deployment request, filling unset flags from defaults.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] for unparseable proxy routes; the request's
    /// own validation runs later inside the deployer.
    pub fn into_request(self, defaults: &Defaults) -> Result<DeploymentRequest, RequestError> {
        let mut routes = Vec::with_capacity(self.proxy_routes.len());
        for raw in &self.proxy_routes {
            routes.push(ProxyRoute::parse(raw)?);
        }

        Ok(DeploymentRequest {
            service_name: self.service_name,
            source_dir: self.source_dir,
            source_kind: self.source_kind,
            base_dir: self
                .base_dir
                .or_else(|| defaults.base_dir.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_BASE_DIR)),
            host_port: self.host_port,
            container_port: self.container_port,
            bind_host: self
                .bind_host
                .or_else(|| defaults.bind_host.clone())
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            access_mode: self.access_mode,
            ingress_mode: self.ingress_mode,
            compose_services: self.compose_services,
            domain: self.domain,
            certbot_email: self.certbot_email,
            auth_token: self.auth_token,
            proxy_http_port: self.proxy_http_port,
            proxy_https_port: self.proxy_https_port,
            proxy_routes: routes,
            proxy_upstream_service: self.proxy_upstream_service,
            proxy_upstream_port: self.proxy_upstream_port,
            registry_retries: self
                .registry_retries
                .or(defaults.registry_retries)
                .unwrap_or(4),
            retry_backoff_seconds: self
                .retry_backoff_seconds
                .or(defaults.retry_backoff_seconds)
                .unwrap_or(5),
            tune_docker_daemon: !self.no_docker_daemon_tuning,
        })
    }
}
