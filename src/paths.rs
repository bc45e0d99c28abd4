//! Managed filesystem locations for deployments.
//!
//! Everything this tool writes lives either under a per-service directory
//! (`<base>/<service-key>/`) or at a well-known host path (docker daemon
//! config, nginx site directories). Centralizing the layout here keeps the
//! rest of the code free of hardcoded paths and lets tests redirect every
//! root into a temporary directory.

use std::path::{Path, PathBuf};

/// Default base directory for per-service deployment state.
pub const DEFAULT_BASE_DIR: &str = "/opt/services";

/// Generated compose file for Dockerfile-backed sources.
pub const GENERATED_COMPOSE_FILE: &str = "docker-compose.generated.yml";

/// Compose overlay running the managed nginx + certbot containers.
pub const PROXY_COMPOSE_FILE: &str = "docker-compose.proxy.yml";

/// Subdirectory holding the rendered managed nginx configuration.
pub const NGINX_CONF_DIR: &str = "nginx";

/// Rendered nginx server configuration file name.
pub const NGINX_CONF_FILE: &str = "default.conf";

/// Webroot served for ACME HTTP-01 challenges.
pub const CERTBOT_WEBROOT_DIR: &str = "certbot-www";

/// Persisted certificate state for the managed certbot container.
pub const CERTBOT_STATE_DIR: &str = "certbot-etc";

/// Filesystem roots the deployment writes under.
///
/// Production code uses [`ManagedPaths::default`]; tests point every root
/// at a temporary directory.
#[derive(Debug, Clone)]
pub struct ManagedPaths {
    /// Base directory holding one subdirectory per service key.
    pub base_dir: PathBuf,
    /// Docker daemon configuration directory (normally `/etc/docker`).
    pub docker_config_dir: PathBuf,
    /// Host nginx configuration directory (normally `/etc/nginx`).
    pub nginx_config_dir: PathBuf,
    /// Host certbot state directory (normally `/etc/letsencrypt`).
    pub letsencrypt_dir: PathBuf,
}

impl Default for ManagedPaths {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from(DEFAULT_BASE_DIR),
            docker_config_dir: PathBuf::from("/etc/docker"),
            nginx_config_dir: PathBuf::from("/etc/nginx"),
            letsencrypt_dir: PathBuf::from("/etc/letsencrypt"),
        }
    }
}

impl ManagedPaths {
    /// Paths rooted at a custom base directory, keeping system roots for
    /// daemon and nginx configuration.
    pub fn with_base_dir<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Per-service state directory.
    pub fn service_dir(&self, service_key: &str) -> PathBuf {
        self.base_dir.join(service_key)
    }

    /// Generated compose file for a Dockerfile-backed source.
    pub fn generated_compose_path(&self, service_key: &str) -> PathBuf {
        self.service_dir(service_key).join(GENERATED_COMPOSE_FILE)
    }

    /// Compose overlay for the managed proxy containers.
    pub fn proxy_compose_path(&self, service_key: &str) -> PathBuf {
        self.service_dir(service_key).join(PROXY_COMPOSE_FILE)
    }

    /// Rendered nginx configuration mounted into the managed proxy.
    pub fn managed_nginx_conf_path(&self, service_key: &str) -> PathBuf {
        self.service_dir(service_key)
            .join(NGINX_CONF_DIR)
            .join(NGINX_CONF_FILE)
    }

    /// ACME webroot for HTTP-01 challenges.
    pub fn certbot_webroot_path(&self, service_key: &str) -> PathBuf {
        self.service_dir(service_key).join(CERTBOT_WEBROOT_DIR)
    }

    /// Certificate state directory for the managed certbot container.
    pub fn certbot_state_path(&self, service_key: &str) -> PathBuf {
        self.service_dir(service_key).join(CERTBOT_STATE_DIR)
    }

    /// Docker daemon configuration file.
    pub fn daemon_config_path(&self) -> PathBuf {
        self.docker_config_dir.join("daemon.json")
    }

    /// Backup written before the daemon configuration is modified.
    pub fn daemon_config_backup_path(&self) -> PathBuf {
        self.docker_config_dir.join("daemon.json.bak")
    }

    /// Site file name used for this service in the host nginx directories.
    pub fn host_site_name(&self, service_key: &str) -> String {
        format!("shipyard_{service_key}.conf")
    }

    /// Host nginx `sites-available` entry for this service.
    pub fn host_site_available_path(&self, service_key: &str) -> PathBuf {
        self.nginx_config_dir
            .join("sites-available")
            .join(self.host_site_name(service_key))
    }

    /// Host nginx `sites-enabled` symlink for this service.
    pub fn host_site_enabled_path(&self, service_key: &str) -> PathBuf {
        self.nginx_config_dir
            .join("sites-enabled")
            .join(self.host_site_name(service_key))
    }

    /// Webroot used by host-nginx certbot issuance.
    pub fn host_certbot_webroot_path(&self, service_key: &str) -> PathBuf {
        self.service_dir(service_key).join("certbot-www-host")
    }

    /// Certificate file certbot writes for a domain on the host.
    pub fn host_cert_path(&self, domain: &str) -> PathBuf {
        self.letsencrypt_dir
            .join("live")
            .join(domain)
            .join("fullchain.pem")
    }

    /// Certificate file inside the managed certbot state directory.
    pub fn managed_cert_path(&self, service_key: &str, domain: &str) -> PathBuf {
        self.certbot_state_path(service_key)
            .join("live")
            .join(domain)
            .join("fullchain.pem")
    }
}
