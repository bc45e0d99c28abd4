//! Source directory resolution.
//!
//! Classifies a source directory as compose-backed or Dockerfile-backed and
//! normalizes it into a [`ResolvedSource`]: one compose file (existing or
//! generated), the service set it defines, and the concrete selection to
//! deploy. Resolution is the first stage of a deployment and fails without
//! touching the host; the only write it ever performs is the managed
//! generated compose file for Dockerfile sources.

mod compose;
mod generate;

pub use compose::{
    COMPOSE_FILE_CANDIDATES, PortSide, find_compose_file, missing_env_vars, read_dotenv,
    required_env_vars, service_ports_in, services_in,
};
pub use generate::render_generated_compose;

use crate::paths::ManagedPaths;
use crate::request::{DeploymentRequest, SourceKind};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Source resolution errors. All user-correctable; no host mutation has
/// happened when one of these is returned.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("source directory {} does not exist", .0.display())]
    SourceDirMissing(PathBuf),

    #[error("{} does not contain a docker-compose.yml/compose.yml or Dockerfile", .0.display())]
    NoSourceFound(PathBuf),

    #[error("source kind 'compose' requires a compose file in {}", .0.display())]
    ComposeFileMissing(PathBuf),

    #[error("source kind 'dockerfile' requires {}/Dockerfile", .0.display())]
    DockerfileMissing(PathBuf),

    #[error("compose service selection is only supported for compose sources")]
    SelectionUnsupported,

    #[error("unknown compose service(s): {}. Available: {}", unknown.join(", "), available.join(", "))]
    UnknownService {
        unknown: Vec<String>,
        available: Vec<String>,
    },

    #[error("compose file requires values for: {}. Set them in the environment or {}", names.join(", "), dotenv.display())]
    MissingEnvVars { names: Vec<String>, dotenv: PathBuf },

    #[error("failed to read or write source files: {0}")]
    Io(#[from] std::io::Error),
}

/// A source directory normalized to a runnable compose definition.
#[derive(Debug, Clone)]
pub struct ResolvedSource {
    /// Kind actually used (`Auto` never survives resolution).
    pub kind: SourceKind,
    /// Effective compose file, existing or generated.
    pub compose_path: PathBuf,
    /// Working directory `docker compose` runs from.
    pub compose_dir: PathBuf,
    /// Every service the compose definition declares.
    pub services: Vec<String>,
    /// Concrete services to deploy; never empty-meaning-all past this point.
    pub selected: Vec<String>,
    /// First container port per service, from `ports:`/`expose:`.
    pub container_ports: HashMap<String, u16>,
    /// First published host port per service, from `ports:` only.
    pub host_ports: HashMap<String, u16>,
    /// Whether `compose_path` is a managed generated artifact.
    pub generated: bool,
}

impl ResolvedSource {
    /// Services the deployment will bring up: the selection, or all.
    pub fn effective_services(&self) -> &[String] {
        if self.selected.is_empty() {
            &self.services
        } else {
            &self.selected
        }
    }
}

/// Classifies and normalizes source directories.
#[derive(Debug, Clone)]
pub struct SourceResolver {
    paths: ManagedPaths,
}

impl SourceResolver {
    pub fn new(paths: ManagedPaths) -> Self {
        Self { paths }
    }

    /// Resolve a request's source directory into a [`ResolvedSource`].
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] when the directory is missing, no usable
    /// source is found, the selection names unknown services, or required
    /// compose interpolation variables are unset.
    pub fn resolve(&self, request: &DeploymentRequest) -> Result<ResolvedSource, SourceError> {
        let source_dir = &request.source_dir;
        if !source_dir.is_dir() {
            return Err(SourceError::SourceDirMissing(source_dir.clone()));
        }

        let kind = self.classify(source_dir, request.source_kind)?;
        debug!(kind = %kind, source_dir = %source_dir.display(), "resolved source kind");

        match kind {
            SourceKind::Compose => self.resolve_compose(request),
            SourceKind::Dockerfile => self.resolve_dockerfile(request),
            SourceKind::Auto => unreachable!("classify never returns auto"),
        }
    }

    fn classify(&self, source_dir: &Path, requested: SourceKind) -> Result<SourceKind, SourceError> {
        let compose_file = find_compose_file(source_dir);
        let has_dockerfile = source_dir.join("Dockerfile").is_file();

        match requested {
            SourceKind::Auto => {
                if compose_file.is_some() {
                    Ok(SourceKind::Compose)
                } else if has_dockerfile {
                    Ok(SourceKind::Dockerfile)
                } else {
                    Err(SourceError::NoSourceFound(source_dir.to_path_buf()))
                }
            }
            SourceKind::Compose => {
                if compose_file.is_some() {
                    Ok(SourceKind::Compose)
                } else {
                    Err(SourceError::ComposeFileMissing(source_dir.to_path_buf()))
                }
            }
            SourceKind::Dockerfile => {
                if has_dockerfile {
                    Ok(SourceKind::Dockerfile)
                } else {
                    Err(SourceError::DockerfileMissing(source_dir.to_path_buf()))
                }
            }
        }
    }

    fn resolve_compose(&self, request: &DeploymentRequest) -> Result<ResolvedSource, SourceError> {
        let compose_path = find_compose_file(&request.source_dir)
            .ok_or_else(|| SourceError::ComposeFileMissing(request.source_dir.clone()))?;
        let content = std::fs::read_to_string(&compose_path)?;

        let services = services_in(&content);
        let selected = resolve_selection(&request.compose_services, &services)?;

        let dotenv_path = request.source_dir.join(".env");
        let env: HashMap<String, String> = std::env::vars().collect();
        let missing = missing_env_vars(&content, &dotenv_path, &env);
        if !missing.is_empty() {
            return Err(SourceError::MissingEnvVars {
                names: missing.into_iter().map(|(name, _)| name).collect(),
                dotenv: dotenv_path,
            });
        }

        info!(
            compose = %compose_path.display(),
            services = services.len(),
            selected = selected.len(),
            "resolved compose source"
        );

        Ok(ResolvedSource {
            kind: SourceKind::Compose,
            compose_dir: request.source_dir.clone(),
            container_ports: service_ports_in(&content, PortSide::Container { include_expose: true }),
            host_ports: service_ports_in(&content, PortSide::PublishedHost),
            compose_path,
            services,
            selected,
            generated: false,
        })
    }

    fn resolve_dockerfile(&self, request: &DeploymentRequest) -> Result<ResolvedSource, SourceError> {
        if !request.compose_services.is_empty() {
            return Err(SourceError::SelectionUnsupported);
        }

        let service_key = request.service_key();
        let service_dir = self.paths.service_dir(&service_key);
        let compose_path = self.paths.generated_compose_path(&service_key);

        let content = render_generated_compose(request);
        std::fs::create_dir_all(&service_dir)?;
        std::fs::write(&compose_path, &content)?;

        info!(compose = %compose_path.display(), "wrote generated compose file");

        let mut container_ports = HashMap::new();
        let mut host_ports = HashMap::new();
        if let (Some(host_port), Some(container_port)) = (request.host_port, request.container_port)
        {
            container_ports.insert(service_key.clone(), container_port);
            host_ports.insert(service_key.clone(), host_port);
        }

        Ok(ResolvedSource {
            kind: SourceKind::Dockerfile,
            compose_dir: service_dir,
            compose_path,
            services: vec![service_key.clone()],
            selected: vec![service_key],
            container_ports,
            host_ports,
            generated: true,
        })
    }
}

/// Resolve "empty means all" eagerly and reject unknown selections.
fn resolve_selection(
    requested: &[String],
    available: &[String],
) -> Result<Vec<String>, SourceError> {
    if requested.is_empty() {
        return Ok(available.to_vec());
    }
    // A compose file our scanner cannot read still deploys; the selection is
    // passed through for the compose CLI to validate.
    if available.is_empty() {
        return Ok(requested.to_vec());
    }
    let unknown: Vec<String> = requested
        .iter()
        .filter(|name| !available.iter().any(|s| s == *name))
        .cloned()
        .collect();
    if !unknown.is_empty() {
        let mut sorted = available.to_vec();
        sorted.sort();
        return Err(SourceError::UnknownService {
            unknown,
            available: sorted,
        });
    }
    Ok(requested.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::DeploymentRequest;
    use tempfile::TempDir;

    fn compose_source(content: &str) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("docker-compose.yml"), content).unwrap();
        dir
    }

    fn resolver(base: &TempDir) -> SourceResolver {
        SourceResolver::new(ManagedPaths::with_base_dir(base.path()))
    }

    #[test]
    fn test_auto_prefers_compose() {
        let source = compose_source("services:\n  web:\n    image: nginx\n");
        std::fs::write(source.path().join("Dockerfile"), "FROM nginx\n").unwrap();
        let base = tempfile::tempdir().unwrap();

        let request = DeploymentRequest::new("app", source.path());
        let resolved = resolver(&base).resolve(&request).unwrap();
        assert_eq!(resolved.kind, SourceKind::Compose);
        assert!(!resolved.generated);
        assert_eq!(resolved.services, vec!["web"]);
        assert_eq!(resolved.effective_services(), ["web"]);
    }

    #[test]
    fn test_auto_falls_back_to_dockerfile() {
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("Dockerfile"), "FROM alpine\n").unwrap();
        let base = tempfile::tempdir().unwrap();

        let request = DeploymentRequest::new("app", source.path());
        let resolved = resolver(&base).resolve(&request).unwrap();
        assert_eq!(resolved.kind, SourceKind::Dockerfile);
        assert!(resolved.generated);
        assert!(resolved.compose_path.exists());
        assert_eq!(resolved.selected, vec!["app"]);
    }

    #[test]
    fn test_empty_dir_is_no_source() {
        let source = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();

        let request = DeploymentRequest::new("app", source.path());
        assert!(matches!(
            resolver(&base).resolve(&request),
            Err(SourceError::NoSourceFound(_))
        ));
    }

    #[test]
    fn test_compose_kind_requires_compose_file() {
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("Dockerfile"), "FROM alpine\n").unwrap();
        let base = tempfile::tempdir().unwrap();

        let mut request = DeploymentRequest::new("app", source.path());
        request.source_kind = SourceKind::Compose;
        assert!(matches!(
            resolver(&base).resolve(&request),
            Err(SourceError::ComposeFileMissing(_))
        ));
    }

    #[test]
    fn test_unknown_selection_is_rejected() {
        let source = compose_source("services:\n  web:\n    image: nginx\n  worker:\n    image: busybox\n");
        let base = tempfile::tempdir().unwrap();

        let mut request = DeploymentRequest::new("app", source.path());
        request.compose_services = vec!["web".to_string(), "db".to_string()];
        let err = resolver(&base).resolve(&request).unwrap_err();
        match err {
            SourceError::UnknownService { unknown, available } => {
                assert_eq!(unknown, vec!["db"]);
                assert_eq!(available, vec!["web", "worker"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_selection_resolved_eagerly() {
        let source = compose_source("services:\n  web:\n    image: nginx\n  worker:\n    image: busybox\n");
        let base = tempfile::tempdir().unwrap();

        let request = DeploymentRequest::new("app", source.path());
        let resolved = resolver(&base).resolve(&request).unwrap();
        assert_eq!(resolved.selected, vec!["web", "worker"]);
    }

    #[test]
    fn test_selection_on_dockerfile_source_is_rejected() {
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("Dockerfile"), "FROM alpine\n").unwrap();
        let base = tempfile::tempdir().unwrap();

        let mut request = DeploymentRequest::new("app", source.path());
        request.compose_services = vec!["web".to_string()];
        assert!(matches!(
            resolver(&base).resolve(&request),
            Err(SourceError::SelectionUnsupported)
        ));
    }

    #[test]
    fn test_missing_env_vars_fail_resolution() {
        let source = compose_source(
            "services:\n  web:\n    image: ${SHIPYARD_TEST_UNSET_IMAGE}\n",
        );
        let base = tempfile::tempdir().unwrap();

        let request = DeploymentRequest::new("app", source.path());
        let err = resolver(&base).resolve(&request).unwrap_err();
        match err {
            SourceError::MissingEnvVars { names, .. } => {
                assert_eq!(names, vec!["SHIPYARD_TEST_UNSET_IMAGE"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_generated_compose_is_reproducible() {
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("Dockerfile"), "FROM alpine\n").unwrap();
        let base = tempfile::tempdir().unwrap();

        let mut request = DeploymentRequest::new("app", source.path());
        request.host_port = Some(18080);
        request.container_port = Some(8080);

        let resolver = resolver(&base);
        let first = resolver.resolve(&request).unwrap();
        let first_bytes = std::fs::read(&first.compose_path).unwrap();
        let second = resolver.resolve(&request).unwrap();
        let second_bytes = std::fs::read(&second.compose_path).unwrap();
        assert_eq!(first_bytes, second_bytes);
    }
}
