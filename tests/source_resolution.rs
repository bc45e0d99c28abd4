//! Source resolution properties at the pipeline boundary.

use shipyard::runner::testing::ScriptedRunner;
use shipyard::runtime::testing::StaticProbe;
use shipyard::{
    Deployer, DeploymentRequest, ManagedPaths, SourceError, SourceKind, SourceResolver,
};
use tempfile::TempDir;

fn managed_paths(root: &TempDir) -> ManagedPaths {
    let mut paths = ManagedPaths::with_base_dir(root.path().join("services"));
    paths.docker_config_dir = root.path().join("docker");
    paths.nginx_config_dir = root.path().join("nginx");
    paths.letsencrypt_dir = root.path().join("letsencrypt");
    paths
}

/// An unknown selected service surfaces as a source error before any host
/// command runs.
#[tokio::test]
async fn test_unknown_selection_fails_before_host_mutation() {
    let root = tempfile::tempdir().unwrap();
    let source = tempfile::tempdir().unwrap();
    std::fs::write(
        source.path().join("docker-compose.yml"),
        "services:\n  web:\n    image: acme/web\n  worker:\n    image: acme/worker\n",
    )
    .unwrap();

    let runner = ScriptedRunner::new();
    let probe = StaticProbe::new();
    let paths = managed_paths(&root);
    let deployer = Deployer::new(&runner, &probe, paths.clone());

    let mut request = DeploymentRequest::new("app", source.path());
    request.base_dir = paths.base_dir.clone();
    request.compose_services = vec!["db".to_string()];

    let err = deployer.deploy(request).await.unwrap_err();
    assert_eq!(err.kind(), "source-invalid");
    assert!(err.to_string().contains("db"));
    assert!(runner.calls().is_empty());
}

/// Unset compose interpolation variables fail resolution with the variable
/// names, before any host command runs.
#[tokio::test]
async fn test_missing_interpolation_variables_fail_fast() {
    let root = tempfile::tempdir().unwrap();
    let source = tempfile::tempdir().unwrap();
    std::fs::write(
        source.path().join("docker-compose.yml"),
        "services:\n  web:\n    image: ${SHIPYARD_IT_UNSET_TAG:?required}\n",
    )
    .unwrap();

    let runner = ScriptedRunner::new();
    let probe = StaticProbe::new();
    let paths = managed_paths(&root);
    let deployer = Deployer::new(&runner, &probe, paths.clone());

    let mut request = DeploymentRequest::new("app", source.path());
    request.base_dir = paths.base_dir.clone();

    let err = deployer.deploy(request).await.unwrap_err();
    assert_eq!(err.kind(), "source-invalid");
    assert!(err.to_string().contains("SHIPYARD_IT_UNSET_TAG"));
    assert!(runner.calls().is_empty());
}

/// The generated compose file is a managed artifact: hand edits are
/// overwritten by deterministic regeneration on the next resolve.
#[test]
fn test_generated_file_is_regenerated_not_preserved() {
    let root = tempfile::tempdir().unwrap();
    let source = tempfile::tempdir().unwrap();
    std::fs::write(source.path().join("Dockerfile"), "FROM alpine:3.20\n").unwrap();

    let paths = managed_paths(&root);
    let resolver = SourceResolver::new(paths.clone());

    let mut request = DeploymentRequest::new("app", source.path());
    request.base_dir = paths.base_dir.clone();
    request.source_kind = SourceKind::Dockerfile;
    request.host_port = Some(18080);
    request.container_port = Some(8080);

    let resolved = resolver.resolve(&request).unwrap();
    let pristine = std::fs::read_to_string(&resolved.compose_path).unwrap();

    std::fs::write(&resolved.compose_path, "services: {}  # hand edited\n").unwrap();
    let resolved_again = resolver.resolve(&request).unwrap();
    let regenerated = std::fs::read_to_string(&resolved_again.compose_path).unwrap();

    assert_eq!(pristine, regenerated);
}

/// Dockerfile sources reject compose service selection.
#[test]
fn test_selection_rejected_for_dockerfile_sources() {
    let root = tempfile::tempdir().unwrap();
    let source = tempfile::tempdir().unwrap();
    std::fs::write(source.path().join("Dockerfile"), "FROM alpine:3.20\n").unwrap();

    let paths = managed_paths(&root);
    let resolver = SourceResolver::new(paths);

    let mut request = DeploymentRequest::new("app", source.path());
    request.compose_services = vec!["web".to_string()];

    assert!(matches!(
        resolver.resolve(&request),
        Err(SourceError::SelectionUnsupported)
    ));
}
