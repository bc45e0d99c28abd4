//! End-to-end deployment flows against scripted host doubles.
//!
//! These tests drive the full orchestrator pipeline (resolve, plan,
//! bootstrap, execute, ingress) with a scripted command runner and a
//! static runtime probe, so no Docker daemon or root privileges are needed.

use shipyard::runner::testing::ScriptedRunner;
use shipyard::runtime::testing::StaticProbe;
use shipyard::{
    AccessMode, DeployStatus, Deployer, DeploymentRequest, IngressMode, ManagedPaths, SourceKind,
};
use std::path::Path;
use tempfile::TempDir;

struct Host {
    _root: TempDir,
    paths: ManagedPaths,
}

fn host() -> Host {
    let root = tempfile::tempdir().unwrap();
    let mut paths = ManagedPaths::with_base_dir(root.path().join("services"));
    paths.docker_config_dir = root.path().join("docker");
    paths.nginx_config_dir = root.path().join("nginx");
    paths.letsencrypt_dir = root.path().join("letsencrypt");
    Host { _root: root, paths }
}

fn dockerfile_source() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("Dockerfile"),
        "FROM alpine:3.20\nCMD [\"sleep\", \"infinity\"]\n",
    )
    .unwrap();
    dir
}

fn compose_source(content: &str) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("docker-compose.yml"), content).unwrap();
    dir
}

fn request_for(host: &Host, name: &str, source: &Path) -> DeploymentRequest {
    let mut request = DeploymentRequest::new(name, source);
    request.base_dir = host.paths.base_dir.clone();
    request
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Dockerfile source on the tailnet: a generated compose file binds the
/// requested ports, tailscale join is verified, and no proxy is planned.
#[tokio::test]
async fn test_dockerfile_tailscale_deployment() {
    let host = host();
    let source = dockerfile_source();
    let host_port = free_port();

    let runner = ScriptedRunner::new();
    let probe = StaticProbe::new();
    let deployer = Deployer::new(&runner, &probe, host.paths.clone());

    let mut request = request_for(&host, "my-api", source.path());
    request.source_kind = SourceKind::Dockerfile;
    request.host_port = Some(host_port);
    request.container_port = Some(8080);
    request.access_mode = AccessMode::Tailscale;

    let result = deployer.deploy(request).await.unwrap();

    assert_eq!(result.status, DeployStatus::Deployed);
    assert!(result.ingress.is_none());

    let generated = host.paths.generated_compose_path("my-api");
    assert_eq!(result.compose_path, generated);
    let content = std::fs::read_to_string(&generated).unwrap();
    assert!(content.contains(&format!("- \"127.0.0.1:{host_port}:8080\"")));

    // The tailnet membership was checked (and needed no join).
    assert_eq!(runner.calls_matching("tailscale status").len(), 1);
    assert!(runner.calls_matching("tailscale up").is_empty());
    // The compose apply ran under the service-name scope.
    assert_eq!(runner.calls_matching("compose -p my-api").len(), 1);
}

/// Compose source with two services, one selected, public TLS: a default
/// route to the selected service is derived, certificates are issued, and
/// the managed proxy comes up with TLS termination.
#[tokio::test]
async fn test_compose_public_tls_deployment() {
    let host = host();
    let source = compose_source(
        "services:\n  web:\n    image: acme/web\n    expose:\n      - \"8080\"\n  worker:\n    image: acme/worker\n",
    );

    let runner = ScriptedRunner::new();
    let probe = StaticProbe::with_running(["web"]);
    let deployer = Deployer::new(&runner, &probe, host.paths.clone());

    let mut request = request_for(&host, "acme", source.path());
    request.compose_services = vec!["web".to_string()];
    request.access_mode = AccessMode::Public;
    request.domain = Some("api.example.com".to_string());
    request.certbot_email = Some("ops@example.com".to_string());
    request.proxy_upstream_port = Some(8080);

    let result = deployer.deploy(request).await.unwrap();

    assert_eq!(result.status, DeployStatus::Deployed);
    let ingress = result.ingress.as_ref().unwrap();
    assert!(ingress.tls_active);
    assert_eq!(ingress.routes, vec!["api.example.com/->web:8080"]);
    assert_eq!(ingress.https_port, Some(443));

    // Certificate issuance ran HTTP-01 through the managed proxy scope.
    assert_eq!(runner.calls_matching("certonly").len(), 1);
    assert_eq!(runner.calls_matching("-d api.example.com").len(), 1);

    // Only the selected service was named in the apply.
    let applies: Vec<String> = runner
        .calls_matching("up -d --build")
        .into_iter()
        .filter(|c| c.contains("-p acme"))
        .collect();
    assert_eq!(applies.len(), 1);
    assert!(applies[0].ends_with("up -d --build web"));

    let conf =
        std::fs::read_to_string(host.paths.managed_nginx_conf_path("acme")).unwrap();
    assert!(conf.contains("listen 443 ssl;"));
    assert!(conf.contains("server_name api.example.com;"));
}

/// Certificate issuance failure leaves the deployment running and
/// reachable over HTTP, reported as degraded rather than failed.
#[tokio::test]
async fn test_certificate_failure_degrades() {
    let host = host();
    let source = compose_source(
        "services:\n  web:\n    image: acme/web\n    expose:\n      - \"8080\"\n",
    );

    let runner = ScriptedRunner::new().respond(
        "certonly",
        shipyard::CommandOutput::failed(1, "Challenge failed for domain api.example.com"),
    );
    let probe = StaticProbe::with_running(["web"]);
    let deployer = Deployer::new(&runner, &probe, host.paths.clone());

    let mut request = request_for(&host, "acme", source.path());
    request.access_mode = AccessMode::Public;
    request.domain = Some("api.example.com".to_string());
    request.certbot_email = Some("ops@example.com".to_string());

    let result = deployer.deploy(request).await.unwrap();

    match &result.status {
        DeployStatus::Degraded { reason } => {
            assert!(reason.contains("certificate issuance failed"));
        }
        other => panic!("expected degraded status, got {other:?}"),
    }
    let ingress = result.ingress.as_ref().unwrap();
    assert!(!ingress.tls_active);
    let conf = std::fs::read_to_string(host.paths.managed_nginx_conf_path("acme")).unwrap();
    assert!(!conf.contains("listen 443"));
}

/// Deploying the same request twice converges: identical generated
/// artifacts, no duplicate routes, success both times.
#[tokio::test]
async fn test_deploy_twice_is_idempotent() {
    let host = host();
    let source = dockerfile_source();

    let runner = ScriptedRunner::new();
    // The scope reports its container as running after the first apply.
    let probe = StaticProbe::with_running(["my-api"]);
    let deployer = Deployer::new(&runner, &probe, host.paths.clone());

    let mut request = request_for(&host, "my-api", source.path());
    request.source_kind = SourceKind::Dockerfile;
    request.host_port = Some(free_port());
    request.container_port = Some(8080);
    request.auth_token = Some("sq-test-token-1".to_string());

    let first = deployer.deploy(request.clone()).await.unwrap();
    let first_compose = std::fs::read(&first.compose_path).unwrap();
    let first_conf =
        std::fs::read_to_string(host.paths.managed_nginx_conf_path("my-api")).unwrap();

    let second = deployer.deploy(request).await.unwrap();
    let second_compose = std::fs::read(&second.compose_path).unwrap();
    let second_conf =
        std::fs::read_to_string(host.paths.managed_nginx_conf_path("my-api")).unwrap();

    assert_eq!(first.status, DeployStatus::Deployed);
    assert_eq!(second.status, DeployStatus::Deployed);
    assert_eq!(first_compose, second_compose);
    assert_eq!(first_conf, second_conf);
    // One route, both runs.
    assert_eq!(first.ingress.as_ref().unwrap().routes.len(), 1);
    assert_eq!(second.ingress.as_ref().unwrap().routes.len(), 1);
    // The unchanged proxy config was reloaded once, not twice.
    assert_eq!(runner.calls_matching("nginx -s reload").len(), 1);
}

/// Deployments under different service names never touch each other's
/// artifacts.
#[tokio::test]
async fn test_service_names_are_isolated() {
    let host = host();
    let source_a = dockerfile_source();
    let source_b = dockerfile_source();

    let runner = ScriptedRunner::new();
    let probe = StaticProbe::with_running(["svc"]);
    let deployer = Deployer::new(&runner, &probe, host.paths.clone());

    let mut request_a = request_for(&host, "svc-a", source_a.path());
    request_a.source_kind = SourceKind::Dockerfile;
    let mut request_b = request_for(&host, "svc-b", source_b.path());
    request_b.source_kind = SourceKind::Dockerfile;

    let result_a = deployer.deploy(request_a).await.unwrap();
    let a_bytes = std::fs::read(&result_a.compose_path).unwrap();

    let result_b = deployer.deploy(request_b).await.unwrap();
    let a_bytes_after = std::fs::read(&result_a.compose_path).unwrap();

    assert_ne!(result_a.compose_path, result_b.compose_path);
    assert_eq!(a_bytes, a_bytes_after);
    assert!(result_a.compose_path.starts_with(host.paths.service_dir("svc-a")));
    assert!(result_b.compose_path.starts_with(host.paths.service_dir("svc-b")));
}

/// Existing daemon DNS configuration survives bootstrap tuning; only the
/// concurrency settings are merged in.
#[tokio::test]
async fn test_daemon_tuning_preserves_custom_dns() {
    let host = host();
    let source = dockerfile_source();
    std::fs::create_dir_all(&host.paths.docker_config_dir).unwrap();
    std::fs::write(
        host.paths.daemon_config_path(),
        "{\"dns\": [\"10.0.0.53\"]}\n",
    )
    .unwrap();

    let runner = ScriptedRunner::new();
    let probe = StaticProbe::with_running(["my-api"]);
    let deployer = Deployer::new(&runner, &probe, host.paths.clone());

    let mut request = request_for(&host, "my-api", source.path());
    request.source_kind = SourceKind::Dockerfile;
    deployer.deploy(request).await.unwrap();

    let daemon: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(host.paths.daemon_config_path()).unwrap(),
    )
    .unwrap();
    assert_eq!(daemon["dns"], serde_json::json!(["10.0.0.53"]));
    assert_eq!(daemon["max-concurrent-downloads"], serde_json::json!(1));
    assert_eq!(daemon["max-concurrent-uploads"], serde_json::json!(1));
}

/// Two routes on the same host with different paths coexist in one
/// deployment.
#[tokio::test]
async fn test_two_paths_one_host() {
    let host = host();
    let source = compose_source(
        "services:\n  web:\n    image: acme/web\n  worker:\n    image: acme/worker\n",
    );

    let runner = ScriptedRunner::new();
    let probe = StaticProbe::with_running(["web", "worker"]);
    let deployer = Deployer::new(&runner, &probe, host.paths.clone());

    let mut request = request_for(&host, "acme", source.path());
    request.access_mode = AccessMode::Public;
    request.domain = Some("apps.example.com".to_string());
    request.certbot_email = Some("ops@example.com".to_string());
    request.proxy_routes = vec![
        shipyard::ProxyRoute::parse("apps.example.com/a=web:8080").unwrap(),
        shipyard::ProxyRoute::parse("apps.example.com/b=worker:9000").unwrap(),
    ];

    let result = deployer.deploy(request).await.unwrap();

    let ingress = result.ingress.as_ref().unwrap();
    assert_eq!(ingress.routes.len(), 2);
    let conf = std::fs::read_to_string(host.paths.managed_nginx_conf_path("acme")).unwrap();
    assert!(conf.contains("location /a/ {"));
    assert!(conf.contains("location /b/ {"));
}

/// The ingress mode dispatches to the host proxy without ever stopping it
/// in external-nginx mode.
#[tokio::test]
async fn test_external_nginx_mode_never_stops_host_proxy() {
    let host = host();
    let source = dockerfile_source();
    let host_port = free_port();

    let runner = ScriptedRunner::new();
    let probe = StaticProbe::with_running(["my-api"]);
    let deployer = Deployer::new(&runner, &probe, host.paths.clone());

    let mut request = request_for(&host, "my-api", source.path());
    request.source_kind = SourceKind::Dockerfile;
    request.host_port = Some(host_port);
    request.container_port = Some(8080);
    request.access_mode = AccessMode::Public;
    request.ingress_mode = IngressMode::ExternalNginx;
    request.domain = Some("api.example.com".to_string());
    request.certbot_email = Some("ops@example.com".to_string());

    let result = deployer.deploy(request).await.unwrap();

    assert_eq!(result.status, DeployStatus::Deployed);
    assert!(host.paths.host_site_available_path("my-api").exists());
    assert!(runner.calls_matching("systemctl stop nginx").is_empty());
    assert!(!runner.calls_matching("systemctl reload nginx").is_empty());

    let ingress = result.ingress.as_ref().unwrap();
    assert_eq!(
        ingress.routes,
        vec![format!("api.example.com/->127.0.0.1:{host_port}")]
    );
}
