//! nginx configuration rendering.
//!
//! Both the managed container proxy and the host site file are rendered
//! from the same [`IngressPlan`]: one server block per route host, longest
//! path prefixes first, with an optional bearer-token guard on every
//! proxied location (never on the ACME challenge path). Rendering is
//! deterministic: identical plans produce identical bytes, which is what
//! lets apply decide "config changed, reload" by comparison.

use crate::ingress::{CERTBOT_IMAGE, IngressPlan, NGINX_PROXY_IMAGE};
use crate::paths::ManagedPaths;
use crate::request::ProxyRoute;
use std::fmt::Write as _;

/// Where a rendered configuration will run.
#[derive(Debug, Clone)]
pub enum RenderTarget {
    /// The managed nginx container; upstreams are compose service names.
    Managed,
    /// The host nginx; the ACME webroot lives at this host path.
    HostSite { webroot: std::path::PathBuf },
}

impl RenderTarget {
    fn acme_root(&self) -> String {
        match self {
            RenderTarget::Managed => "/var/www/certbot".to_string(),
            RenderTarget::HostSite { webroot } => webroot.display().to_string(),
        }
    }
}

fn routes_by_host(routes: &[ProxyRoute]) -> Vec<(String, Vec<&ProxyRoute>)> {
    let mut grouped: Vec<(String, Vec<&ProxyRoute>)> = Vec::new();
    for route in routes {
        match grouped.iter_mut().find(|(host, _)| host == &route.host) {
            Some((_, entries)) => entries.push(route),
            None => grouped.push((route.host.clone(), vec![route])),
        }
    }
    for (_, entries) in &mut grouped {
        entries.sort_by(|a, b| {
            b.path_prefix
                .len()
                .cmp(&a.path_prefix.len())
                .then_with(|| a.path_prefix.cmp(&b.path_prefix))
        });
    }
    grouped
}

fn push_auth_guard(out: &mut String, token: &str) {
    let _ = writeln!(out, "        if ($http_authorization != \"Bearer {token}\") {{");
    let _ = writeln!(out, "            return 401;");
    let _ = writeln!(out, "        }}");
}

fn push_proxy_location(out: &mut String, route: &ProxyRoute, auth_token: Option<&str>) {
    if route.path_prefix == "/" {
        let _ = writeln!(out, "    location / {{");
    } else {
        let _ = writeln!(out, "    location {}/ {{", route.path_prefix);
    }
    if let Some(token) = auth_token {
        push_auth_guard(out, token);
    }
    if route.path_prefix == "/" {
        let _ = writeln!(
            out,
            "        proxy_pass http://{}:{};",
            route.upstream_host, route.upstream_port
        );
    } else {
        // A URI part makes nginx strip the matched prefix.
        let _ = writeln!(
            out,
            "        proxy_pass http://{}:{}/;",
            route.upstream_host, route.upstream_port
        );
    }
    let _ = writeln!(out, "        proxy_set_header Host $host;");
    let _ = writeln!(out, "        proxy_set_header X-Real-IP $remote_addr;");
    let _ = writeln!(
        out,
        "        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;"
    );
    let _ = writeln!(out, "        proxy_set_header X-Forwarded-Proto $scheme;");
    let _ = writeln!(out, "    }}");
}

fn push_acme_location(out: &mut String, target: &RenderTarget) {
    let _ = writeln!(out, "    location /.well-known/acme-challenge/ {{");
    let _ = writeln!(out, "        root {};", target.acme_root());
    let _ = writeln!(out, "    }}");
}

fn push_server_name(out: &mut String, host: &str) {
    if host == "_" {
        let _ = writeln!(out, "    listen 80 default_server;");
        let _ = writeln!(out, "    server_name _;");
    } else {
        let _ = writeln!(out, "    listen 80;");
        let _ = writeln!(out, "    server_name {host};");
    }
}

/// Render the server configuration for a plan.
///
/// With `tls_active` false the proxied locations answer over plain HTTP
/// (and, when TLS is planned, serve the ACME challenge path so issuance can
/// succeed). With `tls_active` true port 80 only serves challenges and
/// redirects, and the proxied locations move behind TLS termination.
pub fn render_server_config(plan: &IngressPlan, target: &RenderTarget, tls_active: bool) -> String {
    let mut out = String::new();
    let auth_token = plan.auth_token.as_deref();
    let cert_base = plan
        .tls
        .as_ref()
        .map(|tls| format!("/etc/letsencrypt/live/{}", tls.primary_domain));

    for (host, routes) in routes_by_host(&plan.routes) {
        let _ = writeln!(out, "server {{");
        push_server_name(&mut out, &host);
        if plan.tls.is_some() {
            push_acme_location(&mut out, target);
        }
        if tls_active {
            let _ = writeln!(out, "    location / {{");
            let _ = writeln!(out, "        return 301 https://$host$request_uri;");
            let _ = writeln!(out, "    }}");
        } else {
            for route in &routes {
                push_proxy_location(&mut out, route, auth_token);
            }
        }
        let _ = writeln!(out, "}}");

        if tls_active {
            let cert_base = cert_base.as_deref().expect("tls_active implies tls plan");
            let _ = writeln!(out, "server {{");
            let _ = writeln!(out, "    listen 443 ssl;");
            let _ = writeln!(out, "    server_name {host};");
            let _ = writeln!(out, "    ssl_certificate {cert_base}/fullchain.pem;");
            let _ = writeln!(out, "    ssl_certificate_key {cert_base}/privkey.pem;");
            for route in &routes {
                push_proxy_location(&mut out, route, auth_token);
            }
            let _ = writeln!(out, "}}");
        }
    }

    out
}

/// Render the compose overlay running the managed proxy containers.
///
/// The overlay shares the app project's name, so compose attaches the proxy
/// to the same default network and service names resolve as upstreams.
pub fn render_proxy_compose(plan: &IngressPlan, paths: &ManagedPaths, service_key: &str) -> String {
    let nginx_dir = paths
        .managed_nginx_conf_path(service_key)
        .parent()
        .expect("conf file has a parent")
        .to_path_buf();
    let webroot = paths.certbot_webroot_path(service_key);
    let state = paths.certbot_state_path(service_key);

    let mut out = String::new();
    let _ = writeln!(out, "services:");
    let _ = writeln!(out, "  ingress:");
    let _ = writeln!(out, "    image: {NGINX_PROXY_IMAGE}");
    let _ = writeln!(out, "    container_name: {service_key}-ingress");
    let _ = writeln!(out, "    restart: unless-stopped");
    let _ = writeln!(out, "    ports:");
    let _ = writeln!(out, "      - \"{}:{}:80\"", plan.bind_host, plan.http_port);
    if let Some(https_port) = plan.https_port {
        let _ = writeln!(out, "      - \"{}:{}:443\"", plan.bind_host, https_port);
    }
    let _ = writeln!(out, "    volumes:");
    let _ = writeln!(out, "      - {}:/etc/nginx/conf.d:ro", nginx_dir.display());
    let _ = writeln!(out, "      - {}:/var/www/certbot", webroot.display());
    if plan.tls.is_some() {
        let _ = writeln!(out, "      - {}:/etc/letsencrypt:ro", state.display());
        let _ = writeln!(out, "  certbot:");
        let _ = writeln!(out, "    image: {CERTBOT_IMAGE}");
        let _ = writeln!(out, "    profiles:");
        let _ = writeln!(out, "      - certbot");
        let _ = writeln!(out, "    volumes:");
        let _ = writeln!(out, "      - {}:/etc/letsencrypt", state.display());
        let _ = writeln!(out, "      - {}:/var/www/certbot", webroot.display());
    }
    out
}
