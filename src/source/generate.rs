//! Generated compose definition for Dockerfile-backed sources.
//!
//! The rendered file is a managed artifact: fully owned by this tool,
//! regenerated on every run, and byte-for-byte identical for identical
//! requests so reruns can be diffed and converge trivially.

use crate::request::DeploymentRequest;

/// Render the single-service compose definition for a Dockerfile source.
pub fn render_generated_compose(request: &DeploymentRequest) -> String {
    let service_key = request.service_key();
    let mut content = String::new();

    content.push_str("services:\n");
    content.push_str(&format!("  {service_key}:\n"));
    content.push_str("    build:\n");
    content.push_str(&format!("      context: {}\n", request.source_dir.display()));
    content.push_str("      dockerfile: Dockerfile\n");
    content.push_str(&format!("    image: {service_key}:local\n"));
    content.push_str(&format!("    container_name: {service_key}\n"));
    content.push_str("    restart: unless-stopped\n");

    if let (Some(host_port), Some(container_port)) = (request.host_port, request.container_port) {
        content.push_str("    ports:\n");
        content.push_str(&format!(
            "      - \"{}:{host_port}:{container_port}\"\n",
            request.effective_bind_host()
        ));
    }

    content
}
