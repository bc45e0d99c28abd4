//! Docker daemon network tuning for flaky registry connections.
//!
//! Serializing image pulls and providing fallback DNS keeps `docker compose
//! pull/build` alive on hosts behind lossy networks. The merge is strictly
//! additive: existing keys survive, existing DNS configuration is never
//! replaced, and the daemon restarts only when the merged document actually
//! differs from what is on disk.

use crate::bootstrap::BootstrapError;
use crate::paths::ManagedPaths;
use crate::runner::{CommandRunner, HostCommand};
use serde_json::{Value, json};
use tracing::{debug, info};

/// Registry concurrency applied to the daemon.
pub const MAX_CONCURRENT_TRANSFERS: u64 = 1;

/// DNS servers added only when the daemon has none configured.
pub const FALLBACK_DNS: [&str; 2] = ["1.1.1.1", "8.8.8.8"];

/// Merge the tuning settings into an existing daemon configuration.
///
/// Returns the merged document and whether it differs from `current`.
pub fn merged_daemon_config(current: &Value) -> (Value, bool) {
    let mut merged = if current.is_object() {
        current.clone()
    } else {
        json!({})
    };
    let object = merged.as_object_mut().expect("merged is an object");

    object.insert(
        "max-concurrent-downloads".to_string(),
        json!(MAX_CONCURRENT_TRANSFERS),
    );
    object.insert(
        "max-concurrent-uploads".to_string(),
        json!(MAX_CONCURRENT_TRANSFERS),
    );

    let has_dns = object
        .get("dns")
        .and_then(Value::as_array)
        .map(|servers| !servers.is_empty())
        .unwrap_or(false);
    if !has_dns {
        object.insert("dns".to_string(), json!(FALLBACK_DNS));
    }

    let changed = merged != *current;
    (merged, changed)
}

/// Read the current daemon configuration, treating a missing or unreadable
/// file as empty rather than blocking the deployment.
pub fn read_daemon_config(paths: &ManagedPaths) -> Value {
    let path = paths.daemon_config_path();
    match std::fs::read_to_string(&path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            debug!("unparseable daemon config at {}: {e}", path.display());
            json!({})
        }),
        Err(_) => json!({}),
    }
}

/// Apply registry-hardening settings to the daemon configuration.
///
/// Returns whether the daemon was restarted.
///
/// # Errors
///
/// Returns [`BootstrapError`] when the configuration cannot be written or
/// the daemon restart fails.
pub async fn ensure_daemon_tuning(
    runner: &dyn CommandRunner,
    paths: &ManagedPaths,
) -> Result<bool, BootstrapError> {
    let current = read_daemon_config(paths);
    let (merged, changed) = merged_daemon_config(&current);
    if !changed {
        debug!("daemon configuration already tuned");
        return Ok(false);
    }

    let path = paths.daemon_config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if path.exists() {
        let backup = paths.daemon_config_backup_path();
        std::fs::copy(&path, &backup)?;
        info!("backed up daemon config to {}", backup.display());
    }

    let mut rendered = serde_json::to_string_pretty(&merged)
        .map_err(|e| BootstrapError::step("daemon tuning", &e.to_string()))?;
    rendered.push('\n');
    std::fs::write(&path, rendered)?;
    info!("updated {} with registry retry hardening", path.display());

    let output = runner
        .run(HostCommand::new("systemctl", ["restart", "docker"]))
        .await?;
    if !output.success() {
        return Err(BootstrapError::step(
            "daemon tuning",
            &format!("docker restart failed: {}", output.combined()),
        ));
    }
    Ok(true)
}
