//! Best-effort compose file introspection.
//!
//! Deployment only needs three facts from a compose file: the service
//! names, the first port each service listens on, and which interpolation
//! variables require user-provided values. A full YAML dependency is not
//! worth carrying for that, so these scanners walk indentation the same way
//! the compose CLI's own error messages describe the file: a top-level
//! `services:` mapping with one child key per service.

use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Compose file names probed in order.
pub const COMPOSE_FILE_CANDIDATES: [&str; 4] = [
    "docker-compose.yml",
    "docker-compose.yaml",
    "compose.yml",
    "compose.yaml",
];

static MAPPING_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(\s*)(?:"([^"]+)"|'([^']+)'|([A-Za-z0-9_.-]+))\s*:\s*(?:$|#)"#).unwrap()
});
static SERVICES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\s*)services\s*:\s*(?:$|#)").unwrap());
static SECTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(ports|expose)\s*:\s*(?:$|#)").unwrap());
static ENV_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*").unwrap());
static BRACED_ENV_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)(:?[-+?])?").unwrap());
static ENV_VAR_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Locate the compose file inside a source directory.
pub fn find_compose_file(source_dir: &Path) -> Option<PathBuf> {
    for name in COMPOSE_FILE_CANDIDATES {
        let path = source_dir.join(name);
        if path.is_file() {
            return Some(path);
        }
    }
    None
}

fn mapping_key(line: &str) -> Option<(usize, String)> {
    let caps = MAPPING_KEY_RE.captures(line)?;
    let indent = caps.get(1).map(|m| m.as_str().len()).unwrap_or(0);
    let name = caps
        .get(2)
        .or_else(|| caps.get(3))
        .or_else(|| caps.get(4))
        .map(|m| m.as_str().to_string())?;
    Some((indent, name))
}

fn line_indent(line: &str) -> usize {
    line.len() - line.trim_start_matches(' ').len()
}

fn is_blank_or_comment(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with('#')
}

/// Top-level `services:` keys, first-seen order, duplicates dropped.
pub fn services_in(content: &str) -> Vec<String> {
    let mut services_indent: Option<usize> = None;
    let mut child_indent: Option<usize> = None;
    let mut names: Vec<String> = Vec::new();

    for raw_line in content.lines() {
        if is_blank_or_comment(raw_line) {
            continue;
        }

        let Some(section_indent) = services_indent else {
            if let Some(caps) = SERVICES_RE.captures(raw_line) {
                services_indent = Some(caps.get(1).map(|m| m.as_str().len()).unwrap_or(0));
            }
            continue;
        };

        if line_indent(raw_line) <= section_indent {
            break;
        }

        let Some((key_indent, name)) = mapping_key(raw_line) else {
            continue;
        };
        let expected = *child_indent.get_or_insert(key_indent);
        if key_indent != expected {
            continue;
        }
        if !names.iter().any(|n| n == &name) {
            names.push(name);
        }
    }

    names
}

/// Which side of a `ports:` mapping a scan should report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSide {
    /// Container-side port from `ports:` entries and optionally `expose:`.
    Container { include_expose: bool },
    /// Published host-side port from `ports:` entries only.
    PublishedHost,
}

fn parse_port(raw: &str) -> Option<u16> {
    let raw = raw.trim();
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: u32 = raw.parse().ok()?;
    if (1..=65535).contains(&value) {
        Some(value as u16)
    } else {
        None
    }
}

/// Split a compose port token into `(host_port, container_port)`.
///
/// Handles `8080`, `80:8080`, `127.0.0.1:80:8080` and `/protocol` suffixes.
fn parse_port_mapping(token: &str) -> (Option<u16>, Option<u16>) {
    let text = token.trim().trim_matches(|c| c == '"' || c == '\'');
    let text = text.split('/').next().unwrap_or("").trim();
    if text.is_empty() {
        return (None, None);
    }
    let parts: Vec<&str> = text.split(':').map(str::trim).collect();
    match parts.len() {
        1 => (None, parse_port(parts[0])),
        2 => (parse_port(parts[0]), parse_port(parts[1])),
        n => (parse_port(parts[n - 2]), parse_port(parts[n - 1])),
    }
}

/// Extract the value of a `- item` list line, stripping quotes and comments.
fn list_item_value(line: &str) -> Option<String> {
    let rest = line.trim_start().strip_prefix('-')?.trim_start();
    if let Some(inner) = rest.strip_prefix('"') {
        return inner.split('"').next().map(str::to_string);
    }
    if let Some(inner) = rest.strip_prefix('\'') {
        return inner.split('\'').next().map(str::to_string);
    }
    let value = rest.split('#').next().unwrap_or("").trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// First relevant port per service, scanning `ports:`/`expose:` sections.
pub fn service_ports_in(content: &str, side: PortSide) -> HashMap<String, u16> {
    let mut ports: HashMap<String, u16> = HashMap::new();
    let mut services_indent: Option<usize> = None;
    let mut service_indent: Option<usize> = None;
    let mut current_service: Option<(String, usize)> = None;
    let mut section: Option<(bool, usize)> = None; // (is_expose, indent)

    for raw_line in content.lines() {
        if is_blank_or_comment(raw_line) {
            continue;
        }

        let Some(top_indent) = services_indent else {
            if let Some(caps) = SERVICES_RE.captures(raw_line) {
                services_indent = Some(caps.get(1).map(|m| m.as_str().len()).unwrap_or(0));
            }
            continue;
        };

        let indent = line_indent(raw_line);
        if indent <= top_indent {
            break;
        }

        if let Some((key_indent, name)) = mapping_key(raw_line) {
            let expected = *service_indent.get_or_insert(key_indent);
            if key_indent == expected {
                current_service = Some((name, key_indent));
                section = None;
                continue;
            }
        }

        let Some((service, svc_indent)) = current_service.clone() else {
            continue;
        };
        if indent <= svc_indent {
            current_service = None;
            section = None;
            continue;
        }

        if let Some(caps) = SECTION_RE.captures(raw_line) {
            let is_expose = caps.get(1).map(|m| m.as_str()) == Some("expose");
            section = Some((is_expose, indent));
            continue;
        }

        if let Some((_, sec_indent)) = section {
            if indent <= sec_indent {
                section = None;
            }
        }

        let Some((is_expose, sec_indent)) = section else {
            continue;
        };
        if indent <= sec_indent {
            continue;
        }
        match side {
            PortSide::Container { include_expose } => {
                if is_expose && !include_expose {
                    continue;
                }
            }
            PortSide::PublishedHost => {
                if is_expose {
                    continue;
                }
            }
        }
        if ports.contains_key(&service) {
            continue;
        }
        let Some(item) = list_item_value(raw_line) else {
            continue;
        };
        let (host_port, container_port) = parse_port_mapping(&item);
        let wanted = match side {
            PortSide::Container { .. } => container_port,
            PortSide::PublishedHost => host_port,
        };
        if let Some(port) = wanted {
            ports.insert(service.clone(), port);
        }
    }

    ports
}

/// Interpolation variables that require a user-provided value.
///
/// Returns `(NAME, require_non_empty)` pairs in first-seen order. Variables
/// with defaults or alternatives (`${VAR-d}`, `${VAR:-d}`, `${VAR+x}`,
/// `${VAR:+x}`) need nothing; `${VAR:?err}` additionally rejects empty
/// values; `$$` is a literal dollar.
pub fn required_env_vars(content: &str) -> Vec<(String, bool)> {
    let mut order: Vec<String> = Vec::new();
    let mut levels: HashMap<String, u8> = HashMap::new();

    let mut merge = |name: &str, level: u8| {
        if !ENV_VAR_NAME_RE.is_match(name) {
            return;
        }
        match levels.get_mut(name) {
            Some(existing) => *existing = (*existing).max(level),
            None => {
                order.push(name.to_string());
                levels.insert(name.to_string(), level);
            }
        }
    };

    let bytes = content.as_bytes();
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] != b'$' {
            idx += 1;
            continue;
        }
        if idx + 1 >= bytes.len() {
            break;
        }
        match bytes[idx + 1] {
            b'$' => idx += 2,
            b'{' => {
                let Some(end) = content[idx + 2..].find('}') else {
                    idx += 1;
                    continue;
                };
                let expr = content[idx + 2..idx + 2 + end].trim();
                if let Some(caps) = BRACED_ENV_RE.captures(expr) {
                    let name = caps.get(1).map(|m| m.as_str()).unwrap_or("");
                    match caps.get(2).map(|m| m.as_str()) {
                        Some("-") | Some(":-") | Some("+") | Some(":+") => {}
                        Some(":?") => merge(name, 2),
                        _ => merge(name, 1),
                    }
                }
                idx += 2 + end + 1;
            }
            _ => {
                if let Some(m) = ENV_NAME_RE.find(&content[idx + 1..]) {
                    merge(m.as_str(), 1);
                    idx += 1 + m.len();
                } else {
                    idx += 1;
                }
            }
        }
    }

    order
        .into_iter()
        .map(|name| {
            let strict = levels.get(&name).copied().unwrap_or(1) >= 2;
            (name, strict)
        })
        .collect()
}

/// Read `KEY=VALUE` entries from a `.env`-style file.
///
/// Missing file yields an empty map; `export ` prefixes and matching
/// surrounding quotes are stripped.
pub fn read_dotenv(dotenv_path: &Path) -> HashMap<String, String> {
    let Ok(content) = std::fs::read_to_string(dotenv_path) else {
        return HashMap::new();
    };

    let mut values = HashMap::new();
    for raw in content.lines() {
        let mut line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("export ") {
            line = rest.trim();
        }
        let Some((key_raw, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key_raw.trim();
        if !ENV_VAR_NAME_RE.is_match(key) {
            continue;
        }
        let mut value = value_raw.trim();
        if value.len() >= 2 {
            let first = value.chars().next().unwrap();
            if (first == '"' || first == '\'') && value.ends_with(first) {
                value = &value[1..value.len() - 1];
            }
        }
        values.insert(key.to_string(), value.to_string());
    }
    values
}

/// Required interpolation variables that are unset or empty after merging
/// `.env` values under `env`.
pub fn missing_env_vars(
    content: &str,
    dotenv_path: &Path,
    env: &HashMap<String, String>,
) -> Vec<(String, bool)> {
    let required = required_env_vars(content);
    if required.is_empty() {
        return Vec::new();
    }

    let mut merged = read_dotenv(dotenv_path);
    for (key, value) in env {
        merged.insert(key.clone(), value.clone());
    }

    required
        .into_iter()
        .filter(|(name, _)| merged.get(name).map(String::as_str).unwrap_or("").is_empty())
        .collect()
}
