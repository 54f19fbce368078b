//! Deployment environment assembly: config env, derived values, secrets,
//! the rendered env file, and the path guard for path-like variables.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use std::collections::BTreeMap;

use crate::builder::Runtime;
use crate::config::EnvValue;
use crate::db::{AppRow, DomainRow, Repository};
use crate::error::Result;
use crate::transport::sh_quote;

/// Merge env sources in precedence order; later sources win.
///
/// Order: static config env, then the derived PHX_HOST, then secrets.
pub fn merge_env(
    static_env: &BTreeMap<String, EnvValue>,
    domains: &[DomainRow],
    secrets: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged: BTreeMap<String, String> = static_env
        .iter()
        .map(|(key, value)| (key.clone(), value.render()))
        .collect();
    if !domains.is_empty() {
        let hosts: Vec<&str> = domains.iter().map(|domain| domain.hostname.as_str()).collect();
        merged.insert("PHX_HOST".to_string(), hosts.join(","));
    }
    for (key, value) in secrets {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Phoenix releases refuse to boot without SECRET_KEY_BASE; generate and
/// persist one the first time an app deploys without it.
pub fn ensure_secret_key_base(
    env: &mut BTreeMap<String, String>,
    runtime: Runtime,
    repo: &Repository,
    app: &AppRow,
) -> Result<bool> {
    if runtime != Runtime::Phoenix || env.contains_key("SECRET_KEY_BASE") {
        return Ok(false);
    }
    let mut bytes = [0u8; 64];
    rand::thread_rng().fill_bytes(&mut bytes);
    let value = BASE64.encode(bytes);
    repo.set_secret(&app.id, "SECRET_KEY_BASE", &value)?;
    env.insert("SECRET_KEY_BASE".to_string(), value);
    Ok(true)
}

/// Render the final env file as KEY=VALUE lines.
pub fn render(env: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in env {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    out
}

/// Command that installs the env file at `/etc/{app}/env`, owner
/// root:phoenix, mode 0640, reading the content from stdin.
pub fn install_env_command(app_name: &str) -> String {
    let dir = format!("/etc/{}", app_name);
    let path = format!("{}/env", dir);
    format!(
        "sudo mkdir -p {dir} && sudo tee {path} >/dev/null && sudo chown root:phoenix {path} && sudo chmod 0640 {path}",
        dir = sh_quote(&dir),
        path = sh_quote(&path),
    )
}

const PATH_KEY_SUFFIXES: [&str; 5] = ["_PATH", "_DIR", "_FILE", "_DB", "_DATABASE"];

fn is_path_key(key: &str) -> bool {
    PATH_KEY_SUFFIXES.iter().any(|suffix| key.ends_with(suffix))
}

fn looks_like_local_path(value: &str) -> bool {
    if value.is_empty() {
        return false;
    }
    if value.starts_with('/') || value.starts_with("./") || value.starts_with("../") {
        return true;
    }
    value.contains('/') && !value.contains(':')
}

fn has_file_extension(value: &str) -> bool {
    let name = value.rsplit('/').next().unwrap_or(value);
    match name.rsplit_once('.') {
        Some((stem, ext)) => !stem.is_empty() && !ext.is_empty(),
        None => false,
    }
}

/// Directory to pre-create for one env value, if any.
///
/// Values with a file extension get their parent created. The terminal file
/// itself is never created; the application owns it.
fn guard_dir(value: &str) -> Option<String> {
    let dir = if has_file_extension(value) {
        match value.rsplit_once('/') {
            Some((parent, _)) if !parent.is_empty() => parent.to_string(),
            _ => return None,
        }
    } else {
        value.trim_end_matches('/').to_string()
    };
    if dir.is_empty() || dir == "/" || dir == "." || dir == ".." {
        return None;
    }
    Some(dir)
}

/// Commands that pre-create directories for path-like env values so the
/// service user can write there on first boot.
pub fn path_guard_commands(env: &BTreeMap<String, String>) -> Vec<String> {
    let mut commands = Vec::new();
    for (key, value) in env {
        if !is_path_key(key) || !looks_like_local_path(value) {
            continue;
        }
        if let Some(dir) = guard_dir(value) {
            commands.push(format!(
                "sudo mkdir -p {dir} && sudo chown phoenix:phoenix {dir} && sudo chmod 0775 {dir}",
                dir = sh_quote(&dir)
            ));
        }
    }
    commands
}
