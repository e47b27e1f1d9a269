use sha2::{Digest, Sha256};
use std::env;
use std::path::{Path, PathBuf};

fn normalize_env_path(value: Option<String>) -> Option<PathBuf> {
    let raw = value?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lowered = trimmed.to_lowercase();
    if lowered == "undefined" || lowered == "null" {
        return None;
    }
    Some(expand_home_path(trimmed))
}

fn resolve_home_dir() -> Option<PathBuf> {
    env::var("HOME")
        .ok()
        .filter(|home| !home.trim().is_empty())
        .map(PathBuf::from)
}

pub fn expand_home_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if let Some(str_path) = path.to_str() {
        if let Some(rest) = str_path.strip_prefix("~/") {
            if let Some(home) = resolve_home_dir() {
                return home.join(rest);
            }
        }
        if str_path == "~" {
            if let Some(home) = resolve_home_dir() {
                return home;
            }
        }
    }
    path.to_path_buf()
}

fn resolve_xdg_config_dir() -> Option<PathBuf> {
    if let Some(path) = normalize_env_path(env::var("XDG_CONFIG_HOME").ok()) {
        return Some(path);
    }
    resolve_home_dir().map(|home| home.join(".config"))
}

pub fn resolve_base_dir() -> PathBuf {
    if let Some(path) = normalize_env_path(env::var("GITPERSONA_HOME").ok()) {
        return path;
    }
    if let Some(path) = resolve_xdg_config_dir() {
        return path.join("gitpersona");
    }
    env::temp_dir().join("gitpersona")
}

pub fn resolve_tokens_dir() -> PathBuf {
    if let Some(path) = normalize_env_path(env::var("GITPERSONA_TOKENS_DIR").ok()) {
        return path;
    }
    resolve_base_dir().join("tokens")
}

pub fn resolve_agents_dir() -> PathBuf {
    if let Some(path) = normalize_env_path(env::var("GITPERSONA_AGENTS_DIR").ok()) {
        return path;
    }
    if let Some(runtime) = normalize_env_path(env::var("XDG_RUNTIME_DIR").ok()) {
        return runtime.join("gitpersona").join("agents");
    }
    resolve_base_dir().join("agents")
}

pub fn resolve_locks_dir() -> PathBuf {
    if let Some(path) = normalize_env_path(env::var("GITPERSONA_LOCKS_DIR").ok()) {
        return path;
    }
    resolve_base_dir().join("locks")
}

pub fn resolve_ssh_config_path() -> PathBuf {
    if let Some(path) = normalize_env_path(env::var("GITPERSONA_SSH_CONFIG").ok()) {
        return path;
    }
    resolve_home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ssh")
        .join("config")
}

pub fn resolve_accounts_path() -> PathBuf {
    if let Some(path) = normalize_env_path(env::var("GITPERSONA_ACCOUNTS_PATH").ok()) {
        return path;
    }
    resolve_base_dir().join("accounts.json")
}

/// Maps an account alias onto a file-name-safe fragment. Distinct aliases
/// may collide after sanitizing, so per-account files use
/// [`account_file_stem`] instead.
pub fn sanitize_alias(alias: &str) -> String {
    let cleaned: String = alias
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "account".to_string()
    } else {
        cleaned
    }
}

/// Injective file stem for per-account state: the readable sanitized alias
/// plus a digest of the exact alias, so `work.a` and `work_a` never share a
/// file.
pub fn account_file_stem(alias: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(alias.trim().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}-{}", sanitize_alias(alias), &digest[..16])
}
