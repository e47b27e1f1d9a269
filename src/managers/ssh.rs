//! Per-account SSH agents.
//!
//! Every account that is switched to gets its own `ssh-agent` bound to a
//! private socket under the agents directory, holding only that account's
//! key. The user's SSH client configuration is rewritten so `github.com` and
//! the account's host alias resolve to that socket and key.

use crate::constants::env_vars::{SSH_AGENT_PID, SSH_AUTH_SOCK};
use crate::constants::permissions::PRIVATE_FILE;
use crate::constants::ssh::{
    BACKUP_SUFFIX, BLOCK_BEGIN, BLOCK_END, GITHUB_HOST, GITHUB_USER, PID_EXTENSION,
    SOCKET_EXTENSION,
};
use crate::constants::timeouts::{
    AGENT_STOP_GRACE_MS, AGENT_STOP_POLL_MS, SSH_CONNECT_SECS, SSH_TEST_MS,
};
use crate::errors::PersonaError;
use crate::services::accounts::Account;
use crate::services::command::{CommandExecutor, CommandRequest};
use crate::services::logger::Logger;
use crate::services::process::ProcessSignaller;
use crate::utils::feature_flags::{is_connectivity_test_disabled, read_env_ms};
use crate::utils::fs_atomic::{atomic_write_text_file, ensure_private_dir, remove_file_if_exists};
use crate::utils::paths::{resolve_agents_dir, resolve_ssh_config_path, sanitize_alias};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

static AGENT_PID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"SSH_AGENT_PID=(\d+)").expect("valid agent pid regex"));
static AGENT_SOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"SSH_AUTH_SOCK=([^;\s]+)").expect("valid agent sock regex"));
static GITHUB_GREETING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Hi ([A-Za-z0-9][A-Za-z0-9-]*)! You've successfully authenticated")
        .expect("valid greeting regex")
});

const MAX_UNIX_SOCKET_PATH: usize = 104;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SshAgentProcess {
    pub account: String,
    pub pid: u32,
    pub socket_path: PathBuf,
    pub key_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub running: bool,
    pub loaded_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub stopped_agents: Vec<String>,
    pub removed_sockets: Vec<PathBuf>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SshAuthProbe {
    pub authenticated: bool,
    pub username: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct SshManagerConfig {
    pub agents_dir: PathBuf,
    pub ssh_config_path: PathBuf,
    pub connectivity_timeout: Duration,
    pub stop_grace: Duration,
    pub test_connectivity: bool,
}

impl SshManagerConfig {
    pub fn from_env() -> Self {
        Self {
            agents_dir: resolve_agents_dir(),
            ssh_config_path: resolve_ssh_config_path(),
            connectivity_timeout: Duration::from_millis(read_env_ms(
                "GITPERSONA_SSH_TEST_TIMEOUT_MS",
                SSH_TEST_MS,
            )),
            stop_grace: Duration::from_millis(read_env_ms(
                "GITPERSONA_AGENT_STOP_GRACE_MS",
                AGENT_STOP_GRACE_MS,
            )),
            test_connectivity: !is_connectivity_test_disabled(),
        }
    }

    pub fn with_paths(agents_dir: impl Into<PathBuf>, ssh_config_path: impl Into<PathBuf>) -> Self {
        Self {
            agents_dir: agents_dir.into(),
            ssh_config_path: ssh_config_path.into(),
            ..Self::from_env()
        }
    }
}

pub fn parse_agent_output(output: &str) -> Option<(u32, Option<PathBuf>)> {
    let pid = AGENT_PID_RE
        .captures(output)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok())?;
    let sock = AGENT_SOCK_RE
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| PathBuf::from(m.as_str()));
    Some((pid, sock))
}

/// Fingerprints from `ssh-add -l` output, one per loaded identity.
pub fn parse_loaded_keys(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("The agent has no identities"))
        .filter_map(|line| line.split_whitespace().nth(1).map(|s| s.to_string()))
        .collect()
}

pub fn parse_github_greeting(output: &str) -> Option<String> {
    GITHUB_GREETING_RE
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn quote_ssh_value(path: &Path) -> String {
    let rendered = path.display().to_string();
    if rendered.chars().any(char::is_whitespace) {
        format!("\"{}\"", rendered)
    } else {
        rendered
    }
}

pub fn render_managed_block(account: &Account, key_path: &Path, socket_path: &Path) -> String {
    let mut out = String::new();
    out.push_str(BLOCK_BEGIN);
    out.push('\n');
    out.push_str(&format!("# account: {}\n", sanitize_alias(&account.alias)));
    for host in [account.host_alias(), GITHUB_HOST.to_string()] {
        out.push_str(&format!("Host {}\n", host));
        out.push_str(&format!("    HostName {}\n", GITHUB_HOST));
        out.push_str(&format!("    User {}\n", GITHUB_USER));
        out.push_str(&format!("    IdentityFile {}\n", quote_ssh_value(key_path)));
        out.push_str(&format!("    IdentityAgent {}\n", quote_ssh_value(socket_path)));
        out.push_str("    IdentitiesOnly yes\n");
    }
    out.push_str(BLOCK_END);
    out.push('\n');
    out
}

/// Removes every managed block. An unterminated block runs to end of file,
/// since the block is only ever written by us and always closed.
pub fn strip_managed_blocks(content: &str) -> String {
    let mut out = Vec::new();
    let mut inside = false;
    for line in content.lines() {
        let trimmed = line.trim();
        if !inside && trimmed == BLOCK_BEGIN {
            inside = true;
            continue;
        }
        if inside {
            if trimmed == BLOCK_END {
                inside = false;
            }
            continue;
        }
        out.push(line);
    }
    let mut joined = out.join("\n");
    if !joined.is_empty() && content.ends_with('\n') {
        joined.push('\n');
    }
    joined
}

pub fn count_managed_blocks(content: &str) -> usize {
    content
        .lines()
        .filter(|line| line.trim() == BLOCK_BEGIN)
        .count()
}

#[derive(Clone)]
pub struct IsolatedSshManager {
    logger: Logger,
    config: SshManagerConfig,
    executor: Arc<dyn CommandExecutor>,
    signaller: Arc<dyn ProcessSignaller>,
    agents: Arc<RwLock<HashMap<String, SshAgentProcess>>>,
    mutation: Arc<tokio::sync::Mutex<()>>,
}

impl IsolatedSshManager {
    pub fn new(
        logger: Logger,
        config: SshManagerConfig,
        executor: Arc<dyn CommandExecutor>,
        signaller: Arc<dyn ProcessSignaller>,
    ) -> Self {
        Self {
            logger: logger.child("ssh"),
            config,
            executor,
            signaller,
            agents: Arc::new(RwLock::new(HashMap::new())),
            mutation: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn config(&self) -> &SshManagerConfig {
        &self.config
    }

    fn socket_path_for(&self, alias: &str) -> PathBuf {
        let nanos = Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_else(|| Utc::now().timestamp_micros() * 1_000);
        let base = format!("{}-{}", sanitize_alias(alias), nanos);
        let mut candidate = self
            .config
            .agents_dir
            .join(format!("{}.{}", base, SOCKET_EXTENSION));
        let mut attempt = 1;
        while candidate.exists() {
            candidate = self
                .config
                .agents_dir
                .join(format!("{}-{}.{}", base, attempt, SOCKET_EXTENSION));
            attempt += 1;
        }
        candidate
    }

    fn pid_sidecar(socket_path: &Path) -> PathBuf {
        let mut name = socket_path.as_os_str().to_os_string();
        name.push(format!(".{}", PID_EXTENSION));
        PathBuf::from(name)
    }

    fn snapshot(&self, agent: &SshAgentProcess) -> SshAgentProcess {
        let mut copy = agent.clone();
        copy.running = self.signaller.is_alive(agent.pid) && agent.socket_path.exists();
        copy
    }

    pub fn get_account_agent(&self, alias: &str) -> Option<SshAgentProcess> {
        let guard = self.agents.read().unwrap_or_else(|err| err.into_inner());
        guard.get(alias).map(|agent| self.snapshot(agent))
    }

    pub fn list_active_agents(&self) -> Vec<SshAgentProcess> {
        let guard = self.agents.read().unwrap_or_else(|err| err.into_inner());
        let mut out: Vec<SshAgentProcess> = guard
            .values()
            .map(|agent| self.snapshot(agent))
            .filter(|agent| agent.running)
            .collect();
        out.sort_by(|a, b| a.account.cmp(&b.account));
        out
    }

    pub fn tracked_accounts(&self) -> Vec<String> {
        let guard = self.agents.read().unwrap_or_else(|err| err.into_inner());
        let mut out: Vec<String> = guard.keys().cloned().collect();
        out.sort();
        out
    }

    /// Replaces the account's agent with a fresh one holding only `key_path`.
    /// Failures after the key is loaded (config rewrite, connectivity) are
    /// logged and do not fail the switch.
    pub async fn switch_to_account(
        &self,
        account: &Account,
        key_path: &Path,
    ) -> Result<SshAgentProcess, PersonaError> {
        if !key_path.is_file() {
            return Err(PersonaError::precondition(format!(
                "SSH key for account '{}' not found: {}",
                account.alias,
                key_path.display()
            ))
            .with_hint("Check ssh_key_path in the account configuration."));
        }
        ensure_private_dir(&self.config.agents_dir).map_err(|err| {
            PersonaError::internal(format!("Failed to create agents directory: {}", err))
        })?;

        let mutation_guard = self.mutation.lock().await;
        self.stop_account_agent_locked(&account.alias).await?;

        let socket_path = self.socket_path_for(&account.alias);
        if socket_path.as_os_str().len() >= MAX_UNIX_SOCKET_PATH {
            self.logger.warn(
                "Agent socket path is close to the Unix socket length limit",
                Some(&serde_json::json!({"socket": socket_path})),
            );
        }
        let agent = self.start_agent(&account.alias, &socket_path, key_path).await?;
        if let Err(err) = self.load_key(&agent, key_path).await {
            self.logger.error(
                "Key load failed; tearing down new agent",
                Some(&serde_json::json!({"account": account.alias, "error": err.message})),
            );
            if let Err(stop_err) = self.terminate_agent(&agent).await {
                self.logger.warn(
                    "Failed to stop agent after key load failure",
                    Some(&serde_json::json!({"pid": agent.pid, "error": stop_err.message})),
                );
            }
            return Err(err);
        }

        let mut agent = agent;
        agent.loaded_keys = self.list_loaded_keys(&agent.socket_path).await;
        agent.last_used = Utc::now();
        {
            let mut guard = self.agents.write().unwrap_or_else(|err| err.into_inner());
            guard.insert(account.alias.clone(), agent.clone());
        }
        self.logger.info(
            "Agent ready",
            Some(&serde_json::json!({
                "account": account.alias,
                "pid": agent.pid,
                "socket": agent.socket_path,
                "loaded_keys": agent.loaded_keys.len(),
            })),
        );

        if let Err(err) = self.write_ssh_config(account, key_path, &agent.socket_path) {
            self.logger.error(
                "Failed to update SSH client configuration",
                Some(&serde_json::json!({"account": account.alias, "error": err.message})),
            );
        }
        drop(mutation_guard);

        if self.config.test_connectivity {
            let probe = self.probe_auth(account).await;
            if probe.authenticated {
                self.logger.info(
                    "SSH connectivity verified",
                    Some(&serde_json::json!({"account": account.alias, "user": probe.username})),
                );
            } else {
                self.logger.warn(
                    "SSH connectivity test failed",
                    Some(&serde_json::json!({"account": account.alias, "message": probe.message})),
                );
            }
        }

        Ok(self.snapshot(&agent))
    }

    async fn start_agent(
        &self,
        alias: &str,
        socket_path: &Path,
        key_path: &Path,
    ) -> Result<SshAgentProcess, PersonaError> {
        let request = CommandRequest::new("ssh-agent")
            .arg("-a")
            .arg(socket_path.display().to_string())
            .arg("-s");
        let output = self.executor.run(request.clone()).await?.into_result(&request)?;
        let (pid, reported_socket) = parse_agent_output(&output.stdout).ok_or_else(|| {
            PersonaError::execution("ssh-agent did not report its pid").with_details(
                serde_json::json!({"stdout": output.stdout, "stderr": output.stderr}),
            )
        })?;
        let socket_path = reported_socket.unwrap_or_else(|| socket_path.to_path_buf());
        if let Err(err) = atomic_write_text_file(
            Self::pid_sidecar(&socket_path),
            &format!("{}\n", pid),
            PRIVATE_FILE,
        ) {
            self.logger.warn(
                "Failed to write agent pid file",
                Some(&serde_json::json!({"socket": socket_path, "error": err.to_string()})),
            );
        }
        let now = Utc::now();
        Ok(SshAgentProcess {
            account: alias.to_string(),
            pid,
            socket_path,
            key_path: key_path.to_path_buf(),
            started_at: now,
            last_used: now,
            running: true,
            loaded_keys: Vec::new(),
        })
    }

    async fn load_key(&self, agent: &SshAgentProcess, key_path: &Path) -> Result<(), PersonaError> {
        let request = CommandRequest::new("ssh-add")
            .arg(key_path.display().to_string())
            .env(SSH_AUTH_SOCK, agent.socket_path.display().to_string())
            .env_remove(SSH_AGENT_PID);
        self.executor
            .run(request.clone())
            .await?
            .into_result(&request)
            .map_err(|err| {
                PersonaError::execution(format!(
                    "Failed to load key into agent for '{}': {}",
                    agent.account, err.message
                ))
                .with_hint("If the key is passphrase-protected, run the switch from a terminal.")
            })?;
        Ok(())
    }

    async fn list_loaded_keys(&self, socket_path: &Path) -> Vec<String> {
        let request = CommandRequest::new("ssh-add")
            .arg("-l")
            .env(SSH_AUTH_SOCK, socket_path.display().to_string());
        match self.executor.run(request).await {
            Ok(output) if output.success() => parse_loaded_keys(&output.stdout),
            Ok(_) => Vec::new(),
            Err(err) => {
                self.logger.warn(
                    "Failed to list agent identities",
                    Some(&serde_json::json!({"error": err.message})),
                );
                Vec::new()
            }
        }
    }

    pub async fn stop_account_agent(&self, alias: &str) -> Result<bool, PersonaError> {
        let _mutation = self.mutation.lock().await;
        self.stop_account_agent_locked(alias).await
    }

    async fn stop_account_agent_locked(&self, alias: &str) -> Result<bool, PersonaError> {
        let removed = {
            let mut guard = self.agents.write().unwrap_or_else(|err| err.into_inner());
            guard.remove(alias)
        };
        let Some(agent) = removed else {
            return Ok(false);
        };
        self.terminate_agent(&agent).await?;
        self.logger.info(
            "Agent stopped",
            Some(&serde_json::json!({"account": alias, "pid": agent.pid})),
        );
        Ok(true)
    }

    /// Stops every tracked agent except `keep`'s.
    pub async fn stop_other_agents(&self, keep: &str) -> Result<Vec<String>, PersonaError> {
        let _mutation = self.mutation.lock().await;
        let others: Vec<String> = {
            let guard = self.agents.read().unwrap_or_else(|err| err.into_inner());
            guard.keys().filter(|alias| *alias != keep).cloned().collect()
        };
        let mut stopped = Vec::new();
        for alias in others {
            if self.stop_account_agent_locked(&alias).await? {
                stopped.push(alias);
            }
        }
        Ok(stopped)
    }

    async fn terminate_agent(&self, agent: &SshAgentProcess) -> Result<(), PersonaError> {
        let mut failure = None;
        if self.signaller.is_alive(agent.pid) {
            let terminated = match self.signaller.terminate(agent.pid) {
                Ok(()) => self.wait_for_exit(agent.pid).await,
                Err(err) => {
                    self.logger.warn(
                        "SIGTERM failed, escalating",
                        Some(&serde_json::json!({"pid": agent.pid, "error": err.message})),
                    );
                    false
                }
            };
            if !terminated {
                if let Err(err) = self.signaller.kill(agent.pid) {
                    failure = Some(err);
                }
            }
        }
        let _ = remove_file_if_exists(&agent.socket_path);
        let _ = remove_file_if_exists(Self::pid_sidecar(&agent.socket_path));
        match failure {
            Some(err) => Err(PersonaError::execution(format!(
                "Failed to stop agent {} for '{}': {}",
                agent.pid, agent.account, err.message
            ))),
            None => Ok(()),
        }
    }

    async fn wait_for_exit(&self, pid: u32) -> bool {
        let deadline = Instant::now() + self.config.stop_grace;
        loop {
            if !self.signaller.is_alive(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(AGENT_STOP_POLL_MS)).await;
        }
    }

    pub async fn cleanup_all_agents(&self) -> CleanupReport {
        let _mutation = self.mutation.lock().await;
        let mut report = CleanupReport::default();
        let aliases: Vec<String> = {
            let guard = self.agents.read().unwrap_or_else(|err| err.into_inner());
            guard.keys().cloned().collect()
        };
        for alias in aliases {
            match self.stop_account_agent_locked(&alias).await {
                Ok(true) => report.stopped_agents.push(alias),
                Ok(false) => {}
                Err(err) => report.errors.push(err.message),
            }
        }
        self.remove_orphaned_sockets(&mut report);
        self.logger.info(
            "Cleanup finished",
            Some(&serde_json::json!({
                "stopped": report.stopped_agents.len(),
                "removed_sockets": report.removed_sockets.len(),
                "errors": report.errors.len(),
            })),
        );
        report
    }

    fn remove_orphaned_sockets(&self, report: &mut CleanupReport) {
        let entries = match std::fs::read_dir(&self.config.agents_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
            Err(err) => {
                report
                    .errors
                    .push(format!("Failed to scan agents directory: {}", err));
                return;
            }
        };
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SOCKET_EXTENSION) {
                continue;
            }
            let sidecar = Self::pid_sidecar(&path);
            let owner = std::fs::read_to_string(&sidecar)
                .ok()
                .and_then(|raw| raw.trim().parse::<u32>().ok());
            let alive = owner.map(|pid| self.signaller.is_alive(pid)).unwrap_or(false);
            if alive {
                continue;
            }
            match remove_file_if_exists(&path) {
                Ok(_) => {
                    let _ = remove_file_if_exists(&sidecar);
                    report.removed_sockets.push(path);
                }
                Err(err) => report
                    .errors
                    .push(format!("Failed to remove {}: {}", path.display(), err)),
            }
        }
    }

    /// Rewrites the managed block at the top of the SSH client config. The
    /// pre-existing file is backed up once, before the first rewrite.
    pub fn write_ssh_config(
        &self,
        account: &Account,
        key_path: &Path,
        socket_path: &Path,
    ) -> Result<PathBuf, PersonaError> {
        let config_path = &self.config.ssh_config_path;
        if let Some(parent) = config_path.parent() {
            if !parent.exists() {
                ensure_private_dir(parent).map_err(|err| {
                    PersonaError::internal(format!("Failed to create SSH directory: {}", err))
                })?;
            }
        }
        let existing = match std::fs::read_to_string(config_path) {
            Ok(raw) => Some(raw),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(PersonaError::internal(format!(
                    "Failed to read SSH config: {}",
                    err
                )))
            }
        };
        if let Some(original) = existing.as_ref() {
            let backup = self.ssh_config_backup_path();
            if !backup.exists() {
                atomic_write_text_file(&backup, original, PRIVATE_FILE).map_err(|err| {
                    PersonaError::internal(format!("Failed to back up SSH config: {}", err))
                })?;
            }
        }

        let remainder = strip_managed_blocks(existing.as_deref().unwrap_or(""));
        let block = render_managed_block(account, key_path, socket_path);
        let remainder = remainder.trim_start_matches('\n');
        let content = if remainder.is_empty() {
            block
        } else {
            format!("{}\n{}", block, remainder)
        };
        atomic_write_text_file(config_path, &content, PRIVATE_FILE).map_err(|err| {
            PersonaError::internal(format!("Failed to write SSH config: {}", err))
        })?;
        Ok(config_path.clone())
    }

    pub fn ssh_config_backup_path(&self) -> PathBuf {
        let config_path = &self.config.ssh_config_path;
        let file_name = config_path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("config");
        config_path.with_file_name(format!("{}.{}", file_name, BACKUP_SUFFIX))
    }

    /// Best-effort `ssh -T` against GitHub, pinned to the account's key and,
    /// when one is running, its isolated agent.
    pub async fn probe_auth(&self, account: &Account) -> SshAuthProbe {
        let Some(key_path) = account.key_path() else {
            return SshAuthProbe {
                authenticated: false,
                username: None,
                message: "account has no SSH key configured".to_string(),
            };
        };
        let agent_socket = self
            .get_account_agent(&account.alias)
            .filter(|agent| agent.running)
            .map(|agent| agent.socket_path.display().to_string())
            .unwrap_or_else(|| "none".to_string());
        let request = CommandRequest::new("ssh")
            .args(["-T", "-o", "BatchMode=yes"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", SSH_CONNECT_SECS))
            .args(["-o", "IdentitiesOnly=yes", "-o", "StrictHostKeyChecking=accept-new"])
            .arg("-o")
            .arg(format!("IdentityAgent={}", agent_socket))
            .arg("-i")
            .arg(key_path.display().to_string())
            .arg(format!("{}@{}", GITHUB_USER, GITHUB_HOST))
            .timeout(self.config.connectivity_timeout);
        match self.executor.run(request).await {
            Ok(output) => {
                let combined = format!("{}\n{}", output.stdout, output.stderr);
                match parse_github_greeting(&combined) {
                    Some(user) => SshAuthProbe {
                        authenticated: true,
                        username: Some(user),
                        message: combined.trim().to_string(),
                    },
                    None => SshAuthProbe {
                        authenticated: false,
                        username: None,
                        message: combined.trim().to_string(),
                    },
                }
            }
            Err(err) => SshAuthProbe {
                authenticated: false,
                username: None,
                message: err.message,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> Account {
        Account::new("work", "Work Person", "me@corp.io", "me-corp").with_ssh_key("/k/work")
    }

    #[test]
    fn parse_agent_output_reads_pid_and_socket() {
        let out = "SSH_AUTH_SOCK=/run/gp/work-1.sock; export SSH_AUTH_SOCK;\nSSH_AGENT_PID=4242; export SSH_AGENT_PID;\necho Agent pid 4242;\n";
        let (pid, sock) = parse_agent_output(out).expect("parsed");
        assert_eq!(pid, 4242);
        assert_eq!(sock, Some(PathBuf::from("/run/gp/work-1.sock")));
        assert!(parse_agent_output("garbage").is_none());
    }

    #[test]
    fn parse_loaded_keys_skips_empty_agent_message() {
        let out = "256 SHA256:abc me@corp.io (ED25519)\n";
        assert_eq!(parse_loaded_keys(out), vec!["SHA256:abc".to_string()]);
        assert!(parse_loaded_keys("The agent has no identities.\n").is_empty());
    }

    #[test]
    fn parse_github_greeting_extracts_login() {
        let msg = "Hi me-corp! You've successfully authenticated, but GitHub does not provide shell access.";
        assert_eq!(parse_github_greeting(msg).as_deref(), Some("me-corp"));
        assert_eq!(parse_github_greeting("Permission denied (publickey)."), None);
    }

    #[test]
    fn strip_managed_blocks_keeps_user_entries() {
        let block = render_managed_block(
            &account(),
            Path::new("/k/work"),
            Path::new("/run/gp/work.sock"),
        );
        let user = "Host example\n    HostName example.com\n";
        let combined = format!("{}\n{}", block, user);
        assert_eq!(count_managed_blocks(&combined), 1);
        let stripped = strip_managed_blocks(&combined);
        assert_eq!(count_managed_blocks(&stripped), 0);
        assert!(stripped.contains("Host example"));
        assert!(!stripped.contains("IdentityAgent"));
    }

    #[test]
    fn rendered_block_pins_key_and_agent_for_both_hosts() {
        let block = render_managed_block(
            &account(),
            Path::new("/k/my key"),
            Path::new("/run/gp/work.sock"),
        );
        assert!(block.contains("Host github-work\n"));
        assert!(block.contains("Host github.com\n"));
        assert_eq!(block.matches("IdentitiesOnly yes").count(), 2);
        assert_eq!(block.matches("IdentityFile \"/k/my key\"").count(), 2);
        assert_eq!(block.matches("IdentityAgent /run/gp/work.sock").count(), 2);
    }

    #[test]
    fn alias_with_newline_cannot_add_directives() {
        let mut account = account();
        account.alias = "work\n    ProxyCommand touch /tmp/x".to_string();
        let block = render_managed_block(
            &account,
            Path::new("/k/id"),
            Path::new("/run/gp/work.sock"),
        );
        assert!(!block.contains("\n    ProxyCommand"));
        assert_eq!(block.lines().filter(|l| l.starts_with("Host ")).count(), 2);
        assert!(block.contains("Host github-work_____ProxyCommand_touch__tmp_x\n"));
    }
}
