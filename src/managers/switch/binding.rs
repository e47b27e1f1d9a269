use crate::constants::env_vars::{ACCOUNT, SSH_AGENT_PID, SSH_AUTH_SOCK};
use serde::Serialize;

/// The agent-related environment a shell session should see. Carried as a
/// value through a switch instead of mutating the process environment, so
/// undoing a rebinding is just restoring the previous value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionBinding {
    pub ssh_auth_sock: Option<String>,
    pub ssh_agent_pid: Option<String>,
    pub account: Option<String>,
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

impl SessionBinding {
    pub fn from_process_env() -> Self {
        Self {
            ssh_auth_sock: non_empty_env(SSH_AUTH_SOCK),
            ssh_agent_pid: non_empty_env(SSH_AGENT_PID),
            account: non_empty_env(ACCOUNT),
        }
    }

    pub fn for_account(account: &str, socket: Option<String>) -> Self {
        Self {
            ssh_auth_sock: socket,
            ssh_agent_pid: None,
            account: Some(account.to_string()),
        }
    }

    /// Writes the binding into this process's environment, for commands
    /// spawned after the switch.
    pub fn apply_to_process(&self) {
        for (key, value) in self.pairs() {
            match value {
                Some(value) => std::env::set_var(key, value),
                None => std::env::remove_var(key),
            }
        }
    }

    /// POSIX shell statements reproducing the binding, for `eval`.
    pub fn shell_exports(&self) -> String {
        let mut lines = Vec::new();
        for (key, value) in self.pairs() {
            match value {
                Some(value) => lines.push(format!("export {}={};", key, shell_quote(value))),
                None => lines.push(format!("unset {};", key)),
            }
        }
        lines.join("\n")
    }

    fn pairs(&self) -> [(&'static str, Option<&String>); 3] {
        [
            (SSH_AUTH_SOCK, self.ssh_auth_sock.as_ref()),
            (SSH_AGENT_PID, self.ssh_agent_pid.as_ref()),
            (ACCOUNT, self.account.as_ref()),
        ]
    }
}
