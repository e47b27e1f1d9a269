pub mod timeouts {
    pub const SSH_TEST_MS: u64 = 8_000;
    pub const SSH_CONNECT_SECS: u64 = 5;
    pub const SWITCH_TRANSACTION_MS: u64 = 60_000;
    pub const AGENT_STOP_GRACE_MS: u64 = 500;
    pub const AGENT_STOP_POLL_MS: u64 = 50;
    pub const COMMAND_DEFAULT_MS: u64 = 30_000;
    pub const GITHUB_API_MS: u64 = 10_000;
}

pub mod crypto {
    pub const KEY_SIZE: usize = 32;
    pub const NONCE_SIZE: usize = 12;
}

pub mod permissions {
    pub const PRIVATE_DIR: u32 = 0o700;
    pub const PRIVATE_FILE: u32 = 0o600;
}

pub mod ssh {
    pub const GITHUB_HOST: &str = "github.com";
    pub const GITHUB_USER: &str = "git";
    pub const HOST_ALIAS_PREFIX: &str = "github-";
    pub const BLOCK_BEGIN: &str = "# >>> GitPersona managed block >>>";
    pub const BLOCK_END: &str = "# <<< GitPersona managed block <<<";
    pub const BACKUP_SUFFIX: &str = "gitpersona.bak";
    pub const SOCKET_EXTENSION: &str = "sock";
    pub const PID_EXTENSION: &str = "pid";
}

pub mod env_vars {
    pub const SSH_AUTH_SOCK: &str = "SSH_AUTH_SOCK";
    pub const SSH_AGENT_PID: &str = "SSH_AGENT_PID";
    pub const ACCOUNT: &str = "GITPERSONA_ACCOUNT";
}

pub mod github {
    pub const DEFAULT_API_URL: &str = "https://api.github.com";
    pub const USER_AGENT: &str = "gitpersona";
}
