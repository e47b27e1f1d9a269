use crate::constants::permissions::PRIVATE_FILE;
use crate::errors::PersonaError;
use crate::utils::fs_atomic::atomic_write_text_file;
use crate::utils::paths::{expand_home_path, resolve_accounts_path};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    None,
    Basic,
    #[default]
    Standard,
    Strict,
    Complete,
}

impl IsolationLevel {
    /// At strict and above, other accounts' agents are torn down on switch.
    pub fn stops_foreign_agents(self) -> bool {
        self >= IsolationLevel::Strict
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub alias: String,
    pub name: String,
    pub email: String,
    #[serde(alias = "github_username")]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_path: Option<PathBuf>,
    #[serde(default)]
    pub isolation_level: IsolationLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Account {
    pub fn new(
        alias: impl Into<String>,
        name: impl Into<String>,
        email: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            alias: alias.into(),
            name: name.into(),
            email: email.into(),
            username: username.into(),
            ssh_key_path: None,
            isolation_level: IsolationLevel::default(),
            description: None,
        }
    }

    pub fn with_ssh_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssh_key_path = Some(path.into());
        self
    }

    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    pub fn key_path(&self) -> Option<PathBuf> {
        self.ssh_key_path
            .as_ref()
            .filter(|p| !p.as_os_str().is_empty())
            .map(expand_home_path)
    }

    /// `github-<alias>` with the alias sanitized, so it is always a single
    /// ssh_config token.
    pub fn host_alias(&self) -> String {
        format!(
            "{}{}",
            crate::constants::ssh::HOST_ALIAS_PREFIX,
            crate::utils::paths::sanitize_alias(&self.alias)
        )
    }
}

pub trait AccountLookup: Send + Sync {
    fn get_account(&self, alias: &str) -> Result<Account, PersonaError>;
    fn list_accounts(&self) -> Vec<Account>;
    fn current_alias(&self) -> Option<String>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AccountsFile {
    #[serde(default)]
    accounts: BTreeMap<String, Account>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    current_account: Option<String>,
}

/// Account list backed by `accounts.json`. Accounts are read-only here;
/// only the current-account pointer is written back.
#[derive(Clone)]
pub struct FileAccountStore {
    file_path: PathBuf,
    data: Arc<RwLock<AccountsFile>>,
}

impl FileAccountStore {
    pub fn new() -> Result<Self, PersonaError> {
        Self::open(&resolve_accounts_path())
    }

    pub fn open(path: &Path) -> Result<Self, PersonaError> {
        let store = Self {
            file_path: path.to_path_buf(),
            data: Arc::new(RwLock::new(AccountsFile::default())),
        };
        store.load()?;
        Ok(store)
    }

    fn load(&self) -> Result<(), PersonaError> {
        if !self.file_path.exists() {
            return Ok(());
        }
        let raw = std::fs::read_to_string(&self.file_path)
            .map_err(|err| PersonaError::internal(format!("Failed to load accounts: {}", err)))?;
        let mut parsed: AccountsFile = serde_json::from_str(&raw).map_err(|err| {
            PersonaError::invalid_params(format!("Failed to parse accounts file: {}", err))
                .with_hint(format!("Fix or remove {}", self.file_path.display()))
        })?;
        for (key, account) in parsed.accounts.iter_mut() {
            if account.alias.trim().is_empty() {
                account.alias = key.clone();
            }
        }
        *self.data.write().unwrap_or_else(|err| err.into_inner()) = parsed;
        Ok(())
    }

    pub fn set_current(&self, alias: &str) -> Result<(), PersonaError> {
        let mut guard = self.data.write().unwrap_or_else(|err| err.into_inner());
        if !guard.accounts.contains_key(alias) {
            return Err(PersonaError::not_found(format!("Account '{}' not found", alias)));
        }
        guard.current_account = Some(alias.to_string());
        let data = serde_json::to_string_pretty(&*guard).map_err(|err| {
            PersonaError::internal(format!("Failed to serialize accounts: {}", err))
        })?;
        drop(guard);
        atomic_write_text_file(&self.file_path, &format!("{}\n", data), PRIVATE_FILE)
            .map_err(|err| PersonaError::internal(format!("Failed to save accounts: {}", err)))
    }
}

impl AccountLookup for FileAccountStore {
    fn get_account(&self, alias: &str) -> Result<Account, PersonaError> {
        let guard = self.data.read().unwrap_or_else(|err| err.into_inner());
        guard.accounts.get(alias).cloned().ok_or_else(|| {
            PersonaError::not_found(format!("Account '{}' not found", alias)).with_hint(format!(
                "Known accounts: {}",
                guard.accounts.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
        })
    }

    fn list_accounts(&self) -> Vec<Account> {
        let guard = self.data.read().unwrap_or_else(|err| err.into_inner());
        guard.accounts.values().cloned().collect()
    }

    fn current_alias(&self) -> Option<String> {
        let guard = self.data.read().unwrap_or_else(|err| err.into_inner());
        guard.current_account.clone()
    }
}
