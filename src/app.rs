use crate::errors::PersonaError;
use crate::managers::ssh::{CleanupReport, IsolatedSshManager, SshManagerConfig};
use crate::managers::switch::{
    AccountSwitchTransaction, SessionBinding, SwitchServices, TransactionOptions,
    TransactionResult, TransactionState,
};
use crate::services::accounts::{AccountLookup, FileAccountStore};
use crate::services::command::{CommandExecutor, SystemCommandExecutor};
use crate::services::github::GitHubClient;
use crate::services::logger::Logger;
use crate::services::process::{ProcessSignaller, UnixSignaller};
use crate::services::token::{IsolatedTokenService, TokenMetadata};
use crate::services::validation::{AccountValidationService, ValidationReport, ValidationScope};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct SwitchRequest {
    pub target: String,
    pub source: Option<String>,
    pub skip_token_validation: bool,
    pub repo_dir: Option<PathBuf>,
}

/// Wires the credential services together for the binary.
pub struct App {
    pub logger: Logger,
    pub accounts: Arc<dyn AccountLookup>,
    pub store: Option<Arc<FileAccountStore>>,
    pub token_service: Arc<IsolatedTokenService>,
    pub ssh_manager: Arc<IsolatedSshManager>,
    pub validation: Arc<AccountValidationService>,
    pub executor: Arc<dyn CommandExecutor>,
}

impl App {
    pub fn initialize() -> Result<Self, PersonaError> {
        let logger = Logger::new("gitpersona");
        let store = Arc::new(FileAccountStore::new()?);
        let executor: Arc<dyn CommandExecutor> = Arc::new(SystemCommandExecutor::new());
        let signaller: Arc<dyn ProcessSignaller> = Arc::new(UnixSignaller::new());
        let token_service = Arc::new(IsolatedTokenService::new(logger.clone())?);
        let ssh_manager = Arc::new(IsolatedSshManager::new(
            logger.clone(),
            SshManagerConfig::from_env(),
            executor.clone(),
            signaller,
        ));
        let mut app = Self::from_parts(
            logger,
            store.clone(),
            token_service,
            ssh_manager,
            executor,
        );
        app.store = Some(store);
        Ok(app)
    }

    pub fn from_parts(
        logger: Logger,
        accounts: Arc<dyn AccountLookup>,
        token_service: Arc<IsolatedTokenService>,
        ssh_manager: Arc<IsolatedSshManager>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        let validation = Arc::new(AccountValidationService::new(
            logger.clone(),
            token_service.clone(),
            ssh_manager.clone(),
        ));
        Self {
            logger,
            accounts,
            store: None,
            token_service,
            ssh_manager,
            validation,
            executor,
        }
    }

    pub fn switch_services(&self) -> SwitchServices {
        SwitchServices {
            logger: self.logger.clone(),
            ssh_manager: self.ssh_manager.clone(),
            token_service: self.token_service.clone(),
            validation: self.validation.clone(),
            executor: self.executor.clone(),
        }
    }

    pub async fn switch(
        &self,
        request: SwitchRequest,
        options: TransactionOptions,
    ) -> Result<TransactionResult, PersonaError> {
        let target = self.accounts.get_account(&request.target)?;
        let source_alias = request
            .source
            .or_else(|| self.accounts.current_alias())
            .filter(|alias| alias != &target.alias);
        let source = match source_alias {
            Some(alias) => Some(self.accounts.get_account(&alias)?),
            None => None,
        };
        let options = TransactionOptions {
            skip_token_validation: request.skip_token_validation || options.skip_token_validation,
            ..options
        };

        let mut transaction =
            AccountSwitchTransaction::new(self.switch_services(), source, target, options)
                .with_binding(SessionBinding::from_process_env())
                .with_standard_steps();
        if let Some(dir) = request.repo_dir {
            transaction = transaction.with_repo_dir(dir);
        }
        let result = transaction.execute().await?;

        if result.state == TransactionState::Completed {
            result.binding.apply_to_process();
            if let Some(store) = self.store.as_ref() {
                if let Err(err) = store.set_current(&result.target) {
                    self.logger.warn(
                        "Failed to record current account",
                        Some(&serde_json::json!({"error": err.message})),
                    );
                }
            }
        }
        Ok(result)
    }

    pub fn status(&self) -> Result<Value, PersonaError> {
        let tokens = self.token_service.list_tokens()?;
        Ok(serde_json::json!({
            "current_account": self.accounts.current_alias(),
            "accounts": self
                .accounts
                .list_accounts()
                .iter()
                .map(|account| account.alias.clone())
                .collect::<Vec<_>>(),
            "active_agents": self.ssh_manager.list_active_agents(),
            "tokens": tokens,
            "logger": self.logger.stats(),
        }))
    }

    pub async fn cleanup(&self) -> CleanupReport {
        self.ssh_manager.cleanup_all_agents().await
    }

    pub async fn store_token(
        &self,
        alias: &str,
        token: &str,
        username: Option<String>,
    ) -> Result<TokenMetadata, PersonaError> {
        let account = self.accounts.get_account(alias)?;
        let username = match username.filter(|u| !u.trim().is_empty()) {
            Some(username) => username,
            None => GitHubClient::new(self.logger.clone())?
                .resolve_token_owner(token)
                .await?,
        };
        self.token_service.store_token(&account.alias, token, &username)
    }

    /// Checks the stored token against the account's expected username and,
    /// when `remote` is set, against the owner GitHub reports for it.
    pub async fn validate_token(&self, alias: &str, remote: bool) -> Result<TokenMetadata, PersonaError> {
        let account = self.accounts.get_account(alias)?;
        let metadata = self
            .token_service
            .validate_token_isolation(&account.alias, &account.username)?;
        if !remote {
            return Ok(metadata);
        }
        let token = self.token_service.get_token(&account.alias)?;
        let owner = GitHubClient::new(self.logger.clone())?
            .resolve_token_owner(&token)
            .await?;
        self.token_service
            .validate_token_isolation(&account.alias, &owner)
    }

    /// Read-only health check of one account. Unlike `validate_token`, a
    /// token owner mismatch is reported here without invalidating the record.
    pub async fn validate_account(&self, alias: &str, remote: bool) -> Result<ValidationReport, PersonaError> {
        let account = self.accounts.get_account(alias)?;
        let scope = ValidationScope {
            check_token: true,
            check_remote: remote,
        };
        Ok(self.validation.validate_account(&account, scope).await)
    }

    pub fn delete_token(&self, alias: &str) -> Result<bool, PersonaError> {
        self.token_service.delete_token(alias)
    }
}
