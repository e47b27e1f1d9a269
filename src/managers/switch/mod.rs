mod binding;
mod steps;
mod transaction;

pub use binding::SessionBinding;
pub use steps::{
    post_switch_report, EnvironmentStep, GitConfigurationStep, GitIdentitySnapshot,
    SshIsolationStep, SwitchStep, TokenIsolationStep, ValidationStep,
};
pub use transaction::{
    AccountSwitchTransaction, RollbackOutcome, RollbackStatus, SwitchStepResult, TransactionOptions,
    TransactionResult, TransactionState,
};

use crate::managers::ssh::IsolatedSshManager;
use crate::services::accounts::Account;
use crate::services::command::CommandExecutor;
use crate::services::logger::Logger;
use crate::services::token::IsolatedTokenService;
use crate::services::validation::AccountValidationService;
use std::path::PathBuf;
use std::sync::Arc;

/// Long-lived collaborators shared by every transaction.
#[derive(Clone)]
pub struct SwitchServices {
    pub logger: Logger,
    pub ssh_manager: Arc<IsolatedSshManager>,
    pub token_service: Arc<IsolatedTokenService>,
    pub validation: Arc<AccountValidationService>,
    pub executor: Arc<dyn CommandExecutor>,
}

/// Per-transaction state handed to each step.
pub struct SwitchContext {
    pub logger: Logger,
    pub ssh_manager: Arc<IsolatedSshManager>,
    pub token_service: Arc<IsolatedTokenService>,
    pub validation: Arc<AccountValidationService>,
    pub executor: Arc<dyn CommandExecutor>,
    pub source: Option<Account>,
    pub target: Account,
    pub binding: SessionBinding,
    pub repo_dir: Option<PathBuf>,
}

impl SwitchContext {
    pub fn new(services: SwitchServices, source: Option<Account>, target: Account) -> Self {
        Self {
            logger: services.logger.child("switch"),
            ssh_manager: services.ssh_manager,
            token_service: services.token_service,
            validation: services.validation,
            executor: services.executor,
            source,
            target,
            binding: SessionBinding::default(),
            repo_dir: None,
        }
    }
}
