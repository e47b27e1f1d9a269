use crate::managers::ssh::IsolatedSshManager;
use crate::services::accounts::Account;
use crate::services::logger::Logger;
use crate::services::token::{usernames_match, IsolatedTokenService};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub severity: IssueSeverity,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ValidationIssue {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self {
            severity: IssueSeverity::Error,
            code: code.to_string(),
            message: message.into(),
            hint: None,
        }
    }

    pub fn warning(code: &str, message: impl Into<String>) -> Self {
        Self {
            severity: IssueSeverity::Warning,
            code: code.to_string(),
            message: message.into(),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == IssueSeverity::Error
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub account: String,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(ValidationIssue::is_error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|issue| issue.is_error())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|issue| !issue.is_error())
    }

    pub fn summary(&self) -> String {
        self.errors()
            .map(|issue| issue.message.clone())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationScope {
    pub check_token: bool,
    pub check_remote: bool,
}

/// Read-only account checks. Nothing here mutates a credential, so it is
/// safe to run before, during, or outside of a switch.
#[derive(Clone)]
pub struct AccountValidationService {
    logger: Logger,
    token_service: Arc<IsolatedTokenService>,
    ssh_manager: Arc<IsolatedSshManager>,
}

impl AccountValidationService {
    pub fn new(
        logger: Logger,
        token_service: Arc<IsolatedTokenService>,
        ssh_manager: Arc<IsolatedSshManager>,
    ) -> Self {
        Self {
            logger: logger.child("validation"),
            token_service,
            ssh_manager,
        }
    }

    pub fn validate_structure(&self, account: &Account) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        if account.alias.trim().is_empty() {
            issues.push(ValidationIssue::error("ALIAS_MISSING", "Account alias is empty"));
        } else if account
            .alias
            .chars()
            .any(|ch| ch.is_whitespace() || ch.is_control() || ch == '#' || ch == '"')
        {
            issues.push(
                ValidationIssue::error(
                    "ALIAS_INVALID",
                    format!("Account alias {:?} contains whitespace or control characters", account.alias),
                )
                .with_hint("Use letters, digits, '.', '-' or '_' in aliases."),
            );
        }
        if account.name.trim().is_empty() {
            issues.push(
                ValidationIssue::error("NAME_MISSING", "Account display name is empty")
                    .with_hint("Set name; it becomes git user.name."),
            );
        }
        let email = account.email.trim();
        if email.is_empty() {
            issues.push(
                ValidationIssue::error("EMAIL_MISSING", "Account email is empty")
                    .with_hint("Set email; it becomes git user.email."),
            );
        } else if !is_plausible_email(email) {
            issues.push(ValidationIssue::error(
                "EMAIL_INVALID",
                format!("Account email '{}' is not a valid address", email),
            ));
        }
        if account.username.trim().is_empty() {
            issues.push(
                ValidationIssue::error("USERNAME_MISSING", "Expected GitHub username is empty")
                    .with_hint("Token isolation is enforced against this username."),
            );
        }
        issues
    }

    pub fn validate_key(&self, account: &Account) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        let Some(key_path) = account.key_path() else {
            return issues;
        };
        let metadata = match std::fs::metadata(&key_path) {
            Ok(metadata) => metadata,
            Err(_) => {
                issues.push(
                    ValidationIssue::error(
                        "KEY_MISSING",
                        format!("SSH key not found: {}", key_path.display()),
                    )
                    .with_hint("Check ssh_key_path in the account configuration."),
                );
                return issues;
            }
        };
        if !metadata.is_file() {
            issues.push(ValidationIssue::error(
                "KEY_NOT_FILE",
                format!("SSH key path is not a regular file: {}", key_path.display()),
            ));
            return issues;
        }
        if let Err(err) = std::fs::File::open(&key_path) {
            issues.push(ValidationIssue::error(
                "KEY_UNREADABLE",
                format!("SSH key is not readable: {}", err),
            ));
            return issues;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = metadata.permissions().mode() & 0o777;
            if mode & 0o077 != 0 {
                issues.push(
                    ValidationIssue::warning(
                        "KEY_PERMISSIONS_OPEN",
                        format!("SSH key {} has mode {:o}", key_path.display(), mode),
                    )
                    .with_hint(format!("chmod 600 {}", key_path.display())),
                );
            }
        }
        issues
    }

    pub fn validate_token(&self, account: &Account) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        let metadata = match self.token_service.token_metadata(&account.alias) {
            Ok(Some(metadata)) => metadata,
            Ok(None) => {
                issues.push(
                    ValidationIssue::error(
                        "TOKEN_MISSING",
                        format!("No token stored for account '{}'", account.alias),
                    )
                    .with_hint(format!(
                        "Run: gitpersona token store {} --token <token>",
                        account.alias
                    )),
                );
                return issues;
            }
            Err(err) => {
                issues.push(ValidationIssue::error("TOKEN_UNREADABLE", err.message));
                return issues;
            }
        };
        if !metadata.is_valid {
            issues.push(ValidationIssue::error(
                "TOKEN_INVALID",
                format!(
                    "Token for account '{}' is marked invalid{}",
                    account.alias,
                    metadata
                        .invalid_reason
                        .as_deref()
                        .map(|r| format!(": {}", r))
                        .unwrap_or_default()
                ),
            ));
        }
        if !usernames_match(&metadata.username, &account.username) {
            issues.push(ValidationIssue::error(
                "TOKEN_OWNER_MISMATCH",
                format!(
                    "Token for '{}' belongs to '{}', expected '{}'",
                    account.alias, metadata.username, account.username
                ),
            ));
        }
        issues
    }

    pub async fn validate_remote(&self, account: &Account) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        if account.key_path().is_none() {
            return issues;
        }
        let probe = self.ssh_manager.probe_auth(account).await;
        match (probe.authenticated, probe.username.as_deref()) {
            (true, Some(user)) if !usernames_match(user, &account.username) => {
                issues.push(ValidationIssue::error(
                    "SSH_IDENTITY_MISMATCH",
                    format!(
                        "SSH key for '{}' authenticates as '{}', expected '{}'",
                        account.alias, user, account.username
                    ),
                ));
            }
            (true, _) => {}
            (false, _) => {
                issues.push(
                    ValidationIssue::warning(
                        "SSH_UNREACHABLE",
                        format!("SSH authentication test failed: {}", probe.message),
                    )
                    .with_hint("Check network access and that the key is registered on GitHub."),
                );
            }
        }
        issues
    }

    pub async fn validate_account(&self, account: &Account, scope: ValidationScope) -> ValidationReport {
        let mut report = ValidationReport {
            account: account.alias.clone(),
            issues: self.validate_structure(account),
        };
        report.issues.extend(self.validate_key(account));
        if scope.check_token {
            report.issues.extend(self.validate_token(account));
        }
        if scope.check_remote {
            report.issues.extend(self.validate_remote(account).await);
        }
        self.logger.debug(
            "validate_account",
            Some(&serde_json::json!({
                "account": account.alias,
                "issues": report.issues.len(),
                "errors": report.errors().count(),
            })),
        );
        report
    }
}

fn is_plausible_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !email.chars().any(char::is_whitespace)
}
