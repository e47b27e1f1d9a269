use super::steps::{post_switch_report, SwitchStep};
use super::{SessionBinding, SwitchContext, SwitchServices};
use crate::constants::timeouts::SWITCH_TRANSACTION_MS;
use crate::errors::{PersonaError, PersonaErrorKind};
use crate::services::accounts::Account;
use crate::services::validation::ValidationIssue;
use crate::utils::account_lock::AccountLock;
use crate::utils::feature_flags::read_env_ms;
use crate::utils::paths::resolve_locks_dir;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, Instant};

const PRE_VALIDATION: &str = "pre_validation";
const POST_VALIDATION: &str = "post_validation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Initialized,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

impl TransactionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransactionState::Completed | TransactionState::Failed | TransactionState::RolledBack
        )
    }
}

#[derive(Debug, Clone)]
pub struct TransactionOptions {
    pub strict_validation: bool,
    pub rollback_on_failure: bool,
    pub pre_validation: bool,
    pub post_validation: bool,
    pub skip_token_validation: bool,
    pub timeout: Duration,
    pub lock_accounts: bool,
    pub locks_dir: PathBuf,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            strict_validation: true,
            rollback_on_failure: true,
            pre_validation: true,
            post_validation: true,
            skip_token_validation: false,
            timeout: Duration::from_millis(read_env_ms(
                "GITPERSONA_SWITCH_TIMEOUT_MS",
                SWITCH_TRANSACTION_MS,
            )),
            lock_accounts: true,
            locks_dir: resolve_locks_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SwitchStepResult {
    pub name: String,
    pub description: String,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PersonaError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    RolledBack,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackOutcome {
    pub step: String,
    pub status: RollbackStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PersonaError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionResult {
    pub id: String,
    pub source: Option<String>,
    pub target: String,
    pub state: TransactionState,
    pub success: bool,
    pub steps: Vec<SwitchStepResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PersonaError>,
    pub rollback: Vec<RollbackOutcome>,
    pub validation_issues: Vec<ValidationIssue>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub binding: SessionBinding,
}

impl TransactionResult {
    pub fn rollback_errors(&self) -> impl Iterator<Item = &RollbackOutcome> {
        self.rollback
            .iter()
            .filter(|outcome| outcome.status == RollbackStatus::Failed)
    }

    pub fn executed_steps(&self) -> Vec<&str> {
        self.steps.iter().map(|step| step.name.as_str()).collect()
    }
}

struct Failure {
    step: String,
    error: PersonaError,
}

/// Runs an ordered list of switch steps against one target account, once.
/// On failure every completed step is rolled back in reverse order.
pub struct AccountSwitchTransaction {
    id: String,
    ctx: SwitchContext,
    steps: Vec<SwitchStep>,
    options: TransactionOptions,
    state: TransactionState,
    result: Option<TransactionResult>,
}

impl AccountSwitchTransaction {
    pub fn new(
        services: SwitchServices,
        source: Option<Account>,
        target: Account,
        options: TransactionOptions,
    ) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let mut ctx = SwitchContext::new(services, source, target);
        ctx.logger = ctx.logger.child(&id[..8]);
        Self {
            id,
            ctx,
            steps: Vec::new(),
            options,
            state: TransactionState::Initialized,
            result: None,
        }
    }

    pub fn with_binding(mut self, binding: SessionBinding) -> Self {
        self.ctx.binding = binding;
        self
    }

    pub fn with_repo_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.ctx.repo_dir = Some(dir.into());
        self
    }

    pub fn with_steps(mut self, steps: Vec<SwitchStep>) -> Self {
        self.steps.extend(steps);
        self
    }

    /// Registers the default step sequence for the target account.
    pub fn with_standard_steps(self) -> Self {
        let steps = SwitchStep::plan_for(&self.ctx.target, !self.options.skip_token_validation);
        self.with_steps(steps)
    }

    pub fn add_step(&mut self, step: SwitchStep) -> Result<(), PersonaError> {
        if self.state != TransactionState::Initialized {
            return Err(PersonaError::conflict(format!(
                "Transaction {} has already been executed",
                self.id
            )));
        }
        self.steps.push(step);
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn binding(&self) -> &SessionBinding {
        &self.ctx.binding
    }

    pub fn result(&self) -> Option<&TransactionResult> {
        self.result.as_ref()
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(SwitchStep::name).collect()
    }

    fn acquire_locks(&self) -> Result<Vec<AccountLock>, PersonaError> {
        if !self.options.lock_accounts {
            return Ok(Vec::new());
        }
        let mut aliases = vec![self.ctx.target.alias.clone()];
        if let Some(source) = self.ctx.source.as_ref() {
            if source.alias != self.ctx.target.alias {
                aliases.push(source.alias.clone());
            }
        }
        aliases.sort();
        aliases
            .iter()
            .map(|alias| AccountLock::try_acquire(&self.options.locks_dir, alias))
            .collect()
    }

    fn pre_validate(&self, issues: &mut Vec<ValidationIssue>) -> Result<(), PersonaError> {
        let target = &self.ctx.target;
        issues.extend(self.ctx.validation.validate_structure(target));
        issues.extend(self.ctx.validation.validate_key(target));
        let errors: Vec<String> = issues
            .iter()
            .filter(|issue| issue.is_error())
            .map(|issue| format!("{}: {}", issue.code, issue.message))
            .collect();
        if !errors.is_empty() {
            return Err(PersonaError::precondition(format!(
                "Account '{}' failed pre-validation: {}",
                target.alias,
                errors.join("; ")
            )));
        }
        if !self.options.skip_token_validation {
            self.ctx
                .token_service
                .validate_token_isolation(&target.alias, &target.username)?;
        }
        Ok(())
    }

    fn deadline_error(&self, phase: &str) -> PersonaError {
        PersonaError::timeout(format!(
            "Switch to '{}' exceeded {}ms (after {})",
            self.ctx.target.alias,
            self.options.timeout.as_millis(),
            phase
        ))
    }

    async fn run_steps(
        &mut self,
        deadline: Instant,
        results: &mut Vec<SwitchStepResult>,
        completed: &mut Vec<usize>,
    ) -> Result<(), Failure> {
        for index in 0..self.steps.len() {
            let name = self.steps[index].name();
            let description = self.steps[index].description();
            let started = Instant::now();
            self.ctx.logger.debug(
                "Running step",
                Some(&serde_json::json!({"step": name, "index": index})),
            );

            let mut outcome = Ok(());
            if self.options.strict_validation {
                outcome = self.steps[index].validate(&self.ctx).await;
            }
            if outcome.is_ok() {
                outcome = self.steps[index].execute(&mut self.ctx).await;
                if outcome.is_ok() {
                    completed.push(index);
                }
            }
            if outcome.is_ok() && Instant::now() > deadline {
                outcome = Err(self.deadline_error(name));
            }

            results.push(SwitchStepResult {
                name: name.to_string(),
                description: description.to_string(),
                success: outcome.is_ok(),
                duration_ms: started.elapsed().as_millis() as u64,
                error: outcome.as_ref().err().cloned(),
            });
            if let Err(error) = outcome {
                self.ctx.logger.warn(
                    "Step failed",
                    Some(&serde_json::json!({"step": name, "error": error.message})),
                );
                return Err(Failure {
                    step: name.to_string(),
                    error,
                });
            }
        }
        Ok(())
    }

    async fn roll_back(&mut self, completed: &[usize]) -> Vec<RollbackOutcome> {
        let mut outcomes = Vec::new();
        for &index in completed.iter().rev() {
            let name = self.steps[index].name().to_string();
            if !self.steps[index].can_rollback() {
                self.ctx.logger.warn(
                    "Step is not rollback-capable, skipping",
                    Some(&serde_json::json!({"step": name})),
                );
                outcomes.push(RollbackOutcome {
                    step: name,
                    status: RollbackStatus::Skipped,
                    error: None,
                });
                continue;
            }
            match self.steps[index].rollback(&mut self.ctx).await {
                Ok(()) => outcomes.push(RollbackOutcome {
                    step: name,
                    status: RollbackStatus::RolledBack,
                    error: None,
                }),
                Err(err) => {
                    self.ctx.logger.error(
                        "Rollback failed",
                        Some(&serde_json::json!({"step": name, "error": err.message})),
                    );
                    let error = PersonaError::rollback(format!(
                        "Rollback of '{}' failed: {}",
                        name, err.message
                    ))
                    .with_details(serde_json::json!({"cause": err}));
                    outcomes.push(RollbackOutcome {
                        step: name,
                        status: RollbackStatus::Failed,
                        error: Some(error),
                    });
                }
            }
        }
        outcomes
    }

    /// Runs the transaction. Only the second call errors; every outcome of
    /// the first call, including failures, is reported in the result.
    pub async fn execute(&mut self) -> Result<TransactionResult, PersonaError> {
        if self.state != TransactionState::Initialized {
            return Err(PersonaError::conflict(format!(
                "Transaction {} has already been executed (state {:?})",
                self.id, self.state
            ))
            .with_hint("Build a new transaction for another switch."));
        }
        self.state = TransactionState::InProgress;
        let started_at = Utc::now();
        let started = Instant::now();
        let deadline = started + self.options.timeout;
        self.ctx.logger.info(
            "Switch started",
            Some(&serde_json::json!({
                "id": self.id,
                "source": self.ctx.source.as_ref().map(|a| a.alias.clone()),
                "target": self.ctx.target.alias,
                "steps": self.step_names(),
            })),
        );

        let mut issues = Vec::new();
        let mut results = Vec::new();
        let mut completed = Vec::new();
        let mut rollback = Vec::new();

        let locks = self.acquire_locks();
        let failure = match &locks {
            Err(error) => Some((
                Failure {
                    step: "account_lock".to_string(),
                    error: error.clone(),
                },
                false,
            )),
            Ok(_held) => {
                // A deadline passed during pre-validation fails without
                // touching any step.
                let pre = if self.options.pre_validation {
                    self.pre_validate(&mut issues).and_then(|()| {
                        if Instant::now() > deadline {
                            Err(self.deadline_error(PRE_VALIDATION))
                        } else {
                            Ok(())
                        }
                    })
                } else {
                    Ok(())
                };
                match pre {
                    Err(error) => Some((
                        Failure {
                            step: PRE_VALIDATION.to_string(),
                            error,
                        },
                        false,
                    )),
                    Ok(()) => self
                        .run_after_pre_validation(deadline, &mut issues, &mut results, &mut completed)
                        .await
                        .err()
                        .map(|failure| (failure, true)),
                }
            }
        };

        let (state, failed_step, error) = match failure {
            None => (TransactionState::Completed, None, None),
            Some((failure, reached_steps)) => {
                let state = if reached_steps && self.options.rollback_on_failure {
                    rollback = self.roll_back(&completed).await;
                    TransactionState::RolledBack
                } else {
                    TransactionState::Failed
                };
                (state, Some(failure.step), Some(failure.error))
            }
        };
        drop(locks);

        self.state = state;
        let result = TransactionResult {
            id: self.id.clone(),
            source: self.ctx.source.as_ref().map(|a| a.alias.clone()),
            target: self.ctx.target.alias.clone(),
            state,
            success: state == TransactionState::Completed,
            steps: results,
            failed_step,
            error,
            rollback,
            validation_issues: issues,
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
            binding: self.ctx.binding.clone(),
        };
        let meta = serde_json::json!({
            "id": result.id,
            "state": result.state,
            "failed_step": result.failed_step,
            "duration_ms": result.duration_ms,
        });
        if result.success {
            self.ctx.logger.info("Switch completed", Some(&meta));
        } else {
            self.ctx.logger.error("Switch did not complete", Some(&meta));
        }
        self.result = Some(result.clone());
        Ok(result)
    }

    async fn run_after_pre_validation(
        &mut self,
        deadline: Instant,
        issues: &mut Vec<ValidationIssue>,
        results: &mut Vec<SwitchStepResult>,
        completed: &mut Vec<usize>,
    ) -> Result<(), Failure> {
        self.run_steps(deadline, results, completed).await?;

        if self.options.post_validation {
            let report = post_switch_report(&self.ctx).await;
            let failed = report.has_errors();
            let summary = report.summary();
            issues.extend(report.issues);
            if failed {
                return Err(Failure {
                    step: POST_VALIDATION.to_string(),
                    error: PersonaError::new(
                        PersonaErrorKind::Execution,
                        "POST_VALIDATION_FAILED",
                        format!("Post-switch validation failed: {}", summary),
                    ),
                });
            }
            if Instant::now() > deadline {
                return Err(Failure {
                    step: POST_VALIDATION.to_string(),
                    error: self.deadline_error(POST_VALIDATION),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::TransactionState;

    #[test]
    fn terminal_states() {
        assert!(!TransactionState::Initialized.is_terminal());
        assert!(!TransactionState::InProgress.is_terminal());
        assert!(TransactionState::Completed.is_terminal());
        assert!(TransactionState::Failed.is_terminal());
        assert!(TransactionState::RolledBack.is_terminal());
    }
}
