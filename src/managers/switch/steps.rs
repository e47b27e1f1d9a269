use super::{SessionBinding, SwitchContext};
use crate::errors::PersonaError;
use crate::services::accounts::Account;
use crate::services::command::CommandRequest;
use crate::services::validation::{ValidationIssue, ValidationReport};
use std::path::{Path, PathBuf};

const SSH_ISOLATION: &str = "ssh_isolation";
const TOKEN_ISOLATION: &str = "token_isolation";
const GIT_CONFIGURATION: &str = "git_configuration";
const ENVIRONMENT_BINDING: &str = "environment_binding";
const COMPREHENSIVE_VALIDATION: &str = "comprehensive_validation";

#[derive(Debug, Clone, Copy)]
enum GitScope<'a> {
    Global,
    Local(&'a Path),
}

fn git_request(scope: GitScope<'_>) -> CommandRequest {
    match scope {
        GitScope::Global => CommandRequest::new("git").args(["config", "--global"]),
        GitScope::Local(dir) => CommandRequest::new("git")
            .arg("-C")
            .arg(dir.display().to_string())
            .args(["config", "--local"]),
    }
}

async fn git_get(
    ctx: &SwitchContext,
    scope: GitScope<'_>,
    key: &str,
) -> Result<Option<String>, PersonaError> {
    let request = git_request(scope).args(["--get", key]);
    let output = ctx.executor.run(request.clone()).await?;
    match output.exit_code {
        Some(0) => Ok(Some(output.stdout_trimmed().to_string())),
        Some(1) => Ok(None),
        _ => output.into_result(&request).map(|_| None),
    }
}

async fn git_set(
    ctx: &SwitchContext,
    scope: GitScope<'_>,
    key: &str,
    value: &str,
) -> Result<(), PersonaError> {
    let request = git_request(scope).args([key, value]);
    ctx.executor
        .run(request.clone())
        .await?
        .into_result(&request)?;
    Ok(())
}

async fn git_unset(ctx: &SwitchContext, scope: GitScope<'_>, key: &str) -> Result<(), PersonaError> {
    let request = git_request(scope).args(["--unset", key]);
    let output = ctx.executor.run(request.clone()).await?;
    // git exits 5 when the key was not set
    if output.exit_code == Some(5) {
        return Ok(());
    }
    output.into_result(&request)?;
    Ok(())
}

async fn inside_work_tree(ctx: &SwitchContext, dir: &Path) -> bool {
    let request = CommandRequest::new("git")
        .arg("-C")
        .arg(dir.display().to_string())
        .args(["rev-parse", "--is-inside-work-tree"]);
    match ctx.executor.run(request).await {
        Ok(output) => output.success() && output.stdout_trimmed() == "true",
        Err(_) => false,
    }
}

pub fn render_git_ssh_command(key_path: &Path) -> String {
    let rendered = key_path.display().to_string().replace('\'', "'\\''");
    format!("ssh -i '{}' -o IdentitiesOnly=yes", rendered)
}

/// The three Git settings a switch owns, as observed or as desired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitIdentitySnapshot {
    pub name: Option<String>,
    pub email: Option<String>,
    pub ssh_command: Option<String>,
}

impl GitIdentitySnapshot {
    pub fn for_account(account: &Account) -> Self {
        Self {
            name: Some(account.name.clone()),
            email: Some(account.email.clone()),
            ssh_command: account.key_path().map(|key| render_git_ssh_command(&key)),
        }
    }

    async fn capture(ctx: &SwitchContext, scope: GitScope<'_>) -> Result<Self, PersonaError> {
        Ok(Self {
            name: git_get(ctx, scope, "user.name").await?,
            email: git_get(ctx, scope, "user.email").await?,
            ssh_command: git_get(ctx, scope, "core.sshCommand").await?,
        })
    }

    async fn apply(&self, ctx: &SwitchContext, scope: GitScope<'_>) -> Result<(), PersonaError> {
        for (key, value) in [
            ("user.name", &self.name),
            ("user.email", &self.email),
            ("core.sshCommand", &self.ssh_command),
        ] {
            match value {
                Some(value) => git_set(ctx, scope, key, value).await?,
                None => git_unset(ctx, scope, key).await?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct SshIsolationStep {
    stopped_agents: Vec<String>,
}

impl SshIsolationStep {
    fn target_key(ctx: &SwitchContext) -> Result<PathBuf, PersonaError> {
        let key = ctx.target.key_path().ok_or_else(|| {
            PersonaError::precondition(format!(
                "Account '{}' has no SSH key configured",
                ctx.target.alias
            ))
        })?;
        if !key.is_file() {
            return Err(PersonaError::precondition(format!(
                "SSH key for account '{}' not found: {}",
                ctx.target.alias,
                key.display()
            )));
        }
        Ok(key)
    }

    async fn validate(&self, ctx: &SwitchContext) -> Result<(), PersonaError> {
        Self::target_key(ctx).map(|_| ())
    }

    async fn execute(&mut self, ctx: &mut SwitchContext) -> Result<(), PersonaError> {
        let key = Self::target_key(ctx)?;
        if ctx.target.isolation_level.stops_foreign_agents() {
            self.stopped_agents = ctx.ssh_manager.stop_other_agents(&ctx.target.alias).await?;
            if !self.stopped_agents.is_empty() {
                ctx.logger.info(
                    "Stopped other accounts' agents",
                    Some(&serde_json::json!({"stopped": self.stopped_agents})),
                );
            }
        }
        ctx.ssh_manager.switch_to_account(&ctx.target, &key).await?;
        Ok(())
    }

    async fn rollback(&mut self, ctx: &mut SwitchContext) -> Result<(), PersonaError> {
        let same_account = ctx
            .source
            .as_ref()
            .map_or(false, |source| source.alias == ctx.target.alias);
        if !same_account {
            ctx.ssh_manager.stop_account_agent(&ctx.target.alias).await?;
        }
        if let Some(source) = ctx.source.clone() {
            if let Some(key) = source.key_path() {
                ctx.ssh_manager.switch_to_account(&source, &key).await?;
            }
        }
        self.stopped_agents.clear();
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct TokenIsolationStep;

impl TokenIsolationStep {
    async fn validate(&self, ctx: &SwitchContext) -> Result<(), PersonaError> {
        ctx.token_service
            .validate_token_isolation(&ctx.target.alias, &ctx.target.username)
            .map(|_| ())
    }

    async fn execute(&mut self, ctx: &mut SwitchContext) -> Result<(), PersonaError> {
        let metadata = ctx
            .token_service
            .validate_token_isolation(&ctx.target.alias, &ctx.target.username)?;
        ctx.logger.debug(
            "Token isolation confirmed",
            Some(&serde_json::json!({
                "account": metadata.account,
                "validations": metadata.validation_count,
            })),
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct GitConfigurationStep {
    previous_global: Option<GitIdentitySnapshot>,
    previous_local: Option<(PathBuf, GitIdentitySnapshot)>,
}

impl GitConfigurationStep {
    async fn validate(&self, ctx: &SwitchContext) -> Result<(), PersonaError> {
        if ctx.target.name.trim().is_empty() || ctx.target.email.trim().is_empty() {
            return Err(PersonaError::precondition(format!(
                "Account '{}' needs both a name and an email for Git",
                ctx.target.alias
            )));
        }
        Ok(())
    }

    async fn execute(&mut self, ctx: &mut SwitchContext) -> Result<(), PersonaError> {
        self.validate(ctx).await?;
        let desired = GitIdentitySnapshot::for_account(&ctx.target);

        self.previous_global = Some(GitIdentitySnapshot::capture(ctx, GitScope::Global).await?);
        if let Err(err) = self.apply_desired(ctx, &desired).await {
            return Err(self.restore_captured(ctx, err).await);
        }
        ctx.logger.info(
            "Git identity configured",
            Some(&serde_json::json!({
                "account": ctx.target.alias,
                "email": ctx.target.email,
                "local": self.previous_local.as_ref().map(|(dir, _)| dir),
            })),
        );
        Ok(())
    }

    async fn apply_desired(
        &mut self,
        ctx: &SwitchContext,
        desired: &GitIdentitySnapshot,
    ) -> Result<(), PersonaError> {
        desired.apply(ctx, GitScope::Global).await?;
        if let Some(dir) = ctx.repo_dir.clone() {
            if inside_work_tree(ctx, &dir).await {
                let previous = GitIdentitySnapshot::capture(ctx, GitScope::Local(&dir)).await?;
                self.previous_local = Some((dir.clone(), previous));
                desired.apply(ctx, GitScope::Local(&dir)).await?;
            }
        }
        Ok(())
    }

    /// Puts back the values captured before a partial write so a failed step
    /// leaves no half-applied identity. The step's error is returned, with
    /// any restore failure attached to its details.
    async fn restore_captured(&mut self, ctx: &SwitchContext, err: PersonaError) -> PersonaError {
        let mut restore_errors = Vec::new();
        if let Some(previous) = self.previous_global.take() {
            if let Err(restore) = previous.apply(ctx, GitScope::Global).await {
                restore_errors.push(restore.message);
            }
        }
        if let Some((dir, previous)) = self.previous_local.take() {
            if let Err(restore) = previous.apply(ctx, GitScope::Local(&dir)).await {
                restore_errors.push(restore.message);
            }
        }
        if restore_errors.is_empty() {
            ctx.logger.warn(
                "Git write failed, previous identity restored",
                Some(&serde_json::json!({"account": ctx.target.alias, "error": err.message})),
            );
            return err;
        }
        ctx.logger.error(
            "Git write failed and the previous identity could not be restored",
            Some(&serde_json::json!({
                "account": ctx.target.alias,
                "error": err.message,
                "restore_errors": restore_errors,
            })),
        );
        let mut details = match err.details.clone() {
            Some(serde_json::Value::Object(map)) => map,
            Some(other) => {
                let mut map = serde_json::Map::new();
                map.insert("cause".to_string(), other);
                map
            }
            None => serde_json::Map::new(),
        };
        details.insert("restore_errors".to_string(), serde_json::json!(restore_errors));
        err.with_details(serde_json::Value::Object(details))
    }

    /// Restores the source account's identity when there is one, otherwise
    /// whatever was configured before the switch.
    async fn rollback(&mut self, ctx: &mut SwitchContext) -> Result<(), PersonaError> {
        let global = ctx
            .source
            .as_ref()
            .map(GitIdentitySnapshot::for_account)
            .or_else(|| self.previous_global.clone());
        if let Some(global) = global {
            global.apply(ctx, GitScope::Global).await?;
        }
        if let Some((dir, previous)) = self.previous_local.take() {
            previous.apply(ctx, GitScope::Local(&dir)).await?;
        }
        self.previous_global = None;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct EnvironmentStep {
    previous: Option<SessionBinding>,
}

impl EnvironmentStep {
    pub fn previous_binding(&self) -> Option<&SessionBinding> {
        self.previous.as_ref()
    }

    async fn execute(&mut self, ctx: &mut SwitchContext) -> Result<(), PersonaError> {
        let socket = match ctx.target.key_path() {
            Some(_) => {
                let agent = ctx
                    .ssh_manager
                    .get_account_agent(&ctx.target.alias)
                    .filter(|agent| agent.running)
                    .ok_or_else(|| {
                        PersonaError::execution(format!(
                            "No running agent for account '{}' to bind",
                            ctx.target.alias
                        ))
                        .with_hint("Register the SSH isolation step before environment binding.")
                    })?;
                Some(agent.socket_path.display().to_string())
            }
            None => None,
        };
        let next = SessionBinding::for_account(&ctx.target.alias, socket);
        self.previous = Some(std::mem::replace(&mut ctx.binding, next));
        Ok(())
    }

    async fn rollback(&mut self, ctx: &mut SwitchContext) -> Result<(), PersonaError> {
        if let Some(previous) = self.previous.take() {
            ctx.binding = previous;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ValidationStep {
    report: Option<ValidationReport>,
}

impl ValidationStep {
    pub fn report(&self) -> Option<&ValidationReport> {
        self.report.as_ref()
    }

    async fn execute(&mut self, ctx: &mut SwitchContext) -> Result<(), PersonaError> {
        let report = post_switch_report(ctx).await;
        let failed = report.has_errors();
        let summary = report.summary();
        let issues = serde_json::to_value(&report.issues).unwrap_or_default();
        self.report = Some(report);
        if failed {
            return Err(
                PersonaError::execution(format!("Switch validation failed: {}", summary))
                    .with_details(serde_json::json!({"issues": issues})),
            );
        }
        Ok(())
    }
}

/// Checks the end state of a switch: Git identity, the target's agent and
/// its connectivity, and the session binding.
pub async fn post_switch_report(ctx: &SwitchContext) -> ValidationReport {
    let target = &ctx.target;
    let mut report = ValidationReport {
        account: target.alias.clone(),
        issues: Vec::new(),
    };

    match git_get(ctx, GitScope::Global, "user.email").await {
        Ok(Some(email)) if email == target.email => {}
        Ok(found) => report.issues.push(ValidationIssue::error(
            "GIT_EMAIL_MISMATCH",
            format!(
                "Git user.email is '{}', expected '{}'",
                found.unwrap_or_default(),
                target.email
            ),
        )),
        Err(err) => report
            .issues
            .push(ValidationIssue::error("GIT_UNREADABLE", err.message)),
    }
    match git_get(ctx, GitScope::Global, "user.name").await {
        Ok(Some(name)) if name == target.name => {}
        Ok(found) => report.issues.push(ValidationIssue::error(
            "GIT_NAME_MISMATCH",
            format!(
                "Git user.name is '{}', expected '{}'",
                found.unwrap_or_default(),
                target.name
            ),
        )),
        Err(err) => report
            .issues
            .push(ValidationIssue::error("GIT_UNREADABLE", err.message)),
    }

    if target.key_path().is_some() {
        let agent = ctx
            .ssh_manager
            .get_account_agent(&target.alias)
            .filter(|agent| agent.running);
        match agent.as_ref() {
            None => report.issues.push(ValidationIssue::error(
                "AGENT_NOT_RUNNING",
                format!("No running agent for account '{}'", target.alias),
            )),
            Some(agent) if agent.loaded_keys.len() != 1 => {
                report.issues.push(ValidationIssue::error(
                    "AGENT_KEYS_UNEXPECTED",
                    format!(
                        "Agent for '{}' holds {} keys, expected exactly one",
                        target.alias,
                        agent.loaded_keys.len()
                    ),
                ))
            }
            Some(_) => {}
        }
        if ctx.ssh_manager.config().test_connectivity {
            report
                .issues
                .extend(ctx.validation.validate_remote(target).await);
        }

        let expected_socket = agent.map(|agent| agent.socket_path.display().to_string());
        match ctx.binding.ssh_auth_sock.as_ref() {
            None => report.issues.push(ValidationIssue::error(
                "SSH_AUTH_SOCK_UNSET",
                "SSH_AUTH_SOCK is not bound to the account's agent",
            )),
            Some(sock) if !Path::new(sock).exists() => report.issues.push(ValidationIssue::error(
                "SSH_AUTH_SOCK_DEAD",
                format!("SSH_AUTH_SOCK points at a missing socket: {}", sock),
            )),
            Some(sock) if expected_socket.as_deref() != Some(sock.as_str()) => {
                report.issues.push(ValidationIssue::error(
                    "SSH_AUTH_SOCK_FOREIGN",
                    format!("SSH_AUTH_SOCK points at another agent: {}", sock),
                ))
            }
            Some(_) => {}
        }
    } else if let Some(sock) = ctx.binding.ssh_auth_sock.as_ref() {
        report.issues.push(ValidationIssue::error(
            "SSH_AUTH_SOCK_FOREIGN",
            format!(
                "Account '{}' has no key but SSH_AUTH_SOCK is still bound to {}",
                target.alias, sock
            ),
        ));
    }
    if let Some(pid) = ctx.binding.ssh_agent_pid.as_ref() {
        report.issues.push(ValidationIssue::error(
            "SSH_AGENT_PID_STALE",
            format!("SSH_AGENT_PID is still set to {}", pid),
        ));
    }
    report
}

/// A unit of switch work. The set is closed so rollback handling can be
/// exhaustive.
#[derive(Debug)]
pub enum SwitchStep {
    SshIsolation(SshIsolationStep),
    TokenIsolation(TokenIsolationStep),
    GitConfiguration(GitConfigurationStep),
    EnvironmentBinding(EnvironmentStep),
    Validation(ValidationStep),
}

impl SwitchStep {
    pub fn ssh_isolation() -> Self {
        SwitchStep::SshIsolation(SshIsolationStep::default())
    }

    pub fn token_isolation() -> Self {
        SwitchStep::TokenIsolation(TokenIsolationStep)
    }

    pub fn git_configuration() -> Self {
        SwitchStep::GitConfiguration(GitConfigurationStep::default())
    }

    pub fn environment_binding() -> Self {
        SwitchStep::EnvironmentBinding(EnvironmentStep::default())
    }

    pub fn validation() -> Self {
        SwitchStep::Validation(ValidationStep::default())
    }

    /// Steps for switching to `target`, in dependency order.
    pub fn plan_for(target: &Account, include_token: bool) -> Vec<SwitchStep> {
        let mut steps = Vec::new();
        if target.ssh_key_path.is_some() {
            steps.push(Self::ssh_isolation());
        }
        if include_token {
            steps.push(Self::token_isolation());
        }
        steps.push(Self::git_configuration());
        steps.push(Self::environment_binding());
        steps.push(Self::validation());
        steps
    }

    pub fn name(&self) -> &'static str {
        match self {
            SwitchStep::SshIsolation(_) => SSH_ISOLATION,
            SwitchStep::TokenIsolation(_) => TOKEN_ISOLATION,
            SwitchStep::GitConfiguration(_) => GIT_CONFIGURATION,
            SwitchStep::EnvironmentBinding(_) => ENVIRONMENT_BINDING,
            SwitchStep::Validation(_) => COMPREHENSIVE_VALIDATION,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            SwitchStep::SshIsolation(_) => "Start an isolated SSH agent holding only the target key",
            SwitchStep::TokenIsolation(_) => "Confirm the stored token belongs to the target user",
            SwitchStep::GitConfiguration(_) => "Set Git identity and SSH command for the target",
            SwitchStep::EnvironmentBinding(_) => "Bind SSH_AUTH_SOCK to the target's agent",
            SwitchStep::Validation(_) => "Verify Git identity, SSH agent, and environment",
        }
    }

    /// Informational only; the transaction runs steps in registration order.
    pub fn dependencies(&self) -> &'static [&'static str] {
        match self {
            SwitchStep::SshIsolation(_) => &[],
            SwitchStep::TokenIsolation(_) => &[],
            SwitchStep::GitConfiguration(_) => &[SSH_ISOLATION],
            SwitchStep::EnvironmentBinding(_) => &[SSH_ISOLATION],
            SwitchStep::Validation(_) => &[SSH_ISOLATION, GIT_CONFIGURATION, ENVIRONMENT_BINDING],
        }
    }

    pub fn can_rollback(&self) -> bool {
        match self {
            SwitchStep::SshIsolation(_)
            | SwitchStep::GitConfiguration(_)
            | SwitchStep::EnvironmentBinding(_) => true,
            SwitchStep::TokenIsolation(_) | SwitchStep::Validation(_) => false,
        }
    }

    pub async fn validate(&self, ctx: &SwitchContext) -> Result<(), PersonaError> {
        match self {
            SwitchStep::SshIsolation(step) => step.validate(ctx).await,
            SwitchStep::TokenIsolation(step) => step.validate(ctx).await,
            SwitchStep::GitConfiguration(step) => step.validate(ctx).await,
            SwitchStep::EnvironmentBinding(_) | SwitchStep::Validation(_) => Ok(()),
        }
    }

    pub async fn execute(&mut self, ctx: &mut SwitchContext) -> Result<(), PersonaError> {
        match self {
            SwitchStep::SshIsolation(step) => step.execute(ctx).await,
            SwitchStep::TokenIsolation(step) => step.execute(ctx).await,
            SwitchStep::GitConfiguration(step) => step.execute(ctx).await,
            SwitchStep::EnvironmentBinding(step) => step.execute(ctx).await,
            SwitchStep::Validation(step) => step.execute(ctx).await,
        }
    }

    pub async fn rollback(&mut self, ctx: &mut SwitchContext) -> Result<(), PersonaError> {
        match self {
            SwitchStep::SshIsolation(step) => step.rollback(ctx).await,
            SwitchStep::GitConfiguration(step) => step.rollback(ctx).await,
            SwitchStep::EnvironmentBinding(step) => step.rollback(ctx).await,
            SwitchStep::TokenIsolation(_) | SwitchStep::Validation(_) => Ok(()),
        }
    }
}
