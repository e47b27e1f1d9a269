use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonaErrorKind {
    InvalidParams,
    Precondition,
    NotFound,
    IsolationViolation,
    Execution,
    Rollback,
    Timeout,
    Conflict,
    Internal,
}

#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct PersonaError {
    pub kind: PersonaErrorKind,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl PersonaError {
    pub fn new(
        kind: PersonaErrorKind,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            hint: None,
            details: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(PersonaErrorKind::InvalidParams, "INVALID_PARAMS", message)
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(PersonaErrorKind::Precondition, "PRECONDITION_FAILED", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(PersonaErrorKind::NotFound, "NOT_FOUND", message)
    }

    pub fn isolation_violation(message: impl Into<String>) -> Self {
        Self::new(
            PersonaErrorKind::IsolationViolation,
            "ISOLATION_VIOLATION",
            message,
        )
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(PersonaErrorKind::Execution, "EXECUTION_FAILED", message)
    }

    pub fn rollback(message: impl Into<String>) -> Self {
        Self::new(PersonaErrorKind::Rollback, "ROLLBACK_FAILED", message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(PersonaErrorKind::Timeout, "TIMEOUT", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(PersonaErrorKind::Conflict, "CONFLICT", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(PersonaErrorKind::Internal, "INTERNAL", message)
    }

    pub fn is_isolation_violation(&self) -> bool {
        self.kind == PersonaErrorKind::IsolationViolation
    }
}

impl From<std::io::Error> for PersonaError {
    fn from(err: std::io::Error) -> Self {
        PersonaError::internal(err.to_string())
    }
}
