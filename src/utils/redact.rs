const DEFAULT_REDACTION: &str = "[REDACTED]";

/// Renders a credential for logs: the classification prefix survives, the
/// secret part never does.
pub fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return DEFAULT_REDACTION.to_string();
    }
    let prefix = trimmed
        .find('_')
        .filter(|idx| *idx > 0 && *idx <= 10)
        .map(|idx| &trimmed[..=idx])
        .unwrap_or("");
    format!("{}{}", prefix, DEFAULT_REDACTION)
}

pub fn redact_text(text: &str, secrets: &[&str]) -> String {
    let mut out = text.to_string();
    for secret in secrets {
        if secret.len() < 4 {
            continue;
        }
        out = out.replace(secret, DEFAULT_REDACTION);
    }
    out
}
