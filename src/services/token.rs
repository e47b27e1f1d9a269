use crate::constants::permissions::PRIVATE_FILE;
use crate::errors::{PersonaError, PersonaErrorKind};
use crate::services::logger::Logger;
use crate::services::security::{SealedSecret, TokenCipher};
use crate::utils::fs_atomic::{atomic_write_text_file, ensure_private_dir, remove_file_if_exists};
use crate::utils::paths::{account_file_stem, resolve_tokens_dir};
use crate::utils::redact::redact_token;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

const KEY_FILE_NAME: &str = ".encryption.key";
const RECORD_EXTENSION: &str = "json";
const BACKUP_EXTENSION: &str = "json.bak";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    ClassicPersonal,
    FineGrainedPersonal,
    Oauth,
    UserToServer,
    ServerToServer,
    Refresh,
    LegacyPersonal,
    Unknown,
}

impl TokenType {
    pub fn classify(token: &str) -> Self {
        let token = token.trim();
        if token.starts_with("github_pat_") {
            return TokenType::FineGrainedPersonal;
        }
        match token.get(..4) {
            Some("ghp_") => TokenType::ClassicPersonal,
            Some("gho_") => TokenType::Oauth,
            Some("ghu_") => TokenType::UserToServer,
            Some("ghs_") => TokenType::ServerToServer,
            Some("ghr_") => TokenType::Refresh,
            _ if token.len() == 40 && token.chars().all(|c| c.is_ascii_hexdigit()) => {
                TokenType::LegacyPersonal
            }
            _ => TokenType::Unknown,
        }
    }
}

/// One account's stored credential. The plaintext never touches disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolatedAccountToken {
    pub account: String,
    pub encrypted_token: String,
    pub nonce: String,
    pub username: String,
    pub token_type: TokenType,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_validated: Option<DateTime<Utc>>,
    pub is_valid: bool,
    #[serde(default)]
    pub validation_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
}

impl IsolatedAccountToken {
    pub fn metadata(&self) -> TokenMetadata {
        TokenMetadata {
            account: self.account.clone(),
            username: self.username.clone(),
            token_type: self.token_type,
            created_at: self.created_at,
            last_used: self.last_used,
            last_validated: self.last_validated,
            is_valid: self.is_valid,
            validation_count: self.validation_count,
            invalid_reason: self.invalid_reason.clone(),
        }
    }

    fn sealed(&self) -> SealedSecret {
        SealedSecret {
            ciphertext: self.encrypted_token.clone(),
            nonce: self.nonce.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenMetadata {
    pub account: String,
    pub username: String,
    pub token_type: TokenType,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub last_validated: Option<DateTime<Utc>>,
    pub is_valid: bool,
    pub validation_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
}

pub fn usernames_match(left: &str, right: &str) -> bool {
    let left = left.trim();
    !left.is_empty() && left.eq_ignore_ascii_case(right.trim())
}

#[derive(Clone)]
pub struct IsolatedTokenService {
    logger: Logger,
    dir: PathBuf,
    cipher: TokenCipher,
    accounts: Arc<RwLock<HashMap<String, IsolatedAccountToken>>>,
}

impl IsolatedTokenService {
    pub fn new(logger: Logger) -> Result<Self, PersonaError> {
        Self::with_dir(logger, &resolve_tokens_dir())
    }

    pub fn with_dir(logger: Logger, dir: &Path) -> Result<Self, PersonaError> {
        ensure_private_dir(dir).map_err(|err| {
            PersonaError::internal(format!("Failed to create token directory: {}", err))
        })?;
        let cipher = TokenCipher::load_or_create(&dir.join(KEY_FILE_NAME))?;
        Ok(Self {
            logger: logger.child("tokens"),
            dir: dir.to_path_buf(),
            cipher,
            accounts: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.dir
    }

    /// File holding `alias`'s record. Unique per alias, see
    /// [`account_file_stem`].
    pub fn record_path(&self, alias: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", account_file_stem(alias), RECORD_EXTENSION))
    }

    pub fn backup_path(&self, alias: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", account_file_stem(alias), BACKUP_EXTENSION))
    }

    fn ensure_alias(alias: &str) -> Result<&str, PersonaError> {
        let trimmed = alias.trim();
        if trimmed.is_empty() {
            return Err(PersonaError::invalid_params(
                "Account alias must be a non-empty string",
            ));
        }
        Ok(trimmed)
    }

    fn read_record_from_disk(&self, alias: &str) -> Result<Option<IsolatedAccountToken>, PersonaError> {
        let path = self.record_path(alias);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(PersonaError::internal(format!(
                    "Failed to read token record for '{}': {}",
                    alias, err
                )))
            }
        };
        let record = serde_json::from_str(&raw).map_err(|err| {
            PersonaError::internal(format!(
                "Token record for '{}' is corrupt: {}",
                alias, err
            ))
            .with_hint("Store the token again to replace the record.")
        })?;
        Ok(Some(record))
    }

    /// Writes `record` to `alias`'s file, which for a misfiled record is not
    /// the file named by its `account` field.
    fn persist_record(&self, alias: &str, record: &IsolatedAccountToken) -> Result<(), PersonaError> {
        let data = serde_json::to_string_pretty(record).map_err(|err| {
            PersonaError::internal(format!("Failed to serialize token record: {}", err))
        })?;
        atomic_write_text_file(
            self.record_path(alias),
            &format!("{}\n", data),
            PRIVATE_FILE,
        )
        .map_err(|err| PersonaError::internal(format!("Failed to save token record: {}", err)))
    }

    /// Returns the cached record, loading it from disk on first access.
    fn load_record(
        &self,
        guard: &mut HashMap<String, IsolatedAccountToken>,
        alias: &str,
    ) -> Result<Option<IsolatedAccountToken>, PersonaError> {
        if let Some(record) = guard.get(alias) {
            return Ok(Some(record.clone()));
        }
        let Some(record) = self.read_record_from_disk(alias)? else {
            return Ok(None);
        };
        guard.insert(alias.to_string(), record.clone());
        Ok(Some(record))
    }

    fn missing_token(alias: &str) -> PersonaError {
        PersonaError::not_found(format!("No token stored for account '{}'", alias))
            .with_hint(format!("Run: gitpersona token store {} --token <token>", alias))
    }

    fn invalidate(
        &self,
        guard: &mut HashMap<String, IsolatedAccountToken>,
        mut record: IsolatedAccountToken,
        alias: &str,
        reason: String,
    ) {
        record.is_valid = false;
        record.invalid_reason = Some(reason.clone());
        if let Err(err) = self.persist_record(alias, &record) {
            self.logger.error(
                "Failed to persist token invalidation",
                Some(&serde_json::json!({"account": alias, "error": err.message})),
            );
        }
        guard.insert(alias.to_string(), record);
        self.logger.warn(
            "Token marked invalid",
            Some(&serde_json::json!({"account": alias, "reason": reason})),
        );
    }

    pub fn store_token(
        &self,
        alias: &str,
        token: &str,
        username: &str,
    ) -> Result<TokenMetadata, PersonaError> {
        let alias = Self::ensure_alias(alias)?;
        // Sealed byte for byte; only a blank token is refused.
        if token.trim().is_empty() {
            return Err(PersonaError::invalid_params("Token must be a non-empty string"));
        }
        let username = username.trim();
        if username.is_empty() {
            return Err(PersonaError::invalid_params(
                "Token owner username must be a non-empty string",
            ));
        }

        let sealed = self.cipher.seal(token)?;
        let record = IsolatedAccountToken {
            account: alias.to_string(),
            encrypted_token: sealed.ciphertext,
            nonce: sealed.nonce,
            username: username.to_string(),
            token_type: TokenType::classify(token),
            created_at: Utc::now(),
            last_used: None,
            last_validated: None,
            is_valid: true,
            validation_count: 0,
            invalid_reason: None,
        };

        let mut guard = self.accounts.write().unwrap_or_else(|err| err.into_inner());
        let path = self.record_path(alias);
        if path.exists() {
            let backup = self.backup_path(alias);
            let previous = std::fs::read_to_string(&path).map_err(|err| {
                PersonaError::internal(format!("Failed to back up token record: {}", err))
            })?;
            atomic_write_text_file(&backup, &previous, PRIVATE_FILE).map_err(|err| {
                PersonaError::internal(format!("Failed to back up token record: {}", err))
            })?;
        }
        self.persist_record(alias, &record)?;
        guard.insert(alias.to_string(), record.clone());
        drop(guard);

        self.logger.info(
            "Token stored",
            Some(&serde_json::json!({
                "account": alias,
                "username": username,
                "token": redact_token(token),
                "token_type": record.token_type,
            })),
        );
        Ok(record.metadata())
    }

    pub fn get_token(&self, alias: &str) -> Result<String, PersonaError> {
        let alias = Self::ensure_alias(alias)?;
        let mut guard = self.accounts.write().unwrap_or_else(|err| err.into_inner());
        let mut record = self
            .load_record(&mut guard, alias)?
            .ok_or_else(|| Self::missing_token(alias))?;

        if record.account != alias {
            let reason = format!(
                "record belongs to account '{}', requested by '{}'",
                record.account, alias
            );
            self.invalidate(&mut guard, record, alias, reason.clone());
            return Err(PersonaError::isolation_violation(format!(
                "Token isolation violation for account '{}': {}",
                alias, reason
            )));
        }
        if !record.is_valid {
            return Err(PersonaError::new(
                PersonaErrorKind::Precondition,
                "TOKEN_INVALID",
                format!("Token for account '{}' is marked invalid", alias),
            )
            .with_hint("Store a fresh token for this account.")
            .with_details(serde_json::json!({"reason": record.invalid_reason})));
        }

        let token = self.cipher.open(&record.sealed())?;
        record.last_used = Some(Utc::now());
        if let Err(err) = self.persist_record(alias, &record) {
            self.logger.warn(
                "Failed to persist token last_used",
                Some(&serde_json::json!({"account": alias, "error": err.message})),
            );
        }
        guard.insert(alias.to_string(), record);
        Ok(token)
    }

    /// The single enforcement point binding a token to its owner. A mismatch
    /// flips the record to invalid before the error is returned.
    pub fn validate_token_isolation(
        &self,
        alias: &str,
        expected_username: &str,
    ) -> Result<TokenMetadata, PersonaError> {
        let alias = Self::ensure_alias(alias)?;
        let mut guard = self.accounts.write().unwrap_or_else(|err| err.into_inner());
        let mut record = self
            .load_record(&mut guard, alias)?
            .ok_or_else(|| Self::missing_token(alias))?;

        let owner_mismatch = !usernames_match(&record.username, expected_username);
        if record.account != alias || owner_mismatch {
            let reason = if owner_mismatch {
                format!(
                    "token owner '{}' does not match expected user '{}'",
                    record.username, expected_username
                )
            } else {
                format!(
                    "record belongs to account '{}', requested by '{}'",
                    record.account, alias
                )
            };
            let details = serde_json::json!({
                "account": alias,
                "expected_username": expected_username,
                "token_username": record.username,
            });
            self.invalidate(&mut guard, record, alias, reason.clone());
            return Err(PersonaError::isolation_violation(format!(
                "Token isolation violation for account '{}': {}",
                alias, reason
            ))
            .with_details(details));
        }
        if !record.is_valid {
            return Err(PersonaError::new(
                PersonaErrorKind::Precondition,
                "TOKEN_INVALID",
                format!("Token for account '{}' is marked invalid", alias),
            )
            .with_hint("Store a fresh token for this account.")
            .with_details(serde_json::json!({"reason": record.invalid_reason})));
        }

        record.last_validated = Some(Utc::now());
        record.validation_count += 1;
        self.persist_record(alias, &record)?;
        let metadata = record.metadata();
        guard.insert(alias.to_string(), record);
        Ok(metadata)
    }

    pub fn delete_token(&self, alias: &str) -> Result<bool, PersonaError> {
        let alias = Self::ensure_alias(alias)?;
        let mut guard = self.accounts.write().unwrap_or_else(|err| err.into_inner());
        guard.remove(alias);
        let removed = remove_file_if_exists(self.record_path(alias)).map_err(|err| {
            PersonaError::internal(format!("Failed to delete token record: {}", err))
        })?;
        remove_file_if_exists(self.backup_path(alias)).map_err(|err| {
            PersonaError::internal(format!("Failed to delete token backup: {}", err))
        })?;
        drop(guard);
        if removed {
            self.logger
                .info("Token deleted", Some(&serde_json::json!({"account": alias})));
        }
        Ok(removed)
    }

    pub fn has_token(&self, alias: &str) -> bool {
        self.token_metadata(alias).ok().flatten().is_some()
    }

    /// Reads a record's metadata without touching its usage counters.
    pub fn token_metadata(&self, alias: &str) -> Result<Option<TokenMetadata>, PersonaError> {
        let alias = Self::ensure_alias(alias)?;
        {
            let guard = self.accounts.read().unwrap_or_else(|err| err.into_inner());
            if let Some(record) = guard.get(alias) {
                return Ok(Some(record.metadata()));
            }
        }
        let mut guard = self.accounts.write().unwrap_or_else(|err| err.into_inner());
        Ok(self
            .load_record(&mut guard, alias)?
            .map(|record| record.metadata()))
    }

    pub fn list_tokens(&self) -> Result<Vec<TokenMetadata>, PersonaError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|err| {
            PersonaError::internal(format!("Failed to list token directory: {}", err))
        })?;
        let mut out = Vec::new();
        for entry in entries.filter_map(Result::ok) {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !name.ends_with(&format!(".{}", RECORD_EXTENSION)) {
                continue;
            }
            let raw = match std::fs::read_to_string(entry.path()) {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            match serde_json::from_str::<IsolatedAccountToken>(&raw) {
                Ok(record) => out.push(record.metadata()),
                Err(_) => self.logger.warn(
                    "Skipping unreadable token record",
                    Some(&serde_json::json!({"file": name})),
                ),
            }
        }
        out.sort_by(|a, b| a.account.cmp(&b.account));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::{usernames_match, TokenType};

    #[test]
    fn classify_token_prefixes() {
        assert_eq!(TokenType::classify("ghp_abc"), TokenType::ClassicPersonal);
        assert_eq!(
            TokenType::classify("github_pat_11ABC"),
            TokenType::FineGrainedPersonal
        );
        assert_eq!(TokenType::classify("gho_abc"), TokenType::Oauth);
        assert_eq!(TokenType::classify("ghu_abc"), TokenType::UserToServer);
        assert_eq!(TokenType::classify("ghs_abc"), TokenType::ServerToServer);
        assert_eq!(TokenType::classify("ghr_abc"), TokenType::Refresh);
        assert_eq!(
            TokenType::classify("0123456789abcdef0123456789abcdef01234567"),
            TokenType::LegacyPersonal
        );
        assert_eq!(TokenType::classify("hello"), TokenType::Unknown);
        assert_eq!(TokenType::classify("é"), TokenType::Unknown);
    }

    #[test]
    fn usernames_compare_case_insensitively_but_never_match_empty() {
        assert!(usernames_match("Octocat", "octocat"));
        assert!(!usernames_match("octocat", "someone-else"));
        assert!(!usernames_match("", ""));
    }
}
