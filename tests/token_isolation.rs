mod common;
use common::tmp_dir;

use gitpersona::errors::PersonaErrorKind;
use gitpersona::services::logger::Logger;
use gitpersona::services::token::{IsolatedTokenService, TokenType};

fn service(dir: &std::path::Path) -> IsolatedTokenService {
    IsolatedTokenService::with_dir(Logger::silent("test"), dir).expect("token service")
}

#[test]
fn stored_token_round_trips_across_service_instances() {
    let dir = tmp_dir("gp-tokens");
    let tokens = service(&dir);
    for token in ["ghp_abc123", "github_pat_11AAAA_zzz", "  tok with spaces \n"] {
        tokens.store_token("work", token, "me-corp").expect("store");
        assert_eq!(tokens.get_token("work").expect("get"), token);
    }

    let reopened = service(&dir);
    assert_eq!(
        reopened.get_token("work").expect("get after reopen"),
        "  tok with spaces \n"
    );
}

#[test]
fn aliases_that_sanitize_alike_keep_separate_records() {
    let dir = tmp_dir("gp-tokens");
    let tokens = service(&dir);
    tokens.store_token("work.a", "ghp_AAA", "alice").expect("store work.a");
    tokens.store_token("work_a", "ghp_BBB", "bob").expect("store work_a");
    assert_ne!(tokens.record_path("work.a"), tokens.record_path("work_a"));

    let fresh = service(&dir);
    assert_eq!(fresh.get_token("work.a").expect("work.a"), "ghp_AAA");
    assert_eq!(fresh.get_token("work_a").expect("work_a"), "ghp_BBB");
    fresh
        .validate_token_isolation("work.a", "alice")
        .expect("alice owns work.a");
    fresh
        .validate_token_isolation("work_a", "bob")
        .expect("bob owns work_a");
    assert!(!fresh.backup_path("work_a").exists());
}

#[test]
fn record_on_disk_holds_only_ciphertext() {
    let dir = tmp_dir("gp-tokens");
    let tokens = service(&dir);
    let meta = tokens
        .store_token("work", "ghp_supersecretvalue", "me-corp")
        .expect("store");
    assert_eq!(meta.token_type, TokenType::ClassicPersonal);

    let raw = std::fs::read_to_string(tokens.record_path("work")).expect("record");
    assert!(!raw.contains("supersecretvalue"));
    let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
    assert_eq!(value["account"], "work");
    assert_eq!(value["username"], "me-corp");
    assert!(value["encrypted_token"].as_str().is_some());
    assert!(value["nonce"].as_str().is_some());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(tokens.record_path("work"))
            .expect("meta")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

#[test]
fn token_for_one_account_is_never_returned_for_another() {
    let dir = tmp_dir("gp-tokens");
    let tokens = service(&dir);
    tokens.store_token("work", "ghp_work", "me-corp").expect("store work");
    tokens
        .store_token("personal", "ghp_personal", "me-home")
        .expect("store personal");
    assert_eq!(tokens.get_token("work").expect("work"), "ghp_work");
    assert_eq!(tokens.get_token("personal").expect("personal"), "ghp_personal");

    // A record copied under another alias keeps its original account field.
    std::fs::copy(tokens.record_path("work"), tokens.record_path("stolen")).expect("copy");
    let fresh = service(&dir);
    let err = fresh.get_token("stolen").expect_err("must not return work's token");
    assert_eq!(err.kind, PersonaErrorKind::IsolationViolation);
    let meta = fresh
        .token_metadata("stolen")
        .expect("metadata")
        .expect("record present");
    assert!(!meta.is_valid);
}

#[test]
fn isolation_mismatch_marks_record_invalid() {
    let dir = tmp_dir("gp-tokens");
    let tokens = service(&dir);
    tokens.store_token("work", "ghp_work", "me-corp").expect("store");

    let err = tokens
        .validate_token_isolation("work", "me-home")
        .expect_err("wrong owner");
    assert!(err.is_isolation_violation());
    assert_eq!(err.details.as_ref().expect("details")["token_username"], "me-corp");

    let meta = tokens.token_metadata("work").expect("read").expect("present");
    assert!(!meta.is_valid);
    assert!(meta.invalid_reason.is_some());

    // Not auto-repaired, and persisted.
    let reopened = service(&dir);
    let err = reopened
        .validate_token_isolation("work", "me-corp")
        .expect_err("still invalid");
    assert_eq!(err.code, "TOKEN_INVALID");
    let err = reopened.get_token("work").expect_err("invalid token withheld");
    assert_eq!(err.code, "TOKEN_INVALID");
}

#[test]
fn successful_validation_counts_and_ignores_case() {
    let dir = tmp_dir("gp-tokens");
    let tokens = service(&dir);
    tokens.store_token("work", "ghp_work", "Me-Corp").expect("store");
    tokens.validate_token_isolation("work", "me-corp").expect("first");
    let meta = tokens.validate_token_isolation("work", "ME-CORP").expect("second");
    assert_eq!(meta.validation_count, 2);
    assert!(meta.last_validated.is_some());
    assert!(meta.is_valid);
}

#[test]
fn missing_token_is_not_found() {
    let dir = tmp_dir("gp-tokens");
    let tokens = service(&dir);
    let err = tokens.get_token("ghost").expect_err("missing");
    assert_eq!(err.kind, PersonaErrorKind::NotFound);
    let err = tokens
        .validate_token_isolation("ghost", "anyone")
        .expect_err("missing");
    assert_eq!(err.kind, PersonaErrorKind::NotFound);
    assert!(!tokens.has_token("ghost"));
}

#[test]
fn overwrite_keeps_backup_and_delete_removes_both() {
    let dir = tmp_dir("gp-tokens");
    let tokens = service(&dir);
    tokens.store_token("work", "ghp_old", "me-corp").expect("store old");
    tokens.store_token("work", "ghp_new", "me-corp").expect("store new");
    assert!(tokens.backup_path("work").exists());
    assert_eq!(tokens.get_token("work").expect("get"), "ghp_new");

    assert!(tokens.delete_token("work").expect("delete"));
    assert!(!tokens.record_path("work").exists());
    assert!(!tokens.backup_path("work").exists());
    assert!(!tokens.delete_token("work").expect("delete again"));
}

#[test]
fn list_tokens_reports_metadata_for_each_account() {
    let dir = tmp_dir("gp-tokens");
    let tokens = service(&dir);
    tokens.store_token("work", "ghp_work", "me-corp").expect("store");
    tokens.store_token("personal", "gho_home", "me-home").expect("store");
    let mut listed: Vec<String> = tokens
        .list_tokens()
        .expect("list")
        .into_iter()
        .map(|meta| meta.account)
        .collect();
    listed.sort();
    assert_eq!(listed, vec!["personal".to_string(), "work".to_string()]);
}

#[test]
fn empty_inputs_are_rejected() {
    let dir = tmp_dir("gp-tokens");
    let tokens = service(&dir);
    let err = tokens.store_token("work", "   ", "me").expect_err("empty token");
    assert_eq!(err.kind, PersonaErrorKind::InvalidParams);
    let err = tokens.store_token("work", "ghp_x", "").expect_err("empty user");
    assert_eq!(err.kind, PersonaErrorKind::InvalidParams);
    let err = tokens.store_token(" ", "ghp_x", "me").expect_err("empty alias");
    assert_eq!(err.kind, PersonaErrorKind::InvalidParams);
}
