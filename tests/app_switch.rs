mod common;
use common::{Harness, ENV_LOCK};

use gitpersona::app::{App, SwitchRequest};
use gitpersona::errors::PersonaErrorKind;
use gitpersona::managers::switch::TransactionState;
use gitpersona::services::accounts::{AccountLookup, FileAccountStore};
use serde_json::Value;
use std::sync::Arc;

fn app_with_accounts(h: &Harness) -> (App, Arc<FileAccountStore>) {
    let work_key = h.key("work");
    let personal_key = h.key("personal");
    let path = h.root.join("accounts.json");
    let doc = serde_json::json!({
        "accounts": {
            "work": {
                "alias": "work",
                "name": "Work Person",
                "email": "me@corp.example",
                "github_username": "me-corp",
                "ssh_key_path": work_key,
            },
            "personal": {
                "alias": "personal",
                "name": "Home Person",
                "email": "me@home.example",
                "github_username": "me-home",
                "ssh_key_path": personal_key,
            }
        },
        "current_account": "work"
    });
    std::fs::write(&path, serde_json::to_string_pretty(&doc).expect("json")).expect("accounts");
    let store = Arc::new(FileAccountStore::open(&path).expect("store"));
    let mut app = App::from_parts(
        h.logger.clone(),
        store.clone(),
        h.tokens.clone(),
        h.ssh.clone(),
        h.fake.clone(),
    );
    app.store = Some(store.clone());
    (app, store)
}

#[tokio::test]
async fn switch_uses_current_account_as_source_and_records_target() {
    let _guard = ENV_LOCK.lock().await;
    let h = Harness::new("gp-app");
    let (app, store) = app_with_accounts(&h);
    app.token_service
        .store_token("personal", "ghp_home", "me-home")
        .expect("token");

    let result = app
        .switch(
            SwitchRequest {
                target: "personal".to_string(),
                ..SwitchRequest::default()
            },
            h.options(),
        )
        .await
        .expect("switch");

    assert_eq!(result.state, TransactionState::Completed, "{:?}", result.error);
    assert_eq!(result.source.as_deref(), Some("work"));
    assert_eq!(store.current_alias().as_deref(), Some("personal"));
    assert_eq!(
        std::env::var("GITPERSONA_ACCOUNT").ok().as_deref(),
        Some("personal")
    );

    let reopened = FileAccountStore::open(&h.root.join("accounts.json")).expect("reopen");
    assert_eq!(reopened.current_alias().as_deref(), Some("personal"));

    let status = app.status().expect("status");
    assert_eq!(
        status.get("current_account").and_then(Value::as_str),
        Some("personal")
    );
    let agents = status
        .get("active_agents")
        .and_then(Value::as_array)
        .expect("agents");
    assert_eq!(agents.len(), 1);
}

#[tokio::test]
async fn failed_switch_keeps_current_account() {
    let _guard = ENV_LOCK.lock().await;
    let h = Harness::new("gp-app");
    let (app, store) = app_with_accounts(&h);

    let result = app
        .switch(
            SwitchRequest {
                target: "personal".to_string(),
                ..SwitchRequest::default()
            },
            h.options(),
        )
        .await
        .expect("switch");

    assert_eq!(result.state, TransactionState::Failed);
    assert_eq!(
        result.error.as_ref().map(|e| e.kind),
        Some(PersonaErrorKind::NotFound)
    );
    assert_eq!(store.current_alias().as_deref(), Some("work"));
}

#[tokio::test]
async fn unknown_target_is_not_found() {
    let h = Harness::new("gp-app");
    let (app, _store) = app_with_accounts(&h);
    let err = app
        .switch(
            SwitchRequest {
                target: "ghost".to_string(),
                ..SwitchRequest::default()
            },
            h.options(),
        )
        .await
        .expect_err("unknown account");
    assert_eq!(err.kind, PersonaErrorKind::NotFound);
}

#[tokio::test]
async fn token_validation_checks_the_configured_username() {
    let h = Harness::new("gp-app");
    let (app, _store) = app_with_accounts(&h);
    app.token_service
        .store_token("work", "ghp_work", "someone-else")
        .expect("token");

    let err = app
        .validate_token("work", false)
        .await
        .expect_err("owner mismatch");
    assert!(err.is_isolation_violation());
    assert!(app.delete_token("work").expect("delete"));
}

#[tokio::test]
async fn cleanup_stops_agents_started_by_switch() {
    let _guard = ENV_LOCK.lock().await;
    let h = Harness::new("gp-app");
    let (app, _store) = app_with_accounts(&h);

    let mut options = h.options();
    options.skip_token_validation = true;
    let result = app
        .switch(
            SwitchRequest {
                target: "personal".to_string(),
                ..SwitchRequest::default()
            },
            options,
        )
        .await
        .expect("switch");
    assert_eq!(result.state, TransactionState::Completed, "{:?}", result.error);
    assert!(!result.executed_steps().contains(&"token_isolation"));

    let report = app.cleanup().await;
    assert_eq!(report.stopped_agents, vec!["personal".to_string()]);
    assert!(h.fake.alive_pids().is_empty());
}

#[tokio::test]
async fn validate_account_reports_owner_mismatch_without_invalidating() {
    let h = Harness::new("gp-app");
    let (app, _store) = app_with_accounts(&h);
    app.token_service
        .store_token("work", "ghp_work", "someone-else")
        .expect("token");

    let report = app.validate_account("work", false).await.expect("report");
    assert!(report.has_errors());
    assert!(report
        .errors()
        .any(|issue| issue.code == "TOKEN_OWNER_MISMATCH"));
    let meta = app
        .token_service
        .token_metadata("work")
        .expect("read")
        .expect("present");
    assert!(meta.is_valid);

    let err = app.validate_account("ghost", false).await.expect_err("unknown");
    assert_eq!(err.kind, PersonaErrorKind::NotFound);
}
