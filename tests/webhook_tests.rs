//! Integration tests for webhook intake: signature verification, replay
//! deduplication, and event application.

use std::sync::Arc;
use task_relay::backends::{Backend, StubBackend};
use task_relay::config::Config;
use task_relay::db::{now_ms, Database};
use task_relay::error::ErrorCode;
use task_relay::triage;
use task_relay::types::{TaskIntake, TaskStatus};
use task_relay::webhook::{handle_delivery, WebhookDisposition};

/// Helper to create a fresh in-memory database for testing.
fn setup_db() -> Database {
    Database::open_in_memory().expect("Failed to create in-memory database")
}

fn setup_backend() -> Arc<StubBackend> {
    Arc::new(StubBackend::new("backend_a", "s3cret"))
}

/// Create a task bound to an external id on the stub backend.
fn mapped_task(db: &Database, external_id: &str) -> task_relay::types::Task {
    let config = Config::default();
    let intake = TaskIntake {
        title: "watched task".to_string(),
        description: None,
        client: "acme".to_string(),
        deadline: None,
        importance: Some(3),
        effort_hours: Some(1.0),
        labels: vec![],
        source: "api".to_string(),
    };
    let task = triage::triage_intake(&intake, &config, now_ms()).unwrap();
    db.create_task_with_intents(&task, &[]).unwrap();
    db.upsert_mapping("backend_a", external_id, &task.id).unwrap();
    task
}

fn signed(backend: &StubBackend, body: &[u8]) -> String {
    backend.signature().sign(body)
}

mod signature_tests {
    use super::*;

    #[test]
    fn bad_signature_is_rejected_with_no_state_change() {
        let db = setup_db();
        let backend = setup_backend();
        let body = br#"{"delivery_id":"d1","task_id":"ext1"}"#;

        let err = handle_delivery(&db, backend.as_ref(), body, "deadbeef").unwrap_err();
        assert_eq!(err.code, ErrorCode::SignatureFailure);

        // Nothing recorded anywhere.
        assert_eq!(db.delivery_count().unwrap(), 0);
        assert_eq!(db.audit_event_count("webhook_applied").unwrap(), 0);
    }

    #[test]
    fn missing_signature_is_rejected() {
        let db = setup_db();
        let backend = setup_backend();
        let body = br#"{"delivery_id":"d1"}"#;

        let err = handle_delivery(&db, backend.as_ref(), body, "").unwrap_err();
        assert_eq!(err.code, ErrorCode::SignatureFailure);
    }

    #[test]
    fn tampered_body_fails_verification() {
        let db = setup_db();
        let backend = setup_backend();
        let body = br#"{"delivery_id":"d1","task_id":"ext1"}"#;
        let signature = signed(&backend, body);

        let tampered = br#"{"delivery_id":"d1","task_id":"ext2"}"#;
        let err = handle_delivery(&db, backend.as_ref(), tampered, &signature).unwrap_err();
        assert_eq!(err.code, ErrorCode::SignatureFailure);
    }
}

mod dedup_tests {
    use super::*;

    #[test]
    fn replayed_delivery_is_accepted_once() {
        let db = setup_db();
        let backend = setup_backend();
        let task = mapped_task(&db, "ext42");

        let activity_before = db.get_task(&task.id).unwrap().unwrap().last_activity_at;

        let body = br#"{"delivery_id":"d1","task_id":"ext42"}"#.to_vec();
        let signature = signed(&backend, &body);

        // First call: fresh, activity updated.
        let first = handle_delivery(&db, backend.as_ref(), &body, &signature).unwrap();
        assert_eq!(first, WebhookDisposition::Applied);
        let activity_after = db.get_task(&task.id).unwrap().unwrap().last_activity_at;
        assert!(activity_after >= activity_before);

        // Second call with the same delivery id: duplicate, no state change.
        let second = handle_delivery(&db, backend.as_ref(), &body, &signature).unwrap();
        assert_eq!(second, WebhookDisposition::Duplicate);
        assert_eq!(db.delivery_count().unwrap(), 1);
        assert_eq!(db.audit_event_count("webhook_applied").unwrap(), 1);
    }

    #[test]
    fn distinct_delivery_ids_both_apply() {
        let db = setup_db();
        let backend = setup_backend();
        mapped_task(&db, "ext42");

        for delivery in ["d1", "d2"] {
            let body = format!(r#"{{"delivery_id":"{}","task_id":"ext42"}}"#, delivery);
            let signature = signed(&backend, body.as_bytes());
            let disposition =
                handle_delivery(&db, backend.as_ref(), body.as_bytes(), &signature).unwrap();
            assert_eq!(disposition, WebhookDisposition::Applied);
        }
        assert_eq!(db.delivery_count().unwrap(), 2);
    }

    #[test]
    fn ledger_pruning_respects_the_cutoff() {
        let db = setup_db();
        db.record_delivery("old", "backend_a", "hash").unwrap();

        // Nothing is old enough yet.
        assert_eq!(db.prune_deliveries(now_ms() - 1_000).unwrap(), 0);
        // Everything before a future cutoff goes.
        assert_eq!(db.prune_deliveries(now_ms() + 1_000).unwrap(), 1);
        assert_eq!(db.delivery_count().unwrap(), 0);
    }
}

mod apply_tests {
    use super::*;

    #[test]
    fn event_updates_activity_and_status() {
        let db = setup_db();
        let backend = setup_backend();
        let task = mapped_task(&db, "ext7");

        let ts = now_ms() + 1_000;
        let body = format!(
            r#"{{"delivery_id":"d9","task_id":"ext7","status":"in_progress","timestamp":{}}}"#,
            ts
        );
        let signature = signed(&backend, body.as_bytes());

        let disposition =
            handle_delivery(&db, backend.as_ref(), body.as_bytes(), &signature).unwrap();
        assert_eq!(disposition, WebhookDisposition::Applied);

        let loaded = db.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::InProgress);
        assert_eq!(loaded.last_activity_at, ts);
    }

    #[test]
    fn stale_status_regression_is_ignored() {
        let db = setup_db();
        let backend = setup_backend();
        let task = mapped_task(&db, "ext8");
        db.set_status(&task.id, TaskStatus::Completed, None).unwrap();

        // Event older than our state tries to move the task back.
        let body = format!(
            r#"{{"delivery_id":"d10","task_id":"ext8","status":"in_progress","timestamp":{}}}"#,
            now_ms() - 60_000
        );
        let signature = signed(&backend, body.as_bytes());
        handle_delivery(&db, backend.as_ref(), body.as_bytes(), &signature).unwrap();

        assert_eq!(
            db.get_task(&task.id).unwrap().unwrap().status,
            TaskStatus::Completed
        );
    }

    #[test]
    fn unmapped_external_id_is_recorded_not_applied() {
        let db = setup_db();
        let backend = setup_backend();

        let body = br#"{"delivery_id":"d11","task_id":"ext_nobody"}"#;
        let signature = signed(&backend, body);

        let disposition = handle_delivery(&db, backend.as_ref(), body, &signature).unwrap();
        assert_eq!(disposition, WebhookDisposition::Unmapped);
        assert_eq!(db.audit_event_count("webhook_unmapped").unwrap(), 1);
        // The delivery still counts toward replay protection.
        assert_eq!(db.delivery_count().unwrap(), 1);
    }
}
