//! Integration tests for the periodic jobs: aging re-scores, stale nudges,
//! retention pruning, and the advisory job locks that keep runs from
//! overlapping.

use task_relay::config::Config;
use task_relay::db::{now_ms, Database};
use task_relay::scheduler::{nudge_stale, prune_retention, rescore_aging};
use task_relay::triage;
use task_relay::types::{TaskIntake, TaskStatus};

/// Helper to create a fresh in-memory database for testing.
fn setup_db() -> Database {
    Database::open_in_memory().expect("Failed to create in-memory database")
}

const HOUR_MS: i64 = 3_600_000;

fn intake_with_deadline(title: &str, deadline_hours: i64) -> TaskIntake {
    let deadline = chrono::DateTime::from_timestamp_millis(now_ms() + deadline_hours * HOUR_MS)
        .unwrap()
        .to_rfc3339();
    TaskIntake {
        title: title.to_string(),
        description: None,
        client: "acme".to_string(),
        deadline: Some(deadline),
        importance: Some(3),
        effort_hours: Some(2.0),
        labels: vec![],
        source: "api".to_string(),
    }
}

mod lock_tests {
    use super::*;

    #[test]
    fn second_holder_is_refused_until_release() {
        let db = setup_db();

        assert!(db.try_acquire_job_lock("rescore", "worker-1", 60_000).unwrap());
        assert!(!db.try_acquire_job_lock("rescore", "worker-2", 60_000).unwrap());

        assert!(db.release_job_lock("rescore", "worker-1").unwrap());
        assert!(db.try_acquire_job_lock("rescore", "worker-2", 60_000).unwrap());
    }

    #[test]
    fn expired_lock_can_be_taken_over() {
        let db = setup_db();

        // TTL of zero: the lock is immediately stale.
        assert!(db.try_acquire_job_lock("nudge", "crashed", 0).unwrap());
        assert!(db.try_acquire_job_lock("nudge", "successor", 60_000).unwrap());
    }

    #[test]
    fn release_by_non_holder_is_a_noop() {
        let db = setup_db();

        assert!(db.try_acquire_job_lock("prune", "owner", 60_000).unwrap());
        assert!(!db.release_job_lock("prune", "impostor").unwrap());
        assert!(!db.try_acquire_job_lock("prune", "impostor", 60_000).unwrap());
    }

    #[test]
    fn locks_are_independent_per_job() {
        let db = setup_db();

        assert!(db.try_acquire_job_lock("rescore", "w", 60_000).unwrap());
        assert!(db.try_acquire_job_lock("nudge", "w", 60_000).unwrap());
    }
}

mod rescore_tests {
    use super::*;

    #[test]
    fn only_tasks_inside_the_deadline_window_are_rescored() {
        let db = setup_db();
        let config = Config::default();

        let near = triage::triage_intake(&intake_with_deadline("due soon", 24), &config, now_ms())
            .unwrap();
        let far = triage::triage_intake(&intake_with_deadline("due later", 200), &config, now_ms())
            .unwrap();
        db.create_task_with_intents(&near, &[]).unwrap();
        db.create_task_with_intents(&far, &[]).unwrap();

        // Stale the stored score so the recompute has something to change.
        db.update_score(
            &near.id,
            0.0,
            task_relay::types::UrgencyLevel::Low,
            task_relay::types::ComplexityLevel::Simple,
            task_relay::types::ScoringMethod::Baseline,
        )
        .unwrap();

        rescore_aging(&db, &config).unwrap();

        let near_after = db.get_task(&near.id).unwrap().unwrap();
        assert!(near_after.score.unwrap() > 0.0);
        assert_eq!(db.audit_event_count("score_recomputed").unwrap(), 1);

        // The far task kept its triage-time score untouched.
        let far_after = db.get_task(&far.id).unwrap().unwrap();
        assert_eq!(far_after.score, far.score);
    }

    #[test]
    fn completed_tasks_are_left_alone() {
        let db = setup_db();
        let config = Config::default();

        let task = triage::triage_intake(&intake_with_deadline("done deal", 12), &config, now_ms())
            .unwrap();
        db.create_task_with_intents(&task, &[]).unwrap();
        db.set_status(&task.id, TaskStatus::Completed, None).unwrap();

        rescore_aging(&db, &config).unwrap();
        assert_eq!(db.audit_event_count("score_recomputed").unwrap(), 0);
    }
}

mod nudge_tests {
    use super::*;

    fn stale_mapped_task(db: &Database, config: &Config, external_id: &str) -> String {
        let task = triage::triage_intake(
            &intake_with_deadline("forgotten work", 300),
            config,
            now_ms() - 100 * HOUR_MS,
        )
        .unwrap();
        db.create_task_with_intents(&task, &[]).unwrap();
        db.upsert_mapping("backend_a", external_id, &task.id).unwrap();
        task.id
    }

    #[test]
    fn stale_task_is_nudged_once_per_day() {
        let db = setup_db();
        let config = Config::default();
        stale_mapped_task(&db, &config, "ext1");

        nudge_stale(&db, &config).unwrap();
        let stats = db.outbox_stats().unwrap();
        assert_eq!(stats.get("pending").copied().unwrap_or(0), 1);

        // The hourly job firing again the same day adds nothing.
        nudge_stale(&db, &config).unwrap();
        let stats = db.outbox_stats().unwrap();
        assert_eq!(stats.get("pending").copied().unwrap_or(0), 1);

        // But the flag is audited on every pass.
        assert_eq!(db.audit_event_count("stale_flagged").unwrap(), 2);
    }

    #[test]
    fn fresh_tasks_are_not_nudged() {
        let db = setup_db();
        let config = Config::default();

        let task = triage::triage_intake(
            &intake_with_deadline("active work", 300),
            &config,
            now_ms(),
        )
        .unwrap();
        db.create_task_with_intents(&task, &[]).unwrap();
        db.upsert_mapping("backend_a", "ext2", &task.id).unwrap();

        nudge_stale(&db, &config).unwrap();
        let stats = db.outbox_stats().unwrap();
        assert_eq!(stats.get("pending").copied().unwrap_or(0), 0);
    }

    #[test]
    fn unmapped_stale_task_is_flagged_without_an_outbox_row() {
        let db = setup_db();
        let config = Config::default();

        let task = triage::triage_intake(
            &intake_with_deadline("orphaned work", 300),
            &config,
            now_ms() - 100 * HOUR_MS,
        )
        .unwrap();
        db.create_task_with_intents(&task, &[]).unwrap();

        nudge_stale(&db, &config).unwrap();
        let stats = db.outbox_stats().unwrap();
        assert_eq!(stats.get("pending").copied().unwrap_or(0), 0);
        assert_eq!(db.audit_event_count("stale_flagged").unwrap(), 1);
    }
}

mod prune_tests {
    use super::*;

    #[test]
    fn retention_prune_clears_old_ledger_entries() {
        let db = setup_db();

        db.record_delivery("recent", "backend_a", "h1").unwrap();
        assert_eq!(db.delivery_count().unwrap(), 1);

        // Thirty-day TTL keeps a fresh entry.
        prune_retention(&db, 30).unwrap();
        assert_eq!(db.delivery_count().unwrap(), 1);

        // Zero TTL prunes everything up to now.
        std::thread::sleep(std::time::Duration::from_millis(2));
        prune_retention(&db, 0).unwrap();
        assert_eq!(db.delivery_count().unwrap(), 0);
    }

    #[test]
    fn dead_letters_survive_outbox_pruning() {
        let db = setup_db();
        let config = Config::default();
        let task = triage::triage_intake(&intake_with_deadline("fix the crash", 48), &config, now_ms())
            .unwrap();
        let intents = triage::build_intents(&task, "backend_a", &config);
        db.create_task_with_intents(&task, &intents).unwrap();

        let batch = db.claim_outbox_batch(10, now_ms(), 60_000).unwrap();
        db.mark_dead_letter(batch[0].id, "permanent failure (404)")
            .unwrap();
        for row in batch.iter().skip(1) {
            db.mark_delivered(row.id).unwrap();
        }

        // Delivered rows are older than a cutoff in the future; dead letters
        // stay regardless.
        db.prune_delivered(now_ms() + 1_000).unwrap();
        let stats = db.outbox_stats().unwrap();
        assert_eq!(stats.get("delivered").copied().unwrap_or(0), 0);
        assert_eq!(stats.get("dead_letter").copied().unwrap_or(0), 1);
    }
}
