//! Integration tests for the triage pipeline, advisor merge policy, and
//! score behavior end to end.

use task_relay::advisor::{Advisor, Snapshot, StubAdvisor, Suggestion};
use task_relay::config::Config;
use task_relay::db::Database;
use task_relay::triage;
use task_relay::types::TaskIntake;

/// Helper to create a fresh in-memory database for testing.
fn setup_db() -> Database {
    Database::open_in_memory().expect("Failed to create in-memory database")
}

const NOW: i64 = 1_700_000_000_000;
const HOUR_MS: i64 = 3_600_000;

fn intake(title: &str) -> TaskIntake {
    TaskIntake {
        title: title.to_string(),
        description: None,
        client: "acme".to_string(),
        deadline: None,
        importance: None,
        effort_hours: None,
        labels: vec![],
        source: "api".to_string(),
    }
}

fn deadline_rfc3339(hours_from_now: i64) -> String {
    let ts = NOW + hours_from_now * HOUR_MS;
    chrono::DateTime::from_timestamp_millis(ts)
        .unwrap()
        .to_rfc3339()
}

mod pipeline_tests {
    use super::*;

    #[test]
    fn intake_produces_a_fully_specified_task() {
        let config = Config::default();
        let mut raw = intake("Fix the 500 error on checkout");
        raw.deadline = Some(deadline_rfc3339(48));

        let task = triage::triage_intake(&raw, &config, NOW).unwrap();

        assert_eq!(task.task_type, "bugfix");
        assert_eq!(task.importance, 4);
        assert!(task.effort_hours > 0.0);
        assert!(task.score.is_some());
        assert!(!task.checklist.is_empty());
        assert!(!task.subtasks.is_empty());
        assert!(task.labels.contains(&"bug".to_string()));
        assert!(task.urgency_level.is_some());
        assert!(task.complexity_level.is_some());
    }

    #[test]
    fn closer_deadline_scores_higher() {
        let config = Config::default();

        let mut near = intake("task a");
        near.deadline = Some(deadline_rfc3339(6));
        near.importance = Some(3);
        near.effort_hours = Some(2.0);

        let mut far = intake("task b");
        far.deadline = Some(deadline_rfc3339(72));
        far.importance = Some(3);
        far.effort_hours = Some(2.0);

        let a = triage::triage_intake(&near, &config, NOW).unwrap();
        let b = triage::triage_intake(&far, &config, NOW).unwrap();

        assert!(a.score.unwrap() > b.score.unwrap());
        // The urgency gap for 6h vs 72h against the two-week horizon.
        let gap = (72.0 - 6.0) / 336.0;
        assert!((a.score.unwrap() - b.score.unwrap() - 0.30 * gap).abs() < 1e-9);
    }

    #[test]
    fn triage_twice_is_triage_once() {
        let config = Config::default();
        let mut raw = intake("Set up onboarding access for the new analyst");
        raw.deadline = Some(deadline_rfc3339(100));

        let mut task = triage::triage_intake(&raw, &config, NOW).unwrap();
        let first = task.clone();
        triage::retriage(&mut task, &config, NOW);

        assert_eq!(serde_json::to_value(&task).unwrap(), serde_json::to_value(&first).unwrap());
    }

    #[test]
    fn classification_errors_fall_back_to_general() {
        let config = Config::default();
        let task = triage::triage_intake(&intake("zxqj vvwp"), &config, NOW).unwrap();
        assert_eq!(task.task_type, "general");
        assert!(task.score.is_some());
    }

    #[test]
    fn invalid_intake_is_rejected_not_defaulted() {
        let config = Config::default();

        let mut bad_importance = intake("ok title");
        bad_importance.importance = Some(9);
        assert!(triage::triage_intake(&bad_importance, &config, NOW).is_err());

        let mut bad_effort = intake("ok title");
        bad_effort.effort_hours = Some(-1.0);
        assert!(triage::triage_intake(&bad_effort, &config, NOW).is_err());

        let empty_title = intake("   ");
        assert!(triage::triage_intake(&empty_title, &config, NOW).is_err());
    }
}

mod advisor_tests {
    use super::*;

    #[tokio::test]
    async fn unavailable_advisor_leaves_deterministic_result_intact() {
        let config = Config::default();
        let task = triage::triage_intake(&intake("quarterly metrics report"), &config, NOW).unwrap();
        let snapshot_before = serde_json::to_value(&task).unwrap();

        let advisor = StubAdvisor::unavailable();
        let result = advisor.refine(&Snapshot::of(&task)).await;
        assert!(result.is_err());

        // Nothing merged: the task body is byte-identical.
        assert_eq!(serde_json::to_value(&task).unwrap(), snapshot_before);
    }

    #[tokio::test]
    async fn suggestions_merge_additively_under_the_allow_list() {
        let config = Config::default();
        let mut task = triage::triage_intake(&intake("quarterly metrics report"), &config, NOW).unwrap();
        let computed_score = task.score.unwrap();
        let status_before = task.status;

        let advisor = StubAdvisor::with_suggestion(Suggestion {
            labels: vec!["finance".to_string()],
            subtasks: vec!["Cross-check revenue numbers".to_string()],
            checklist: vec![],
            score_override: Some(0.95),
            hold_creation: false,
        });

        let suggestion = advisor.refine(&Snapshot::of(&task)).await.unwrap();
        let report = triage::merge_suggestion(&mut task, &suggestion);

        assert!(task.labels.contains(&"finance".to_string()));
        assert!(task
            .subtasks
            .contains(&"Cross-check revenue numbers".to_string()));
        assert_eq!(task.score, Some(0.95f64.max(computed_score)));
        assert_eq!(task.status, status_before);
        assert!(!report.applied.is_empty());
    }

    #[tokio::test]
    async fn retriage_merges_a_fresh_advisor_suggestion() {
        let db = setup_db();
        let config = Config::default();
        let mut task = triage::triage_intake(&intake("slipping deliverable"), &config, NOW).unwrap();
        db.create_task_with_intents(&task, &[]).unwrap();

        // A later re-triage pass runs the pipeline again, refinement
        // included; the advisor now has something to say.
        triage::retriage(&mut task, &config, NOW + 48 * HOUR_MS);
        let computed_score = task.score.unwrap();

        let advisor = StubAdvisor::with_suggestion(Suggestion {
            labels: vec!["escalated".to_string()],
            score_override: Some(0.9),
            ..Default::default()
        });
        let outcome = triage::refine(&mut task, Some(&advisor)).await;
        assert!(matches!(outcome, triage::RefineOutcome::Merged(_)));

        assert!(task.labels.contains(&"escalated".to_string()));
        assert_eq!(task.score, Some(0.9f64.max(computed_score)));

        // The merged result is what lands back in the store.
        db.save_task(&task).unwrap();
        let loaded = db.get_task(&task.id).unwrap().unwrap();
        assert!(loaded.labels.contains(&"escalated".to_string()));
        assert_eq!(loaded.score, task.score);
    }

    #[tokio::test]
    async fn refine_without_an_advisor_is_skipped() {
        let config = Config::default();
        let mut task = triage::triage_intake(&intake("plain work"), &config, NOW).unwrap();
        let before = serde_json::to_value(&task).unwrap();

        let outcome = triage::refine(&mut task, None).await;
        assert!(matches!(outcome, triage::RefineOutcome::Skipped));
        assert_eq!(serde_json::to_value(&task).unwrap(), before);
    }

    #[tokio::test]
    async fn hold_creation_blocks_backend_but_keeps_children() {
        let config = Config::default();
        let mut raw = intake("broken export crash");
        raw.deadline = Some(deadline_rfc3339(24));
        let mut task = triage::triage_intake(&raw, &config, NOW).unwrap();

        let advisor = StubAdvisor::with_suggestion(Suggestion {
            hold_creation: true,
            ..Default::default()
        });
        let suggestion = advisor.refine(&Snapshot::of(&task)).await.unwrap();
        triage::merge_suggestion(&mut task, &suggestion);

        assert!(task.requires_review);
        // Local derivation is retained.
        assert!(!task.checklist.is_empty());
        assert!(!task.subtasks.is_empty());
    }
}

mod persistence_tests {
    use super::*;
    use task_relay::types::TaskStatus;

    #[test]
    fn persisted_task_round_trips() {
        let db = setup_db();
        let config = Config::default();
        let mut raw = intake("Install and configure the staging environment");
        raw.deadline = Some(deadline_rfc3339(200));
        raw.labels = vec!["infra".to_string()];

        let task = triage::triage_intake(&raw, &config, NOW).unwrap();
        db.create_task_with_intents(&task, &[]).unwrap();

        let loaded = db.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.title, task.title);
        assert_eq!(loaded.task_type, "onboarding");
        assert_eq!(loaded.labels, task.labels);
        assert_eq!(loaded.checklist, task.checklist);
        assert_eq!(loaded.score, task.score);
        assert_eq!(loaded.status, TaskStatus::Pending);
    }

    #[test]
    fn status_regressions_need_a_newer_event_timestamp() {
        let db = setup_db();
        let config = Config::default();
        let task = triage::triage_intake(&intake("complete me"), &config, NOW).unwrap();
        db.create_task_with_intents(&task, &[]).unwrap();

        assert!(db
            .set_status(&task.id, TaskStatus::Completed, None)
            .unwrap());
        let completed = db.get_task(&task.id).unwrap().unwrap();

        // Stale event: ignored without error.
        let changed = db
            .set_status(
                &task.id,
                TaskStatus::InProgress,
                Some(completed.updated_at - 10_000),
            )
            .unwrap();
        assert!(!changed);
        assert_eq!(
            db.get_task(&task.id).unwrap().unwrap().status,
            TaskStatus::Completed
        );

        // Newer event: the regression applies.
        let changed = db
            .set_status(
                &task.id,
                TaskStatus::InProgress,
                Some(completed.updated_at + 10_000),
            )
            .unwrap();
        assert!(changed);
        assert_eq!(
            db.get_task(&task.id).unwrap().unwrap().status,
            TaskStatus::InProgress
        );
    }

    #[test]
    fn blocked_and_in_progress_swap_freely() {
        let db = setup_db();
        let config = Config::default();
        let task = triage::triage_intake(&intake("stuck work"), &config, NOW).unwrap();
        db.create_task_with_intents(&task, &[]).unwrap();

        assert!(db
            .set_status(&task.id, TaskStatus::InProgress, None)
            .unwrap());
        assert!(db.set_status(&task.id, TaskStatus::Blocked, None).unwrap());
        assert!(db
            .set_status(&task.id, TaskStatus::InProgress, None)
            .unwrap());
        // But never back to pending without an event.
        assert!(!db.set_status(&task.id, TaskStatus::Pending, None).unwrap());
    }
}
