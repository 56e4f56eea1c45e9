mod common;

use common::ScriptedModel;
use semvault_core::model::statement::StatementValidationError;
use semvault_core::repo::issue_repo::SqliteIssueRepository;
use semvault_core::{
    ConsistencyError, DuplicateStrategy, Engine, EngineConfig, EngineError, IssueKind,
    IssueStatus, PromotionOutcome, Resolution, StatementStatus,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn engine_with(model: ScriptedModel, config: EngineConfig) -> (Engine, Arc<ScriptedModel>) {
    let model = Arc::new(model);
    let engine = Engine::open_in_memory(model.clone(), config).unwrap();
    (engine, model)
}

fn engine(model: ScriptedModel) -> (Engine, Arc<ScriptedModel>) {
    engine_with(model, EngineConfig::default())
}

fn promote_all(engine: &Engine) {
    for _ in 0..32 {
        if !engine.promote_next().unwrap().did_work() {
            return;
        }
    }
    panic!("promotion sweep did not settle");
}

#[test]
fn add_statement_rejects_blank_and_oversized_text() {
    let config = EngineConfig {
        max_statement_bytes: 16,
        ..EngineConfig::default()
    };
    let (engine, _model) = engine_with(ScriptedModel::new("m1"), config);

    assert!(matches!(
        engine.add_statement("   ", "chat", "user"),
        Err(EngineError::Consistency(ConsistencyError::Validation(
            StatementValidationError::Blank
        )))
    ));
    assert!(matches!(
        engine.add_statement("this text is far too long", "chat", "user"),
        Err(EngineError::Consistency(ConsistencyError::Validation(
            StatementValidationError::TooLarge { max: 16, .. }
        )))
    ));
}

#[test]
fn new_statement_is_pending_with_current_embedding() {
    let (engine, _model) = engine(ScriptedModel::new("m1"));
    let statement = engine
        .add_statement("Rust has no garbage collector", "chat", "user")
        .unwrap();

    assert_eq!(statement.status, StatementStatus::Pending);
    assert_eq!(statement.source, "chat");
    assert!(statement.current_embedding("m1").is_some());
    assert!(engine.list_open_issues().unwrap().is_empty());

    assert_eq!(
        engine.promote_next().unwrap(),
        PromotionOutcome::Promoted(statement.id)
    );
    assert_eq!(
        engine.get_statement(statement.id).unwrap().status,
        StatementStatus::Active
    );
    assert!(engine
        .get_statement(statement.id)
        .unwrap()
        .last_verified_at
        .is_some());
}

#[test]
fn math_only_strategy_records_pending_duplicates_once() {
    let (engine, _model) = engine(ScriptedModel::new("m1"));
    let original = engine
        .add_statement("The office opens at nine", "wiki", "doc")
        .unwrap();
    promote_all(&engine);

    let copy = engine
        .add_statement("The office opens at nine", "chat", "user")
        .unwrap();
    let issues = engine.list_open_issues().unwrap();
    assert_eq!(issues.len(), 1);
    let issue = &issues[0];
    assert_eq!(issue.kind, IssueKind::Duplicate);
    assert_eq!(issue.status, IssueStatus::Pending);
    assert!(issue.involves(original.id) && issue.involves(copy.id));
    assert!(issue.score.unwrap() > 0.99);

    // The sweep keeps flagging the copy without opening a second issue.
    for _ in 0..3 {
        match engine.promote_next().unwrap() {
            PromotionOutcome::Flagged {
                statement_id,
                opened,
            } => {
                assert_eq!(statement_id, copy.id);
                assert!(opened.is_empty());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(
            engine.promote_next().unwrap(),
            PromotionOutcome::CycleRestarted
        );
    }
    assert_eq!(engine.list_open_issues().unwrap().len(), 1);
    assert_eq!(
        engine.get_statement(copy.id).unwrap().status,
        StatementStatus::Pending
    );
}

#[test]
fn promotion_opens_issue_between_pending_duplicates() {
    let (engine, _model) = engine(ScriptedModel::new("m1"));
    let first = engine.add_statement("Tea is served at four", "a", "doc").unwrap();
    let second = engine.add_statement("Tea is served at four", "b", "doc").unwrap();
    assert!(engine.list_open_issues().unwrap().is_empty());

    match engine.promote_next().unwrap() {
        PromotionOutcome::Flagged {
            statement_id,
            opened,
        } => {
            assert_eq!(statement_id, first.id);
            assert_eq!(opened.len(), 1);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    let issue = engine.list_open_issues().unwrap().remove(0);
    assert_eq!(issue.status, IssueStatus::Open);
    assert!(issue.involves(second.id));
}

#[test]
fn judgment_strategy_opens_contradiction_with_explanation() {
    let config = EngineConfig {
        duplicate_strategy: DuplicateStrategy::Judgment,
        duplicate_threshold: 0.3,
        ..EngineConfig::default()
    };
    let model = ScriptedModel::new("m1").with_rule("contradict", "Yes. The opening hours differ.");
    let (engine, _model) = engine_with(model, config);

    let earlier = engine
        .add_statement("The shop opens at nine", "wiki", "doc")
        .unwrap();
    promote_all(&engine);
    let later = engine
        .add_statement("The shop opens at ten", "chat", "user")
        .unwrap();

    let issues = engine.list_open_issues().unwrap();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].kind, IssueKind::Contradiction);
    assert_eq!(issues[0].status, IssueStatus::Open);
    assert_eq!(
        issues[0].explanation.as_deref(),
        Some("Yes. The opening hours differ.")
    );
    assert!(issues[0].involves(earlier.id) && issues[0].involves(later.id));
}

#[test]
fn judgment_strategy_asks_only_about_the_top_k_neighbours() {
    let config = EngineConfig {
        duplicate_strategy: DuplicateStrategy::Judgment,
        duplicate_threshold: 0.45,
        judgment_top_k: 2,
        ..EngineConfig::default()
    };
    let model = ScriptedModel::new("m1")
        .with_rule("contradict", "Yes.")
        .with_vector("north", &[1.0, 0.0, 0.0, 0.0])
        .with_vector("south", &[0.0, 1.0, 0.0, 0.0])
        .with_vector("east", &[0.0, 0.0, 1.0, 0.0])
        .with_vector("west", &[0.0, 0.0, 0.0, 1.0])
        .with_vector("compass", &[1.0, 1.0, 1.0, 1.0]);
    let (engine, model) = engine_with(model, config);

    for direction in ["north", "south", "east", "west"] {
        engine
            .add_statement(&format!("The gate faces {direction}"), "map", "doc")
            .unwrap();
    }
    promote_all(&engine);
    assert!(engine.list_open_issues().unwrap().is_empty());
    let asked_before = model.generate_count();

    engine
        .add_statement("The compass says otherwise", "chat", "user")
        .unwrap();

    let issues = engine.list_open_issues().unwrap();
    assert_eq!(issues.len(), 2);
    assert!(issues
        .iter()
        .all(|issue| issue.kind == IssueKind::Contradiction));
    assert_eq!(model.generate_count() - asked_before, 2);
}

#[test]
fn judgment_strategy_ignores_negative_and_unparseable_answers() {
    let config = EngineConfig {
        duplicate_strategy: DuplicateStrategy::Judgment,
        duplicate_threshold: 0.3,
        ..EngineConfig::default()
    };
    let model = ScriptedModel::new("m1").with_rule("ten", "Hard to say.").with_rule("contradict", "No.");
    let (engine, _model) = engine_with(model, config);

    engine.add_statement("The shop opens at nine", "wiki", "doc").unwrap();
    promote_all(&engine);
    engine.add_statement("The shop opens at ten", "chat", "user").unwrap();
    engine.add_statement("The shop opens at nine sharp", "chat", "user").unwrap();

    assert!(engine.list_open_issues().unwrap().is_empty());
}

#[test]
fn promotion_sweeper_waits_a_poll_interval_between_cycles_during_outage() {
    let config = EngineConfig {
        poll_interval_ms: 500,
        task_max_attempts: 1,
        ..EngineConfig::default()
    };
    let (engine, model) = engine_with(ScriptedModel::new("m1"), config);
    model.set_down(true);
    engine
        .add_statement("Backups run every night", "ops", "doc")
        .unwrap();
    let before = model.embed_calls.load(Ordering::SeqCst);

    engine.start_workers().unwrap();
    std::thread::sleep(Duration::from_millis(300));
    let calls = model.embed_calls.load(Ordering::SeqCst) - before;
    engine.shutdown();

    // One attempt from the queued embed task, one from the first sweep.
    assert!(calls <= 3, "embed called {calls} times within one poll interval");
}

#[test]
fn model_outage_defers_embedding_until_the_model_returns() {
    let (engine, model) = engine(ScriptedModel::new("m1"));
    model.set_down(true);

    let statement = engine
        .add_statement("Deploys happen on Tuesdays", "chat", "user")
        .unwrap();
    assert_eq!(statement.status, StatementStatus::Pending);
    assert!(statement.embedding.is_none());
    assert_eq!(engine.task_counts().unwrap().pending, 1);

    assert_eq!(
        engine.promote_next().unwrap(),
        PromotionOutcome::Deferred(statement.id)
    );
    assert_eq!(
        engine.promote_next().unwrap(),
        PromotionOutcome::CycleRestarted
    );

    model.set_down(false);
    assert_eq!(
        engine.promote_next().unwrap(),
        PromotionOutcome::Promoted(statement.id)
    );
    let stored = engine.get_statement(statement.id).unwrap();
    assert_eq!(stored.status, StatementStatus::Active);
    assert!(stored.current_embedding("m1").is_some());
}

#[test]
fn delete_both_cascades_to_other_issues() {
    let (engine, _model) = engine(ScriptedModel::new("m1"));
    let anchor = engine.add_statement("Builds run nightly", "wiki", "doc").unwrap();
    promote_all(&engine);
    let first_copy = engine.add_statement("Builds run nightly", "chat", "user").unwrap();
    let second_copy = engine.add_statement("Builds run nightly", "mail", "user").unwrap();

    let issues = engine.list_open_issues().unwrap();
    assert_eq!(issues.len(), 2);
    let target = issues
        .iter()
        .find(|issue| issue.involves(first_copy.id))
        .unwrap()
        .id;
    let other = issues
        .iter()
        .find(|issue| issue.involves(second_copy.id))
        .unwrap()
        .id;

    let outcome = engine
        .resolve_issue(target, Resolution::DeleteBoth)
        .unwrap();
    assert!(outcome.promoted.is_empty());
    assert_eq!(outcome.deleted.len(), 2);
    assert!(outcome.deleted.contains(&anchor.id));
    assert!(outcome.deleted.contains(&first_copy.id));
    assert_eq!(outcome.cascaded, vec![other]);

    let cascaded = engine.get_issue(other).unwrap();
    assert_eq!(cascaded.status, IssueStatus::Resolved);
    assert_eq!(cascaded.resolution, None);
    assert_eq!(engine.get_issue(target).unwrap().resolution, Some(Resolution::DeleteBoth));
    assert!(engine.list_open_issues().unwrap().is_empty());
    assert_eq!(
        engine.get_statement(anchor.id).unwrap().status,
        StatementStatus::Deleted
    );
    assert_eq!(
        engine.get_statement(second_copy.id).unwrap().status,
        StatementStatus::Pending
    );

    let conn = engine.db().lock();
    let audit = SqliteIssueRepository::new(&conn);
    // opened + resolved, opened + cascaded
    assert_eq!(audit.count_events(target).unwrap(), 2);
    assert_eq!(audit.count_events(other).unwrap(), 2);
}

#[test]
fn keep_resolution_promotes_survivor_and_deletes_loser() {
    let (engine, _model) = engine(ScriptedModel::new("m1"));
    let first = engine.add_statement("Lunch is at noon", "a", "doc").unwrap();
    let second = engine.add_statement("Lunch is at noon", "b", "doc").unwrap();
    promote_all_flagged(&engine);

    let issue = engine.list_open_issues().unwrap().remove(0);
    let outcome = engine.resolve_issue_str(issue.id, "keep-a").unwrap();
    assert_eq!(outcome.resolution, Resolution::KeepA);
    assert_eq!(outcome.promoted, vec![issue.statement_a]);
    assert_eq!(outcome.deleted, vec![issue.statement_b]);

    let statuses = [
        engine.get_statement(first.id).unwrap().status,
        engine.get_statement(second.id).unwrap().status,
    ];
    assert!(statuses.contains(&StatementStatus::Active));
    assert!(statuses.contains(&StatementStatus::Deleted));

    assert!(matches!(
        engine.resolve_issue(issue.id, Resolution::KeepBoth),
        Err(EngineError::Consistency(ConsistencyError::IssueNotOpen(id))) if id == issue.id
    ));
}

#[test]
fn resolution_rejects_unknown_issue_and_action() {
    let (engine, _model) = engine(ScriptedModel::new("m1"));
    assert!(matches!(
        engine.resolve_issue(404, Resolution::KeepBoth),
        Err(EngineError::Consistency(ConsistencyError::IssueNotFound(404)))
    ));
    assert!(matches!(
        engine.resolve_issue_str(404, "merge"),
        Err(EngineError::Consistency(ConsistencyError::InvalidResolution(_)))
    ));
}

#[test]
fn delete_statement_closes_its_issues() {
    let (engine, _model) = engine(ScriptedModel::new("m1"));
    engine.add_statement("Standup is at ten", "a", "doc").unwrap();
    promote_all(&engine);
    let copy = engine.add_statement("Standup is at ten", "b", "doc").unwrap();
    let issue_id = engine.list_open_issues().unwrap()[0].id;

    assert_eq!(engine.delete_statement(copy.id).unwrap(), vec![issue_id]);
    assert_eq!(
        engine.get_statement(copy.id).unwrap().status,
        StatementStatus::Deleted
    );
    assert!(engine.list_open_issues().unwrap().is_empty());
    assert!(engine.delete_statement(copy.id).unwrap().is_empty());

    let missing = uuid::Uuid::new_v4();
    assert!(matches!(
        engine.delete_statement(missing),
        Err(EngineError::Consistency(ConsistencyError::StatementNotFound(id))) if id == missing
    ));
}

#[test]
fn search_ranks_active_statements_by_similarity() {
    let model = ScriptedModel::new("m1")
        .with_vector("alpha", &[1.0, 0.0, 0.0])
        .with_vector("beta", &[0.8, 0.6, 0.0])
        .with_vector("gamma", &[0.0, 0.0, 1.0])
        .with_vector("delta", &[1.0, 0.0, 0.0])
        .with_vector("query", &[1.0, 0.0, 0.0]);
    let (engine, model) = engine(model);

    let alpha = engine.add_statement("alpha", "s", "t").unwrap();
    let beta = engine.add_statement("beta", "s", "t").unwrap();
    engine.add_statement("gamma", "s", "t").unwrap();
    promote_all(&engine);
    // Duplicate of alpha stays pending and is not searchable.
    let delta = engine.add_statement("delta", "s", "t").unwrap();

    let hits = engine.search_statements("query", 2).unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].statement.id, alpha.id);
    assert!((hits[0].score - 1.0).abs() < 1e-9);
    assert_eq!(hits[1].statement.id, beta.id);
    assert!((hits[1].score - 0.8).abs() < 1e-9);

    let all = engine.search_statements("query", 10).unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.iter().all(|hit| hit.statement.id != delta.id));

    model.set_down(true);
    assert!(matches!(
        engine.search_statements("query", 2),
        Err(EngineError::Consistency(ConsistencyError::ModelUnavailable(_)))
    ));
}

#[test]
fn model_switch_requeues_stale_embeddings() {
    let (engine, model) = engine(ScriptedModel::new("m1"));
    let kept = engine.add_statement("Invoices go out monthly", "s", "t").unwrap();
    let dropped = engine.add_statement("Backups are encrypted", "s", "t").unwrap();
    engine.delete_statement(dropped.id).unwrap();
    assert_eq!(engine.requeue_stale_embeddings().unwrap(), 0);

    model.set_model_id("m2");
    assert!(engine
        .get_statement(kept.id)
        .unwrap()
        .current_embedding("m2")
        .is_none());
    assert_eq!(engine.requeue_stale_embeddings().unwrap(), 1);
    assert_eq!(engine.task_counts().unwrap().pending, 1);
}

/// Runs the sweep once per pending statement so duplicates get their issue.
fn promote_all_flagged(engine: &Engine) {
    let mut flagged = 0;
    for _ in 0..8 {
        if let PromotionOutcome::Flagged { .. } = engine.promote_next().unwrap() {
            flagged += 1;
        }
        if !engine.list_open_issues().unwrap().is_empty() {
            break;
        }
    }
    assert!(flagged > 0);
}
