use super::*;
use crate::llm::tests::{service_with, ScriptedGenerator};

async fn service_for(model: SchedulingModel, generator: Arc<ScriptedGenerator>) -> ReviewService {
    let db = Db::in_memory().await.unwrap();
    let llm = Arc::new(service_with(generator));
    ReviewService::new(
        db,
        llm,
        ServiceOptions {
            scheduling_model: model,
            ..ServiceOptions::default()
        },
    )
}

async fn add_note(service: &ReviewService, description: &str, intensity: Intensity) -> Note {
    service
        .create_note(NewNote {
            title: Some("Rust".into()),
            description: description.into(),
            intensity,
            color: None,
        })
        .await
        .unwrap()
}

fn answer(note_id: i64, response: &str, secs: f64) -> SubmitAnswer {
    SubmitAnswer {
        session_id: "session-1".into(),
        note_id,
        question: "What does the borrow checker enforce?".into(),
        model: Some("gpt-oss".into()),
        user_response: response.into(),
        response_time_secs: secs,
        score: None,
    }
}

fn failing() -> Arc<ScriptedGenerator> {
    Arc::new(ScriptedGenerator::new(Vec::new()))
}

#[tokio::test]
async fn test_rich_model_first_and_second_review() {
    let generator = Arc::new(ScriptedGenerator::new(vec![
        Ok("CORRECT\nExactly.".into()),
        Ok("INCORRECT\nThat describes Rc, not Arc.".into()),
    ]));
    let service = service_for(SchedulingModel::IntensityRich, generator).await;
    let note = add_note(&service, "Aliasing XOR mutability", Intensity::Moderate).await;

    // First review: rating estimated from a fast correct answer (5 -> x3.0),
    // count 1 -> x1.5, moderate base 12h.
    let first = service.submit_answer(answer(note.id, "one writer or many readers", 5.0)).await.unwrap();
    assert!(first.evaluation.is_correct);
    assert!(!first.fallback_evaluation);
    assert_eq!(first.difficulty_rating, 5.0);
    assert_eq!(first.scheduling_summary.review_count, 1);
    assert!((first.scheduling_summary.interval_hours - 54.0).abs() < 1e-9);

    let stored = service.get_note(note.id).await.unwrap();
    assert_eq!(stored.review_count, 1);
    assert_eq!(stored.version, 1);
    assert_eq!(stored.last_interval_ms, Some(54 * 3_600_000));
    assert_eq!(stored.next_review_at, first.next_review_date);

    // Second review: rating drifts to 4.5 (rounds to 5), failure halves.
    let second = service.submit_answer(answer(note.id, "shared ownership", 40.0)).await.unwrap();
    assert!(!second.evaluation.is_correct);
    assert_eq!(second.difficulty_rating, 4.5);
    assert_eq!(second.scheduling_summary.review_count, 2);
    assert!((second.scheduling_summary.interval_hours - 18.0).abs() < 1e-9);

    let events = service.db().reviews_for_note(note.id).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].difficulty_rating, 4.5);
    assert_eq!(events[1].next_review_date, second.next_review_date);
}

#[tokio::test]
async fn test_evaluation_falls_back_to_heuristic() {
    let service = service_for(SchedulingModel::IntensityRich, failing()).await;
    let note = add_note(&service, "Send and Sync", Intensity::Intensive).await;

    let outcome = service
        .submit_answer(answer(note.id, "Send moves across threads, Sync shares", 12.0))
        .await
        .unwrap();
    assert!(outcome.fallback_evaluation);
    assert!(outcome.evaluation.is_correct);

    let short = service.submit_answer(answer(note.id, "threads", 12.0)).await.unwrap();
    assert!(short.fallback_evaluation);
    assert!(!short.evaluation.is_correct);
}

#[tokio::test]
async fn test_ease_model_uses_explicit_score() {
    let service = service_for(SchedulingModel::Ease, Arc::new(ScriptedGenerator::always("CORRECT"))).await;
    let note = add_note(&service, "Deref coercion", Intensity::Chill).await;

    let mut submission = answer(note.id, "&String becomes &str", 3.0);
    submission.score = Some(5);
    let outcome = service.submit_answer(submission).await.unwrap();
    assert!((outcome.scheduling_summary.interval_hours - 24.0).abs() < 1e-9);

    let stored = service.get_note(note.id).await.unwrap();
    assert_eq!(stored.current_interval, 1);
    assert_eq!(stored.ease_factor, 2.5);
    assert_eq!(stored.review_count, 1);
}

#[tokio::test]
async fn test_ease_model_survives_many_perfect_reviews() {
    let service = service_for(SchedulingModel::Ease, Arc::new(ScriptedGenerator::always("CORRECT"))).await;
    let note = add_note(&service, "Zero-cost abstractions", Intensity::Chill).await;

    let mut last = None;
    for _ in 0..40 {
        let mut submission = answer(note.id, "no runtime overhead", 2.0);
        submission.score = Some(5);
        last = Some(service.submit_answer(submission).await.unwrap());
    }

    let stored = service.get_note(note.id).await.unwrap();
    assert_eq!(stored.current_interval, srs::MAX_INTERVAL_DAYS);
    let outcome = last.unwrap();
    assert!((outcome.scheduling_summary.interval_days - srs::MAX_INTERVAL_DAYS as f64).abs() < 1e-6);
}

#[tokio::test]
async fn test_simple_model_counts_only_correct_reviews() {
    let service = service_for(
        SchedulingModel::IntensitySimple,
        Arc::new(ScriptedGenerator::always("INCORRECT\nNo.")),
    )
    .await;
    let note = add_note(&service, "Interior mutability", Intensity::Moderate).await;

    service.submit_answer(answer(note.id, "RefCell checks at runtime", 20.0)).await.unwrap();

    let stored = service.get_note(note.id).await.unwrap();
    assert_eq!(stored.review_count, 0);
    assert!(stored.last_reviewed.is_some());
    // max(1d * 0.5, 1d * 0.6)
    assert_eq!(stored.last_interval_ms, Some(51_840_000));
}

#[tokio::test]
async fn test_session_model_returns_at_next_session() {
    let service = service_for(SchedulingModel::Session, Arc::new(ScriptedGenerator::always("CORRECT"))).await;
    let note = add_note(&service, "Pattern matching", Intensity::Soon).await;

    let outcome = service.submit_answer(answer(note.id, "match is exhaustive", 3.0)).await.unwrap();
    // Soon sessions repeat every two minutes.
    assert!((outcome.scheduling_summary.interval_hours - 2.0 / 60.0).abs() < 1e-9);
    assert_eq!(service.get_note(note.id).await.unwrap().review_count, 1);
}

#[tokio::test]
async fn test_invalid_submissions_are_rejected_before_any_write() {
    let service = service_for(SchedulingModel::Ease, Arc::new(ScriptedGenerator::always("CORRECT"))).await;
    let note = add_note(&service, "Closures", Intensity::Chill).await;

    let empty = service.submit_answer(answer(note.id, "   ", 1.0)).await;
    assert!(matches!(empty, Err(Error::Validation(_))));

    let negative = service.submit_answer(answer(note.id, "captures env", -1.0)).await;
    assert!(matches!(negative, Err(Error::Validation(_))));

    let mut bad_score = answer(note.id, "captures env", 1.0);
    bad_score.score = Some(9);
    assert!(matches!(service.submit_answer(bad_score).await, Err(Error::Validation(_))));

    let missing = service.submit_answer(answer(999, "captures env", 1.0)).await;
    assert!(matches!(missing, Err(Error::NotFound { id: 999, .. })));

    assert!(service.db().reviews_for_note(note.id).await.unwrap().is_empty());
    assert_eq!(service.get_note(note.id).await.unwrap().version, 0);
}

#[tokio::test]
async fn test_concurrent_reviews_of_one_note_are_serialised() {
    let service = Arc::new(
        service_for(SchedulingModel::IntensityRich, Arc::new(ScriptedGenerator::always("CORRECT"))).await,
    );
    let note_id = add_note(&service, "Mutex poisoning", Intensity::Moderate).await.id;

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                service
                    .submit_answer(answer(note_id, &format!("attempt number {}", i), 5.0))
                    .await
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let stored = service.get_note(note_id).await.unwrap();
    assert_eq!(stored.review_count, 4);
    assert_eq!(stored.version, 4);
    assert_eq!(service.db().reviews_for_note(note_id).await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_next_question_is_generated_then_cached() {
    let service = service_for(
        SchedulingModel::IntensityRich,
        Arc::new(ScriptedGenerator::always("What is a lifetime?")),
    )
    .await;
    let note = add_note(&service, "Lifetimes", Intensity::Moderate).await;

    let first = service.next_question("s", note.id).await.unwrap();
    assert_eq!(first.source, QuestionSource::Generated);
    assert_eq!(first.question, "What is a lifetime?");

    let second = service.next_question("s", note.id).await.unwrap();
    assert_eq!(second.source, QuestionSource::Cache);
    assert_eq!(second.question, first.question);

    let metrics = service.cache_metrics();
    assert_eq!(metrics.hits, 1);
    assert_eq!(metrics.misses, 1);
    assert_eq!(metrics.generations, 1);
}

#[tokio::test]
async fn test_next_question_falls_back_without_caching() {
    let service = service_for(SchedulingModel::IntensityRich, failing()).await;
    let note = add_note(&service, "Zero-cost abstractions", Intensity::Moderate).await;

    let question = service.next_question("s", note.id).await.unwrap();
    assert_eq!(question.source, QuestionSource::Fallback);
    assert_eq!(question.model, "fallback");
    assert_eq!(question.question, "Explain in detail: Zero-cost abstractions...");
    assert!(service.cache().peek(note.id, Utc::now()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_hint_fallback() {
    let service = service_for(SchedulingModel::IntensityRich, failing()).await;
    let note = add_note(&service, "Iterators", Intensity::Moderate).await;

    let hint = service.hint(note.id).await.unwrap();
    assert!(hint.fallback);
    assert!(!hint.hint.is_empty());

    assert!(matches!(service.hint(404).await, Err(Error::NotFound { .. })));
}

#[tokio::test]
async fn test_content_update_invalidates_cached_question() {
    let service = service_for(
        SchedulingModel::IntensityRich,
        Arc::new(ScriptedGenerator::always("Why Pin?")),
    )
    .await;
    let note = add_note(&service, "Pin", Intensity::Moderate).await;
    service.next_question("s", note.id).await.unwrap();

    let recolor = NoteUpdate {
        color: Some("#ffaa00".into()),
        ..NoteUpdate::default()
    };
    service.update_note(note.id, recolor).await.unwrap();
    assert!(service.cache().peek(note.id, Utc::now()).await.unwrap().is_some());

    let rewrite = NoteUpdate {
        description: Some("Pin guarantees a value will not move".into()),
        ..NoteUpdate::default()
    };
    service.update_note(note.id, rewrite).await.unwrap();
    assert!(service.cache().peek(note.id, Utc::now()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_start_session_picks_due_and_new_notes_of_intensity() {
    let service = service_for(SchedulingModel::IntensityRich, Arc::new(ScriptedGenerator::always("CORRECT"))).await;
    let fresh = add_note(&service, "fresh", Intensity::Moderate).await;
    let reviewed = add_note(&service, "reviewed", Intensity::Moderate).await;
    add_note(&service, "other tier", Intensity::Chill).await;

    service.submit_answer(answer(reviewed.id, "a long enough answer", 5.0)).await.unwrap();

    let session = service.start_session(Intensity::Moderate, None).await.unwrap();
    let ids: Vec<i64> = session.notes.iter().map(|n| n.id).collect();
    assert_eq!(ids, vec![fresh.id]);
    assert_eq!(session.total_notes, 1);
    assert!(session.interrogations_enabled);
    assert!(session.next_session.is_some());

    let capped = service.start_session(Intensity::Chill, Some(0)).await.unwrap();
    assert!(capped.notes.is_empty());
}

#[tokio::test]
async fn test_due_notes_and_stats() {
    let service = service_for(SchedulingModel::IntensityRich, Arc::new(ScriptedGenerator::always("CORRECT"))).await;
    let a = add_note(&service, "a", Intensity::Soon).await;
    let b = add_note(&service, "b", Intensity::Soon).await;
    service.submit_answer(answer(a.id, "a long enough answer", 5.0)).await.unwrap();

    let now = Utc::now();
    let due: Vec<i64> = service.due_notes(None, now).await.unwrap().iter().map(|n| n.id).collect();
    assert_eq!(due, vec![b.id]);

    // Soon base is one hour; well past it everything is due again.
    let later = now + Duration::days(60);
    let due_later = service.due_notes(None, later).await.unwrap();
    assert_eq!(due_later.len(), 2);

    let stats = service.note_stats(a.id).await.unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.success_rate, 100.0);
    assert!(matches!(service.note_stats(999).await, Err(Error::NotFound { .. })));

    let global = service.global_stats().await.unwrap();
    assert_eq!(global.total_notes, 1);
}

#[tokio::test]
async fn test_scheduler_config_update_is_validated_and_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    let service = ReviewService::new(
        Db::in_memory().await.unwrap(),
        Arc::new(service_with(Arc::new(ScriptedGenerator::always("CORRECT")))),
        ServiceOptions {
            settings_path: Some(path.clone()),
            ..ServiceOptions::default()
        },
    );
    let before = service.scheduler_config();

    let bad = ConfigUpdate {
        base_hours: Some(HashMap::from([(Intensity::Chill, -4.0)])),
        difficulty_multipliers: None,
    };
    assert!(matches!(service.update_scheduler_config(&bad).await, Err(Error::Validation(_))));
    assert_eq!(*service.scheduler_config(), *before);

    let good = ConfigUpdate {
        base_hours: Some(HashMap::from([(Intensity::Chill, 48.0)])),
        difficulty_multipliers: None,
    };
    let updated = service.update_scheduler_config(&good).await.unwrap();
    assert_eq!(updated.base_interval_hours(Intensity::Chill), 48.0);
    // The old snapshot is untouched.
    assert_eq!(before.base_interval_hours(Intensity::Chill), 24.0);

    let saved = Settings::load(&path).await.unwrap();
    let base = saved.scheduler.unwrap().base_hours.unwrap();
    assert_eq!(base.get(&Intensity::Chill), Some(&48.0));
}

#[tokio::test]
async fn test_delete_note_removes_history() {
    let service = service_for(SchedulingModel::IntensityRich, Arc::new(ScriptedGenerator::always("CORRECT"))).await;
    let note = add_note(&service, "Drop order", Intensity::Moderate).await;
    service.submit_answer(answer(note.id, "reverse declaration order", 5.0)).await.unwrap();

    service.delete_note(note.id).await.unwrap();
    assert!(matches!(service.get_note(note.id).await, Err(Error::NotFound { .. })));
    assert!(service.db().reviews_for_note(note.id).await.unwrap().is_empty());
    assert!(matches!(service.delete_note(note.id).await, Err(Error::NotFound { .. })));
}

#[test]
fn test_scheduling_model_parsing_and_policy() {
    assert_eq!("intensity-simple".parse::<SchedulingModel>().unwrap(), SchedulingModel::IntensitySimple);
    assert_eq!("EASE".parse::<SchedulingModel>().unwrap(), SchedulingModel::Ease);
    assert!("fsrs".parse::<SchedulingModel>().is_err());
    assert_eq!(SchedulingModel::IntensityRich.default_policy(), ReviewCountPolicy::EveryReview);
    assert_eq!(SchedulingModel::Ease.default_policy(), ReviewCountPolicy::OnCorrect);
    assert_eq!(
        serde_json::to_string(&SchedulingModel::IntensityRich).unwrap(),
        "\"intensity-rich\""
    );
}

