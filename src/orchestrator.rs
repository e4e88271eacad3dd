use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Duration, Local, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::cache::{CacheMetrics, CacheStats, QuestionCache};
use crate::config::Settings;
use crate::db::{Db, ScheduleUpdate};
use crate::error::{Error, Result};
use crate::feedback::FeedbackGenerator;
use crate::history::{self, GlobalStats, NoteStats};
use crate::intensity::{
    adjust_difficulty_rating, estimate_difficulty_rating, hours_to_duration, AdaptiveReviewInput,
    ConfigUpdate, ReviewCountPolicy, SchedulerConfig, SchedulingSummary, SimpleIntervalConfig,
    validate_scheduling_params,
};
use crate::llm::{AiConfigView, Evaluation, LlmService};
use crate::models::{Intensity, NewNote, NewReviewEvent, Note, NoteUpdate, ReviewEvent};
use crate::queue::{AiQueue, Priority, QueueStats, DEFAULT_CAPACITY};
use crate::session::{self, SessionConfig};
use crate::srs::{self, Quality};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulingModel {
    /// SM-2 ease factor and day intervals.
    Ease,
    /// Previous interval grown or shrunk by the outcome.
    IntensitySimple,
    /// Base hours by intensity, difficulty rating and progression.
    #[default]
    IntensityRich,
    /// Fixed windows only: the note comes back at its next session.
    Session,
}

impl SchedulingModel {
    pub fn default_policy(self) -> ReviewCountPolicy {
        match self {
            SchedulingModel::IntensityRich => ReviewCountPolicy::EveryReview,
            _ => ReviewCountPolicy::OnCorrect,
        }
    }
}

impl FromStr for SchedulingModel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ease" | "sm2" => Ok(SchedulingModel::Ease),
            "intensity-simple" | "simple" => Ok(SchedulingModel::IntensitySimple),
            "intensity-rich" | "rich" => Ok(SchedulingModel::IntensityRich),
            "session" => Ok(SchedulingModel::Session),
            other => Err(format!("Unknown scheduling model: {}", other)),
        }
    }
}

pub struct ServiceOptions {
    pub scheduling_model: SchedulingModel,
    pub review_count_policy: Option<ReviewCountPolicy>,
    pub scheduler: SchedulerConfig,
    pub simple: SimpleIntervalConfig,
    pub sessions: SessionConfig,
    pub cache_ttl: Duration,
    pub queue_capacity: usize,
    pub settings: Settings,
    /// Where scheduler overrides are persisted; `None` keeps them in memory.
    pub settings_path: Option<PathBuf>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        let settings = Settings::default();
        Self {
            scheduling_model: SchedulingModel::default(),
            review_count_policy: None,
            scheduler: SchedulerConfig::default(),
            simple: SimpleIntervalConfig::default(),
            sessions: SessionConfig::default(),
            cache_ttl: settings.cache_ttl(),
            queue_capacity: DEFAULT_CAPACITY,
            settings,
            settings_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStart {
    pub session_id: String,
    pub intensity: Intensity,
    pub active: bool,
    pub next_session: Option<DateTime<Utc>>,
    pub interrogations_enabled: bool,
    pub notes: Vec<Note>,
    pub total_notes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionSource {
    Cache,
    Generated,
    Fallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionQuestion {
    pub session_id: String,
    pub note_id: i64,
    pub question: String,
    pub model: String,
    pub source: QuestionSource,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Hint {
    pub note_id: i64,
    pub hint: String,
    pub fallback: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitAnswer {
    pub session_id: String,
    pub note_id: i64,
    pub question: String,
    #[serde(default)]
    pub model: Option<String>,
    pub user_response: String,
    #[serde(default, alias = "response_time")]
    pub response_time_secs: f64,
    /// Explicit 0-5 recall score; only the ease model reads it.
    #[serde(default)]
    pub score: Option<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewOutcome {
    pub review_id: i64,
    pub note_id: i64,
    pub evaluation: Evaluation,
    /// True when the heuristic stood in for the LLM.
    pub fallback_evaluation: bool,
    pub difficulty_rating: f64,
    pub next_review_date: DateTime<Utc>,
    pub scheduling_model: SchedulingModel,
    pub scheduling_summary: SchedulingSummary,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulePreview {
    pub intensity: String,
    pub difficulty_rating: f64,
    #[serde(default)]
    pub review_count: i64,
    pub was_correct: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpcomingSessionNotes {
    pub intensity: Intensity,
    pub next_session: Option<DateTime<Utc>>,
    pub time_until_ms: Option<i64>,
    pub within_lookahead: bool,
    pub notes: Vec<Note>,
}

pub struct ReviewService {
    db: Db,
    cache: QuestionCache,
    queue: AiQueue,
    llm: Arc<LlmService>,
    sessions: SessionConfig,
    simple: SimpleIntervalConfig,
    scheduler: RwLock<Arc<SchedulerConfig>>,
    model: SchedulingModel,
    policy: ReviewCountPolicy,
    settings: Mutex<Settings>,
    settings_path: Option<PathBuf>,
    note_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl ReviewService {
    pub fn new(db: Db, llm: Arc<LlmService>, options: ServiceOptions) -> Self {
        let policy = options
            .review_count_policy
            .unwrap_or_else(|| options.scheduling_model.default_policy());
        log::info!(
            "Scheduling with {:?} (review count policy {:?})",
            options.scheduling_model,
            policy
        );

        Self {
            cache: QuestionCache::new(db.clone(), options.cache_ttl),
            queue: AiQueue::start(Arc::clone(&llm), options.queue_capacity),
            db,
            llm,
            sessions: options.sessions,
            simple: options.simple,
            scheduler: RwLock::new(Arc::new(options.scheduler)),
            model: options.scheduling_model,
            policy,
            settings: Mutex::new(options.settings),
            settings_path: options.settings_path,
            note_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn cache(&self) -> &QuestionCache {
        &self.cache
    }

    pub fn queue(&self) -> &AiQueue {
        &self.queue
    }

    pub fn sessions(&self) -> &SessionConfig {
        &self.sessions
    }

    pub fn scheduling_model(&self) -> SchedulingModel {
        self.model
    }

    async fn note_lock(&self, note_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.note_locks.lock().await;
        locks.entry(note_id).or_default().clone()
    }

    pub async fn create_note(&self, input: NewNote) -> Result<Note> {
        self.db.create_note(input, Utc::now()).await
    }

    pub async fn get_note(&self, id: i64) -> Result<Note> {
        self.db.get_note(id).await
    }

    pub async fn list_notes(&self, intensity: Option<Intensity>) -> Result<Vec<Note>> {
        self.db.list_notes(intensity).await
    }

    /// Edits a note. Content changes drop its cached question.
    pub async fn update_note(&self, id: i64, update: NoteUpdate) -> Result<Note> {
        let lock = self.note_lock(id).await;
        let _guard = lock.lock().await;

        let note = self.db.update_note(id, &update, Utc::now()).await?;
        if update.changes_content() {
            self.cache.invalidate(id).await?;
        }
        Ok(note)
    }

    pub async fn delete_note(&self, id: i64) -> Result<()> {
        let lock = self.note_lock(id).await;
        let guard = lock.lock().await;
        self.db.delete_note(id).await?;
        drop(guard);

        self.note_locks.lock().await.remove(&id);
        Ok(())
    }

    pub async fn note_stats(&self, note_id: i64) -> Result<NoteStats> {
        self.db.get_note(note_id).await?;
        let events = self.db.reviews_for_note(note_id).await?;
        Ok(history::note_stats(&events))
    }

    pub async fn global_stats(&self) -> Result<GlobalStats> {
        let events = self.db.all_reviews().await?;
        Ok(history::global_stats(&events))
    }

    /// Notes whose latest review fell due, plus notes never reviewed.
    pub async fn due_notes(&self, intensity: Option<Intensity>, now: DateTime<Utc>) -> Result<Vec<Note>> {
        let events = self.db.all_reviews().await?;
        let due: HashSet<i64> = history::due_note_ids(&events, now).into_iter().collect();
        let notes = self.db.list_notes(intensity).await?;

        Ok(notes
            .into_iter()
            .filter(|n| due.contains(&n.id) || n.last_reviewed.is_none() || n.is_due(now))
            .collect())
    }

    pub async fn priority_note(&self, intensity: Intensity, now: DateTime<Utc>) -> Result<Option<Note>> {
        let due = self.due_notes(Some(intensity), now).await?;
        Ok(session::select_priority_note(&due).cloned())
    }

    pub async fn session_reviews(&self, session_id: &str) -> Result<Vec<ReviewEvent>> {
        self.db.reviews_for_session(session_id).await
    }

    pub async fn start_session(&self, intensity: Intensity, max_notes: Option<usize>) -> Result<SessionStart> {
        let now = Utc::now();
        let local_now = now.with_timezone(&Local);
        let candidates = self.due_notes(Some(intensity), now).await?;
        let notes: Vec<Note> = self
            .sessions
            .session_notes(&candidates, intensity, max_notes)
            .into_iter()
            .cloned()
            .collect();

        let session_id = Uuid::new_v4().to_string();
        let interrogations_enabled = self.settings.lock().await.interrogations_enabled;
        log::info!("Session {} started ({}, {} note(s))", session_id, intensity, notes.len());

        Ok(SessionStart {
            session_id,
            intensity,
            active: self.sessions.is_session_active(intensity, &local_now),
            next_session: self
                .sessions
                .next_session_time(intensity, &local_now)
                .map(|t| t.with_timezone(&Utc)),
            interrogations_enabled,
            total_notes: notes.len(),
            notes,
        })
    }

    /// Question for `note_id`: cached if valid, else generated at high
    /// priority and cached, else the generic fallback.
    pub async fn next_question(&self, session_id: &str, note_id: i64) -> Result<SessionQuestion> {
        let note = self.db.get_note(note_id).await?;
        let now = Utc::now();

        if let Some(cached) = self.cache.get(note_id, now).await? {
            return Ok(SessionQuestion {
                session_id: session_id.to_string(),
                note_id,
                question: cached.question,
                model: cached.model,
                source: QuestionSource::Cache,
                generated_at: cached.generated_at,
            });
        }

        let (generated, source) = match self.queue.generate_question(note.clone(), Priority::High).await {
            Ok(generated) => {
                if let Err(e) = self.cache.put(note_id, &generated.question, &generated.model, None, now).await {
                    log::warn!("Could not cache question for note {}: {}", note_id, e);
                }
                (generated, QuestionSource::Generated)
            }
            Err(e) => {
                log::warn!("Question generation failed for note {}, using fallback: {}", note_id, e);
                (FeedbackGenerator::question(&note.description), QuestionSource::Fallback)
            }
        };

        Ok(SessionQuestion {
            session_id: session_id.to_string(),
            note_id,
            question: generated.question,
            model: generated.model,
            source,
            generated_at: now,
        })
    }

    pub async fn hint(&self, note_id: i64) -> Result<Hint> {
        let note = self.db.get_note(note_id).await?;
        match self.queue.generate_hint(note).await {
            Ok(hint) => Ok(Hint {
                note_id,
                hint,
                fallback: false,
            }),
            Err(e) => {
                log::warn!("Hint generation failed for note {}, using fallback: {}", note_id, e);
                Ok(Hint {
                    note_id,
                    hint: FeedbackGenerator::hint(),
                    fallback: true,
                })
            }
        }
    }

    /// Evaluates an answer, reschedules the note and appends the review.
    pub async fn submit_answer(&self, submission: SubmitAnswer) -> Result<ReviewOutcome> {
        if submission.user_response.trim().is_empty() {
            return Err(Error::Validation("user_response must not be empty".to_string()));
        }
        if !submission.response_time_secs.is_finite() || submission.response_time_secs < 0.0 {
            return Err(Error::Validation(format!(
                "response_time_secs must be a non-negative number (got {})",
                submission.response_time_secs
            )));
        }
        let quality = submission
            .score
            .map(Quality::new)
            .transpose()
            .map_err(Error::Validation)?;

        let note = self.db.get_note(submission.note_id).await?;

        // The LLM call happens outside the note lock.
        let (evaluation, fallback_evaluation) = match self
            .queue
            .evaluate_answer(&submission.question, &submission.user_response, &note.description)
            .await
        {
            Ok(evaluation) => (evaluation, false),
            Err(e) => {
                log::warn!("Evaluation failed for note {}, using heuristic: {}", note.id, e);
                (FeedbackGenerator::evaluation(&submission.user_response), true)
            }
        };
        let correct = evaluation.is_correct;

        let lock = self.note_lock(note.id).await;
        let _guard = lock.lock().await;

        let note = self.db.get_note(submission.note_id).await?;
        let now = Utc::now();
        let difficulty_rating = match self.db.last_review(note.id).await? {
            Some(last) => adjust_difficulty_rating(last.difficulty_rating, correct),
            None => estimate_difficulty_rating(correct, submission.response_time_secs),
        };

        let quality = quality.unwrap_or_else(|| Quality::from_outcome(correct, submission.response_time_secs));
        let (schedule, summary) = self.reschedule(&note, correct, quality, difficulty_rating, now);

        let event = NewReviewEvent {
            session_id: submission.session_id,
            note_id: note.id,
            question: submission.question,
            model: submission.model.unwrap_or_else(|| "unknown".to_string()),
            user_response: submission.user_response,
            is_correct: correct,
            feedback: evaluation.feedback.clone(),
            difficulty_rating,
            response_time_secs: submission.response_time_secs,
            next_review_date: schedule.next_review_at,
            reviewed_at: now,
        };

        let review = self
            .db
            .record_review(note.id, note.version, &schedule, &event, now)
            .await?;

        log::info!(
            "Review {} saved for note {} ({}, difficulty {:.1}, next review {})",
            review.id,
            note.id,
            if correct { "correct" } else { "incorrect" },
            difficulty_rating,
            schedule.next_review_at
        );

        Ok(ReviewOutcome {
            review_id: review.id,
            note_id: note.id,
            evaluation,
            fallback_evaluation,
            difficulty_rating,
            next_review_date: schedule.next_review_at,
            scheduling_model: self.model,
            scheduling_summary: summary,
        })
    }

    fn reschedule(
        &self,
        note: &Note,
        correct: bool,
        quality: Quality,
        difficulty_rating: f64,
        now: DateTime<Utc>,
    ) -> (ScheduleUpdate, SchedulingSummary) {
        let mut schedule = ScheduleUpdate::from_note(note);
        schedule.last_reviewed = Some(now);
        schedule.review_count = self.policy.apply(note.review_count, correct);

        let interval = match self.model {
            SchedulingModel::IntensityRich => {
                let input = AdaptiveReviewInput {
                    intensity: note.intensity,
                    difficulty_rating,
                    review_count: schedule.review_count,
                    was_correct: correct,
                };
                let config = self.scheduler_config();
                let interval = hours_to_duration(config.next_interval_hours(&input));
                schedule.last_interval_ms = Some(interval.num_milliseconds());
                interval
            }
            SchedulingModel::IntensitySimple => {
                let review = self.simple.compute_next_review(note, correct, now, self.policy);
                schedule.last_interval_ms = Some(review.last_interval.num_milliseconds());
                review.last_interval
            }
            SchedulingModel::Ease => {
                let state = srs::compute_ease(quality, note.current_interval, note.ease_factor);
                schedule.ease_factor = state.ease_factor;
                schedule.current_interval = state.interval;
                srs::next_review_date(now, state.interval) - now
            }
            SchedulingModel::Session => {
                let review = session::record_review(note, correct, now, self.policy);
                schedule.review_count = review.review_count;
                self.sessions
                    .next_session_time(note.intensity, &now.with_timezone(&Local))
                    .map(|t| t.with_timezone(&Utc) - now)
                    .unwrap_or_else(Duration::zero)
            }
        };
        schedule.next_review_at = now + interval;

        let interval_hours = interval.num_milliseconds() as f64 / 3_600_000.0;
        let summary = SchedulingSummary {
            interval_hours,
            interval_days: interval_hours / 24.0,
            next_review_date: schedule.next_review_at,
            difficulty_rating,
            intensity: note.intensity,
            review_count: schedule.review_count,
        };
        (schedule, summary)
    }

    pub async fn upcoming_sessions(&self, now: DateTime<Utc>, lookahead: Duration) -> Result<Vec<UpcomingSessionNotes>> {
        let notes = self.db.list_notes(None).await?;
        let local_now = now.with_timezone(&Local);

        Ok(self
            .sessions
            .all_upcoming_sessions(&notes, &local_now, lookahead)
            .into_iter()
            .map(|s| UpcomingSessionNotes {
                intensity: s.intensity,
                next_session: s.next_session,
                time_until_ms: s.time_until.map(|d| d.num_milliseconds()),
                within_lookahead: s.within_lookahead,
                notes: s.notes.into_iter().cloned().collect(),
            })
            .collect())
    }

    pub fn scheduler_config(&self) -> Arc<SchedulerConfig> {
        let current = self.scheduler.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&*current)
    }

    /// Applies `update` to a copy of the scheduler configuration and swaps
    /// it in. Reviews already running keep the snapshot they started with.
    pub async fn update_scheduler_config(&self, update: &ConfigUpdate) -> Result<Arc<SchedulerConfig>> {
        let next = Arc::new(self.scheduler_config().updated(update).map_err(Error::Validation)?);
        {
            let mut current = self.scheduler.write().unwrap_or_else(PoisonError::into_inner);
            *current = Arc::clone(&next);
        }

        let mut settings = self.settings.lock().await;
        settings.merge_scheduler(update);
        if let Some(path) = &self.settings_path {
            settings.save(path).await?;
        }
        log::info!("Scheduler configuration updated");

        Ok(next)
    }

    /// Summary the adaptive engine would produce for the given parameters,
    /// without touching any note.
    pub fn preview_schedule(&self, preview: &SchedulePreview, now: DateTime<Utc>) -> Result<SchedulingSummary> {
        validate_scheduling_params(&preview.intensity, preview.difficulty_rating, preview.review_count)
            .map_err(|errors| Error::Validation(errors.join("; ")))?;
        let intensity = Intensity::from_str(&preview.intensity).map_err(|e| Error::Validation(e.to_string()))?;

        let input = AdaptiveReviewInput {
            intensity,
            difficulty_rating: preview.difficulty_rating,
            review_count: u32::try_from(preview.review_count).unwrap_or(u32::MAX),
            was_correct: preview.was_correct,
        };
        Ok(self.scheduler_config().summary(&input, now))
    }

    pub fn ai_config(&self) -> AiConfigView {
        self.llm.config()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub async fn cache_stats(&self) -> Result<CacheStats> {
        self.cache.stats(Utc::now()).await
    }

    pub fn cache_metrics(&self) -> CacheMetrics {
        self.cache.metrics()
    }

    pub fn reset_cache_metrics(&self) {
        self.cache.reset_metrics();
    }

    pub async fn clean_cache(&self) -> Result<u64> {
        self.cache.clean_expired(Utc::now()).await
    }
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
