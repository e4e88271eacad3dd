use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::orchestrator::ReviewService;

#[derive(Debug, Clone)]
pub struct PregenOptions {
    pub enabled: bool,
    pub max_questions_per_run: usize,
    pub lookahead: Duration,
    /// Sessions starting within this window are logged as urgent.
    pub urgent_window: Duration,
}

impl Default for PregenOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_questions_per_run: 20,
            lookahead: Duration::hours(24),
            urgent_window: Duration::minutes(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PregenStatus {
    Cached,
    Generated,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct PregenResult {
    pub note_id: i64,
    pub status: PregenStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PregenSummary {
    pub total: usize,
    pub cached: usize,
    pub generated: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PregenReport {
    pub enabled: bool,
    pub summary: PregenSummary,
    pub results: Vec<PregenResult>,
    pub duration_ms: u64,
}

impl PregenReport {
    fn disabled() -> Self {
        Self {
            enabled: false,
            summary: PregenSummary::default(),
            results: Vec::new(),
            duration_ms: 0,
        }
    }
}

fn summarize(results: &[PregenResult]) -> PregenSummary {
    let count = |status| results.iter().filter(|r| r.status == status).count();
    PregenSummary {
        total: results.len(),
        cached: count(PregenStatus::Cached),
        generated: count(PregenStatus::Generated),
        failed: count(PregenStatus::Failed),
        skipped: count(PregenStatus::Skipped),
    }
}

pub struct PreGenerator {
    service: Arc<ReviewService>,
    options: PregenOptions,
}

impl PreGenerator {
    pub fn new(service: Arc<ReviewService>, options: PregenOptions) -> Self {
        Self { service, options }
    }

    /// One pass over the sessions inside the lookahead, soonest first.
    /// At most `max_questions_per_run` notes are processed; the rest are
    /// reported as skipped.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<PregenReport> {
        if !self.options.enabled {
            log::info!("Pre-generation disabled");
            return Ok(PregenReport::disabled());
        }

        let started = Instant::now();
        let sessions = self.service.upcoming_sessions(now, self.options.lookahead).await?;

        let mut results = Vec::new();
        let mut seen = HashSet::new();
        let mut processed = 0;

        for session in sessions.iter().filter(|s| s.within_lookahead) {
            let urgent = session
                .time_until_ms
                .is_some_and(|ms| ms <= self.options.urgent_window.num_milliseconds());
            log::info!(
                "Pre-generating for {} session at {:?} ({} note(s){})",
                session.intensity,
                session.next_session,
                session.notes.len(),
                if urgent { ", urgent" } else { "" }
            );

            for note in &session.notes {
                if !seen.insert(note.id) {
                    continue;
                }

                if processed >= self.options.max_questions_per_run {
                    results.push(PregenResult {
                        note_id: note.id,
                        status: PregenStatus::Skipped,
                        error: None,
                    });
                    continue;
                }
                processed += 1;

                if self.service.cache().peek(note.id, now).await?.is_some() {
                    results.push(PregenResult {
                        note_id: note.id,
                        status: PregenStatus::Cached,
                        error: None,
                    });
                    continue;
                }

                let generated = self.service.queue().pre_generate(note.clone()).await;
                let stored = match generated {
                    Ok(generated) => self
                        .service
                        .cache()
                        .put(note.id, &generated.question, &generated.model, None, Utc::now())
                        .await
                        .map(|_| ()),
                    Err(e) => Err(e),
                };
                let result = match stored {
                    Ok(()) => PregenResult {
                        note_id: note.id,
                        status: PregenStatus::Generated,
                        error: None,
                    },
                    Err(e) => {
                        log::warn!("Pre-generation failed for note {}: {}", note.id, e);
                        PregenResult {
                            note_id: note.id,
                            status: PregenStatus::Failed,
                            error: Some(e.to_string()),
                        }
                    }
                };
                results.push(result);
            }
        }

        self.service.cache().clean_expired(Utc::now()).await?;

        let summary = summarize(&results);
        log::info!(
            "Pre-generation done: {} generated, {} cached, {} failed, {} skipped in {:.2}s",
            summary.generated,
            summary.cached,
            summary.failed,
            summary.skipped,
            started.elapsed().as_secs_f64()
        );

        Ok(PregenReport {
            enabled: true,
            summary,
            results,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Runs [`run`](Self::run) every `interval` until `shutdown` flips to true
    /// or its sender is dropped. The first run happens immediately.
    pub fn spawn_auto(self: Arc<Self>, interval: std::time::Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            log::info!("Automatic pre-generation every {}s", interval.as_secs());

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run(Utc::now()).await {
                            log::error!("Automatic pre-generation failed: {}", e);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            log::info!("Automatic pre-generation stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}
