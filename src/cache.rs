use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::db::Db;
use crate::error::Result;
use crate::models::CachedQuestion;

pub const DEFAULT_TTL_DAYS: i64 = 7;
pub const MAX_TTL_DAYS: i64 = 3650;

/// Non-positive TTLs fall back to the default; long ones are capped.
pub fn bounded_ttl(ttl: Duration) -> Duration {
    if ttl <= Duration::zero() {
        Duration::days(DEFAULT_TTL_DAYS)
    } else {
        ttl.min(Duration::days(MAX_TTL_DAYS))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub total: usize,
    pub expired: usize,
    pub valid: usize,
    pub ttl_days: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub generations: u64,
    pub total_requests: u64,
    /// Percentage, two decimals.
    pub hit_rate: f64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    generations: AtomicU64,
}

pub struct QuestionCache {
    db: Db,
    ttl: Duration,
    counters: Counters,
}

impl QuestionCache {
    pub fn new(db: Db, ttl: Duration) -> Self {
        let ttl = bounded_ttl(ttl);
        log::info!("Question cache TTL: {:.2} day(s)", ttl_days(ttl));

        Self {
            db,
            ttl,
            counters: Counters::default(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Stores a freshly generated question, replacing any previous entry.
    pub async fn put(
        &self,
        note_id: i64,
        question: &str,
        model: &str,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<CachedQuestion> {
        let entry = CachedQuestion {
            note_id,
            question: question.to_string(),
            model: model.to_string(),
            generated_at: now,
            expires_at: now
                .checked_add_signed(ttl.map_or(self.ttl, bounded_ttl))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        self.db.put_cached_question(&entry).await?;
        self.counters.generations.fetch_add(1, Ordering::Relaxed);

        log::debug!("Cached question for note {} (expires {})", note_id, entry.expires_at);
        Ok(entry)
    }

    /// Valid entry for `note_id`, if any. Expired entries are dropped on read.
    pub async fn get(&self, note_id: i64, now: DateTime<Utc>) -> Result<Option<CachedQuestion>> {
        let entry = match self.db.get_cached_question(note_id).await? {
            Some(entry) => entry,
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                log::debug!("Cache miss for note {}", note_id);
                return Ok(None);
            }
        };

        if entry.is_expired(now) {
            log::info!("Cached question for note {} expired at {}", note_id, entry.expires_at);
            self.db.delete_cached_question(note_id).await?;
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        log::debug!("Cache hit for note {}", note_id);
        Ok(Some(entry))
    }

    /// Like [`get`](Self::get) but without touching the hit/miss counters.
    pub async fn peek(&self, note_id: i64, now: DateTime<Utc>) -> Result<Option<CachedQuestion>> {
        let entry = self.db.get_cached_question(note_id).await?;
        Ok(entry.filter(|e| !e.is_expired(now)))
    }

    pub async fn invalidate(&self, note_id: i64) -> Result<bool> {
        let removed = self.db.delete_cached_question(note_id).await?;
        if removed {
            log::info!("Invalidated cached question for note {}", note_id);
        }
        Ok(removed)
    }

    pub async fn clean_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let removed = self.db.delete_expired_questions(now).await?;
        if removed > 0 {
            log::info!("Removed {} expired cached question(s)", removed);
        }
        Ok(removed)
    }

    pub async fn stats(&self, now: DateTime<Utc>) -> Result<CacheStats> {
        let entries = self.db.all_cached_questions().await?;
        let expired = entries.iter().filter(|e| e.is_expired(now)).count();

        Ok(CacheStats {
            total: entries.len(),
            expired,
            valid: entries.len() - expired,
            ttl_days: ttl_days(self.ttl),
        })
    }

    pub fn metrics(&self) -> CacheMetrics {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let total_requests = hits + misses;
        let hit_rate = if total_requests > 0 {
            (hits as f64 / total_requests as f64 * 10_000.0).round() / 100.0
        } else {
            0.0
        };

        CacheMetrics {
            hits,
            misses,
            generations: self.counters.generations.load(Ordering::Relaxed),
            total_requests,
            hit_rate,
        }
    }

    pub fn reset_metrics(&self) {
        self.counters.hits.store(0, Ordering::Relaxed);
        self.counters.misses.store(0, Ordering::Relaxed);
        self.counters.generations.store(0, Ordering::Relaxed);
    }
}

fn ttl_days(ttl: Duration) -> f64 {
    ttl.num_milliseconds() as f64 / Duration::days(1).num_milliseconds() as f64
}
