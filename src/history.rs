use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::ReviewEvent;

/// Rating assumed when a note has no history yet.
pub const DEFAULT_DIFFICULTY: f64 = 3.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteStats {
    pub total: usize,
    pub correct: usize,
    pub incorrect: usize,
    /// Percentage in 0..=100.
    pub success_rate: f64,
    pub average_difficulty: f64,
    pub last_reviewed: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalStats {
    pub total: usize,
    pub correct: usize,
    pub incorrect: usize,
    pub success_rate: f64,
    pub average_difficulty: f64,
    pub total_notes: usize,
}

struct Tally {
    total: usize,
    correct: usize,
    success_rate: f64,
    average_difficulty: f64,
}

fn tally(events: &[ReviewEvent]) -> Tally {
    if events.is_empty() {
        return Tally {
            total: 0,
            correct: 0,
            success_rate: 0.0,
            average_difficulty: DEFAULT_DIFFICULTY,
        };
    }

    let total = events.len();
    let correct = events.iter().filter(|e| e.is_correct).count();
    let difficulty_sum: f64 = events.iter().map(|e| e.difficulty_rating).sum();

    Tally {
        total,
        correct,
        success_rate: correct as f64 / total as f64 * 100.0,
        average_difficulty: round2(difficulty_sum / total as f64),
    }
}

pub fn note_stats(events: &[ReviewEvent]) -> NoteStats {
    let t = tally(events);
    NoteStats {
        total: t.total,
        correct: t.correct,
        incorrect: t.total - t.correct,
        success_rate: t.success_rate,
        average_difficulty: t.average_difficulty,
        last_reviewed: last_review(events).map(|e| e.reviewed_at),
    }
}

pub fn global_stats(events: &[ReviewEvent]) -> GlobalStats {
    let t = tally(events);
    let total_notes = events.iter().map(|e| e.note_id).collect::<HashSet<_>>().len();
    GlobalStats {
        total: t.total,
        correct: t.correct,
        incorrect: t.total - t.correct,
        success_rate: t.success_rate,
        average_difficulty: t.average_difficulty,
        total_notes,
    }
}

/// Most recent event by `reviewed_at`; later ids win ties.
pub fn last_review(events: &[ReviewEvent]) -> Option<&ReviewEvent> {
    events.iter().max_by_key(|e| (e.reviewed_at, e.id))
}

/// Notes whose latest review scheduled them at or before `now`, by id.
pub fn due_note_ids(events: &[ReviewEvent], now: DateTime<Utc>) -> Vec<i64> {
    let mut latest: HashMap<i64, &ReviewEvent> = HashMap::new();
    for event in events {
        latest
            .entry(event.note_id)
            .and_modify(|current| {
                if (event.reviewed_at, event.id) > (current.reviewed_at, current.id) {
                    *current = event;
                }
            })
            .or_insert(event);
    }

    let mut due: Vec<i64> = latest
        .into_values()
        .filter(|e| e.next_review_date <= now)
        .map(|e| e.note_id)
        .collect();
    due.sort_unstable();
    due
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
