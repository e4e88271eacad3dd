use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub const INITIAL_EASE: f64 = 2.5;
pub const MIN_EASE: f64 = 1.3;
pub const MAX_EASE: f64 = 2.5;
/// Longest interval the ease engine schedules, in days.
pub const MAX_INTERVAL_DAYS: u32 = 36_500;

/// Recall quality on the SM-2 scale.
///
/// 5 - Perfect response
/// 4 - Correct response after a hesitation
/// 3 - Correct response recalled with serious difficulty
/// 2 - Incorrect response; where the correct one seemed easy to recall
/// 1 - Incorrect response; the correct one remembered
/// 0 - Complete blackout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Quality(u8);

impl Quality {
    pub fn new(score: u8) -> Result<Self, String> {
        if score > 5 {
            return Err(format!("score must be between 0 and 5 (got {})", score));
        }
        Ok(Self(score))
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn is_pass(self) -> bool {
        self.0 >= 3
    }

    /// Derives a quality from a boolean evaluation when no explicit score
    /// was given: fast correct answers score higher, long failures score 0.
    pub fn from_outcome(correct: bool, response_time_secs: f64) -> Self {
        let score = match (correct, response_time_secs) {
            (true, t) if t < 10.0 => 5,
            (true, t) if t < 30.0 => 4,
            (true, _) => 3,
            (false, t) if t > 60.0 => 0,
            (false, _) => 1,
        };
        Self(score)
    }
}

impl TryFrom<u8> for Quality {
    type Error = String;

    fn try_from(score: u8) -> Result<Self, Self::Error> {
        Quality::new(score)
    }
}

impl From<Quality> for u8 {
    fn from(q: Quality) -> u8 {
        q.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EaseState {
    pub interval: u32, // days
    pub ease_factor: f64,
}

/// Calculates the next review interval and easiness factor.
///
/// A failed recall resets the interval to one day and lowers the ease by 0.2;
/// a pass applies the SM-2 ease update and steps 1 -> 6 -> interval * EF.
/// The ease factor stays within [MIN_EASE, MAX_EASE] on every path and the
/// interval never exceeds MAX_INTERVAL_DAYS.
pub fn compute_ease(quality: Quality, current_interval: u32, ease_factor: f64) -> EaseState {
    let ease_factor = clamp_ease(ease_factor);

    if !quality.is_pass() {
        return EaseState {
            interval: 1,
            ease_factor: clamp_ease(ease_factor - 0.2),
        };
    }

    // EF' = EF + (0.1 - (5 - q) * (0.08 + (5 - q) * 0.02))
    let miss = 5.0 - quality.value() as f64;
    let new_ef = clamp_ease(ease_factor + (0.1 - miss * (0.08 + miss * 0.02)));

    let interval = match current_interval {
        0 => 1,
        1 => 6,
        n => (n as f64 * new_ef).round() as u32,
    };

    EaseState {
        interval: interval.clamp(1, MAX_INTERVAL_DAYS),
        ease_factor: new_ef,
    }
}

pub fn next_review_date(now: DateTime<Utc>, interval_days: u32) -> DateTime<Utc> {
    let days = Duration::days(interval_days.min(MAX_INTERVAL_DAYS) as i64);
    now.checked_add_signed(days).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn clamp_ease(ef: f64) -> f64 {
    if ef.is_nan() {
        return INITIAL_EASE;
    }
    ef.clamp(MIN_EASE, MAX_EASE)
}
