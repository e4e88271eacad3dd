use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Intensity, Note};

const MS_PER_HOUR: f64 = 3_600_000.0;

/// One value per intensity tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntensityTable<T> {
    pub chill: T,
    pub moderate: T,
    pub intensive: T,
    pub soon: T,
}

impl<T: Copy> IntensityTable<T> {
    pub fn get(&self, intensity: Intensity) -> T {
        match intensity {
            Intensity::Chill => self.chill,
            Intensity::Moderate => self.moderate,
            Intensity::Intensive => self.intensive,
            Intensity::Soon => self.soon,
        }
    }

    pub fn with(mut self, intensity: Intensity, value: T) -> Self {
        match intensity {
            Intensity::Chill => self.chill = value,
            Intensity::Moderate => self.moderate = value,
            Intensity::Intensive => self.intensive = value,
            Intensity::Soon => self.soon = value,
        }
        self
    }
}

/// Whether a review bumps `review_count` only when it was answered correctly
/// or every time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReviewCountPolicy {
    OnCorrect,
    EveryReview,
}

impl ReviewCountPolicy {
    pub fn apply(self, review_count: u32, correct: bool) -> u32 {
        match self {
            ReviewCountPolicy::OnCorrect if !correct => review_count,
            _ => review_count.saturating_add(1),
        }
    }
}

impl std::str::FromStr for ReviewCountPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on-correct" | "on_correct" => Ok(ReviewCountPolicy::OnCorrect),
            "every-review" | "every_review" => Ok(ReviewCountPolicy::EveryReview),
            other => Err(format!("Unknown review count policy: {}", other)),
        }
    }
}

pub fn is_due_for_review(next_review_date: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    next_review_date <= now
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimpleIntervalConfig {
    pub base: IntensityTable<Duration>,
    pub growth: f64,
    pub shrink: f64,
    /// Fraction of the base interval a failure can never go below.
    pub failure_floor: f64,
    pub max_interval: Duration,
    pub min_interval: Duration,
}

impl Default for SimpleIntervalConfig {
    fn default() -> Self {
        Self {
            base: IntensityTable {
                chill: Duration::days(7),
                moderate: Duration::days(1),
                intensive: Duration::hours(6),
                soon: Duration::days(1),
            },
            growth: 1.5,
            shrink: 0.6,
            failure_floor: 0.5,
            max_interval: Duration::days(365),
            min_interval: Duration::hours(1),
        }
    }
}

impl SimpleIntervalConfig {
    /// Short intervals for exercising notifications by hand.
    pub fn rapid_testing() -> Self {
        Self {
            base: IntensityTable {
                chill: Duration::minutes(5),
                moderate: Duration::minutes(2),
                intensive: Duration::seconds(30),
                soon: Duration::minutes(2),
            },
            max_interval: Duration::minutes(60),
            min_interval: Duration::seconds(10),
            ..Self::default()
        }
    }

    pub fn base_interval(&self, intensity: Intensity) -> Duration {
        self.base.get(intensity)
    }

    pub fn next_interval(
        &self,
        previous: Option<Duration>,
        intensity: Intensity,
        correct: bool,
    ) -> Duration {
        let base_ms = self.base_interval(intensity).num_milliseconds() as f64;
        let prev_ms = previous
            .map(|d| d.num_milliseconds() as f64)
            .filter(|ms| *ms > 0.0)
            .unwrap_or(base_ms);

        let next_ms = if correct {
            (prev_ms * self.growth).min(self.max_interval.num_milliseconds() as f64)
        } else {
            (base_ms * self.failure_floor).max(prev_ms * self.shrink)
        };

        let floor_ms = self.min_interval.num_milliseconds() as f64;
        Duration::milliseconds(next_ms.max(floor_ms).round() as i64)
    }

    pub fn compute_next_review(
        &self,
        note: &Note,
        correct: bool,
        now: DateTime<Utc>,
        policy: ReviewCountPolicy,
    ) -> IntervalReview {
        let interval = self.next_interval(note.last_interval(), note.intensity, correct);
        IntervalReview {
            last_interval: interval,
            next_review_at: now + interval,
            last_reviewed: now,
            review_count: policy.apply(note.review_count, correct),
        }
    }
}

/// New interval-representation state after one review.
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalReview {
    pub last_interval: Duration,
    pub next_review_at: DateTime<Utc>,
    pub last_reviewed: DateTime<Utc>,
    pub review_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub base_hours: IntensityTable<f64>,
    /// Multiplier for ratings 1..=5; a low rating means a hard note.
    pub difficulty_multipliers: [f64; 5],
    pub progression_multiplier: f64,
    pub regression_multiplier: f64,
    pub max_progression_steps: u32,
    pub min_interval_hours: f64,
    pub max_interval_hours: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_hours: IntensityTable {
                chill: 24.0,
                moderate: 12.0,
                intensive: 8.0,
                soon: 1.0,
            },
            difficulty_multipliers: [0.5, 0.75, 1.0, 1.5, 3.0],
            progression_multiplier: 1.5,
            regression_multiplier: 0.5,
            max_progression_steps: 5,
            min_interval_hours: 1.0,
            max_interval_hours: 24.0 * 30.0,
        }
    }
}

/// Partial override of a [`SchedulerConfig`]; absent keys keep their value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigUpdate {
    #[serde(default)]
    pub base_hours: Option<HashMap<Intensity, f64>>,
    #[serde(default)]
    pub difficulty_multipliers: Option<HashMap<u8, f64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveReviewInput {
    pub intensity: Intensity,
    pub difficulty_rating: f64,
    pub review_count: u32,
    pub was_correct: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulingSummary {
    pub interval_hours: f64,
    pub interval_days: f64,
    pub next_review_date: DateTime<Utc>,
    pub difficulty_rating: f64,
    pub intensity: Intensity,
    pub review_count: u32,
}

impl SchedulerConfig {
    pub fn base_interval_hours(&self, intensity: Intensity) -> f64 {
        self.base_hours.get(intensity)
    }

    pub fn difficulty_multiplier(&self, difficulty_rating: f64) -> f64 {
        let rating = clamp_rating(difficulty_rating).round() as usize;
        self.difficulty_multipliers[rating - 1]
    }

    pub fn progression_multiplier(&self, review_count: u32, was_correct: bool) -> f64 {
        if !was_correct {
            self.regression_multiplier
        } else if review_count > 0 {
            let steps = review_count.min(self.max_progression_steps) as i32;
            self.progression_multiplier.powi(steps)
        } else {
            1.0
        }
    }

    pub fn next_interval_hours(&self, input: &AdaptiveReviewInput) -> f64 {
        let hours = self.base_interval_hours(input.intensity)
            * self.difficulty_multiplier(input.difficulty_rating)
            * self.progression_multiplier(input.review_count, input.was_correct);
        hours.clamp(self.min_interval_hours, self.max_interval_hours)
    }

    pub fn next_review_date(&self, input: &AdaptiveReviewInput, now: DateTime<Utc>) -> DateTime<Utc> {
        now + hours_to_duration(self.next_interval_hours(input))
    }

    pub fn summary(&self, input: &AdaptiveReviewInput, now: DateTime<Utc>) -> SchedulingSummary {
        let interval_hours = self.next_interval_hours(input);
        SchedulingSummary {
            interval_hours,
            interval_days: interval_hours / 24.0,
            next_review_date: now + hours_to_duration(interval_hours),
            difficulty_rating: input.difficulty_rating,
            intensity: input.intensity,
            review_count: input.review_count,
        }
    }

    /// Returns a copy with `update` applied, rejecting non-positive values
    /// and ratings outside 1..=5.
    pub fn updated(&self, update: &ConfigUpdate) -> Result<SchedulerConfig, String> {
        let mut next = self.clone();

        if let Some(base_hours) = &update.base_hours {
            for (intensity, hours) in base_hours {
                if !hours.is_finite() || *hours <= 0.0 {
                    return Err(format!("base interval for {} must be positive", intensity));
                }
                next.base_hours = next.base_hours.with(*intensity, *hours);
            }
        }

        if let Some(multipliers) = &update.difficulty_multipliers {
            for (rating, multiplier) in multipliers {
                if !(1..=5).contains(rating) {
                    return Err(format!("difficulty rating {} is outside 1-5", rating));
                }
                if !multiplier.is_finite() || *multiplier <= 0.0 {
                    return Err(format!("multiplier for rating {} must be positive", rating));
                }
                next.difficulty_multipliers[(*rating - 1) as usize] = *multiplier;
            }
        }

        Ok(next)
    }
}

pub fn clamp_rating(rating: f64) -> f64 {
    if rating.is_nan() {
        return 3.0;
    }
    rating.clamp(1.0, 5.0)
}

/// Initial difficulty rating for a note with no history.
pub fn estimate_difficulty_rating(was_correct: bool, response_time_secs: f64) -> f64 {
    if !was_correct {
        return if response_time_secs > 60.0 { 1.0 } else { 2.0 };
    }

    if response_time_secs < 10.0 {
        5.0
    } else if response_time_secs < 30.0 {
        4.0
    } else if response_time_secs < 60.0 {
        3.0
    } else {
        2.0
    }
}

/// Drifts an existing rating by half a point towards easy or hard.
pub fn adjust_difficulty_rating(current_rating: f64, was_correct: bool) -> f64 {
    let delta = if was_correct { 0.5 } else { -0.5 };
    clamp_rating(clamp_rating(current_rating) + delta)
}

/// Lists every problem with raw scheduling parameters.
pub fn validate_scheduling_params(
    intensity: &str,
    difficulty_rating: f64,
    review_count: i64,
) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if intensity.parse::<Intensity>().is_err() {
        errors.push(format!("Invalid intensity: {}", intensity));
    }
    if !(1.0..=5.0).contains(&difficulty_rating) {
        errors.push(format!(
            "difficulty_rating must be between 1 and 5 (got {})",
            difficulty_rating
        ));
    }
    if review_count < 0 {
        errors.push(format!(
            "review_count cannot be negative (got {})",
            review_count
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

pub fn hours_to_duration(hours: f64) -> Duration {
    Duration::milliseconds((hours * MS_PER_HOUR).round() as i64)
}
