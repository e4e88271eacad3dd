use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::srs::INITIAL_EASE;

/// Review frequency tier chosen by the user for a note.
///
/// Clients send either the name or the legacy numeric level
/// (1 = chill, 2 = moderate, 3 = intensive); both map onto this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "IntensityRepr")]
pub enum Intensity {
    Chill,
    Moderate,
    Intensive,
    /// Rapid manual testing: sessions every couple of minutes.
    Soon,
}

impl Intensity {
    pub const ALL: [Intensity; 4] = [
        Intensity::Chill,
        Intensity::Moderate,
        Intensity::Intensive,
        Intensity::Soon,
    ];

    pub const SCHEDULED: [Intensity; 3] =
        [Intensity::Intensive, Intensity::Moderate, Intensity::Chill];

    pub fn as_str(&self) -> &'static str {
        match self {
            Intensity::Chill => "chill",
            Intensity::Moderate => "moderate",
            Intensity::Intensive => "intensive",
            Intensity::Soon => "soon",
        }
    }

    pub fn from_level(level: u8) -> Result<Self, ParseIntensityError> {
        match level {
            1 => Ok(Intensity::Chill),
            2 => Ok(Intensity::Moderate),
            3 => Ok(Intensity::Intensive),
            other => Err(ParseIntensityError(other.to_string())),
        }
    }
}

impl Default for Intensity {
    fn default() -> Self {
        Intensity::Moderate
    }
}

impl fmt::Display for Intensity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown intensity: {0}")]
pub struct ParseIntensityError(pub String);

impl FromStr for Intensity {
    type Err = ParseIntensityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "chill" => Ok(Intensity::Chill),
            "moderate" => Ok(Intensity::Moderate),
            "intensive" => Ok(Intensity::Intensive),
            "soon" => Ok(Intensity::Soon),
            other => match other.parse::<u8>() {
                Ok(level) => Intensity::from_level(level),
                Err(_) => Err(ParseIntensityError(trimmed.to_string())),
            },
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IntensityRepr {
    Level(u8),
    Name(String),
}

impl TryFrom<IntensityRepr> for Intensity {
    type Error = ParseIntensityError;

    fn try_from(repr: IntensityRepr) -> Result<Self, Self::Error> {
        match repr {
            IntensityRepr::Level(level) => Intensity::from_level(level),
            IntensityRepr::Name(name) => name.parse(),
        }
    }
}

/// A user's memorization item together with its scheduling state.
///
/// Both scheduling representations live on the row; each engine only reads
/// and writes its own fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Note {
    pub id: i64,
    pub title: Option<String>,
    pub description: String,
    pub intensity: Intensity,
    pub color: Option<String>,
    // Ease representation
    pub ease_factor: f64,
    pub current_interval: u32, // days
    // Interval representation
    pub last_interval_ms: Option<i64>,
    pub review_count: u32,
    pub last_reviewed: Option<DateTime<Utc>>,
    pub next_review_at: DateTime<Utc>,
    /// Optimistic-lock counter, bumped on every write.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Note {
    pub fn new(id: i64, input: NewNote, now: DateTime<Utc>) -> Self {
        Self {
            id,
            title: input.title,
            description: input.description,
            intensity: input.intensity,
            color: input.color,
            ease_factor: INITIAL_EASE,
            current_interval: 0,
            last_interval_ms: None,
            review_count: 0,
            last_reviewed: None,
            next_review_at: now,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn last_interval(&self) -> Option<Duration> {
        self.last_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::milliseconds)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        crate::intensity::is_due_for_review(self.next_review_at, now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNote {
    #[serde(default)]
    pub title: Option<String>,
    pub description: String,
    #[serde(default)]
    pub intensity: Intensity,
    #[serde(default)]
    pub color: Option<String>,
}

impl NewNote {
    pub fn validate(&self) -> Result<(), String> {
        if self.description.trim().is_empty() {
            return Err("description must not be empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoteUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub intensity: Option<Intensity>,
    pub color: Option<String>,
}

impl NoteUpdate {
    pub fn changes_content(&self) -> bool {
        self.title.is_some() || self.description.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewEvent {
    pub id: i64,
    pub session_id: String,
    pub note_id: i64,
    pub question: String,
    pub model: String,
    pub user_response: String,
    pub is_correct: bool,
    pub feedback: String,
    pub difficulty_rating: f64,
    pub response_time_secs: f64,
    pub next_review_date: DateTime<Utc>,
    pub reviewed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewReviewEvent {
    pub session_id: String,
    pub note_id: i64,
    pub question: String,
    pub model: String,
    pub user_response: String,
    pub is_correct: bool,
    pub feedback: String,
    pub difficulty_rating: f64,
    pub response_time_secs: f64,
    pub next_review_date: DateTime<Utc>,
    pub reviewed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedQuestion {
    pub note_id: i64,
    pub question: String,
    pub model: String,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CachedQuestion {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}
