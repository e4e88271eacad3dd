use std::cmp::Ordering;

use chrono::{
    DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday,
};
use serde::{Deserialize, Serialize};

use crate::intensity::ReviewCountPolicy;
use crate::models::{Intensity, Note};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionWindow {
    /// Once a week on `weekday` at `hour:minute`.
    Weekly { weekday: Weekday, hour: u32, minute: u32 },
    /// Every day at `hour:minute`.
    Daily { hour: u32, minute: u32 },
    /// Every `seconds` from now on; always open.
    Every { seconds: i64 },
}

impl SessionWindow {
    fn time_of_day(&self) -> Option<NaiveTime> {
        match *self {
            SessionWindow::Weekly { hour, minute, .. } | SessionWindow::Daily { hour, minute } => {
                NaiveTime::from_hms_opt(hour, minute, 0)
            }
            SessionWindow::Every { .. } => None,
        }
    }

    fn weekday(&self) -> Option<Weekday> {
        match *self {
            SessionWindow::Weekly { weekday, .. } => Some(weekday),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionPlan {
    pub windows: Vec<SessionWindow>,
    pub max_notes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub chill: SessionPlan,
    pub moderate: SessionPlan,
    pub intensive: SessionPlan,
    pub soon: SessionPlan,
    pub tolerance_minutes: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            soon: SessionPlan {
                windows: vec![SessionWindow::Every { seconds: 2 * 60 }],
                max_notes: 3,
            },
            chill: SessionPlan {
                windows: vec![SessionWindow::Weekly {
                    weekday: Weekday::Sun,
                    hour: 10,
                    minute: 0,
                }],
                max_notes: 5,
            },
            moderate: SessionPlan {
                windows: vec![SessionWindow::Daily { hour: 9, minute: 0 }],
                max_notes: 10,
            },
            intensive: SessionPlan {
                windows: vec![
                    SessionWindow::Daily { hour: 9, minute: 0 },
                    SessionWindow::Daily { hour: 14, minute: 0 },
                    SessionWindow::Daily { hour: 20, minute: 0 },
                ],
                max_notes: 15,
            },
            tolerance_minutes: 30,
        }
    }
}

impl SessionConfig {
    pub fn plan(&self, intensity: Intensity) -> &SessionPlan {
        match intensity {
            Intensity::Chill => &self.chill,
            Intensity::Moderate => &self.moderate,
            Intensity::Intensive => &self.intensive,
            Intensity::Soon => &self.soon,
        }
    }

    pub fn tolerance(&self) -> Duration {
        Duration::minutes(self.tolerance_minutes)
    }

    /// Earliest session strictly after `from`, in `from`'s time zone.
    pub fn next_session_time<Tz: TimeZone>(
        &self,
        intensity: Intensity,
        from: &DateTime<Tz>,
    ) -> Option<DateTime<Tz>> {
        let mut next: Option<DateTime<Tz>> = None;

        for window in &self.plan(intensity).windows {
            if let SessionWindow::Every { seconds } = *window {
                return Some(from.clone() + Duration::seconds(seconds));
            }

            let Some(candidate) = next_occurrence(window, from) else {
                continue;
            };
            if next.as_ref().map_or(true, |best| candidate < *best) {
                next = Some(candidate);
            }
        }

        next
    }

    /// True when `now` is within the tolerance of any window of `intensity`.
    /// Interval windows are always open.
    pub fn is_session_active<Tz: TimeZone>(&self, intensity: Intensity, now: &DateTime<Tz>) -> bool {
        let tolerance = self.tolerance();
        let today = now.date_naive();

        for window in &self.plan(intensity).windows {
            let Some(time) = window.time_of_day() else {
                return true;
            };

            // Neighbouring days cover windows that straddle midnight.
            for offset in [-1, 0, 1] {
                let date = today + Duration::days(offset);
                if window.weekday().is_some_and(|w| w != date.weekday()) {
                    continue;
                }
                let Some(slot) = local_datetime(&now.timezone(), date, time) else {
                    continue;
                };
                let diff = now.clone().signed_duration_since(slot).abs();
                if diff <= tolerance {
                    return true;
                }
            }
        }

        false
    }

    /// Notes of `intensity` for one session, filled greedily by priority when
    /// more notes qualify than the cap (`max_notes` or the plan's default).
    pub fn session_notes<'a>(
        &self,
        all_notes: &'a [Note],
        intensity: Intensity,
        max_notes: Option<usize>,
    ) -> Vec<&'a Note> {
        let limit = max_notes.unwrap_or(self.plan(intensity).max_notes);
        let mut remaining: Vec<&Note> = all_notes
            .iter()
            .filter(|n| n.intensity == intensity)
            .collect();

        if remaining.len() <= limit {
            return remaining;
        }

        let mut prioritized = Vec::with_capacity(limit);
        while prioritized.len() < limit {
            let Some(index) = priority_index(&remaining) else {
                break;
            };
            prioritized.push(remaining.remove(index));
        }
        prioritized
    }

    pub fn upcoming_session_notes<'a, Tz: TimeZone>(
        &self,
        all_notes: &'a [Note],
        intensity: Intensity,
        now: &DateTime<Tz>,
        lookahead: Duration,
    ) -> UpcomingSession<'a> {
        let next_session = self
            .next_session_time(intensity, now)
            .map(|t| t.with_timezone(&Utc));
        let time_until = next_session.map(|t| t.signed_duration_since(now.with_timezone(&Utc)));

        let within_lookahead = time_until.is_some_and(|d| d > Duration::zero() && d <= lookahead);
        let notes = if within_lookahead {
            self.session_notes(all_notes, intensity, None)
        } else {
            Vec::new()
        };

        UpcomingSession {
            intensity,
            next_session,
            time_until,
            within_lookahead,
            notes,
        }
    }

    /// Next sessions of every clock-scheduled intensity, soonest first.
    pub fn all_upcoming_sessions<'a, Tz: TimeZone>(
        &self,
        all_notes: &'a [Note],
        now: &DateTime<Tz>,
        lookahead: Duration,
    ) -> Vec<UpcomingSession<'a>> {
        let mut sessions: Vec<UpcomingSession<'a>> = Intensity::SCHEDULED
            .iter()
            .map(|i| self.upcoming_session_notes(all_notes, *i, now, lookahead))
            .filter(|s| s.next_session.is_some())
            .collect();
        sessions.sort_by_key(|s| s.time_until);
        sessions
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpcomingSession<'a> {
    pub intensity: Intensity,
    pub next_session: Option<DateTime<Utc>>,
    #[serde(serialize_with = "serialize_millis")]
    pub time_until: Option<Duration>,
    pub within_lookahead: bool,
    pub notes: Vec<&'a Note>,
}

fn serialize_millis<S: serde::Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&d.num_milliseconds()),
        None => s.serialize_none(),
    }
}

/// Picks the note to ask first: never-reviewed notes by oldest creation,
/// otherwise the least recently reviewed, ties broken by fewest reviews.
pub fn select_priority_note(notes: &[Note]) -> Option<&Note> {
    let refs: Vec<&Note> = notes.iter().collect();
    priority_index(&refs).map(|i| refs[i])
}

fn priority_index(notes: &[&Note]) -> Option<usize> {
    let never_reviewed = notes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.last_reviewed.is_none())
        .min_by_key(|(_, n)| n.created_at)
        .map(|(i, _)| i);

    never_reviewed.or_else(|| {
        notes
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| compare_reviewed(a, b))
            .map(|(i, _)| i)
    })
}

fn compare_reviewed(a: &Note, b: &Note) -> Ordering {
    a.last_reviewed
        .cmp(&b.last_reviewed)
        .then(a.review_count.cmp(&b.review_count))
}

/// Minimal session-mode update: stamps the review and counts it per `policy`.
/// No interval math happens here.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SessionReview {
    pub last_reviewed: DateTime<Utc>,
    pub review_count: u32,
}

pub fn record_review(
    note: &Note,
    correct: bool,
    now: DateTime<Utc>,
    policy: ReviewCountPolicy,
) -> SessionReview {
    SessionReview {
        last_reviewed: now,
        review_count: policy.apply(note.review_count, correct),
    }
}

fn next_occurrence<Tz: TimeZone>(window: &SessionWindow, from: &DateTime<Tz>) -> Option<DateTime<Tz>> {
    let time = window.time_of_day()?;
    let tz = from.timezone();
    let today = from.date_naive();

    let first_date = match window.weekday() {
        Some(target) => {
            let current = today.weekday().num_days_from_sunday() as i64;
            let wanted = target.num_days_from_sunday() as i64;
            today + Duration::days((wanted - current).rem_euclid(7))
        }
        None => today,
    };
    let step = if window.weekday().is_some() { 7 } else { 1 };

    // A slot that is already over (or missing in a DST gap) rolls forward.
    (0..3)
        .map(|k| first_date + Duration::days(step * k))
        .filter_map(|date| local_datetime(&tz, date, time))
        .find(|candidate| candidate > from)
}

fn local_datetime<Tz: TimeZone>(tz: &Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Tz>> {
    tz.from_local_datetime(&date.and_time(time)).earliest()
}
