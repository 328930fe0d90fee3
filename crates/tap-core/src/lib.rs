//! Core domain model for the tender acquisition pipeline.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "tap-core";

/// Recurrence schedule for a registered job.
///
/// All variants are evaluated in UTC. `Weekly` counts weekdays from Monday
/// (0 = Monday .. 6 = Sunday); `Monthly` clamps the requested day to the
/// length of the month being considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recurrence {
    Every { minutes: u32 },
    Daily { hour: u32, minute: u32 },
    Weekly { weekday: u8, hour: u32, minute: u32 },
    Monthly { day: u32, hour: u32, minute: u32 },
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid recurrence: {0}")]
pub struct InvalidRecurrence(pub String);

fn check_time(hour: u32, minute: u32) -> Result<(), InvalidRecurrence> {
    if hour > 23 || minute > 59 {
        return Err(InvalidRecurrence(format!(
            "time of day {hour:02}:{minute:02} is out of range"
        )));
    }
    Ok(())
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

fn at_time(date: NaiveDate, hour: u32, minute: u32) -> DateTime<Utc> {
    date.and_hms_opt(hour.min(23), minute.min(59), 0)
        .expect("clamped time of day is always valid")
        .and_utc()
}

impl Recurrence {
    pub fn validate(&self) -> Result<(), InvalidRecurrence> {
        match *self {
            Recurrence::Every { minutes } => {
                if minutes == 0 {
                    return Err(InvalidRecurrence(
                        "interval must be at least one minute".to_string(),
                    ));
                }
            }
            Recurrence::Daily { hour, minute } => check_time(hour, minute)?,
            Recurrence::Weekly {
                weekday,
                hour,
                minute,
            } => {
                if weekday > 6 {
                    return Err(InvalidRecurrence(format!(
                        "weekday {weekday} is out of range (0 = Monday .. 6 = Sunday)"
                    )));
                }
                check_time(hour, minute)?;
            }
            Recurrence::Monthly { day, hour, minute } => {
                if day == 0 || day > 31 {
                    return Err(InvalidRecurrence(format!(
                        "day of month {day} is out of range (1..=31)"
                    )));
                }
                check_time(hour, minute)?;
            }
        }
        Ok(())
    }

    /// Next fire time strictly after `after`. Pure: same inputs, same answer.
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Recurrence::Every { minutes } => after + Duration::minutes(minutes.max(1) as i64),
            Recurrence::Daily { hour, minute } => {
                let mut candidate = at_time(after.date_naive(), hour, minute);
                if candidate <= after {
                    candidate += Duration::days(1);
                }
                candidate
            }
            Recurrence::Weekly {
                weekday,
                hour,
                minute,
            } => {
                let today = after.date_naive();
                let current = today.weekday().num_days_from_monday() as i64;
                let target = (weekday as i64).rem_euclid(7);
                let days_ahead = (target - current).rem_euclid(7);
                let mut candidate = at_time(today + Duration::days(days_ahead), hour, minute);
                if candidate <= after {
                    candidate += Duration::days(7);
                }
                candidate
            }
            Recurrence::Monthly { day, hour, minute } => {
                let date = after.date_naive();
                let mut year = date.year();
                let mut month = date.month();
                // At most two iterations: this month, else the next.
                loop {
                    let clamped = day.clamp(1, days_in_month(year, month));
                    let candidate_date = NaiveDate::from_ymd_opt(year, month, clamped)
                        .expect("clamped day of month is always valid");
                    let candidate = at_time(candidate_date, hour, minute);
                    if candidate > after {
                        return candidate;
                    }
                    if month == 12 {
                        year += 1;
                        month = 1;
                    } else {
                        month += 1;
                    }
                }
            }
        }
    }

    pub fn describe(&self) -> String {
        const WEEKDAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
        match *self {
            Recurrence::Every { minutes } => format!("every {minutes}m"),
            Recurrence::Daily { hour, minute } => format!("daily at {hour:02}:{minute:02}"),
            Recurrence::Weekly {
                weekday,
                hour,
                minute,
            } => {
                let day = WEEKDAYS.get(weekday as usize).copied().unwrap_or("?");
                format!("weekly on {day} at {hour:02}:{minute:02}")
            }
            Recurrence::Monthly { day, hour, minute } => {
                format!("monthly on day {day} at {hour:02}:{minute:02}")
            }
        }
    }
}

/// Persisted lifecycle state of a registered background job.
///
/// Definitions are seeded on first registration and mutated on every
/// execution; they are never deleted. `error_count` is the lifetime total,
/// `consecutive_failures` resets on success and drives auto-disable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    pub description: String,
    pub recurrence: Recurrence,
    pub active: bool,
    pub timeout_secs: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub error_count: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        recurrence: Recurrence,
        timeout_secs: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            recurrence,
            active: true,
            timeout_secs,
            last_run: None,
            next_run: None,
            run_count: 0,
            error_count: 0,
            consecutive_failures: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenderStatus {
    New,
    Analyzed,
    Closed,
}

impl TenderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenderStatus::New => "new",
            TenderStatus::Analyzed => "analyzed",
            TenderStatus::Closed => "closed",
        }
    }
}

/// Pre-persistence handoff contract from feed extraction into the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenderDraft {
    pub source: String,
    pub external_id: String,
    pub title: String,
    pub agency: Option<String>,
    pub category: String,
    pub estimated_value: Option<f64>,
    pub closing_date: Option<NaiveDate>,
    pub location: Option<String>,
    pub external_url: Option<String>,
}

/// Enrichment output attached to a tender once analysis has run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenderAnalysis {
    pub category: Option<String>,
    pub estimated_manpower: Option<u32>,
    pub duration_months: Option<u32>,
    pub skills_required: Vec<String>,
    pub urgency_score: Option<u8>,
    pub complexity_score: Option<u8>,
    pub confidence: f64,
}

/// Canonical persisted tender. The id is derived from the natural key, so
/// re-ingesting the same (source, external_id) can never mint a second row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenderRecord {
    pub id: Uuid,
    pub source: String,
    pub external_id: String,
    pub title: String,
    pub agency: Option<String>,
    pub category: String,
    pub estimated_value: Option<f64>,
    pub closing_date: Option<NaiveDate>,
    pub status: TenderStatus,
    pub location: Option<String>,
    pub external_url: Option<String>,
    pub analysis: Option<TenderAnalysis>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TenderRecord {
    pub fn deterministic_id(source: &str, external_id: &str) -> Uuid {
        Uuid::new_v5(
            &Uuid::NAMESPACE_URL,
            format!("{source}:{external_id}").as_bytes(),
        )
    }

    pub fn from_draft(draft: TenderDraft, now: DateTime<Utc>) -> Self {
        Self {
            id: Self::deterministic_id(&draft.source, &draft.external_id),
            source: draft.source,
            external_id: draft.external_id,
            title: draft.title,
            agency: draft.agency,
            category: draft.category,
            estimated_value: draft.estimated_value,
            closing_date: draft.closing_date,
            status: TenderStatus::New,
            location: draft.location,
            external_url: draft.external_url,
            analysis: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Saved keyword alert. External input: the core only ever advances
/// `last_checked`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: Uuid,
    pub keyword: String,
    pub email_notify: bool,
    pub active: bool,
    pub last_checked: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Alert-tender match. At most one per (alert, tender); immutable after
/// creation except the `notified` flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub id: Uuid,
    pub alert_id: Uuid,
    pub tender_id: Uuid,
    pub title: String,
    pub external_url: Option<String>,
    pub matched_keyword: String,
    pub notified: bool,
    pub created_at: DateTime<Utc>,
}

impl MatchRecord {
    pub fn deterministic_id(alert_id: &Uuid, tender_id: &Uuid) -> Uuid {
        Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            format!("{alert_id}:{tender_id}").as_bytes(),
        )
    }
}

/// Scoring input collected per candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateActivity {
    pub candidate_id: Uuid,
    pub has_resume: bool,
    pub has_skills: bool,
    pub has_availability: bool,
    pub has_contact: bool,
    pub has_preferences: bool,
    pub last_active_at: Option<DateTime<Utc>>,
    pub recent_applications: u32,
    pub recent_hires: u32,
    pub recent_messages: u32,
    pub last_engagement_attempt: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementTier {
    Intensive,
    Moderate,
    Maintain,
}

impl EngagementTier {
    pub fn for_score(score: u8) -> Self {
        match score {
            0..=29 => EngagementTier::Intensive,
            30..=59 => EngagementTier::Moderate,
            _ => EngagementTier::Maintain,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EngagementTier::Intensive => "intensive",
            EngagementTier::Moderate => "moderate",
            EngagementTier::Maintain => "maintain",
        }
    }
}

/// Result of one scoring pass over a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEngagementSnapshot {
    pub candidate_id: Uuid,
    pub score: u8,
    pub tier: EngagementTier,
    pub last_engagement_attempt: Option<DateTime<Utc>>,
    pub computed_at: DateTime<Utc>,
}

/// Persisted record of one pipeline execution, kept for the control surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub job: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub summary: String,
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn every_adds_whole_minutes() {
        let rec = Recurrence::Every { minutes: 30 };
        assert_eq!(
            rec.next_fire_after(utc(2026, 3, 10, 9, 15)),
            utc(2026, 3, 10, 9, 45)
        );
    }

    #[test]
    fn daily_rolls_to_next_day_once_time_has_passed() {
        let rec = Recurrence::Daily { hour: 2, minute: 0 };
        assert_eq!(
            rec.next_fire_after(utc(2026, 3, 10, 1, 59)),
            utc(2026, 3, 10, 2, 0)
        );
        assert_eq!(
            rec.next_fire_after(utc(2026, 3, 10, 2, 0)),
            utc(2026, 3, 11, 2, 0)
        );
    }

    #[test]
    fn weekly_counts_weekdays_from_monday() {
        // 2026-03-10 is a Tuesday.
        let rec = Recurrence::Weekly {
            weekday: 0,
            hour: 8,
            minute: 30,
        };
        assert_eq!(
            rec.next_fire_after(utc(2026, 3, 10, 12, 0)),
            utc(2026, 3, 16, 8, 30)
        );

        let same_day = Recurrence::Weekly {
            weekday: 1,
            hour: 14,
            minute: 0,
        };
        assert_eq!(
            same_day.next_fire_after(utc(2026, 3, 10, 12, 0)),
            utc(2026, 3, 10, 14, 0)
        );
        assert_eq!(
            same_day.next_fire_after(utc(2026, 3, 10, 14, 0)),
            utc(2026, 3, 17, 14, 0)
        );
    }

    #[test]
    fn monthly_clamps_to_month_length() {
        let rec = Recurrence::Monthly {
            day: 31,
            hour: 6,
            minute: 0,
        };
        // February 2026 has 28 days.
        assert_eq!(
            rec.next_fire_after(utc(2026, 2, 1, 0, 0)),
            utc(2026, 2, 28, 6, 0)
        );
        assert_eq!(
            rec.next_fire_after(utc(2026, 2, 28, 6, 0)),
            utc(2026, 3, 31, 6, 0)
        );
    }

    #[test]
    fn monthly_wraps_across_the_year_boundary() {
        let rec = Recurrence::Monthly {
            day: 1,
            hour: 2,
            minute: 0,
        };
        assert_eq!(
            rec.next_fire_after(utc(2025, 12, 15, 0, 0)),
            utc(2026, 1, 1, 2, 0)
        );
    }

    #[test]
    fn validate_rejects_out_of_range_fields() {
        assert!(Recurrence::Every { minutes: 0 }.validate().is_err());
        assert!(Recurrence::Daily { hour: 24, minute: 0 }.validate().is_err());
        assert!(Recurrence::Weekly {
            weekday: 7,
            hour: 0,
            minute: 0
        }
        .validate()
        .is_err());
        assert!(Recurrence::Monthly {
            day: 0,
            hour: 0,
            minute: 0
        }
        .validate()
        .is_err());
        assert!(Recurrence::Every { minutes: 1 }.validate().is_ok());
    }

    #[test]
    fn recurrence_serializes_with_a_kind_tag() {
        let json = serde_json::to_value(Recurrence::Weekly {
            weekday: 0,
            hour: 8,
            minute: 30,
        })
        .unwrap();
        assert_eq!(json["kind"], "weekly");
        assert_eq!(json["weekday"], 0);
    }

    #[test]
    fn tender_ids_are_deterministic_per_natural_key() {
        let a = TenderRecord::deterministic_id("gebiz", "T-1001");
        let b = TenderRecord::deterministic_id("gebiz", "T-1001");
        let c = TenderRecord::deterministic_id("gebiz", "T-1002");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn tier_thresholds_match_the_scoring_bands() {
        assert_eq!(EngagementTier::for_score(0), EngagementTier::Intensive);
        assert_eq!(EngagementTier::for_score(29), EngagementTier::Intensive);
        assert_eq!(EngagementTier::for_score(30), EngagementTier::Moderate);
        assert_eq!(EngagementTier::for_score(59), EngagementTier::Moderate);
        assert_eq!(EngagementTier::for_score(60), EngagementTier::Maintain);
        assert_eq!(EngagementTier::for_score(100), EngagementTier::Maintain);
    }
}
