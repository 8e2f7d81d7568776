//! Windowed per-student signals computed from read-only history.

use std::collections::BTreeSet;

use chrono::{Duration, NaiveDate};

use crate::models::{AttendanceRecord, AttendanceStatus, PerformanceRecord, SocioeconomicProfile};
use crate::rules::{AttendanceRules, RiskRuleConfig, WindowMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbsenceSummary {
    pub absences: u32,
    pub sample: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreSummary {
    pub average_pct: f64,
    pub term: Option<String>,
    pub sample: usize,
}

/// First day of a calendar window of `window_days` ending on `today`.
pub fn window_start(today: NaiveDate, window_days: u32) -> NaiveDate {
    today - Duration::days(i64::from(window_days.max(1)) - 1)
}

/// Count absences inside the configured window. Days without a record are not absences.
pub fn absence_window(
    records: &[AttendanceRecord],
    today: NaiveDate,
    rules: &AttendanceRules,
) -> AbsenceSummary {
    let in_window: Vec<&AttendanceRecord> = match rules.window_mode {
        WindowMode::CalendarDays => {
            let start = window_start(today, rules.window_days);
            records
                .iter()
                .filter(|r| r.date >= start && r.date <= today)
                .collect()
        }
        WindowMode::RecordedDays => {
            let dates: BTreeSet<NaiveDate> = records
                .iter()
                .filter(|r| r.date <= today)
                .map(|r| r.date)
                .collect();
            let kept: BTreeSet<NaiveDate> = dates
                .into_iter()
                .rev()
                .take(rules.window_days as usize)
                .collect();
            records.iter().filter(|r| kept.contains(&r.date)).collect()
        }
    };

    let absences = in_window
        .iter()
        .filter(|r| r.status == AttendanceStatus::Absent)
        .count();

    AbsenceSummary {
        absences: absences as u32,
        sample: in_window.len() as u32,
    }
}

/// Average percentage over the most recent term, or over everything when that term is unset.
pub fn term_average(records: &[PerformanceRecord]) -> Option<ScoreSummary> {
    let usable: Vec<&PerformanceRecord> = records
        .iter()
        .filter(|r| r.max_score > 0.0 && r.score.is_finite() && r.max_score.is_finite())
        .collect();

    let latest = usable.iter().max_by_key(|r| r.recorded_on)?;
    let term = latest.term.clone();

    let selected: Vec<&&PerformanceRecord> = match &term {
        Some(t) => usable
            .iter()
            .filter(|r| r.term.as_deref() == Some(t.as_str()))
            .collect(),
        None => usable.iter().collect(),
    };

    let total: f64 = selected
        .iter()
        .map(|r| r.score * 100.0 / r.max_score)
        .sum();

    Some(ScoreSummary {
        average_pct: total / selected.len() as f64,
        term,
        sample: selected.len(),
    })
}

pub const FACTOR_EXTREME_POVERTY: &str = "extreme_poverty";
pub const FACTOR_NO_PARENTS: &str = "no_parents";
pub const FACTOR_UNSTABLE_FAMILY: &str = "unstable_family";
pub const FACTOR_LARGE_FAMILY: &str = "large_family";
pub const FACTOR_LONG_DISTANCE: &str = "long_distance";

/// Names of the hardship factors present in the profile, in a stable order.
pub fn socioeconomic_factors(profile: &SocioeconomicProfile, rules: &RiskRuleConfig) -> Vec<&'static str> {
    let mut factors = Vec::new();

    if matches!(profile.ubudehe_level, Some(level) if level <= 1) {
        factors.push(FACTOR_EXTREME_POVERTY);
    }
    if profile.has_parents == Some(false) {
        factors.push(FACTOR_NO_PARENTS);
    }
    if profile.family_stability == Some(false) {
        factors.push(FACTOR_UNSTABLE_FAMILY);
    }
    if matches!(profile.number_of_siblings, Some(n) if n > rules.socioeconomic.sibling_cap as i32)
    {
        factors.push(FACTOR_LARGE_FAMILY);
    }
    if matches!(profile.distance_to_school_km, Some(km) if km > rules.distance.threshold_km) {
        factors.push(FACTOR_LONG_DISTANCE);
    }

    factors
}
