//! Per-school risk thresholds.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{FieldViolation, RulesError};
use crate::models::ParseEnumError;
use crate::store::RuleStore;

/// Which days make up the attendance window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WindowMode {
    /// The last `window_days` calendar days ending today. Unmarked days count as present.
    #[default]
    CalendarDays,
    /// The last `window_days` distinct dates on which the student has a record.
    RecordedDays,
}

impl WindowMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowMode::CalendarDays => "CALENDAR_DAYS",
            WindowMode::RecordedDays => "RECORDED_DAYS",
        }
    }
}

impl fmt::Display for WindowMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WindowMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "CALENDAR_DAYS" => Ok(WindowMode::CalendarDays),
            "RECORDED_DAYS" => Ok(WindowMode::RecordedDays),
            _ => Err(ParseEnumError {
                kind: "window mode",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRules {
    pub medium_absences: u32,
    pub high_absences: u32,
    pub critical_absences: u32,
    pub window_days: u32,
    pub window_mode: WindowMode,
}

/// Average-score percentages; a student at or below a value is at that level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRules {
    pub medium_pct: f64,
    pub high_pct: f64,
    pub critical_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocioeconomicRules {
    pub medium_factor_count: u32,
    pub high_factor_count: u32,
    pub sibling_cap: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistanceRules {
    pub threshold_km: f64,
    pub high_km: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskRuleConfig {
    pub school_id: Uuid,
    pub attendance: AttendanceRules,
    pub performance: PerformanceRules,
    pub socioeconomic: SocioeconomicRules,
    pub distance: DistanceRules,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RiskRuleConfig {
    pub fn defaults_for(school_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            school_id,
            attendance: AttendanceRules {
                medium_absences: 8,
                high_absences: 10,
                critical_absences: 12,
                window_days: 20,
                window_mode: WindowMode::CalendarDays,
            },
            performance: PerformanceRules {
                medium_pct: 49.0,
                high_pct: 39.0,
                critical_pct: 30.0,
            },
            socioeconomic: SocioeconomicRules {
                medium_factor_count: 1,
                high_factor_count: 2,
                sibling_cap: 5,
            },
            distance: DistanceRules {
                threshold_km: 3.0,
                high_km: 6.0,
            },
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update submitted by a school admin. Absent fields keep their value.
///
/// Integer fields are signed so that negative input reaches validation instead of
/// failing to parse.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RulePatch {
    pub attendance_medium_absences: Option<i64>,
    pub attendance_high_absences: Option<i64>,
    pub attendance_critical_absences: Option<i64>,
    pub attendance_window_days: Option<i64>,
    pub attendance_window_mode: Option<WindowMode>,
    pub performance_medium_pct: Option<f64>,
    pub performance_high_pct: Option<f64>,
    pub performance_critical_pct: Option<f64>,
    pub socioeconomic_medium_factor_count: Option<i64>,
    pub socioeconomic_high_factor_count: Option<i64>,
    pub socioeconomic_sibling_cap: Option<i64>,
    pub distance_threshold_km: Option<f64>,
    pub distance_high_km: Option<f64>,
}

impl RulePatch {
    pub fn is_empty(&self) -> bool {
        *self == RulePatch::default()
    }

    /// Check every present field and return all violations at once.
    pub fn validate(&self) -> Result<(), RulesError> {
        let mut violations = Vec::new();

        let counts = [
            ("attendance.medium_absences", self.attendance_medium_absences),
            ("attendance.high_absences", self.attendance_high_absences),
            ("attendance.critical_absences", self.attendance_critical_absences),
            (
                "socioeconomic.medium_factor_count",
                self.socioeconomic_medium_factor_count,
            ),
            (
                "socioeconomic.high_factor_count",
                self.socioeconomic_high_factor_count,
            ),
            ("socioeconomic.sibling_cap", self.socioeconomic_sibling_cap),
        ];
        for (field, value) in counts {
            if let Some(v) = value {
                if v < 0 || v > i64::from(u32::MAX) {
                    violations.push(FieldViolation {
                        field,
                        message: format!("must be a non-negative integer, got {v}"),
                    });
                }
            }
        }

        if let Some(days) = self.attendance_window_days {
            if days < 1 || days > i64::from(u32::MAX) {
                violations.push(FieldViolation {
                    field: "attendance.window_days",
                    message: format!("must be a positive integer, got {days}"),
                });
            }
        }

        let percentages = [
            ("performance.medium_pct", self.performance_medium_pct),
            ("performance.high_pct", self.performance_high_pct),
            ("performance.critical_pct", self.performance_critical_pct),
        ];
        for (field, value) in percentages {
            if let Some(v) = value {
                if !v.is_finite() || !(0.0..=100.0).contains(&v) {
                    violations.push(FieldViolation {
                        field,
                        message: format!("must be within [0, 100], got {v}"),
                    });
                }
            }
        }

        let distances = [
            ("distance.threshold_km", self.distance_threshold_km),
            ("distance.high_km", self.distance_high_km),
        ];
        for (field, value) in distances {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    violations.push(FieldViolation {
                        field,
                        message: format!("must be a non-negative number, got {v}"),
                    });
                }
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(RulesError::InvalidConfig { violations })
        }
    }

    /// Merge into `config`. Call only after `validate` succeeded.
    fn apply(&self, config: &mut RiskRuleConfig) {
        let count = |v: i64| v as u32;

        if let Some(v) = self.attendance_medium_absences {
            config.attendance.medium_absences = count(v);
        }
        if let Some(v) = self.attendance_high_absences {
            config.attendance.high_absences = count(v);
        }
        if let Some(v) = self.attendance_critical_absences {
            config.attendance.critical_absences = count(v);
        }
        if let Some(v) = self.attendance_window_days {
            config.attendance.window_days = count(v);
        }
        if let Some(mode) = self.attendance_window_mode {
            config.attendance.window_mode = mode;
        }
        if let Some(v) = self.performance_medium_pct {
            config.performance.medium_pct = v;
        }
        if let Some(v) = self.performance_high_pct {
            config.performance.high_pct = v;
        }
        if let Some(v) = self.performance_critical_pct {
            config.performance.critical_pct = v;
        }
        if let Some(v) = self.socioeconomic_medium_factor_count {
            config.socioeconomic.medium_factor_count = count(v);
        }
        if let Some(v) = self.socioeconomic_high_factor_count {
            config.socioeconomic.high_factor_count = count(v);
        }
        if let Some(v) = self.socioeconomic_sibling_cap {
            config.socioeconomic.sibling_cap = count(v);
        }
        if let Some(v) = self.distance_threshold_km {
            config.distance.threshold_km = v;
        }
        if let Some(v) = self.distance_high_km {
            config.distance.high_km = v;
        }
    }
}

/// Serves rule configurations, creating the defaults on first access.
#[derive(Clone)]
pub struct RuleConfigService {
    store: Arc<dyn RuleStore>,
}

impl RuleConfigService {
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        Self { store }
    }

    pub async fn get_or_create(&self, school_id: Uuid) -> Result<RiskRuleConfig, RulesError> {
        if let Some(config) = self.store.get_rules(school_id).await? {
            return Ok(config);
        }

        let config = self
            .store
            .insert_rules_if_absent(RiskRuleConfig::defaults_for(school_id))
            .await?;
        info!(school_id = %school_id, "Created default risk rules");
        Ok(config)
    }

    /// Validate and apply a partial update. The stored config is untouched on error.
    pub async fn update(
        &self,
        school_id: Uuid,
        patch: &RulePatch,
    ) -> Result<RiskRuleConfig, RulesError> {
        patch.validate()?;

        let mut config = self.get_or_create(school_id).await?;
        if patch.is_empty() {
            return Ok(config);
        }

        patch.apply(&mut config);
        config.updated_at = Utc::now();
        self.store.save_rules(&config).await?;
        info!(school_id = %school_id, updated_at = %config.updated_at, "Updated risk rules");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;

    fn service() -> (RuleConfigService, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        (RuleConfigService::new(store.clone()), store)
    }

    #[tokio::test]
    async fn creates_documented_defaults_once() {
        let (service, _) = service();
        let school_id = Uuid::new_v4();

        let first = service.get_or_create(school_id).await.unwrap();
        assert_eq!(first.attendance.medium_absences, 8);
        assert_eq!(first.attendance.high_absences, 10);
        assert_eq!(first.attendance.critical_absences, 12);
        assert_eq!(first.attendance.window_days, 20);
        assert_eq!(first.attendance.window_mode, WindowMode::CalendarDays);
        assert_eq!(first.performance.medium_pct, 49.0);
        assert_eq!(first.performance.high_pct, 39.0);
        assert_eq!(first.performance.critical_pct, 30.0);
        assert_eq!(first.socioeconomic.medium_factor_count, 1);
        assert_eq!(first.socioeconomic.high_factor_count, 2);
        assert_eq!(first.distance.threshold_km, 3.0);
        assert_eq!(first.distance.high_km, 6.0);

        let second = service.get_or_create(school_id).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn update_applies_only_present_fields() {
        let (service, _) = service();
        let school_id = Uuid::new_v4();
        let before = service.get_or_create(school_id).await.unwrap();

        let patch = RulePatch {
            attendance_window_days: Some(30),
            performance_medium_pct: Some(55.0),
            attendance_window_mode: Some(WindowMode::RecordedDays),
            ..RulePatch::default()
        };
        let after = service.update(school_id, &patch).await.unwrap();

        assert_eq!(after.attendance.window_days, 30);
        assert_eq!(after.attendance.window_mode, WindowMode::RecordedDays);
        assert_eq!(after.performance.medium_pct, 55.0);
        assert_eq!(after.attendance.medium_absences, 8);
        assert!(after.updated_at >= before.updated_at);
        assert_eq!(after.created_at, before.created_at);
    }

    #[tokio::test]
    async fn invalid_update_lists_fields_and_keeps_config() {
        let (service, _) = service();
        let school_id = Uuid::new_v4();
        let before = service.get_or_create(school_id).await.unwrap();

        let patch = RulePatch {
            attendance_medium_absences: Some(-1),
            performance_high_pct: Some(140.0),
            distance_threshold_km: Some(2.0),
            ..RulePatch::default()
        };
        let err = service.update(school_id, &patch).await.unwrap_err();
        match err {
            RulesError::InvalidConfig { violations } => {
                let fields: Vec<_> = violations.iter().map(|v| v.field).collect();
                assert_eq!(
                    fields,
                    vec!["attendance.medium_absences", "performance.high_pct"]
                );
            }
            other => panic!("unexpected error: {other}"),
        }

        let stored = service.get_or_create(school_id).await.unwrap();
        assert_eq!(stored, before);
    }

    #[test]
    fn zero_window_is_rejected() {
        let patch = RulePatch {
            attendance_window_days: Some(0),
            ..RulePatch::default()
        };
        assert!(matches!(
            patch.validate(),
            Err(RulesError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn window_mode_parses_cli_spelling() {
        assert_eq!(
            "recorded-days".parse::<WindowMode>(),
            Ok(WindowMode::RecordedDays)
        );
    }
}
