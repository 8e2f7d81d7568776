use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::error::DetectionError;
use crate::metrics::{self, window_start};
use crate::models::{
    AttendanceRecord, PerformanceRecord, RiskAssessment, RiskDomain, Severity, Student,
};
use crate::rules::{RiskRuleConfig, RuleConfigService, WindowMode};
use crate::store::ReadModel;

/// Fewer attendance records than this in the window is not enough signal.
pub const MIN_ATTENDANCE_SAMPLE: u32 = 5;

pub fn check_attendance_risk(
    records: &[AttendanceRecord],
    today: NaiveDate,
    rules: &RiskRuleConfig,
) -> Option<RiskAssessment> {
    let attendance = &rules.attendance;
    let summary = metrics::absence_window(records, today, attendance);
    if summary.sample < MIN_ATTENDANCE_SAMPLE {
        return None;
    }

    let absences = summary.absences;
    let (severity, threshold) = if absences >= attendance.critical_absences {
        (Severity::Critical, attendance.critical_absences)
    } else if absences >= attendance.high_absences {
        (Severity::High, attendance.high_absences)
    } else if absences >= attendance.medium_absences {
        (Severity::Medium, attendance.medium_absences)
    } else {
        return None;
    };

    let window = match attendance.window_mode {
        WindowMode::CalendarDays => format!("the last {} days", attendance.window_days),
        WindowMode::RecordedDays => format!("the last {} recorded days", attendance.window_days),
    };

    Some(RiskAssessment {
        domain: RiskDomain::Attendance,
        severity,
        reasons: vec![format!(
            "{absences} absences in {window} ({} threshold {threshold})",
            severity.as_str().to_lowercase()
        )],
    })
}

pub fn check_performance_risk(
    records: &[PerformanceRecord],
    rules: &RiskRuleConfig,
) -> Option<RiskAssessment> {
    let performance = &rules.performance;
    let summary = metrics::term_average(records)?;
    let average = summary.average_pct;

    let (severity, threshold) = if average <= performance.critical_pct {
        (Severity::Critical, performance.critical_pct)
    } else if average <= performance.high_pct {
        (Severity::High, performance.high_pct)
    } else if average <= performance.medium_pct {
        (Severity::Medium, performance.medium_pct)
    } else {
        return None;
    };

    let scope = match &summary.term {
        Some(term) => format!("term {term}"),
        None => "all recorded terms".to_string(),
    };

    Some(RiskAssessment {
        domain: RiskDomain::Performance,
        severity,
        reasons: vec![format!(
            "average score {average:.1}% over {} records in {scope} ({} threshold {threshold}%)",
            summary.sample,
            severity.as_str().to_lowercase()
        )],
    })
}

pub fn check_socioeconomic_risk(student: &Student, rules: &RiskRuleConfig) -> Option<RiskAssessment> {
    let factors = metrics::socioeconomic_factors(&student.socioeconomic, rules);
    let count = factors.len() as u32;
    let socio = &rules.socioeconomic;

    let severity = if count == 0 {
        return None;
    } else if count >= socio.high_factor_count {
        Severity::High
    } else if count >= socio.medium_factor_count {
        Severity::Medium
    } else {
        return None;
    };

    Some(RiskAssessment {
        domain: RiskDomain::Socioeconomic,
        severity,
        reasons: factors.into_iter().map(str::to_string).collect(),
    })
}

pub fn check_distance_risk(student: &Student, rules: &RiskRuleConfig) -> Option<RiskAssessment> {
    let km = student.socioeconomic.distance_to_school_km?;
    if !km.is_finite() {
        return None;
    }

    let (severity, band) = if km > rules.distance.high_km {
        (Severity::High, rules.distance.high_km)
    } else if km > rules.distance.threshold_km {
        (Severity::Medium, rules.distance.threshold_km)
    } else {
        return None;
    };

    Some(RiskAssessment {
        domain: RiskDomain::Distance,
        severity,
        reasons: vec![format!("distance to school {km:.1} km exceeds {band:.1} km")],
    })
}

/// Runs the four domain evaluators against one student's history.
#[derive(Clone)]
pub struct RiskDetector {
    read_model: Arc<dyn ReadModel>,
    rules: RuleConfigService,
}

impl RiskDetector {
    pub fn new(read_model: Arc<dyn ReadModel>, rules: RuleConfigService) -> Self {
        Self { read_model, rules }
    }

    pub fn read_model(&self) -> &Arc<dyn ReadModel> {
        &self.read_model
    }

    pub fn rules(&self) -> &RuleConfigService {
        &self.rules
    }

    pub async fn detect_risks_for_student(
        &self,
        student_id: Uuid,
    ) -> Result<Vec<RiskAssessment>, DetectionError> {
        let student = self.load_student(student_id).await?;
        let rules = self.rules.get_or_create(student.school_id).await?;
        self.evaluate_with_rules(&student, &rules, Utc::now().date_naive())
            .await
    }

    pub async fn load_student(&self, student_id: Uuid) -> Result<Student, DetectionError> {
        self.read_model
            .student(student_id)
            .await?
            .ok_or(DetectionError::StudentNotFound(student_id))
    }

    /// Evaluate every domain against one rules snapshot. Domains never suppress each other.
    pub async fn evaluate_with_rules(
        &self,
        student: &Student,
        rules: &RiskRuleConfig,
        today: NaiveDate,
    ) -> Result<Vec<RiskAssessment>, DetectionError> {
        let since = match rules.attendance.window_mode {
            WindowMode::CalendarDays => Some(window_start(today, rules.attendance.window_days)),
            WindowMode::RecordedDays => None,
        };
        let attendance = self
            .read_model
            .attendance_records(student.id, since)
            .await?;
        let performance = self.read_model.performance_records(student.id).await?;

        let assessments: Vec<RiskAssessment> = [
            check_attendance_risk(&attendance, today, rules),
            check_performance_risk(&performance, rules),
            check_socioeconomic_risk(student, rules),
            check_distance_risk(student, rules),
        ]
        .into_iter()
        .flatten()
        .collect();

        debug!(
            student_id = %student.id,
            detected = assessments.len(),
            "Evaluated risk domains"
        );
        Ok(assessments)
    }
}
