//! Detection runs: detect, reconcile flags, alert guardians on escalation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::dispatch::{Dispatcher, SendRequest};
use crate::error::DetectionError;
use crate::models::{Channel, Language, MessageContent, MessageStatus, RiskAssessment, Student};
use crate::reconcile::{DomainOutcome, FlagReconciler};
use crate::risk::RiskDetector;
use crate::rules::RiskRuleConfig;

pub const RISK_ALERT_TEMPLATE: &str = "risk_alert";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertOutcome {
    pub flag_domain: String,
    pub message_id: Option<Uuid>,
    pub status: Option<MessageStatus>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentReport {
    pub student_id: Uuid,
    pub assessments: Vec<RiskAssessment>,
    pub outcomes: Vec<DomainOutcome>,
    pub alerts: Vec<AlertOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepEntry {
    pub student_id: Uuid,
    pub report: Option<StudentReport>,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct EarlyWarning {
    detector: RiskDetector,
    reconciler: FlagReconciler,
    dispatcher: Option<Dispatcher>,
    concurrency: usize,
    default_language: Language,
}

impl EarlyWarning {
    pub fn new(detector: RiskDetector, reconciler: FlagReconciler, concurrency: usize) -> Self {
        Self {
            detector,
            reconciler,
            dispatcher: None,
            concurrency: concurrency.max(1),
            default_language: Language::English,
        }
    }

    /// Send `risk_alert` messages to guardians when a flag opens or escalates.
    pub fn with_alerts(mut self, dispatcher: Dispatcher) -> Self {
        self.default_language = dispatcher.templates().default_language();
        self.dispatcher = Some(dispatcher);
        self
    }

    pub async fn run_for_student(&self, student_id: Uuid) -> Result<StudentReport, DetectionError> {
        let student = self.detector.load_student(student_id).await?;
        let rules = self.detector.rules().get_or_create(student.school_id).await?;
        self.process(&student, &rules, Utc::now().date_naive())
            .await
    }

    /// Evaluate every active student of a school against one rules snapshot.
    pub async fn sweep_school(&self, school_id: Uuid) -> Result<Vec<SweepEntry>, DetectionError> {
        let rules = Arc::new(self.detector.rules().get_or_create(school_id).await?);
        let students = self.detector.read_model().active_students(school_id).await?;
        let today = Utc::now().date_naive();
        let limiter = Arc::new(Semaphore::new(self.concurrency));

        info!(
            school_id = %school_id,
            students = students.len(),
            concurrency = self.concurrency,
            "Starting detection sweep"
        );

        let mut handles = Vec::with_capacity(students.len());
        for student in students {
            let permit = limiter
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| DetectionError::Task(e.to_string()))?;
            let this = self.clone();
            let rules = rules.clone();
            let student_id = student.id;
            let handle = tokio::spawn(async move {
                let _permit = permit;
                this.process(&student, &rules, today).await
            });
            handles.push((student_id, handle));
        }

        let mut entries = Vec::with_capacity(handles.len());
        for (student_id, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(err) => Err(DetectionError::Task(err.to_string())),
            };
            let entry = match result {
                Ok(report) => SweepEntry {
                    student_id,
                    report: Some(report),
                    error: None,
                },
                Err(err) => {
                    error!(student_id = %student_id, error = %err, "Detection failed for student");
                    SweepEntry {
                        student_id,
                        report: None,
                        error: Some(err.to_string()),
                    }
                }
            };
            entries.push(entry);
        }

        let failed = entries.iter().filter(|e| e.error.is_some()).count();
        info!(
            school_id = %school_id,
            evaluated = entries.len(),
            failed,
            "Detection sweep finished"
        );
        Ok(entries)
    }

    async fn process(
        &self,
        student: &Student,
        rules: &RiskRuleConfig,
        today: NaiveDate,
    ) -> Result<StudentReport, DetectionError> {
        let assessments = self
            .detector
            .evaluate_with_rules(student, rules, today)
            .await?;
        let outcomes = self.reconciler.reconcile(student.id, &assessments).await?;
        let alerts = self.alert_guardian(student, &outcomes).await;

        Ok(StudentReport {
            student_id: student.id,
            assessments,
            outcomes,
            alerts,
        })
    }

    async fn alert_guardian(&self, student: &Student, outcomes: &[DomainOutcome]) -> Vec<AlertOutcome> {
        let Some(dispatcher) = &self.dispatcher else {
            return Vec::new();
        };
        let escalated: Vec<_> = outcomes
            .iter()
            .filter(|o| o.action.is_escalation())
            .filter_map(|o| o.action.flag())
            .collect();
        if escalated.is_empty() {
            return Vec::new();
        }

        let guardian = match self.detector.read_model().primary_guardian(student.id).await {
            Ok(Some(guardian)) => guardian,
            Ok(None) => {
                warn!(student_id = %student.id, "No primary guardian to alert");
                return escalated
                    .iter()
                    .map(|flag| failed_alert(flag.domain.as_str(), "no primary guardian"))
                    .collect();
            }
            Err(err) => {
                warn!(student_id = %student.id, error = %err, "Guardian lookup failed");
                return escalated
                    .iter()
                    .map(|flag| failed_alert(flag.domain.as_str(), &err.to_string()))
                    .collect();
            }
        };
        let language = guardian.preferred_language.unwrap_or(self.default_language);

        let mut alerts = Vec::with_capacity(escalated.len());
        for flag in escalated {
            let variables = HashMap::from([
                ("guardian_name".to_string(), guardian.full_name.clone()),
                ("student_name".to_string(), student.full_name.clone()),
                ("domain".to_string(), flag.domain.as_str().to_lowercase()),
                ("severity".to_string(), flag.severity.to_string()),
                ("reasons".to_string(), flag.reasons.join("; ")),
            ]);
            let request = SendRequest {
                recipient: guardian.recipient(),
                channel: Channel::Both,
                content: MessageContent::Template {
                    template_id: RISK_ALERT_TEMPLATE.to_string(),
                    variables,
                },
                language,
            };

            match dispatcher.send(&request).await {
                Ok(message) => {
                    info!(
                        student_id = %student.id,
                        domain = %flag.domain,
                        severity = %flag.severity,
                        message_id = %message.id,
                        status = %message.status(),
                        "Alerted guardian"
                    );
                    alerts.push(AlertOutcome {
                        flag_domain: flag.domain.as_str().to_string(),
                        message_id: Some(message.id),
                        status: Some(message.status()),
                        error: None,
                    });
                }
                Err(err) => {
                    warn!(
                        student_id = %student.id,
                        domain = %flag.domain,
                        error = %err,
                        "Guardian alert failed"
                    );
                    alerts.push(failed_alert(flag.domain.as_str(), &err.to_string()));
                }
            }
        }
        alerts
    }
}

fn failed_alert(domain: &str, reason: &str) -> AlertOutcome {
    AlertOutcome {
        flag_domain: domain.to_string(),
        message_id: None,
        status: None,
        error: Some(reason.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;
    use crate::error::StoreResult;
    use crate::memory::InMemoryStore;
    use crate::models::{
        AttendanceRecord, Guardian, PerformanceRecord, RiskDomain, Severity,
        SocioeconomicProfile,
    };
    use crate::provider::DryRunProvider;
    use crate::reconcile::FlagAction;
    use crate::rules::{RuleConfigService, RulePatch};
    use crate::store::ReadModel;
    use std::sync::atomic::{AtomicBool, Ordering};
    use crate::templates::TemplateEngine;
    use crate::tracker::DeliveryTracker;
    use async_trait::async_trait;

    fn student(school_id: Uuid, distance_km: f64) -> Student {
        Student {
            id: Uuid::new_v4(),
            school_id,
            full_name: "Aline Uwase".to_string(),
            active: true,
            socioeconomic: SocioeconomicProfile {
                distance_to_school_km: Some(distance_km),
                ..SocioeconomicProfile::default()
            },
        }
    }

    fn guardian(student_id: Uuid) -> Guardian {
        Guardian {
            student_id,
            full_name: "Jeanne".to_string(),
            phone: Some("+250788555000".to_string()),
            email: None,
            preferred_language: Some(Language::Kinyarwanda),
        }
    }

    fn engine(read_model: Arc<dyn ReadModel>, store: Arc<InMemoryStore>) -> EarlyWarning {
        let detector = RiskDetector::new(read_model.clone(), RuleConfigService::new(store.clone()));
        let dispatcher = Dispatcher::new(
            Arc::new(DryRunProvider),
            Arc::new(TemplateEngine::builtin(Language::English)),
            DeliveryTracker::new(store.clone()),
            read_model,
            &DispatchConfig::default(),
        );
        EarlyWarning::new(detector, FlagReconciler::new(store), 4).with_alerts(dispatcher)
    }

    #[tokio::test]
    async fn alerts_only_on_new_or_escalated_flags() {
        let store = InMemoryStore::shared();
        let mut pupil = student(Uuid::new_v4(), 4.0);
        store.add_student(pupil.clone());
        store.set_guardian(guardian(pupil.id));
        let warning = engine(store.clone(), store.clone());

        // Distance MEDIUM plus the long-distance socioeconomic factor.
        let first = warning.run_for_student(pupil.id).await.unwrap();
        assert_eq!(first.alerts.len(), 2);
        assert!(first.alerts.iter().all(|a| a.status == Some(MessageStatus::Sent)));
        assert_eq!(store.message_count(), 2);

        let repeat = warning.run_for_student(pupil.id).await.unwrap();
        assert!(repeat.alerts.is_empty());
        assert!(repeat
            .outcomes
            .iter()
            .all(|o| matches!(o.action, FlagAction::Unchanged(_))));

        pupil.socioeconomic.distance_to_school_km = Some(7.5);
        store.add_student(pupil.clone());
        let escalated = warning.run_for_student(pupil.id).await.unwrap();
        assert_eq!(escalated.alerts.len(), 1);
        assert_eq!(escalated.alerts[0].flag_domain, "DISTANCE");

        pupil.socioeconomic.distance_to_school_km = Some(4.5);
        store.add_student(pupil.clone());
        let eased = warning.run_for_student(pupil.id).await.unwrap();
        assert!(eased.alerts.is_empty());

        pupil.socioeconomic.distance_to_school_km = Some(1.0);
        store.add_student(pupil.clone());
        let resolved = warning.run_for_student(pupil.id).await.unwrap();
        assert!(resolved.alerts.is_empty());
        assert!(resolved
            .outcomes
            .iter()
            .all(|o| matches!(o.action, FlagAction::Resolved(_))));
        assert_eq!(store.message_count(), 3);
    }

    #[tokio::test]
    async fn missing_guardian_does_not_fail_detection() {
        let store = InMemoryStore::shared();
        let pupil = student(Uuid::new_v4(), 8.0);
        store.add_student(pupil.clone());
        let warning = engine(store.clone(), store.clone());

        let report = warning.run_for_student(pupil.id).await.unwrap();
        assert_eq!(
            store.open_flag_count(pupil.id, RiskDomain::Distance),
            1
        );
        assert!(report
            .alerts
            .iter()
            .all(|a| a.error.as_deref() == Some("no primary guardian")));
    }

    #[tokio::test]
    async fn unknown_student_is_reported() {
        let store = InMemoryStore::shared();
        let warning = engine(store.clone(), store.clone());
        let err = warning.run_for_student(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, DetectionError::StudentNotFound(_)));
    }

    /// Fails attendance reads for one student.
    struct FlakyReadModel {
        inner: Arc<InMemoryStore>,
        broken: Uuid,
    }

    #[async_trait]
    impl ReadModel for FlakyReadModel {
        async fn student(&self, student_id: Uuid) -> StoreResult<Option<Student>> {
            self.inner.student(student_id).await
        }

        async fn active_students(&self, school_id: Uuid) -> StoreResult<Vec<Student>> {
            self.inner.active_students(school_id).await
        }

        async fn attendance_records(
            &self,
            student_id: Uuid,
            since: Option<NaiveDate>,
        ) -> StoreResult<Vec<AttendanceRecord>> {
            if student_id == self.broken {
                return Err(crate::error::StoreError::Backend(
                    "connection reset".to_string(),
                ));
            }
            self.inner.attendance_records(student_id, since).await
        }

        async fn performance_records(&self, student_id: Uuid) -> StoreResult<Vec<PerformanceRecord>> {
            self.inner.performance_records(student_id).await
        }

        async fn primary_guardian(&self, student_id: Uuid) -> StoreResult<Option<Guardian>> {
            self.inner.primary_guardian(student_id).await
        }
    }

    #[tokio::test]
    async fn sweep_isolates_student_failures() {
        let store = InMemoryStore::shared();
        let school = Uuid::new_v4();
        let students: Vec<Student> = (0..12).map(|_| student(school, 7.0)).collect();
        for s in &students {
            store.add_student(s.clone());
            store.set_guardian(guardian(s.id));
        }
        let mut inactive = student(school, 9.0);
        inactive.active = false;
        store.add_student(inactive.clone());

        let broken = students[5].id;
        let read_model = Arc::new(FlakyReadModel {
            inner: store.clone(),
            broken,
        });
        let warning = engine(read_model, store.clone());

        let entries = warning.sweep_school(school).await.unwrap();
        assert_eq!(entries.len(), 12);
        let failed: Vec<_> = entries.iter().filter(|e| e.error.is_some()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].student_id, broken);

        for s in &students {
            let expected = usize::from(s.id != broken);
            assert_eq!(store.open_flag_count(s.id, RiskDomain::Distance), expected);
        }
        assert_eq!(store.open_flag_count(inactive.id, RiskDomain::Distance), 0);
    }

    /// Changes the school's distance rules on the first attendance read.
    struct RuleChangingReadModel {
        inner: Arc<InMemoryStore>,
        rules: RuleConfigService,
        school_id: Uuid,
        changed: AtomicBool,
    }

    #[async_trait]
    impl ReadModel for RuleChangingReadModel {
        async fn student(&self, student_id: Uuid) -> StoreResult<Option<Student>> {
            self.inner.student(student_id).await
        }

        async fn active_students(&self, school_id: Uuid) -> StoreResult<Vec<Student>> {
            self.inner.active_students(school_id).await
        }

        async fn attendance_records(
            &self,
            student_id: Uuid,
            since: Option<NaiveDate>,
        ) -> StoreResult<Vec<AttendanceRecord>> {
            if !self.changed.swap(true, Ordering::SeqCst) {
                let patch = RulePatch {
                    distance_threshold_km: Some(10.0),
                    distance_high_km: Some(12.0),
                    ..RulePatch::default()
                };
                self.rules
                    .update(self.school_id, &patch)
                    .await
                    .map_err(|e| crate::error::StoreError::Backend(e.to_string()))?;
            }
            self.inner.attendance_records(student_id, since).await
        }

        async fn performance_records(&self, student_id: Uuid) -> StoreResult<Vec<PerformanceRecord>> {
            self.inner.performance_records(student_id).await
        }

        async fn primary_guardian(&self, student_id: Uuid) -> StoreResult<Option<Guardian>> {
            self.inner.primary_guardian(student_id).await
        }
    }

    #[tokio::test]
    async fn sweep_keeps_rules_it_started_with() {
        let store = InMemoryStore::shared();
        let school = Uuid::new_v4();
        let students: Vec<Student> = (0..8).map(|_| student(school, 7.0)).collect();
        for s in &students {
            store.add_student(s.clone());
        }

        let read_model = Arc::new(RuleChangingReadModel {
            inner: store.clone(),
            rules: RuleConfigService::new(store.clone()),
            school_id: school,
            changed: AtomicBool::new(false),
        });
        let warning = engine(read_model.clone(), store.clone());

        let first = warning.sweep_school(school).await.unwrap();
        assert!(read_model.changed.load(Ordering::SeqCst));
        assert_eq!(first.len(), students.len());
        for entry in &first {
            let report = entry.report.as_ref().unwrap();
            let distance = report
                .assessments
                .iter()
                .find(|a| a.domain == RiskDomain::Distance)
                .unwrap();
            assert_eq!(distance.severity, Severity::High);
            assert_eq!(store.open_flag_count(entry.student_id, RiskDomain::Distance), 1);
        }

        let stored = RuleConfigService::new(store.clone())
            .get_or_create(school)
            .await
            .unwrap();
        assert_eq!(stored.distance.threshold_km, 10.0);

        let second = warning.sweep_school(school).await.unwrap();
        for entry in &second {
            let report = entry.report.as_ref().unwrap();
            assert!(report
                .assessments
                .iter()
                .all(|a| a.domain != RiskDomain::Distance));
            assert_eq!(store.open_flag_count(entry.student_id, RiskDomain::Distance), 0);
        }
    }
}
