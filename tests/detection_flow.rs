use std::sync::Arc;

use chrono::{Duration, Utc};
use early_warning::dispatch::template_content;
use early_warning::models::{
    AttendanceRecord, AttendanceStatus, Channel, FlagStatus, Guardian, Language, MessageStatus,
    PerformanceRecord, RiskDomain, Severity, SocioeconomicProfile, Student,
};
use early_warning::store::FlagStore;
use early_warning::{
    BulkRequest, CancelHandle, DeliveryTracker, DispatchConfig, Dispatcher, DryRunProvider,
    EarlyWarning, FlagAction, FlagReconciler, InMemoryStore, RiskDetector, RuleConfigService,
    RulePatch, RulesError, TemplateEngine,
};
use uuid::Uuid;

struct Harness {
    store: Arc<InMemoryStore>,
    rules: RuleConfigService,
    engine: EarlyWarning,
    dispatcher: Dispatcher,
}

fn harness() -> Harness {
    let store = InMemoryStore::shared();
    let rules = RuleConfigService::new(store.clone());
    let dispatcher = Dispatcher::new(
        Arc::new(DryRunProvider),
        Arc::new(TemplateEngine::builtin(Language::English)),
        DeliveryTracker::new(store.clone()),
        store.clone(),
        &DispatchConfig::default(),
    );
    let engine = EarlyWarning::new(
        RiskDetector::new(store.clone(), rules.clone()),
        FlagReconciler::new(store.clone()),
        4,
    )
    .with_alerts(dispatcher.clone());

    Harness {
        store,
        rules,
        engine,
        dispatcher,
    }
}

fn enrol(store: &InMemoryStore, school_id: Uuid, name: &str, absences: i64, score: f64) -> Uuid {
    let student = Student {
        id: Uuid::new_v4(),
        school_id,
        full_name: name.to_string(),
        active: true,
        socioeconomic: SocioeconomicProfile::default(),
    };
    let today = Utc::now().date_naive();
    for days_ago in 0..20 {
        store.add_attendance(AttendanceRecord {
            student_id: student.id,
            date: today - Duration::days(days_ago),
            status: if days_ago < absences {
                AttendanceStatus::Absent
            } else {
                AttendanceStatus::Present
            },
        });
    }
    store.add_performance(PerformanceRecord {
        student_id: student.id,
        term: Some("T2".to_string()),
        score,
        max_score: 100.0,
        recorded_on: today - Duration::days(3),
    });
    store.set_guardian(Guardian {
        student_id: student.id,
        full_name: format!("Guardian of {name}"),
        phone: Some("+250788700000".to_string()),
        email: Some("guardian@example.rw".to_string()),
        preferred_language: Some(Language::French),
    });
    let id = student.id;
    store.add_student(student);
    id
}

#[tokio::test]
async fn school_sweep_flags_alerts_and_follows_rule_changes() {
    let h = harness();
    let school = Uuid::new_v4();
    let critical = enrol(&h.store, school, "Aline", 12, 80.0);
    let struggling = enrol(&h.store, school, "Eric", 1, 35.0);
    let fine = enrol(&h.store, school, "Grace", 2, 72.0);

    let entries = h.engine.sweep_school(school).await.unwrap();
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().all(|e| e.error.is_none()));

    let flag = h
        .store
        .find_open_flag(critical, RiskDomain::Attendance)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(flag.severity, Severity::Critical);
    let perf = h
        .store
        .find_open_flag(struggling, RiskDomain::Performance)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(perf.severity, Severity::High);
    assert!(h.store.list_flags(fine).await.unwrap().is_empty());

    // One alert per opened flag, each over SMS and email.
    assert_eq!(h.store.message_count(), 2);
    let report = entries.iter().find(|e| e.student_id == critical).unwrap();
    let alert = &report.report.as_ref().unwrap().alerts[0];
    assert_eq!(alert.status, Some(MessageStatus::Sent));
    let message = h
        .dispatcher
        .tracker()
        .message(alert.message_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.language, Language::French);
    assert_eq!(message.deliveries.len(), 2);

    // Raising the critical threshold downgrades the flag in place without a new alert.
    h.rules
        .update(
            school,
            &RulePatch {
                attendance_critical_absences: Some(15),
                ..RulePatch::default()
            },
        )
        .await
        .unwrap();
    let report = h.engine.run_for_student(critical).await.unwrap();
    let attendance = report
        .outcomes
        .iter()
        .find(|o| o.domain == RiskDomain::Attendance)
        .unwrap();
    match &attendance.action {
        FlagAction::Updated {
            flag,
            previous_severity,
        } => {
            assert_eq!(*previous_severity, Severity::Critical);
            assert_eq!(flag.severity, Severity::High);
        }
        other => panic!("expected an in-place update, got {other:?}"),
    }
    assert!(report.alerts.is_empty());
    assert_eq!(h.store.message_count(), 2);

    // A clean register resolves the flag exactly once.
    h.store.clear_attendance(critical);
    h.engine.run_for_student(critical).await.unwrap();
    h.engine.run_for_student(critical).await.unwrap();
    let history = h.store.list_flags(critical).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, FlagStatus::Resolved);
    assert!(history[0].resolved_at.is_some());
}

#[tokio::test]
async fn invalid_rule_update_keeps_stored_rules() {
    let h = harness();
    let school = Uuid::new_v4();
    let before = h.rules.get_or_create(school).await.unwrap();

    let err = h
        .rules
        .update(
            school,
            &RulePatch {
                attendance_window_days: Some(0),
                performance_medium_pct: Some(140.0),
                ..RulePatch::default()
            },
        )
        .await
        .unwrap_err();
    match err {
        RulesError::InvalidConfig { violations } => assert_eq!(violations.len(), 2),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.rules.get_or_create(school).await.unwrap(), before);
}

#[tokio::test]
async fn bulk_reminder_reaches_every_reachable_guardian() {
    let h = harness();
    let school = Uuid::new_v4();
    let mut students: Vec<Uuid> = (0..5)
        .map(|i| enrol(&h.store, school, &format!("Student {i}"), 0, 90.0))
        .collect();
    students.push(Uuid::new_v4());

    let results = h
        .dispatcher
        .send_bulk(
            &BulkRequest {
                student_ids: students.clone(),
                channel: Channel::Email,
                content: template_content("attendance_reminder", &[]),
                language: Language::French,
            },
            &CancelHandle::new(),
        )
        .await
        .unwrap();

    assert_eq!(results.len(), 6);
    assert_eq!(
        results
            .iter()
            .filter(|r| r.status == Some(MessageStatus::Sent))
            .count(),
        5
    );
    assert!(results[5].skipped);
    assert_eq!(results[5].student_id, students[5]);
}
