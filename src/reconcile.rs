//! Merges per-domain assessments into persistent flag state.
//!
//! At most one OPEN flag may exist per (student, domain). Every write goes through
//! the store's conditional write; a lost race is retried once and then the
//! concurrent winner's state is accepted.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{RiskAssessment, RiskDomain, RiskFlag, Severity};
use crate::store::{ExpectedFlag, FlagDraft, FlagStore, FlagWrite};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum FlagAction {
    Created(RiskFlag),
    Updated {
        flag: RiskFlag,
        previous_severity: Severity,
    },
    Resolved(RiskFlag),
    Unchanged(RiskFlag),
    /// A concurrent sweep won the race; this is the state it left behind.
    AcceptedConcurrent(Option<RiskFlag>),
}

impl FlagAction {
    /// True for a new flag or a severity increase on an existing one.
    pub fn is_escalation(&self) -> bool {
        match self {
            FlagAction::Created(_) => true,
            FlagAction::Updated {
                flag,
                previous_severity,
            } => flag.severity > *previous_severity,
            _ => false,
        }
    }

    pub fn flag(&self) -> Option<&RiskFlag> {
        match self {
            FlagAction::Created(flag)
            | FlagAction::Updated { flag, .. }
            | FlagAction::Resolved(flag)
            | FlagAction::Unchanged(flag) => Some(flag),
            FlagAction::AcceptedConcurrent(flag) => flag.as_ref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainOutcome {
    pub domain: RiskDomain,
    pub action: FlagAction,
}

#[derive(Clone)]
pub struct FlagReconciler {
    store: Arc<dyn FlagStore>,
}

/// Bounded attempts at the read-modify-write before deferring to the winner.
const WRITE_ATTEMPTS: usize = 2;

impl FlagReconciler {
    pub fn new(store: Arc<dyn FlagStore>) -> Self {
        Self { store }
    }

    /// Reconcile every domain. Domains missing from `assessments` get their OPEN flag resolved.
    pub async fn reconcile(
        &self,
        student_id: Uuid,
        assessments: &[RiskAssessment],
    ) -> Result<Vec<DomainOutcome>, StoreError> {
        let by_domain: HashMap<RiskDomain, &RiskAssessment> =
            assessments.iter().map(|a| (a.domain, a)).collect();

        let mut outcomes = Vec::new();
        for domain in RiskDomain::ALL {
            if let Some(action) = self
                .reconcile_domain(student_id, domain, by_domain.get(&domain).copied())
                .await?
            {
                outcomes.push(DomainOutcome { domain, action });
            }
        }
        Ok(outcomes)
    }

    /// Returns `None` when there is neither a risk nor an OPEN flag for the domain.
    pub async fn reconcile_domain(
        &self,
        student_id: Uuid,
        domain: RiskDomain,
        assessment: Option<&RiskAssessment>,
    ) -> Result<Option<FlagAction>, StoreError> {
        for attempt in 1..=WRITE_ATTEMPTS {
            let current = self.store.find_open_flag(student_id, domain).await?;
            let previous_severity = current.as_ref().map(|f| f.severity);
            let now = Utc::now();

            let write = match (current, assessment) {
                (None, None) => return Ok(None),
                (None, Some(assessment)) => {
                    self.store
                        .write_open_flag(&draft(student_id, assessment), None, now)
                        .await?
                }
                (Some(flag), Some(assessment)) => {
                    if flag.severity == assessment.severity && flag.reasons == assessment.reasons {
                        return Ok(Some(FlagAction::Unchanged(flag)));
                    }
                    self.store
                        .write_open_flag(
                            &draft(student_id, assessment),
                            Some(ExpectedFlag::from(&flag)),
                            now,
                        )
                        .await?
                }
                (Some(flag), None) => {
                    self.store
                        .resolve_open_flag(ExpectedFlag::from(&flag), now)
                        .await?
                }
            };

            match write {
                FlagWrite::Created(flag) => {
                    info!(
                        student_id = %student_id,
                        domain = %domain,
                        severity = %flag.severity,
                        "Opened risk flag"
                    );
                    return Ok(Some(FlagAction::Created(flag)));
                }
                FlagWrite::Updated(flag) => {
                    let previous_severity = previous_severity.unwrap_or(flag.severity);
                    info!(
                        student_id = %student_id,
                        domain = %domain,
                        from = %previous_severity,
                        to = %flag.severity,
                        "Updated risk flag"
                    );
                    return Ok(Some(FlagAction::Updated {
                        flag,
                        previous_severity,
                    }));
                }
                FlagWrite::Resolved(flag) => {
                    info!(student_id = %student_id, domain = %domain, "Resolved risk flag");
                    return Ok(Some(FlagAction::Resolved(flag)));
                }
                FlagWrite::Conflict => {
                    warn!(
                        student_id = %student_id,
                        domain = %domain,
                        attempt,
                        "Concurrent flag write detected"
                    );
                }
            }
        }

        // Both writers derive from the same metrics, so the winner's state stands.
        let winner = self.store.find_open_flag(student_id, domain).await?;
        Ok(Some(FlagAction::AcceptedConcurrent(winner)))
    }
}

fn draft(student_id: Uuid, assessment: &RiskAssessment) -> FlagDraft {
    FlagDraft {
        student_id,
        domain: assessment.domain,
        severity: assessment.severity,
        reasons: assessment.reasons.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use crate::models::FlagStatus;
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn assessment(domain: RiskDomain, severity: Severity) -> RiskAssessment {
        RiskAssessment {
            domain,
            severity,
            reasons: vec![format!("{domain} at {severity}")],
        }
    }

    #[tokio::test]
    async fn repeated_runs_keep_one_open_flag() {
        let store = InMemoryStore::shared();
        let reconciler = FlagReconciler::new(store.clone());
        let student_id = Uuid::new_v4();
        let risks = vec![
            assessment(RiskDomain::Attendance, Severity::High),
            assessment(RiskDomain::Distance, Severity::Medium),
        ];

        let first = reconciler.reconcile(student_id, &risks).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(first
            .iter()
            .all(|o| matches!(o.action, FlagAction::Created(_))));

        let second = reconciler.reconcile(student_id, &risks).await.unwrap();
        assert!(second
            .iter()
            .all(|o| matches!(o.action, FlagAction::Unchanged(_))));

        assert_eq!(store.flag_count(), 2);
        assert_eq!(store.open_flag_count(student_id, RiskDomain::Attendance), 1);
    }

    #[tokio::test]
    async fn severity_change_updates_in_place() {
        let store = InMemoryStore::shared();
        let reconciler = FlagReconciler::new(store.clone());
        let student_id = Uuid::new_v4();

        let created = reconciler
            .reconcile(student_id, &[assessment(RiskDomain::Attendance, Severity::Medium)])
            .await
            .unwrap();
        let original = created[0].action.flag().unwrap().clone();

        let updated = reconciler
            .reconcile(student_id, &[assessment(RiskDomain::Attendance, Severity::Critical)])
            .await
            .unwrap();
        match &updated[0].action {
            FlagAction::Updated {
                flag,
                previous_severity,
            } => {
                assert_eq!(flag.id, original.id);
                assert_eq!(flag.detected_at, original.detected_at);
                assert_eq!(flag.severity, Severity::Critical);
                assert_eq!(*previous_severity, Severity::Medium);
            }
            other => panic!("unexpected action: {other:?}"),
        }
        assert!(updated[0].action.is_escalation());
        assert_eq!(store.flag_count(), 1);
    }

    #[tokio::test]
    async fn improvement_resolves_exactly_once() {
        let store = InMemoryStore::shared();
        let reconciler = FlagReconciler::new(store.clone());
        let student_id = Uuid::new_v4();

        reconciler
            .reconcile(student_id, &[assessment(RiskDomain::Performance, Severity::High)])
            .await
            .unwrap();

        let resolved = reconciler.reconcile(student_id, &[]).await.unwrap();
        assert_eq!(resolved.len(), 1);
        match &resolved[0].action {
            FlagAction::Resolved(flag) => {
                assert_eq!(flag.status, FlagStatus::Resolved);
                assert!(flag.resolved_at.is_some());
            }
            other => panic!("unexpected action: {other:?}"),
        }

        let quiet = reconciler.reconcile(student_id, &[]).await.unwrap();
        assert!(quiet.is_empty());
        assert_eq!(store.flag_count(), 1);

        let again = reconciler
            .reconcile(student_id, &[assessment(RiskDomain::Performance, Severity::Medium)])
            .await
            .unwrap();
        assert!(matches!(again[0].action, FlagAction::Created(_)));
        assert_eq!(store.flag_count(), 2);
    }

    #[tokio::test]
    async fn concurrent_sweeps_never_duplicate() {
        let store = InMemoryStore::shared();
        let reconciler = FlagReconciler::new(store.clone());
        let student_id = Uuid::new_v4();
        let risks = vec![assessment(RiskDomain::Attendance, Severity::High)];

        let mut handles = vec![];
        for _ in 0..8 {
            let reconciler = reconciler.clone();
            let risks = risks.clone();
            handles.push(tokio::spawn(async move {
                reconciler.reconcile(student_id, &risks).await.unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(store.open_flag_count(student_id, RiskDomain::Attendance), 1);
        assert_eq!(store.flag_count(), 1);
    }

    /// Reports a conflict on every write while another sweep's flag sits in the inner store.
    struct AlwaysLosing {
        inner: Arc<InMemoryStore>,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl FlagStore for AlwaysLosing {
        async fn find_open_flag(
            &self,
            student_id: Uuid,
            domain: RiskDomain,
        ) -> Result<Option<RiskFlag>, StoreError> {
            self.inner.find_open_flag(student_id, domain).await
        }

        async fn write_open_flag(
            &self,
            _draft: &FlagDraft,
            _expected: Option<ExpectedFlag>,
            _now: DateTime<Utc>,
        ) -> Result<FlagWrite, StoreError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(FlagWrite::Conflict)
        }

        async fn resolve_open_flag(
            &self,
            _expected: ExpectedFlag,
            _now: DateTime<Utc>,
        ) -> Result<FlagWrite, StoreError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(FlagWrite::Conflict)
        }

        async fn list_flags(&self, student_id: Uuid) -> Result<Vec<RiskFlag>, StoreError> {
            self.inner.list_flags(student_id).await
        }
    }

    #[tokio::test]
    async fn conflict_retries_once_then_accepts_winner() {
        let inner = InMemoryStore::shared();
        let student_id = Uuid::new_v4();
        FlagReconciler::new(inner.clone())
            .reconcile(student_id, &[assessment(RiskDomain::Distance, Severity::High)])
            .await
            .unwrap();

        let losing = Arc::new(AlwaysLosing {
            inner: inner.clone(),
            writes: AtomicUsize::new(0),
        });
        let reconciler = FlagReconciler::new(losing.clone());
        let action = reconciler
            .reconcile_domain(
                student_id,
                RiskDomain::Distance,
                Some(&assessment(RiskDomain::Distance, Severity::Medium)),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(losing.writes.load(Ordering::SeqCst), 2);
        match action {
            FlagAction::AcceptedConcurrent(Some(flag)) => {
                assert_eq!(flag.severity, Severity::High)
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }
}
