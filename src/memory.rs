//! In-memory implementation of every storage trait.
//!
//! Deterministic and test-friendly. Per-key atomicity comes from `DashMap` entry
//! locks, so conditional writes on one (student, domain) never block another.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::models::{
    AttendanceRecord, DeliveryChannel, FlagStatus, Guardian, Message, MessageStatus,
    PerformanceRecord, RiskDomain, RiskFlag, StatusEvent, Student, SubDelivery,
};
use crate::rules::RiskRuleConfig;
use crate::store::{
    DeliveryUpdate, ExpectedFlag, FlagDraft, FlagStore, FlagWrite, MessageStore, ReadModel,
    RuleStore,
};

#[derive(Default)]
pub struct InMemoryStore {
    students: DashMap<Uuid, Student>,
    attendance: DashMap<Uuid, Vec<AttendanceRecord>>,
    performance: DashMap<Uuid, Vec<PerformanceRecord>>,
    guardians: DashMap<Uuid, Guardian>,
    rules: DashMap<Uuid, RiskRuleConfig>,
    /// Every flag ever written, keyed by flag id.
    flags: DashMap<Uuid, RiskFlag>,
    /// The OPEN flag id per (student, domain).
    open_flags: DashMap<(Uuid, RiskDomain), Uuid>,
    messages: DashMap<Uuid, Message>,
    deliveries: DashMap<(Uuid, DeliveryChannel), SubDelivery>,
    provider_ids: DashMap<String, (Uuid, DeliveryChannel)>,
    history: DashMap<Uuid, Vec<StatusEvent>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn add_student(&self, student: Student) {
        self.students.insert(student.id, student);
    }

    pub fn add_attendance(&self, record: AttendanceRecord) {
        self.attendance
            .entry(record.student_id)
            .or_default()
            .push(record);
    }

    /// Drop a student's attendance history, e.g. to replay a corrected register.
    pub fn clear_attendance(&self, student_id: Uuid) {
        self.attendance.remove(&student_id);
    }

    pub fn add_performance(&self, record: PerformanceRecord) {
        self.performance
            .entry(record.student_id)
            .or_default()
            .push(record);
    }

    pub fn set_guardian(&self, guardian: Guardian) {
        self.guardians.insert(guardian.student_id, guardian);
    }

    pub fn flag_count(&self) -> usize {
        self.flags.len()
    }

    pub fn open_flag_count(&self, student_id: Uuid, domain: RiskDomain) -> usize {
        self.flags
            .iter()
            .filter(|f| {
                f.student_id == student_id && f.domain == domain && f.status == FlagStatus::Open
            })
            .count()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    fn assemble_message(&self, mut message: Message) -> Message {
        for delivery in message.deliveries.iter_mut() {
            if let Some(current) = self.deliveries.get(&(message.id, delivery.channel)) {
                *delivery = current.clone();
            }
        }
        message
    }
}

#[async_trait]
impl ReadModel for InMemoryStore {
    async fn student(&self, student_id: Uuid) -> StoreResult<Option<Student>> {
        Ok(self.students.get(&student_id).map(|s| s.clone()))
    }

    async fn active_students(&self, school_id: Uuid) -> StoreResult<Vec<Student>> {
        let mut students: Vec<Student> = self
            .students
            .iter()
            .filter(|s| s.school_id == school_id && s.active)
            .map(|s| s.clone())
            .collect();
        students.sort_by(|a, b| a.full_name.cmp(&b.full_name));
        Ok(students)
    }

    async fn attendance_records(
        &self,
        student_id: Uuid,
        since: Option<NaiveDate>,
    ) -> StoreResult<Vec<AttendanceRecord>> {
        let records = self
            .attendance
            .get(&student_id)
            .map(|r| {
                r.iter()
                    .filter(|rec| since.map_or(true, |s| rec.date >= s))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(records)
    }

    async fn performance_records(&self, student_id: Uuid) -> StoreResult<Vec<PerformanceRecord>> {
        Ok(self
            .performance
            .get(&student_id)
            .map(|r| r.clone())
            .unwrap_or_default())
    }

    async fn primary_guardian(&self, student_id: Uuid) -> StoreResult<Option<Guardian>> {
        Ok(self.guardians.get(&student_id).map(|g| g.clone()))
    }
}

#[async_trait]
impl RuleStore for InMemoryStore {
    async fn get_rules(&self, school_id: Uuid) -> StoreResult<Option<RiskRuleConfig>> {
        Ok(self.rules.get(&school_id).map(|r| r.clone()))
    }

    async fn insert_rules_if_absent(&self, config: RiskRuleConfig) -> StoreResult<RiskRuleConfig> {
        let stored = self
            .rules
            .entry(config.school_id)
            .or_insert(config)
            .clone();
        Ok(stored)
    }

    async fn save_rules(&self, config: &RiskRuleConfig) -> StoreResult<()> {
        self.rules.insert(config.school_id, config.clone());
        Ok(())
    }
}

#[async_trait]
impl FlagStore for InMemoryStore {
    async fn find_open_flag(
        &self,
        student_id: Uuid,
        domain: RiskDomain,
    ) -> StoreResult<Option<RiskFlag>> {
        let Some(flag_id) = self.open_flags.get(&(student_id, domain)).map(|id| *id) else {
            return Ok(None);
        };
        Ok(self.flags.get(&flag_id).map(|f| f.clone()))
    }

    async fn write_open_flag(
        &self,
        draft: &FlagDraft,
        expected: Option<ExpectedFlag>,
        now: DateTime<Utc>,
    ) -> StoreResult<FlagWrite> {
        // The entry guard serializes writers of this (student, domain) only.
        match (self.open_flags.entry((draft.student_id, draft.domain)), expected) {
            (Entry::Vacant(slot), None) => {
                let flag = RiskFlag {
                    id: Uuid::new_v4(),
                    student_id: draft.student_id,
                    domain: draft.domain,
                    severity: draft.severity,
                    reasons: draft.reasons.clone(),
                    status: FlagStatus::Open,
                    detected_at: now,
                    resolved_at: None,
                    version: 1,
                };
                self.flags.insert(flag.id, flag.clone());
                slot.insert(flag.id);
                Ok(FlagWrite::Created(flag))
            }
            (Entry::Occupied(slot), Some(expected)) if *slot.get() == expected.id => {
                let Some(mut flag) = self.flags.get_mut(&expected.id) else {
                    return Ok(FlagWrite::Conflict);
                };
                if flag.version != expected.version || flag.status != FlagStatus::Open {
                    return Ok(FlagWrite::Conflict);
                }
                flag.severity = draft.severity;
                flag.reasons = draft.reasons.clone();
                flag.version += 1;
                Ok(FlagWrite::Updated(flag.clone()))
            }
            _ => Ok(FlagWrite::Conflict),
        }
    }

    async fn resolve_open_flag(
        &self,
        expected: ExpectedFlag,
        now: DateTime<Utc>,
    ) -> StoreResult<FlagWrite> {
        let Some(key) = self
            .flags
            .get(&expected.id)
            .map(|f| (f.student_id, f.domain))
        else {
            return Ok(FlagWrite::Conflict);
        };

        match self.open_flags.entry(key) {
            Entry::Occupied(slot) if *slot.get() == expected.id => {
                let Some(mut flag) = self.flags.get_mut(&expected.id) else {
                    return Ok(FlagWrite::Conflict);
                };
                if flag.version != expected.version || flag.status != FlagStatus::Open {
                    return Ok(FlagWrite::Conflict);
                }
                flag.status = FlagStatus::Resolved;
                flag.resolved_at = Some(now);
                flag.version += 1;
                let resolved = flag.clone();
                drop(flag);
                slot.remove();
                Ok(FlagWrite::Resolved(resolved))
            }
            _ => Ok(FlagWrite::Conflict),
        }
    }

    async fn list_flags(&self, student_id: Uuid) -> StoreResult<Vec<RiskFlag>> {
        let mut flags: Vec<RiskFlag> = self
            .flags
            .iter()
            .filter(|f| f.student_id == student_id)
            .map(|f| f.clone())
            .collect();
        flags.sort_by(|a, b| a.detected_at.cmp(&b.detected_at));
        Ok(flags)
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn insert_message(&self, message: &Message) -> StoreResult<()> {
        for delivery in &message.deliveries {
            self.deliveries
                .insert((message.id, delivery.channel), delivery.clone());
        }
        self.messages.insert(message.id, message.clone());
        Ok(())
    }

    async fn get_message(&self, message_id: Uuid) -> StoreResult<Option<Message>> {
        let message = self.messages.get(&message_id).map(|m| m.clone());
        Ok(message.map(|m| self.assemble_message(m)))
    }

    async fn update_delivery(
        &self,
        message_id: Uuid,
        channel: DeliveryChannel,
        expected: MessageStatus,
        update: DeliveryUpdate,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<SubDelivery>> {
        let Some(mut delivery) = self.deliveries.get_mut(&(message_id, channel)) else {
            return Ok(None);
        };
        if delivery.status != expected {
            return Ok(None);
        }

        if let Some(status) = update.status {
            delivery.status = status;
        }
        if let Some(attempts) = update.attempt_count {
            delivery.attempt_count = attempts;
        }
        if let Some(error) = update.last_error {
            delivery.last_error = Some(error);
        }
        if let Some(provider_id) = update.provider_message_id {
            self.provider_ids
                .insert(provider_id.clone(), (message_id, channel));
            delivery.provider_message_id = Some(provider_id);
        }
        delivery.updated_at = now;
        Ok(Some(delivery.clone()))
    }

    async fn find_delivery_by_provider_id(
        &self,
        provider_message_id: &str,
    ) -> StoreResult<Option<SubDelivery>> {
        let Some(key) = self.provider_ids.get(provider_message_id).map(|k| *k) else {
            return Ok(None);
        };
        Ok(self.deliveries.get(&key).map(|d| d.clone()))
    }

    async fn append_status_event(&self, event: &StatusEvent) -> StoreResult<()> {
        self.history
            .entry(event.message_id)
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn record_transition(
        &self,
        event: &StatusEvent,
        update: DeliveryUpdate,
    ) -> StoreResult<Option<SubDelivery>> {
        let updated = self
            .update_delivery(event.message_id, event.channel, event.from, update, event.at)
            .await?;
        if updated.is_some() {
            self.append_status_event(event).await?;
        }
        Ok(updated)
    }

    async fn status_history(&self, message_id: Uuid) -> StoreResult<Vec<StatusEvent>> {
        Ok(self
            .history
            .get(&message_id)
            .map(|h| h.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;

    fn draft(student_id: Uuid, severity: Severity) -> FlagDraft {
        FlagDraft {
            student_id,
            domain: RiskDomain::Attendance,
            severity,
            reasons: vec!["9 absences".to_string()],
        }
    }

    #[tokio::test]
    async fn second_create_for_same_domain_conflicts() {
        let store = InMemoryStore::new();
        let student_id = Uuid::new_v4();
        let now = Utc::now();

        let first = store
            .write_open_flag(&draft(student_id, Severity::Medium), None, now)
            .await
            .unwrap();
        assert!(matches!(first, FlagWrite::Created(_)));

        let second = store
            .write_open_flag(&draft(student_id, Severity::High), None, now)
            .await
            .unwrap();
        assert_eq!(second, FlagWrite::Conflict);
        assert_eq!(store.open_flag_count(student_id, RiskDomain::Attendance), 1);
    }

    #[tokio::test]
    async fn stale_version_conflicts() {
        let store = InMemoryStore::new();
        let student_id = Uuid::new_v4();
        let now = Utc::now();

        let FlagWrite::Created(flag) = store
            .write_open_flag(&draft(student_id, Severity::Medium), None, now)
            .await
            .unwrap()
        else {
            panic!("expected a new flag");
        };
        let expected = ExpectedFlag::from(&flag);

        let updated = store
            .write_open_flag(&draft(student_id, Severity::High), Some(expected), now)
            .await
            .unwrap();
        assert!(matches!(updated, FlagWrite::Updated(ref f) if f.version == 2));

        let stale = store
            .write_open_flag(&draft(student_id, Severity::Critical), Some(expected), now)
            .await
            .unwrap();
        assert_eq!(stale, FlagWrite::Conflict);

        let resolve_stale = store.resolve_open_flag(expected, now).await.unwrap();
        assert_eq!(resolve_stale, FlagWrite::Conflict);
    }

    fn sms_message(message_id: Uuid, now: DateTime<Utc>) -> Message {
        Message {
            id: message_id,
            recipient: crate::models::Recipient {
                name: "Jean".to_string(),
                phone: Some("+250788000000".to_string()),
                email: None,
            },
            channel: crate::models::Channel::Sms,
            template_id: None,
            language: crate::models::Language::English,
            subject: None,
            body: "hi".to_string(),
            language_fallback: false,
            created_at: now,
            deliveries: vec![SubDelivery {
                message_id,
                channel: DeliveryChannel::Sms,
                address: "+250788000000".to_string(),
                status: MessageStatus::Pending,
                attempt_count: 0,
                last_error: None,
                provider_message_id: None,
                updated_at: now,
            }],
        }
    }

    #[tokio::test]
    async fn delivery_update_checks_expected_status() {
        let store = InMemoryStore::new();
        let message_id = Uuid::new_v4();
        let now = Utc::now();
        store
            .insert_message(&sms_message(message_id, now))
            .await
            .unwrap();

        let sent = store
            .update_delivery(
                message_id,
                DeliveryChannel::Sms,
                MessageStatus::Pending,
                DeliveryUpdate {
                    status: Some(MessageStatus::Sent),
                    provider_message_id: Some("prov-1".to_string()),
                    ..DeliveryUpdate::default()
                },
                now,
            )
            .await
            .unwrap();
        assert!(sent.is_some());

        let again = store
            .update_delivery(
                message_id,
                DeliveryChannel::Sms,
                MessageStatus::Pending,
                DeliveryUpdate::default(),
                now,
            )
            .await
            .unwrap();
        assert!(again.is_none());

        let found = store.find_delivery_by_provider_id("prov-1").await.unwrap();
        assert_eq!(found.map(|d| d.status), Some(MessageStatus::Sent));
    }

    #[tokio::test]
    async fn stale_transition_writes_no_history() {
        let store = InMemoryStore::new();
        let message_id = Uuid::new_v4();
        let now = Utc::now();
        store
            .insert_message(&sms_message(message_id, now))
            .await
            .unwrap();

        let event = |from, to| StatusEvent {
            message_id,
            channel: DeliveryChannel::Sms,
            from,
            to,
            detail: None,
            at: now,
        };
        let failed = DeliveryUpdate {
            status: Some(MessageStatus::Failed),
            ..DeliveryUpdate::default()
        };

        let applied = store
            .record_transition(&event(MessageStatus::Pending, MessageStatus::Failed), failed.clone())
            .await
            .unwrap();
        assert!(applied.is_some());

        let stale = store
            .record_transition(&event(MessageStatus::Pending, MessageStatus::Failed), failed)
            .await
            .unwrap();
        assert!(stale.is_none());

        let history = store.status_history(message_id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].to, MessageStatus::Failed);
    }
}
