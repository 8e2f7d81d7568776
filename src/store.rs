//! Storage seams.
//!
//! `ReadModel` is owned by the collaborators that manage students, attendance and
//! grades; this crate only reads it. The other traits cover the state this crate
//! owns: rule configurations, risk flags and messages.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::error::StoreResult;
use crate::models::{
    AttendanceRecord, DeliveryChannel, Guardian, Message, MessageStatus, PerformanceRecord,
    RiskDomain, RiskFlag, Severity, StatusEvent, Student, SubDelivery,
};
use crate::rules::RiskRuleConfig;

#[async_trait]
pub trait ReadModel: Send + Sync {
    async fn student(&self, student_id: Uuid) -> StoreResult<Option<Student>>;

    async fn active_students(&self, school_id: Uuid) -> StoreResult<Vec<Student>>;

    /// Attendance records dated on or after `since` (all records when `None`).
    async fn attendance_records(
        &self,
        student_id: Uuid,
        since: Option<NaiveDate>,
    ) -> StoreResult<Vec<AttendanceRecord>>;

    async fn performance_records(&self, student_id: Uuid) -> StoreResult<Vec<PerformanceRecord>>;

    async fn primary_guardian(&self, student_id: Uuid) -> StoreResult<Option<Guardian>>;
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn get_rules(&self, school_id: Uuid) -> StoreResult<Option<RiskRuleConfig>>;

    /// Insert unless a config already exists; returns whichever config is stored.
    async fn insert_rules_if_absent(&self, config: RiskRuleConfig) -> StoreResult<RiskRuleConfig>;

    async fn save_rules(&self, config: &RiskRuleConfig) -> StoreResult<()>;
}

/// Desired content of the OPEN flag for a (student, domain) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagDraft {
    pub student_id: Uuid,
    pub domain: RiskDomain,
    pub severity: Severity,
    pub reasons: Vec<String>,
}

/// Identity of the OPEN flag a conditional write expects to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedFlag {
    pub id: Uuid,
    pub version: i64,
}

impl From<&RiskFlag> for ExpectedFlag {
    fn from(flag: &RiskFlag) -> Self {
        Self {
            id: flag.id,
            version: flag.version,
        }
    }
}

/// Outcome of a conditional flag write.
#[derive(Debug, Clone, PartialEq)]
pub enum FlagWrite {
    Created(RiskFlag),
    Updated(RiskFlag),
    Resolved(RiskFlag),
    /// Another writer changed the OPEN flag for this (student, domain) first.
    Conflict,
}

#[async_trait]
pub trait FlagStore: Send + Sync {
    async fn find_open_flag(
        &self,
        student_id: Uuid,
        domain: RiskDomain,
    ) -> StoreResult<Option<RiskFlag>>;

    /// Single conditional write keyed on (student, domain, OPEN).
    ///
    /// With `expected == None` a flag is created only if no OPEN flag exists. With
    /// `Some`, the OPEN flag is updated in place only if it still has that id and
    /// version. Anything else yields `FlagWrite::Conflict`.
    async fn write_open_flag(
        &self,
        draft: &FlagDraft,
        expected: Option<ExpectedFlag>,
        now: DateTime<Utc>,
    ) -> StoreResult<FlagWrite>;

    /// Move the expected OPEN flag to RESOLVED, or report `Conflict`.
    async fn resolve_open_flag(
        &self,
        expected: ExpectedFlag,
        now: DateTime<Utc>,
    ) -> StoreResult<FlagWrite>;

    async fn list_flags(&self, student_id: Uuid) -> StoreResult<Vec<RiskFlag>>;
}

/// Field changes applied together with a status check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryUpdate {
    pub status: Option<MessageStatus>,
    pub attempt_count: Option<u32>,
    pub last_error: Option<String>,
    pub provider_message_id: Option<String>,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert_message(&self, message: &Message) -> StoreResult<()>;

    async fn get_message(&self, message_id: Uuid) -> StoreResult<Option<Message>>;

    /// Apply `update` only if the sub-delivery is still in `expected` status.
    /// Returns the updated row, or `None` when the status check failed.
    async fn update_delivery(
        &self,
        message_id: Uuid,
        channel: DeliveryChannel,
        expected: MessageStatus,
        update: DeliveryUpdate,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<SubDelivery>>;

    async fn find_delivery_by_provider_id(
        &self,
        provider_message_id: &str,
    ) -> StoreResult<Option<SubDelivery>>;

    async fn append_status_event(&self, event: &StatusEvent) -> StoreResult<()>;

    /// Move a sub-delivery from `event.from` to `event.to` and append `event` to its
    /// history as one unit. Returns `None`, writing nothing, when the sub-delivery is
    /// no longer in `event.from`.
    async fn record_transition(
        &self,
        event: &StatusEvent,
        update: DeliveryUpdate,
    ) -> StoreResult<Option<SubDelivery>>;

    async fn status_history(&self, message_id: Uuid) -> StoreResult<Vec<StatusEvent>>;
}
