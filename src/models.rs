use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Parse failure for the string forms stored in the database and accepted on the CLI.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskDomain {
    Attendance,
    Performance,
    Socioeconomic,
    Distance,
}

impl RiskDomain {
    pub const ALL: [RiskDomain; 4] = [
        RiskDomain::Attendance,
        RiskDomain::Performance,
        RiskDomain::Socioeconomic,
        RiskDomain::Distance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskDomain::Attendance => "ATTENDANCE",
            RiskDomain::Performance => "PERFORMANCE",
            RiskDomain::Socioeconomic => "SOCIOECONOMIC",
            RiskDomain::Distance => "DISTANCE",
        }
    }
}

impl fmt::Display for RiskDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskDomain {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ATTENDANCE" => Ok(RiskDomain::Attendance),
            "PERFORMANCE" => Ok(RiskDomain::Performance),
            "SOCIOECONOMIC" => Ok(RiskDomain::Socioeconomic),
            "DISTANCE" => Ok(RiskDomain::Distance),
            _ => Err(ParseEnumError::new("risk domain", s)),
        }
    }
}

/// Risk level, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Severity::Low),
            "MEDIUM" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            "CRITICAL" => Ok(Severity::Critical),
            _ => Err(ParseEnumError::new("severity", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlagStatus {
    Open,
    InProgress,
    Resolved,
}

impl FlagStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagStatus::Open => "OPEN",
            FlagStatus::InProgress => "IN_PROGRESS",
            FlagStatus::Resolved => "RESOLVED",
        }
    }
}

impl FromStr for FlagStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "OPEN" => Ok(FlagStatus::Open),
            "IN_PROGRESS" => Ok(FlagStatus::InProgress),
            "RESOLVED" => Ok(FlagStatus::Resolved),
            _ => Err(ParseEnumError::new("flag status", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
    Excused,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "PRESENT",
            AttendanceStatus::Absent => "ABSENT",
            AttendanceStatus::Late => "LATE",
            AttendanceStatus::Excused => "EXCUSED",
        }
    }
}

impl FromStr for AttendanceStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PRESENT" => Ok(AttendanceStatus::Present),
            "ABSENT" => Ok(AttendanceStatus::Absent),
            "LATE" => Ok(AttendanceStatus::Late),
            "EXCUSED" => Ok(AttendanceStatus::Excused),
            _ => Err(ParseEnumError::new("attendance status", s)),
        }
    }
}

/// Socioeconomic block of the student record. `None` means the school never recorded it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SocioeconomicProfile {
    pub ubudehe_level: Option<i32>,
    pub has_parents: Option<bool>,
    pub family_stability: Option<bool>,
    pub number_of_siblings: Option<i32>,
    pub distance_to_school_km: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub id: Uuid,
    pub school_id: Uuid,
    pub full_name: String,
    pub active: bool,
    pub socioeconomic: SocioeconomicProfile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub student_id: Uuid,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub student_id: Uuid,
    pub term: Option<String>,
    pub score: f64,
    pub max_score: f64,
    pub recorded_on: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guardian {
    pub student_id: Uuid,
    pub full_name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub preferred_language: Option<Language>,
}

impl Guardian {
    pub fn recipient(&self) -> Recipient {
        Recipient {
            name: self.full_name.clone(),
            phone: self.phone.clone(),
            email: self.email.clone(),
        }
    }
}

/// Non-null result of one domain evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub domain: RiskDomain,
    pub severity: Severity,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFlag {
    pub id: Uuid,
    pub student_id: Uuid,
    pub domain: RiskDomain,
    pub severity: Severity,
    pub reasons: Vec<String>,
    pub status: FlagStatus,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Bumped on every write; conditional writes compare against it.
    pub version: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    #[serde(rename = "en")]
    English,
    #[serde(rename = "fr")]
    French,
    #[serde(rename = "rw")]
    Kinyarwanda,
}

impl Language {
    pub fn code(&self) -> &'static str {
        match self {
            Language::English => "en",
            Language::French => "fr",
            Language::Kinyarwanda => "rw",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Language {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "en" | "english" => Ok(Language::English),
            "fr" | "french" => Ok(Language::French),
            "rw" | "kinyarwanda" => Ok(Language::Kinyarwanda),
            _ => Err(ParseEnumError::new("language", s)),
        }
    }
}

/// Channel requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    Sms,
    Email,
    Both,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Sms => "SMS",
            Channel::Email => "EMAIL",
            Channel::Both => "BOTH",
        }
    }

    pub fn expand(&self) -> &'static [DeliveryChannel] {
        match self {
            Channel::Sms => &[DeliveryChannel::Sms],
            Channel::Email => &[DeliveryChannel::Email],
            Channel::Both => &[DeliveryChannel::Sms, DeliveryChannel::Email],
        }
    }
}

impl FromStr for Channel {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SMS" => Ok(Channel::Sms),
            "EMAIL" => Ok(Channel::Email),
            "BOTH" => Ok(Channel::Both),
            _ => Err(ParseEnumError::new("channel", s)),
        }
    }
}

/// Concrete channel of one sub-delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryChannel {
    Sms,
    Email,
}

impl DeliveryChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryChannel::Sms => "SMS",
            DeliveryChannel::Email => "EMAIL",
        }
    }
}

impl fmt::Display for DeliveryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryChannel {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SMS" => Ok(DeliveryChannel::Sms),
            "EMAIL" => Ok(DeliveryChannel::Email),
            _ => Err(ParseEnumError::new("delivery channel", s)),
        }
    }
}

/// Delivery lifecycle. Transitions only move forward; DELIVERED and FAILED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "PENDING",
            MessageStatus::Sent => "SENT",
            MessageStatus::Delivered => "DELIVERED",
            MessageStatus::Failed => "FAILED",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            MessageStatus::Pending => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered | MessageStatus::Failed => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }

    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        next.rank() > self.rank()
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(MessageStatus::Pending),
            "SENT" => Ok(MessageStatus::Sent),
            "DELIVERED" => Ok(MessageStatus::Delivered),
            "FAILED" => Ok(MessageStatus::Failed),
            _ => Err(ParseEnumError::new("message status", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
}

impl Recipient {
    pub fn address_for(&self, channel: DeliveryChannel) -> Option<&str> {
        let address = match channel {
            DeliveryChannel::Sms => self.phone.as_deref(),
            DeliveryChannel::Email => self.email.as_deref(),
        };
        address.map(str::trim).filter(|a| !a.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageContent {
    Template {
        template_id: String,
        variables: std::collections::HashMap<String, String>,
    },
    Raw {
        subject: Option<String>,
        body: String,
    },
}

/// One channel-specific half of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubDelivery {
    pub message_id: Uuid,
    pub channel: DeliveryChannel,
    pub address: String,
    pub status: MessageStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub provider_message_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SubDelivery {
    /// Furthest non-failed status this delivery reached. Only accepted sends carry a
    /// provider id, so a failure with one happened after SENT.
    fn reached(&self) -> MessageStatus {
        match self.status {
            MessageStatus::Failed if self.provider_message_id.is_some() => MessageStatus::Sent,
            MessageStatus::Failed => MessageStatus::Pending,
            status => status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub recipient: Recipient,
    pub channel: Channel,
    pub template_id: Option<String>,
    pub language: Language,
    pub subject: Option<String>,
    pub body: String,
    pub language_fallback: bool,
    pub created_at: DateTime<Utc>,
    pub deliveries: Vec<SubDelivery>,
}

impl Message {
    /// FAILED only when every sub-delivery failed. Otherwise the furthest status any
    /// sub-delivery reached, where a delivery that failed after the provider accepted
    /// it still counts as SENT. The result never moves backwards.
    pub fn status(&self) -> MessageStatus {
        if !self.deliveries.is_empty()
            && self
                .deliveries
                .iter()
                .all(|d| d.status == MessageStatus::Failed)
        {
            return MessageStatus::Failed;
        }

        self.deliveries
            .iter()
            .map(SubDelivery::reached)
            .max_by_key(|s| s.rank())
            .unwrap_or(MessageStatus::Pending)
    }

    pub fn attempt_count(&self) -> u32 {
        self.deliveries.iter().map(|d| d.attempt_count).sum()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.deliveries
            .iter()
            .filter(|d| d.last_error.is_some())
            .max_by_key(|d| d.updated_at)
            .and_then(|d| d.last_error.as_deref())
    }

    pub fn delivery(&self, channel: DeliveryChannel) -> Option<&SubDelivery> {
        self.deliveries.iter().find(|d| d.channel == channel)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub message_id: Uuid,
    pub channel: DeliveryChannel,
    pub from: MessageStatus,
    pub to: MessageStatus,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

/// Per-student outcome of a bulk send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkDispatchResult {
    pub student_id: Uuid,
    pub skipped: bool,
    pub reason: Option<String>,
    pub message_id: Option<Uuid>,
    pub status: Option<MessageStatus>,
}

impl BulkDispatchResult {
    pub fn skipped(student_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            student_id,
            skipped: true,
            reason: Some(reason.into()),
            message_id: None,
            status: None,
        }
    }
}
