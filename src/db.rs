use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::models::{
    AttendanceRecord, AttendanceStatus, DeliveryChannel, Guardian, Language, Message,
    MessageStatus, PerformanceRecord, Recipient, RiskDomain, RiskFlag, SocioeconomicProfile,
    StatusEvent, Student, SubDelivery,
};
use crate::rules::{
    AttendanceRules, DistanceRules, PerformanceRules, RiskRuleConfig, SocioeconomicRules,
};
use crate::store::{
    DeliveryUpdate, ExpectedFlag, FlagDraft, FlagStore, FlagWrite, MessageStore, ReadModel,
    RuleStore,
};

const STUDENT_COLUMNS: &str = "id, school_id, full_name, active, ubudehe_level, has_parents, \
     family_stability, number_of_siblings, distance_to_school_km";
const FLAG_COLUMNS: &str =
    "id, student_id, domain, severity, reasons, status, detected_at, resolved_at, version";
const DELIVERY_COLUMNS: &str = "message_id, channel, address, status, attempt_count, last_error, \
     provider_message_id, updated_at";

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Postgres-backed implementation of every storage trait.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn deliveries(&self, message_id: Uuid) -> StoreResult<Vec<SubDelivery>> {
        let rows = sqlx::query(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM early_warning.sub_deliveries \
             WHERE message_id = $1 ORDER BY channel DESC"
        ))
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(delivery_from_row).collect()
    }
}

fn student_from_row(row: &PgRow) -> StoreResult<Student> {
    Ok(Student {
        id: row.try_get("id")?,
        school_id: row.try_get("school_id")?,
        full_name: row.try_get("full_name")?,
        active: row.try_get("active")?,
        socioeconomic: SocioeconomicProfile {
            ubudehe_level: row.try_get("ubudehe_level")?,
            has_parents: row.try_get("has_parents")?,
            family_stability: row.try_get("family_stability")?,
            number_of_siblings: row.try_get("number_of_siblings")?,
            distance_to_school_km: row.try_get("distance_to_school_km")?,
        },
    })
}

fn flag_from_row(row: &PgRow) -> StoreResult<RiskFlag> {
    Ok(RiskFlag {
        id: row.try_get("id")?,
        student_id: row.try_get("student_id")?,
        domain: row.try_get::<String, _>("domain")?.parse()?,
        severity: row.try_get::<String, _>("severity")?.parse()?,
        reasons: row.try_get("reasons")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        detected_at: row.try_get("detected_at")?,
        resolved_at: row.try_get("resolved_at")?,
        version: row.try_get("version")?,
    })
}

fn delivery_from_row(row: &PgRow) -> StoreResult<SubDelivery> {
    Ok(SubDelivery {
        message_id: row.try_get("message_id")?,
        channel: row.try_get::<String, _>("channel")?.parse()?,
        address: row.try_get("address")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        attempt_count: row.try_get::<i32, _>("attempt_count")?.max(0) as u32,
        last_error: row.try_get("last_error")?,
        provider_message_id: row.try_get("provider_message_id")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn event_from_row(row: &PgRow) -> StoreResult<StatusEvent> {
    Ok(StatusEvent {
        message_id: row.try_get("message_id")?,
        channel: row.try_get::<String, _>("channel")?.parse()?,
        from: row.try_get::<String, _>("from_status")?.parse()?,
        to: row.try_get::<String, _>("to_status")?.parse()?,
        detail: row.try_get("detail")?,
        at: row.try_get("at")?,
    })
}

fn count(row: &PgRow, column: &str) -> StoreResult<u32> {
    let value: i32 = row.try_get(column)?;
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} is negative: {value}")))
}

fn rules_from_row(row: &PgRow) -> StoreResult<RiskRuleConfig> {
    Ok(RiskRuleConfig {
        school_id: row.try_get("school_id")?,
        attendance: AttendanceRules {
            medium_absences: count(row, "medium_absences")?,
            high_absences: count(row, "high_absences")?,
            critical_absences: count(row, "critical_absences")?,
            window_days: count(row, "window_days")?,
            window_mode: row.try_get::<String, _>("window_mode")?.parse()?,
        },
        performance: PerformanceRules {
            medium_pct: row.try_get("medium_pct")?,
            high_pct: row.try_get("high_pct")?,
            critical_pct: row.try_get("critical_pct")?,
        },
        socioeconomic: SocioeconomicRules {
            medium_factor_count: count(row, "medium_factor_count")?,
            high_factor_count: count(row, "high_factor_count")?,
            sibling_cap: count(row, "sibling_cap")?,
        },
        distance: DistanceRules {
            threshold_km: row.try_get("threshold_km")?,
            high_km: row.try_get("high_km")?,
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl ReadModel for PgStore {
    async fn student(&self, student_id: Uuid) -> StoreResult<Option<Student>> {
        let row = sqlx::query(&format!(
            "SELECT {STUDENT_COLUMNS} FROM early_warning.students WHERE id = $1"
        ))
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(student_from_row).transpose()
    }

    async fn active_students(&self, school_id: Uuid) -> StoreResult<Vec<Student>> {
        let rows = sqlx::query(&format!(
            "SELECT {STUDENT_COLUMNS} FROM early_warning.students \
             WHERE school_id = $1 AND active ORDER BY full_name"
        ))
        .bind(school_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(student_from_row).collect()
    }

    async fn attendance_records(
        &self,
        student_id: Uuid,
        since: Option<NaiveDate>,
    ) -> StoreResult<Vec<AttendanceRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT student_id, date, status
            FROM early_warning.attendance_records
            WHERE student_id = $1 AND ($2::date IS NULL OR date >= $2)
            ORDER BY date
            "#,
        )
        .bind(student_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> StoreResult<AttendanceRecord> {
                Ok(AttendanceRecord {
                    student_id: row.try_get("student_id")?,
                    date: row.try_get("date")?,
                    status: row.try_get::<String, _>("status")?.parse()?,
                })
            })
            .collect()
    }

    async fn performance_records(&self, student_id: Uuid) -> StoreResult<Vec<PerformanceRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT student_id, term, score, max_score, recorded_on
            FROM early_warning.performance_records
            WHERE student_id = $1
            ORDER BY recorded_on
            "#,
        )
        .bind(student_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> StoreResult<PerformanceRecord> {
                Ok(PerformanceRecord {
                    student_id: row.try_get("student_id")?,
                    term: row.try_get("term")?,
                    score: row.try_get("score")?,
                    max_score: row.try_get("max_score")?,
                    recorded_on: row.try_get("recorded_on")?,
                })
            })
            .collect()
    }

    async fn primary_guardian(&self, student_id: Uuid) -> StoreResult<Option<Guardian>> {
        let row = sqlx::query(
            r#"
            SELECT student_id, full_name, phone, email, preferred_language
            FROM early_warning.guardians
            WHERE student_id = $1 AND is_primary
            "#,
        )
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let preferred_language = row
            .try_get::<Option<String>, _>("preferred_language")?
            .map(|code| code.parse::<Language>())
            .transpose()?;
        Ok(Some(Guardian {
            student_id: row.try_get("student_id")?,
            full_name: row.try_get("full_name")?,
            phone: row.try_get("phone")?,
            email: row.try_get("email")?,
            preferred_language,
        }))
    }
}

#[async_trait]
impl RuleStore for PgStore {
    async fn get_rules(&self, school_id: Uuid) -> StoreResult<Option<RiskRuleConfig>> {
        let row = sqlx::query("SELECT * FROM early_warning.risk_rule_configs WHERE school_id = $1")
            .bind(school_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(rules_from_row).transpose()
    }

    async fn insert_rules_if_absent(&self, config: RiskRuleConfig) -> StoreResult<RiskRuleConfig> {
        sqlx::query(
            r#"
            INSERT INTO early_warning.risk_rule_configs
            (school_id, medium_absences, high_absences, critical_absences, window_days,
             window_mode, medium_pct, high_pct, critical_pct, medium_factor_count,
             high_factor_count, sibling_cap, threshold_km, high_km, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (school_id) DO NOTHING
            "#,
        )
        .bind(config.school_id)
        .bind(config.attendance.medium_absences as i32)
        .bind(config.attendance.high_absences as i32)
        .bind(config.attendance.critical_absences as i32)
        .bind(config.attendance.window_days as i32)
        .bind(config.attendance.window_mode.as_str())
        .bind(config.performance.medium_pct)
        .bind(config.performance.high_pct)
        .bind(config.performance.critical_pct)
        .bind(config.socioeconomic.medium_factor_count as i32)
        .bind(config.socioeconomic.high_factor_count as i32)
        .bind(config.socioeconomic.sibling_cap as i32)
        .bind(config.distance.threshold_km)
        .bind(config.distance.high_km)
        .bind(config.created_at)
        .bind(config.updated_at)
        .execute(&self.pool)
        .await?;

        self.get_rules(config.school_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("rules for school {}", config.school_id)))
    }

    async fn save_rules(&self, config: &RiskRuleConfig) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE early_warning.risk_rule_configs
            SET medium_absences = $2, high_absences = $3, critical_absences = $4,
                window_days = $5, window_mode = $6, medium_pct = $7, high_pct = $8,
                critical_pct = $9, medium_factor_count = $10, high_factor_count = $11,
                sibling_cap = $12, threshold_km = $13, high_km = $14, updated_at = $15
            WHERE school_id = $1
            "#,
        )
        .bind(config.school_id)
        .bind(config.attendance.medium_absences as i32)
        .bind(config.attendance.high_absences as i32)
        .bind(config.attendance.critical_absences as i32)
        .bind(config.attendance.window_days as i32)
        .bind(config.attendance.window_mode.as_str())
        .bind(config.performance.medium_pct)
        .bind(config.performance.high_pct)
        .bind(config.performance.critical_pct)
        .bind(config.socioeconomic.medium_factor_count as i32)
        .bind(config.socioeconomic.high_factor_count as i32)
        .bind(config.socioeconomic.sibling_cap as i32)
        .bind(config.distance.threshold_km)
        .bind(config.distance.high_km)
        .bind(config.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "rules for school {}",
                config.school_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl FlagStore for PgStore {
    async fn find_open_flag(
        &self,
        student_id: Uuid,
        domain: RiskDomain,
    ) -> StoreResult<Option<RiskFlag>> {
        let row = sqlx::query(&format!(
            "SELECT {FLAG_COLUMNS} FROM early_warning.risk_flags \
             WHERE student_id = $1 AND domain = $2 AND status = 'OPEN'"
        ))
        .bind(student_id)
        .bind(domain.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(flag_from_row).transpose()
    }

    async fn write_open_flag(
        &self,
        draft: &FlagDraft,
        expected: Option<ExpectedFlag>,
        now: DateTime<Utc>,
    ) -> StoreResult<FlagWrite> {
        // The partial unique index on (student_id, domain) WHERE status = 'OPEN'
        // turns a racing insert into an empty RETURNING.
        let row = match expected {
            None => {
                sqlx::query(&format!(
                    "INSERT INTO early_warning.risk_flags \
                     (id, student_id, domain, severity, reasons, status, detected_at, version) \
                     VALUES ($1, $2, $3, $4, $5, 'OPEN', $6, 1) \
                     ON CONFLICT (student_id, domain) WHERE status = 'OPEN' DO NOTHING \
                     RETURNING {FLAG_COLUMNS}"
                ))
                .bind(Uuid::new_v4())
                .bind(draft.student_id)
                .bind(draft.domain.as_str())
                .bind(draft.severity.as_str())
                .bind(&draft.reasons)
                .bind(now)
                .fetch_optional(&self.pool)
                .await?
            }
            Some(expected) => {
                sqlx::query(&format!(
                    "UPDATE early_warning.risk_flags \
                     SET severity = $1, reasons = $2, version = version + 1 \
                     WHERE id = $3 AND version = $4 AND status = 'OPEN' \
                       AND student_id = $5 AND domain = $6 \
                     RETURNING {FLAG_COLUMNS}"
                ))
                .bind(draft.severity.as_str())
                .bind(&draft.reasons)
                .bind(expected.id)
                .bind(expected.version)
                .bind(draft.student_id)
                .bind(draft.domain.as_str())
                .fetch_optional(&self.pool)
                .await?
            }
        };

        match (row, expected) {
            (Some(row), None) => Ok(FlagWrite::Created(flag_from_row(&row)?)),
            (Some(row), Some(_)) => Ok(FlagWrite::Updated(flag_from_row(&row)?)),
            (None, _) => Ok(FlagWrite::Conflict),
        }
    }

    async fn resolve_open_flag(
        &self,
        expected: ExpectedFlag,
        now: DateTime<Utc>,
    ) -> StoreResult<FlagWrite> {
        let row = sqlx::query(&format!(
            "UPDATE early_warning.risk_flags \
             SET status = 'RESOLVED', resolved_at = $1, version = version + 1 \
             WHERE id = $2 AND version = $3 AND status = 'OPEN' \
             RETURNING {FLAG_COLUMNS}"
        ))
        .bind(now)
        .bind(expected.id)
        .bind(expected.version)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(FlagWrite::Resolved(flag_from_row(&row)?)),
            None => Ok(FlagWrite::Conflict),
        }
    }

    async fn list_flags(&self, student_id: Uuid) -> StoreResult<Vec<RiskFlag>> {
        let rows = sqlx::query(&format!(
            "SELECT {FLAG_COLUMNS} FROM early_warning.risk_flags \
             WHERE student_id = $1 ORDER BY detected_at"
        ))
        .bind(student_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(flag_from_row).collect()
    }
}

async fn update_delivery_on(
    conn: &mut PgConnection,
    message_id: Uuid,
    channel: DeliveryChannel,
    expected: MessageStatus,
    update: DeliveryUpdate,
    now: DateTime<Utc>,
) -> StoreResult<Option<SubDelivery>> {
    let row = sqlx::query(&format!(
        "UPDATE early_warning.sub_deliveries \
         SET status = COALESCE($4, status), \
             attempt_count = COALESCE($5, attempt_count), \
             last_error = COALESCE($6, last_error), \
             provider_message_id = COALESCE($7, provider_message_id), \
             updated_at = $8 \
         WHERE message_id = $1 AND channel = $2 AND status = $3 \
         RETURNING {DELIVERY_COLUMNS}"
    ))
    .bind(message_id)
    .bind(channel.as_str())
    .bind(expected.as_str())
    .bind(update.status.map(|s| s.as_str()))
    .bind(update.attempt_count.map(|n| n as i32))
    .bind(update.last_error)
    .bind(update.provider_message_id)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(delivery_from_row).transpose()
}

async fn insert_status_event(conn: &mut PgConnection, event: &StatusEvent) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO early_warning.message_status_events
        (message_id, channel, from_status, to_status, detail, at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(event.message_id)
    .bind(event.channel.as_str())
    .bind(event.from.as_str())
    .bind(event.to.as_str())
    .bind(&event.detail)
    .bind(event.at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl MessageStore for PgStore {
    async fn insert_message(&self, message: &Message) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO early_warning.messages
            (id, recipient_name, recipient_phone, recipient_email, channel, template_id,
             language, subject, body, language_fallback, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(message.id)
        .bind(&message.recipient.name)
        .bind(&message.recipient.phone)
        .bind(&message.recipient.email)
        .bind(message.channel.as_str())
        .bind(&message.template_id)
        .bind(message.language.code())
        .bind(&message.subject)
        .bind(&message.body)
        .bind(message.language_fallback)
        .bind(message.created_at)
        .execute(&mut *tx)
        .await?;

        for delivery in &message.deliveries {
            sqlx::query(
                r#"
                INSERT INTO early_warning.sub_deliveries
                (message_id, channel, address, status, attempt_count, last_error,
                 provider_message_id, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(message.id)
            .bind(delivery.channel.as_str())
            .bind(&delivery.address)
            .bind(delivery.status.as_str())
            .bind(delivery.attempt_count as i32)
            .bind(&delivery.last_error)
            .bind(&delivery.provider_message_id)
            .bind(delivery.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_message(&self, message_id: Uuid) -> StoreResult<Option<Message>> {
        let row = sqlx::query("SELECT * FROM early_warning.messages WHERE id = $1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(Message {
            id: row.try_get("id")?,
            recipient: Recipient {
                name: row.try_get("recipient_name")?,
                phone: row.try_get("recipient_phone")?,
                email: row.try_get("recipient_email")?,
            },
            channel: row.try_get::<String, _>("channel")?.parse()?,
            template_id: row.try_get("template_id")?,
            language: row.try_get::<String, _>("language")?.parse()?,
            subject: row.try_get("subject")?,
            body: row.try_get("body")?,
            language_fallback: row.try_get("language_fallback")?,
            created_at: row.try_get("created_at")?,
            deliveries: self.deliveries(message_id).await?,
        }))
    }

    async fn update_delivery(
        &self,
        message_id: Uuid,
        channel: DeliveryChannel,
        expected: MessageStatus,
        update: DeliveryUpdate,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<SubDelivery>> {
        let mut conn = self.pool.acquire().await?;
        update_delivery_on(&mut *conn, message_id, channel, expected, update, now).await
    }

    async fn find_delivery_by_provider_id(
        &self,
        provider_message_id: &str,
    ) -> StoreResult<Option<SubDelivery>> {
        let row = sqlx::query(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM early_warning.sub_deliveries \
             WHERE provider_message_id = $1"
        ))
        .bind(provider_message_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(delivery_from_row).transpose()
    }

    async fn append_status_event(&self, event: &StatusEvent) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await?;
        insert_status_event(&mut *conn, event).await
    }

    async fn record_transition(
        &self,
        event: &StatusEvent,
        update: DeliveryUpdate,
    ) -> StoreResult<Option<SubDelivery>> {
        let mut tx = self.pool.begin().await?;
        let updated = update_delivery_on(
            &mut *tx,
            event.message_id,
            event.channel,
            event.from,
            update,
            event.at,
        )
        .await?;
        if updated.is_some() {
            insert_status_event(&mut *tx, event).await?;
        }
        tx.commit().await?;
        Ok(updated)
    }

    async fn status_history(&self, message_id: Uuid) -> StoreResult<Vec<StatusEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT message_id, channel, from_status, to_status, detail, at
            FROM early_warning.message_status_events
            WHERE message_id = $1
            ORDER BY id
            "#,
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<Uuid> {
    let school_id = Uuid::parse_str("6b1f0c2e-3a54-4d0b-9c1e-2f8a7d4e5b10")?;
    sqlx::query(
        r#"
        INSERT INTO early_warning.schools (id, name)
        VALUES ($1, $2)
        ON CONFLICT (name) DO NOTHING
        "#,
    )
    .bind(school_id)
    .bind("Groupe Scolaire Kimisagara")
    .execute(pool)
    .await?;

    // (ref, name, ubudehe, has_parents, stable, siblings, km, guardian, phone, email, lang, absences, score)
    let students = vec![
        (
            "GSK-001", "Aline Uwase", Some(1), Some(true), Some(false), Some(6), Some(7.2),
            "Jeanne Mukamana", Some("+250788100001"), None, "rw", 11, 28.0,
        ),
        (
            "GSK-002", "Eric Habimana", Some(3), Some(true), Some(true), Some(2), Some(1.5),
            "Claudine Uwimana", Some("+250788100002"), Some("claudine@example.rw"), "fr", 2, 74.0,
        ),
        (
            "GSK-003", "Patrick Niyonzima", None, Some(false), None, None, Some(4.1),
            "Diane Ingabire", None, Some("diane@example.rw"), "en", 8, 45.0,
        ),
    ];

    let today = Utc::now().date_naive();
    for (
        external_ref,
        full_name,
        ubudehe,
        has_parents,
        stable,
        siblings,
        km,
        guardian,
        phone,
        email,
        language,
        absences,
        score,
    ) in students
    {
        let student_id: Uuid = sqlx::query(
            r#"
            INSERT INTO early_warning.students
            (id, school_id, external_ref, full_name, ubudehe_level, has_parents,
             family_stability, number_of_siblings, distance_to_school_km)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (external_ref) DO UPDATE SET full_name = EXCLUDED.full_name
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(school_id)
        .bind(external_ref)
        .bind(full_name)
        .bind(ubudehe)
        .bind(has_parents)
        .bind(stable)
        .bind(siblings)
        .bind(km)
        .fetch_one(pool)
        .await?
        .get("id");

        sqlx::query(
            r#"
            INSERT INTO early_warning.guardians
            (id, student_id, full_name, phone, email, preferred_language, is_primary)
            VALUES ($1, $2, $3, $4, $5, $6, TRUE)
            ON CONFLICT (student_id) WHERE is_primary DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(student_id)
        .bind(guardian)
        .bind(phone)
        .bind(email)
        .bind(language)
        .execute(pool)
        .await?;

        for days_ago in 0..20i64 {
            let status = if days_ago < absences {
                AttendanceStatus::Absent
            } else {
                AttendanceStatus::Present
            };
            sqlx::query(
                r#"
                INSERT INTO early_warning.attendance_records (student_id, date, status)
                VALUES ($1, $2, $3)
                ON CONFLICT (student_id, date) DO UPDATE SET status = EXCLUDED.status
                "#,
            )
            .bind(student_id)
            .bind(today - Duration::days(days_ago))
            .bind(status.as_str())
            .execute(pool)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO early_warning.performance_records
            (id, student_id, term, score, max_score, recorded_on)
            VALUES ($1, $2, $3, $4, 100, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(student_id)
        .bind("T1")
        .bind(score)
        .bind(today - Duration::days(7))
        .execute(pool)
        .await?;
    }

    Ok(school_id)
}

/// Summary of an attendance CSV import.
#[derive(Debug, Default)]
pub struct ImportSummary {
    pub upserted: usize,
    pub unknown_students: usize,
}

/// Import `student_ref,date,status` rows, replacing the status of an existing day.
pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<ImportSummary> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        student_ref: String,
        date: NaiveDate,
        status: String,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut summary = ImportSummary::default();
    let mut students: HashMap<String, Option<Uuid>> = HashMap::new();

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result.with_context(|| format!("invalid row {}", line + 2))?;
        let status: AttendanceStatus = row
            .status
            .parse()
            .with_context(|| format!("invalid status on row {}", line + 2))?;

        let student_id = match students.get(&row.student_ref) {
            Some(id) => *id,
            None => {
                let id: Option<Uuid> = sqlx::query(
                    "SELECT id FROM early_warning.students WHERE external_ref = $1",
                )
                .bind(&row.student_ref)
                .fetch_optional(pool)
                .await?
                .map(|r| r.get("id"));
                students.insert(row.student_ref.clone(), id);
                id
            }
        };
        let Some(student_id) = student_id else {
            warn!(student_ref = %row.student_ref, row = line + 2, "Unknown student, skipping row");
            summary.unknown_students += 1;
            continue;
        };

        sqlx::query(
            r#"
            INSERT INTO early_warning.attendance_records (student_id, date, status)
            VALUES ($1, $2, $3)
            ON CONFLICT (student_id, date) DO UPDATE SET status = EXCLUDED.status
            "#,
        )
        .bind(student_id)
        .bind(row.date)
        .bind(status.as_str())
        .execute(pool)
        .await?;
        summary.upserted += 1;
    }

    info!(
        upserted = summary.upserted,
        unknown_students = summary.unknown_students,
        "Imported attendance"
    );
    Ok(summary)
}

/// Resolve a student's external reference (e.g. `GSK-001`) or UUID.
pub async fn resolve_student(pool: &PgPool, reference: &str) -> anyhow::Result<Uuid> {
    if let Ok(id) = Uuid::parse_str(reference) {
        return Ok(id);
    }
    let row = sqlx::query("SELECT id FROM early_warning.students WHERE external_ref = $1")
        .bind(reference)
        .fetch_optional(pool)
        .await?
        .with_context(|| format!("no student with reference {reference}"))?;
    Ok(row.get("id"))
}

/// Resolve a school by name or UUID.
pub async fn resolve_school(pool: &PgPool, reference: &str) -> anyhow::Result<Uuid> {
    if let Ok(id) = Uuid::parse_str(reference) {
        return Ok(id);
    }
    let row = sqlx::query("SELECT id FROM early_warning.schools WHERE name = $1")
        .bind(reference)
        .fetch_optional(pool)
        .await?
        .with_context(|| format!("no school named {reference}"))?;
    Ok(row.get("id"))
}
