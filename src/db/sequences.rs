use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use crate::sequences::{
    Channel, Contact, DeliveryRecord, DeliveryStatus, DueWork, Enrollment, EnrollmentStatus,
    EnrollmentStep, Sequence, SequenceStep, SequenceStore, StepStatus,
};

use super::{corrupt, StoreError};

const ENROLLMENT_COLUMNS: &str = r#"
    id,
    contact_id,
    sequence_id,
    enrolled_at,
    current_step_index,
    enrollment_status,
    step_anchor_at,
    stop_reason,
    metadata,
    updated_at
"#;

const STEP_RUN_COLUMNS: &str = r#"
    id,
    enrollment_id,
    step_index,
    status,
    claim_token,
    claimed_at,
    completed_at,
    provider_message_id,
    last_error
"#;

const DELIVERY_COLUMNS: &str = r#"
    provider_message_id,
    enrollment_step_id,
    claim_token,
    channel,
    delivery_status,
    error_code,
    metadata,
    created_at,
    updated_at
"#;

/// key: sequences-db -> enrollments, step claims, deliveries on Postgres
#[derive(Clone)]
pub struct PgSequenceStore {
    pool: PgPool,
}

impl PgSequenceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn channel_from(table: &'static str, raw: &str) -> Result<Channel, StoreError> {
    Channel::from_str(raw).ok_or_else(|| corrupt(table, format!("unknown channel `{raw}`")))
}

fn enrollment_status_from(raw: &str) -> Result<EnrollmentStatus, StoreError> {
    EnrollmentStatus::from_str(raw)
        .ok_or_else(|| corrupt("sequence_enrollments", format!("unknown status `{raw}`")))
}

fn step_status_from(raw: &str) -> Result<StepStatus, StoreError> {
    StepStatus::from_str(raw)
        .ok_or_else(|| corrupt("enrollment_steps", format!("unknown status `{raw}`")))
}

fn enrollment_from_row(row: &PgRow, id: &str, updated_at: &str) -> Result<Enrollment, StoreError> {
    let status: String = row.try_get("enrollment_status")?;
    Ok(Enrollment {
        id: row.try_get(id)?,
        contact_id: row.try_get("contact_id")?,
        sequence_id: row.try_get("sequence_id")?,
        enrolled_at: row.try_get("enrolled_at")?,
        current_step_index: row.try_get("current_step_index")?,
        enrollment_status: enrollment_status_from(&status)?,
        step_anchor_at: row.try_get("step_anchor_at")?,
        stop_reason: row.try_get("stop_reason")?,
        metadata: row.try_get("metadata")?,
        updated_at: row.try_get(updated_at)?,
    })
}

fn step_run_from_row(
    row: &PgRow,
    id: &str,
    step_index: &str,
    status: &str,
) -> Result<EnrollmentStep, StoreError> {
    let raw_status: String = row.try_get(status)?;
    Ok(EnrollmentStep {
        id: row.try_get(id)?,
        enrollment_id: row.try_get("enrollment_id")?,
        step_index: row.try_get(step_index)?,
        status: step_status_from(&raw_status)?,
        claim_token: row.try_get("claim_token")?,
        claimed_at: row.try_get("claimed_at")?,
        completed_at: row.try_get("completed_at")?,
        provider_message_id: row.try_get("provider_message_id")?,
        last_error: row.try_get("last_error")?,
    })
}

fn sequence_step_from_row(row: &PgRow, step_index: &str) -> Result<SequenceStep, StoreError> {
    let channel: String = row.try_get("channel")?;
    let wait_offset_secs: i64 = row.try_get("wait_offset_secs")?;
    Ok(SequenceStep {
        sequence_id: row.try_get("sequence_id")?,
        step_index: row.try_get(step_index)?,
        wait_offset: Duration::seconds(wait_offset_secs),
        channel: channel_from("sequence_steps", &channel)?,
        template: row.try_get("template")?,
        subject: row.try_get("subject")?,
    })
}

fn sequence_from_row(row: &PgRow, id: &str) -> Result<Sequence, StoreError> {
    Ok(Sequence {
        id: row.try_get(id)?,
        owner_user_id: row.try_get("owner_user_id")?,
        name: row.try_get("sequence_name")?,
        active: row.try_get("sequence_active")?,
        stop_on_reply: row.try_get("stop_on_reply")?,
        stop_on_booking: row.try_get("stop_on_booking")?,
    })
}

fn delivery_from_row(row: &PgRow) -> Result<DeliveryRecord, StoreError> {
    let channel: String = row.try_get("channel")?;
    let status: String = row.try_get("delivery_status")?;
    let metadata: Option<Value> = row.try_get("metadata")?;
    Ok(DeliveryRecord {
        provider_message_id: row.try_get("provider_message_id")?,
        enrollment_step_id: row.try_get("enrollment_step_id")?,
        claim_token: row.try_get("claim_token")?,
        channel: channel_from("delivery_records", &channel)?,
        delivery_status: DeliveryStatus::from_str(&status)
            .ok_or_else(|| corrupt("delivery_records", format!("unknown status `{status}`")))?,
        error_code: row.try_get("error_code")?,
        metadata: metadata.unwrap_or(Value::Null),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn due_work_from_row(row: &PgRow) -> Result<DueWork, StoreError> {
    let enrollment = enrollment_from_row(row, "e_id", "e_updated_at")?;
    let sequence = sequence_from_row(row, "sequence_id")?;

    let step_index: Option<i32> = row.try_get("st_step_index")?;
    let step = match step_index {
        Some(_) => Some(sequence_step_from_row(row, "st_step_index")?),
        None => None,
    };
    let run_id: Option<Uuid> = row.try_get("r_id")?;
    let run = match run_id {
        Some(_) => Some(step_run_from_row(row, "r_id", "r_step_index", "r_status")?),
        None => None,
    };
    let contact_id: Option<Uuid> = row.try_get("c_id")?;
    let contact = match contact_id {
        Some(id) => Some(Contact {
            id,
            name: row.try_get("contact_name")?,
            phone: row.try_get("phone")?,
            email: row.try_get("email")?,
        }),
        None => None,
    };

    Ok(DueWork {
        enrollment,
        sequence,
        step,
        run,
        contact,
        total_steps: row.try_get("total_steps")?,
    })
}

#[async_trait]
impl SequenceStore for PgSequenceStore {
    async fn create_sequence(
        &self,
        sequence: &Sequence,
        steps: &[SequenceStep],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO sequences (id, owner_user_id, name, active, stop_on_reply, stop_on_booking)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(sequence.id)
        .bind(sequence.owner_user_id)
        .bind(&sequence.name)
        .bind(sequence.active)
        .bind(sequence.stop_on_reply)
        .bind(sequence.stop_on_booking)
        .execute(&mut tx)
        .await?;
        for step in steps {
            sqlx::query(
                r#"
                INSERT INTO sequence_steps (sequence_id, step_index, wait_offset_secs, channel, template, subject)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(sequence.id)
            .bind(step.step_index)
            .bind(step.wait_offset.num_seconds())
            .bind(step.channel.as_str())
            .bind(&step.template)
            .bind(step.subject.as_deref())
            .execute(&mut tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn set_sequence_active(
        &self,
        sequence_id: Uuid,
        active: bool,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE sequences SET active = $2 WHERE id = $1")
            .bind(sequence_id)
            .bind(active)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn sequence(
        &self,
        sequence_id: Uuid,
    ) -> Result<Option<(Sequence, Vec<SequenceStep>)>, StoreError> {
        let Some(row) = sqlx::query(
            r#"
            SELECT id, owner_user_id, name AS sequence_name, active AS sequence_active,
                   stop_on_reply, stop_on_booking
            FROM sequences
            WHERE id = $1
            "#,
        )
        .bind(sequence_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };
        let sequence = sequence_from_row(&row, "id")?;

        let rows = sqlx::query(
            r#"
            SELECT sequence_id, step_index, wait_offset_secs, channel, template, subject
            FROM sequence_steps
            WHERE sequence_id = $1
            ORDER BY step_index ASC
            "#,
        )
        .bind(sequence_id)
        .fetch_all(&self.pool)
        .await?;
        let steps = rows
            .iter()
            .map(|row| sequence_step_from_row(row, "step_index"))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some((sequence, steps)))
    }

    async fn upsert_contact(&self, contact: &Contact) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO crm_contacts (id, name, phone, email)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                phone = EXCLUDED.phone,
                email = EXCLUDED.email
            "#,
        )
        .bind(contact.id)
        .bind(&contact.name)
        .bind(contact.phone.as_deref())
        .bind(contact.email.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn contact(&self, contact_id: Uuid) -> Result<Option<Contact>, StoreError> {
        let row = sqlx::query("SELECT id, name, phone, email FROM crm_contacts WHERE id = $1")
            .bind(contact_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            Ok(Contact {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                phone: row.try_get("phone")?,
                email: row.try_get("email")?,
            })
        })
        .transpose()
    }

    async fn contacts_by_phone(&self, phone: &str) -> Result<Vec<Contact>, StoreError> {
        let rows = sqlx::query("SELECT id, name, phone, email FROM crm_contacts WHERE phone = $1")
            .bind(phone)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(Contact {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    phone: row.try_get("phone")?,
                    email: row.try_get("email")?,
                })
            })
            .collect()
    }

    async fn in_flight_enrollments(
        &self,
        contact_ids: &[Uuid],
    ) -> Result<Vec<(Enrollment, Sequence)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                e.id AS e_id,
                e.contact_id,
                e.sequence_id,
                e.enrolled_at,
                e.current_step_index,
                e.enrollment_status,
                e.step_anchor_at,
                e.stop_reason,
                e.metadata,
                e.updated_at AS e_updated_at,
                s.owner_user_id,
                s.name AS sequence_name,
                s.active AS sequence_active,
                s.stop_on_reply,
                s.stop_on_booking
            FROM sequence_enrollments e
            JOIN sequences s ON s.id = e.sequence_id
            WHERE e.contact_id = ANY($1)
              AND e.enrollment_status IN ('active', 'paused')
            ORDER BY e.enrolled_at ASC
            "#,
        )
        .bind(contact_ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok((
                    enrollment_from_row(row, "e_id", "e_updated_at")?,
                    sequence_from_row(row, "sequence_id")?,
                ))
            })
            .collect()
    }

    async fn active_enrollment_exists(
        &self,
        contact_id: Uuid,
        sequence_id: Uuid,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM sequence_enrollments
                WHERE contact_id = $1
                  AND sequence_id = $2
                  AND enrollment_status IN ('active', 'paused')
            ) AS present
            "#,
        )
        .bind(contact_id)
        .bind(sequence_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("present")?)
    }

    async fn insert_enrollment(
        &self,
        enrollment: &Enrollment,
        steps: &[EnrollmentStep],
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO sequence_enrollments ({ENROLLMENT_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT DO NOTHING
            RETURNING id
            "#
        ))
        .bind(enrollment.id)
        .bind(enrollment.contact_id)
        .bind(enrollment.sequence_id)
        .bind(enrollment.enrolled_at)
        .bind(enrollment.current_step_index)
        .bind(enrollment.enrollment_status.as_str())
        .bind(enrollment.step_anchor_at)
        .bind(enrollment.stop_reason.as_deref())
        .bind(&enrollment.metadata)
        .bind(enrollment.updated_at)
        .fetch_optional(&mut tx)
        .await?;
        if inserted.is_none() {
            tx.rollback().await?;
            return Ok(false);
        }

        for step in steps {
            sqlx::query(&format!(
                r#"
                INSERT INTO enrollment_steps ({STEP_RUN_COLUMNS})
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#
            ))
            .bind(step.id)
            .bind(step.enrollment_id)
            .bind(step.step_index)
            .bind(step.status.as_str())
            .bind(step.claim_token)
            .bind(step.claimed_at)
            .bind(step.completed_at)
            .bind(step.provider_message_id.as_deref())
            .bind(step.last_error.as_deref())
            .execute(&mut tx)
            .await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn enrollment(&self, enrollment_id: Uuid) -> Result<Option<Enrollment>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ENROLLMENT_COLUMNS} FROM sequence_enrollments WHERE id = $1"
        ))
        .bind(enrollment_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref()
            .map(|row| enrollment_from_row(row, "id", "updated_at"))
            .transpose()
    }

    async fn enrollment_steps(
        &self,
        enrollment_id: Uuid,
    ) -> Result<Vec<EnrollmentStep>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_RUN_COLUMNS} FROM enrollment_steps WHERE enrollment_id = $1 ORDER BY step_index ASC"
        ))
        .bind(enrollment_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| step_run_from_row(row, "id", "step_index", "status"))
            .collect()
    }

    async fn due_work(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DueWork>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                e.id AS e_id,
                e.contact_id,
                e.sequence_id,
                e.enrolled_at,
                e.current_step_index,
                e.enrollment_status,
                e.step_anchor_at,
                e.stop_reason,
                e.metadata,
                e.updated_at AS e_updated_at,
                s.owner_user_id,
                s.name AS sequence_name,
                s.active AS sequence_active,
                s.stop_on_reply,
                s.stop_on_booking,
                st.step_index AS st_step_index,
                st.wait_offset_secs,
                st.channel,
                st.template,
                st.subject,
                r.id AS r_id,
                r.enrollment_id,
                r.step_index AS r_step_index,
                r.status AS r_status,
                r.claim_token,
                r.claimed_at,
                r.completed_at,
                r.provider_message_id,
                r.last_error,
                c.id AS c_id,
                c.name AS contact_name,
                c.phone,
                c.email,
                (
                    SELECT COUNT(*)
                    FROM enrollment_steps x
                    WHERE x.enrollment_id = e.id
                )::INTEGER AS total_steps
            FROM sequence_enrollments e
            JOIN sequences s ON s.id = e.sequence_id
            LEFT JOIN enrollment_steps r
                ON r.enrollment_id = e.id AND r.step_index = e.current_step_index
            LEFT JOIN sequence_steps st
                ON st.sequence_id = e.sequence_id AND st.step_index = e.current_step_index
            LEFT JOIN crm_contacts c ON c.id = e.contact_id
            WHERE e.enrollment_status = 'active'
              AND (
                    s.active = FALSE
                    OR r.id IS NULL
                    OR r.status IN ('sent', 'skipped', 'failed')
                    OR (
                        r.status = 'pending'
                        AND e.step_anchor_at
                            + make_interval(secs => COALESCE(st.wait_offset_secs, 0)::double precision)
                            <= $1
                    )
                    OR (r.status = 'due' AND r.claimed_at < $2)
              )
            ORDER BY e.step_anchor_at ASC
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(stale_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(due_work_from_row).collect()
    }

    async fn claim_step(
        &self,
        step_id: Uuid,
        token: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE enrollment_steps
            SET status = 'due', claim_token = $2, claimed_at = $3
            WHERE id = $1
              AND (status = 'pending' OR (status = 'due' AND claimed_at < $4))
            RETURNING id
            "#,
        )
        .bind(step_id)
        .bind(token)
        .bind(now)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn finish_step(
        &self,
        step_id: Uuid,
        token: Uuid,
        status: StepStatus,
        provider_message_id: Option<&str>,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE enrollment_steps
            SET
                status = $3,
                provider_message_id = COALESCE($4, provider_message_id),
                last_error = $5,
                completed_at = $6
            WHERE id = $1
              AND status = 'due'
              AND claim_token = $2
            RETURNING id
            "#,
        )
        .bind(step_id)
        .bind(token)
        .bind(status.as_str())
        .bind(provider_message_id)
        .bind(error)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn advance_enrollment(
        &self,
        enrollment_id: Uuid,
        from_index: i32,
        total_steps: i32,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE sequence_enrollments
            SET
                current_step_index = current_step_index + 1,
                enrollment_status = CASE
                    WHEN current_step_index + 1 >= $3 THEN 'completed'
                    ELSE enrollment_status
                END,
                step_anchor_at = $4,
                updated_at = $4
            WHERE id = $1
              AND current_step_index = $2
              AND enrollment_status IN ('active', 'paused')
            RETURNING id
            "#,
        )
        .bind(enrollment_id)
        .bind(from_index)
        .bind(total_steps)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn set_enrollment_status(
        &self,
        enrollment_id: Uuid,
        from: &[EnrollmentStatus],
        status: EnrollmentStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE sequence_enrollments
            SET enrollment_status = $3, stop_reason = $4, updated_at = $5
            WHERE id = $1 AND enrollment_status = ANY($2)
            RETURNING id
            "#,
        )
        .bind(enrollment_id)
        .bind(
            from.iter()
                .map(|status| status.as_str().to_string())
                .collect::<Vec<_>>(),
        )
        .bind(status.as_str())
        .bind(reason)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn insert_delivery_record(&self, record: &DeliveryRecord) -> Result<(), StoreError> {
        sqlx::query(&format!(
            r#"
            INSERT INTO delivery_records ({DELIVERY_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (provider_message_id) DO NOTHING
            "#
        ))
        .bind(&record.provider_message_id)
        .bind(record.enrollment_step_id)
        .bind(record.claim_token)
        .bind(record.channel.as_str())
        .bind(record.delivery_status.as_str())
        .bind(record.error_code.as_deref())
        .bind(&record.metadata)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delivery_record(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<DeliveryRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM delivery_records WHERE provider_message_id = $1"
        ))
        .bind(provider_message_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(delivery_from_row).transpose()
    }

    async fn update_delivery_status(
        &self,
        provider_message_id: &str,
        status: DeliveryStatus,
        error_code: Option<&str>,
        metadata: Option<&Value>,
        allowed_from: &[DeliveryStatus],
        now: DateTime<Utc>,
    ) -> Result<Option<DeliveryRecord>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE delivery_records
            SET
                delivery_status = $2,
                error_code = COALESCE($3, error_code),
                metadata = COALESCE(metadata, '{{}}'::jsonb) || COALESCE($4, '{{}}'::jsonb),
                updated_at = $5
            WHERE provider_message_id = $1
              AND delivery_status = ANY($6)
            RETURNING {DELIVERY_COLUMNS}
            "#
        ))
        .bind(provider_message_id)
        .bind(status.as_str())
        .bind(error_code)
        .bind(metadata)
        .bind(now)
        .bind(
            allowed_from
                .iter()
                .map(|status| status.as_str().to_string())
                .collect::<Vec<_>>(),
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(delivery_from_row).transpose()
    }

    async fn fail_delivered_step(
        &self,
        step_id: Uuid,
        provider_message_id: &str,
        claim_token: Option<Uuid>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE enrollment_steps
            SET status = 'failed',
                last_error = $4,
                completed_at = COALESCE(completed_at, $5)
            WHERE id = $1
              AND (
                (status = 'sent' AND provider_message_id = $2)
                OR (status = 'due' AND claim_token = $3)
              )
            RETURNING id
            "#,
        )
        .bind(step_id)
        .bind(provider_message_id)
        .bind(claim_token)
        .bind(error)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }
}
