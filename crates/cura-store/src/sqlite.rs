use std::path::Path;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, Row};
use tokio::sync::Mutex;

use crate::records::{
    AppointmentRecord, ManualSendClaim, MessageKind, MessageStatus, NewMessage,
    NotificationMessage, RecipientProfile, RecipientRelationship, TemplateKey,
};
use crate::store::{NotificationStore, RecipientDirectory};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// SQLite-backed store for single-node deployments. The conditional
/// primitives map to `UPDATE ... WHERE status = ?` statements whose
/// rows-affected count decides who won a claim.
pub struct SqliteStore {
    connection: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) the database at `path` and initializes the schema.
    pub fn open(path: &Path) -> Result<Self> {
        let connection = Connection::open(path)
            .with_context(|| format!("failed to open sqlite store at {}", path.display()))?;
        connection
            .execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .context("failed to apply sqlite pragmas")?;
        initialize_schema(&connection)?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    /// In-memory database; test convenience.
    pub fn open_ephemeral() -> Result<Self> {
        let connection =
            Connection::open_in_memory().context("failed to open in-memory sqlite store")?;
        initialize_schema(&connection)?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    /// Seeds or replaces a directory profile. Stands in for the external
    /// guardian/patient CRUD.
    pub async fn upsert_profile(&self, profile: &RecipientProfile) -> Result<()> {
        let connection = self.connection.lock().await;
        connection
            .execute(
                r#"
                INSERT INTO recipients (subject_id, display_name, phone, relationship, opted_out)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(subject_id) DO UPDATE SET
                    display_name = excluded.display_name,
                    phone = excluded.phone,
                    relationship = excluded.relationship,
                    opted_out = excluded.opted_out
                "#,
                params![
                    profile.subject_id,
                    profile.display_name,
                    profile.phone,
                    profile.relationship.as_str(),
                    profile.opted_out as i64,
                ],
            )
            .context("failed to upsert recipient profile")?;
        Ok(())
    }
}

fn initialize_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS appointments (
                id INTEGER PRIMARY KEY,
                subject_id INTEGER NOT NULL,
                item_name TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                scheduled_date TEXT,
                deleted INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_appointments_subject_date
                ON appointments (subject_id, scheduled_date);

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recipient TEXT NOT NULL,
                body TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                scheduled_at_unix_ms INTEGER NOT NULL,
                sent_at_unix_ms INTEGER,
                error TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                template TEXT NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                created_at_unix_ms INTEGER NOT NULL,
                updated_at_unix_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_dedupe
                ON messages (recipient, scheduled_at_unix_ms, kind);
            CREATE INDEX IF NOT EXISTS idx_messages_due
                ON messages (status, scheduled_at_unix_ms);

            CREATE TABLE IF NOT EXISTS message_links (
                message_id INTEGER NOT NULL,
                appointment_id INTEGER NOT NULL,
                PRIMARY KEY (message_id, appointment_id)
            );
            CREATE INDEX IF NOT EXISTS idx_message_links_appointment
                ON message_links (appointment_id);

            CREATE TABLE IF NOT EXISTS recipients (
                subject_id INTEGER PRIMARY KEY,
                display_name TEXT NOT NULL,
                phone TEXT,
                relationship TEXT NOT NULL,
                opted_out INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )
        .context("failed to initialize sqlite schema")?;
    Ok(())
}

fn unix_ms(instant: DateTime<Utc>) -> i64 {
    instant.timestamp_millis()
}

fn from_unix_ms(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("timestamp {ms} out of range"))
}

fn encode_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn decode_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .with_context(|| format!("invalid stored date '{raw}'"))
}

fn message_from_row(row: &Row<'_>) -> Result<NotificationMessage> {
    let kind_raw: String = row.get(3)?;
    let status_raw: String = row.get(4)?;
    let template_raw: String = row.get(9)?;
    let sent_at_ms: Option<i64> = row.get(6)?;
    Ok(NotificationMessage {
        id: row.get(0)?,
        recipient: row.get(1)?,
        body: row.get(2)?,
        kind: MessageKind::parse(&kind_raw)
            .ok_or_else(|| anyhow!("invalid stored message kind '{kind_raw}'"))?,
        status: MessageStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("invalid stored message status '{status_raw}'"))?,
        scheduled_at: from_unix_ms(row.get(5)?)?,
        sent_at: sent_at_ms.map(from_unix_ms).transpose()?,
        error: row.get(7)?,
        attempts: row.get(8)?,
        template: TemplateKey::decode(&template_raw)
            .ok_or_else(|| anyhow!("invalid stored template key '{template_raw}'"))?,
        deleted: row.get::<_, i64>(10)? != 0,
        created_at: from_unix_ms(row.get(11)?)?,
        updated_at: from_unix_ms(row.get(12)?)?,
    })
}

const MESSAGE_COLUMNS: &str = "id, recipient, body, kind, status, scheduled_at_unix_ms, \
     sent_at_unix_ms, error, attempts, template, deleted, created_at_unix_ms, updated_at_unix_ms";

fn query_message<P: rusqlite::Params>(
    connection: &Connection,
    where_clause: &str,
    bind: P,
) -> Result<Option<NotificationMessage>> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE {where_clause} LIMIT 1");
    let mut statement = connection.prepare(&sql)?;
    let mut rows = statement.query(bind)?;
    match rows.next()? {
        Some(row) => Ok(Some(message_from_row(row)?)),
        None => Ok(None),
    }
}

fn insert_message_with(
    connection: &Connection,
    draft: &NewMessage,
    now: DateTime<Utc>,
) -> Result<NotificationMessage> {
    connection
        .execute(
            r#"
            INSERT INTO messages
                (recipient, body, kind, status, scheduled_at_unix_ms, attempts, template,
                 deleted, created_at_unix_ms, updated_at_unix_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, 0, ?7, ?7)
            "#,
            params![
                draft.recipient,
                draft.body,
                draft.kind.as_str(),
                draft.status.as_str(),
                unix_ms(draft.scheduled_at),
                draft.template.encode(),
                unix_ms(now),
            ],
        )
        .context("failed to insert message")?;
    let id = connection.last_insert_rowid();
    Ok(NotificationMessage {
        id,
        recipient: draft.recipient.clone(),
        body: draft.body.clone(),
        kind: draft.kind,
        status: draft.status,
        scheduled_at: draft.scheduled_at,
        sent_at: None,
        error: None,
        attempts: 0,
        template: draft.template,
        deleted: false,
        created_at: now,
        updated_at: now,
    })
}

#[async_trait]
impl NotificationStore for SqliteStore {
    async fn upsert_appointment(&self, record: &AppointmentRecord) -> Result<()> {
        let connection = self.connection.lock().await;
        connection
            .execute(
                r#"
                INSERT INTO appointments (id, subject_id, item_name, sequence, scheduled_date, deleted)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(id) DO UPDATE SET
                    subject_id = excluded.subject_id,
                    item_name = excluded.item_name,
                    sequence = excluded.sequence,
                    scheduled_date = excluded.scheduled_date,
                    deleted = excluded.deleted
                "#,
                params![
                    record.id,
                    record.subject_id,
                    record.item_name,
                    record.sequence,
                    record.scheduled_date.map(encode_date),
                    record.deleted as i64,
                ],
            )
            .context("failed to upsert appointment")?;
        Ok(())
    }

    async fn appointment(&self, appointment_id: i64) -> Result<Option<AppointmentRecord>> {
        let connection = self.connection.lock().await;
        let mut statement = connection.prepare(
            "SELECT id, subject_id, item_name, sequence, scheduled_date, deleted
             FROM appointments WHERE id = ?1",
        )?;
        let mut rows = statement.query(params![appointment_id])?;
        match rows.next()? {
            Some(row) => {
                let date_raw: Option<String> = row.get(4)?;
                Ok(Some(AppointmentRecord {
                    id: row.get(0)?,
                    subject_id: row.get(1)?,
                    item_name: row.get(2)?,
                    sequence: row.get(3)?,
                    scheduled_date: date_raw.as_deref().map(decode_date).transpose()?,
                    deleted: row.get::<_, i64>(5)? != 0,
                }))
            }
            None => Ok(None),
        }
    }

    async fn live_appointments_on(
        &self,
        subject_id: i64,
        date: NaiveDate,
    ) -> Result<Vec<AppointmentRecord>> {
        let connection = self.connection.lock().await;
        let mut statement = connection.prepare(
            "SELECT id, subject_id, item_name, sequence, scheduled_date, deleted
             FROM appointments
             WHERE subject_id = ?1 AND scheduled_date = ?2 AND deleted = 0
             ORDER BY sequence ASC, id ASC",
        )?;
        let mut rows = statement.query(params![subject_id, encode_date(date)])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let date_raw: Option<String> = row.get(4)?;
            records.push(AppointmentRecord {
                id: row.get(0)?,
                subject_id: row.get(1)?,
                item_name: row.get(2)?,
                sequence: row.get(3)?,
                scheduled_date: date_raw.as_deref().map(decode_date).transpose()?,
                deleted: row.get::<_, i64>(5)? != 0,
            });
        }
        Ok(records)
    }

    async fn insert_message(&self, draft: NewMessage) -> Result<NotificationMessage> {
        let connection = self.connection.lock().await;
        insert_message_with(&connection, &draft, Utc::now())
    }

    async fn message(&self, message_id: i64) -> Result<Option<NotificationMessage>> {
        let connection = self.connection.lock().await;
        query_message(&connection, "id = ?1", params![message_id])
    }

    async fn find_pending_scheduled(
        &self,
        recipient: &str,
        scheduled_at: DateTime<Utc>,
    ) -> Result<Option<NotificationMessage>> {
        let connection = self.connection.lock().await;
        query_message(
            &connection,
            "recipient = ?1 AND scheduled_at_unix_ms = ?2 AND kind = 'scheduled'
             AND status = 'pending' AND deleted = 0",
            params![recipient, unix_ms(scheduled_at)],
        )
    }

    async fn due_scheduled_messages(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NotificationMessage>> {
        let connection = self.connection.lock().await;
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE kind = 'scheduled' AND status = 'pending'
               AND scheduled_at_unix_ms <= ?1 AND deleted = 0
             ORDER BY scheduled_at_unix_ms ASC, id ASC
             LIMIT ?2"
        );
        let mut statement = connection.prepare(&sql)?;
        let mut rows = statement.query(params![unix_ms(now), limit as i64])?;
        let mut messages = Vec::new();
        while let Some(row) = rows.next()? {
            messages.push(message_from_row(row)?);
        }
        Ok(messages)
    }

    async fn update_body(&self, message_id: i64, body: &str) -> Result<()> {
        let connection = self.connection.lock().await;
        let affected = connection
            .execute(
                "UPDATE messages SET body = ?1, updated_at_unix_ms = ?2
                 WHERE id = ?3 AND status != 'sent'",
                params![body, unix_ms(Utc::now()), message_id],
            )
            .context("failed to update message body")?;
        if affected == 0 {
            return Err(anyhow!("message {message_id} missing or sent and immutable"));
        }
        Ok(())
    }

    async fn update_recipient(&self, message_id: i64, recipient: &str) -> Result<()> {
        let connection = self.connection.lock().await;
        let affected = connection
            .execute(
                "UPDATE messages SET recipient = ?1, updated_at_unix_ms = ?2
                 WHERE id = ?3 AND status != 'sent'",
                params![recipient, unix_ms(Utc::now()), message_id],
            )
            .context("failed to update message recipient")?;
        if affected == 0 {
            return Err(anyhow!("message {message_id} missing or sent and immutable"));
        }
        Ok(())
    }

    async fn mark_sent(&self, message_id: i64, sent_at: DateTime<Utc>) -> Result<()> {
        let connection = self.connection.lock().await;
        connection
            .execute(
                "UPDATE messages
                 SET status = 'sent', sent_at_unix_ms = ?1, error = NULL, updated_at_unix_ms = ?2
                 WHERE id = ?3",
                params![unix_ms(sent_at), unix_ms(Utc::now()), message_id],
            )
            .context("failed to mark message sent")?;
        Ok(())
    }

    async fn defer_with_error(&self, message_id: i64, error: &str) -> Result<()> {
        let connection = self.connection.lock().await;
        connection
            .execute(
                "UPDATE messages SET status = 'pending', error = ?1, updated_at_unix_ms = ?2
                 WHERE id = ?3 AND status NOT IN ('sent', 'failed')",
                params![error, unix_ms(Utc::now()), message_id],
            )
            .context("failed to defer message")?;
        Ok(())
    }

    async fn record_failure(
        &self,
        message_id: i64,
        error: &str,
        max_attempts: u32,
    ) -> Result<MessageStatus> {
        let connection = self.connection.lock().await;
        let affected = connection
            .execute(
                "UPDATE messages
                 SET attempts = attempts + 1,
                     error = ?1,
                     status = CASE
                         WHEN ?2 > 0 AND attempts + 1 >= ?2 THEN 'failed'
                         ELSE 'pending'
                     END,
                     updated_at_unix_ms = ?3
                 WHERE id = ?4 AND status NOT IN ('sent', 'failed')",
                params![error, max_attempts, unix_ms(Utc::now()), message_id],
            )
            .context("failed to record delivery failure")?;
        if affected == 0 {
            let existing = query_message(&connection, "id = ?1", params![message_id])?
                .ok_or_else(|| anyhow!("message {message_id} not found"))?;
            return Ok(existing.status);
        }
        let updated = query_message(&connection, "id = ?1", params![message_id])?
            .ok_or_else(|| anyhow!("message {message_id} vanished during failure update"))?;
        Ok(updated.status)
    }

    async fn soft_delete_message(&self, message_id: i64) -> Result<()> {
        let connection = self.connection.lock().await;
        connection
            .execute(
                "UPDATE messages SET deleted = 1, updated_at_unix_ms = ?1 WHERE id = ?2",
                params![unix_ms(Utc::now()), message_id],
            )
            .context("failed to soft-delete message")?;
        Ok(())
    }

    async fn try_transition_status(
        &self,
        message_id: i64,
        from: MessageStatus,
        to: MessageStatus,
    ) -> Result<bool> {
        let connection = self.connection.lock().await;
        let affected = connection
            .execute(
                "UPDATE messages SET status = ?1, updated_at_unix_ms = ?2
                 WHERE id = ?3 AND status = ?4 AND deleted = 0",
                params![to.as_str(), unix_ms(Utc::now()), message_id, from.as_str()],
            )
            .context("failed conditional status transition")?;
        Ok(affected == 1)
    }

    async fn release_stale_sending(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let connection = self.connection.lock().await;
        let affected = connection
            .execute(
                "UPDATE messages SET status = 'pending', updated_at_unix_ms = ?1
                 WHERE status = 'sending' AND updated_at_unix_ms < ?2 AND deleted = 0",
                params![unix_ms(Utc::now()), unix_ms(older_than)],
            )
            .context("failed to release stale sending messages")?;
        Ok(affected)
    }

    async fn claim_manual_send(
        &self,
        recipient: &str,
        body: &str,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
        template: TemplateKey,
    ) -> Result<ManualSendClaim> {
        let mut connection = self.connection.lock().await;
        let transaction = connection
            .transaction()
            .context("failed to start manual-send claim transaction")?;

        let candidate = {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE kind = 'manual' AND recipient = ?1 AND body = ?2
                   AND created_at_unix_ms >= ?3 AND deleted = 0
                 ORDER BY id ASC LIMIT 1"
            );
            let mut statement = transaction.prepare(&sql)?;
            let mut rows = statement.query(params![recipient, body, unix_ms(window_start)])?;
            match rows.next()? {
                Some(row) => Some(message_from_row(row)?),
                None => None,
            }
        };

        let claim = match candidate {
            Some(message) if message.status != MessageStatus::Pending => {
                ManualSendClaim::AlreadyHandled
            }
            Some(message) => {
                let affected = transaction.execute(
                    "UPDATE messages SET status = 'sending', updated_at_unix_ms = ?1
                     WHERE id = ?2 AND status = 'pending'",
                    params![unix_ms(now), message.id],
                )?;
                if affected == 0 {
                    ManualSendClaim::AlreadyHandled
                } else {
                    ManualSendClaim::Claimed(NotificationMessage {
                        status: MessageStatus::Sending,
                        updated_at: now,
                        ..message
                    })
                }
            }
            None => {
                let draft = NewMessage {
                    recipient: recipient.to_string(),
                    body: body.to_string(),
                    kind: MessageKind::Manual,
                    status: MessageStatus::Sending,
                    scheduled_at: now,
                    template,
                };
                ManualSendClaim::Claimed(insert_message_with(&transaction, &draft, now)?)
            }
        };

        transaction
            .commit()
            .context("failed to commit manual-send claim")?;
        Ok(claim)
    }

    async fn insert_link_if_missing(&self, message_id: i64, appointment_id: i64) -> Result<bool> {
        let connection = self.connection.lock().await;
        let affected = connection
            .execute(
                "INSERT OR IGNORE INTO message_links (message_id, appointment_id) VALUES (?1, ?2)",
                params![message_id, appointment_id],
            )
            .context("failed to insert message link")?;
        Ok(affected == 1)
    }

    async fn delete_link(&self, message_id: i64, appointment_id: i64) -> Result<bool> {
        let connection = self.connection.lock().await;
        let affected = connection
            .execute(
                "DELETE FROM message_links WHERE message_id = ?1 AND appointment_id = ?2",
                params![message_id, appointment_id],
            )
            .context("failed to delete message link")?;
        Ok(affected == 1)
    }

    async fn message_ids_for_appointment(&self, appointment_id: i64) -> Result<Vec<i64>> {
        let connection = self.connection.lock().await;
        let mut statement = connection.prepare(
            "SELECT message_id FROM message_links WHERE appointment_id = ?1 ORDER BY message_id",
        )?;
        let mut rows = statement.query(params![appointment_id])?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next()? {
            ids.push(row.get(0)?);
        }
        Ok(ids)
    }

    async fn appointment_ids_for_message(&self, message_id: i64) -> Result<Vec<i64>> {
        let connection = self.connection.lock().await;
        let mut statement = connection.prepare(
            "SELECT appointment_id FROM message_links WHERE message_id = ?1 ORDER BY appointment_id",
        )?;
        let mut rows = statement.query(params![message_id])?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next()? {
            ids.push(row.get(0)?);
        }
        Ok(ids)
    }

    async fn live_link_count(&self, message_id: i64) -> Result<usize> {
        let connection = self.connection.lock().await;
        let count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM message_links WHERE message_id = ?1",
            params![message_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[async_trait]
impl RecipientDirectory for SqliteStore {
    async fn profile(&self, subject_id: i64) -> Result<Option<RecipientProfile>> {
        let connection = self.connection.lock().await;
        let mut statement = connection.prepare(
            "SELECT subject_id, display_name, phone, relationship, opted_out
             FROM recipients WHERE subject_id = ?1",
        )?;
        let mut rows = statement.query(params![subject_id])?;
        match rows.next()? {
            Some(row) => {
                let relationship_raw: String = row.get(3)?;
                Ok(Some(RecipientProfile {
                    subject_id: row.get(0)?,
                    display_name: row.get(1)?,
                    phone: row.get(2)?,
                    relationship: RecipientRelationship::parse(&relationship_raw).ok_or_else(
                        || anyhow!("invalid stored relationship '{relationship_raw}'"),
                    )?,
                    opted_out: row.get::<_, i64>(4)? != 0,
                }))
            }
            None => Ok(None),
        }
    }
}
