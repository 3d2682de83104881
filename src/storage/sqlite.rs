//! SQLite storage implementation.
//!
//! All writes keyed by business identifiers go through `INSERT .. ON
//! CONFLICT .. DO UPDATE` so that a retried or racing caller can never
//! produce duplicate rows or observe a uniqueness violation; the second
//! writer's values win.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use super::models::*;
use crate::error::Result;

/// Parse an RFC 3339 datetime string into a `chrono::DateTime<Utc>`.
///
/// Returns a `rusqlite::Error` on parse failure instead of panicking,
/// so it is safe to use inside `query_row` / `query_map` closures.
fn parse_datetime_utc(s: &str) -> rusqlite::Result<chrono::DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn parse_optional_datetime(s: Option<String>) -> Option<chrono::DateTime<Utc>> {
    s.and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn string_vec_from_json(s: &str) -> Vec<String> {
    serde_json::from_str(s).unwrap_or_default()
}

/// SQLite-based storage.
#[derive(Clone)]
pub struct SqliteStorage {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init_schema_sync(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema_sync(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema_sync(conn: &Connection) -> Result<()> {
        // WAL mode must be set before any transaction begins
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT,
                owner_id TEXT,
                status TEXT NOT NULL,
                progress REAL NOT NULL DEFAULT 0,
                current_step INTEGER NOT NULL DEFAULT 0,
                total_steps INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                last_activity_at TEXT NOT NULL,
                context TEXT NOT NULL DEFAULT '{}',
                error TEXT,
                deleted INTEGER NOT NULL DEFAULT 0,
                deleted_at TEXT
            );

            CREATE TABLE IF NOT EXISTS workflow_steps (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                step_number INTEGER NOT NULL,
                content TEXT NOT NULL,
                category TEXT NOT NULL,
                resource_kind TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                execution_details TEXT NOT NULL DEFAULT 'null',
                results TEXT NOT NULL DEFAULT '[]',
                urls TEXT NOT NULL DEFAULT '[]',
                files TEXT NOT NULL DEFAULT '[]',
                error TEXT,
                FOREIGN KEY (workflow_id) REFERENCES workflows(id) ON DELETE CASCADE,
                UNIQUE(workflow_id, step_id)
            );

            CREATE TABLE IF NOT EXISTS workflow_messages (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                status TEXT,
                data TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (workflow_id) REFERENCES workflows(id) ON DELETE CASCADE,
                UNIQUE(workflow_id, message_id)
            );

            CREATE TABLE IF NOT EXISTS workflow_resources (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                step_pk TEXT,
                source_step_id TEXT,
                resource_type TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                data TEXT NOT NULL DEFAULT '{}',
                category TEXT,
                FOREIGN KEY (workflow_id) REFERENCES workflows(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_steps_workflow
                ON workflow_steps(workflow_id, step_number);
            CREATE INDEX IF NOT EXISTS idx_messages_workflow
                ON workflow_messages(workflow_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_resources_workflow
                ON workflow_resources(workflow_id);
            "#,
        )?;
        Ok(())
    }

    // ========================================================================
    // Workflow operations
    // ========================================================================

    /// Insert a workflow, or refresh an existing one.
    ///
    /// An existing row is forced back to Running with a fresh last-activity
    /// timestamp (new activity resumes a paused or completed workflow);
    /// title, timing, and progress are left untouched. Never fails on a
    /// duplicate id.
    pub async fn create_or_get_workflow(
        &self,
        id: &str,
        title: &str,
        description: Option<&str>,
        owner_id: Option<&str>,
    ) -> Result<WorkflowInstance> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();

        conn.execute(
            "INSERT INTO workflows
             (id, title, description, owner_id, status, progress, current_step, total_steps,
              started_at, last_activity_at, context)
             VALUES (?1, ?2, ?3, ?4, 'running', 0, 0, 0, ?5, ?5, '{}')
             ON CONFLICT(id) DO UPDATE SET
                status = 'running',
                last_activity_at = excluded.last_activity_at",
            params![id, title, description, owner_id, now],
        )?;

        let workflow = conn.query_row(
            Self::WORKFLOW_COLUMNS,
            [id],
            Self::row_to_workflow,
        )?;
        Ok(workflow)
    }

    const WORKFLOW_COLUMNS: &'static str =
        "SELECT id, title, description, owner_id, status, progress, current_step, total_steps,
                started_at, finished_at, last_activity_at, context, error, deleted, deleted_at
         FROM workflows WHERE id = ?1";

    pub async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowInstance>> {
        let conn = self.conn.lock().await;
        let workflow = conn
            .query_row(Self::WORKFLOW_COLUMNS, [id], Self::row_to_workflow)
            .optional()?;
        Ok(workflow)
    }

    pub async fn complete_workflow(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE workflows
             SET status = 'completed', progress = 100, finished_at = ?2, last_activity_at = ?2
             WHERE id = ?1",
            params![id, now],
        )?;
        Ok(())
    }

    pub async fn fail_workflow(&self, id: &str, error: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE workflows
             SET status = 'failed', error = ?2, finished_at = ?3, last_activity_at = ?3
             WHERE id = ?1",
            params![id, error, now],
        )?;
        Ok(())
    }

    /// Replace a workflow's free-form context blob.
    pub async fn set_workflow_context(
        &self,
        id: &str,
        context: &serde_json::Value,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE workflows SET context = ?2, last_activity_at = ?3 WHERE id = ?1",
            params![
                id,
                serde_json::to_string(context).unwrap_or_else(|_| "{}".to_string()),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Soft-delete a workflow. The streaming path never calls this; it is
    /// reserved for the admin-style delete endpoint.
    pub async fn soft_delete_workflow(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let changed = conn.execute(
            "UPDATE workflows SET deleted = 1, deleted_at = ?2 WHERE id = ?1 AND deleted = 0",
            params![id, now],
        )?;
        Ok(changed > 0)
    }

    /// Recompute a workflow's progress percentage from its steps.
    ///
    /// progress = completed steps / total steps * 100, 0 when no steps are
    /// known yet, clamped to [0, 100].
    pub async fn recompute_progress(&self, workflow_id: &str) -> Result<f64> {
        let conn = self.conn.lock().await;

        let total: u32 = conn
            .query_row(
                "SELECT total_steps FROM workflows WHERE id = ?1",
                [workflow_id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);

        let completed: u32 = conn.query_row(
            "SELECT COUNT(*) FROM workflow_steps WHERE workflow_id = ?1 AND status = 'completed'",
            [workflow_id],
            |row| row.get(0),
        )?;

        let progress = if total == 0 {
            0.0
        } else {
            (completed as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
        };

        conn.execute(
            "UPDATE workflows SET progress = ?2, last_activity_at = ?3 WHERE id = ?1",
            params![workflow_id, progress, Utc::now().to_rfc3339()],
        )?;

        Ok(progress)
    }

    // ========================================================================
    // Step operations
    // ========================================================================

    /// Upsert a step by its business identity `(workflow_id, step_id)`.
    ///
    /// Insert and conflict-update both land the step in Running with a fresh
    /// start timestamp; re-entering a step resets its timing and clears any
    /// terminal state. Content, details, urls, files, and results are
    /// last-write-wins. Also raises the workflow's total-step high-water
    /// mark to the step number.
    pub async fn upsert_step(
        &self,
        workflow_id: &str,
        descriptor: &StepDescriptor,
    ) -> Result<WorkflowStep> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let id = uuid::Uuid::new_v4().to_string();

        conn.execute(
            "INSERT INTO workflow_steps
             (id, workflow_id, step_id, step_number, content, category, resource_kind,
              status, started_at, execution_details, results, urls, files)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'running', ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(workflow_id, step_id) DO UPDATE SET
                step_number = excluded.step_number,
                content = excluded.content,
                category = excluded.category,
                resource_kind = excluded.resource_kind,
                execution_details = excluded.execution_details,
                results = excluded.results,
                urls = excluded.urls,
                files = excluded.files,
                status = 'running',
                started_at = excluded.started_at,
                finished_at = NULL,
                error = NULL",
            params![
                id,
                workflow_id,
                descriptor.step_id,
                descriptor.step_number,
                descriptor.content,
                descriptor.category.to_string(),
                descriptor.resource_kind.to_string(),
                now,
                serde_json::to_string(&descriptor.execution_details).unwrap_or_default(),
                serde_json::to_string(&descriptor.results).unwrap_or_default(),
                serde_json::to_string(&descriptor.urls).unwrap_or_default(),
                serde_json::to_string(&descriptor.files).unwrap_or_default(),
            ],
        )?;

        conn.execute(
            "UPDATE workflows
             SET total_steps = MAX(total_steps, ?2), current_step = ?2, last_activity_at = ?3
             WHERE id = ?1",
            params![workflow_id, descriptor.step_number, now],
        )?;

        let step = conn.query_row(
            Self::STEP_COLUMNS_BY_BUSINESS_ID,
            params![workflow_id, descriptor.step_id],
            Self::row_to_step,
        )?;
        Ok(step)
    }

    const STEP_COLUMNS_BY_BUSINESS_ID: &'static str =
        "SELECT id, workflow_id, step_id, step_number, content, category, resource_kind,
                status, started_at, finished_at, execution_details, results, urls, files, error
         FROM workflow_steps WHERE workflow_id = ?1 AND step_id = ?2";

    /// Mark a step Completed. Returns false when the step row does not
    /// exist, which callers treat as a logged no-op.
    pub async fn complete_step(&self, workflow_id: &str, step_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let changed = conn.execute(
            "UPDATE workflow_steps
             SET status = 'completed', finished_at = ?3
             WHERE workflow_id = ?1 AND step_id = ?2",
            params![workflow_id, step_id, now],
        )?;
        Ok(changed > 0)
    }

    /// Mark a step Failed with a captured error message.
    pub async fn fail_step(&self, workflow_id: &str, step_id: &str, error: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let changed = conn.execute(
            "UPDATE workflow_steps
             SET status = 'failed', error = ?3, finished_at = ?4
             WHERE workflow_id = ?1 AND step_id = ?2",
            params![workflow_id, step_id, error, now],
        )?;
        Ok(changed > 0)
    }

    pub async fn get_step(&self, workflow_id: &str, step_id: &str) -> Result<Option<WorkflowStep>> {
        let conn = self.conn.lock().await;
        let step = conn
            .query_row(
                Self::STEP_COLUMNS_BY_BUSINESS_ID,
                params![workflow_id, step_id],
                Self::row_to_step,
            )
            .optional()?;
        Ok(step)
    }

    /// Resolve a business step id to its storage key, if the row exists.
    pub async fn step_storage_key(
        &self,
        workflow_id: &str,
        step_id: &str,
    ) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let key = conn
            .query_row(
                "SELECT id FROM workflow_steps WHERE workflow_id = ?1 AND step_id = ?2",
                params![workflow_id, step_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(key)
    }

    pub async fn list_steps(&self, workflow_id: &str) -> Result<Vec<WorkflowStep>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, workflow_id, step_id, step_number, content, category, resource_kind,
                    status, started_at, finished_at, execution_details, results, urls, files, error
             FROM workflow_steps WHERE workflow_id = ?1 ORDER BY step_number",
        )?;

        let steps = stmt
            .query_map([workflow_id], Self::row_to_step)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(steps)
    }

    // ========================================================================
    // Message operations
    // ========================================================================

    /// Upsert a message by its idempotency key `(workflow_id, message_id)`.
    ///
    /// A second write with the same key updates kind/content/status/data in
    /// place and bumps the updated timestamp; the single conflict-handling
    /// statement means concurrent upserts can neither duplicate the row nor
    /// surface a uniqueness error.
    pub async fn upsert_message(
        &self,
        workflow_id: &str,
        payload: &MessagePayload,
    ) -> Result<WorkflowMessage> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let id = uuid::Uuid::new_v4().to_string();

        conn.execute(
            "INSERT INTO workflow_messages
             (id, workflow_id, message_id, kind, content, status, data, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
             ON CONFLICT(workflow_id, message_id) DO UPDATE SET
                kind = excluded.kind,
                content = excluded.content,
                status = excluded.status,
                data = excluded.data,
                updated_at = excluded.updated_at",
            params![
                id,
                workflow_id,
                payload.message_id,
                payload.kind.to_string(),
                payload.content,
                payload.status.map(|s| s.to_string()),
                payload
                    .data
                    .as_ref()
                    .map(|d| serde_json::to_string(d).unwrap_or_default()),
                now,
            ],
        )?;

        conn.execute(
            "UPDATE workflows SET last_activity_at = ?2 WHERE id = ?1",
            params![workflow_id, now],
        )?;

        let message = conn.query_row(
            "SELECT id, workflow_id, message_id, kind, content, status, data, created_at, updated_at
             FROM workflow_messages WHERE workflow_id = ?1 AND message_id = ?2",
            params![workflow_id, payload.message_id],
            Self::row_to_message,
        )?;
        Ok(message)
    }

    pub async fn list_messages(&self, workflow_id: &str) -> Result<Vec<WorkflowMessage>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, workflow_id, message_id, kind, content, status, data, created_at, updated_at
             FROM workflow_messages WHERE workflow_id = ?1 ORDER BY created_at, updated_at",
        )?;

        let messages = stmt
            .query_map([workflow_id], Self::row_to_message)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    // ========================================================================
    // Resource operations
    // ========================================================================

    pub async fn insert_resource(&self, resource: &WorkflowResource) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO workflow_resources
             (id, workflow_id, step_pk, source_step_id, resource_type, title, description, data, category)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                resource.id,
                resource.workflow_id,
                resource.step_pk,
                resource.source_step_id,
                resource.resource_type.to_string(),
                resource.title,
                resource.description,
                serde_json::to_string(&resource.data).unwrap_or_default(),
                resource.category,
            ],
        )?;
        Ok(())
    }

    pub async fn list_resources(&self, workflow_id: &str) -> Result<Vec<WorkflowResource>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, workflow_id, step_pk, source_step_id, resource_type, title, description, data, category
             FROM workflow_resources WHERE workflow_id = ?1",
        )?;

        let resources = stmt
            .query_map([workflow_id], Self::row_to_resource)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(resources)
    }

    // ========================================================================
    // Health
    // ========================================================================

    pub async fn check_health(&self) -> Result<DatabaseHealth> {
        let conn = self.conn.lock().await;

        let foreign_keys_enabled: i64 =
            conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        let integrity_check: String =
            conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        let busy_timeout_ms: i64 = conn.query_row("PRAGMA busy_timeout", [], |row| row.get(0))?;

        let orphaned_steps: i64 = conn.query_row(
            "SELECT COUNT(*) FROM workflow_steps s
             LEFT JOIN workflows w ON w.id = s.workflow_id
             WHERE w.id IS NULL",
            [],
            |row| row.get(0),
        )?;

        let orphaned_messages: i64 = conn.query_row(
            "SELECT COUNT(*) FROM workflow_messages m
             LEFT JOIN workflows w ON w.id = m.workflow_id
             WHERE w.id IS NULL",
            [],
            |row| row.get(0),
        )?;

        let orphaned_resources: i64 = conn.query_row(
            "SELECT COUNT(*) FROM workflow_resources r
             LEFT JOIN workflows w ON w.id = r.workflow_id
             WHERE w.id IS NULL",
            [],
            |row| row.get(0),
        )?;

        Ok(DatabaseHealth {
            foreign_keys_enabled: foreign_keys_enabled == 1,
            integrity_check,
            orphaned_steps: orphaned_steps.max(0) as u64,
            orphaned_messages: orphaned_messages.max(0) as u64,
            orphaned_resources: orphaned_resources.max(0) as u64,
            journal_mode,
            busy_timeout_ms,
        })
    }

    // ========================================================================
    // Row mappers
    // ========================================================================

    fn row_to_workflow(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowInstance> {
        let status_str: String = row.get(4)?;
        let context_str: String = row.get(11)?;

        Ok(WorkflowInstance {
            id: row.get(0)?,
            title: row.get(1)?,
            description: row.get(2)?,
            owner_id: row.get(3)?,
            status: status_str.parse().unwrap_or(WorkflowStatus::Running),
            progress: row.get(5)?,
            current_step: row.get(6)?,
            total_steps: row.get(7)?,
            started_at: parse_datetime_utc(&row.get::<_, String>(8)?)?,
            finished_at: parse_optional_datetime(row.get(9)?),
            last_activity_at: parse_datetime_utc(&row.get::<_, String>(10)?)?,
            context: serde_json::from_str(&context_str).unwrap_or(serde_json::Value::Null),
            error: row.get(12)?,
            deleted: row.get::<_, i64>(13)? != 0,
            deleted_at: parse_optional_datetime(row.get(14)?),
        })
    }

    fn row_to_step(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowStep> {
        let category_str: String = row.get(5)?;
        let kind_str: String = row.get(6)?;
        let status_str: String = row.get(7)?;
        let details_str: String = row.get(10)?;

        Ok(WorkflowStep {
            id: row.get(0)?,
            workflow_id: row.get(1)?,
            step_id: row.get(2)?,
            step_number: row.get(3)?,
            content: row.get(4)?,
            category: category_str.parse().unwrap_or_default(),
            resource_kind: kind_str.parse().unwrap_or_default(),
            status: status_str.parse().unwrap_or(StepStatus::Failed),
            started_at: parse_datetime_utc(&row.get::<_, String>(8)?)?,
            finished_at: parse_optional_datetime(row.get(9)?),
            execution_details: serde_json::from_str(&details_str)
                .unwrap_or(serde_json::Value::Null),
            results: string_vec_from_json(&row.get::<_, String>(11)?),
            urls: string_vec_from_json(&row.get::<_, String>(12)?),
            files: string_vec_from_json(&row.get::<_, String>(13)?),
            error: row.get(14)?,
        })
    }

    fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowMessage> {
        let kind_str: String = row.get(3)?;
        let status_str: Option<String> = row.get(5)?;
        let data_str: Option<String> = row.get(6)?;

        Ok(WorkflowMessage {
            id: row.get(0)?,
            workflow_id: row.get(1)?,
            message_id: row.get(2)?,
            kind: kind_str.parse().unwrap_or(MessageKind::System),
            content: row.get(4)?,
            status: status_str.and_then(|s| s.parse().ok()),
            data: data_str.and_then(|s| serde_json::from_str(&s).ok()),
            created_at: parse_datetime_utc(&row.get::<_, String>(7)?)?,
            updated_at: parse_datetime_utc(&row.get::<_, String>(8)?)?,
        })
    }

    fn row_to_resource(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowResource> {
        let type_str: String = row.get(4)?;
        let data_str: String = row.get(7)?;

        Ok(WorkflowResource {
            id: row.get(0)?,
            workflow_id: row.get(1)?,
            step_pk: row.get(2)?,
            source_step_id: row.get(3)?,
            resource_type: type_str.parse().unwrap_or(ResourceType::General),
            title: row.get(5)?,
            description: row.get(6)?,
            data: serde_json::from_str(&data_str).unwrap_or(serde_json::Value::Null),
            category: row.get(8)?,
        })
    }
}
