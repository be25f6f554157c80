#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use artifact_registry_core::{
    audit_history, check_transition, format_rfc3339, next_aid, next_linkage_aid, now_utc,
    parse_rfc3339_utc, AllowedTransitions, Artifact, ArtifactEvent, ArtifactEventType,
    ArtifactFilter, ArtifactPatch, ArtifactType, ExportDocument, HistoryAudit, LinkTargetType,
    Linkage, NewArtifact, NewLinkage, ProjectStatistics, RelationshipType, StatisticsCell, Status,
    TransitionData, TransitionOutcome, TransitionRequest, WorkflowError, EXPORT_FORMAT_VERSION,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use ulid::Ulid;

const REGISTRY_MIGRATION_VERSION: i64 = 1;

const SCHEMA_EVENTS_V1: &str = r"
CREATE TABLE IF NOT EXISTS artifact_events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  artifact_type TEXT NOT NULL CHECK (
    artifact_type IN ('vision', 'need', 'use_case', 'requirement')
  ),
  artifact_id TEXT NOT NULL,
  event_type TEXT NOT NULL CHECK (event_type IN ('status_transition')),
  from_status TEXT NOT NULL,
  to_status TEXT NOT NULL,
  rationale TEXT NOT NULL CHECK (length(trim(rationale)) > 0),
  timestamp TEXT NOT NULL,
  user_id TEXT,
  user_name TEXT,
  comment TEXT
);

CREATE TRIGGER IF NOT EXISTS trg_artifact_events_no_update
BEFORE UPDATE ON artifact_events
BEGIN
  SELECT RAISE(FAIL, 'artifact_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_artifact_events_no_delete
BEFORE DELETE ON artifact_events
BEGIN
  SELECT RAISE(FAIL, 'artifact_events is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_artifact_events_artifact_id
  ON artifact_events(artifact_type, artifact_id, id);

CREATE TABLE IF NOT EXISTS linkages (
  aid TEXT PRIMARY KEY,
  source_artifact_type TEXT NOT NULL,
  source_id TEXT NOT NULL,
  target_artifact_type TEXT NOT NULL,
  target_id TEXT NOT NULL,
  relationship_type TEXT NOT NULL CHECK (
    relationship_type IN (
      'derives_from',
      'satisfies',
      'refines',
      'verifies',
      'parent',
      'traces_to',
      'depends_on',
      'illustrated_by',
      'documented_in',
      'allocated_to',
      'related_to'
    )
  ),
  project_id TEXT NOT NULL,
  created_at TEXT NOT NULL,
  UNIQUE (source_artifact_type, source_id, target_artifact_type, target_id, relationship_type)
);

CREATE INDEX IF NOT EXISTS idx_linkages_source ON linkages(source_id);
CREATE INDEX IF NOT EXISTS idx_linkages_target ON linkages(target_id);
";

const ARTIFACT_COLUMNS: &str =
    "aid, artifact_key, project_id, area, title, description, status, created_at, updated_at";

const EVENT_COLUMNS: &str = "id, artifact_type, artifact_id, event_type, from_status, to_status,
     rationale, timestamp, user_id, user_name, comment";

const LINKAGE_COLUMNS: &str = "aid, source_artifact_type, source_id, target_artifact_type,
     target_id, relationship_type, project_id";

fn artifact_table_ddl(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
           aid TEXT PRIMARY KEY,
           artifact_key TEXT NOT NULL UNIQUE,
           project_id TEXT NOT NULL,
           area TEXT NOT NULL,
           title TEXT NOT NULL,
           description TEXT NOT NULL DEFAULT '',
           status TEXT NOT NULL DEFAULT 'Draft' CHECK (
             status IN (
               'Draft', 'Ready_for_Review', 'In_Review', 'Approved',
               'Rejected', 'Deferred', 'Superseded', 'Retired'
             )
           ),
           created_at TEXT NOT NULL,
           updated_at TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_{table}_project ON {table}(project_id, status);"
    )
}

/// Per-kind access to the status column. Every artifact kind exposes the
/// same capability, so the transition engine never branches on kind.
pub trait StatusRepository {
    fn current_status(&self, conn: &Connection, artifact_id: &str) -> Result<Option<Status>>;

    fn set_status(
        &self,
        conn: &Connection,
        artifact_id: &str,
        status: Status,
        at: OffsetDateTime,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct ArtifactTable {
    artifact_type: ArtifactType,
    table: &'static str,
}

static ARTIFACT_TABLES: [ArtifactTable; 4] = [
    ArtifactTable {
        artifact_type: ArtifactType::Vision,
        table: "visions",
    },
    ArtifactTable {
        artifact_type: ArtifactType::Need,
        table: "needs",
    },
    ArtifactTable {
        artifact_type: ArtifactType::UseCase,
        table: "use_cases",
    },
    ArtifactTable {
        artifact_type: ArtifactType::Requirement,
        table: "requirements",
    },
];

#[must_use]
pub fn repository_for(artifact_type: ArtifactType) -> &'static ArtifactTable {
    match artifact_type {
        ArtifactType::Vision => &ARTIFACT_TABLES[0],
        ArtifactType::Need => &ARTIFACT_TABLES[1],
        ArtifactType::UseCase => &ARTIFACT_TABLES[2],
        ArtifactType::Requirement => &ARTIFACT_TABLES[3],
    }
}

impl ArtifactTable {
    fn get(&self, conn: &Connection, aid: &str) -> Result<Option<Artifact>> {
        let artifact_type = self.artifact_type;
        conn.query_row(
            &format!("SELECT {ARTIFACT_COLUMNS} FROM {} WHERE aid = ?1", self.table),
            params![aid],
            |row| parse_artifact_row(row, artifact_type),
        )
        .optional()
        .with_context(|| format!("failed to load {artifact_type} {aid}"))
    }

    fn require(&self, conn: &Connection, aid: &str) -> Result<Artifact> {
        self.get(conn, aid)?
            .ok_or_else(|| WorkflowError::not_found(self.artifact_type, aid).into())
    }

    fn exists(&self, conn: &Connection, aid: &str) -> Result<bool> {
        let found: Option<i64> = conn
            .query_row(
                &format!("SELECT 1 FROM {} WHERE aid = ?1", self.table),
                params![aid],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to look up {} {aid}", self.artifact_type))?;
        Ok(found.is_some())
    }

    fn insert(&self, conn: &Connection, artifact: &Artifact) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT INTO {}({ARTIFACT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                self.table
            ),
            params![
                artifact.aid,
                artifact.key.to_string(),
                artifact.project_id,
                artifact.area,
                artifact.title,
                artifact.description,
                artifact.status.as_str(),
                format_rfc3339(artifact.created_at)?,
                format_rfc3339(artifact.updated_at)?,
            ],
        )
        .with_context(|| format!("failed to insert {} {}", self.artifact_type, artifact.aid))?;
        Ok(())
    }

    /// Aids ever issued under `prefix`. Deleted artifacts keep their history,
    /// so their aids still count and are never handed out again.
    fn aids_with_prefix(&self, conn: &Connection, prefix: &str) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT aid FROM {} WHERE substr(aid, 1, length(?1)) = ?1
             UNION
             SELECT artifact_id FROM artifact_events
             WHERE artifact_type = ?2 AND substr(artifact_id, 1, length(?1)) = ?1",
            self.table
        ))?;
        let rows = stmt.query_map(params![prefix, self.artifact_type.as_str()], |row| {
            row.get::<_, String>(0)
        })?;
        collect_rows(rows)
    }
}

impl StatusRepository for ArtifactTable {
    fn current_status(&self, conn: &Connection, artifact_id: &str) -> Result<Option<Status>> {
        conn.query_row(
            &format!("SELECT status FROM {} WHERE aid = ?1", self.table),
            params![artifact_id],
            |row| {
                let raw: String = row.get(0)?;
                Status::parse(&raw).ok_or_else(|| {
                    conversion_error(0, rusqlite::types::Type::Text, format!("invalid status: {raw}"))
                })
            },
        )
        .optional()
        .with_context(|| format!("failed to read status of {} {artifact_id}", self.artifact_type))
    }

    fn set_status(
        &self,
        conn: &Connection,
        artifact_id: &str,
        status: Status,
        at: OffsetDateTime,
    ) -> Result<()> {
        let changed = conn
            .execute(
                &format!(
                    "UPDATE {} SET status = ?1, updated_at = ?2 WHERE aid = ?3",
                    self.table
                ),
                params![status.as_str(), format_rfc3339(at)?, artifact_id],
            )
            .with_context(|| {
                format!("failed to update status of {} {artifact_id}", self.artifact_type)
            })?;
        if changed != 1 {
            return Err(WorkflowError::not_found(self.artifact_type, artifact_id).into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub migration_version: Option<i64>,
    pub expected_version: i64,
    pub up_to_date: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ImportReport {
    pub project_id: String,
    pub artifacts: usize,
    pub linkages: usize,
    pub events: usize,
}

pub struct SqliteRegistryStore {
    conn: Connection,
}

impl SqliteRegistryStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        for table in &ARTIFACT_TABLES {
            self.conn
                .execute_batch(&artifact_table_ddl(table.table))
                .with_context(|| format!("failed to apply {} schema", table.table))?;
        }

        self.conn
            .execute_batch(SCHEMA_EVENTS_V1)
            .context("failed to apply artifact event schema")?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![REGISTRY_MIGRATION_VERSION, now],
            )
            .context("failed to register registry schema migration")?;

        debug!(version = REGISTRY_MIGRATION_VERSION, "registry schema migrated");
        Ok(())
    }

    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let has_table: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations'",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("failed to inspect sqlite_master")?;

        let migration_version = if has_table.is_some() {
            self.conn
                .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                    row.get::<_, Option<i64>>(0)
                })
                .context("failed to read schema_migrations")?
        } else {
            None
        };

        Ok(SchemaStatus {
            migration_version,
            expected_version: REGISTRY_MIGRATION_VERSION,
            up_to_date: migration_version == Some(REGISTRY_MIGRATION_VERSION),
        })
    }

    /// Applies one status transition.
    ///
    /// Read, compare, status write and event append share one IMMEDIATE
    /// transaction, so a concurrent writer holding a stale `from_status`
    /// waits for the lock, then observes the new status and fails with
    /// [`WorkflowError::Conflict`].
    pub fn transition(&mut self, request: &TransitionRequest) -> Result<TransitionOutcome> {
        request.validate()?;

        let repository = repository_for(request.artifact_type);
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transition transaction")?;

        let current = repository
            .current_status(&tx, &request.artifact_id)?
            .ok_or_else(|| WorkflowError::not_found(request.artifact_type, &request.artifact_id))?;

        if let Err(err) = check_transition(request.from_status, current, request.to_status) {
            warn!(
                artifact_type = %request.artifact_type,
                artifact_id = %request.artifact_id,
                from = %request.from_status,
                to = %request.to_status,
                current = %current,
                "transition rejected: {err}"
            );
            return Err(err.into());
        }

        let timestamp = match last_event_timestamp(&tx, request.artifact_type, &request.artifact_id)? {
            Some(last) if last > now_utc() => last,
            _ => now_utc(),
        };

        repository.set_status(&tx, &request.artifact_id, request.to_status, timestamp)?;

        tx.execute(
            "INSERT INTO artifact_events(
                artifact_type, artifact_id, event_type, from_status, to_status,
                rationale, timestamp, user_id, user_name, comment
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                request.artifact_type.as_str(),
                request.artifact_id,
                ArtifactEventType::StatusTransition.as_str(),
                current.as_str(),
                request.to_status.as_str(),
                request.rationale,
                format_rfc3339(timestamp)?,
                request.actor.user_id,
                request.actor.user_name,
                request.comment,
            ],
        )
        .context("failed to append status transition event")?;

        let event_id = tx.last_insert_rowid();
        tx.commit().context("failed to commit transition transaction")?;

        info!(
            artifact_type = %request.artifact_type,
            artifact_id = %request.artifact_id,
            from = %current,
            to = %request.to_status,
            event_id,
            "status transition recorded"
        );

        Ok(TransitionOutcome {
            status: request.to_status,
            event: ArtifactEvent {
                id: event_id,
                artifact_type: request.artifact_type,
                artifact_id: request.artifact_id.clone(),
                event_type: ArtifactEventType::StatusTransition,
                event_data: TransitionData {
                    from: current,
                    to: request.to_status,
                    rationale: request.rationale.clone(),
                },
                timestamp,
                user_id: request.actor.user_id.clone(),
                user_name: request.actor.user_name.clone(),
                comment: request.comment.clone(),
            },
        })
    }

    /// Events for one artifact, oldest first.
    pub fn history(&self, artifact_type: ArtifactType, artifact_id: &str) -> Result<Vec<ArtifactEvent>> {
        if !repository_for(artifact_type).exists(&self.conn, artifact_id)? {
            return Err(WorkflowError::not_found(artifact_type, artifact_id).into());
        }
        list_events(&self.conn, artifact_type, artifact_id)
    }

    pub fn allowed_transitions(
        &self,
        artifact_type: ArtifactType,
        artifact_id: &str,
    ) -> Result<AllowedTransitions> {
        let current = repository_for(artifact_type)
            .current_status(&self.conn, artifact_id)?
            .ok_or_else(|| WorkflowError::not_found(artifact_type, artifact_id))?;
        Ok(AllowedTransitions::for_status(artifact_type, artifact_id, current))
    }

    /// Replays the stored history and compares it with the persisted status.
    pub fn audit_history(&self, artifact_type: ArtifactType, artifact_id: &str) -> Result<HistoryAudit> {
        let persisted = repository_for(artifact_type)
            .current_status(&self.conn, artifact_id)?
            .ok_or_else(|| WorkflowError::not_found(artifact_type, artifact_id))?;
        let events = list_events(&self.conn, artifact_type, artifact_id)?;
        let audit = audit_history(artifact_type, artifact_id, persisted, &events);
        if !audit.consistent {
            warn!(
                artifact_type = %artifact_type,
                artifact_id,
                issues = audit.issues.len(),
                "history audit found inconsistencies"
            );
        }
        Ok(audit)
    }

    pub fn create_artifact(&mut self, artifact_type: ArtifactType, input: &NewArtifact) -> Result<Artifact> {
        input.validate(artifact_type)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start artifact transaction")?;

        let source_id = input
            .source_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let parent = match (artifact_type.parent(), source_id) {
            (Some(parent_type), Some(source_id)) => {
                let parent = repository_for(parent_type).require(&tx, source_id)?;
                if parent.project_id != input.project_id.trim() {
                    return Err(WorkflowError::Validation(format!(
                        "parent {} belongs to project {}, not {}",
                        parent.aid,
                        parent.project_id,
                        input.project_id.trim()
                    ))
                    .into());
                }
                Some(parent)
            }
            _ => None,
        };

        let table = repository_for(artifact_type);
        let prefix = artifact_registry_core::aid_prefix(&input.project_id, &input.area, artifact_type);
        let existing = table.aids_with_prefix(&tx, &prefix)?;
        let aid = next_aid(&prefix, existing.iter().map(String::as_str));

        let now = now_utc();
        let artifact = Artifact {
            aid,
            key: Ulid::new(),
            artifact_type,
            project_id: input.project_id.trim().to_string(),
            area: input.area.trim().to_uppercase(),
            title: input.title.trim().to_string(),
            description: input.description.clone(),
            status: Status::Draft,
            created_at: now,
            updated_at: now,
        };
        table.insert(&tx, &artifact)?;

        if let Some(parent) = parent {
            let link_aid = next_linkage_aid_in(&tx)?;
            insert_linkage(
                &tx,
                &Linkage {
                    aid: link_aid,
                    source_artifact_type: artifact_type,
                    source_id: artifact.aid.clone(),
                    target_artifact_type: LinkTargetType::from(parent.artifact_type),
                    target_id: parent.aid.clone(),
                    relationship_type: RelationshipType::DerivesFrom,
                    project_id: artifact.project_id.clone(),
                },
                now,
            )?;
        }

        tx.commit().context("failed to commit artifact transaction")?;
        info!(artifact_type = %artifact_type, aid = %artifact.aid, "artifact created");
        Ok(artifact)
    }

    pub fn get_artifact(&self, artifact_type: ArtifactType, aid: &str) -> Result<Artifact> {
        repository_for(artifact_type).require(&self.conn, aid)
    }

    pub fn list_artifacts(&self, artifact_type: ArtifactType, filter: &ArtifactFilter) -> Result<Vec<Artifact>> {
        let table = repository_for(artifact_type);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ARTIFACT_COLUMNS} FROM {}
             WHERE (?1 IS NULL OR project_id = ?1)
               AND (?2 IS NULL OR status = ?2)
               AND (?3 IS NULL OR upper(area) = upper(?3))
             ORDER BY aid ASC",
            table.table
        ))?;
        let rows = stmt.query_map(
            params![
                filter.project_id,
                filter.status.map(Status::as_str),
                filter.area
            ],
            |row| parse_artifact_row(row, artifact_type),
        )?;
        collect_rows(rows)
    }

    /// Edits descriptive fields. Status only changes through [`Self::transition`].
    pub fn update_artifact(
        &mut self,
        artifact_type: ArtifactType,
        aid: &str,
        patch: &ArtifactPatch,
    ) -> Result<Artifact> {
        patch.validate()?;
        let table = repository_for(artifact_type);
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start artifact update transaction")?;

        let mut artifact = table.require(&tx, aid)?;
        if let Some(title) = &patch.title {
            artifact.title = title.trim().to_string();
        }
        if let Some(description) = &patch.description {
            artifact.description.clone_from(description);
        }
        if let Some(area) = &patch.area {
            artifact.area = area.trim().to_uppercase();
        }
        artifact.updated_at = now_utc();

        tx.execute(
            &format!(
                "UPDATE {} SET title = ?1, description = ?2, area = ?3, updated_at = ?4 WHERE aid = ?5",
                table.table
            ),
            params![
                artifact.title,
                artifact.description,
                artifact.area,
                format_rfc3339(artifact.updated_at)?,
                aid
            ],
        )
        .with_context(|| format!("failed to update {artifact_type} {aid}"))?;
        tx.commit().context("failed to commit artifact update")?;

        debug!(artifact_type = %artifact_type, aid, "artifact updated");
        Ok(artifact)
    }

    /// Removes the artifact and every linkage touching it. History rows stay.
    pub fn delete_artifact(&mut self, artifact_type: ArtifactType, aid: &str) -> Result<()> {
        let table = repository_for(artifact_type);
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start artifact delete transaction")?;

        let removed_links = tx
            .execute(
                "DELETE FROM linkages
                 WHERE (source_artifact_type = ?1 AND source_id = ?2)
                    OR (target_artifact_type = ?1 AND target_id = ?2)",
                params![artifact_type.as_str(), aid],
            )
            .context("failed to delete artifact linkages")?;

        let removed = tx
            .execute(&format!("DELETE FROM {} WHERE aid = ?1", table.table), params![aid])
            .with_context(|| format!("failed to delete {artifact_type} {aid}"))?;
        if removed == 0 {
            return Err(WorkflowError::not_found(artifact_type, aid).into());
        }

        tx.commit().context("failed to commit artifact delete")?;
        info!(artifact_type = %artifact_type, aid, removed_links, "artifact deleted");
        Ok(())
    }

    pub fn create_linkage(&mut self, input: &NewLinkage) -> Result<Linkage> {
        input.validate()?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start linkage transaction")?;

        let source = repository_for(input.source_artifact_type).require(&tx, input.source_id.trim())?;
        if let Some(target_type) = input.target_artifact_type.artifact_type() {
            if !repository_for(target_type).exists(&tx, input.target_id.trim())? {
                return Err(WorkflowError::not_found(target_type, input.target_id.trim()).into());
            }
        }

        let duplicate: Option<String> = tx
            .query_row(
                "SELECT aid FROM linkages
                 WHERE source_artifact_type = ?1 AND source_id = ?2
                   AND target_artifact_type = ?3 AND target_id = ?4
                   AND relationship_type = ?5",
                params![
                    input.source_artifact_type.as_str(),
                    source.aid,
                    input.target_artifact_type.as_str(),
                    input.target_id.trim(),
                    input.relationship_type.as_str(),
                ],
                |row| row.get(0),
            )
            .optional()
            .context("failed to check for duplicate linkage")?;
        if let Some(existing) = duplicate {
            return Err(WorkflowError::AlreadyExists {
                kind: "linkage".to_string(),
                id: existing,
            }
            .into());
        }

        let linkage = Linkage {
            aid: next_linkage_aid_in(&tx)?,
            source_artifact_type: input.source_artifact_type,
            source_id: source.aid.clone(),
            target_artifact_type: input.target_artifact_type,
            target_id: input.target_id.trim().to_string(),
            relationship_type: input.relationship_type,
            project_id: input
                .project_id
                .clone()
                .unwrap_or_else(|| source.project_id.clone()),
        };
        insert_linkage(&tx, &linkage, now_utc())?;
        tx.commit().context("failed to commit linkage transaction")?;

        info!(
            aid = %linkage.aid,
            source = %linkage.source_id,
            target = %linkage.target_id,
            relationship = linkage.relationship_type.as_str(),
            "linkage created"
        );
        Ok(linkage)
    }

    pub fn linkages_from(&self, source_id: &str) -> Result<Vec<Linkage>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LINKAGE_COLUMNS} FROM linkages WHERE source_id = ?1 ORDER BY aid ASC"
        ))?;
        let rows = stmt.query_map(params![source_id], parse_linkage_row)?;
        collect_rows(rows)
    }

    pub fn linkages_to(&self, target_id: &str) -> Result<Vec<Linkage>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LINKAGE_COLUMNS} FROM linkages WHERE target_id = ?1 ORDER BY aid ASC"
        ))?;
        let rows = stmt.query_map(params![target_id], parse_linkage_row)?;
        collect_rows(rows)
    }

    pub fn delete_linkage(&mut self, link_aid: &str) -> Result<()> {
        let removed = self
            .conn
            .execute("DELETE FROM linkages WHERE aid = ?1", params![link_aid])
            .with_context(|| format!("failed to delete linkage {link_aid}"))?;
        if removed == 0 {
            return Err(WorkflowError::not_found("linkage", link_aid).into());
        }
        info!(aid = link_aid, "linkage deleted");
        Ok(())
    }

    /// Counts the project's artifacts per kind, area and status.
    pub fn project_statistics(&self, project_id: &str) -> Result<ProjectStatistics> {
        let mut cells = Vec::new();
        for table in &ARTIFACT_TABLES {
            let artifact_type = table.artifact_type;
            let mut stmt = self.conn.prepare(&format!(
                "SELECT area, status, COUNT(*) FROM {}
                 WHERE project_id = ?1
                 GROUP BY area, status",
                table.table
            ))?;
            let rows = stmt.query_map(params![project_id], |row| {
                let count: i64 = row.get(2)?;
                Ok(StatisticsCell {
                    artifact_type,
                    area: row.get(0)?,
                    status: parse_text_column(row, 1, "status", Status::parse)?,
                    count: usize::try_from(count).unwrap_or_default(),
                })
            })?;
            cells.extend(collect_rows(rows)?);
        }
        Ok(ProjectStatistics::from_cells(project_id, cells))
    }

    pub fn export_project(&self, project_id: &str) -> Result<ExportDocument> {
        let filter = ArtifactFilter {
            project_id: Some(project_id.to_string()),
            ..ArtifactFilter::default()
        };

        let mut artifacts = Vec::new();
        let mut events = Vec::new();
        for artifact_type in ArtifactType::ALL {
            for artifact in self.list_artifacts(artifact_type, &filter)? {
                events.extend(list_events(&self.conn, artifact_type, &artifact.aid)?);
                artifacts.push(artifact);
            }
        }
        events.sort_by_key(|event| event.id);

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LINKAGE_COLUMNS} FROM linkages WHERE project_id = ?1 ORDER BY aid ASC"
        ))?;
        let rows = stmt.query_map(params![project_id], parse_linkage_row)?;
        let linkages = collect_rows(rows)?;

        info!(
            project_id,
            artifacts = artifacts.len(),
            linkages = linkages.len(),
            events = events.len(),
            "project exported"
        );

        Ok(ExportDocument {
            format_version: EXPORT_FORMAT_VERSION.to_string(),
            project_id: project_id.to_string(),
            exported_at: now_utc(),
            artifacts,
            linkages,
            events,
        })
    }

    /// Loads an export document. Either every row lands or none does; an aid
    /// that already exists (or already has history) aborts the whole import.
    pub fn import_document(&mut self, document: &ExportDocument) -> Result<ImportReport> {
        document.validate()?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start import transaction")?;

        for artifact in &document.artifacts {
            let table = repository_for(artifact.artifact_type);
            if table.exists(&tx, &artifact.aid)?
                || last_event_timestamp(&tx, artifact.artifact_type, &artifact.aid)?.is_some()
            {
                return Err(WorkflowError::AlreadyExists {
                    kind: artifact.artifact_type.to_string(),
                    id: artifact.aid.clone(),
                }
                .into());
            }
            table.insert(&tx, artifact)?;
        }

        let imported_at = now_utc();
        for linkage in &document.linkages {
            let existing: Option<i64> = tx
                .query_row("SELECT 1 FROM linkages WHERE aid = ?1", params![linkage.aid], |row| {
                    row.get(0)
                })
                .optional()
                .context("failed to look up linkage aid")?;
            if existing.is_some() {
                return Err(WorkflowError::AlreadyExists {
                    kind: "linkage".to_string(),
                    id: linkage.aid.clone(),
                }
                .into());
            }
            // Document artifacts are already inserted, so one lookup covers
            // endpoints from the document and from the store.
            let endpoints = std::iter::once((Some(linkage.source_artifact_type), &linkage.source_id))
                .chain(std::iter::once((
                    linkage.target_artifact_type.artifact_type(),
                    &linkage.target_id,
                )));
            for (endpoint_type, endpoint_id) in endpoints {
                let Some(endpoint_type) = endpoint_type else {
                    continue;
                };
                if !repository_for(endpoint_type).exists(&tx, endpoint_id)? {
                    return Err(WorkflowError::Validation(format!(
                        "linkage {} references missing {endpoint_type} {endpoint_id}",
                        linkage.aid
                    ))
                    .into());
                }
            }
            insert_linkage(&tx, linkage, imported_at)?;
        }

        let mut events: Vec<&ArtifactEvent> = document.events.iter().collect();
        events.sort_by_key(|event| event.id);
        for event in &events {
            tx.execute(
                "INSERT INTO artifact_events(
                    artifact_type, artifact_id, event_type, from_status, to_status,
                    rationale, timestamp, user_id, user_name, comment
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    event.artifact_type.as_str(),
                    event.artifact_id,
                    event.event_type.as_str(),
                    event.event_data.from.as_str(),
                    event.event_data.to.as_str(),
                    event.event_data.rationale,
                    format_rfc3339(event.timestamp)?,
                    event.user_id,
                    event.user_name,
                    event.comment,
                ],
            )
            .context("failed to import history event")?;
        }

        tx.commit().context("failed to commit import transaction")?;

        let report = ImportReport {
            project_id: document.project_id.clone(),
            artifacts: document.artifacts.len(),
            linkages: document.linkages.len(),
            events: events.len(),
        };
        info!(
            project_id = %report.project_id,
            artifacts = report.artifacts,
            linkages = report.linkages,
            events = report.events,
            "project imported"
        );
        Ok(report)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Returns the domain error carried by `err`, if any.
#[must_use]
pub fn workflow_error(err: &anyhow::Error) -> Option<&WorkflowError> {
    err.downcast_ref::<WorkflowError>()
}

fn list_events(conn: &Connection, artifact_type: ArtifactType, artifact_id: &str) -> Result<Vec<ArtifactEvent>> {
    // Ids are assigned at append under the write lock, so id order is
    // append order even when timestamps tie.
    let mut stmt = conn.prepare(&format!(
        "SELECT {EVENT_COLUMNS} FROM artifact_events
         WHERE artifact_type = ?1 AND artifact_id = ?2
         ORDER BY id ASC"
    ))?;
    let rows = stmt.query_map(params![artifact_type.as_str(), artifact_id], parse_event_row)?;
    collect_rows(rows)
}

fn last_event_timestamp(
    conn: &Connection,
    artifact_type: ArtifactType,
    artifact_id: &str,
) -> Result<Option<OffsetDateTime>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT timestamp FROM artifact_events
             WHERE artifact_type = ?1 AND artifact_id = ?2
             ORDER BY id DESC LIMIT 1",
            params![artifact_type.as_str(), artifact_id],
            |row| row.get(0),
        )
        .optional()
        .context("failed to read last event timestamp")?;
    raw.map(|value| parse_rfc3339_utc(&value).map_err(|err| anyhow!(err)))
        .transpose()
}

fn next_linkage_aid_in(conn: &Connection) -> Result<String> {
    let mut stmt = conn.prepare("SELECT aid FROM linkages WHERE aid LIKE 'LINK-%'")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let existing = collect_rows(rows)?;
    Ok(next_linkage_aid(existing.iter().map(String::as_str)))
}

fn insert_linkage(conn: &Connection, linkage: &Linkage, created_at: OffsetDateTime) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO linkages({LINKAGE_COLUMNS}, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
        ),
        params![
            linkage.aid,
            linkage.source_artifact_type.as_str(),
            linkage.source_id,
            linkage.target_artifact_type.as_str(),
            linkage.target_id,
            linkage.relationship_type.as_str(),
            linkage.project_id,
            format_rfc3339(created_at)?,
        ],
    )
    .with_context(|| format!("failed to insert linkage {}", linkage.aid))?;
    Ok(())
}

fn conversion_error(index: usize, ty: rusqlite::types::Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        ty,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_text_column<T>(
    row: &rusqlite::Row<'_>,
    index: usize,
    name: &str,
    parse: impl FnOnce(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(index)?;
    parse(&raw).ok_or_else(|| {
        conversion_error(index, rusqlite::types::Type::Text, format!("invalid {name}: {raw}"))
    })
}

fn parse_timestamp_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<OffsetDateTime> {
    let raw: String = row.get(index)?;
    parse_rfc3339_utc(&raw)
        .map_err(|err| conversion_error(index, rusqlite::types::Type::Text, err.to_string()))
}

fn parse_artifact_row(row: &rusqlite::Row<'_>, artifact_type: ArtifactType) -> rusqlite::Result<Artifact> {
    let key_raw: String = row.get(1)?;
    let key = Ulid::from_string(&key_raw).map_err(|err| {
        conversion_error(1, rusqlite::types::Type::Text, format!("invalid artifact_key: {err}"))
    })?;

    Ok(Artifact {
        aid: row.get(0)?,
        key,
        artifact_type,
        project_id: row.get(2)?,
        area: row.get(3)?,
        title: row.get(4)?,
        description: row.get(5)?,
        status: parse_text_column(row, 6, "status", Status::parse)?,
        created_at: parse_timestamp_column(row, 7)?,
        updated_at: parse_timestamp_column(row, 8)?,
    })
}

fn parse_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ArtifactEvent> {
    Ok(ArtifactEvent {
        id: row.get(0)?,
        artifact_type: parse_text_column(row, 1, "artifact_type", ArtifactType::parse)?,
        artifact_id: row.get(2)?,
        event_type: parse_text_column(row, 3, "event_type", ArtifactEventType::parse)?,
        event_data: TransitionData {
            from: parse_text_column(row, 4, "from_status", Status::parse)?,
            to: parse_text_column(row, 5, "to_status", Status::parse)?,
            rationale: row.get(6)?,
        },
        timestamp: parse_timestamp_column(row, 7)?,
        user_id: row.get(8)?,
        user_name: row.get(9)?,
        comment: row.get(10)?,
    })
}

fn parse_linkage_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Linkage> {
    Ok(Linkage {
        aid: row.get(0)?,
        source_artifact_type: parse_text_column(row, 1, "source_artifact_type", ArtifactType::parse)?,
        source_id: row.get(2)?,
        target_artifact_type: parse_text_column(row, 3, "target_artifact_type", LinkTargetType::parse)?,
        target_id: row.get(4)?,
        relationship_type: parse_text_column(row, 5, "relationship_type", RelationshipType::parse)?,
        project_id: row.get(6)?,
    })
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
