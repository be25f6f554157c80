//! Domain model and workflow rules for the artifact registry.
//!
//! Everything in this crate is pure: persistence lives in
//! `artifact-registry-store-sqlite`, which calls [`check_transition`] inside
//! its write transaction and [`replay_status`] when auditing a history.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub mod ears;

pub const SYSTEM_ACTOR_ID: &str = "system";
pub const SYSTEM_ACTOR_NAME: &str = "System";
pub const EXPORT_FORMAT_VERSION: &str = "artifact_export.v1";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum WorkflowError {
    #[error("{kind} {id} not found")]
    NotFound { kind: String, id: String },
    #[error("status conflict: expected current status {expected}, found {actual}")]
    Conflict { expected: Status, actual: Status },
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        from: Status,
        to: Status,
        allowed: Vec<Status>,
    },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: String, id: String },
    #[error("history replay error: {0}")]
    Replay(String),
}

impl WorkflowError {
    #[must_use]
    pub fn not_found(kind: impl Display, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.to_string(),
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Status {
    #[serde(rename = "Draft")]
    Draft,
    #[serde(rename = "Ready_for_Review")]
    ReadyForReview,
    #[serde(rename = "In_Review")]
    InReview,
    #[serde(rename = "Approved")]
    Approved,
    #[serde(rename = "Rejected")]
    Rejected,
    #[serde(rename = "Deferred")]
    Deferred,
    #[serde(rename = "Superseded")]
    Superseded,
    #[serde(rename = "Retired")]
    Retired,
}

impl Status {
    pub const ALL: [Self; 8] = [
        Self::Draft,
        Self::ReadyForReview,
        Self::InReview,
        Self::Approved,
        Self::Rejected,
        Self::Deferred,
        Self::Superseded,
        Self::Retired,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "Draft",
            Self::ReadyForReview => "Ready_for_Review",
            Self::InReview => "In_Review",
            Self::Approved => "Approved",
            Self::Rejected => "Rejected",
            Self::Deferred => "Deferred",
            Self::Superseded => "Superseded",
            Self::Retired => "Retired",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Draft" => Some(Self::Draft),
            "Ready_for_Review" => Some(Self::ReadyForReview),
            "In_Review" => Some(Self::InReview),
            "Approved" => Some(Self::Approved),
            "Rejected" => Some(Self::Rejected),
            "Deferred" => Some(Self::Deferred),
            "Superseded" => Some(Self::Superseded),
            "Retired" => Some(Self::Retired),
            _ => None,
        }
    }

    /// Targets reachable from `self` in one step.
    #[must_use]
    pub fn allowed_targets(self) -> &'static [Status] {
        match self {
            Self::Draft => &[Self::ReadyForReview],
            Self::ReadyForReview => &[Self::InReview, Self::Draft],
            Self::InReview => &[Self::Approved, Self::Rejected, Self::Deferred, Self::Draft],
            Self::Approved => &[Self::Superseded, Self::Retired, Self::Draft],
            Self::Deferred => &[Self::InReview, Self::Draft],
            Self::Rejected => &[Self::Draft],
            Self::Superseded | Self::Retired => &[],
        }
    }

    #[must_use]
    pub fn can_transition_to(self, target: Status) -> bool {
        self.allowed_targets().contains(&target)
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        self.allowed_targets().is_empty()
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Vision,
    Need,
    UseCase,
    Requirement,
}

impl ArtifactType {
    pub const ALL: [Self; 4] = [Self::Vision, Self::Need, Self::UseCase, Self::Requirement];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vision => "vision",
            Self::Need => "need",
            Self::UseCase => "use_case",
            Self::Requirement => "requirement",
        }
    }

    /// Parses the routing key; matching is case-insensitive.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "vision" => Some(Self::Vision),
            "need" => Some(Self::Need),
            "use_case" => Some(Self::UseCase),
            "requirement" => Some(Self::Requirement),
            _ => None,
        }
    }

    /// Short code embedded in the aid.
    #[must_use]
    pub fn aid_code(self) -> &'static str {
        match self {
            Self::Vision => "VISION",
            Self::Need => "NEED",
            Self::UseCase => "UC",
            Self::Requirement => "REQ",
        }
    }

    /// The artifact kind a new artifact of this kind must derive from.
    #[must_use]
    pub fn parent(self) -> Option<Self> {
        match self {
            Self::Vision => None,
            Self::Need => Some(Self::Vision),
            Self::UseCase => Some(Self::Need),
            Self::Requirement => Some(Self::UseCase),
        }
    }
}

impl Display for ArtifactType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Actor {
    pub user_id: Option<String>,
    pub user_name: Option<String>,
}

impl Actor {
    #[must_use]
    pub fn system() -> Self {
        Self {
            user_id: Some(SYSTEM_ACTOR_ID.to_string()),
            user_name: Some(SYSTEM_ACTOR_NAME.to_string()),
        }
    }

    /// Builds an actor from optional identity fields, falling back to the
    /// system actor when neither is present.
    #[must_use]
    pub fn resolve(user_id: Option<String>, user_name: Option<String>) -> Self {
        let user_id = non_blank(user_id);
        let user_name = non_blank(user_name);
        if user_id.is_none() && user_name.is_none() {
            return Self::system();
        }
        Self { user_id, user_name }
    }
}

impl Default for Actor {
    fn default() -> Self {
        Self::system()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TransitionRequest {
    pub artifact_type: ArtifactType,
    pub artifact_id: String,
    pub from_status: Status,
    pub to_status: Status,
    pub rationale: String,
    pub comment: Option<String>,
    pub actor: Actor,
}

impl TransitionRequest {
    /// Checks the request fields that do not depend on persisted state.
    ///
    /// # Errors
    /// Returns [`WorkflowError::Validation`] when the artifact id or the
    /// rationale is blank.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.artifact_id.trim().is_empty() {
            return Err(WorkflowError::Validation(
                "artifact_id MUST be provided".to_string(),
            ));
        }

        if self.rationale.trim().is_empty() {
            return Err(WorkflowError::Validation(
                "rationale MUST be provided for every transition".to_string(),
            ));
        }

        Ok(())
    }
}

/// Decides whether a transition requested against `expected` may be applied
/// to an artifact whose persisted status is `actual`.
///
/// # Errors
/// Returns [`WorkflowError::Conflict`] when `expected` is stale and
/// [`WorkflowError::InvalidTransition`] (with the allowed targets of `actual`)
/// when `to` is not reachable.
pub fn check_transition(expected: Status, actual: Status, to: Status) -> Result<(), WorkflowError> {
    if expected != actual {
        return Err(WorkflowError::Conflict { expected, actual });
    }

    if !actual.can_transition_to(to) {
        return Err(WorkflowError::InvalidTransition {
            from: actual,
            to,
            allowed: actual.allowed_targets().to_vec(),
        });
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactEventType {
    StatusTransition,
}

impl ArtifactEventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StatusTransition => "status_transition",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "status_transition" => Some(Self::StatusTransition),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TransitionData {
    pub from: Status,
    pub to: Status,
    pub rationale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ArtifactEvent {
    pub id: i64,
    pub artifact_type: ArtifactType,
    pub artifact_id: String,
    pub event_type: ArtifactEventType,
    pub event_data: TransitionData,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TransitionOutcome {
    pub status: Status,
    pub event: ArtifactEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AllowedTransitions {
    pub artifact_type: ArtifactType,
    pub artifact_id: String,
    pub current_status: Status,
    pub allowed: Vec<Status>,
    pub terminal: bool,
}

impl AllowedTransitions {
    #[must_use]
    pub fn for_status(artifact_type: ArtifactType, artifact_id: &str, current: Status) -> Self {
        Self {
            artifact_type,
            artifact_id: artifact_id.to_string(),
            current_status: current,
            allowed: current.allowed_targets().to_vec(),
            terminal: current.is_terminal(),
        }
    }
}

/// Folds an artifact's history into the status it must currently hold.
///
/// An empty history yields [`Status::Draft`].
///
/// # Errors
/// Returns [`WorkflowError::Replay`] when the stream mixes artifacts, is out
/// of order, breaks the from/to chain, carries a blank rationale, or takes an
/// edge the transition graph does not allow.
pub fn replay_status(events: &[ArtifactEvent]) -> Result<Status, WorkflowError> {
    let mut status = Status::Draft;
    let Some(first) = events.first() else {
        return Ok(status);
    };

    let mut prev: Option<&ArtifactEvent> = None;
    for (index, event) in events.iter().enumerate() {
        let position = index + 1;
        if event.artifact_type != first.artifact_type || event.artifact_id != first.artifact_id {
            return Err(WorkflowError::Replay(
                "history MUST belong to a single artifact".to_string(),
            ));
        }

        if let Some(previous) = prev {
            if event.id <= previous.id {
                return Err(WorkflowError::Replay(format!(
                    "event {position}: id MUST be strictly increasing"
                )));
            }
            if event.timestamp < previous.timestamp {
                return Err(WorkflowError::Replay(format!(
                    "event {position}: timestamp moves backwards"
                )));
            }
        }

        if event.event_data.rationale.trim().is_empty() {
            return Err(WorkflowError::Replay(format!(
                "event {position}: rationale is empty"
            )));
        }

        if event.event_data.from != status {
            return Err(WorkflowError::Replay(format!(
                "event {position}: from={} does not match replayed status {status}",
                event.event_data.from
            )));
        }

        if !status.can_transition_to(event.event_data.to) {
            return Err(WorkflowError::Replay(format!(
                "event {position}: {status} -> {} is not an allowed transition",
                event.event_data.to
            )));
        }

        status = event.event_data.to;
        prev = Some(event);
    }

    Ok(status)
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HistoryAudit {
    pub artifact_type: ArtifactType,
    pub artifact_id: String,
    pub persisted_status: Status,
    pub replayed_status: Option<Status>,
    pub event_count: usize,
    pub consistent: bool,
    pub issues: Vec<String>,
}

#[must_use]
pub fn audit_history(
    artifact_type: ArtifactType,
    artifact_id: &str,
    persisted_status: Status,
    events: &[ArtifactEvent],
) -> HistoryAudit {
    let mut issues = Vec::new();
    let replayed_status = match replay_status(events) {
        Ok(status) => Some(status),
        Err(err) => {
            issues.push(err.to_string());
            None
        }
    };

    if let Some(replayed) = replayed_status {
        if replayed != persisted_status {
            issues.push(format!(
                "persisted status {persisted_status} differs from replayed status {replayed}"
            ));
        }
    }

    HistoryAudit {
        artifact_type,
        artifact_id: artifact_id.to_string(),
        persisted_status,
        replayed_status,
        event_count: events.len(),
        consistent: issues.is_empty(),
        issues,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Artifact {
    pub aid: String,
    pub key: Ulid,
    pub artifact_type: ArtifactType,
    pub project_id: String,
    pub area: String,
    pub title: String,
    pub description: String,
    pub status: Status,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewArtifact {
    pub project_id: String,
    pub area: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Aid of the parent artifact this one derives from.
    #[serde(default)]
    pub source_id: Option<String>,
}

impl NewArtifact {
    /// # Errors
    /// Returns [`WorkflowError::Validation`] when required fields are blank or
    /// a root artifact names a parent. The parent of the other kinds is
    /// optional.
    pub fn validate(&self, artifact_type: ArtifactType) -> Result<(), WorkflowError> {
        for (name, value) in [
            ("project_id", &self.project_id),
            ("area", &self.area),
            ("title", &self.title),
        ] {
            if value.trim().is_empty() {
                return Err(WorkflowError::Validation(format!(
                    "{name} MUST be provided"
                )));
            }
        }

        if artifact_type.parent().is_none() && non_blank(self.source_id.clone()).is_some() {
            return Err(WorkflowError::Validation(format!(
                "{artifact_type} is a root artifact and takes no source_id"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ArtifactPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub area: Option<String>,
}

impl ArtifactPatch {
    /// # Errors
    /// Returns [`WorkflowError::Validation`] when the patch is empty or blanks
    /// a required field.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.title.is_none() && self.description.is_none() && self.area.is_none() {
            return Err(WorkflowError::Validation(
                "patch MUST change at least one field".to_string(),
            ));
        }
        if self.title.as_deref().is_some_and(|value| value.trim().is_empty()) {
            return Err(WorkflowError::Validation("title cannot be empty".to_string()));
        }
        if self.area.as_deref().is_some_and(|value| value.trim().is_empty()) {
            return Err(WorkflowError::Validation("area cannot be empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ArtifactFilter {
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub status: Option<Status>,
    #[serde(default)]
    pub area: Option<String>,
}

impl ArtifactFilter {
    #[must_use]
    pub fn matches(&self, artifact: &Artifact) -> bool {
        self.project_id
            .as_deref()
            .map_or(true, |project| project == artifact.project_id)
            && self.status.map_or(true, |status| status == artifact.status)
            && self
                .area
                .as_deref()
                .map_or(true, |area| area.eq_ignore_ascii_case(&artifact.area))
    }
}

/// One `(kind, area, status)` group of a project's artifacts.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StatisticsCell {
    pub artifact_type: ArtifactType,
    pub area: String,
    pub status: Status,
    pub count: usize,
}

/// Artifact counts for one project, rolled up by kind, status and area.
/// Every kind appears in `by_type`, with zero when the project has none.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ProjectStatistics {
    pub project_id: String,
    pub total_count: usize,
    pub by_type: BTreeMap<ArtifactType, usize>,
    pub by_status: BTreeMap<Status, usize>,
    pub by_area: BTreeMap<String, usize>,
    pub matrix: Vec<StatisticsCell>,
}

impl ProjectStatistics {
    #[must_use]
    pub fn from_cells(project_id: &str, mut matrix: Vec<StatisticsCell>) -> Self {
        matrix.retain(|cell| cell.count > 0);
        matrix.sort_by(|a, b| {
            (a.artifact_type, &a.area, a.status).cmp(&(b.artifact_type, &b.area, b.status))
        });

        let mut by_type: BTreeMap<ArtifactType, usize> =
            ArtifactType::ALL.into_iter().map(|kind| (kind, 0)).collect();
        let mut by_status = BTreeMap::new();
        let mut by_area = BTreeMap::new();
        for cell in &matrix {
            *by_type.entry(cell.artifact_type).or_insert(0) += cell.count;
            *by_status.entry(cell.status).or_insert(0) += cell.count;
            *by_area.entry(cell.area.clone()).or_insert(0) += cell.count;
        }

        Self {
            project_id: project_id.to_string(),
            total_count: matrix.iter().map(|cell| cell.count).sum(),
            by_type,
            by_status,
            by_area,
            matrix,
        }
    }
}

/// Prefix shared by every aid of one project, area and kind, including the
/// trailing separator, e.g. `TR2-MCK-NEED-`.
#[must_use]
pub fn aid_prefix(project_id: &str, area: &str, artifact_type: ArtifactType) -> String {
    format!(
        "{}-{}-{}-",
        normalize_code(project_id),
        normalize_code(area),
        artifact_type.aid_code()
    )
}

/// Allocates the next aid under `prefix` given the aids already issued.
/// Suffixes that are not numeric are ignored.
#[must_use]
pub fn next_aid<'a>(prefix: &str, existing: impl IntoIterator<Item = &'a str>) -> String {
    let next = existing
        .into_iter()
        .filter_map(|aid| aid.strip_prefix(prefix))
        .filter_map(|suffix| suffix.parse::<u32>().ok())
        .max()
        .map_or(1, |max| max.saturating_add(1));
    format!("{prefix}{next:03}")
}

fn normalize_code(value: &str) -> String {
    value.trim().to_uppercase().replace(' ', "_")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    DerivesFrom,
    Satisfies,
    Refines,
    Verifies,
    Parent,
    TracesTo,
    DependsOn,
    IllustratedBy,
    DocumentedIn,
    AllocatedTo,
    RelatedTo,
}

impl RelationshipType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DerivesFrom => "derives_from",
            Self::Satisfies => "satisfies",
            Self::Refines => "refines",
            Self::Verifies => "verifies",
            Self::Parent => "parent",
            Self::TracesTo => "traces_to",
            Self::DependsOn => "depends_on",
            Self::IllustratedBy => "illustrated_by",
            Self::DocumentedIn => "documented_in",
            Self::AllocatedTo => "allocated_to",
            Self::RelatedTo => "related_to",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "derives_from" => Some(Self::DerivesFrom),
            "satisfies" => Some(Self::Satisfies),
            "refines" => Some(Self::Refines),
            "verifies" => Some(Self::Verifies),
            "parent" => Some(Self::Parent),
            "traces_to" => Some(Self::TracesTo),
            "depends_on" => Some(Self::DependsOn),
            "illustrated_by" => Some(Self::IllustratedBy),
            "documented_in" => Some(Self::DocumentedIn),
            "allocated_to" => Some(Self::AllocatedTo),
            "related_to" => Some(Self::RelatedTo),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LinkTargetType {
    Vision,
    Need,
    UseCase,
    Requirement,
    Url,
}

impl LinkTargetType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Url => "url",
            other => other.artifact_type().map_or("url", ArtifactType::as_str),
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        if value.trim().eq_ignore_ascii_case("url") {
            return Some(Self::Url);
        }
        ArtifactType::parse(value).map(Self::from)
    }

    /// `None` for external URL targets.
    #[must_use]
    pub fn artifact_type(self) -> Option<ArtifactType> {
        match self {
            Self::Vision => Some(ArtifactType::Vision),
            Self::Need => Some(ArtifactType::Need),
            Self::UseCase => Some(ArtifactType::UseCase),
            Self::Requirement => Some(ArtifactType::Requirement),
            Self::Url => None,
        }
    }
}

impl From<ArtifactType> for LinkTargetType {
    fn from(value: ArtifactType) -> Self {
        match value {
            ArtifactType::Vision => Self::Vision,
            ArtifactType::Need => Self::Need,
            ArtifactType::UseCase => Self::UseCase,
            ArtifactType::Requirement => Self::Requirement,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Linkage {
    pub aid: String,
    pub source_artifact_type: ArtifactType,
    pub source_id: String,
    pub target_artifact_type: LinkTargetType,
    pub target_id: String,
    pub relationship_type: RelationshipType,
    pub project_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewLinkage {
    pub source_artifact_type: ArtifactType,
    pub source_id: String,
    pub target_artifact_type: LinkTargetType,
    pub target_id: String,
    pub relationship_type: RelationshipType,
    /// Defaults to the source artifact's project.
    #[serde(default)]
    pub project_id: Option<String>,
}

impl NewLinkage {
    /// # Errors
    /// Returns [`WorkflowError::Validation`] for blank endpoints, self links,
    /// or URL targets that are not http(s).
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.source_id.trim().is_empty() || self.target_id.trim().is_empty() {
            return Err(WorkflowError::Validation(
                "source_id and target_id MUST be provided".to_string(),
            ));
        }

        if self.target_artifact_type == LinkTargetType::Url {
            let target = self.target_id.trim();
            if !(target.starts_with("http://") || target.starts_with("https://")) {
                return Err(WorkflowError::Validation(
                    "url targets MUST start with http:// or https://".to_string(),
                ));
            }
        } else if LinkTargetType::from(self.source_artifact_type) == self.target_artifact_type
            && self.source_id == self.target_id
        {
            return Err(WorkflowError::Validation(
                "an artifact cannot link to itself".to_string(),
            ));
        }

        Ok(())
    }
}

/// Next linkage aid (`LINK-00001`, `LINK-00002`, ...).
#[must_use]
pub fn next_linkage_aid<'a>(existing: impl IntoIterator<Item = &'a str>) -> String {
    let next = existing
        .into_iter()
        .filter_map(|aid| aid.strip_prefix("LINK-"))
        .filter_map(|suffix| suffix.parse::<u32>().ok())
        .max()
        .map_or(1, |max| max.saturating_add(1));
    format!("LINK-{next:05}")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportDocument {
    pub format_version: String,
    pub project_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub exported_at: OffsetDateTime,
    pub artifacts: Vec<Artifact>,
    pub linkages: Vec<Linkage>,
    pub events: Vec<ArtifactEvent>,
}

impl ExportDocument {
    /// Checks the document before any row is written: format version, project
    /// membership, and that each artifact's history replays to its status.
    ///
    /// # Errors
    /// Returns [`WorkflowError::Validation`] describing the first problem found.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.format_version != EXPORT_FORMAT_VERSION {
            return Err(WorkflowError::Validation(format!(
                "unsupported format_version {}; expected {EXPORT_FORMAT_VERSION}",
                self.format_version
            )));
        }

        for artifact in &self.artifacts {
            if artifact.project_id != self.project_id {
                return Err(WorkflowError::Validation(format!(
                    "artifact {} belongs to project {}, not {}",
                    artifact.aid, artifact.project_id, self.project_id
                )));
            }

            let mut history: Vec<ArtifactEvent> = self
                .events
                .iter()
                .filter(|event| {
                    event.artifact_type == artifact.artifact_type
                        && event.artifact_id == artifact.aid
                })
                .cloned()
                .collect();
            history.sort_by_key(|event| event.id);

            let replayed = replay_status(&history).map_err(|err| {
                WorkflowError::Validation(format!("artifact {}: {err}", artifact.aid))
            })?;
            if replayed != artifact.status {
                return Err(WorkflowError::Validation(format!(
                    "artifact {}: status {} does not match replayed history ({replayed})",
                    artifact.aid, artifact.status
                )));
            }
        }

        for event in &self.events {
            let known = self.artifacts.iter().any(|artifact| {
                artifact.artifact_type == event.artifact_type && artifact.aid == event.artifact_id
            });
            if !known {
                return Err(WorkflowError::Validation(format!(
                    "event {} references unknown artifact {}",
                    event.id, event.artifact_id
                )));
            }
        }

        Ok(())
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`WorkflowError::Validation`] when parsing fails or the
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, WorkflowError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| WorkflowError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(WorkflowError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`WorkflowError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, WorkflowError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            WorkflowError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}
