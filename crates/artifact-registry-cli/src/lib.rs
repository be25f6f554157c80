//! Operator command surface for the artifact registry.
//!
//! [`run_cli`] executes a parsed [`Cli`]; [`run_registry`] runs a single
//! [`RegistryCommand`] against an already opened store so host tools can
//! embed the same behavior without going through argument parsing.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use artifact_registry_core::ears::{analyze, template, EarsPattern};
use artifact_registry_core::{
    Actor, ArtifactFilter, ArtifactPatch, ArtifactType, ExportDocument, LinkTargetType,
    NewArtifact, NewLinkage, RelationshipType, Status, TransitionRequest,
};
use artifact_registry_store_sqlite::SqliteRegistryStore;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(name = "areg")]
#[command(about = "Artifact registry CLI")]
pub struct Cli {
    #[arg(long, default_value = "./artifact_registry.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: RegistryCommand,
}

#[derive(Debug, Subcommand)]
pub enum RegistryCommand {
    Artifact {
        #[command(subcommand)]
        command: Box<ArtifactCommand>,
    },
    /// Apply one status transition.
    Transition(TransitionArgs),
    /// Print transition history, oldest first.
    History(ArtifactRefArgs),
    /// Print the current status and the statuses reachable from it.
    Allowed(ArtifactRefArgs),
    /// Replay history and compare it with the persisted status.
    Audit(ArtifactRefArgs),
    Link {
        #[command(subcommand)]
        command: Box<LinkCommand>,
    },
    Ears {
        #[command(subcommand)]
        command: Box<EarsCommand>,
    },
    /// Count artifacts per kind, status and area.
    Stats(StatsArgs),
    Export(ExportArgs),
    Import(ImportArgs),
}

#[derive(Debug, Subcommand)]
pub enum ArtifactCommand {
    Create(ArtifactCreateArgs),
    Show(ArtifactShowArgs),
    List(ArtifactListArgs),
    Update(ArtifactUpdateArgs),
    Delete(ArtifactShowArgs),
}

#[derive(Debug, Args)]
pub struct ArtifactCreateArgs {
    #[arg(long = "type", value_parser = parse_artifact_type)]
    artifact_type: ArtifactType,
    #[arg(long)]
    project: String,
    #[arg(long)]
    area: String,
    #[arg(long)]
    title: String,
    #[arg(long, default_value = "")]
    description: String,
    /// Aid of the parent artifact; required for every kind except vision.
    #[arg(long)]
    source_id: Option<String>,
}

#[derive(Debug, Args)]
pub struct ArtifactShowArgs {
    #[arg(long = "type", value_parser = parse_artifact_type)]
    artifact_type: ArtifactType,
    #[arg(long)]
    aid: String,
}

#[derive(Debug, Args)]
pub struct ArtifactListArgs {
    #[arg(long = "type", value_parser = parse_artifact_type)]
    artifact_type: ArtifactType,
    #[arg(long)]
    project: Option<String>,
    #[arg(long, value_parser = parse_status)]
    status: Option<Status>,
    #[arg(long)]
    area: Option<String>,
}

#[derive(Debug, Args)]
pub struct ArtifactUpdateArgs {
    #[arg(long = "type", value_parser = parse_artifact_type)]
    artifact_type: ArtifactType,
    #[arg(long)]
    aid: String,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    area: Option<String>,
}

#[derive(Debug, Args)]
pub struct TransitionArgs {
    #[arg(long = "type", value_parser = parse_artifact_type)]
    artifact_type: ArtifactType,
    #[arg(long)]
    id: String,
    #[arg(long, value_parser = parse_status)]
    from: Status,
    #[arg(long, value_parser = parse_status)]
    to: Status,
    #[arg(long, default_value = "")]
    rationale: String,
    #[arg(long)]
    comment: Option<String>,
    #[arg(long)]
    user_id: Option<String>,
    #[arg(long)]
    user_name: Option<String>,
}

#[derive(Debug, Args)]
pub struct ArtifactRefArgs {
    #[arg(long = "type", value_parser = parse_artifact_type)]
    artifact_type: ArtifactType,
    #[arg(long)]
    id: String,
}

#[derive(Debug, Subcommand)]
pub enum LinkCommand {
    Add(LinkAddArgs),
    From(LinkAidArgs),
    To(LinkAidArgs),
    Remove(LinkAidArgs),
}

#[derive(Debug, Args)]
pub struct LinkAddArgs {
    #[arg(long, value_parser = parse_artifact_type)]
    source_type: ArtifactType,
    #[arg(long)]
    source_id: String,
    #[arg(long, value_parser = parse_link_target_type)]
    target_type: LinkTargetType,
    #[arg(long)]
    target_id: String,
    #[arg(long, value_parser = parse_relationship)]
    relationship: RelationshipType,
    #[arg(long)]
    project: Option<String>,
}

#[derive(Debug, Args)]
pub struct LinkAidArgs {
    #[arg(long)]
    aid: String,
}

#[derive(Debug, Subcommand)]
pub enum EarsCommand {
    /// Detect and validate the EARS pattern of a requirement statement.
    Check(EarsCheckArgs),
    /// Print statement templates with a short description of each pattern.
    Template(EarsTemplateArgs),
}

#[derive(Debug, Args)]
pub struct EarsCheckArgs {
    #[arg(long)]
    text: String,
    #[arg(long, value_parser = parse_ears_pattern)]
    pattern: Option<EarsPattern>,
    #[arg(long)]
    system: Option<String>,
}

#[derive(Debug, Args)]
pub struct EarsTemplateArgs {
    #[arg(long, value_parser = parse_ears_pattern)]
    pattern: Option<EarsPattern>,
    #[arg(long, default_value = "system")]
    system: String,
}

#[derive(Debug, Args)]
pub struct StatsArgs {
    #[arg(long)]
    project: String,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    #[arg(long)]
    project: String,
    /// Write the document here instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Serialize)]
struct EarsTemplateView {
    pattern: EarsPattern,
    description: &'static str,
    template: String,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open or migration fails, or when the command
/// itself fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        RegistryCommand::Ears { command } => run_ears(*command),
        command => run_registry_with_db(&cli.db, command),
    }
}

/// Opens and migrates the database at `db_path`, then runs `command`.
///
/// # Errors
/// Returns an error when store open or migration fails, or when the command
/// itself fails.
pub fn run_registry_with_db(db_path: &Path, command: RegistryCommand) -> Result<()> {
    let mut store = SqliteRegistryStore::open(db_path)?;
    store.migrate()?;
    run_registry(command, &mut store)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when validation, persistence or the history audit fails.
pub fn run_registry(command: RegistryCommand, store: &mut SqliteRegistryStore) -> Result<()> {
    match command {
        RegistryCommand::Artifact { command } => run_artifact(*command, store),
        RegistryCommand::Transition(args) => {
            let request = TransitionRequest {
                artifact_type: args.artifact_type,
                artifact_id: args.id,
                from_status: args.from,
                to_status: args.to,
                rationale: args.rationale,
                comment: args.comment,
                actor: Actor::resolve(args.user_id, args.user_name),
            };
            let outcome = store.transition(&request)?;
            print_json(&outcome.event)
        }
        RegistryCommand::History(args) => {
            print_json(&store.history(args.artifact_type, &args.id)?)
        }
        RegistryCommand::Allowed(args) => {
            print_json(&store.allowed_transitions(args.artifact_type, &args.id)?)
        }
        RegistryCommand::Audit(args) => {
            let report = store.audit_history(args.artifact_type, &args.id)?;
            print_json(&report)?;
            if !report.consistent {
                return Err(anyhow!(
                    "history audit failed for {} {}: {}",
                    report.artifact_type,
                    report.artifact_id,
                    report.issues.join("; ")
                ));
            }
            Ok(())
        }
        RegistryCommand::Link { command } => run_link(*command, store),
        RegistryCommand::Ears { command } => run_ears(*command),
        RegistryCommand::Stats(args) => print_json(&store.project_statistics(&args.project)?),
        RegistryCommand::Export(args) => {
            let document = store.export_project(&args.project)?;
            let body = serde_json::to_string_pretty(&document)?;
            match args.out {
                Some(path) => fs::write(&path, body)
                    .with_context(|| format!("failed to write {}", path.display())),
                None => {
                    println!("{body}");
                    Ok(())
                }
            }
        }
        RegistryCommand::Import(args) => {
            let document = read_export_document(&args.file)?;
            print_json(&store.import_document(&document)?)
        }
    }
}

fn run_artifact(command: ArtifactCommand, store: &mut SqliteRegistryStore) -> Result<()> {
    match command {
        ArtifactCommand::Create(args) => {
            let input = NewArtifact {
                project_id: args.project,
                area: args.area,
                title: args.title,
                description: args.description,
                source_id: args.source_id,
            };
            print_json(&store.create_artifact(args.artifact_type, &input)?)
        }
        ArtifactCommand::Show(args) => print_json(&store.get_artifact(args.artifact_type, &args.aid)?),
        ArtifactCommand::List(args) => {
            let filter = ArtifactFilter {
                project_id: args.project,
                status: args.status,
                area: args.area,
            };
            print_json(&store.list_artifacts(args.artifact_type, &filter)?)
        }
        ArtifactCommand::Update(args) => {
            let patch = ArtifactPatch {
                title: args.title,
                description: args.description,
                area: args.area,
            };
            print_json(&store.update_artifact(args.artifact_type, &args.aid, &patch)?)
        }
        ArtifactCommand::Delete(args) => {
            store.delete_artifact(args.artifact_type, &args.aid)?;
            print_json(&serde_json::json!({"deleted": args.aid}))
        }
    }
}

fn run_link(command: LinkCommand, store: &mut SqliteRegistryStore) -> Result<()> {
    match command {
        LinkCommand::Add(args) => {
            let input = NewLinkage {
                source_artifact_type: args.source_type,
                source_id: args.source_id,
                target_artifact_type: args.target_type,
                target_id: args.target_id,
                relationship_type: args.relationship,
                project_id: args.project,
            };
            print_json(&store.create_linkage(&input)?)
        }
        LinkCommand::From(args) => print_json(&store.linkages_from(&args.aid)?),
        LinkCommand::To(args) => print_json(&store.linkages_to(&args.aid)?),
        LinkCommand::Remove(args) => {
            store.delete_linkage(&args.aid)?;
            print_json(&serde_json::json!({"deleted": args.aid}))
        }
    }
}

fn run_ears(command: EarsCommand) -> Result<()> {
    match command {
        EarsCommand::Check(args) => {
            print_json(&analyze(&args.text, args.pattern, args.system.as_deref()))
        }
        EarsCommand::Template(args) => {
            let patterns = args
                .pattern
                .map_or_else(|| EarsPattern::ALL.to_vec(), |pattern| vec![pattern]);
            let views = patterns
                .into_iter()
                .map(|pattern| EarsTemplateView {
                    pattern,
                    description: pattern.description(),
                    template: template(pattern, &args.system),
                })
                .collect::<Vec<_>>();
            print_json(&views)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_export_document(path: &Path) -> Result<ExportDocument> {
    let body =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&body)
        .with_context(|| format!("{} is not a valid export document", path.display()))
}

fn parse_artifact_type(raw: &str) -> Result<ArtifactType, String> {
    ArtifactType::parse(raw).ok_or_else(|| {
        format!(
            "unknown artifact type `{raw}` (expected one of: {})",
            ArtifactType::ALL.map(ArtifactType::as_str).join(", ")
        )
    })
}

fn parse_link_target_type(raw: &str) -> Result<LinkTargetType, String> {
    LinkTargetType::parse(raw).ok_or_else(|| format!("unknown link target type `{raw}`"))
}

fn parse_status(raw: &str) -> Result<Status, String> {
    Status::parse(raw).ok_or_else(|| {
        format!(
            "unknown status `{raw}` (expected one of: {})",
            Status::ALL.map(Status::as_str).join(", ")
        )
    })
}

fn parse_relationship(raw: &str) -> Result<RelationshipType, String> {
    RelationshipType::parse(raw).ok_or_else(|| format!("unknown relationship type `{raw}`"))
}

fn parse_ears_pattern(raw: &str) -> Result<EarsPattern, String> {
    EarsPattern::parse(raw).ok_or_else(|| {
        format!(
            "unknown EARS pattern `{raw}` (expected one of: {})",
            EarsPattern::ALL.map(EarsPattern::as_str).join(", ")
        )
    })
}
