use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use pattern_memory_api::{
    ApiQueryRequest, ConsultStoreRequest, LearnRequest, PatternMemory, PutRequest, WriteMode,
};
use pattern_memory_core::{
    CacheMetadata, CacheRequest, CacheResponse, ConfidenceSource, PatternId, QueryFilters,
    Resolution, Severity,
};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "pm")]
#[command(about = "Pattern Memory CLI")]
struct Cli {
    #[arg(long, default_value = "./pattern_memory")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Pattern {
        #[command(subcommand)]
        command: Box<PatternCommand>,
    },
    Query {
        #[command(subcommand)]
        command: Box<QueryCommand>,
    },
    Cache {
        #[command(subcommand)]
        command: Box<CacheCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum PatternCommand {
    Add(ObservationArgs),
    Resolve(ResolveArgs),
    Supersede(SupersedeArgs),
    Get(GetArgs),
    List,
    Pending,
}

#[derive(Debug, Args)]
struct ObservationArgs {
    #[arg(long)]
    project: String,
    #[arg(long)]
    title: String,
    #[arg(long)]
    category: String,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long, value_enum)]
    severity: SeverityArg,
    #[arg(long = "do")]
    do_text: String,
    #[arg(long = "dont")]
    dont_text: String,
    #[arg(long)]
    example: Option<String>,
    #[arg(long, value_enum)]
    source: SourceArg,
    #[arg(long)]
    confidence: Option<f32>,
    #[arg(long)]
    agent: String,
    #[arg(long)]
    source_uri: Option<String>,
    #[arg(long)]
    source_hash: Option<String>,
    #[arg(long)]
    observed_at: Option<String>,
}

#[derive(Debug, Args)]
struct ResolveArgs {
    #[arg(long)]
    pending_id: String,
    #[arg(long, value_enum)]
    resolution: ResolutionArg,
    #[arg(long)]
    resolved_at: Option<String>,
}

#[derive(Debug, Args)]
struct SupersedeArgs {
    #[arg(long = "target")]
    targets: Vec<String>,
    #[command(flatten)]
    observation: ObservationArgs,
}

#[derive(Debug, Args)]
struct GetArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Subcommand)]
enum QueryCommand {
    Run(QueryRunArgs),
}

#[derive(Debug, Args)]
struct QueryRunArgs {
    #[arg(long, default_value = "")]
    text: String,
    #[arg(long)]
    project: Option<String>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long, value_enum)]
    severity: Option<SeverityArg>,
    #[arg(long, default_value_t = 10)]
    top_n: usize,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Subcommand)]
enum CacheCommand {
    Lookup(CacheLookupArgs),
    Store(CacheStoreArgs),
    History(CacheHistoryArgs),
}

#[derive(Debug, Args)]
struct ConsultRequestArgs {
    #[arg(long)]
    source: String,
    #[arg(long)]
    role: String,
    #[arg(long)]
    question: String,
    #[arg(long = "artifact")]
    artifacts: Vec<String>,
    #[arg(long)]
    context_summary: Option<String>,
}

#[derive(Debug, Args)]
struct CacheLookupArgs {
    #[command(flatten)]
    request: ConsultRequestArgs,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Args)]
struct CacheStoreArgs {
    #[command(flatten)]
    request: ConsultRequestArgs,
    #[arg(long)]
    response_text: String,
    #[arg(long = "key-point")]
    key_points: Vec<String>,
    #[arg(long = "suggestion")]
    suggestions: Vec<String>,
    #[arg(long)]
    latency_ms: Option<u64>,
    #[arg(long)]
    cost_usd: Option<f32>,
    #[arg(long)]
    answered_at: Option<String>,
}

#[derive(Debug, Args)]
struct CacheHistoryArgs {
    #[arg(long)]
    text: String,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SeverityArg {
    Error,
    Warning,
}

impl SeverityArg {
    fn into_severity(self) -> Severity {
        match self {
            Self::Error => Severity::Error,
            Self::Warning => Severity::Warning,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SourceArg {
    UserInstruction,
    OfficialDocs,
    VerifiedPattern,
    Inferred,
}

impl SourceArg {
    fn into_source(self) -> ConfidenceSource {
        match self {
            Self::UserInstruction => ConfidenceSource::UserInstruction,
            Self::OfficialDocs => ConfidenceSource::OfficialDocs,
            Self::VerifiedPattern => ConfidenceSource::VerifiedPattern,
            Self::Inferred => ConfidenceSource::Inferred,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ResolutionArg {
    Confirm,
    Reject,
}

impl ResolutionArg {
    fn into_resolution(self) -> Resolution {
        match self {
            Self::Confirm => Resolution::Confirm,
            Self::Reject => Resolution::Reject,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let memory = PatternMemory::open(&cli.root)?;

    match cli.command {
        Command::Pattern { command } => run_pattern(*command, &memory),
        Command::Query { command } => run_query(*command, &memory),
        Command::Cache { command } => run_cache(*command, &memory),
    }
}

fn run_pattern(command: PatternCommand, memory: &PatternMemory) -> Result<()> {
    match command {
        PatternCommand::Add(args) => {
            let outcome = memory.learn(learn_request_from(args)?)?;
            emit_json(serde_json::to_value(&outcome).context("failed to serialize learn outcome")?)
        }
        PatternCommand::Resolve(args) => {
            let resolved_at = parse_optional_rfc3339(args.resolved_at.as_deref())?;
            let outcome = memory.resolve(
                &args.pending_id,
                args.resolution.into_resolution(),
                Some(resolved_at),
            )?;
            emit_json(
                serde_json::to_value(&outcome).context("failed to serialize resolve outcome")?,
            )
        }
        PatternCommand::Supersede(args) => {
            let mut targets = Vec::new();
            for raw in &args.targets {
                targets.push(parse_pattern_id(raw)?);
            }
            let record = memory.put(PutRequest {
                write_mode: WriteMode::Supersede,
                id: None,
                supersedes: targets,
                fields: learn_request_from(args.observation)?,
            })?;
            emit_json(serde_json::json!({ "record": record }))
        }
        PatternCommand::Get(args) => {
            let id = parse_pattern_id(&args.id)?;
            let record = memory.get(id)?;
            emit_json(serde_json::json!({
                "found": record.is_some(),
                "record": record
            }))
        }
        PatternCommand::List => {
            let records = memory.list()?;
            emit_json(serde_json::json!({
                "count": records.len(),
                "records": records
            }))
        }
        PatternCommand::Pending => {
            let pending = memory.list_pending()?;
            emit_json(serde_json::json!({
                "count": pending.len(),
                "pending": pending
            }))
        }
    }
}

fn run_query(command: QueryCommand, memory: &PatternMemory) -> Result<()> {
    match command {
        QueryCommand::Run(args) => {
            let as_of = parse_optional_rfc3339(args.as_of.as_deref())?;
            let outcome = memory.query(ApiQueryRequest {
                text: args.text,
                filters: QueryFilters {
                    project_slug: args.project,
                    category: args.category,
                    tags: args.tags,
                    severity: args.severity.map(SeverityArg::into_severity),
                },
                top_n: args.top_n,
                as_of: Some(as_of),
            })?;
            emit_json(serde_json::to_value(&outcome).context("failed to serialize query outcome")?)
        }
    }
}

fn run_cache(command: CacheCommand, memory: &PatternMemory) -> Result<()> {
    match command {
        CacheCommand::Lookup(args) => {
            let as_of = parse_optional_rfc3339(args.as_of.as_deref())?;
            let lookup = memory.consult_lookup(
                &args.request.source,
                &cache_request_from(&args.request),
                Some(as_of),
            )?;
            emit_json(serde_json::to_value(&lookup).context("failed to serialize cache lookup")?)
        }
        CacheCommand::Store(args) => {
            let answered_at = parse_optional_rfc3339(args.answered_at.as_deref())?;
            let stored = memory.consult_store(ConsultStoreRequest {
                source: args.request.source.clone(),
                request: cache_request_from(&args.request),
                response: CacheResponse {
                    full_text: args.response_text,
                    key_points: args.key_points,
                    suggestions: args.suggestions,
                },
                metadata: CacheMetadata { latency_ms: args.latency_ms, cost_usd: args.cost_usd },
                answered_at: Some(answered_at),
            })?;
            emit_json(
                serde_json::to_value(&stored).context("failed to serialize stored consultation")?,
            )
        }
        CacheCommand::History(args) => {
            let as_of = parse_optional_rfc3339(args.as_of.as_deref())?;
            let matches = memory.history_search(&args.text, Some(as_of))?;
            emit_json(serde_json::json!({
                "count": matches.len(),
                "matches": matches
            }))
        }
    }
}

fn learn_request_from(args: ObservationArgs) -> Result<LearnRequest> {
    let observed_at = match args.observed_at.as_deref() {
        Some(raw) => Some(parse_rfc3339(raw)?),
        None => None,
    };

    Ok(LearnRequest {
        project_slug: args.project,
        title: args.title,
        category: args.category,
        tags: args.tags,
        severity: args.severity.into_severity(),
        do_text: args.do_text,
        dont_text: args.dont_text,
        example: args.example,
        confidence_source: args.source.into_source(),
        confidence: args.confidence,
        agent: args.agent,
        source_uri: args.source_uri,
        source_hash: args.source_hash,
        observed_at,
    })
}

fn cache_request_from(args: &ConsultRequestArgs) -> CacheRequest {
    CacheRequest {
        role: args.role.clone(),
        question: args.question.clone(),
        artifacts: args.artifacts.clone(),
        context_summary: args.context_summary.clone(),
    }
}

fn parse_optional_rfc3339(value: Option<&str>) -> Result<OffsetDateTime> {
    match value {
        Some(raw) => parse_rfc3339(raw),
        None => Ok(OffsetDateTime::now_utc()),
    }
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 UTC timestamp: {value}"))?;

    if parsed.offset() != time::UtcOffset::UTC {
        return Err(anyhow!("timestamp MUST use UTC offset Z (received: {value})"));
    }

    Ok(parsed)
}

fn parse_pattern_id(value: &str) -> Result<PatternId> {
    let parsed = Ulid::from_string(value).with_context(|| format!("invalid ULID: {value}"))?;
    Ok(PatternId(parsed))
}
