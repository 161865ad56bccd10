use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use turbine_api::TurbineApi;
use turbine_core::{format_relative, ComponentDeployment, Environment, RuntimeMessage};
use turbine_extract::{
    extract_component_data, run_watcher, DebounceConfig, FilePageSource, HttpMessageSink,
    MessageSink, MutationRecord,
};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "tn")]
#[command(about = "Turbine navigator CLI")]
struct Cli {
    #[arg(long, default_value = "./turbine.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
    Visit(VisitArgs),
    Recent {
        #[command(subcommand)]
        command: RecentCommand,
    },
    Components {
        #[command(subcommand)]
        command: ComponentsCommand,
    },
    Envs {
        #[command(subcommand)]
        command: EnvsCommand,
    },
    Scrape(ScrapeArgs),
    Watch(WatchArgs),
    Nav {
        #[command(subcommand)]
        command: NavCommand,
    },
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Subcommand)]
enum SettingsCommand {
    Show,
    Set(SettingsSetArgs),
    Reset,
}

#[derive(Debug, Args)]
struct SettingsSetArgs {
    #[arg(long)]
    base_url: String,
}

#[derive(Debug, Args)]
struct VisitArgs {
    #[arg(long)]
    url: String,
}

#[derive(Debug, Subcommand)]
enum RecentCommand {
    List(RecentListArgs),
    Remove(RecentIdArgs),
    Clear,
    Links(RecentIdArgs),
}

#[derive(Debug, Args)]
struct RecentListArgs {
    #[arg(long)]
    query: Option<String>,
}

#[derive(Debug, Args)]
struct RecentIdArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Subcommand)]
enum ComponentsCommand {
    Ingest(IngestArgs),
    Table,
    Matrix(MatrixArgs),
    DeleteNamespace(NamespaceArgs),
    Clear,
}

#[derive(Debug, Args)]
struct IngestArgs {
    /// JSON file holding a `COMPONENT_DATA` message or a bare record array.
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
struct MatrixArgs {
    #[arg(long, default_value_t = false)]
    text: bool,
}

#[derive(Debug, Args)]
struct NamespaceArgs {
    #[arg(long)]
    namespace: String,
}

#[derive(Debug, Subcommand)]
enum EnvsCommand {
    Show,
    Toggle(EnvArgs),
    ShowAll,
}

#[derive(Debug, Args)]
struct EnvArgs {
    #[arg(long)]
    env: EnvironmentArg,
}

#[derive(Debug, Args)]
struct ScrapeArgs {
    #[arg(long)]
    url: String,
    #[arg(long)]
    html: PathBuf,
    /// Store the scraped batch.
    #[arg(long, default_value_t = false)]
    send: bool,
    /// Post the batch to a running service instead of the local database.
    #[arg(long, requires = "send")]
    service: Option<String>,
}

#[derive(Debug, Args)]
struct WatchArgs {
    #[arg(long)]
    url: String,
    #[arg(long)]
    html: PathBuf,
    #[arg(long)]
    service: Option<String>,
    #[arg(long, default_value_t = 250)]
    poll_ms: u64,
    /// Stop watching after this many milliseconds.
    #[arg(long)]
    duration_ms: Option<u64>,
}

#[derive(Debug, Subcommand)]
enum NavCommand {
    Url(NavUrlArgs),
}

#[derive(Debug, Args)]
struct NavUrlArgs {
    #[arg(long)]
    namespace: String,
    #[arg(long)]
    env: EnvironmentArg,
    #[arg(long)]
    path: Option<String>,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
    Backup(DbBackupArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EnvironmentArg {
    Dev,
    Sit,
    Uat1,
    Qa,
    Prep,
    Prod,
}

impl From<EnvironmentArg> for Environment {
    fn from(value: EnvironmentArg) -> Self {
        match value {
            EnvironmentArg::Dev => Self::Dev,
            EnvironmentArg::Sit => Self::Sit,
            EnvironmentArg::Uat1 => Self::Uat1,
            EnvironmentArg::Qa => Self::Qa,
            EnvironmentArg::Prep => Self::Prep,
            EnvironmentArg::Prod => Self::Prod,
        }
    }
}

/// Stores batches produced by the watcher in the local database.
struct LocalSink {
    api: TurbineApi,
}

impl MessageSink for LocalSink {
    fn deliver(&self, message: RuntimeMessage) {
        let ack = self.api.handle_message(message);
        if !ack.success {
            tracing::warn!(error = ?ack.error, "watch batch was not stored");
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

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Db { command } => run_db(command, &TurbineApi::open_unmigrated(&cli.db)?),
        Command::Scrape(args) => run_scrape(&args, &cli.db),
        Command::Watch(args) => run_watch(&args, &cli.db),
        Command::Settings { command } => run_settings(command, &TurbineApi::open(&cli.db)?),
        Command::Visit(args) => run_visit(&args, &TurbineApi::open(&cli.db)?),
        Command::Recent { command } => run_recent(command, &TurbineApi::open(&cli.db)?),
        Command::Components { command } => run_components(command, &TurbineApi::open(&cli.db)?),
        Command::Envs { command } => run_envs(command, &TurbineApi::open(&cli.db)?),
        Command::Nav { command } => run_nav(command, &TurbineApi::open(&cli.db)?),
    }
}

fn run_settings(command: SettingsCommand, api: &TurbineApi) -> Result<()> {
    let settings = match command {
        SettingsCommand::Show => api.settings()?,
        SettingsCommand::Set(args) => api.save_settings(&args.base_url)?,
        SettingsCommand::Reset => api.reset_settings()?,
    };
    emit_json(serde_json::json!({
        "base_url": settings.base_url,
        "configured": settings.is_configured()
    }))
}

fn run_visit(args: &VisitArgs, api: &TurbineApi) -> Result<()> {
    let visit = api.record_visit(&args.url)?;
    emit_json(serde_json::json!({
        "recorded": visit.is_some(),
        "visit": visit
    }))
}

fn run_recent(command: RecentCommand, api: &TurbineApi) -> Result<()> {
    match command {
        RecentCommand::List(args) => {
            let now = OffsetDateTime::now_utc();
            let items: Vec<Value> = api
                .recent(args.query.as_deref())?
                .into_iter()
                .map(|entry| -> Result<Value> {
                    let relative = format_relative(entry.last_visited_at, now);
                    let mut item = serde_json::to_value(entry)?;
                    if let Value::Object(object) = &mut item {
                        object.insert("last_visited".to_string(), Value::String(relative));
                    }
                    Ok(item)
                })
                .collect::<Result<_>>()?;
            emit_json(serde_json::json!({ "items": items }))
        }
        RecentCommand::Remove(args) => {
            let removed = api.remove_recent(&args.id)?;
            emit_json(serde_json::json!({ "id": args.id, "removed": removed }))
        }
        RecentCommand::Clear => {
            api.clear_recent()?;
            emit_json(serde_json::json!({ "cleared": true }))
        }
        RecentCommand::Links(args) => {
            let links = api.recent_links(&args.id)?;
            emit_json(serde_json::json!({ "id": args.id, "links": links }))
        }
    }
}

fn run_components(command: ComponentsCommand, api: &TurbineApi) -> Result<()> {
    match command {
        ComponentsCommand::Ingest(args) => {
            let records = read_component_file(&args.file)?;
            let result = api.ingest(records)?;
            emit_json(serde_json::to_value(result)?)
        }
        ComponentsCommand::Table => emit_json(serde_json::to_value(api.component_table()?)?),
        ComponentsCommand::Matrix(args) => {
            let matrix = api.component_matrix()?;
            if args.text {
                print!("{}", matrix.render_text());
                Ok(())
            } else {
                emit_json(serde_json::to_value(matrix)?)
            }
        }
        ComponentsCommand::DeleteNamespace(args) => {
            let removed = api.delete_namespace(&args.namespace)?;
            emit_json(serde_json::json!({ "namespace": args.namespace, "removed": removed }))
        }
        ComponentsCommand::Clear => {
            api.clear_components()?;
            emit_json(serde_json::json!({ "cleared": true }))
        }
    }
}

fn read_component_file(path: &Path) -> Result<Vec<ComponentDeployment>> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read component file {}", path.display()))?;
    let message = serde_json::from_str::<RuntimeMessage>(&body);
    if let Ok(RuntimeMessage::ComponentData(records)) = message {
        return Ok(records);
    }
    serde_json::from_str(&body).with_context(|| {
        format!(
            "{} is neither a COMPONENT_DATA message nor a record array",
            path.display()
        )
    })
}

fn run_envs(command: EnvsCommand, api: &TurbineApi) -> Result<()> {
    let visible = match command {
        EnvsCommand::Show => api.visible_environments()?,
        EnvsCommand::Toggle(args) => api.toggle_environment(args.env.into())?,
        EnvsCommand::ShowAll => api.show_all_environments()?,
    };
    emit_json(serde_json::json!({ "visible": visible }))
}

fn run_nav(command: NavCommand, api: &TurbineApi) -> Result<()> {
    match command {
        NavCommand::Url(args) => {
            let url = api.navigation_url(&args.namespace, args.env.into(), args.path.as_deref())?;
            emit_json(serde_json::json!({ "url": url }))
        }
    }
}

fn run_scrape(args: &ScrapeArgs, db: &Path) -> Result<()> {
    let html = fs::read_to_string(&args.html)
        .with_context(|| format!("failed to read page {}", args.html.display()))?;
    let records = extract_component_data(&args.url, &html, OffsetDateTime::now_utc())?;

    let ack = if !args.send || records.is_empty() {
        None
    } else {
        let message = RuntimeMessage::ComponentData(records.clone());
        match &args.service {
            Some(service) => Some(HttpMessageSink::new(service)?.post(&message)?),
            None => Some(TurbineApi::open(db)?.handle_message(message)),
        }
    };

    emit_json(serde_json::json!({
        "records": records,
        "sent": ack.is_some(),
        "ack": ack
    }))
}

fn run_watch(args: &WatchArgs, db: &Path) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let source = FilePageSource::new(args.url.clone(), args.html.clone());
    let sink: Box<dyn MessageSink> = match &args.service {
        Some(service) => Box::new(HttpMessageSink::new(service)?),
        None => Box::new(LocalSink {
            api: TurbineApi::open(db)?,
        }),
    };
    let poll_interval = Duration::from_millis(args.poll_ms.max(1));
    let duration = args.duration_ms.map(Duration::from_millis);

    let report = runtime.block_on(async {
        let mut polled = source.spawn_mutation_poller(poll_interval);
        let (sender, receiver) = mpsc::channel::<MutationRecord>(16);
        let forward = async move {
            while let Some(record) = polled.recv().await {
                if sender.send(record).await.is_err() {
                    break;
                }
            }
        };
        let forward = async move {
            match duration {
                Some(duration) => {
                    let _ = tokio::time::timeout(duration, forward).await;
                }
                None => forward.await,
            }
        };
        let watcher = run_watcher(&source, sink.as_ref(), DebounceConfig::default(), receiver);
        let (report, ()) = tokio::join!(watcher, forward);
        report
    });

    emit_json(serde_json::to_value(report)?)
}

fn run_db(command: DbCommand, api: &TurbineApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => emit_json(serde_json::to_value(api.migrate(args.dry_run)?)?),
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            let ok = report.quick_check_ok && report.invalid_json_keys.is_empty();
            emit_json(serde_json::json!({ "ok": ok, "report": report }))
        }
        DbCommand::Backup(args) => {
            api.backup(&args.out)?;
            emit_json(serde_json::json!({ "backup": args.out.display().to_string() }))
        }
    }
}
