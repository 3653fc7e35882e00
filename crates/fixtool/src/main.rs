use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use fixtool_core::catalog::{
    CatalogApi, CatalogClient, CatalogClientConfig, CatalogFile, group_by_catalog_id,
};
use fixtool_core::compiler::{InstallerDocument, compile_group};
use fixtool_core::config::{FixtoolConfig, load_config};
use fixtool_core::fixes::{FixScript, all_fix_ids, list_fix_groups, list_fix_ids, parse_fix_group};
use fixtool_core::providers::{SqliteProviderIndex, load_record_file};
use fixtool_core::reconcile::{ReconcileOptions, match_library_games, reconcile};
use fixtool_core::repository::update_repository;
use fixtool_core::runtime::{
    PathOverrides, ResolutionContext, ResolvedPaths, init_layout, inspect_runtime,
    normalize_for_display, resolve_paths,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "fixtool",
    version,
    about = "Convert community compatibility fixes into launcher installer scripts"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH", help = "Fix repository mirror")]
    fixes_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    overrides: PathOverrides,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            overrides: PathOverrides {
                project_root: cli.project_root.clone(),
                data_dir: cli.data_dir.clone(),
                fixes_dir: cli.fixes_dir.clone(),
                config: cli.config.clone(),
            },
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Create the state directory and default config")]
    Init(InitArgs),
    #[command(about = "Show resolved runtime paths")]
    Paths,
    #[command(about = "Clone or pull the fix repository mirror")]
    Sync,
    #[command(about = "List fix groups in the mirror")]
    Groups,
    #[command(about = "Print the operations extracted from a fix group")]
    Parse(ParseArgs),
    #[command(about = "Compile a fix group into installer documents")]
    Convert(ConvertArgs),
    #[command(about = "Cross-reference the catalog, fixes and provider records")]
    Check(CheckArgs),
    #[command(about = "List library games matching the library fix group")]
    Matches,
    Db(DbArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

impl OutputFormat {
    fn extension(self) -> &'static str {
        match self {
            Self::Yaml => "yml",
            Self::Json => "json",
        }
    }
}

#[derive(Debug, Args)]
struct ParseArgs {
    group: String,
    #[arg(long, value_name = "ID", help = "Only this fix id")]
    id: Option<String>,
    #[arg(long, help = "Print JSON instead of text")]
    json: bool,
}

#[derive(Debug, Args)]
struct ConvertArgs {
    group: String,
    #[arg(long, value_name = "ID", help = "Only this fix id")]
    id: Option<String>,
    #[arg(long, value_enum, default_value = "yaml")]
    format: OutputFormat,
    #[arg(long, value_name = "DIR", help = "Write one file per fix id")]
    out_dir: Option<PathBuf>,
    #[arg(long, help = "Report unhandled operations and continue")]
    keep_going: bool,
}

#[derive(Debug, Args)]
struct CheckArgs {
    #[arg(long, value_name = "PATH", help = "Read the catalog from a JSON file")]
    catalog_file: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct DbArgs {
    #[command(subcommand)]
    command: DbSubcommand,
}

#[derive(Debug, Subcommand)]
enum DbSubcommand {
    #[command(about = "Import provider records from a JSON file")]
    Import { path: PathBuf },
    Stats,
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Paths) => run_paths(&runtime),
        Some(Commands::Sync) => run_sync(&runtime),
        Some(Commands::Groups) => run_groups(&runtime),
        Some(Commands::Parse(args)) => run_parse(&runtime, args),
        Some(Commands::Convert(args)) => run_convert(&runtime, args),
        Some(Commands::Check(args)) => run_check(&runtime, args),
        Some(Commands::Matches) => run_matches(&runtime),
        Some(Commands::Db(DbArgs { command })) => match command {
            DbSubcommand::Import { path } => run_db_import(&runtime, &path),
            DbSubcommand::Stats => run_db_stats(&runtime),
        },
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(&paths, args.force)?;

    println!("Initialized fixtool runtime layout");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!("state_dir: {}", normalize_for_display(&paths.state_dir));
    println!("data_dir: {}", normalize_for_display(&paths.data_dir));
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_paths(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;

    println!("runtime paths");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!("fixes_dir: {}", normalize_for_display(&paths.fixes_dir));
    println!("fixes_dir_exists: {}", format_flag(status.fixes_dir_exists));
    println!(
        "extra_ids_path: {}",
        normalize_for_display(&paths.extra_ids_path)
    );
    println!("extra_ids_exists: {}", format_flag(status.extra_ids_exists));
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("db_exists: {}", format_flag(status.db_exists));
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("config_exists: {}", format_flag(status.config_exists));
    print_warnings(&status.warnings);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_sync(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let url = config.repository_url();
    let report = update_repository(&url, &paths.fixes_dir)?;

    println!("repository sync");
    println!("url: {url}");
    println!("fixes_dir: {}", normalize_for_display(&paths.fixes_dir));
    println!("action: {}", report.action.as_str());
    if !report.stdout.is_empty() {
        println!("{}", report.stdout);
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_groups(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    ensure_fixes_dir(&paths)?;

    let groups = list_fix_groups(&paths.fixes_dir, config.group_prefix())?;
    println!("groups.count: {}", groups.len());
    for group in &groups {
        let ids = list_fix_ids(&paths.fixes_dir.join(group), config.id_prefix())?;
        println!("{group}: {}", ids.len());
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_parse(runtime: &RuntimeOptions, args: ParseArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let scripts = load_group(&paths, &config, &args.group, args.id.as_deref())?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&scripts)?);
        return Ok(());
    }
    for script in &scripts {
        println!("{}", script.id);
        for operation in &script.operations {
            println!("  - {operation}");
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_convert(runtime: &RuntimeOptions, args: ConvertArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let scripts = load_group(&paths, &config, &args.group, args.id.as_deref())?;

    if let Some(out_dir) = &args.out_dir {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create {}", out_dir.display()))?;
    }

    let mut converted = 0usize;
    let mut empty = 0usize;
    let mut failed = 0usize;
    for compiled in compile_group(&scripts) {
        let document = match compiled.result {
            Ok(document) => document,
            Err(error) if args.keep_going => {
                warn!(id = %compiled.id, %error, "conversion failed");
                failed += 1;
                continue;
            }
            Err(error) => return Err(error.into()),
        };
        if document.is_empty() {
            empty += 1;
            continue;
        }
        let rendered = render_document(&document, args.format)?;
        match &args.out_dir {
            Some(out_dir) => {
                let path = out_dir.join(format!("{}.{}", compiled.id, args.format.extension()));
                fs::write(&path, rendered)
                    .with_context(|| format!("failed to write {}", path.display()))?;
            }
            None => {
                println!("{}", compiled.id);
                println!("{}", rendered.trim_end());
            }
        }
        converted += 1;
    }

    info!(converted, empty, failed, group = %args.group, "conversion finished");
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_check(runtime: &RuntimeOptions, args: CheckArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    ensure_fixes_dir(&paths)?;
    let index = open_existing_index(&paths)?;

    let entries = match &args.catalog_file {
        Some(path) => CatalogFile::new(path).fetch_entries()?,
        None => CatalogClient::new(CatalogClientConfig::from_config(&config))?.fetch_entries()?,
    };
    let catalog = group_by_catalog_id(entries);
    let fix_ids = all_fix_ids(
        &paths.fixes_dir,
        config.group_prefix(),
        config.id_prefix(),
        extra_ids_path(&paths),
    )?;
    info!(
        catalog_ids = catalog.len(),
        fix_ids = fix_ids.len(),
        "reconciling fixes"
    );

    let report = reconcile(
        &catalog,
        &fix_ids,
        &index,
        &ReconcileOptions::from_config(&config),
    )?;
    for row in &report.unmatched_fix_rows {
        println!("{}", row.to_csv_line());
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_matches(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    ensure_fixes_dir(&paths)?;
    let index = open_existing_index(&paths)?;

    let ids = list_fix_ids(
        &paths.fixes_dir.join(config.library_group()),
        config.id_prefix(),
    )?;
    let report = match_library_games(&index, &ids, config.library_provider())?;
    for library_match in &report.matches {
        println!("{} {}", library_match.name, library_match.provider_list());
    }
    println!("Unmatched IDs");
    for id in &report.unmatched {
        println!("{id}");
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_import(runtime: &RuntimeOptions, path: &Path) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let records = load_record_file(path)?;
    let mut index = SqliteProviderIndex::open(&paths.db_path)?;
    let report = index.import_records(&records)?;

    println!("db import");
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("library_games: {}", report.library_games);
    println!("provider_games: {}", report.provider_games);
    println!("new_associations: {}", report.new_associations);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_stats(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;

    println!("db stats");
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("db_exists: {}", format_flag(status.db_exists));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    if status.db_exists {
        let stats = SqliteProviderIndex::open(&paths.db_path)?.stats()?;
        println!("library_games: {}", stats.library_games);
        println!("provider_games: {}", stats.provider_games);
        println!("associations: {}", stats.associations);
    } else {
        println!("db.storage: <not built> (run `fixtool db import <path>`)");
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn load_group(
    paths: &ResolvedPaths,
    config: &FixtoolConfig,
    group: &str,
    id: Option<&str>,
) -> Result<Vec<FixScript>> {
    ensure_fixes_dir(paths)?;
    if !paths.fixes_dir.join(group).is_dir() {
        bail!(
            "fix group `{group}` not found in {}",
            normalize_for_display(&paths.fixes_dir)
        );
    }
    let mut scripts = parse_fix_group(&paths.fixes_dir, group, config.id_prefix())?;
    if let Some(id) = id {
        scripts.retain(|script| script.id == id);
        if scripts.is_empty() {
            bail!("fix id `{id}` not found in group `{group}`");
        }
    }
    Ok(scripts)
}

fn render_document(document: &InstallerDocument, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Yaml => {
            serde_yaml::to_string(document).context("failed to render installer YAML")
        }
        OutputFormat::Json => {
            serde_json::to_string_pretty(document).context("failed to render installer JSON")
        }
    }
}

fn ensure_fixes_dir(paths: &ResolvedPaths) -> Result<()> {
    if !paths.fixes_dir.is_dir() {
        bail!(
            "fix repository not found at {} (run `fixtool sync`)",
            normalize_for_display(&paths.fixes_dir)
        );
    }
    Ok(())
}

fn open_existing_index(paths: &ResolvedPaths) -> Result<SqliteProviderIndex> {
    if !paths.db_path.exists() {
        bail!(
            "provider database not found at {} (run `fixtool db import <path>`)",
            normalize_for_display(&paths.db_path)
        );
    }
    SqliteProviderIndex::open(&paths.db_path)
}

fn extra_ids_path(paths: &ResolvedPaths) -> Option<&Path> {
    if paths.extra_ids_path.exists() {
        Some(paths.extra_ids_path.as_path())
    } else {
        warn!(
            path = %normalize_for_display(&paths.extra_ids_path),
            "extra fix id list missing, using fix groups only"
        );
        None
    }
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let initial = resolve_paths(&context, &runtime.overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &runtime.overrides)
}

fn print_warnings(warnings: &[String]) {
    if warnings.is_empty() {
        return;
    }
    println!("warnings:");
    for warning in warnings {
        println!("  - {warning}");
    }
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
