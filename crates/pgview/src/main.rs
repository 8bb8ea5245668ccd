//! pgview command line
//!
//! Compile query builder configs, inspect their dependencies, and preview or
//! estimate them against the configured database.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pgview::common::config::PlatformConfig;
use pgview::common::types::ViewPreviewRequest;
use pgview::query::{
    compile, AnalysisInput, CompiledQuery, DependencyAnalyzer, InMemoryCatalog, PostgresDialect,
    QueryBuilderConfig,
};
use pgview::{load_config, Platform};

#[derive(Parser, Debug)]
#[command(name = "pgview")]
#[command(about = "Query builder compilation engine for managed PostgreSQL views", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "pgview.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

/// Query given either as a query builder config or as raw SQL
#[derive(clap::Args, Debug)]
struct QueryInput {
    /// Query builder config (JSON)
    #[arg(required_unless_present = "sql")]
    query: Option<PathBuf>,

    /// Raw SQL file instead of a config
    #[arg(long, conflicts_with = "query")]
    sql: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the SQL, parameters and fingerprint of a config
    Compile {
        /// Query builder config (JSON)
        query: PathBuf,
    },
    /// Print the relations a query reads from
    Deps {
        #[command(flatten)]
        input: QueryInput,

        /// Load the schema catalog from the configured database
        #[arg(long)]
        introspect: bool,
    },
    /// Run a bounded, read-only preview
    Preview {
        #[command(flatten)]
        input: QueryInput,

        /// Rows to return (clamped to the configured ceiling)
        #[arg(long)]
        limit: Option<i64>,
    },
    /// Ask the planner for cost and row estimates
    Estimate {
        #[command(flatten)]
        input: QueryInput,
    },
}

enum LoadedQuery {
    Structured(QueryBuilderConfig),
    RawSql(String),
}

fn read_config(path: &Path) -> anyhow::Result<QueryBuilderConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("{} is not a valid query builder config", path.display()))
}

fn load_query(input: &QueryInput) -> anyhow::Result<LoadedQuery> {
    match (&input.query, &input.sql) {
        (_, Some(sql)) => {
            let sql = std::fs::read_to_string(sql)
                .with_context(|| format!("Failed to read {}", sql.display()))?;
            Ok(LoadedQuery::RawSql(sql))
        }
        (Some(path), None) => Ok(LoadedQuery::Structured(read_config(path)?)),
        (None, None) => bail!("either a config file or --sql is required"),
    }
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn compiled_json(compiled: &CompiledQuery) -> serde_json::Value {
    json!({
        "sql": compiled.sql,
        "params": compiled.params,
        "paramTypes": compiled.param_types,
        "fingerprint": compiled.fingerprint(),
        "compilerVersion": compiled.compiler_version,
    })
}

fn run_compile(path: &Path) -> anyhow::Result<()> {
    let config = read_config(path)?;
    let compiled = compile(&config, &PostgresDialect)?;
    print_json(&compiled_json(&compiled))
}

async fn run_deps(config: PlatformConfig, input: &QueryInput, introspect: bool) -> anyhow::Result<()> {
    let query = load_query(input)?;
    let default_schema = config.compiler.default_schema.clone();

    let catalog = if introspect {
        let platform = Platform::connect(config).await?;
        let catalog = platform.catalog().clone();
        platform.shutdown();
        catalog
    } else {
        InMemoryCatalog::new()
    };

    let analyzer = DependencyAnalyzer::new(&catalog, default_schema);
    let report = match &query {
        LoadedQuery::Structured(config) => analyzer.analyze(AnalysisInput::Structured(config)),
        LoadedQuery::RawSql(sql) => analyzer.analyze(AnalysisInput::RawSql(sql)),
    };

    let dependencies: Vec<_> = report
        .dependencies
        .iter()
        .map(|d| {
            json!({
                "name": d.name.to_string(),
                "dependencyType": d.dependency_type,
                "unresolved": d.unresolved,
            })
        })
        .collect();
    print_json(&json!({
        "dependencies": dependencies,
        "warnings": report.warnings(),
    }))
}

async fn run_preview(config: PlatformConfig, input: &QueryInput, limit: Option<i64>) -> anyhow::Result<()> {
    let query = load_query(input)?;
    let platform = Platform::connect(config).await?;
    let service = platform.service();

    let result = match query {
        LoadedQuery::Structured(config) => {
            let compiled = service.compile(&config)?;
            service.preview_compiled(&compiled, limit).await
        }
        LoadedQuery::RawSql(sql) => {
            service
                .preview_sql(&ViewPreviewRequest {
                    sql_definition: sql,
                    limit,
                })
                .await
        }
    };
    platform.shutdown();
    print_json(&serde_json::to_value(result?)?)
}

async fn run_estimate(config: PlatformConfig, input: &QueryInput) -> anyhow::Result<()> {
    let query = load_query(input)?;
    let platform = Platform::connect(config).await?;
    let service = platform.service();

    let compiled = match query {
        LoadedQuery::Structured(config) => service.compile(&config)?,
        LoadedQuery::RawSql(sql) => {
            CompiledQuery::raw(pgview::views::validate_read_only_sql(&sql)?)
        }
    };
    let metrics = service.estimate(&compiled).await;
    platform.shutdown();
    print_json(&serde_json::to_value(metrics?)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    if args.json_logs {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }

    info!("pgview v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    match &args.command {
        Command::Compile { query } => run_compile(query),
        Command::Deps { input, introspect } => run_deps(config, input, *introspect).await,
        Command::Preview { input, limit } => run_preview(config, input, *limit).await,
        Command::Estimate { input } => run_estimate(config, input).await,
    }
}
