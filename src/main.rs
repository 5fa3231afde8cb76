//! datagate: inspect tables and audit history from the terminal.
//!
//! # Usage
//!
//! ```bash
//! datagate --catalog tables.json read --table 5 --query '{"order":[{"field":"id"}]}'
//! datagate probe --config orders.json
//! datagate --catalog tables.json history --table 5 --row 1
//! ```
//!
//! Environment variables can also be used:
//! - `DATAGATE_AUDIT_DB`: Path to the audit database
//! - `DATAGATE_CATALOG`: Table catalog file
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

use datagate::config::Config;
use datagate::datasource::{ColumnInfo, TableConfig, TableData};
use datagate::observability::metrics::init_metrics_with_endpoint;
use datagate::observability::tracing::init_tracing;
use datagate::query::QuerySpec;
use datagate::service::{Actor, DataService};
use datagate::storage::AuditEntry;

/// Datagate: backend-agnostic row access with edit locks and an audit trail.
#[derive(Parser)]
#[command(name = "datagate")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(flatten)]
    config: Config,

    /// Actor name used for access checks
    #[arg(long, env = "DATAGATE_ACTOR", default_value = "cli")]
    actor: String,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown output format: {s}")),
        }
    }
}

/// Which table a command addresses.
#[derive(Args)]
#[group(required = true, multiple = false)]
struct TargetArgs {
    /// Table id from the catalog
    #[arg(long)]
    table: Option<i64>,

    /// Table config file (JSON with a "kind" tag)
    #[arg(long = "config")]
    config_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that a table's database is reachable
    Probe {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Show a table's columns
    Schema {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Read rows from a table
    Read {
        #[command(flatten)]
        target: TargetArgs,
        /// Query spec as JSON (filter, order, limit, offset)
        #[arg(short, long, default_value = "{}")]
        query: String,
        /// Page size, overriding the query's limit
        #[arg(short, long)]
        limit: Option<i64>,
        /// Rows to skip, overriding the query's offset
        #[arg(long)]
        offset: Option<i64>,
    },
    /// Show audit history
    History {
        /// Table id
        #[arg(long, required_unless_present_any = ["actor_name", "from"])]
        table: Option<i64>,
        /// Row key within the table
        #[arg(long, requires = "table")]
        row: Option<String>,
        /// Entries written by this actor
        #[arg(long = "by")]
        actor_name: Option<String>,
        /// Start of a time range (Unix milliseconds, inclusive)
        #[arg(long, requires = "to")]
        from: Option<i64>,
        /// End of a time range (Unix milliseconds, exclusive)
        #[arg(long, requires = "from")]
        to: Option<i64>,
        /// Maximum entries to show
        #[arg(short, long, default_value_t = 50)]
        limit: u32,
    },
}

fn resolve_target(service: &DataService, target: &TargetArgs) -> Result<TableConfig> {
    if let Some(path) = &target.config_file {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        return Ok(TableConfig::from_json(&json)?);
    }
    match target.table {
        Some(id) => Ok(service.catalog().get(id)?.clone()),
        None => bail!("either --table or --config is required"),
    }
}

fn build_query(service: &DataService, query: &str, limit: Option<i64>, offset: Option<i64>) -> Result<QuerySpec> {
    let mut raw: serde_json::Value =
        serde_json::from_str(query).context("query must be a JSON object")?;
    let Some(object) = raw.as_object_mut() else {
        bail!("query must be a JSON object");
    };
    if let Some(limit) = limit {
        object.insert("limit".into(), limit.into());
    }
    if let Some(offset) = offset {
        object.insert("offset".into(), offset.into());
    }
    Ok(QuerySpec::from_json_with(&raw.to_string(), service.limits())?)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_table(data: &TableData) {
    if data.is_empty() {
        println!("No rows.");
        return;
    }
    println!("{}", data.columns.join("\t"));
    for row in &data.rows {
        let cells: Vec<String> = row.iter().map(ToString::to_string).collect();
        println!("{}", cells.join("\t"));
    }
    println!();
    println!("Total: {} row(s)", data.rows.len());
}

fn print_schema(columns: &[ColumnInfo]) {
    println!("{:<32} {:<20} {:>8} {:>4}", "COLUMN", "TYPE", "NULLABLE", "PK");
    println!("{}", "-".repeat(67));
    for c in columns {
        println!(
            "{:<32} {:<20} {:>8} {:>4}",
            c.name,
            c.data_type,
            if c.nullable { "yes" } else { "no" },
            if c.is_primary_key { "*" } else { "" }
        );
    }
}

fn print_history(entries: &[AuditEntry]) {
    if entries.is_empty() {
        println!("No audit entries.");
        return;
    }
    println!(
        "{:<14} {:<14} {:>6} {:<12} {:<16} {:<12} CHANGE",
        "TIMESTAMP", "KIND", "TABLE", "ROW", "COLUMN", "ACTOR"
    );
    for e in entries {
        let show = |v: &Option<serde_json::Value>| v.as_ref().map_or("-".to_string(), ToString::to_string);
        println!(
            "{:<14} {:<14} {:>6} {:<12} {:<16} {:<12} {} -> {}",
            e.timestamp,
            e.kind,
            e.table_id,
            e.row_key,
            e.column.as_deref().unwrap_or("-"),
            e.actor,
            show(&e.old_value),
            show(&e.new_value)
        );
    }
}

async fn run(service: &DataService, cli: Cli) -> Result<()> {
    let actor = Actor::new(cli.actor);

    match cli.command {
        Commands::Probe { target } => {
            let config = resolve_target(service, &target)?;
            let reachable = service.test_connection(&config).await;
            match cli.output {
                OutputFormat::Text => println!(
                    "{} {}",
                    config.pool_key(),
                    if reachable { "reachable" } else { "unreachable" }
                ),
                OutputFormat::Json => print_json(&serde_json::json!({ "reachable": reachable }))?,
            }
            if !reachable {
                bail!("connection probe failed");
            }
        }
        Commands::Schema { target } => {
            let columns = match target.table {
                Some(id) => service.get_schema(id).await?,
                None => {
                    let config = resolve_target(service, &target)?;
                    service.describe(&config).await?.columns().to_vec()
                }
            };
            match cli.output {
                OutputFormat::Text => print_schema(&columns),
                OutputFormat::Json => print_json(&columns)?,
            }
        }
        Commands::Read {
            target,
            query,
            limit,
            offset,
        } => {
            let spec = build_query(service, &query, limit, offset)?;
            let data = match target.table {
                Some(id) => service.read_table(id, &spec, &actor).await?,
                None => {
                    let config = resolve_target(service, &target)?;
                    service.get_table_data(&config, &spec).await?
                }
            };
            match cli.output {
                OutputFormat::Text => print_table(&data),
                OutputFormat::Json => print_json(&data)?,
            }
        }
        Commands::History {
            table,
            row,
            actor_name,
            from,
            to,
            limit,
        } => {
            let entries = match (table, row, actor_name, from.zip(to)) {
                (Some(table), Some(row), _, _) => service.row_history(table, &row).await?,
                (_, _, _, Some((from, to))) => service.history_between(from, to).await?,
                (_, _, Some(name), _) => service.actor_history(&name, limit).await?,
                (Some(table), None, None, None) => service.table_history(table, limit).await?,
                _ => bail!("history needs --table, --by or --from/--to"),
            };
            match cli.output {
                OutputFormat::Text => print_history(&entries),
                OutputFormat::Json => print_json(&entries)?,
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse configuration from CLI arguments and environment
    let cli = Cli::parse();

    // Initialize tracing/logging
    init_tracing(&cli.config.log_level);

    // Initialize metrics (with optional OTLP export)
    init_metrics_with_endpoint(cli.config.otel_endpoint.as_deref());

    let service = DataService::from_config(&cli.config).context("failed to start datagate")?;
    let result = run(&service, cli).await;

    // Pools are released even when the command failed
    service.shutdown().await;
    result
}
