//! snowbridge - command line client
//!
//! # Usage
//!
//! ```bash
//! # Run a statement
//! snowbridge query "SELECT 2 * 3"
//!
//! # With parameters
//! snowbridge query "SELECT * FROM orders WHERE id = ?" --bind 42
//!
//! # Connectivity check and table columns
//! snowbridge ping
//! snowbridge describe orders --format json
//! ```
//!
//! Connection options come from `--config`, then the default config file,
//! then `SNOWBRIDGE_*` environment variables and flags.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::*;
use snowbridge::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "snowbridge")]
#[command(version)]
#[command(about = "Snowflake client over a generic SQL bridge", long_about = None)]
#[command(after_help = "EXAMPLES:
    snowbridge query 'SELECT CURRENT_WAREHOUSE()'
    snowbridge query 'SELECT * FROM orders WHERE id = ?' --bind 42
    snowbridge describe orders --format json")]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table", global = true)]
    format: OutputFormat,

    /// Verbose output (debug logging)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ConnectionArgs {
    /// Config file (TOML). Defaults to the user config directory.
    #[arg(long, env = "SNOWBRIDGE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// DSN or connection URL
    #[arg(long, env = "SNOWBRIDGE_DSN", global = true)]
    dsn: Option<String>,

    #[arg(long, env = "SNOWBRIDGE_UID", global = true)]
    uid: Option<String>,

    #[arg(long, env = "SNOWBRIDGE_PWD", global = true, hide_env_values = true)]
    pwd: Option<String>,

    #[arg(long, env = "SNOWBRIDGE_WAREHOUSE", global = true)]
    warehouse: Option<String>,

    #[arg(long, env = "SNOWBRIDGE_DATABASE", global = true)]
    database: Option<String>,

    #[arg(long, env = "SNOWBRIDGE_SCHEMA", global = true)]
    schema: Option<String>,

    #[arg(long, env = "SNOWBRIDGE_ROLE", global = true)]
    role: Option<String>,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a statement
    Query {
        /// SQL statement, `?` placeholders bound in order
        sql: String,

        /// Parameter bindings
        #[arg(short, long, value_delimiter = ',')]
        bind: Vec<String>,
    },
    /// Check connectivity
    Ping,
    /// Show column types of a table
    Describe {
        table: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(&cli).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("snowbridge=debug")
    } else {
        EnvFilter::try_from_env("SNOWBRIDGE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: &Cli) -> Result<()> {
    let options = load_options(&cli.connection)?;
    let db = Snowbridge::with_driver(
        SqlxBridge::new(),
        options.clone(),
        PoolConfig::from_options(&options)
            .max_connections(1)
            .min_connections(0),
    )
    .await
    .with_context(|| format!("connecting to {}", options.connection_string_redacted()))?;

    match &cli.command {
        Commands::Query { sql, bind } => {
            let params: Vec<Param> = bind.iter().map(|b| parse_binding(b)).collect();
            let result = db.query(sql.as_str(), &params).await?;
            print_result(&result, &cli.format);
        }
        Commands::Ping => {
            let start = Instant::now();
            let status = db.ping().await?;
            println!(
                "{} {} ({} ms)",
                "✓".green(),
                status,
                start.elapsed().as_millis()
            );
        }
        Commands::Describe { table } => {
            let columns = db.describe_table(table).await?;
            print_columns(&columns, &cli.format);
        }
    }

    db.shutdown().await;
    Ok(())
}

fn load_options(args: &ConnectionArgs) -> Result<ConnectionOptions> {
    let mut options = match &args.config {
        Some(path) => ConnectionOptions::from_file(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => match ConnectionOptions::default_path().filter(|p| p.exists()) {
            Some(path) => ConnectionOptions::from_file(&path)
                .with_context(|| format!("reading {}", path.display()))?,
            None => ConnectionOptions::default(),
        },
    };

    if let Some(dsn) = &args.dsn {
        options.dsn = Some(dsn.clone());
    }
    if let Some(uid) = &args.uid {
        options.uid = Some(uid.clone());
    }
    if let Some(pwd) = &args.pwd {
        options.pwd = Some(pwd.clone());
    }
    if let Some(warehouse) = &args.warehouse {
        options.warehouse = Some(warehouse.clone());
    }
    if let Some(database) = &args.database {
        options.database = Some(database.clone());
    }
    if let Some(schema) = &args.schema {
        options.schema = schema.clone();
    }
    if let Some(role) = &args.role {
        options.role = Some(role.clone());
    }

    if options.dsn.is_none() && options.server.is_none() {
        bail!("no connection configured; pass --dsn or set SNOWBRIDGE_DSN");
    }
    options.validate()?;
    Ok(options)
}

/// Numbers, booleans and `null` are typed; anything else binds as text.
fn parse_binding(binding: &str) -> Param {
    if let Ok(n) = binding.parse::<i64>() {
        n.into()
    } else if let Ok(f) = binding.parse::<f64>() {
        f.into()
    } else if binding.eq_ignore_ascii_case("true") {
        true.into()
    } else if binding.eq_ignore_ascii_case("false") {
        false.into()
    } else if binding.eq_ignore_ascii_case("null") {
        Value::Null.into()
    } else {
        binding.into()
    }
}

fn print_result(result: &QueryResult, format: &OutputFormat) {
    if result.columns.is_empty() {
        println!("{} {} rows affected", "✓".green(), result.num_rows);
        print_warnings(result);
        return;
    }

    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&result.to_json()).unwrap_or_default()
            );
        }
        OutputFormat::Table => {
            let rows: Vec<Vec<String>> = result
                .rows
                .iter()
                .map(|row| row.iter().map(cell).collect())
                .collect();
            print_table(&result.columns, &rows);
            println!();
            println!("{} row(s) returned", result.num_rows.to_string().cyan());
        }
    }
    print_warnings(result);
}

fn print_warnings(result: &QueryResult) {
    if result.num_warnings > 0 {
        eprintln!(
            "{} {} warning(s); run SHOW WARNINGS for details",
            "⚠".yellow(),
            result.num_warnings
        );
    }
}

fn print_columns(columns: &[ColumnType], format: &OutputFormat) {
    match format {
        OutputFormat::Json => {
            let json: Vec<serde_json::Value> = columns
                .iter()
                .map(|c| serde_json::json!({ "name": c.name, "type": c.kind.to_string() }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&json).unwrap_or_default());
        }
        OutputFormat::Table => {
            let rows: Vec<Vec<String>> = columns
                .iter()
                .map(|c| vec![c.name.clone(), c.kind.to_string()])
                .collect();
            print_table(&["name".to_string(), "type".to_string()], &rows);
        }
    }
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        other => other.to_string(),
    }
}

fn print_table(columns: &[String], rows: &[Vec<String>]) {
    if rows.is_empty() {
        println!("{}", columns.join(" │ ").white().bold());
        println!("{}", "(no results)".dimmed());
        return;
    }

    let mut widths: Vec<usize> = columns.iter().map(|c| c.chars().count()).collect();
    for row in rows {
        for (w, val) in widths.iter_mut().zip(row) {
            *w = (*w).max(val.chars().count());
        }
    }

    let header: Vec<String> = columns
        .iter()
        .zip(&widths)
        .map(|(c, w)| format!("{:width$}", c, width = *w))
        .collect();
    println!("{}", header.join(" │ ").white().bold());

    let sep: Vec<String> = widths.iter().map(|w| "─".repeat(*w)).collect();
    println!("{}", sep.join("─┼─").dimmed());

    for row in rows {
        let cells: Vec<String> = row
            .iter()
            .zip(&widths)
            .map(|(v, w)| format!("{:width$}", v, width = *w))
            .collect();
        println!("{}", cells.join(" │ "));
    }
}
