//! CaseSync CLI
//!
//! Hosts the sync engine and maintains its local store.
//!
//! # Commands
//!
//! - `serve` - Run the engine over newline-delimited JSON on stdio
//! - `inspect` - Display local store tables and records
//! - `compact` - Compact the local store log

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// CaseSync engine host and store tools.
#[derive(Parser)]
#[command(name = "casesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the local store directory
    #[arg(global = true, short, long)]
    data_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine, reading requests from stdin and writing messages to stdout
    Serve {
        /// Remote endpoint to connect to on start
        #[arg(short, long)]
        endpoint: Option<String>,

        /// Namespace to select
        #[arg(short, long, default_value = "main")]
        namespace: String,

        /// Database to select
        #[arg(long, default_value = "main")]
        database: String,

        /// Tables eligible for local-first resolution (comma separated)
        #[arg(long, value_delimiter = ',')]
        auto_sync: Vec<String>,

        /// Tables cached per user (comma separated)
        #[arg(long, value_delimiter = ',')]
        private: Vec<String>,

        /// Case-scoped tables as TABLE=FIELD (comma separated)
        #[arg(long, value_delimiter = ',')]
        case_scoped: Vec<String>,
    },

    /// Display local store tables and records
    Inspect {
        /// Print the records of this table
        #[arg(short, long)]
        table: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Compact the local store log
    Compact,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // stdout carries protocol traffic in serve mode
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve {
            endpoint,
            namespace,
            database,
            auto_sync,
            private,
            case_scoped,
        } => {
            let options = commands::serve::ServeOptions {
                data_dir: cli.data_dir,
                endpoint,
                namespace,
                database,
                catalog: commands::serve::catalog(&auto_sync, &private, &case_scoped)?,
            };
            commands::serve::run(options)?;
        }
        Commands::Inspect { table, format } => {
            let path = cli.data_dir.ok_or("Store directory required for inspect")?;
            commands::inspect::run(&path, table.as_deref(), &format)?;
        }
        Commands::Compact => {
            let path = cli.data_dir.ok_or("Store directory required for compact")?;
            commands::compact::run(&path)?;
        }
    }

    Ok(())
}
