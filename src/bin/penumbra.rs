//! Offline helpers for operating Penumbra deployments.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use penumbra::config::GraphConfig;
use penumbra::logging::init_logging;
use penumbra::storage::ids::IdManager;

#[derive(Parser, Debug)]
#[command(
    name = "penumbra",
    version,
    about = "Offline helpers for Penumbra configuration and ids",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "PENUMBRA_LOG",
        default_value = "warn",
        help = "Tracing filter directive, e.g. info or penumbra=debug"
    )]
    log_level: String,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and validate a TOML config, then print the effective settings.
    CheckConfig {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
    /// Print the kind, partition and count encoded in an id.
    DecodeId {
        id: u64,
        #[arg(long, default_value_t = 32, help = "Partition count of the cluster")]
        max_partitions: u32,
    },
    /// Map a user-supplied long onto the vertex id space.
    ToVertexId {
        user_id: u64,
        #[arg(long, default_value_t = 32, help = "Partition count of the cluster")]
        max_partitions: u32,
    },
    /// Recover the user-supplied long from a vertex id.
    FromVertexId {
        id: u64,
        #[arg(long, default_value_t = 32, help = "Partition count of the cluster")]
        max_partitions: u32,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Serialize)]
struct DecodedId {
    id: u64,
    kind: String,
    partition: Option<u32>,
    count: u64,
}

#[derive(Serialize)]
struct MappedId {
    input: u64,
    output: u64,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    match cli.command {
        Command::CheckConfig { path } => {
            let cfg = GraphConfig::load(&path)?;
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&cfg)?),
                OutputFormat::Text => {
                    println!("# {} is valid", path.display());
                    print!("{}", cfg.to_toml_string()?);
                }
            }
        }
        Command::DecodeId { id, max_partitions } => {
            let info = id_manager(max_partitions)?.decode(id)?;
            let decoded = DecodedId {
                id,
                kind: format!("{:?}", info.kind),
                partition: info.partition.map(|p| p.0),
                count: info.count,
            };
            emit(cli.format, &decoded, || {
                let partition = decoded
                    .partition
                    .map_or_else(|| "-".to_owned(), |p| p.to_string());
                println!(
                    "id={} kind={} partition={partition} count={}",
                    decoded.id, decoded.kind, decoded.count
                );
            })?;
        }
        Command::ToVertexId {
            user_id,
            max_partitions,
        } => {
            let mapped = MappedId {
                input: user_id,
                output: id_manager(max_partitions)?.to_vertex_id(user_id)?,
            };
            emit(cli.format, &mapped, || println!("{}", mapped.output))?;
        }
        Command::FromVertexId { id, max_partitions } => {
            let mapped = MappedId {
                input: id,
                output: id_manager(max_partitions)?.from_vertex_id(id)?,
            };
            emit(cli.format, &mapped, || println!("{}", mapped.output))?;
        }
    }
    Ok(())
}

fn id_manager(max_partitions: u32) -> penumbra::Result<IdManager> {
    let cfg = GraphConfig::default().max_partitions(max_partitions);
    cfg.validate()?;
    IdManager::new(cfg.partition_bits(), false)
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Text => printer(),
    }
    Ok(())
}
