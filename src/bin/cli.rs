//! StrataKV CLI
//!
//! Local administration tool operating directly on a data directory.

use std::process;

use clap::{Parser, Subcommand};
use stratakv::{destroy_store, Config, Engine, ReadOptions, WriteBatch, WriteOptions};
use tracing_subscriber::{fmt, EnvFilter};

/// StrataKV CLI
#[derive(Parser, Debug)]
#[command(name = "stratakv-cli")]
#[command(about = "Local admin tool for a StrataKV data directory")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./stratakv_data")]
    data_dir: String,

    /// Fail if the store does not exist yet
    #[arg(long)]
    no_create: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a value by key
    Get {
        /// The key to get
        key: String,
    },

    /// Set a key-value pair
    Put {
        /// The key to set
        key: String,

        /// The value to set
        value: String,

        /// fsync the log before returning
        #[arg(long)]
        sync: bool,
    },

    /// Delete a key
    Delete {
        /// The key to delete
        key: String,
    },

    /// Print keys in order, optionally only those with a prefix
    Scan {
        #[arg(long)]
        prefix: Option<String>,

        /// Stop after this many keys
        #[arg(long, default_value = "100")]
        limit: usize,
    },

    /// Compact the whole key range (or [begin, end])
    Compact {
        #[arg(long)]
        begin: Option<String>,

        #[arg(long)]
        end: Option<String>,
    },

    /// Print level statistics
    Stats,

    /// Delete every store file in the data directory
    Destroy,
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        tracing::error!("{}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> stratakv::Result<()> {
    if let Commands::Destroy = args.command {
        return destroy_store(args.data_dir.as_ref());
    }

    let config = Config::builder()
        .data_dir(&args.data_dir)
        .create_if_missing(!args.no_create)
        .build();
    let engine = Engine::open(config)?;

    match args.command {
        Commands::Get { key } => match engine.get(key.as_bytes())? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => println!("(not found)"),
        },
        Commands::Put { key, value, sync } => {
            let mut batch = WriteBatch::new();
            batch.put(key.as_bytes(), value.as_bytes());
            let options = if sync {
                WriteOptions::sync()
            } else {
                WriteOptions::default()
            };
            engine.write(&options, batch)?;
            println!("OK");
        }
        Commands::Delete { key } => {
            engine.delete(key.as_bytes())?;
            println!("OK");
        }
        Commands::Scan { prefix, limit } => {
            let prefix = prefix.unwrap_or_default();
            let mut shown = 0;
            for entry in engine.iter(&ReadOptions::default())? {
                let (key, value) = entry?;
                if !key.starts_with(prefix.as_bytes()) {
                    continue;
                }
                println!(
                    "{} => {}",
                    String::from_utf8_lossy(&key),
                    String::from_utf8_lossy(&value)
                );
                shown += 1;
                if shown >= limit {
                    break;
                }
            }
        }
        Commands::Compact { begin, end } => {
            engine.compact_range(
                begin.as_deref().map(str::as_bytes),
                end.as_deref().map(str::as_bytes),
            )?;
            println!("OK");
        }
        Commands::Stats => {
            if let Some(stats) = engine.property("stratakv.stats") {
                print!("{}", stats);
            }
            if let Some(tables) = engine.property("stratakv.sstables") {
                print!("{}", tables);
            }
        }
        Commands::Destroy => unreachable!("handled before opening"),
    }

    engine.close()
}
