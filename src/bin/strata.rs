//! Strata admin tool
//!
//! Opens a data directory in-process and runs one command against it.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use strata::{Config, Engine, KeyRange, ReadOptions, Result, WriteBatch, WriteOptions};

/// Strata admin tool
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(about = "Inspect and maintain a Strata data directory")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./strata_data")]
    data_dir: String,

    /// MemTable size in MB before it is sealed
    #[arg(short = 'm', long, default_value = "4")]
    memtable_mb: usize,

    /// Sync the journal on every write
    #[arg(long)]
    sync: bool,

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
    },

    /// Delete one or more keys in a single batch
    Delete {
        /// The keys to delete
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Print key-value pairs in `[start, limit)`
    Scan {
        /// First key to include
        #[arg(long)]
        start: Option<String>,

        /// First key to exclude
        #[arg(long)]
        limit: Option<String>,

        /// Print in descending key order
        #[arg(long)]
        reverse: bool,

        /// Stop after this many entries
        #[arg(short = 'n', long)]
        max: Option<usize>,
    },

    /// Print level sizes and compaction counters
    Stats,

    /// Compact the key range `[start, end]` (the whole database by default)
    Compact {
        #[arg(long)]
        start: Option<String>,

        #[arg(long)]
        end: Option<String>,
    },

    /// Rebuild the manifest from the table files
    Repair,
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,strata=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let config = Config::builder()
        .data_dir(&args.data_dir)
        .write_buffer_size(args.memtable_mb * 1024 * 1024)
        .sync_writes(args.sync)
        .build();

    let engine = match args.command {
        Commands::Repair => {
            let engine = Engine::repair(config)?;
            println!("repaired {}", args.data_dir);
            print!("{}", engine.stats());
            println!();
            engine
        }
        command => {
            let engine = Engine::open(config)?;
            execute(&engine, command)?;
            engine
        }
    };
    engine.close()
}

fn execute(engine: &Engine, command: Commands) -> Result<()> {
    match command {
        Commands::Get { key } => match engine.get(key.as_bytes())? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => println!("(nil)"),
        },
        Commands::Put { key, value } => {
            engine.put(key, value)?;
            println!("OK");
        }
        Commands::Delete { keys } => {
            let mut batch = WriteBatch::new();
            for key in keys {
                batch.delete(key);
            }
            engine.write(batch, &WriteOptions::default())?;
            println!("OK");
        }
        Commands::Scan {
            start,
            limit,
            reverse,
            max,
        } => {
            let range = KeyRange {
                start: start.map(String::into_bytes),
                limit: limit.map(String::into_bytes),
            };
            let mut iter = engine.iter(&ReadOptions::default(), Some(range))?;
            if reverse {
                iter.seek_to_last()?;
            } else {
                iter.seek_to_first()?;
            }
            let max = max.unwrap_or(usize::MAX);
            let mut count = 0;
            while iter.valid() && count < max {
                println!(
                    "{} => {}",
                    String::from_utf8_lossy(iter.key()),
                    String::from_utf8_lossy(iter.value())
                );
                count += 1;
                if reverse {
                    iter.prev()?;
                } else {
                    iter.next()?;
                }
            }
            println!("({} entries)", count);
        }
        Commands::Stats => {
            println!("{}", engine.stats());
        }
        Commands::Compact { start, end } => {
            let did_work = engine.compact_range(
                start.as_deref().map(str::as_bytes),
                end.as_deref().map(str::as_bytes),
            )?;
            println!("{}", if did_work { "compacted" } else { "nothing to compact" });
            println!("{}", engine.stats());
        }
        // Runs before the engine is opened, see `run`
        Commands::Repair => {}
    }
    Ok(())
}
