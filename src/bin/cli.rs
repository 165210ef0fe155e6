//! vmstore CLI
//!
//! Offline tooling for a vmstore directory.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, EnvFilter};
use vmstore::{
    BytesValue, Config, DataSource, DigestType, Hash, KeyIndexMode, LeafRecord, LongKey,
    MergeFilter,
};

/// vmstore CLI
#[derive(Parser, Debug)]
#[command(name = "vmstore-cli")]
#[command(about = "Inspect and maintain a vmstore directory")]
#[command(version)]
struct Args {
    /// Storage directory
    #[arg(short, long, default_value = "./vmstore_data")]
    dir: PathBuf,

    /// Largest numeric key
    #[arg(long, default_value = "10000000")]
    max_keys: u64,

    /// Largest path
    #[arg(long, default_value = "20000000")]
    max_paths: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a tree of synthetic leaves in batches
    Populate {
        /// Number of leaves
        #[arg(short, long, default_value = "10000")]
        leaves: u64,

        /// Leaves per commit
        #[arg(short, long, default_value = "1000")]
        batch: u64,

        /// Value size in bytes
        #[arg(long, default_value = "64")]
        value_size: usize,
    },

    /// Print store statistics and optionally one leaf
    Inspect {
        /// Path of a leaf to print
        #[arg(short, long)]
        path: Option<u64>,
    },

    /// Merge data files now
    Compact {
        #[arg(short, long, value_enum, default_value = "full")]
        filter: FilterArg,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FilterArg {
    Small,
    Medium,
    Full,
}

impl From<FilterArg> for MergeFilter {
    fn from(arg: FilterArg) -> Self {
        match arg {
            FilterArg::Small => MergeFilter::Small,
            FilterArg::Medium => MergeFilter::Medium,
            FilterArg::Full => MergeFilter::Full,
        }
    }
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,vmstore=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("vmstore CLI v{}", vmstore::VERSION);
    tracing::info!("Storage directory: {}", args.dir.display());

    let config = Config::builder()
        .storage_dir(&args.dir)
        .key_index(KeyIndexMode::Direct {
            max_keys: args.max_keys,
        })
        .max_paths(args.max_paths)
        .index_chunk_size(64 * 1024)
        .disable_merging()
        .build();

    let source: DataSource<LongKey, BytesValue> = match DataSource::open(config) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to open store: {}", e);
            process::exit(1);
        }
    };

    let result = match args.command {
        Commands::Populate {
            leaves,
            batch,
            value_size,
        } => populate(&source, leaves, batch, value_size),
        Commands::Inspect { path } => inspect(&source, path),
        Commands::Compact { filter } => source.compact(filter.into()).map(|merged| {
            println!("merged {} files", merged);
        }),
    };

    if let Err(e) = result.and_then(|_| source.close()) {
        tracing::error!("{}", e);
        process::exit(1);
    }
}

/// Leaves of a tree with `count` leaves occupy paths `count - 1 ..= 2 * count - 2`
fn populate(
    source: &DataSource<LongKey, BytesValue>,
    count: u64,
    batch: u64,
    value_size: usize,
) -> vmstore::Result<()> {
    if count == 0 {
        return Ok(());
    }
    let first_leaf_path = count - 1;
    let last_leaf_path = 2 * count - 2;

    let mut path = first_leaf_path;
    while path <= last_leaf_path {
        let end = (path + batch.max(1) - 1).min(last_leaf_path);
        let leaves = (path..=end)
            .map(|p| -> vmstore::Result<LeafRecord<LongKey, BytesValue>> {
                let key = p - first_leaf_path + 1;
                let hash = Hash::new(DigestType::Sha384, synthetic_digest(p))?;
                let value = BytesValue(vec![(key % 251) as u8; value_size]);
                Ok(LeafRecord::new(p, LongKey(key), hash, value))
            })
            .collect::<vmstore::Result<Vec<_>>>()?;

        source.save_records(first_leaf_path, last_leaf_path, Vec::new(), leaves)?;
        tracing::info!(from = path, to = end, "committed leaves");
        path = end + 1;
    }
    Ok(())
}

fn synthetic_digest(path: u64) -> Vec<u8> {
    path.to_le_bytes().iter().copied().cycle().take(48).collect()
}

fn inspect(source: &DataSource<LongKey, BytesValue>, path: Option<u64>) -> vmstore::Result<()> {
    let stats = source.stats();
    println!("state:          {:?}", stats.state);
    match stats.leaf_range {
        Some((first, last)) => println!("leaf range:     {}..={}", first, last),
        None => println!("leaf range:     empty"),
    }
    println!("leaf files:     {} ({} bytes)", stats.leaf_files, stats.leaf_bytes);
    println!("bucket files:   {} ({} bytes)", stats.bucket_files, stats.bucket_bytes);

    if let Some(path) = path {
        match source.load_leaf_record(path)? {
            Some(leaf) => println!(
                "leaf {}: key={:?} hash={:?} value={} bytes",
                path,
                leaf.key,
                leaf.hash,
                leaf.value.0.len()
            ),
            None => println!("leaf {}: not found", path),
        }
    }
    Ok(())
}
