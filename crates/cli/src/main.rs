mod ops;
mod util;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fam")]
#[command(about = "Manage a family size chicken bucket.")]
pub struct Args {
    /// Path to store application data
    #[arg(long, short = 'd', global = true, env = "FAM_DATA_DIR")]
    pub datadir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print your agent DID
    Whodis,
    /// Print buckets
    Bucket {
        #[command(subcommand)]
        command: Option<ops::bucket::BucketCommand>,
    },
    /// Put a value to the bucket
    Put {
        key: String,
        /// CID of the value
        value: String,
    },
    /// Delete an entry from a bucket
    #[command(alias = "delete")]
    Del { key: String },
    /// List bucket entries
    #[command(alias = "list")]
    Ls {
        /// Filter entries by key prefix
        #[arg(long, short = 'p')]
        pfx: Option<String>,
        /// Filter entries by key greater than
        #[arg(long)]
        gt: Option<String>,
        /// Filter entries by key greater than or equal
        #[arg(long)]
        gte: Option<String>,
        /// Filter entries by key less than
        #[arg(long)]
        lt: Option<String>,
        /// Filter entries by key less than or equal
        #[arg(long)]
        lte: Option<String>,
        /// Limit the number of entries printed
        #[arg(long, short = 'l')]
        limit: Option<usize>,
    },
    /// Push local changes to a remote
    Push { remote: Option<String> },
    /// Pull changes from a remote
    Pull { remote: Option<String> },
    /// Print configured remotes
    Remote {
        #[command(subcommand)]
        command: Option<ops::remote::RemoteCommand>,
    },
}

async fn run(args: Args) -> anyhow::Result<String> {
    let datadir = util::ensure_data_dir(args.datadir)?;
    match args.command {
        Command::Whodis => ops::whodis(&datadir).await,
        Command::Bucket { command } => ops::bucket::run(&datadir, command).await,
        Command::Put { key, value } => ops::kv::put(&datadir, &key, &value).await,
        Command::Del { key } => ops::kv::del(&datadir, &key).await,
        Command::Ls {
            pfx,
            gt,
            gte,
            lt,
            lte,
            limit,
        } => ops::kv::ls(&datadir, pfx, gt, gte, lt, lte, limit).await,
        Command::Push { remote } => ops::sync::push(&datadir, remote).await,
        Command::Pull { remote } => ops::sync::pull(&datadir, remote).await,
        Command::Remote { command } => ops::remote::run(&datadir, command).await,
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("error")),
        )
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(output) => {
            if !output.is_empty() {
                println!("{output}");
            }
        }
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    }
}
