use std::path::PathBuf;

use blobdb_crypto::DigestType;
use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "blobdb",
    about = "blobdb: de-duplicating BLOB store tools",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// TOML store configuration
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print a blob.dbx file as CSV
    Dump(DumpArgs),
    /// Store a file
    Add(AddArgs),
    /// Read a blob
    Get(GetArgs),
    /// Drop one reference to a blob
    Remove(IdArgs),
    /// Add one reference to an existing blob
    Copy(IdArgs),
    /// Digest a blob with another algorithm
    Digest(DigestArgs),
    /// Write the store to a tar archive
    Backup(BackupArgs),
    /// Delete unreferenced payloads
    Vacuum(StoreArgs),
    /// Replay the journal and exit
    Recover(StoreArgs),
    /// Show store statistics
    Stats(StoreArgs),
}

#[derive(Args)]
pub struct StoreArgs {
    /// Store data directory (overrides the config file)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Args)]
pub struct DumpArgs {
    pub path: PathBuf,
    #[arg(long, default_value = "blake3-256")]
    pub digest: DigestType,
}

#[derive(Args)]
pub struct AddArgs {
    #[command(flatten)]
    pub store: StoreArgs,
    pub file: PathBuf,
}

#[derive(Args)]
pub struct GetArgs {
    #[command(flatten)]
    pub store: StoreArgs,
    pub id: String,
    /// Write to a file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Args)]
pub struct IdArgs {
    #[command(flatten)]
    pub store: StoreArgs,
    pub id: String,
}

#[derive(Args)]
pub struct DigestArgs {
    #[command(flatten)]
    pub store: StoreArgs,
    pub id: String,
    #[arg(long = "type")]
    pub digest_type: DigestType,
}

#[derive(Args)]
pub struct BackupArgs {
    #[command(flatten)]
    pub store: StoreArgs,
    pub archive: PathBuf,
}
