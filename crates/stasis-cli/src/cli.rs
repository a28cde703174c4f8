use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use stasis_crypto::Compression;
use stasis_store::Backend;

#[derive(Parser)]
#[command(
    name = "stasis",
    about = "Inspect and maintain stasis save files",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Raise log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// TOML file with store settings
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Store backend: tree, boxed or binary
    #[arg(long, global = true)]
    pub backend: Option<Backend>,

    /// Compression: none, zstd or gzip
    #[arg(long, global = true)]
    pub compression: Option<Compression>,

    /// Obfuscate written files
    #[arg(long, global = true)]
    pub obfuscate: bool,

    /// Build tag recorded in written files
    #[arg(long, global = true)]
    pub build_tag: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create an empty save file
    Init(InitArgs),
    /// Show a save file's header and index summary
    Inspect(InspectArgs),
    /// List record keys
    Keys(KeysArgs),
    /// Print one record as JSON
    Show(ShowArgs),
    /// Merge a save file's records into another file
    Copy(CopyArgs),
    /// List save files in a directory, newest first
    Slots(SlotsArgs),
}

#[derive(Args)]
pub struct InitArgs {
    pub path: PathBuf,
    /// Replace an existing file
    #[arg(long)]
    pub force: bool,
}

#[derive(Args)]
pub struct InspectArgs {
    pub path: PathBuf,
}

#[derive(Args)]
pub struct KeysArgs {
    pub path: PathBuf,
    /// Only keys starting with this prefix
    #[arg(long)]
    pub prefix: Option<String>,
}

#[derive(Args)]
pub struct ShowArgs {
    pub path: PathBuf,
    pub key: String,
}

#[derive(Args)]
pub struct CopyArgs {
    pub source: PathBuf,
    pub destination: PathBuf,
}

#[derive(Args)]
pub struct SlotsArgs {
    pub dir: PathBuf,
    #[arg(long, default_value = stasis_engine::DEFAULT_EXTENSION)]
    pub extension: String,
}
