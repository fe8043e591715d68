//! CLI definitions using clap

use clap::Parser;
use std::path::PathBuf;

/// Hotmod - Load a module and reload it whenever its file changes
#[derive(Parser)]
#[command(name = "hotmod")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the module library
    pub module: PathBuf,

    /// Do not watch the module file; reload only on `reload`
    #[arg(long)]
    pub no_watch: bool,

    /// Configuration file path
    #[arg(short = 'c', long, env = "HOTMOD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}
