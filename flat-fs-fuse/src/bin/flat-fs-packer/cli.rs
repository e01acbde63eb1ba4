use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(version, about = "Build and inspect flat-fs images")]
pub struct Cli {
    /// Image file
    #[arg(long, short, default_value = "fs.img")]
    pub image: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create a fresh image
    Format {
        /// Image size in blocks
        #[arg(long, short, default_value_t = 1000)]
        blocks: usize,

        /// Number of inodes, which caps the number of files
        #[arg(long, short, default_value_t = 64)]
        files: u32,
    },

    /// Copy every regular file of a host directory into the image
    Pack { source: PathBuf },

    /// List files
    Ls,

    /// Print a file to stdout
    Cat { name: String },

    /// Delete a file
    Rm { name: String },

    /// Show capacity and usage
    Stat,
}
