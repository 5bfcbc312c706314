//! Command-line interface definitions.
//!
//! Defines all CLI arguments and subcommands using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// pagesync: incremental page rendering with source-to-canvas coordinate sync
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None, arg_required_else_help = true)]
pub struct Cli {
    /// Project root directory (default: current directory)
    #[arg(short, long)]
    pub root: Option<PathBuf>,

    /// Config file name (default: pagesync.toml)
    #[arg(short = 'C', long, default_value = "pagesync.toml")]
    pub config: PathBuf,

    /// subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Watch sources, rebuild incrementally and serve the query API
    Watch {
        /// Interface to bind on
        #[arg(short, long)]
        interface: Option<String>,

        /// The port you should provide
        #[arg(short, long)]
        port: Option<u16>,

        /// enable the file watcher
        #[arg(short, long, action = clap::ArgAction::Set, num_args = 0..=1, default_missing_value = "true", require_equals = false)]
        watch: Option<bool>,
    },

    /// Compile, render every page and extract the lookup table once
    Build {
        /// Only build this document (default: every primary document)
        document: Option<String>,
    },

    /// Parse the cross-reference log and write the lookup table
    Extract {
        /// Document name
        document: String,
    },

    /// Print the lookup entry for a source line as JSON
    Lookup {
        /// Document name
        document: String,

        /// Line key: `12` for the main file, `chapter.tex:12` otherwise
        line: String,
    },
}

#[allow(unused)]
impl Cli {
    pub const fn is_watch(&self) -> bool {
        matches!(self.command, Commands::Watch { .. })
    }
    pub const fn is_build(&self) -> bool {
        matches!(self.command, Commands::Build { .. })
    }
}
