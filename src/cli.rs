//! CLI argument parsing for linescope

use crate::planner::DispatchMode;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "linescope")]
#[command(version)]
#[command(about = "Line coverage instrumentation with live per-line visit counts", long_about = None)]
pub struct Cli {
    /// Enable debug tracing output to stderr
    #[arg(long = "debug", global = true)]
    pub debug: bool,

    /// Configuration file (linescope.toml)
    #[arg(long = "config", value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Plan and rewrite a class, printing each method's plan and listing
    Instrument {
        /// Class in JSON form
        #[arg(value_name = "CLASS_JSON")]
        class: PathBuf,

        /// Hook dispatch (overrides configuration)
        #[arg(long = "dispatch", value_enum)]
        dispatch: Option<DispatchMode>,
    },

    /// Instrument a class, execute one of its methods and print coverage
    Run {
        /// Class in JSON form
        #[arg(value_name = "CLASS_JSON")]
        class: PathBuf,

        /// Method to invoke
        #[arg(short = 'm', long = "method", value_name = "NAME")]
        method: String,

        /// Integer argument, repeat for each parameter
        #[arg(short = 'a', long = "arg", value_name = "N", allow_hyphen_values = true)]
        args: Vec<i64>,

        /// Hook dispatch (overrides configuration)
        #[arg(long = "dispatch", value_enum)]
        dispatch: Option<DispatchMode>,

        /// Directory searched for source files before the configured path
        #[arg(long = "source-root", value_name = "DIR")]
        source_root: Option<PathBuf>,

        /// Print coverage JSON on one line
        #[arg(long)]
        compact: bool,
    },

    /// Concurrent visit/update stress run checking exact delta delivery
    Stress {
        /// Duration of the visiting phase
        #[arg(long = "seconds", value_name = "SECS", default_value = "2")]
        seconds: u64,

        /// Visiting threads
        #[arg(long = "threads", value_name = "N", default_value = "4")]
        threads: usize,

        /// Lines per source file
        #[arg(long = "lines", value_name = "N", default_value = "64")]
        lines: u32,

        /// Source files
        #[arg(long = "files", value_name = "N", default_value = "8")]
        files: u32,
    },
}
