//! Command-line surface: `<program> execute <file> [--heap-log <path>] [--heap-size <megabytes>]`.
//!
//! `clap`'s derive API, matching the convention observed across VM-shaped repos in the retrieval
//! pack (`examples/other_examples/manifests/*`).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "fml", about = "Interpreter for compiled FML bytecode programs")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Load and run a compiled bytecode file.
    Execute {
        /// Path to the binary bytecode file.
        file: PathBuf,

        /// Append one byte per allocator action (alloc/free/collect) to this file.
        #[arg(long, value_name = "PATH")]
        heap_log: Option<PathBuf>,

        /// Arena size in megabytes for the buddy allocator.
        #[arg(long, value_name = "MEGABYTES", default_value_t = 100)]
        heap_size: usize,
    },
}
