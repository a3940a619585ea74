//! Command-line surface for the node daemon binary.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hyperfenced")]
#[command(author, version, about = "Hyperconverged cluster node daemon", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the node daemon: keepalive loop, failure detector, fencer,
    /// primary elector, and VM/migration controllers.
    Run {
        /// Path to the unified YAML config file, bypassing the default
        /// search order.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Drain this node's VMs onto other hosts for maintenance (spec §4.9).
    Flush {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Reverse a prior flush, restarting VMs this node previously hosted.
    Ready {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print the resolved configuration and exit.
    ShowConfig {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}
