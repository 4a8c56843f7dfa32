//! Command-line surface: subcommands mirror the OCI runtime CLI convention so this binary is a
//! drop-in `--runtime` target for higher-level tooling that already speaks that convention.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ociproxd", about = "OCI-compatible runtime dispatching to library, LXC and Proxmox VM backends")]
pub struct Cli {
    /// Root directory for storage of container state.
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Path to a JSON config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Force dispatch to a specific backend (`crun`/`runc`, `lxc`, or `vm`), overriding config
    /// and the id-prefix heuristic. Ignored for commands on an already-created container.
    #[arg(long, global = true)]
    pub runtime: Option<String>,

    /// Write logs to this file instead of stderr.
    #[arg(long, global = true)]
    pub log: Option<PathBuf>,

    /// Enable debug-level logging.
    #[arg(long, global = true)]
    pub debug: bool,

    /// Bound the whole invocation to this many seconds; on expiry in-flight subprocesses and
    /// HTTPS requests are abandoned and a `Timeout` error is reported.
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a container from a bundle, without starting it.
    Create {
        #[arg(long)]
        bundle: PathBuf,
        #[arg(long)]
        pid_file: Option<PathBuf>,
        #[arg(long)]
        console_socket: Option<PathBuf>,
        id: String,
    },
    /// Execute the user-defined process in a created container.
    Start { id: String },
    /// Alias for `kill` with the default signal (`TERM`).
    Stop { id: String },
    /// Send a signal to the container's init process.
    Kill {
        id: String,
        #[arg(default_value = "TERM")]
        signal: String,
    },
    /// Delete a container's resources.
    Delete {
        #[arg(long)]
        force: bool,
        id: String,
    },
    /// Output the state of a container.
    State {
        id: String,
        /// Report failures as a JSON object on stderr instead of the default text line.
        #[arg(long)]
        json: bool,
    },
    /// List known containers.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Print backend-reported info for a container.
    Info {
        id: String,
        /// Report failures as a JSON object on stderr instead of the default text line.
        #[arg(long)]
        json: bool,
    },
    /// Execute an additional process inside a running container.
    Exec {
        id: String,
        #[arg(trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// Create and immediately start a container.
    Run {
        #[arg(long)]
        bundle: PathBuf,
        #[arg(long)]
        pid_file: Option<PathBuf>,
        #[arg(long)]
        console_socket: Option<PathBuf>,
        id: String,
    },
    /// Suspend all processes inside the container.
    Pause { id: String },
    /// Resume all processes previously paused.
    Resume { id: String },
    /// List the processes inside a container.
    Ps { id: String },
    /// Generate a starter `config.json`.
    Spec {
        #[arg(long, default_value = ".")]
        bundle: PathBuf,
    },
    /// Stream lifecycle and resource-usage events for a container.
    Events { id: String },
    /// Checkpoint a running container.
    Checkpoint {
        id: String,
        #[arg(long)]
        image_path: PathBuf,
    },
    /// Restore a container from a previous checkpoint.
    Restore {
        id: String,
        #[arg(long)]
        image_path: PathBuf,
        #[arg(long)]
        bundle: PathBuf,
    },
    /// Update container resource constraints.
    Update { id: String },
    /// Report which optional OCI features the resolved backend supports.
    Features { id: Option<String> },
}
