//! Launcher CLI surface: a verb selecting mode, a target specifier, and
//! pass-through arguments. Exit codes: 0 success, 1 configuration error, 2
//! failure to attach.

use std::path::PathBuf;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(name = "drctl", about = "DBI runtime launcher")]
pub struct RdOptions {
    #[structopt(subcommand)]
    pub cmd: RdSubCommand,
}

#[derive(StructOpt, Debug, Clone)]
pub enum RdSubCommand {
    /// Preload-inject the runtime and launch a fresh process under it.
    Run {
        /// Program to execute.
        program: PathBuf,
        /// Arguments passed through to the launched program unchanged.
        args: Vec<String>,
        /// Optional persisted fragment cache to preload.
        #[structopt(long)]
        persist_path: Option<PathBuf>,
    },
    /// Attach to an already-running process by pid.
    Attach {
        pid: libc::pid_t,
    },
    /// Detach from a process previously attached to, letting it resume natively.
    Detach {
        pid: libc::pid_t,
    },
    /// Attach to every process matching a name filter.
    InjectAll {
        name_filter: String,
    },
    /// Detach from every process this launcher previously attached to.
    UninjectAll,
}
