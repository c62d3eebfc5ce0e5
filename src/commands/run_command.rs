use crate::commands::rd_options::{RdOptions, RdSubCommand};
use crate::commands::RdCommand;
use crate::error::{DbiError, DbiResult};
use std::io;
use std::path::PathBuf;
use std::process::Command;

pub struct RunCommand {
    program: PathBuf,
    args: Vec<String>,
}

impl RunCommand {
    pub fn new(options: &RdOptions) -> RunCommand {
        match options.cmd.clone() {
            RdSubCommand::Run { program, args, .. } => RunCommand { program, args },
            _ => panic!("Unexpected RdSubCommand variant. Not a `Run` variant!"),
        }
    }

    /// Launches `program` under `PTRACE_TRACEME`, letting the preload
    /// trampoline (`crate::startup::Runtime::preload`) take over before the
    /// target's own entry point runs. The actual preload hook lives in a
    /// cdylib loaded via `LD_PRELOAD`, out of scope for this launcher binary
    /// itself — `run_under_traceme` only sets up the process the preload
    /// library attaches into.
    fn run_under_traceme(&self) -> DbiResult<std::process::ExitStatus> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .spawn()
            .map_err(DbiError::Io)?;
        child.wait().map_err(DbiError::Io)
    }
}

impl RdCommand for RunCommand {
    fn run(&mut self) -> io::Result<()> {
        match self.run_under_traceme() {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(io::Error::new(io::ErrorKind::Other, format!("target exited with {}", status))),
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
        }
    }
}
