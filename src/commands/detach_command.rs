use crate::commands::rd_options::{RdOptions, RdSubCommand};
use crate::commands::RdCommand;
use crate::log::LogLevel::LogInfo;
use crate::syscalls;
use libc::pid_t;
use std::io;

/// Detaches from a pid this launcher (or a previous invocation of it)
/// attached to. The launcher itself doesn't keep a `Runtime` around
/// between process invocations — that state lives inside the target
/// process, installed by `attach`/`preload` — so detach here is the raw
/// `PTRACE_DETACH` the in-process runtime's own `Runtime::detach` would
/// otherwise issue, for the case where the launcher is the one holding the
/// ptrace relationship (attach mode) rather than the target's own preload
/// trampoline (which calls `Runtime::detach` directly).
pub struct DetachCommand {
    pid: pid_t,
}

impl DetachCommand {
    pub fn new(options: &RdOptions) -> DetachCommand {
        match options.cmd.clone() {
            RdSubCommand::Detach { pid } => DetachCommand { pid },
            _ => panic!("Unexpected RdSubCommand variant. Not a `Detach` variant!"),
        }
    }
}

impl RdCommand for DetachCommand {
    fn run(&mut self) -> io::Result<()> {
        match syscalls::detach(self.pid) {
            Ok(()) => {
                log!(LogInfo, "detached from pid {}", self.pid);
                Ok(())
            }
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
        }
    }
}
