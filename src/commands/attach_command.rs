use crate::arch::SupportedArch;
use crate::commands::rd_options::{RdOptions, RdSubCommand};
use crate::commands::RdCommand;
use crate::log::LogLevel::LogInfo;
use crate::startup::Runtime;
use libc::pid_t;
use std::io;

pub struct AttachCommand {
    pid: pid_t,
}

impl AttachCommand {
    pub fn new(options: &RdOptions) -> AttachCommand {
        match options.cmd.clone() {
            RdSubCommand::Attach { pid } => AttachCommand { pid },
            _ => panic!("Unexpected RdSubCommand variant. Not an `Attach` variant!"),
        }
    }
}

impl RdCommand for AttachCommand {
    fn run(&mut self) -> io::Result<()> {
        let arena_base = 0x7000_0000_0000u64;
        match Runtime::attach(SupportedArch::X64, arena_base, &[self.pid]) {
            Ok(_runtime) => {
                log!(LogInfo, "attached to pid {}", self.pid);
                Ok(())
            }
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
        }
    }
}
