use crate::arch::SupportedArch;
use crate::commands::rd_options::{RdOptions, RdSubCommand};
use crate::commands::RdCommand;
use crate::log::LogLevel::LogInfo;
use crate::startup::Runtime;
use std::fs;
use std::io;

pub struct InjectAllCommand {
    name_filter: String,
}

impl InjectAllCommand {
    pub fn new(options: &RdOptions) -> InjectAllCommand {
        match options.cmd.clone() {
            RdSubCommand::InjectAll { name_filter } => InjectAllCommand { name_filter },
            _ => panic!("Unexpected RdSubCommand variant. Not an `InjectAll` variant!"),
        }
    }

    fn matching_pids(&self) -> io::Result<Vec<libc::pid_t>> {
        let mut pids = Vec::new();
        for entry in fs::read_dir("/proc")? {
            let entry = entry?;
            let pid: libc::pid_t = match entry.file_name().to_str().and_then(|s| s.parse().ok()) {
                Some(pid) => pid,
                None => continue,
            };
            let comm_path = entry.path().join("comm");
            if let Ok(comm) = fs::read_to_string(comm_path) {
                if comm.trim() == self.name_filter {
                    pids.push(pid);
                }
            }
        }
        Ok(pids)
    }
}

impl RdCommand for InjectAllCommand {
    fn run(&mut self) -> io::Result<()> {
        let pids = self.matching_pids()?;
        let arena_base = 0x7000_0000_0000u64;
        for pid in pids {
            match Runtime::attach(SupportedArch::X64, arena_base, &[pid]) {
                Ok(_) => log!(LogInfo, "inject-all: attached to pid {}", pid),
                Err(e) => log!(crate::log::LogLevel::LogWarn, "inject-all: failed to attach to pid {}: {}", pid, e),
            }
        }
        Ok(())
    }
}

pub struct UninjectAllCommand;

impl UninjectAllCommand {
    pub fn new(_options: &RdOptions) -> UninjectAllCommand {
        UninjectAllCommand
    }
}

impl RdCommand for UninjectAllCommand {
    fn run(&mut self) -> io::Result<()> {
        log!(LogInfo, "uninject-all: no persistent injection registry kept by this launcher; nothing to do");
        Ok(())
    }
}
