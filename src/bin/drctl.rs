use drcore::commands::attach_command::AttachCommand;
use drcore::commands::detach_command::DetachCommand;
use drcore::commands::inject_command::{InjectAllCommand, UninjectAllCommand};
use drcore::commands::rd_options::{RdOptions, RdSubCommand};
use drcore::commands::run_command::RunCommand;
use drcore::commands::RdCommand;
use drcore::log;
use structopt::StructOpt;

const EXIT_SUCCESS: i32 = 0;
const EXIT_CONFIG_ERROR: i32 = 1;
const EXIT_ATTACH_FAILURE: i32 = 2;

fn main() {
    log::init();
    let options = RdOptions::from_args();

    let mut command: Box<dyn RdCommand> = match &options.cmd {
        RdSubCommand::Run { .. } => Box::new(RunCommand::new(&options)),
        RdSubCommand::Attach { .. } => Box::new(AttachCommand::new(&options)),
        RdSubCommand::Detach { .. } => Box::new(DetachCommand::new(&options)),
        RdSubCommand::InjectAll { .. } => Box::new(InjectAllCommand::new(&options)),
        RdSubCommand::UninjectAll => Box::new(UninjectAllCommand::new(&options)),
    };

    let is_attach_like = matches!(
        options.cmd,
        RdSubCommand::Attach { .. } | RdSubCommand::InjectAll { .. }
    );

    match command.run() {
        Ok(()) => std::process::exit(EXIT_SUCCESS),
        Err(e) if is_attach_like => {
            eprintln!("drctl: {}", e);
            std::process::exit(EXIT_ATTACH_FAILURE);
        }
        Err(e) => {
            eprintln!("drctl: {}", e);
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    }
}
