use argh::FromArgs;
use forksh::Interpreter;
use forksh::signals::{self, SESSION};
use log::{LevelFilter, debug};
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

#[derive(FromArgs)]
/// Interactive shell that kills foreground commands running longer than a timeout.
/// Send SIGUSR1 to add 5 seconds to the timeout, SIGUSR2 to remove 5 seconds.
struct Args {
    #[argh(option, default = "signals::DEFAULT_TIMEOUT")]
    /// initial foreground timeout in seconds (at least 5).
    timeout: u64,

    #[argh(option, default = "LevelFilter::Warn")]
    /// log level for diagnostics on stderr: off, error, warn, info, debug or trace.
    log_level: LevelFilter,
}

fn main() -> anyhow::Result<()> {
    let args: Args = argh::from_env();

    TermLogger::init(
        args.log_level,
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )?;

    signals::install_handlers()?;
    SESSION.set_timeout(args.timeout);
    debug!("starting with timeout {}s", SESSION.timeout());

    let code = Interpreter::default().repl()?;
    std::process::exit(code)
}
