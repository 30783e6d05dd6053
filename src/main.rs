use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use argh::FromArgs;
use emu_shell::parser::join_arguments;
use emu_shell::{ConsoleSink, Interpreter, ShellConfig, Sink};

#[derive(FromArgs)]
/// Interactive command shell for the emulator.
struct Args {
    #[argh(option, short = 'c')]
    /// configuration file (TOML)
    config: Option<PathBuf>,

    #[argh(option, short = 'e')]
    /// run a command line and exit; may be repeated
    execute: Vec<String>,

    #[argh(positional)]
    /// script to run before the first prompt
    script: Option<PathBuf>,
}

fn source(shell: &Interpreter, script: &std::path::Path, out: &Sink, err: &Sink) -> i32 {
    let line = join_arguments(&["source".to_string(), script.to_string_lossy().into_owned()]);
    shell.execute_command(&line, Arc::clone(out), Arc::clone(err))
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args: Args = argh::from_env();

    let config = match &args.config {
        Some(path) => match ShellConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{e}");
                return ExitCode::FAILURE;
            }
        },
        None => ShellConfig::default(),
    };

    let shell = Interpreter::with_config(&config);
    let out: Sink = Arc::new(ConsoleSink::stdout());
    let err: Sink = Arc::new(ConsoleSink::stderr());

    for script in config.autoload_script.iter().chain(args.script.iter()) {
        source(&shell, script, &out, &err);
    }

    if !args.execute.is_empty() {
        let mut status = 0;
        for line in &args.execute {
            status = shell.execute_command(line, Arc::clone(&out), Arc::clone(&err));
        }
        shell.shutdown();
        return if status == 0 {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        };
    }

    if let Err(e) = shell.repl(&config.prompt, config.history_file.as_deref()) {
        log::error!("interactive loop failed: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
