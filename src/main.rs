use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use clike86::driver;

/// Compiles a small statically-typed C-like source language straight to a
/// 16-bit DOS MZ executable.
///
/// Two invocation forms, per the collaborator CLI contract: `clike86
/// <output.exe>` reads source from standard input; `clike86 <input.src>
/// <output.exe>` reads it from a file.
#[derive(Parser)]
#[command(name = "clike86", version, about)]
struct Cli {
    /// Source file to compile. Omit to read source from standard input, in
    /// which case `output` must be the sole positional argument.
    input: Option<PathBuf>,

    /// Where to write the compiled `.exe`. Required; when `input` is absent
    /// this is the only positional argument given.
    output: Option<PathBuf>,

    /// Raise log verbosity one notch (warn -> info; pass twice for debug).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Override the `#stack` directive's reserved stack size, in bytes.
    #[arg(long)]
    stack: Option<u16>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    let (input, output) = match (cli.input, cli.output) {
        (Some(input), Some(output)) => (Some(input), output),
        (Some(output_only), None) => (None, output_only),
        (None, None) => {
            eprintln!("usage: clike86 <output.exe>  |  clike86 <input.src> <output.exe>");
            return ExitCode::from(1);
        }
    };

    let code = driver::run(input.as_deref(), &output, cli.stack);
    ExitCode::from(code as u8)
}
