// Roman II ("RR"): compiler, assembler, and bytecode VM for a small
// dynamically-typed scripting language. `rr [-d] [-h] ENTRY.rr`.

use std::env::args;
use std::path::PathBuf;
use std::process::exit;

use roman2::assembler::Assembler;
use roman2::compiler::Compiler;
use roman2::dump::dump_program;
use roman2::vm::Vm;

const USAGE: &str = "usage: rr [-d] [-h] ENTRY.rr\n\n\
    -d    assemble ENTRY.rr and print the assembly dump instead of running it\n\
    -h    print this message and exit\n\n\
    Logging is controlled by the RR_LOG environment variable (e.g.\n\
    RR_LOG=debug), following the usual tracing-subscriber filter syntax.";

struct Options {
    dump: bool,
    entry: PathBuf,
}

fn parse_args() -> Result<Options, String> {
    let mut dump = false;
    let mut entry = None;

    for arg in args().skip(1) {
        match arg.as_str() {
            "-h" | "--help" => {
                println!("{}", USAGE);
                exit(0);
            }
            "-d" => dump = true,
            other if entry.is_none() => entry = Some(PathBuf::from(other)),
            other => return Err(format!("unexpected argument: {other}")),
        }
    }

    let entry = entry.ok_or_else(|| "missing ENTRY.rr".to_string())?;
    Ok(Options { dump, entry })
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("RR_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let opts = match parse_args() {
        Ok(opts) => opts,
        Err(message) => {
            eprintln!("rr: {message}\n\n{USAGE}");
            exit(0xFF);
        }
    };

    let stubs = match Compiler::new().compile_entry(&opts.entry) {
        Ok(stubs) => stubs,
        Err(err) => {
            eprintln!("rr: {err}");
            exit(0xFF);
        }
    };

    let program = match Assembler::new().assemble(&stubs) {
        Ok(program) => program,
        Err(err) => {
            eprintln!("rr: {err}");
            exit(0xFF);
        }
    };

    if opts.dump {
        println!("{}", dump_program(&program));
        return;
    }

    let mut vm = Vm::new(program);
    match vm.run() {
        Ok(halted) => exit(halted.exit_code as i32),
        Err(fault) => {
            eprintln!("rr: {fault}");
            exit(0xFF);
        }
    }
}
