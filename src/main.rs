use std::fs::File;
use std::io;
use std::io::prelude::*;
use std::process;
use std::str::FromStr;

use clap::{App, Arg, ArgMatches};
use log::debug;

use regvm::eval::{self, Halt, Limits, Snapshot};
use regvm::{compile_with, DebugSink, Error, Expander, WriterSink};

fn parse_and_eval<S: DebugSink>(
    code: &str,
    limits: Limits,
    prelude: bool,
    sink: S,
) -> Result<(Halt, Snapshot), Error> {
    let expander = if prelude {
        Expander::with_prelude()?
    } else {
        Expander::new()
    };
    let program = compile_with(code, expander)?;
    debug!("running {} instruction(s) with {:?}", program.len(), limits);
    Ok(eval::eval(&program, limits, sink)?)
}

fn numeric_arg<T: FromStr>(args: &ArgMatches, name: &str) -> Result<Option<T>, Error> {
    match args.value_of(name) {
        None => Ok(None),
        Some(text) => text
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Usage(format!("--{}: expected a number, got {:?}", name, text))),
    }
}

fn main_result() -> Result<(Halt, Snapshot), Error> {
    let args = App::new("regvm")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Assembles and runs a program for the register machine")
        .arg(
            Arg::with_name("INPUT")
                .value_name("FILENAME")
                .help("Sets the input file to use")
                .required(true)
                .index(1),
        ).arg(
            Arg::with_name("call-stack")
                .short("c")
                .long("call-stack")
                .value_name("DEPTH")
                .default_value("1024")
                .help("Sets the maximum call stack depth")
                .takes_value(true),
        ).arg(
            Arg::with_name("data-stack")
                .short("s")
                .long("data-stack")
                .value_name("DEPTH")
                .default_value("1024")
                .help("Sets the maximum data stack depth")
                .takes_value(true),
        ).arg(
            Arg::with_name("max-steps")
                .short("n")
                .long("max-steps")
                .value_name("STEPS")
                .help("Stops with an error after this many instructions")
                .takes_value(true),
        ).arg(
            Arg::with_name("no-prelude")
                .long("no-prelude")
                .help("Disables the built-in `if` and `while` macros"),
        ).get_matches();

    let defaults = Limits::default();
    let limits = Limits {
        call_stack: numeric_arg(&args, "call-stack")?.unwrap_or(defaults.call_stack),
        data_stack: numeric_arg(&args, "data-stack")?.unwrap_or(defaults.data_stack),
        max_steps: numeric_arg(&args, "max-steps")?,
    };
    let path = args
        .value_of("INPUT")
        .ok_or_else(|| Error::Usage("no input file".to_string()))?;
    let mut file = File::open(path)?;
    let mut buf = String::new();
    file.read_to_string(&mut buf)?;

    let stdout = io::stdout();
    let sink = WriterSink::new(stdout.lock());
    parse_and_eval(&buf, limits, !args.is_present("no-prelude"), sink)
}

fn main() {
    env_logger::init();
    match main_result() {
        Ok((halt, state)) => println!("Normal termination ({}). {}", halt, state),
        Err(err) => {
            println!("An error occurred.\n{}", err);
            process::exit(1)
        }
    }
}
