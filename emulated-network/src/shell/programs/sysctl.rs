use crate::network::sysctl::Sysctls;
use crate::shell::programs::{Invocation, ProgramFuture};
use clap::Parser;
use futures::FutureExt;

const FAILURE: i32 = 255;

#[derive(Parser, Debug)]
#[command(name = "sysctl", about = "Reads and modifies kernel parameters")]
struct Args {
    /// Enable writing a value to variables
    #[arg(short = 'w')]
    write: bool,
    /// Print only values
    #[arg(short = 'n')]
    values_only: bool,
    /// Display all variables
    #[arg(short = 'a')]
    all: bool,
    /// Do not echo variables set
    #[arg(short = 'q')]
    quiet: bool,
    variables: Vec<String>,
}

pub fn main(invocation: Invocation) -> ProgramFuture {
    let status = run(&invocation);
    async move { status }.boxed()
}

fn run(invocation: &Invocation) -> i32 {
    let args: Args = match invocation.parse_args() {
        Ok(args) => args,
        Err(status) => return status,
    };

    let io = &invocation.io;
    let node = &invocation.node;
    let print = |key: &str, value: &str| {
        if args.values_only {
            io.outln(value);
        } else {
            io.outln(&format!("{key} = {value}"));
        }
    };

    if args.all || args.variables.is_empty() {
        for key in Sysctls::keys() {
            if let Ok(value) = node.sysctl(key) {
                print(key, &value);
            }
        }
        return 0;
    }

    let mut status = 0;
    for variable in &args.variables {
        match variable.split_once('=') {
            Some((key, value)) => match node.set_sysctl(key.trim(), value) {
                Ok(value) => {
                    if !args.quiet {
                        print(key.trim(), &value);
                    }
                }
                Err(e) => {
                    io.errln(&e.to_string());
                    status = FAILURE;
                }
            },
            None if args.write => {
                io.errln(&format!(
                    "sysctl: \"{variable}\" must be of the form name=value"
                ));
                status = FAILURE;
            }
            None => match node.sysctl(variable) {
                Ok(value) => print(variable, &value),
                Err(e) => {
                    io.errln(&e.to_string());
                    status = FAILURE;
                }
            },
        }
    }

    status
}
