//! Small utilities: `timeout`, `sleep`, `echo`, `cat`, `hostname`, `true` and `false`

use crate::shell::programs::{Invocation, ProgramFuture, parse_seconds};
use futures::FutureExt;

const TIMED_OUT_STATUS: i32 = 124;
const TIMEOUT_FAILURE_STATUS: i32 = 125;

pub fn timeout(mut invocation: Invocation) -> ProgramFuture {
    async move {
        let mut args = invocation.args[1..].iter().peekable();
        // Signals are irrelevant here: the command is always terminated
        while let Some(option) = args.next_if(|a| a.starts_with('-') && parse_seconds(a).is_none()) {
            if matches!(option.as_str(), "-s" | "-k" | "--signal" | "--kill-after") {
                args.next();
            }
        }

        let Some(duration) = args.next() else {
            invocation.io.errln("timeout: missing operand");
            invocation
                .io
                .errln("Try 'timeout --help' for more information.");
            return TIMEOUT_FAILURE_STATUS;
        };

        let Some(duration) = parse_seconds(duration) else {
            invocation
                .io
                .errln(&format!("timeout: invalid time interval ‘{duration}’"));
            return TIMEOUT_FAILURE_STATUS;
        };

        let command: Vec<String> = args.cloned().collect();
        if command.is_empty() {
            invocation.io.errln("timeout: missing operand");
            return TIMEOUT_FAILURE_STATUS;
        }

        invocation.args = command;
        let program = super::run(invocation);
        if duration.is_zero() {
            // A zero duration disables the timeout
            return program.await;
        }

        match tokio::time::timeout(duration, program).await {
            Ok(status) => status,
            Err(_) => TIMED_OUT_STATUS,
        }
    }
    .boxed()
}

pub fn sleep(invocation: Invocation) -> ProgramFuture {
    async move {
        if invocation.args.len() < 2 {
            invocation.io.errln("sleep: missing operand");
            return 1;
        }

        let mut total = std::time::Duration::ZERO;
        for arg in &invocation.args[1..] {
            match parse_seconds(arg) {
                Some(duration) => total += duration,
                None => {
                    invocation
                        .io
                        .errln(&format!("sleep: invalid time interval ‘{arg}’"));
                    return 1;
                }
            }
        }

        tokio::time::sleep(total).await;
        0
    }
    .boxed()
}

pub fn echo(invocation: Invocation) -> ProgramFuture {
    let mut args = &invocation.args[1..];
    let mut newline = true;
    while let Some(flag) = args.first().filter(|a| matches!(a.as_str(), "-n" | "-e" | "-E")) {
        if flag == "-n" {
            newline = false;
        }
        args = &args[1..];
    }

    let mut text = args.join(" ");
    if newline {
        text.push('\n');
    }
    invocation.io.out(&text);

    async { 0 }.boxed()
}

pub fn cat(invocation: Invocation) -> ProgramFuture {
    let mut status = 0;
    for file in &invocation.args[1..] {
        match std::fs::read_to_string(invocation.env.path(file)) {
            Ok(contents) => invocation.io.out(&contents),
            Err(_) => {
                invocation
                    .io
                    .errln(&format!("cat: {file}: No such file or directory"));
                status = 1;
            }
        }
    }

    async move { status }.boxed()
}

pub fn hostname(invocation: Invocation) -> ProgramFuture {
    invocation.io.outln(invocation.node.name());
    async { 0 }.boxed()
}

pub fn succeed(_: Invocation) -> ProgramFuture {
    async { 0 }.boxed()
}

pub fn fail(_: Invocation) -> ProgramFuture {
    async { 1 }.boxed()
}
