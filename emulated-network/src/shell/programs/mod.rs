//! Emulated versions of the programs that scripts run inside nodes

pub mod builtins;
pub mod http;
pub mod iperf;
pub mod net_tools;
pub mod ping;
pub mod sysctl;
pub mod tcpdump;

use crate::network::node::Node;
use crate::shell::ShellEnv;
use crate::shell::io::Io;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;

pub const COMMAND_NOT_FOUND: i32 = 127;

/// A program started by the shell
pub struct Invocation {
    pub node: Arc<Node>,
    /// Program name followed by its arguments
    pub args: Vec<String>,
    pub io: Io,
    pub env: Arc<ShellEnv>,
}

impl Invocation {
    pub fn program(&self) -> &str {
        &self.args[0]
    }

    /// Parses the arguments with clap, printing usage errors the way clap does
    pub fn parse_args<T: clap::Parser>(&self) -> Result<T, i32> {
        self.parse_args_from(&self.args)
    }

    /// Like [`Invocation::parse_args`], for programs whose flags start further in (such as
    /// `python -m <module>`). The first element is used as the program name.
    pub fn parse_args_from<T: clap::Parser>(&self, args: &[String]) -> Result<T, i32> {
        T::try_parse_from(args).map_err(|e| {
            let rendered = e.render().to_string();
            if e.use_stderr() {
                self.io.stderr.write(&rendered);
            } else {
                self.io.stdout.write(&rendered);
            }
            e.exit_code()
        })
    }
}

/// Resolves to the exit status of the program
pub type ProgramFuture = BoxFuture<'static, i32>;

type Program = fn(Invocation) -> ProgramFuture;

fn lookup(name: &str) -> Option<Program> {
    let program: Program = match name {
        "iperf" => iperf::main,
        "tcpdump" => tcpdump::main,
        "ip" => net_tools::ip,
        "route" => net_tools::route,
        "arp" => net_tools::arp,
        "ifconfig" => net_tools::ifconfig,
        "sysctl" => sysctl::main,
        "ping" => ping::main,
        "python" | "python3" => http::python,
        "curl" => http::curl,
        "timeout" => builtins::timeout,
        "sleep" => builtins::sleep,
        "echo" => builtins::echo,
        "cat" => builtins::cat,
        "hostname" => builtins::hostname,
        "true" => builtins::succeed,
        "false" => builtins::fail,
        _ => return None,
    };

    Some(program)
}

pub fn run(invocation: Invocation) -> ProgramFuture {
    match lookup(invocation.program()) {
        Some(program) => program(invocation),
        None => {
            invocation.io.errln(&format!(
                "bash: {}: command not found",
                invocation.program()
            ));
            async { COMMAND_NOT_FOUND }.boxed()
        }
    }
}

/// Parses durations the way coreutils does (`10`, `0.5`, `2s`, `1m`, `1h`)
pub fn parse_seconds(s: &str) -> Option<Duration> {
    let (number, multiplier) = match s.char_indices().last()? {
        (i, 's') => (&s[..i], 1.0),
        (i, 'm') => (&s[..i], 60.0),
        (i, 'h') => (&s[..i], 3600.0),
        (i, 'd') => (&s[..i], 86400.0),
        _ => (s, 1.0),
    };

    let seconds: f64 = number.parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }

    Some(Duration::from_secs_f64(seconds * multiplier))
}

/// Runs a whitespace-separated command line, returning its status and combined output
#[cfg(test)]
pub(crate) async fn run_line(node: &Arc<Node>, line: &str) -> (i32, String) {
    let output = Arc::new(parking_lot::Mutex::new(String::new()));
    let invocation = Invocation {
        node: node.clone(),
        args: line.split_whitespace().map(String::from).collect(),
        io: Io::combined(output.clone()),
        env: Arc::new(ShellEnv {
            workdir: std::env::temp_dir(),
            hosts: Arc::default(),
        }),
    };

    let status = run(invocation).await;
    let output = output.lock().clone();
    (status, output)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_seconds() {
        assert_eq!(parse_seconds("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_seconds("0.5"), Some(Duration::from_millis(500)));
        assert_eq!(parse_seconds("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_seconds("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_seconds("-1"), None);
        assert_eq!(parse_seconds("abc"), None);
        assert_eq!(parse_seconds(""), None);
    }
}
