//! Scripted command execution inside emulated nodes
//!
//! Each node has a [`Shell`] that runs command lines the way a non-login bash would, except that
//! every program is an emulated one (see [`programs`]). Background jobs keep running after the
//! command line returns, and their output is handed out with the output of the next command
//! line.

pub mod io;
pub mod parser;
pub mod programs;

use crate::network::node::Node;
use crate::shell::io::{Io, Sink};
use crate::shell::parser::{AndOrList, Command, Connector, RedirectTarget, Stream};
use crate::shell::programs::Invocation;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Exit status of a job that was killed (128 + SIGTERM)
const KILLED_STATUS: i32 = 143;
const FIRST_PID: u32 = 1000;

/// What programs need to know about their surroundings
pub struct ShellEnv {
    pub workdir: PathBuf,
    /// Node names and their addresses, like an `/etc/hosts` file
    hosts: Arc<HashMap<String, Ipv4Addr>>,
}

impl ShellEnv {
    pub fn resolve(&self, host: &str) -> Option<Ipv4Addr> {
        if host == "localhost" {
            return Some(Ipv4Addr::LOCALHOST);
        }

        host.parse()
            .ok()
            .or_else(|| self.hosts.get(host).copied())
    }

    pub fn path(&self, path: &str) -> PathBuf {
        self.workdir.join(path)
    }
}

struct Job {
    number: usize,
    pid: u32,
    command: String,
    cancellation_token: CancellationToken,
    handle: JoinHandle<i32>,
}

pub struct Shell {
    node: Arc<Node>,
    env: Arc<ShellEnv>,
    background_output: Arc<Mutex<String>>,
    jobs: Mutex<Vec<Job>>,
    next_pid: AtomicU32,
}

impl Shell {
    pub(crate) fn new(
        node: Arc<Node>,
        workdir: PathBuf,
        hosts: Arc<HashMap<String, Ipv4Addr>>,
    ) -> Self {
        Self {
            node,
            env: Arc::new(ShellEnv { workdir, hosts }),
            background_output: Arc::default(),
            jobs: Mutex::default(),
            next_pid: AtomicU32::new(FIRST_PID),
        }
    }

    /// Runs a command line and returns everything it printed, preceded by the output that
    /// background jobs produced since the previous call
    pub async fn execute(self: &Arc<Self>, line: &str) -> String {
        let output = Arc::new(Mutex::new(String::new()));
        let io = Io::combined(output.clone());

        match parser::parse(line) {
            Ok(items) => {
                for item in items {
                    if item.background {
                        self.spawn_job(item.list, &io);
                    } else {
                        self.run_list(&item.list, &io).await;
                    }
                }
            }
            Err(e) => io.errln(&format!("bash: {e}")),
        }

        let mut result = std::mem::take(&mut *self.background_output.lock());
        result.push_str(&output.lock());
        result
    }

    async fn run_list(self: &Arc<Self>, list: &AndOrList, io: &Io) -> i32 {
        let mut status = self.run_command(&list.first, io).await;
        for (connector, command) in &list.rest {
            let run = match connector {
                Connector::And => status == 0,
                Connector::Or => status != 0,
            };
            if run {
                status = self.run_command(command, io).await;
            }
        }

        status
    }

    async fn run_command(self: &Arc<Self>, command: &Command, io: &Io) -> i32 {
        let io = match self.redirect(command, io) {
            Ok(io) => io,
            Err(message) => {
                io.errln(&format!("bash: {message}"));
                return 1;
            }
        };

        let args = &command.argv;
        match args[0].as_str() {
            "jobs" => {
                self.list_jobs(&io);
                0
            }
            "kill" => self.kill(&args[1..], &io).await,
            "wait" => {
                self.wait_all().await;
                0
            }
            _ => {
                programs::run(Invocation {
                    node: self.node.clone(),
                    args: args.clone(),
                    io,
                    env: self.env.clone(),
                })
                .await
            }
        }
    }

    fn redirect(&self, command: &Command, io: &Io) -> Result<Io, String> {
        let mut io = io.clone();
        for redirect in &command.redirects {
            let sink = match &redirect.target {
                RedirectTarget::File { path, append } => Sink::file(&self.env.path(path), *append)
                    .map_err(|_| format!("{path}: No such file or directory"))?,
                RedirectTarget::Duplicate(Stream::Stderr) => io.stderr.clone(),
                RedirectTarget::Duplicate(_) => io.stdout.clone(),
            };

            match redirect.stream {
                Stream::Stdout => io.stdout = sink,
                Stream::Stderr => io.stderr = sink,
                Stream::Both => {
                    io.stdout = sink.clone();
                    io.stderr = sink;
                }
            }
        }

        Ok(io)
    }

    fn spawn_job(self: &Arc<Self>, list: AndOrList, io: &Io) {
        let mut jobs = self.jobs.lock();
        jobs.retain(|j| !j.handle.is_finished());

        let number = jobs.iter().map(|j| j.number).max().unwrap_or(0) + 1;
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let cancellation_token = self.node.ctx.cancellation_token.child_token();
        let command = list.to_string();

        let shell = self.clone();
        let job_io = Io::combined(self.background_output.clone());
        let job_token = cancellation_token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = job_token.cancelled() => KILLED_STATUS,
                status = shell.run_list(&list, &job_io) => status,
            }
        });

        tracing::debug!(node = %self.node.name(), job = number, "started `{command}` in the background");
        jobs.push(Job {
            number,
            pid,
            command,
            cancellation_token,
            handle,
        });

        io.outln(&format!("[{number}] {pid}"));
    }

    fn list_jobs(&self, io: &Io) {
        let mut jobs = self.jobs.lock();
        let count = jobs.len();
        for (i, job) in jobs.iter().enumerate() {
            let marker = match count - i {
                1 => '+',
                2 => '-',
                _ => ' ',
            };
            let (status, suffix) = if job.handle.is_finished() {
                ("Done", "")
            } else {
                ("Running", " &")
            };
            io.outln(&format!(
                "[{}]{marker}  {status:<24}{}{suffix}",
                job.number, job.command
            ));
        }

        jobs.retain(|j| !j.handle.is_finished());
    }

    async fn kill(&self, args: &[String], io: &Io) -> i32 {
        let mut status = 0;
        // Signal names and numbers are accepted but every signal terminates the job
        for arg in args.iter().filter(|a| !a.starts_with('-')) {
            let job = {
                let mut jobs = self.jobs.lock();
                let position = match arg.strip_prefix('%') {
                    Some(number) => jobs
                        .iter()
                        .position(|j| number.parse() == Ok(j.number)),
                    None => jobs.iter().position(|j| arg.parse() == Ok(j.pid)),
                };
                position.map(|p| jobs.remove(p))
            };

            match job {
                Some(job) => {
                    job.cancellation_token.cancel();
                    job.handle.await.ok();
                }
                None => {
                    if arg.starts_with('%') {
                        io.errln(&format!("bash: kill: {arg}: no such job"));
                    } else {
                        io.errln(&format!("bash: kill: ({arg}) - No such process"));
                    }
                    status = 1;
                }
            }
        }

        status
    }

    async fn wait_all(&self) {
        let jobs: Vec<_> = self.jobs.lock().drain(..).collect();
        for job in jobs {
            job.handle.await.ok();
        }
    }

    /// Terminates every background job, waiting until they are gone
    pub async fn kill_all_jobs(&self) {
        let jobs: Vec<_> = self.jobs.lock().drain(..).collect();
        for job in jobs {
            job.cancellation_token.cancel();
            job.handle.await.ok();
        }
    }
}
