use anyhow::{Context, anyhow, bail};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

static EXPECTED_STDOUT_FILE: &str = "expected-stdout";
static EXPECTED_REPLAY_LOG_FILE: &str = "expected-replay-log";
static BLESS_ENV_VAR: &str = "GOLDEN_BLESS";
static WORKBENCH_BINARY: &str = "target/release/topo-workbench";

/// Wall-clock budget of a single scenario, which runs in emulated time and should finish quickly
const SCENARIO_TIMEOUT: Duration = Duration::from_secs(120);

struct TestCase {
    dir: PathBuf,
    name: String,
    args: String,
    expected_stdout: Option<String>,
    expected_replay_log: Option<String>,
}

fn read_optional(path: &Path) -> anyhow::Result<Option<String>> {
    if !path.is_file() {
        return Ok(None);
    }

    std::fs::read_to_string(path)
        .map(Some)
        .with_context(|| format!("failed to read `{}`", path.display()))
}

fn load_test_cases(root: &Path) -> anyhow::Result<Vec<TestCase>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(root).context("golden tests root directory not found")? {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        } else {
            println!("skipping `{}`: not a directory", path.display());
        }
    }
    dirs.sort();

    dirs.into_iter()
        .map(|dir| {
            let args_path = dir.join("args");
            let args = std::fs::read_to_string(&args_path)
                .with_context(|| format!("no `args` file found at `{}`", args_path.display()))?;

            Ok(TestCase {
                name: dir.display().to_string(),
                args,
                expected_stdout: read_optional(&dir.join(EXPECTED_STDOUT_FILE))?,
                expected_replay_log: read_optional(&dir.join(EXPECTED_REPLAY_LOG_FILE))?,
                dir,
            })
        })
        .collect()
}

fn main() -> anyhow::Result<()> {
    let test_cases = load_test_cases(Path::new("golden-tests/tests"))?;

    // Build once, so that compilation does not count against the scenario timeout
    let status = Command::new("cargo")
        .args(["build", "--release", "--bin", "topo-workbench"])
        .status()
        .context("failed to run cargo")?;
    if !status.success() {
        bail!("building topo-workbench failed with {status}");
    }

    let mut failures = 0;
    for test_case in test_cases {
        let name = test_case.name.clone();
        match run_topo_workbench(test_case) {
            Ok(()) => println!("{name}: ✅"),
            Err(TestError::Internal(e)) => {
                println!("{name}: ❌ could not run the scenario\n{e:?}");
                failures += 1;
            }
            Err(TestError::Compare(diffs)) => {
                println!("{name}: ❌");
                for (what, diff) in [("stdout", diffs.stdout), ("replay log", diffs.replay_log)] {
                    if let Some(diff) = diff {
                        println!("--- {what} differs from the expected one:\n{diff}");
                    }
                }
                failures += 1;
            }
        }
    }

    if failures > 0 {
        bail!("{failures} golden test(s) failed");
    }

    Ok(())
}

enum TestError {
    Internal(anyhow::Error),
    Compare(Diffs),
}

struct Diffs {
    stdout: Option<String>,
    replay_log: Option<String>,
}

/// The path given to `--replay-log`, if any
fn replay_log_path(args: &[&str]) -> Option<PathBuf> {
    args.iter()
        .position(|&arg| arg == "--replay-log")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
}

fn run_topo_workbench(test_case: TestCase) -> Result<(), TestError> {
    let workbench_args: Vec<&str> = test_case.args.split_whitespace().collect();
    let command = run_with_timeout(
        Command::new(WORKBENCH_BINARY).args(&workbench_args),
        SCENARIO_TIMEOUT,
    )
    .map_err(TestError::Internal)?;

    if !command.status.success() {
        let stderr = String::from_utf8_lossy(&command.stderr);
        return Err(TestError::Internal(anyhow!(
            "topo-workbench exited with {}:\n{stderr}",
            command.status
        )));
    }

    let stdout = String::from_utf8_lossy(&command.stdout);
    let replay_log = replay_log_path(&workbench_args)
        .map(|path| {
            std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read `{}`", path.display()))
        })
        .transpose()
        .map_err(TestError::Internal)?;

    let stdout_diff = compare_or_bless(
        &test_case.dir.join(EXPECTED_STDOUT_FILE),
        test_case.expected_stdout.as_deref(),
        &stdout,
    )?;

    let replay_log_diff = match replay_log {
        Some(replay_log) => compare_or_bless(
            &test_case.dir.join(EXPECTED_REPLAY_LOG_FILE),
            test_case.expected_replay_log.as_deref(),
            &replay_log,
        )?,
        None => None,
    };

    if stdout_diff.is_some() || replay_log_diff.is_some() {
        Err(TestError::Compare(Diffs {
            stdout: stdout_diff,
            replay_log: replay_log_diff,
        }))
    } else {
        Ok(())
    }
}

fn read_in_background(pipe: Option<impl Read + Send + 'static>) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_end(&mut buf).ok();
        }
        buf
    })
}

/// Runs the command to completion, killing it once `timeout` has elapsed
fn run_with_timeout(command: &mut Command, timeout: Duration) -> anyhow::Result<Output> {
    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to start topo-workbench")?;
    let stdout = read_in_background(child.stdout.take());
    let stderr = read_in_background(child.stderr.take());

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait().context("failed to wait for topo-workbench")? {
            break status;
        }

        if started.elapsed() > timeout {
            child.kill().ok();
            child.wait().ok();
            bail!("topo-workbench was still running after {}s", timeout.as_secs());
        }
        std::thread::sleep(Duration::from_millis(50));
    };

    Ok(Output {
        status,
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    })
}

/// Returns the diff against the expected output
///
/// With `GOLDEN_BLESS` set, the actual output becomes the new expectation instead.
fn compare_or_bless(
    path: &Path,
    expected: Option<&str>,
    actual: &str,
) -> Result<Option<String>, TestError> {
    if std::env::var_os(BLESS_ENV_VAR).is_some() {
        if expected != Some(actual) {
            std::fs::write(path, actual.as_bytes())
                .with_context(|| format!("failed to persist `{}`", path.display()))
                .map_err(TestError::Internal)?;
        }
        return Ok(None);
    }

    match expected {
        Some(expected) if expected != actual => Ok(Some(diff::diff_to_string(expected, actual))),
        Some(_) => Ok(None),
        None => Err(TestError::Internal(anyhow!(
            "`{}` is missing (rerun with {BLESS_ENV_VAR}=1 to record it)",
            path.display()
        ))),
    }
}

mod diff {
    use console::Style;
    use similar::{ChangeTag, TextDiff};
    use std::fmt::Write;

    /// Renders a colored line diff, keeping three lines of context around every change
    pub fn diff_to_string(expected: &str, actual: &str) -> String {
        let diff = TextDiff::from_lines(expected, actual);
        let mut output = String::new();

        for (i, group) in diff.grouped_ops(3).into_iter().enumerate() {
            if i > 0 {
                _ = writeln!(output, "{}", Style::new().dim().apply_to("~".repeat(80)));
            }

            for change in group.iter().flat_map(|op| diff.iter_changes(op)) {
                let (sign, style) = match change.tag() {
                    ChangeTag::Delete => ('-', Style::new().red()),
                    ChangeTag::Insert => ('+', Style::new().green()),
                    ChangeTag::Equal => (' ', Style::new().dim()),
                };
                let line_number = change
                    .old_index()
                    .or(change.new_index())
                    .map_or(0, |index| index + 1);

                _ = write!(
                    output,
                    "{:>5} {}",
                    Style::new().dim().apply_to(line_number),
                    style.apply_to(format!("{sign} {}", change.value()))
                );
                if change.missing_newline() {
                    _ = writeln!(output);
                }
            }
        }

        output
    }
}
