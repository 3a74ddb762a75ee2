use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where the output of a program goes
#[derive(Clone)]
pub enum Sink {
    Buffer(Arc<Mutex<String>>),
    /// Appended to on every write, so background jobs leave a readable log behind
    File(PathBuf),
    Null,
}

impl Sink {
    /// Opens a file sink, truncating the file unless `append` is set
    pub fn file(path: &Path, append: bool) -> std::io::Result<Self> {
        if path == Path::new("/dev/null") {
            return Ok(Sink::Null);
        }

        OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)?;
        Ok(Sink::File(path.to_path_buf()))
    }

    pub fn write(&self, text: &str) {
        match self {
            Sink::Buffer(buffer) => buffer.lock().push_str(text),
            Sink::File(path) => {
                let result = OpenOptions::new()
                    .append(true)
                    .open(path)
                    .and_then(|mut file| file.write_all(text.as_bytes()));
                if let Err(e) = result {
                    tracing::warn!("failed to write to {}: {e}", path.display());
                }
            }
            Sink::Null => {}
        }
    }
}

/// Standard output and error of a program
#[derive(Clone)]
pub struct Io {
    pub stdout: Sink,
    pub stderr: Sink,
}

impl Io {
    /// Both streams write into the same buffer, which is how `cmd()` returns them
    pub fn combined(buffer: Arc<Mutex<String>>) -> Self {
        Self {
            stdout: Sink::Buffer(buffer.clone()),
            stderr: Sink::Buffer(buffer),
        }
    }

    /// Discards everything, like a daemon detached from its terminal
    pub fn null() -> Self {
        Self {
            stdout: Sink::Null,
            stderr: Sink::Null,
        }
    }

    pub fn out(&self, text: &str) {
        self.stdout.write(text);
    }

    pub fn outln(&self, line: &str) {
        self.stdout.write(&format!("{line}\n"));
    }

    pub fn errln(&self, line: &str) {
        self.stderr.write(&format!("{line}\n"));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_file_sink_truncates_then_appends() {
        let path = std::env::temp_dir().join(format!("sink-test-{}.txt", std::process::id()));
        std::fs::write(&path, "old contents\n").unwrap();

        let sink = Sink::file(&path, false).unwrap();
        sink.write("first\n");
        sink.write("second\n");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");

        let sink = Sink::file(&path, true).unwrap();
        sink.write("third\n");
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "first\nsecond\nthird\n"
        );

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_dev_null() {
        assert!(matches!(
            Sink::file(Path::new("/dev/null"), false).unwrap(),
            Sink::Null
        ));
    }
}
