//! Child process execution with captured output and an optional deadline.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Exit code reported when a command is killed at its deadline.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// stdout followed by stderr, trimmed.
    pub fn combined(&self) -> String {
        let out = self.stdout.trim_end();
        let err = self.stderr.trim_end();
        match (out.is_empty(), err.is_empty()) {
            (true, true) => String::new(),
            (false, true) => out.to_string(),
            (true, false) => err.to_string(),
            (false, false) => format!("{}\n{}", out, err),
        }
    }
}

/// Run to completion and capture output.
pub fn run(command: &mut Command) -> std::io::Result<ProcessOutput> {
    let output = command.stdin(Stdio::null()).output()?;
    Ok(ProcessOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        timed_out: false,
    })
}

/// Run with a deadline. On expiry the child is killed and whatever output it
/// produced so far is returned with `timed_out` set.
pub fn run_with_timeout(command: &mut Command, timeout: Duration) -> std::io::Result<ProcessOutput> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break Some(status);
        }
        if Instant::now() >= deadline {
            kill(&mut child);
            break None;
        }
        thread::sleep(POLL_INTERVAL);
    };

    let timed_out = status.is_none();
    if !timed_out {
        // Normal exit: pipes close with the child, so the readers finish.
        let _ = stdout.1.join();
        let _ = stderr.1.join();
    }
    // After a kill, grandchildren may still hold the pipes open; take a
    // snapshot instead of joining.
    let stdout = snapshot(&stdout.0);
    let mut stderr = snapshot(&stderr.0);
    if timed_out {
        if !stderr.is_empty() {
            stderr.push('\n');
        }
        stderr.push_str(&format!("Command timed out after {} seconds", timeout.as_secs()));
    }

    Ok(ProcessOutput {
        exit_code: match status {
            Some(s) => s.code(),
            None => Some(TIMEOUT_EXIT_CODE),
        },
        stdout,
        stderr,
        timed_out,
    })
}

type Drain = (Arc<Mutex<Vec<u8>>>, thread::JoinHandle<()>);

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Drain {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&buffer);
    let handle = thread::spawn(move || {
        let Some(mut pipe) = pipe else { return };
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut buf) = sink.lock() {
                        buf.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
    });
    (buffer, handle)
}

fn snapshot(buffer: &Arc<Mutex<Vec<u8>>>) -> String {
    buffer
        .lock()
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default()
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Keep the last `max_chars` characters, marking the cut.
pub fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let skip = count - max_chars;
    let kept: String = text.chars().skip(skip).collect();
    format!("[... {} earlier characters truncated]\n{}", skip, kept)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_captures_both_streams() {
        let output = run(Command::new("sh").args(["-c", "echo out; echo err >&2; exit 3"])).unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
        assert_eq!(output.combined(), "out\nerr");
    }

    #[test]
    fn test_run_with_timeout_kills_slow_command() {
        let start = Instant::now();
        let output = run_with_timeout(
            Command::new("sh").args(["-c", "echo started; sleep 30"]),
            Duration::from_secs(1),
        )
        .unwrap();
        assert!(output.timed_out);
        assert!(!output.success());
        assert_eq!(output.exit_code, Some(TIMEOUT_EXIT_CODE));
        assert!(output.stderr.contains("timed out"));
        assert!(start.elapsed() < Duration::from_secs(20));
    }

    #[test]
    fn test_run_with_timeout_fast_command() {
        let output = run_with_timeout(
            Command::new("sh").args(["-c", "echo done"]),
            Duration::from_secs(10),
        )
        .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "done");
    }

    #[test]
    fn test_tail_keeps_end() {
        assert_eq!(tail("short", 10), "short");
        let cut = tail("abcdefghij", 4);
        assert!(cut.ends_with("ghij"));
        assert!(cut.contains("6 earlier characters truncated"));
    }
}
