//! Helpers for running child processes with timeouts, bounded output and
//! cooperative cancellation.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::cancel::CancelToken;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).to_string();
        if self.stdout_truncated > 0 {
            text.push_str(&format!("\n[stdout truncated {} bytes]\n", self.stdout_truncated));
        }
        text
    }

    pub fn stderr_lossy(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stderr).to_string();
        if self.stderr_truncated > 0 {
            text.push_str(&format!("\n[stderr truncated {} bytes]\n", self.stderr_truncated));
        }
        text
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    let mut child = spawn_piped(&mut cmd, stdin)?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled: false,
    })
}

/// Run a command, forwarding each stdout line to `on_line` as it arrives.
///
/// The child is killed when `cancel` fires or `timeout` elapses; whatever was
/// read before that point is still returned.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_streaming(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: &CancelToken,
    on_line: &mut dyn FnMut(&str),
) -> Result<CommandOutput> {
    let mut child = spawn_piped(&mut cmd, stdin)?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    let stdout_handle = thread::spawn(move || -> Result<()> {
        let mut reader = BufReader::new(stdout);
        loop {
            let mut line = Vec::new();
            let n = reader.read_until(b'\n', &mut line).context("read line")?;
            if n == 0 || tx.send(line).is_err() {
                return Ok(());
            }
        }
    });
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let started = Instant::now();
    let mut collected = Vec::new();
    let mut truncated = 0usize;
    let mut timed_out = false;
    let mut cancelled = false;
    let mut stream_closed = false;

    let status = loop {
        if !stream_closed {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(line) => {
                    on_line(&String::from_utf8_lossy(&line));
                    let remaining = output_limit_bytes.saturating_sub(collected.len());
                    let keep = line.len().min(remaining);
                    collected.extend_from_slice(&line[..keep]);
                    truncated += line.len() - keep;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => stream_closed = true,
            }
        }
        if cancel.is_cancelled() {
            warn!("cancellation requested, killing child");
            cancelled = true;
            break kill_and_wait(&mut child)?;
        }
        if started.elapsed() >= timeout {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            break kill_and_wait(&mut child)?;
        }
        if stream_closed {
            match child.wait_timeout(POLL_INTERVAL).context("wait for command")? {
                Some(status) => break status,
                None => continue,
            }
        }
    };

    // Lines that raced the exit are still part of the output.
    for line in rx.try_iter() {
        if !cancelled {
            on_line(&String::from_utf8_lossy(&line));
        }
        let remaining = output_limit_bytes.saturating_sub(collected.len());
        let keep = line.len().min(remaining);
        collected.extend_from_slice(&line[..keep]);
        truncated += line.len() - keep;
    }

    // Grandchildren of a killed child can hold the pipes open indefinitely, so
    // the reader threads are left to finish on their own in that case.
    let (stderr, stderr_truncated) = if cancelled || timed_out {
        (Vec::new(), 0)
    } else {
        match stdout_handle.join() {
            Ok(result) => result.context("join stdout")?,
            Err(_) => return Err(anyhow!("stdout reader thread panicked")),
        }
        join_output(stderr_handle).context("join stderr")?
    };

    debug!(exit_code = ?status.code(), timed_out, cancelled, "streaming command finished");
    Ok(CommandOutput {
        status,
        stdout: collected,
        stderr,
        stdout_truncated: truncated,
        stderr_truncated,
        timed_out,
        cancelled,
    })
}

fn spawn_piped(cmd: &mut Command, stdin: Option<&[u8]>) -> Result<Child> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    if let Some(input) = stdin {
        // Dropping the handle closes the pipe so the child sees EOF.
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        // Written off-thread: the child may fill stdout before it drains stdin.
        let input = input.to_vec();
        thread::spawn(move || {
            if let Err(err) = child_stdin.write_all(&input) {
                debug!(err = %err, "stdin closed before the request was fully written");
            }
        });
    }
    Ok(child)
}

fn kill_and_wait(child: &mut Child) -> Result<ExitStatus> {
    // The child may already have exited; wait() still reaps it.
    if let Err(err) = child.kill() {
        debug!(err = %err, "kill failed");
    }
    child.wait().context("wait command after kill")
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_and_truncates_output() {
        let out = run_command_with_timeout(
            sh("printf 'abcdefghij'; printf 'err' >&2"),
            None,
            Duration::from_secs(10),
            4,
        )
        .expect("run");
        assert!(out.status.success());
        assert_eq!(out.stdout, b"abcd");
        assert_eq!(out.stdout_truncated, 6);
        assert_eq!(out.stderr, b"err");
        assert!(out.stdout_lossy().contains("truncated 6 bytes"));
    }

    #[test]
    fn large_stdin_does_not_block_on_a_chatty_child() {
        let input = vec![b'x'; 1 << 20];
        let out = run_command_with_timeout(
            sh("head -c 200000 /dev/zero; cat > /dev/null; echo ok"),
            Some(&input),
            Duration::from_secs(20),
            1024,
        )
        .expect("run");
        assert!(!out.timed_out);
        assert!(out.status.success());
        assert_eq!(out.stdout.len() + out.stdout_truncated, 200_003);
    }

    #[test]
    fn timeout_kills_child() {
        let out = run_command_with_timeout(sh("sleep 5"), None, Duration::from_millis(200), 1024)
            .expect("run");
        assert!(out.timed_out);
        assert!(!out.status.success());
    }

    #[test]
    fn streaming_forwards_lines_and_reads_stdin() {
        let mut lines = Vec::new();
        let out = run_command_streaming(
            sh("cat; echo second"),
            Some(b"first\n"),
            Duration::from_secs(10),
            1024,
            &CancelToken::new(),
            &mut |line| lines.push(line.to_string()),
        )
        .expect("run");
        assert!(out.status.success());
        assert_eq!(lines, vec!["first\n".to_string(), "second\n".to_string()]);
        assert_eq!(out.stdout, b"first\nsecond\n");
    }

    #[test]
    fn streaming_cancel_kills_child_and_keeps_partial_output() {
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let out = run_command_streaming(
            sh("echo partial; sleep 5; echo never"),
            None,
            Duration::from_secs(30),
            1024,
            &cancel,
            &mut |_| trigger.cancel(),
        )
        .expect("run");
        assert!(out.cancelled);
        assert_eq!(out.stdout, b"partial\n");
    }
}
