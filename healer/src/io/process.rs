//! Helpers for running child processes with timeouts, cancellation and bounded output.
//!
//! The child is placed in its own process group (unix). Whatever way the wait
//! ends (exit, timeout, cancellation, wait failure), the whole group is killed
//! and the child reaped before returning. Descendants that left the group with
//! `setsid` are found by an environment tag and killed too (Linux). Output
//! readers get a short grace period after that; a reader still blocked past it
//! is abandoned and its stream flagged incomplete.

use std::io::{ErrorKind, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Environment variable carrying the per-call tag inherited by every descendant.
pub const PROCESS_TAG_VAR: &str = "HEALER_PROCESS_TAG";

/// How long output readers may keep draining once the child is gone.
pub const READER_GRACE: Duration = Duration::from_millis(500);

static NEXT_TAG: AtomicU64 = AtomicU64::new(0);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    /// A reader was abandoned after [`READER_GRACE`]; output may be missing.
    pub stdout_incomplete: bool,
    pub stderr_incomplete: bool,
    pub timed_out: bool,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        lossy("stdout", &self.stdout, self.stdout_truncated, self.stdout_incomplete)
    }

    pub fn stderr_lossy(&self) -> String {
        lossy("stderr", &self.stderr, self.stderr_truncated, self.stderr_incomplete)
    }
}

fn lossy(name: &str, bytes: &[u8], truncated: usize, incomplete: bool) -> String {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if truncated > 0 {
        text.push_str(&format!("\n[{name} truncated {truncated} bytes]\n"));
    }
    if incomplete {
        text.push_str(&format!("\n[{name} incomplete: still held open after exit]\n"));
    }
    text
}

/// Wall-clock and output bounds for one child process.
#[derive(Debug, Clone, Copy)]
pub struct ProcessLimits {
    pub timeout: Duration,
    /// Bytes kept per stream; the rest is drained and counted.
    pub output_limit_bytes: usize,
    /// How often cancellation is checked while waiting.
    pub poll_interval: Duration,
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. A cancelled `cancel` token
/// stops the wait at the next poll and kills the process group. The call
/// returns within `limits.timeout` plus teardown and [`READER_GRACE`].
#[instrument(skip_all, fields(timeout_ms = limits.timeout.as_millis() as u64))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<Vec<u8>>,
    limits: ProcessLimits,
    cancel: Option<&CancellationToken>,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    isolate_process_group(&mut cmd);
    let tag = format!(
        "{}-{}",
        std::process::id(),
        NEXT_TAG.fetch_add(1, Ordering::Relaxed)
    );
    cmd.env(PROCESS_TAG_VAR, &tag);

    debug!(tag = %tag, "spawning child process");
    let start = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let limit = limits.output_limit_bytes;
    let stdout_rx = match child.stdout.take() {
        Some(stdout) => spawn_reader(stdout, limit),
        None => return Err(abandon(&mut child, "stdout was not piped")),
    };
    let stderr_rx = match child.stderr.take() {
        Some(stderr) => spawn_reader(stderr, limit),
        None => return Err(abandon(&mut child, "stderr was not piped")),
    };

    if let Some(input) = stdin {
        let Some(mut child_stdin) = child.stdin.take() else {
            return Err(abandon(&mut child, "stdin was not piped"));
        };
        // A child that never reads stdin must not block the timeout below.
        thread::spawn(move || {
            if let Err(e) = child_stdin.write_all(&input) {
                debug!(err = %e, "child closed stdin early");
            }
        });
    }

    let waited = wait_bounded(&mut child, start, limits, cancel);
    sweep_escaped(&tag);
    let (status, timed_out, cancelled) = waited?;

    let grace = Instant::now() + READER_GRACE;
    let stdout = collect_output(&stdout_rx, grace);
    let stderr = collect_output(&stderr_rx, grace);

    if stdout.dropped > 0 || stderr.dropped > 0 {
        warn!(
            stdout_truncated = stdout.dropped,
            stderr_truncated = stderr.dropped,
            "output truncated"
        );
    }
    if !stdout.complete || !stderr.complete {
        warn!(
            grace_ms = READER_GRACE.as_millis() as u64,
            "output still held open after exit, abandoning readers"
        );
    }

    debug!(exit_code = ?status.code(), timed_out, cancelled, "command finished");
    Ok(CommandOutput {
        status,
        stdout: stdout.bytes,
        stderr: stderr.bytes,
        stdout_truncated: stdout.dropped,
        stderr_truncated: stderr.dropped,
        stdout_incomplete: !stdout.complete,
        stderr_incomplete: !stderr.complete,
        timed_out,
        cancelled,
        elapsed: start.elapsed(),
    })
}

/// Kill and reap a child we cannot drive further, returning `reason` as the error.
fn abandon(child: &mut Child, reason: &'static str) -> anyhow::Error {
    if let Err(e) = kill_and_reap(child) {
        warn!(err = %e, "failed to reap child");
    }
    anyhow!(reason)
}

/// Wait for the child in poll-sized slices until it exits, the deadline passes,
/// or `cancel` fires. The process group is always killed before returning.
fn wait_bounded(
    child: &mut Child,
    start: Instant,
    limits: ProcessLimits,
    cancel: Option<&CancellationToken>,
) -> Result<(ExitStatus, bool, bool)> {
    let deadline = start + limits.timeout;
    let poll = limits.poll_interval.max(Duration::from_millis(1));

    loop {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            warn!("cancellation requested, killing child");
            let status = kill_and_reap(child)?;
            return Ok((status, false, true));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(
                timeout_ms = limits.timeout.as_millis() as u64,
                "command timed out, killing"
            );
            let status = kill_and_reap(child)?;
            return Ok((status, true, false));
        }

        match child.wait_timeout(remaining.min(poll)) {
            Ok(Some(status)) => {
                // Background descendants would otherwise hold the pipes open.
                kill_group(child);
                return Ok((status, false, false));
            }
            Ok(None) => {}
            Err(e) => return Err(wait_failed(child, e)),
        }
    }
}

/// A failed wait still owns the child: kill the group and reap before reporting.
fn wait_failed(child: &mut Child, err: std::io::Error) -> anyhow::Error {
    error!(err = %err, "wait failed, killing child");
    if let Err(reap) = kill_and_reap(child) {
        warn!(err = %reap, "failed to reap child");
    }
    anyhow::Error::new(err).context("wait for command")
}

fn kill_and_reap(child: &mut Child) -> Result<ExitStatus> {
    kill_group(child);
    if let Err(e) = child.kill() {
        debug!(err = %e, "child already exited");
    }
    child.wait().context("wait command after kill")
}

#[cfg(unix)]
fn isolate_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn kill_group(child: &Child) {
    use nix::sys::signal::killpg;

    #[allow(clippy::cast_possible_wrap)]
    let pgid = nix::unistd::Pid::from_raw(child.id() as i32);
    if let Err(e) = ignore_gone(killpg(pgid, nix::sys::signal::Signal::SIGKILL)) {
        warn!(err = %e, "failed to kill process group");
    }
}

#[cfg(not(unix))]
fn kill_group(_child: &Child) {}

#[cfg(unix)]
fn ignore_gone(result: nix::Result<()>) -> nix::Result<()> {
    match result {
        Err(nix::errno::Errno::ESRCH) => Ok(()),
        other => other,
    }
}

/// Kill every process still carrying `tag` in its environment. Repeats until a
/// pass finds nothing, so children forked during a pass are caught by the next.
#[cfg(target_os = "linux")]
fn sweep_escaped(tag: &str) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    const MAX_PASSES: usize = 5;
    let needle = format!("{PROCESS_TAG_VAR}={tag}");
    for _ in 0..MAX_PASSES {
        let tagged = tagged_pids(needle.as_bytes());
        if tagged.is_empty() {
            return;
        }
        warn!(count = tagged.len(), "killing processes that escaped the process group");
        for pid in tagged {
            if let Err(e) = ignore_gone(kill(Pid::from_raw(pid), Signal::SIGKILL)) {
                warn!(pid, err = %e, "failed to kill escaped process");
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn sweep_escaped(_tag: &str) {}

/// Live pids whose initial environment contains `needle` (`NAME=value`).
/// Zombies have an empty environ and are skipped.
#[cfg(target_os = "linux")]
fn tagged_pids(needle: &[u8]) -> Vec<i32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|entry| {
            let pid: i32 = entry.file_name().to_str()?.parse().ok()?;
            let environ = std::fs::read(entry.path().join("environ")).ok()?;
            environ
                .split(|b| *b == 0)
                .any(|var| var == needle)
                .then_some(pid)
        })
        .collect()
}

/// Bytes kept from one read and the count dropped past the limit.
type Chunk = (Vec<u8>, usize);

struct Collected {
    bytes: Vec<u8>,
    dropped: usize,
    /// The reader reached end of stream.
    complete: bool,
}

/// Read `reader` to EOF on its own thread, keeping at most `limit` bytes.
fn spawn_reader<R: Read + Send + 'static>(mut reader: R, limit: usize) -> Receiver<Chunk> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut kept = 0usize;
        let mut chunk = [0u8; 8192];
        loop {
            let n = match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(err = %e, "read output");
                    break;
                }
            };
            let keep = n.min(limit.saturating_sub(kept));
            kept += keep;
            if tx.send((chunk[..keep].to_vec(), n - keep)).is_err() {
                break;
            }
        }
    });
    rx
}

/// Drain chunks until the reader hangs up or `deadline` passes.
fn collect_output(rx: &Receiver<Chunk>, deadline: Instant) -> Collected {
    let mut collected = Collected {
        bytes: Vec::new(),
        dropped: 0,
        complete: false,
    };
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok((bytes, dropped)) => {
                collected.bytes.extend_from_slice(&bytes);
                collected.dropped += dropped;
            }
            Err(RecvTimeoutError::Disconnected) => {
                collected.complete = true;
                return collected;
            }
            Err(RecvTimeoutError::Timeout) => return collected,
        }
    }
}
