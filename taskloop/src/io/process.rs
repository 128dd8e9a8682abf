//! Child processes: streaming execution with a timeout, and liveness probes.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// How long readers may keep draining after the deadline and a group kill.
pub const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Callback invoked with every stdout line as it arrives (without the newline).
pub type LineHook = Box<dyn FnMut(&str) + Send>;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Options for [`run_streaming`].
pub struct StreamOptions<'a> {
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
    /// Bytes of stdout/stderr kept in memory; the rest is drained and counted.
    pub output_limit_bytes: usize,
    /// Every stdout line is appended and flushed here as it streams.
    pub tee_path: Option<&'a Path>,
    pub on_line: Option<LineHook>,
}

/// Run a command with a timeout, reading stdout line by line while it runs.
///
/// Stdout and stderr are drained on their own threads so the child never blocks
/// on a full pipe. Stdin is fed from a third thread for the same reason. On
/// unix the child leads its own process group; on timeout the whole group is
/// killed and `timed_out` is set, which is not an error.
///
/// The call returns within `timeout` plus [`DRAIN_GRACE`] even when a
/// descendant keeps the output pipes open: such a group is killed once the
/// deadline passes, and readers still blocked after the grace period are
/// detached with whatever they captured.
#[instrument(skip_all, fields(timeout_secs = opts.timeout.as_secs(), streaming = opts.tee_path.is_some()))]
pub fn run_streaming(mut cmd: Command, opts: StreamOptions<'_>) -> Result<CommandOutput> {
    if opts.stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let tee = match opts.tee_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create stream dir {}", parent.display()))?;
            }
            let file = File::create(path)
                .with_context(|| format!("create stream file {}", path.display()))?;
            Some(BufWriter::new(file))
        }
        None => None,
    };

    debug!("spawning child process");
    let started = Instant::now();
    let deadline = started + opts.timeout;
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let limit = opts.output_limit_bytes;
    let on_line = opts.on_line;
    let stdout_capture = SharedCapture::default();
    let stderr_capture = SharedCapture::default();
    let (done_tx, done_rx) = mpsc::channel::<ReaderDone>();
    {
        let capture = Arc::clone(&stdout_capture);
        let done = done_tx.clone();
        thread::spawn(move || {
            let result = read_lines_limited(stdout, limit, &capture, tee, on_line);
            let _ = done.send(("stdout", result));
        });
    }
    {
        let capture = Arc::clone(&stderr_capture);
        let done = done_tx;
        thread::spawn(move || {
            let result = read_stream_limited(stderr, limit, &capture);
            let _ = done.send(("stderr", result));
        });
    }

    // Detached: a writer blocked on a child that never reads is unblocked
    // by EPIPE once the child dies.
    match (opts.stdin, child.stdin.take()) {
        (Some(input), Some(mut pipe)) => {
            thread::spawn(move || {
                if let Err(e) = pipe.write_all(&input) {
                    debug!(err = %e, "stdin closed before prompt was fully written");
                }
            });
        }
        (Some(_), None) => return Err(anyhow!("stdin was not piped")),
        (None, _) => {}
    }

    let mut timed_out = false;
    let status = match child.wait_timeout(opts.timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(timeout_secs = opts.timeout.as_secs(), "command timed out, killing");
            timed_out = true;
            terminate(&mut child);
            child.wait().context("wait command after kill")?
        }
    };

    let mut pending = wait_for_readers(&done_rx, 2, deadline)?;
    if pending > 0 && !timed_out {
        warn!(pending, "command exited but its output is still held open; killing process group");
        #[cfg(unix)]
        kill_process_group(child.id());
    }
    if pending > 0 {
        pending = wait_for_readers(&done_rx, pending, Instant::now() + DRAIN_GRACE)?;
    }
    if pending > 0 {
        warn!(pending, "output readers still blocked; detaching them");
    }

    let (stdout, stdout_truncated) = take_capture(&stdout_capture);
    let (stderr, stderr_truncated) = take_capture(&stderr_capture);

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
        duration: started.elapsed(),
    })
}

/// Output kept so far by one reader thread.
#[derive(Debug, Default)]
struct Capture {
    bytes: Vec<u8>,
    truncated: usize,
}

type SharedCapture = Arc<Mutex<Capture>>;

/// Sent by a reader thread when its stream hits EOF or fails.
type ReaderDone = (&'static str, Result<()>);

impl Capture {
    fn push(&mut self, chunk: &[u8], limit: usize) {
        let remaining = limit.saturating_sub(self.bytes.len());
        let keep = chunk.len().min(remaining);
        self.bytes.extend_from_slice(&chunk[..keep]);
        self.truncated += chunk.len() - keep;
    }
}

fn lock_capture(capture: &SharedCapture) -> MutexGuard<'_, Capture> {
    capture.lock().unwrap_or_else(PoisonError::into_inner)
}

fn take_capture(capture: &SharedCapture) -> (Vec<u8>, usize) {
    let mut guard = lock_capture(capture);
    (
        std::mem::take(&mut guard.bytes),
        std::mem::take(&mut guard.truncated),
    )
}

/// Wait until `pending` readers report or `deadline` passes.
///
/// Returns the number still running.
fn wait_for_readers(
    done: &mpsc::Receiver<ReaderDone>,
    mut pending: usize,
    deadline: Instant,
) -> Result<usize> {
    while pending > 0 {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let received = if remaining.is_zero() {
            done.try_recv().map_err(|e| match e {
                mpsc::TryRecvError::Empty => mpsc::RecvTimeoutError::Timeout,
                mpsc::TryRecvError::Disconnected => mpsc::RecvTimeoutError::Disconnected,
            })
        } else {
            done.recv_timeout(remaining)
        };
        match received {
            Ok((stream, result)) => {
                result.with_context(|| format!("read {stream}"))?;
                pending -= 1;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => break,
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(anyhow!("output reader thread panicked"));
            }
        }
    }
    Ok(pending)
}

fn terminate(child: &mut Child) {
    #[cfg(unix)]
    kill_process_group(child.id());
    if let Err(e) = child.kill() {
        debug!(err = %e, "child already gone");
    }
}

/// SIGKILL every process in group `pgid`.
#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    match Command::new("kill")
        .arg("-KILL")
        .arg("--")
        .arg(format!("-{pgid}"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) if status.success() => debug!(pgid, "process group killed"),
        Ok(status) => debug!(pgid, code = ?status.code(), "process group already gone"),
        Err(e) => warn!(pgid, err = %e, "failed to signal process group"),
    }
}

fn read_lines_limited<R: Read>(
    reader: R,
    limit: usize,
    capture: &SharedCapture,
    mut tee: Option<BufWriter<File>>,
    mut on_line: Option<LineHook>,
) -> Result<()> {
    let mut reader = BufReader::new(reader);

    loop {
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line).context("read line")?;
        if n == 0 {
            break;
        }

        if let Some(writer) = tee.as_mut() {
            if let Err(e) = writer.write_all(&line) {
                warn!(err = %e, "failed to write to stream file");
            } else if let Err(e) = writer.flush() {
                warn!(err = %e, "failed to flush stream file");
            }
        }

        if let Some(hook) = on_line.as_mut() {
            let text = String::from_utf8_lossy(&line);
            hook(text.trim_end_matches(['\n', '\r']));
        }

        lock_capture(capture).push(&line, limit);
    }

    Ok(())
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize, capture: &SharedCapture) -> Result<()> {
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        lock_capture(capture).push(&chunk[..n], limit);
    }

    Ok(())
}

/// Probe whether `pid` names a live process.
///
/// Uses `kill -0` so no signal is delivered. A permission error still means
/// the process exists. Pid 0 is never alive.
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    if pid == std::process::id() {
        return true;
    }

    #[cfg(unix)]
    {
        match Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
        {
            Ok(output) if output.status.success() => true,
            Ok(output) => String::from_utf8_lossy(&output.stderr)
                .to_ascii_lowercase()
                .contains("not permitted"),
            Err(e) => {
                warn!(pid, err = %e, "liveness probe failed to run; assuming alive");
                true
            }
        }
    }

    #[cfg(not(unix))]
    {
        // Without a portable probe, treat recorded processes as alive.
        true
    }
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
    fn streams_lines_to_hook_and_tee_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tee_path = temp.path().join("runs").join("agent.log");
        let (tx, rx) = mpsc::channel();
        let out = run_streaming(
            sh("cat; echo second"),
            StreamOptions {
                stdin: Some(b"first\n".to_vec()),
                timeout: Duration::from_secs(10),
                output_limit_bytes: 1024,
                tee_path: Some(&tee_path),
                on_line: Some(Box::new(move |line| {
                    let _ = tx.send(line.to_string());
                })),
            },
        )
        .expect("run");

        assert!(out.status.success());
        assert!(!out.timed_out);
        let lines: Vec<String> = rx.try_iter().collect();
        assert_eq!(lines, vec!["first", "second"]);
        assert_eq!(
            std::fs::read_to_string(&tee_path).expect("read tee"),
            "first\nsecond\n"
        );
    }

    #[test]
    fn kills_on_timeout_and_bounds_output() {
        let out = run_streaming(
            sh("echo 0123456789; exec sleep 5"),
            StreamOptions {
                stdin: None,
                timeout: Duration::from_millis(200),
                output_limit_bytes: 4,
                tee_path: None,
                on_line: None,
            },
        )
        .expect("run");
        assert!(out.timed_out);
        assert_eq!(out.stdout, b"0123");
        assert_eq!(out.stdout_truncated, 7);
    }

    #[test]
    fn timeout_kills_background_descendants_holding_stdout() {
        let started = Instant::now();
        let out = run_streaming(
            sh("(sleep 4; echo late) & exec sleep 30"),
            StreamOptions {
                stdin: None,
                timeout: Duration::from_millis(200),
                output_limit_bytes: 1024,
                tee_path: None,
                on_line: None,
            },
        )
        .expect("run");

        assert!(out.timed_out);
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
        assert!(out.stdout.is_empty());
    }

    #[test]
    fn exited_command_returns_despite_descendant_holding_stdout() {
        let started = Instant::now();
        let out = run_streaming(
            sh("(exec sleep 30) & echo done"),
            StreamOptions {
                stdin: None,
                timeout: Duration::from_millis(300),
                output_limit_bytes: 1024,
                tee_path: None,
                on_line: None,
            },
        )
        .expect("run");

        assert!(!out.timed_out);
        assert!(out.status.success());
        assert_eq!(out.stdout, b"done\n");
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
    }

    #[test]
    fn liveness_probe() {
        assert!(is_process_alive(std::process::id()));
        assert!(!is_process_alive(0));

        let mut child = Command::new("true").spawn().expect("spawn");
        let pid = child.id();
        child.wait().expect("wait");
        assert!(!is_process_alive(pid));
    }
}
