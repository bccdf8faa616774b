//! Reviewer subprocess supervision.
//!
//! One `run` call owns at most one subprocess and resolves to exactly one
//! terminal outcome. The task holds the stdout/stderr readers, the process
//! handle, and a cancel signal; on stop it kills and reaps. A soft deadline
//! bounds every run; cancellation is SIGTERM, a grace period, then SIGKILL.

pub mod client;

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::RunnerConfig;
pub use client::{ProcessSpec, build_command};

/// Terminal outcome of one supervised run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Process exited on its own; `exit_ok` is the zero-status flag.
    /// Whether the reviewer actually *submitted* is the lifecycle
    /// controller's call, made against the API record.
    Completed { exit_ok: bool },
    /// Spawn failed or the process could not be supervised.
    Failed(String),
    /// Deadline expired and the process tree was killed.
    TimedOut,
    /// Stop was requested and honored.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub stdout_tail: String,
    pub stderr_tail: String,
}

/// Cancel handle for an in-flight run.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }
}

/// Fixed-capacity byte ring: keeps the most recent `cap` bytes.
#[derive(Debug)]
pub struct RingBuffer {
    cap: usize,
    buf: VecDeque<u8>,
}

impl RingBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            buf: VecDeque::with_capacity(cap.min(4096)),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if self.buf.len() == self.cap {
                self.buf.pop_front();
            }
            self.buf.push_back(b);
        }
    }

    pub fn tail(&self) -> String {
        String::from_utf8_lossy(&self.buf.iter().copied().collect::<Vec<u8>>()).into_owned()
    }
}

pub struct ReviewerRunner {
    config: RunnerConfig,
}

impl ReviewerRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    pub fn stop_channel() -> (StopHandle, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (StopHandle { tx }, rx)
    }

    /// Supervise one subprocess to completion, cancellation, or deadline.
    /// Transient spawn failures are retried with the configured backoff.
    pub async fn run(&self, spec: &ProcessSpec, mut stop_rx: watch::Receiver<bool>) -> RunReport {
        let mut delays: VecDeque<u64> = self.config.retry_delays_secs.iter().copied().collect();

        loop {
            match self.run_once(spec, &mut stop_rx).await {
                RunReport {
                    outcome: RunOutcome::Failed(reason),
                    stdout_tail,
                    stderr_tail,
                } => {
                    let Some(delay) = delays.pop_front() else {
                        return RunReport {
                            outcome: RunOutcome::Failed(reason),
                            stdout_tail,
                            stderr_tail,
                        };
                    };
                    if reason.contains("not found") {
                        // A missing binary will not appear between retries.
                        return RunReport {
                            outcome: RunOutcome::Failed(reason),
                            stdout_tail,
                            stderr_tail,
                        };
                    }
                    warn!(program = %spec.program, %reason, retry_in = delay, "spawn failed, retrying");
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                }
                report => return report,
            }
        }
    }

    async fn run_once(&self, spec: &ProcessSpec, stop_rx: &mut watch::Receiver<bool>) -> RunReport {
        let stdout_ring = Arc::new(Mutex::new(RingBuffer::new(self.config.stream_tail_bytes)));
        let stderr_ring = Arc::new(Mutex::new(RingBuffer::new(self.config.stream_tail_bytes)));

        let empty_report = |outcome: RunOutcome| RunReport {
            outcome,
            stdout_tail: String::new(),
            stderr_tail: String::new(),
        };

        if *stop_rx.borrow() {
            return empty_report(RunOutcome::Cancelled);
        }

        debug!(program = %spec.program, "spawning reviewer client");
        let mut child = match Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return empty_report(RunOutcome::Failed(format!(
                    "{} CLI not found, install it first",
                    spec.program
                )));
            }
            Err(e) => return empty_report(RunOutcome::Failed(e.to_string())),
        };

        let stdout_task = child.stdout.take().map(|pipe| {
            let ring = Arc::clone(&stdout_ring);
            tokio::spawn(drain_into(pipe, ring))
        });
        let stderr_task = child.stderr.take().map(|pipe| {
            let ring = Arc::clone(&stderr_ring);
            tokio::spawn(drain_into(pipe, ring))
        });

        let deadline = Duration::from_secs(self.config.deadline_secs);
        let grace = Duration::from_secs(self.config.kill_grace_secs);

        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => RunOutcome::Completed { exit_ok: status.success() },
                Err(e) => RunOutcome::Failed(format!("wait failed: {}", e)),
            },
            _ = stop_rx.changed() => {
                terminate(&mut child, grace).await;
                RunOutcome::Cancelled
            }
            _ = tokio::time::sleep(deadline) => {
                warn!(program = %spec.program, deadline_secs = self.config.deadline_secs, "deadline exceeded, killing");
                terminate(&mut child, grace).await;
                RunOutcome::TimedOut
            }
        };

        if let Some(task) = stdout_task {
            let _ = task.await;
        }
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        RunReport {
            outcome,
            stdout_tail: stdout_ring.lock().tail(),
            stderr_tail: stderr_ring.lock().tail(),
        }
    }
}

async fn drain_into<R>(mut pipe: R, ring: Arc<Mutex<RingBuffer>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => ring.lock().push(&chunk[..n]),
            Err(_) => break,
        }
    }
}

/// SIGTERM, wait out the grace period, then SIGKILL and reap.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        warn!(error = %e, "kill after grace period failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(deadline_secs: u64) -> ReviewerRunner {
        ReviewerRunner::new(RunnerConfig {
            deadline_secs,
            kill_grace_secs: 1,
            retry_delays_secs: vec![],
            ..Default::default()
        })
    }

    fn spec(program: &str, args: &[&str]) -> ProcessSpec {
        ProcessSpec {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_ring_buffer_keeps_tail() {
        let mut ring = RingBuffer::new(4);
        ring.push(b"abcdef");
        assert_eq!(ring.tail(), "cdef");
        ring.push(b"gh");
        assert_eq!(ring.tail(), "efgh");
    }

    #[tokio::test]
    async fn test_successful_run_captures_stdout() {
        let (_stop, rx) = ReviewerRunner::stop_channel();
        let report = runner(30).run(&spec("echo", &["hello"]), rx).await;
        assert_eq!(report.outcome, RunOutcome::Completed { exit_ok: true });
        assert!(report.stdout_tail.contains("hello"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_reported() {
        let (_stop, rx) = ReviewerRunner::stop_channel();
        let report = runner(30).run(&spec("false", &[]), rx).await;
        assert_eq!(report.outcome, RunOutcome::Completed { exit_ok: false });
    }

    #[tokio::test]
    async fn test_missing_binary_fails_without_retry() {
        let (_stop, rx) = ReviewerRunner::stop_channel();
        let started = std::time::Instant::now();
        let report = runner(30)
            .run(&spec("definitely-not-a-real-binary-xyz", &[]), rx)
            .await;
        match report.outcome {
            RunOutcome::Failed(reason) => assert!(reason.contains("not found")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_deadline_kills_process() {
        let (_stop, rx) = ReviewerRunner::stop_channel();
        let report = runner(1).run(&spec("sleep", &["30"]), rx).await;
        assert_eq!(report.outcome, RunOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_stop_cancels_run() {
        let (stop, rx) = ReviewerRunner::stop_channel();
        let runner = runner(60);
        let spec = spec("sleep", &["30"]);
        let handle = tokio::spawn(async move { runner.run(&spec, rx).await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        stop.stop();
        let report = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("stop must resolve the run quickly")
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_stop_before_start_short_circuits() {
        let (stop, rx) = ReviewerRunner::stop_channel();
        stop.stop();
        let report = runner(30).run(&spec("sleep", &["30"]), rx).await;
        assert_eq!(report.outcome, RunOutcome::Cancelled);
    }
}
