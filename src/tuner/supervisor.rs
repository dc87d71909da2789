//! Child-process supervision for the demodulator + transcoder pair.
//!
//! The demodulator locks the tuner hardware and emits raw MPEG-TS on stdout;
//! the transcoder consumes it on stdin. The supervisor wires the two pipes,
//! keeps the last lines of transcoder diagnostics for post-mortems, and owns
//! the graceful-then-forceful teardown protocol.

use std::collections::VecDeque;
use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Grace period between SIGTERM and SIGKILL.
const GRACE_PERIOD: Duration = Duration::from_secs(2);
/// Safety bound on waiting for the demodulator exit after SIGKILL; once it
/// elapses the lease is released even without an exit event.
const FORCE_EXIT_WAIT: Duration = Duration::from_secs(2);
/// Lines of transcoder stderr kept for diagnostics.
const SCROLLBACK_LINES: usize = 10;
/// Chunk size for the demodulator → transcoder pump.
const PUMP_CHUNK: usize = 64 * 1024;

/// Monotonic record of the last time bytes crossed the output boundary.
#[derive(Debug)]
pub struct ActivityClock {
    origin: Instant,
    last_ms: AtomicU64,
}

impl ActivityClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        })
    }

    /// Record output activity now.
    pub fn touch(&self) {
        self.last_ms
            .store(self.origin.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Time since the last recorded activity.
    pub fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

pub type Scrollback = Arc<Mutex<VecDeque<String>>>;

/// True for pipe errors that mean the peer simply went away.
pub fn pipe_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
    )
}

fn signal_child(child: &Child, sig: Signal) {
    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), sig);
    }
}

/// A demodulator + transcoder pair wired stdout → stdin.
pub struct ProcessPair {
    pub(crate) demod: Child,
    transcoder: Child,
    /// Transcoder stdout, taken by the session's output pump.
    pub(crate) transcoder_stdout: Option<tokio::process::ChildStdout>,
    activity: Arc<ActivityClock>,
    scrollback: Scrollback,
    pump: JoinHandle<()>,
    torn_down: bool,
}

impl ProcessPair {
    /// Spawn the pair and connect demodulator stdout to transcoder stdin.
    pub fn spawn(
        demod_bin: &str,
        demod_args: &[String],
        trans_bin: &str,
        trans_args: &[String],
    ) -> io::Result<Self> {
        debug!("supervisor: spawning {} {}", demod_bin, demod_args.join(" "));
        let mut demod = Command::new(demod_bin)
            .args(demod_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        debug!("supervisor: spawning {} {}", trans_bin, trans_args.join(" "));
        let mut transcoder = match Command::new(trans_bin)
            .args(trans_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                let _ = demod.start_kill();
                return Err(e);
            }
        };

        let scrollback: Scrollback = Arc::new(Mutex::new(VecDeque::with_capacity(SCROLLBACK_LINES)));

        if let Some(stderr) = demod.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("demodulator: {}", line);
                }
            });
        }

        if let Some(stderr) = transcoder.stderr.take() {
            let scroll = Arc::clone(&scrollback);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("transcoder: {}", line);
                    let mut buf = scroll.lock();
                    if buf.len() == SCROLLBACK_LINES {
                        buf.pop_front();
                    }
                    buf.push_back(line);
                }
            });
        }

        let mut demod_stdout = demod
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("demodulator stdout not captured"))?;
        let mut trans_stdin = transcoder
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("transcoder stdin not captured"))?;
        let transcoder_stdout = transcoder.stdout.take();

        let pump_scroll = Arc::clone(&scrollback);
        let pump = tokio::spawn(async move {
            let mut buf = vec![0u8; PUMP_CHUNK];
            loop {
                let n = match demod_stdout.read(&mut buf).await {
                    Ok(0) => {
                        debug!("supervisor: demodulator closed its output");
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        debug!("supervisor: demodulator read ended: {}", e);
                        break;
                    }
                };
                if let Err(e) = trans_stdin.write_all(&buf[..n]).await {
                    if pipe_closed(&e) {
                        debug!("supervisor: transcoder stdin closed");
                    } else {
                        let tail = pump_scroll.lock().iter().cloned().collect::<Vec<_>>();
                        error!(
                            "supervisor: transcoder feed failed: {}; last output:\n{}",
                            e,
                            tail.join("\n")
                        );
                    }
                    break;
                }
            }
        });

        Ok(Self {
            demod,
            transcoder,
            transcoder_stdout,
            activity: ActivityClock::new(),
            scrollback,
            pump,
            torn_down: false,
        })
    }

    pub fn activity(&self) -> Arc<ActivityClock> {
        Arc::clone(&self.activity)
    }

    /// Handle on the last lines of transcoder stderr.
    pub fn scrollback(&self) -> Scrollback {
        Arc::clone(&self.scrollback)
    }

    /// Tear the pair down. Runs to completion exactly once; later calls
    /// are no-ops.
    ///
    /// Order matters: graceful signal to the transcoder first, then the
    /// demodulator; survivors are killed after the grace period. The caller
    /// must not release the tuner lease before this returns, because the
    /// demodulator holds the kernel hardware lock until it exits.
    pub async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        self.pump.abort();

        signal_child(&self.transcoder, Signal::SIGTERM);
        signal_child(&self.demod, Signal::SIGTERM);

        let graceful = async {
            let _ = self.transcoder.wait().await;
            let _ = self.demod.wait().await;
        };
        if tokio::time::timeout(GRACE_PERIOD, graceful).await.is_err() {
            warn!("supervisor: children still alive after grace period, killing");
            let _ = self.transcoder.start_kill();
            let _ = self.demod.start_kill();
        }

        if tokio::time::timeout(FORCE_EXIT_WAIT, self.demod.wait())
            .await
            .is_err()
        {
            warn!("supervisor: demodulator did not exit after SIGKILL; forcing lease release");
        }
        let _ = tokio::time::timeout(Duration::from_secs(1), self.transcoder.wait()).await;
    }
}

/// Spawn a capture-only demodulator for an EPG scan.
pub fn spawn_capture(bin: &str, args: &[String]) -> io::Result<Child> {
    debug!("supervisor: spawning capture {} {}", bin, args.join(" "));
    Command::new(bin)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_activity_clock_idle() {
        let clock = ActivityClock::new();
        clock.touch();
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(clock.idle() >= Duration::from_secs(31));
        clock.touch();
        assert!(clock.idle() < Duration::from_secs(1));
    }

    #[test]
    fn test_pipe_closed_matcher() {
        assert!(pipe_closed(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(pipe_closed(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(!pipe_closed(&io::Error::from(io::ErrorKind::NotFound)));
    }

    #[tokio::test]
    async fn test_spawn_and_teardown() {
        // A pair that would otherwise run for a minute tears down promptly.
        let mut pair = ProcessPair::spawn(
            "sleep",
            &["60".to_string()],
            "cat",
            &[],
        )
        .unwrap();

        let started = std::time::Instant::now();
        pair.teardown().await;
        assert!(started.elapsed() < Duration::from_secs(10));

        // Idempotent.
        pair.teardown().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_surfaces() {
        let result = ProcessPair::spawn(
            "/nonexistent/demodulator",
            &[],
            "cat",
            &[],
        );
        assert!(result.is_err());
    }
}
