//! Live-stream sessions.
//!
//! A session owns one tuner lease and one process pair for the lifetime of a
//! client request. A single supervising task selects over every terminal
//! event (client disconnect, transcoder output ending, demodulator exit,
//! stall watchdog, preemption) and funnels all of them into one teardown.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use crate::channels::Channel;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::tuner::arbiter::{CancelHandle, Lease, LeaseKind, TunerArbiter};
use crate::tuner::command::{demodulator_args, transcoder_args, StreamFormat};
use crate::tuner::supervisor::{ActivityClock, ProcessPair, Scrollback};

/// Delay between acquiring a lease and spawning the demodulator. Some USB
/// receivers brown out a paired tuner on the same hub when retuned
/// immediately after release.
const SETTLE_DELAY: Duration = Duration::from_secs(1);
/// Watchdog check interval.
const WATCHDOG_TICK: Duration = Duration::from_secs(5);
/// Output inactivity that counts as a stall.
const STALL_AFTER: Duration = Duration::from_secs(30);
/// Output channel depth toward the client body.
const BODY_CHANNEL: usize = 64;
/// Read chunk toward the client.
const OUTPUT_CHUNK: usize = 64 * 1024;

/// An open live stream handed to the HTTP layer.
pub struct LiveStream {
    pub content_type: &'static str,
    pub body: mpsc::Receiver<Result<Bytes, io::Error>>,
}

/// Open a live stream for a resolved channel.
///
/// The caller has already resolved the channel (404 happens before any lease
/// is taken) and waited for EPG readiness. Response headers must not be sent
/// until this returns, so spawn failures can still surface as 5xx.
pub async fn open_stream(
    cfg: &GatewayConfig,
    arbiter: &Arc<TunerArbiter>,
    registry: &Arc<SessionRegistry>,
    channel: &Channel,
    fmt: StreamFormat,
    client: String,
) -> Result<LiveStream, GatewayError> {
    let lease = arbiter
        .acquire(LeaseKind::Live)
        .await
        .ok_or(GatewayError::NoTunerAvailable)?;

    tokio::time::sleep(SETTLE_DELAY).await;

    let demod_args = demodulator_args(&cfg.channels_conf, lease.tuner_id(), &channel.number, None);
    let trans_args = transcoder_args(&fmt);
    let pair = ProcessPair::spawn(&cfg.demod_bin, &demod_args, &cfg.transcode_bin, &trans_args)
        .map_err(|e| GatewayError::Tuner(e.to_string()))?;

    let cancel = CancelHandle::new();
    arbiter.register_cancel(lease.tuner_id(), Arc::clone(&cancel));

    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(BODY_CHANNEL);
    let id = registry.register(channel.number.clone(), client, Arc::clone(&cancel));

    info!(
        "session {}: streaming channel {} on tuner {}",
        id,
        channel.number,
        lease.tuner_id()
    );

    tokio::spawn(supervise(id, pair, lease, cancel, tx, Arc::clone(registry)));

    Ok(LiveStream {
        content_type: fmt.container.content_type(),
        body: rx,
    })
}

/// The single teardown sink for one session.
async fn supervise(
    id: u64,
    mut pair: ProcessPair,
    lease: Lease,
    cancel: Arc<CancelHandle>,
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
    registry: Arc<SessionRegistry>,
) {
    let clock = pair.activity();
    // First output counts as activity so a slow tune does not trip the
    // watchdog before the pipeline produces anything.
    clock.touch();

    let Some(stdout) = pair.transcoder_stdout.take() else {
        error!("session {}: transcoder stdout missing, aborting", id);
        pair.teardown().await;
        registry.unregister(id);
        return;
    };

    let scrollback = pair.scrollback();
    let mut pump = tokio::spawn(pump_output(stdout, tx, Arc::clone(&clock), scrollback));

    let reason = tokio::select! {
        outcome = &mut pump => outcome.unwrap_or("output task failed"),
        _ = cancel.cancelled() => "cancelled",
        _ = stall_watchdog(Arc::clone(&clock)) => {
            warn!("session {}: {}", id, GatewayError::StreamStalled);
            "stalled"
        }
        _ = pair.demod.wait() => "demodulator exited",
    };

    info!("session {}: ending ({})", id, reason);

    lease.begin_cleaning();
    pair.teardown().await;
    pump.abort();
    // The demodulator exit has been observed (or the safety bound elapsed)
    // by the time teardown returns; only now is the lease releasable.
    drop(lease);
    registry.unregister(id);
}

/// Pump transcoder output to the client channel, recording activity for the
/// watchdog. A closed receiver means the client went away; that is a normal
/// end of session, not an error.
async fn pump_output(
    mut stdout: tokio::process::ChildStdout,
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
    clock: Arc<ActivityClock>,
    scrollback: Scrollback,
) -> &'static str {
    let mut buf = vec![0u8; OUTPUT_CHUNK];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => return "transcoder closed its output",
            Ok(n) => {
                if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                    // Equivalent to EPIPE on the client socket.
                    debug!("session: {}", GatewayError::PipeBroken);
                    return "client disconnected";
                }
                clock.touch();
            }
            Err(e) => {
                let tail = scrollback.lock().iter().cloned().collect::<Vec<_>>();
                error!(
                    "session: transcoder read failed: {}; last output:\n{}",
                    e,
                    tail.join("\n")
                );
                return "transcoder pipe error";
            }
        }
    }
}

/// Resolves at the first watchdog tick where output has been idle past the
/// stall threshold.
pub(crate) async fn stall_watchdog(clock: Arc<ActivityClock>) {
    let mut ticks = tokio::time::interval(WATCHDOG_TICK);
    ticks.tick().await;
    loop {
        ticks.tick().await;
        if clock.idle() > STALL_AFTER {
            return;
        }
    }
}

/// A registry entry for one active session.
#[derive(Debug)]
struct SessionEntry {
    channel: String,
    client: String,
    started_at: DateTime<Utc>,
    cancel: Arc<CancelHandle>,
}

/// Serializable view of an active session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub id: u64,
    pub channel: String,
    pub client: String,
    pub started_at: String,
    pub elapsed_secs: i64,
}

/// Registry of active live-stream sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<u64, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, channel: String, client: String, cancel: Arc<CancelHandle>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sessions.lock().insert(
            id,
            SessionEntry {
                channel,
                client,
                started_at: Utc::now(),
                cancel,
            },
        );
        id
    }

    pub fn unregister(&self, id: u64) {
        self.sessions.lock().remove(&id);
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Fire every session's cancel trigger; used on shutdown.
    pub fn cancel_all(&self) {
        for entry in self.sessions.lock().values() {
            entry.cancel.fire();
        }
    }

    pub fn snapshot(&self) -> Vec<SessionView> {
        let now = Utc::now();
        let mut views: Vec<SessionView> = self
            .sessions
            .lock()
            .iter()
            .map(|(&id, e)| SessionView {
                id,
                channel: e.channel.clone(),
                client: e.client.clone(),
                started_at: e.started_at.to_rfc3339(),
                elapsed_secs: (now - e.started_at).num_seconds(),
            })
            .collect();
        views.sort_by_key(|v| v.id);
        views
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_fires_between_30_and_35_seconds() {
        let clock = ActivityClock::new();
        clock.touch();

        let start = tokio::time::Instant::now();
        stall_watchdog(clock).await;
        let elapsed = start.elapsed();

        assert!(elapsed > Duration::from_secs(30), "fired at {:?}", elapsed);
        assert!(elapsed <= Duration::from_secs(35), "fired at {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_holds_while_output_flows() {
        let clock = ActivityClock::new();
        clock.touch();

        let watchdog = tokio::spawn(stall_watchdog(Arc::clone(&clock)));
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(10)).await;
            clock.touch();
            assert!(!watchdog.is_finished());
        }
        watchdog.abort();
    }

    #[tokio::test]
    async fn test_live_stream_lifecycle() {
        use clap::Parser;
        use std::os::unix::fs::PermissionsExt;

        use crate::config::Args;
        use crate::tuner::command::{Codec, Engine};

        let dir = tempfile::tempdir().unwrap();
        // The fake demodulator produces data until the pipeline backs up;
        // the fake transcoder passes it through.
        let demod = dir.path().join("fake-demod.sh");
        std::fs::write(&demod, "#!/bin/sh\nexec head -c 10000000 /dev/zero\n").unwrap();
        let trans = dir.path().join("fake-transcoder.sh");
        std::fs::write(&trans, "#!/bin/sh\nexec cat\n").unwrap();
        for path in [&demod, &trans] {
            let mut perm = std::fs::metadata(path).unwrap().permissions();
            perm.set_mode(0o755);
            std::fs::set_permissions(path, perm).unwrap();
        }

        let mut args = Args::parse_from(["tunercast"]);
        args.demod_bin = demod.to_string_lossy().into_owned();
        args.transcode_bin = trans.to_string_lossy().into_owned();
        let cfg = GatewayConfig::from_args(&args).unwrap();

        let arbiter = Arc::new(TunerArbiter::new(1, false));
        let registry = Arc::new(SessionRegistry::new());
        let channel = Channel {
            number: "15.1".into(),
            name: "Test".into(),
            service_id: "3".into(),
            frequency: "500000000".into(),
            icon: None,
        };
        let fmt = StreamFormat::resolve(None, None, None, Engine::None, Codec::Copy);

        let mut live = open_stream(&cfg, &arbiter, &registry, &channel, fmt, "test".into())
            .await
            .unwrap();
        assert_eq!(live.content_type, "video/mp2t");

        // Bytes flow end to end while the session holds its tuner.
        let chunk = tokio::time::timeout(Duration::from_secs(10), live.body.recv())
            .await
            .expect("no output before timeout")
            .expect("stream ended early")
            .unwrap();
        assert!(!chunk.is_empty());
        assert!(!arbiter.all_idle());
        assert_eq!(registry.count(), 1);

        // Client disconnect tears the session down and frees the tuner.
        drop(live);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        while !(arbiter.all_idle() && registry.count() == 0) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "session did not tear down"
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_releases_lease() {
        use clap::Parser;

        use crate::config::Args;
        use crate::tuner::command::{Codec, Engine};

        let mut args = Args::parse_from(["tunercast"]);
        args.demod_bin = "/nonexistent/demodulator".into();
        let cfg = GatewayConfig::from_args(&args).unwrap();

        let arbiter = Arc::new(TunerArbiter::new(1, false));
        let registry = Arc::new(SessionRegistry::new());
        let channel = Channel {
            number: "2.1".into(),
            name: "Test".into(),
            service_id: "1".into(),
            frequency: "500000000".into(),
            icon: None,
        };
        let fmt = StreamFormat::resolve(None, None, None, Engine::None, Codec::Copy);

        let result = open_stream(&cfg, &arbiter, &registry, &channel, fmt, "test".into()).await;
        assert!(matches!(result, Err(GatewayError::Tuner(_))));
        assert!(arbiter.all_idle());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_registry_lifecycle() {
        let registry = SessionRegistry::new();
        let cancel = CancelHandle::new();
        let id = registry.register("55.2".into(), "127.0.0.1:9".into(), Arc::clone(&cancel));
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.snapshot()[0].channel, "55.2");

        registry.cancel_all();
        assert!(cancel.is_fired());

        registry.unregister(id);
        assert_eq!(registry.count(), 0);
    }
}
