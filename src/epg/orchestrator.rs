//! EPG scan orchestration.
//!
//! On a cold start (no store file yet) the orchestrator runs one deep scan
//! before declaring readiness; afterwards a background scan refreshes the
//! guide every fifteen minutes. A scan only begins when every tuner is idle
//! and no other scan is running; per-frequency failures are logged and the
//! loop moves on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::time::{interval, Instant};

use crate::channels::ChannelSet;
use crate::config::GatewayConfig;
use crate::epg::parser::{self, SourceMap};
use crate::error::GatewayError;
use crate::store::ProgramStore;
use crate::tuner::arbiter::{LeaseKind, TunerArbiter};
use crate::tuner::command::demodulator_args;
use crate::tuner::supervisor;

/// Per-frequency capture window for the cold-start deep scan.
const DEEP_SCAN_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-frequency capture window for periodic refresh scans.
const QUICK_SCAN_TIMEOUT: Duration = Duration::from_secs(15);
/// Interval between background scans.
const SCAN_INTERVAL: Duration = Duration::from_secs(15 * 60);
/// Pause between frequencies, letting the hardware settle.
const INTER_MUX_DELAY: Duration = Duration::from_secs(2);
/// Poll interval for requests waiting on initial readiness.
const READY_POLL: Duration = Duration::from_secs(2);
/// Hard cap on a single frequency capture.
const CAPTURE_CAP: usize = 50 * 1024 * 1024;
/// Slack added to the demodulator's own deadline before we give up reading.
const CAPTURE_SLACK: Duration = Duration::from_secs(5);

/// Background EPG scan orchestrator.
pub struct EpgOrchestrator {
    arbiter: Arc<TunerArbiter>,
    channels: Arc<ChannelSet>,
    store: Arc<dyn ProgramStore>,
    config: Arc<GatewayConfig>,
    /// Whether the cold-start deep scan still needs to run.
    startup_scan_needed: bool,
    scanning: AtomicBool,
    initial_scan_done: AtomicBool,
    source_map: Mutex<SourceMap>,
}

impl EpgOrchestrator {
    pub fn new(
        arbiter: Arc<TunerArbiter>,
        channels: Arc<ChannelSet>,
        store: Arc<dyn ProgramStore>,
        config: Arc<GatewayConfig>,
        startup_scan_needed: bool,
    ) -> Self {
        Self {
            arbiter,
            channels,
            store,
            config,
            startup_scan_needed,
            scanning: AtomicBool::new(false),
            initial_scan_done: AtomicBool::new(false),
            source_map: Mutex::new(SourceMap::new()),
        }
    }

    /// Start the orchestrator background task.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        if self.startup_scan_needed {
            info!("epg: no guide store found, running startup deep scan");
            self.scan(DEEP_SCAN_TIMEOUT).await;
        } else {
            info!("epg: guide store exists, skipping startup scan");
        }
        self.mark_ready();

        let mut ticks = interval(SCAN_INTERVAL);
        ticks.tick().await; // the immediate first tick
        loop {
            ticks.tick().await;
            self.scan(QUICK_SCAN_TIMEOUT).await;
        }
    }

    /// Flip the readiness flag. Also used when the orchestrator is disabled
    /// so stream requests never wait.
    pub fn mark_ready(&self) {
        self.initial_scan_done.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.initial_scan_done.load(Ordering::SeqCst)
    }

    /// Block until the initial scan has completed or been skipped.
    pub async fn wait_ready(&self) {
        while !self.is_ready() {
            tokio::time::sleep(READY_POLL).await;
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Run one scan over every distinct frequency.
    ///
    /// All-or-nothing guard: the scan is dropped when another is already in
    /// progress or any tuner is busy.
    pub async fn scan(&self, per_frequency: Duration) {
        if self.scanning.swap(true, Ordering::SeqCst) {
            info!("epg: scan already in progress, skipping");
            return;
        }
        if !self.arbiter.all_idle() {
            info!("epg: tuners busy, skipping scan");
            self.scanning.store(false, Ordering::SeqCst);
            return;
        }

        let frequencies = self.channels.frequencies();
        info!(
            "epg: scanning {} frequency(ies), {}s per frequency",
            frequencies.len(),
            per_frequency.as_secs()
        );

        for frequency in frequencies {
            if let Err(e) = self.scan_frequency(&frequency, per_frequency).await {
                warn!("epg: scan of {} failed: {}", frequency, e);
            }
            tokio::time::sleep(INTER_MUX_DELAY).await;
        }

        info!("epg: scan complete");
        self.scanning.store(false, Ordering::SeqCst);
    }

    /// Capture one frequency and parse the result.
    ///
    /// The tuner lease is released as soon as the demodulator has exited;
    /// parsing runs on the captured buffer afterwards.
    async fn scan_frequency(
        &self,
        frequency: &str,
        window: Duration,
    ) -> Result<(), GatewayError> {
        let channel = self
            .channels
            .first_on_frequency(frequency)
            .ok_or_else(|| GatewayError::Scan(format!("no channel on frequency {frequency}")))?;

        let lease = self
            .arbiter
            .acquire(LeaseKind::Epg)
            .await
            .ok_or(GatewayError::NoTunerAvailable)?;

        let args = demodulator_args(
            &self.config.channels_conf,
            lease.tuner_id(),
            &channel.number,
            Some(window.as_secs()),
        );
        let mut child = supervisor::spawn_capture(&self.config.demod_bin, &args)
            .map_err(|e| GatewayError::Scan(format!("demodulator spawn failed: {e}")))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::Scan("demodulator stdout not captured".into()))?;

        let mut capture = Vec::with_capacity(1024 * 1024);
        let mut chunk = vec![0u8; 64 * 1024];
        let deadline = Instant::now() + window + CAPTURE_SLACK;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let _ = child.start_kill();
                break;
            }
            match tokio::time::timeout(remaining, stdout.read(&mut chunk)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    capture.extend_from_slice(&chunk[..n]);
                    if capture.len() > CAPTURE_CAP {
                        warn!(
                            "epg: capture on {} exceeded {} bytes, killing demodulator",
                            frequency, CAPTURE_CAP
                        );
                        let _ = child.start_kill();
                        break;
                    }
                }
                Ok(Err(e)) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(GatewayError::Scan(format!("capture read failed: {e}")));
                }
                Err(_) => {
                    let _ = child.start_kill();
                    break;
                }
            }
        }

        let _ = child.wait().await;
        drop(lease);

        let mut map = self.source_map.lock();
        parser::parse_capture(&capture, frequency, &self.channels, &mut map, self.store.as_ref());
        Ok(())
    }
}

impl std::fmt::Debug for EpgOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpgOrchestrator")
            .field("ready", &self.is_ready())
            .field("scanning", &self.is_scanning())
            .finish()
    }
}
