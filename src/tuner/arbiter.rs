//! Tuner arbiter: exclusive leases over the pool of physical tuners.
//!
//! The arbiter is the single source of truth for lease state. Placement is
//! round-robin over idle tuners; when none is idle the request may preempt a
//! lower-ranked session, then falls back to a bounded wait-and-retry loop.
//! "No tuner" is expressed as `None`, never as an error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Interval between free-search retries while waiting for a tuner.
const RETRY_DELAY: Duration = Duration::from_millis(500);
/// Total wait budget before giving up and returning `None`.
const ACQUIRE_BUDGET: Duration = Duration::from_secs(5);
/// Poll interval while waiting for a preempted session to release.
const PREEMPT_POLL: Duration = Duration::from_millis(200);
/// How long to wait for a preempted session to reach idle.
const PREEMPT_WAIT: Duration = Duration::from_secs(3);

/// Workload class of a lease request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseKind {
    Live,
    Epg,
    Dvr,
}

/// Lease state of one tuner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunerState {
    Idle,
    Live,
    Epg,
    Dvr,
    Cleaning,
}

impl TunerState {
    fn for_kind(kind: LeaseKind) -> Self {
        match kind {
            LeaseKind::Live => TunerState::Live,
            LeaseKind::Epg => TunerState::Epg,
            LeaseKind::Dvr => TunerState::Dvr,
        }
    }
}

/// Idempotent cancellation trigger handed from a session to the arbiter.
///
/// Firing it more than once is a no-op; `cancelled()` resolves immediately if
/// the trigger already fired.
#[derive(Debug, Default)]
pub struct CancelHandle {
    fired: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fire the trigger. Re-entrant calls are no-ops.
    pub fn fire(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Wait until the trigger fires.
    pub async fn cancelled(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register interest before checking the flag so a concurrent fire()
        // cannot slip between the check and the await.
        notified.as_mut().enable();
        if self.fired.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }
}

#[derive(Debug)]
struct Slot {
    state: TunerState,
    cancel: Option<Arc<CancelHandle>>,
}

#[derive(Debug)]
struct PoolState {
    slots: Vec<Slot>,
    last_granted: usize,
}

/// Snapshot of one tuner for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct TunerStatus {
    pub id: usize,
    pub state: TunerState,
}

/// Arbiter over N physical tuners.
pub struct TunerArbiter {
    state: Mutex<PoolState>,
    preemption_enabled: bool,
}

impl TunerArbiter {
    pub fn new(tuner_count: usize, preemption_enabled: bool) -> Self {
        let slots = (0..tuner_count)
            .map(|_| Slot {
                state: TunerState::Idle,
                cancel: None,
            })
            .collect::<Vec<_>>();
        Self {
            state: Mutex::new(PoolState {
                slots,
                // First grant lands on tuner 0.
                last_granted: tuner_count.saturating_sub(1),
            }),
            preemption_enabled,
        }
    }

    pub fn tuner_count(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Acquire an exclusive lease for the given workload.
    ///
    /// Returns `None` once the wait budget is exhausted; the caller maps
    /// that to a 503.
    pub async fn acquire(self: &Arc<Self>, kind: LeaseKind) -> Option<Lease> {
        let deadline = Instant::now() + ACQUIRE_BUDGET;

        loop {
            if let Some(lease) = self.try_grant(kind) {
                return Some(lease);
            }

            if let Some((victim, cancel)) = self.pick_victim(kind) {
                info!("arbiter: preempting tuner {} for {:?} request", victim, kind);
                if let Some(cancel) = cancel {
                    cancel.fire();
                }
                let preempt_deadline = Instant::now() + PREEMPT_WAIT;
                while Instant::now() < preempt_deadline {
                    tokio::time::sleep(PREEMPT_POLL).await;
                    if let Some(lease) = self.try_grant(kind) {
                        return Some(lease);
                    }
                }
                warn!("arbiter: preempted tuner {} did not release in time", victim);
            }

            if Instant::now() >= deadline {
                debug!("arbiter: wait budget exhausted for {:?} request", kind);
                return None;
            }
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }

    /// Round-robin search for an idle tuner, starting after the last grant.
    fn try_grant(self: &Arc<Self>, kind: LeaseKind) -> Option<Lease> {
        let mut pool = self.state.lock();
        let n = pool.slots.len();
        for step in 1..=n {
            let idx = (pool.last_granted + step) % n;
            if pool.slots[idx].state == TunerState::Idle {
                pool.slots[idx].state = TunerState::for_kind(kind);
                pool.last_granted = idx;
                debug!("arbiter: granted tuner {} to {:?}", idx, kind);
                return Some(Lease {
                    arbiter: Arc::clone(self),
                    tuner_id: idx,
                    kind,
                    released: AtomicBool::new(false),
                });
            }
        }
        None
    }

    /// Choose a preemption victim per the workload ranks.
    ///
    /// `dvr` outranks both live and EPG sessions; `live` may displace only
    /// another live session and only when preemption is enabled. An EPG scan
    /// releases itself shortly, so live never interrupts it.
    fn pick_victim(&self, kind: LeaseKind) -> Option<(usize, Option<Arc<CancelHandle>>)> {
        let pool = self.state.lock();
        let victim_states: &[TunerState] = match kind {
            LeaseKind::Dvr => &[TunerState::Live, TunerState::Epg],
            LeaseKind::Live if self.preemption_enabled => &[TunerState::Live],
            _ => return None,
        };
        for &wanted in victim_states {
            if let Some((idx, slot)) = pool
                .slots
                .iter()
                .enumerate()
                .find(|(_, s)| s.state == wanted)
            {
                return Some((idx, slot.cancel.clone()));
            }
        }
        None
    }

    /// Store a session's cancel trigger, keyed by tuner id.
    pub fn register_cancel(&self, tuner_id: usize, cancel: Arc<CancelHandle>) {
        let mut pool = self.state.lock();
        if let Some(slot) = pool.slots.get_mut(tuner_id) {
            slot.cancel = Some(cancel);
        }
    }

    /// Mark a leased tuner as draining its child processes.
    fn mark_cleaning(&self, tuner_id: usize) {
        let mut pool = self.state.lock();
        if let Some(slot) = pool.slots.get_mut(tuner_id) {
            if slot.state != TunerState::Idle {
                slot.state = TunerState::Cleaning;
            }
        }
    }

    /// Return a tuner to the idle state and drop its cancel trigger.
    fn mark_idle(&self, tuner_id: usize) {
        let mut pool = self.state.lock();
        if let Some(slot) = pool.slots.get_mut(tuner_id) {
            slot.state = TunerState::Idle;
            slot.cancel = None;
        }
    }

    /// Atomic all-idle check used to gate an EPG scan.
    pub fn all_idle(&self) -> bool {
        self.state
            .lock()
            .slots
            .iter()
            .all(|s| s.state == TunerState::Idle)
    }

    /// Lease states for the status API.
    pub fn snapshot(&self) -> Vec<TunerStatus> {
        self.state
            .lock()
            .slots
            .iter()
            .enumerate()
            .map(|(id, s)| TunerStatus { id, state: s.state })
            .collect()
    }
}

impl std::fmt::Debug for TunerArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunerArbiter")
            .field("tuners", &self.tuner_count())
            .field("preemption_enabled", &self.preemption_enabled)
            .finish()
    }
}

/// An exclusive lease on one tuner.
///
/// Release is idempotent and also happens on drop, so a panicking session
/// can never leak its tuner.
pub struct Lease {
    arbiter: Arc<TunerArbiter>,
    tuner_id: usize,
    kind: LeaseKind,
    released: AtomicBool,
}

impl Lease {
    pub fn tuner_id(&self) -> usize {
        self.tuner_id
    }

    /// Flag the tuner as tearing down its processes.
    pub fn begin_cleaning(&self) {
        if !self.released.load(Ordering::SeqCst) {
            self.arbiter.mark_cleaning(self.tuner_id);
        }
    }

    /// Release the lease. Safe to call more than once.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.arbiter.mark_idle(self.tuner_id);
            debug!("arbiter: tuner {} released", self.tuner_id);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("tuner_id", &self.tuner_id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn held(arbiter: &TunerArbiter) -> usize {
        arbiter
            .snapshot()
            .iter()
            .filter(|s| s.state != TunerState::Idle)
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_robin_placement() {
        let arb = Arc::new(TunerArbiter::new(3, false));

        let a = arb.acquire(LeaseKind::Live).await.unwrap();
        let b = arb.acquire(LeaseKind::Live).await.unwrap();
        assert_eq!(a.tuner_id(), 0);
        assert_eq!(b.tuner_id(), 1);

        // Releasing 0 does not pull placement back; the search continues
        // from the last grant.
        drop(a);
        let c = arb.acquire(LeaseKind::Live).await.unwrap();
        assert_eq!(c.tuner_id(), 2);
        let d = arb.acquire(LeaseKind::Live).await.unwrap();
        assert_eq!(d.tuner_id(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_count_bounded() {
        let arb = Arc::new(TunerArbiter::new(2, false));
        let _a = arb.acquire(LeaseKind::Live).await.unwrap();
        let _b = arb.acquire(LeaseKind::Epg).await.unwrap();
        assert_eq!(held(&arb), 2);

        // Third request exhausts the wait budget.
        assert!(arb.acquire(LeaseKind::Live).await.is_none());
        assert_eq!(held(&arb), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_idempotent() {
        let arb = Arc::new(TunerArbiter::new(1, false));
        let lease = arb.acquire(LeaseKind::Live).await.unwrap();
        lease.release();
        lease.release();
        assert_eq!(held(&arb), 0);
        drop(lease);
        assert_eq!(held(&arb), 0);

        assert!(arb.acquire(LeaseKind::Live).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_never_preempts_epg() {
        let arb = Arc::new(TunerArbiter::new(1, true));
        let epg = arb.acquire(LeaseKind::Epg).await.unwrap();
        let cancel = CancelHandle::new();
        arb.register_cancel(epg.tuner_id(), Arc::clone(&cancel));

        assert!(arb.acquire(LeaseKind::Live).await.is_none());
        assert!(!cancel.is_fired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_preempts_live_when_enabled() {
        let arb = Arc::new(TunerArbiter::new(1, true));
        let victim = arb.acquire(LeaseKind::Live).await.unwrap();
        let cancel = CancelHandle::new();
        arb.register_cancel(victim.tuner_id(), Arc::clone(&cancel));

        // The victim session releases its lease when cancelled.
        let observer = Arc::clone(&cancel);
        tokio::spawn(async move {
            observer.cancelled().await;
            drop(victim);
        });

        let lease = arb.acquire(LeaseKind::Live).await;
        assert!(lease.is_some());
        assert!(cancel.is_fired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_preemption_disabled() {
        let arb = Arc::new(TunerArbiter::new(1, false));
        let victim = arb.acquire(LeaseKind::Live).await.unwrap();
        let cancel = CancelHandle::new();
        arb.register_cancel(victim.tuner_id(), Arc::clone(&cancel));

        assert!(arb.acquire(LeaseKind::Live).await.is_none());
        assert!(!cancel.is_fired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dvr_preempts_epg() {
        let arb = Arc::new(TunerArbiter::new(1, false));
        let victim = arb.acquire(LeaseKind::Epg).await.unwrap();
        let cancel = CancelHandle::new();
        arb.register_cancel(victim.tuner_id(), Arc::clone(&cancel));

        let observer = Arc::clone(&cancel);
        tokio::spawn(async move {
            observer.cancelled().await;
            drop(victim);
        });

        assert!(arb.acquire(LeaseKind::Dvr).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_idle_gate() {
        let arb = Arc::new(TunerArbiter::new(2, false));
        assert!(arb.all_idle());
        let lease = arb.acquire(LeaseKind::Live).await.unwrap();
        assert!(!arb.all_idle());
        drop(lease);
        assert!(arb.all_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleaning_state_visible() {
        let arb = Arc::new(TunerArbiter::new(1, false));
        let lease = arb.acquire(LeaseKind::Live).await.unwrap();
        lease.begin_cleaning();
        assert_eq!(arb.snapshot()[0].state, TunerState::Cleaning);
        drop(lease);
        assert_eq!(arb.snapshot()[0].state, TunerState::Idle);
    }

    #[test]
    fn test_snapshot_serialization() {
        let arb = TunerArbiter::new(1, false);
        let json = serde_json::to_string(&arb.snapshot()).unwrap();
        assert_eq!(json, r#"[{"id":0,"state":"idle"}]"#);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_handle_idempotent() {
        let cancel = CancelHandle::new();
        cancel.fire();
        cancel.fire();
        // Resolves immediately after the fact.
        cancel.cancelled().await;
        assert!(cancel.is_fired());
    }
}
