use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex as AsyncMutex, Notify, Semaphore, SemaphorePermit};
use tokio::time::sleep;
use tracing::trace;

/// Run-level cancellation shared by every worker.
///
/// Checking is a plain atomic load; waiters parked on a gate are woken as
/// soon as `cancel` is called.
#[derive(Debug, Default)]
pub struct CancelSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// Enforces a minimum interval between consecutive calls, process-wide.
///
/// One gate is shared by every worker; the lock is held while waiting so
/// callers are released strictly one interval apart.
pub struct PacingGate {
    interval: Duration,
    last_call: AsyncMutex<Option<Instant>>,
}

impl PacingGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_call: AsyncMutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn acquire(&self) {
        self.acquire_unless_cancelled(None).await;
    }

    /// Waits for the next slot, giving up as soon as `cancel` fires.
    ///
    /// Returns `false` when cancelled; the slot is then left unused and the
    /// last-call time is not moved.
    pub async fn acquire_unless_cancelled(&self, cancel: Option<&CancelSignal>) -> bool {
        let wait_turn = async {
            let guard = self.last_call.lock().await;
            if let Some(prev) = *guard {
                let elapsed = prev.elapsed();
                if elapsed < self.interval {
                    let wait = self.interval - elapsed;
                    trace!(?wait, "pacing primary call");
                    sleep(wait).await;
                }
            }
            guard
        };

        let mut guard = match cancel {
            Some(signal) => tokio::select! {
                guard = wait_turn => guard,
                _ = signal.cancelled() => return false,
            },
            None => wait_turn.await,
        };
        if cancel.is_some_and(CancelSignal::is_cancelled) {
            return false;
        }
        *guard = Some(Instant::now());
        true
    }
}

/// Counting gate capping the number of in-flight calls.
pub struct AdmissionGate {
    permits: Semaphore,
    capacity: usize,
}

impl AdmissionGate {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Semaphore::new(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Waits for a free slot. The slot is released when the permit drops.
    pub async fn acquire(&self) -> Option<SemaphorePermit<'_>> {
        // Never closed, so `None` is unreachable in practice.
        self.permits.acquire().await.ok()
    }
}

/// How calls to one provider are admitted.
#[derive(Clone)]
pub enum ProviderGate {
    Paced(Arc<PacingGate>),
    Admission(Arc<AdmissionGate>),
}

/// Held for the duration of a single provider call.
pub struct GatePass<'a> {
    _permit: Option<SemaphorePermit<'a>>,
}

impl ProviderGate {
    /// `None` when `cancel` fired before the gate let the caller through.
    pub async fn enter(&self, cancel: Option<&CancelSignal>) -> Option<GatePass<'_>> {
        let permit = match self {
            ProviderGate::Paced(gate) => {
                if !gate.acquire_unless_cancelled(cancel).await {
                    return None;
                }
                None
            }
            ProviderGate::Admission(gate) => match cancel {
                Some(signal) => tokio::select! {
                    permit = gate.acquire() => permit,
                    _ = signal.cancelled() => return None,
                },
                None => gate.acquire().await,
            },
        };
        if cancel.is_some_and(CancelSignal::is_cancelled) {
            return None;
        }
        Some(GatePass { _permit: permit })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[tokio::test]
    async fn pacing_is_global_across_tasks() {
        let gate = Arc::new(PacingGate::new(Duration::from_millis(40)));
        let calls = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let started = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let gate = gate.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                gate.acquire().await;
                calls.lock().push(Instant::now());
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut calls = calls.lock().clone();
        calls.sort();
        assert!(started.elapsed() >= Duration::from_millis(120));
        for pair in calls.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(35));
        }
    }

    #[tokio::test]
    async fn cancelled_waiters_leave_the_pacing_gate_promptly() {
        let gate = Arc::new(PacingGate::new(Duration::from_millis(500)));
        let signal = Arc::new(CancelSignal::new());
        gate.acquire().await;

        let started = Instant::now();
        let mut waiters = Vec::new();
        for _ in 0..3 {
            let gate = gate.clone();
            let signal = signal.clone();
            waiters.push(tokio::spawn(async move {
                gate.acquire_unless_cancelled(Some(&signal)).await
            }));
        }
        sleep(Duration::from_millis(30)).await;
        signal.cancel();

        for waiter in waiters {
            assert!(!waiter.await.unwrap());
        }
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test]
    async fn cancelled_wait_does_not_move_the_last_call() {
        let gate = PacingGate::new(Duration::from_millis(200));
        gate.acquire().await;
        let first = Instant::now();

        let signal = CancelSignal::new();
        signal.cancel();
        assert!(!gate.acquire_unless_cancelled(Some(&signal)).await);

        gate.acquire().await;
        let waited = first.elapsed();
        assert!(waited >= Duration::from_millis(190));
        assert!(waited < Duration::from_millis(350));
    }

    #[tokio::test]
    async fn admission_caps_in_flight_calls() {
        let gate = Arc::new(ProviderGate::Admission(Arc::new(AdmissionGate::new(2))));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let gate = gate.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _pass = gate.enter(None).await;
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(20)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }
}
