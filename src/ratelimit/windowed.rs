//! Windowed admission: the permit count is reset to its maximum every interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::strategy::{AdmissionStrategy, Strategy};
use crate::error::{LimiterError, Result};

/// Permit window shared between the limiter and its refill task.
#[derive(Debug)]
struct Window {
    /// Permits handed out per interval
    max_count: AtomicU64,
    /// Permits left in the current window
    remaining: AtomicU64,
    /// Woken after every refill
    refilled: Notify,
}

impl Window {
    fn try_acquire(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn refill(&self) {
        self.remaining
            .store(self.max_count.load(Ordering::Acquire), Ordering::Release);
        self.refilled.notify_waiters();
    }
}

/// Grants at most `max_count` permits per refill interval.
///
/// A background task resets the permit count every interval regardless of how
/// many permits are left, so bursts of up to `max_count` are legal anywhere in
/// a window. The task lives until [`stop`](AdmissionStrategy::stop) is called,
/// the scope token it was spawned under is cancelled, or the strategy is
/// dropped.
#[derive(Debug)]
pub struct WindowedStrategy {
    window: Arc<Window>,
    period: watch::Sender<Duration>,
    token: CancellationToken,
}

impl WindowedStrategy {
    /// Spawn the refill task on the current Tokio runtime.
    ///
    /// The refill task is bound to a child of `scope`.
    pub fn spawn(scope: &CancellationToken, max_count: u64, interval: Duration) -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| LimiterError::Runtime(e.to_string()))?;

        let window = Arc::new(Window {
            max_count: AtomicU64::new(max_count),
            remaining: AtomicU64::new(max_count),
            refilled: Notify::new(),
        });
        let (period, period_rx) = watch::channel(interval);
        let token = scope.child_token();

        handle.spawn(refill_loop(window.clone(), period_rx, token.clone()));

        Ok(Self {
            window,
            period,
            token,
        })
    }
}

#[async_trait]
impl AdmissionStrategy for WindowedStrategy {
    fn kind(&self) -> Strategy {
        Strategy::Windowed
    }

    async fn take(&self) {
        loop {
            // Register for the next refill before looking at the counter so a
            // refill between the check and the wait is not missed.
            let refilled = self.window.refilled.notified();
            tokio::pin!(refilled);
            refilled.as_mut().enable();

            if self.token.is_cancelled() {
                break;
            }
            if self.window.try_acquire() {
                return;
            }

            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = refilled.as_mut() => {}
            }
        }

        // A stopped window never refills again.
        trace!("take parked on a stopped limiter");
        std::future::pending::<()>().await
    }

    fn available(&self) -> u64 {
        if self.token.is_cancelled() {
            return 0;
        }
        self.window.remaining.load(Ordering::Acquire)
    }

    fn limit(&self) -> u64 {
        self.window.max_count.load(Ordering::Acquire)
    }

    fn set_limit(&self, max_count: u64) {
        self.window.max_count.store(max_count, Ordering::Release);
    }

    fn interval(&self) -> Duration {
        *self.period.borrow()
    }

    fn set_interval(&self, interval: Duration) {
        self.period.send_replace(interval);
    }

    fn stop(&self) {
        self.token.cancel();
    }

    fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for WindowedStrategy {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Deadline used when an interval reaches past what `Instant` can hold.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn refill_ticker(period: Duration) -> Interval {
    let now = Instant::now();
    let first = now
        .checked_add(period)
        .unwrap_or_else(|| now + FAR_FUTURE);
    let mut ticker = time::interval_at(first, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn refill_loop(
    window: Arc<Window>,
    mut period_rx: watch::Receiver<Duration>,
    token: CancellationToken,
) {
    let mut ticker = refill_ticker(*period_rx.borrow_and_update());

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            changed = period_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let period = *period_rx.borrow_and_update();
                trace!(period = ?period, "Refill interval changed");
                ticker = refill_ticker(period);
            }
            _ = ticker.tick() => window.refill(),
        }
    }

    trace!("Refill task exited");
}
