//! Admission quota: a counting semaphore with a waiter queue.
//!
//! Listeners use a quota to bound concurrent accepted connections. An
//! attach either succeeds, succeeds while warning that the soft threshold
//! has been crossed, or queues a callback that is invoked when a slot
//! frees. A release that satisfies a waiter transfers the slot directly;
//! the slot never returns to the pool first, so a late attacher cannot
//! jump the queue.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

/// Callback invoked with a transferred slot when one frees up.
pub type QuotaCb = Box<dyn FnOnce(QuotaRef) + Send>;

/// Outcome of [`Quota::attach_cb`].
pub enum QuotaAttach {
    /// A slot was taken.
    Granted(QuotaRef),
    /// A slot was taken, but usage is at or above the soft threshold.
    Soft(QuotaRef),
    /// No slot; the callback was queued and fires on release.
    Queued,
}

struct QuotaState {
    used: usize,
    max: usize,
    soft: usize,
    waiters: VecDeque<QuotaCb>,
}

/// A counting semaphore with soft/hard thresholds and a FIFO waiter queue.
pub struct Quota {
    state: Mutex<QuotaState>,
}

impl std::fmt::Debug for Quota {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Quota")
            .field("used", &state.used)
            .field("max", &state.max)
            .field("soft", &state.soft)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

impl Quota {
    /// Create a quota with `max` slots and the soft threshold at `soft`.
    pub fn new(max: usize, soft: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QuotaState {
                used: 0,
                max,
                soft: soft.min(max),
                waiters: VecDeque::new(),
            }),
        })
    }

    /// Create a quota with the soft threshold equal to the hard limit.
    pub fn with_max(max: usize) -> Arc<Self> {
        Self::new(max, max)
    }

    /// Slots currently attached.
    pub fn in_use(self: &Arc<Self>) -> usize {
        self.state.lock().used
    }

    /// Queued waiters.
    pub fn waiting(self: &Arc<Self>) -> usize {
        self.state.lock().waiters.len()
    }

    /// Try to take a slot; queue `cb` if none is available.
    pub fn attach_cb(self: &Arc<Self>, cb: QuotaCb) -> QuotaAttach {
        let mut state = self.state.lock();
        if state.used >= state.max {
            state.waiters.push_back(cb);
            return QuotaAttach::Queued;
        }
        state.used += 1;
        let soft = state.used >= state.soft;
        drop(state);

        let quota_ref = QuotaRef {
            quota: Arc::clone(self),
            soft,
        };
        if soft {
            QuotaAttach::Soft(quota_ref)
        } else {
            QuotaAttach::Granted(quota_ref)
        }
    }

    /// Release one slot, or hand it to the oldest waiter.
    fn release(self: &Arc<Self>) {
        let waiter = {
            let mut state = self.state.lock();
            match state.waiters.pop_front() {
                Some(cb) => {
                    // Slot transfers to the waiter; `used` stays as-is.
                    let soft = state.used >= state.soft;
                    Some((cb, soft))
                }
                None => {
                    debug_assert!(state.used > 0);
                    state.used = state.used.saturating_sub(1);
                    None
                }
            }
        };

        if let Some((cb, soft)) = waiter {
            cb(QuotaRef {
                quota: Arc::clone(self),
                soft,
            });
        }
    }
}

/// An attached quota slot. Dropping it releases the slot (or transfers it
/// to a queued waiter), so each accepted connection releases exactly once.
pub struct QuotaRef {
    quota: Arc<Quota>,
    soft: bool,
}

impl std::fmt::Debug for QuotaRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaRef").field("soft", &self.soft).finish()
    }
}

impl QuotaRef {
    /// Whether this attachment crossed the soft threshold.
    pub fn is_soft(&self) -> bool {
        self.soft
    }
}

impl Drop for QuotaRef {
    fn drop(&mut self) {
        self.quota.clone().release();
    }
}
