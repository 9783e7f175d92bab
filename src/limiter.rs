use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Result};
use tracing::debug;

#[derive(Debug)]
struct Window {
    current: usize,
    max: usize,
    in_flight: usize,
}

/// Resizable counting permit pool bounding simultaneous downloads.
///
/// The window starts at `min`, grows by one each time a permit is released
/// (capped at `max`) and is put back to `min` by [`ConcurrencyLimiter::reset`].
/// Resizes and permit accounting share one lock so they cannot interleave.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    window: Mutex<Window>,
    released: Condvar,
    min: usize,
}

impl ConcurrencyLimiter {
    pub fn new(min: usize, max: usize) -> Result<Arc<Self>> {
        if min == 0 {
            return Err(anyhow!("minimum download concurrency must be >= 1"));
        }
        if max < min {
            return Err(anyhow!(
                "maximum download concurrency ({max}) must be >= minimum ({min})"
            ));
        }
        Ok(Arc::new(Self {
            window: Mutex::new(Window {
                current: min,
                max,
                in_flight: 0,
            }),
            released: Condvar::new(),
            min,
        }))
    }

    fn lock(&self) -> MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put the window back to the configured minimum. Permits already handed
    /// out stay valid; new ones wait until `in_flight < min`.
    pub fn reset(&self) {
        let mut w = self.lock();
        w.current = self.min;
        debug!(window = w.current, in_flight = w.in_flight, "download window reset");
    }

    /// Block until a slot is free.
    pub fn acquire(self: &Arc<Self>) -> DownloadPermit {
        let mut w = self.lock();
        while w.in_flight >= w.current {
            w = self
                .released
                .wait(w)
                .unwrap_or_else(PoisonError::into_inner);
        }
        w.in_flight += 1;
        DownloadPermit {
            limiter: Arc::clone(self),
        }
    }

    #[cfg(test)]
    fn try_acquire(self: &Arc<Self>) -> Option<DownloadPermit> {
        let mut w = self.lock();
        if w.in_flight >= w.current {
            return None;
        }
        w.in_flight += 1;
        Some(DownloadPermit {
            limiter: Arc::clone(self),
        })
    }

    pub fn current(&self) -> usize {
        self.lock().current
    }

    #[cfg(test)]
    fn max(&self) -> usize {
        self.lock().max
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    fn release(&self) {
        let mut w = self.lock();
        w.in_flight = w.in_flight.saturating_sub(1);
        if w.current < w.max {
            w.current += 1;
        }
        debug!(window = w.current, in_flight = w.in_flight, "download slot released");
        drop(w);
        self.released.notify_all();
    }
}

/// A held download slot. Dropping it releases the slot and grows the window.
#[derive(Debug)]
pub struct DownloadPermit {
    limiter: Arc<ConcurrencyLimiter>,
}

impl Drop for DownloadPermit {
    fn drop(&mut self) {
        self.limiter.release();
    }
}
