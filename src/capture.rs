//! Pooled response-status capturer, per `spec.md` §4.4.
//!
//! `axum`/`tower` hand a middleware a complete `Response<Body>` value rather
//! than a streaming writer, so there is no `write`/`flush` to forward here;
//! what the capturer still needs to do is record the first status code
//! observed and be guaranteed back to its pool on every exit path, including
//! a panicking or cancelled inner future.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;

const SENTINEL: i32 = -1;

/// Holds the first status code recorded via [`write_header`](Capturer::write_header).
/// Reusable: [`reset`](Capturer::reset) restores the sentinel so the same
/// allocation can serve the next request.
struct Capturer {
    code: AtomicI32,
}

impl Capturer {
    fn new() -> Self {
        Self {
            code: AtomicI32::new(SENTINEL),
        }
    }

    /// Record `code` if no code has been recorded yet. Mirrors the
    /// "first write wins" semantics of a real `writeHeader`.
    fn write_header(&self, code: u16) {
        let _ = self.code.compare_exchange(
            SENTINEL,
            i32::from(code),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// The recorded code, or `None` if the sentinel was never overwritten —
    /// treated by the middleware as an implicit 200 per `spec.md` §4.3 rule 6.
    fn recorded(&self) -> Option<u16> {
        match self.code.load(Ordering::Acquire) {
            SENTINEL => None,
            code => u16::try_from(code).ok(),
        }
    }

    fn reset(&self) {
        self.code.store(SENTINEL, Ordering::Release);
    }
}

/// A small free-list pool of [`Capturer`]s, avoiding an allocation per
/// request on the hot path.
pub struct CapturerPool {
    free: Mutex<Vec<Arc<Capturer>>>,
}

impl CapturerPool {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Acquire a capturer, reusing a pooled one if available.
    pub fn acquire(self: &Arc<Self>) -> CapturerGuard {
        let capturer = self
            .free
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| Arc::new(Capturer::new()));
        CapturerGuard {
            pool: Arc::clone(self),
            capturer: Some(capturer),
        }
    }
}

impl Default for CapturerPool {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII handle bound to the request in flight. Dropping it — on the normal
/// path, on an error path, or during unwind from a panic in the wrapped
/// future — always resets and returns the capturer to its pool.
pub struct CapturerGuard {
    pool: Arc<CapturerPool>,
    capturer: Option<Arc<Capturer>>,
}

impl CapturerGuard {
    /// Record the status code observed on the response.
    pub fn write_header(&self, code: u16) {
        if let Some(capturer) = &self.capturer {
            capturer.write_header(code);
        }
    }

    /// The code recorded so far, if any.
    pub fn recorded(&self) -> Option<u16> {
        self.capturer.as_ref().and_then(|c| c.recorded())
    }
}

impl Drop for CapturerGuard {
    fn drop(&mut self) {
        if let Some(capturer) = self.capturer.take() {
            capturer.reset();
            if let Ok(mut free) = self.pool.free.lock() {
                free.push(capturer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_capturer_has_no_recorded_code() {
        let pool = Arc::new(CapturerPool::new());
        let guard = pool.acquire();
        assert_eq!(guard.recorded(), None);
    }

    #[test]
    fn first_write_header_wins() {
        let pool = Arc::new(CapturerPool::new());
        let guard = pool.acquire();
        guard.write_header(500);
        guard.write_header(200);
        assert_eq!(guard.recorded(), Some(500));
    }

    #[test]
    fn release_resets_and_reuses_the_same_allocation() {
        let pool = Arc::new(CapturerPool::new());
        {
            let guard = pool.acquire();
            guard.write_header(500);
        }
        let guard = pool.acquire();
        assert_eq!(guard.recorded(), None);
        assert_eq!(pool.free.lock().unwrap().len(), 0);
    }

    #[test]
    fn drop_returns_capturer_to_pool() {
        let pool = Arc::new(CapturerPool::new());
        drop(pool.acquire());
        assert_eq!(pool.free.lock().unwrap().len(), 1);
    }
}
