//! Cooperative cancellation for stress runs.
//!
//! A [`CancelToken`] is a broadcast, set-once flag: the monitor (or a signal
//! handler) trips it exactly once and every worker observes it lock-free
//! between batches of work. Tokens are explicit values passed to whatever
//! must observe them — never process globals — so independent runs can
//! coexist in one test process.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Broadcast cancellation flag shared between a run and its workers.
///
/// Cloning is cheap and every clone observes the same flag. Once tripped the
/// token never resets; a new run builds a new token.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a fresh, untripped token.
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Trip the token. Returns `true` only for the call that actually flipped
    /// the flag, so callers can gate one-shot side effects (signal broadcast,
    /// logging) on the first trip.
    pub fn cancel(&self) -> bool {
        self.flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_is_not_cancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn cancel_is_monotonic_and_set_once() {
        let token = CancelToken::new();
        assert!(token.cancel(), "first cancel should win");
        assert!(token.is_cancelled());
        assert!(!token.cancel(), "second cancel must be a no-op");
        assert!(token.is_cancelled());
    }

    #[test]
    fn clones_share_the_flag() {
        let token = CancelToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());
        token.cancel();
        assert!(observer.is_cancelled());
    }

    #[test]
    fn visible_across_threads() {
        let token = CancelToken::new();
        let worker_view = token.clone();
        let handle = std::thread::spawn(move || {
            while !worker_view.is_cancelled() {
                std::thread::yield_now();
            }
            true
        });
        token.cancel();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn independent_tokens_do_not_interfere() {
        let a = CancelToken::new();
        let b = CancelToken::new();
        a.cancel();
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
    }
}
