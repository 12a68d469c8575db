use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::core::error::{Error, Result};

struct TokenState {
    next_serial: u64,
    outstanding: BTreeSet<u64>,
    shut_down: bool,
}

struct TokenInner {
    state: Mutex<TokenState>,
    returned: Condvar,
}

/// Hands out short-lived reader credentials. While a token is
/// outstanding, every slice-buffer vector published before the token
/// was issued stays alive: the recycler defers destruction behind a
/// tracker snapshot of the outstanding set.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<TokenInner>,
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenManager {
    pub fn new() -> Self {
        TokenManager {
            inner: Arc::new(TokenInner {
                state: Mutex::new(TokenState {
                    next_serial: 0,
                    outstanding: BTreeSet::new(),
                    shut_down: false,
                }),
                returned: Condvar::new(),
            }),
        }
    }

    /// Issues a token. Refused once the manager is shut down.
    pub fn request_token(&self) -> Result<Token> {
        let mut state = self.inner.state.lock();
        if state.shut_down {
            return Err(Error::ShutDown);
        }
        let serial = state.next_serial;
        state.next_serial += 1;
        state.outstanding.insert(serial);
        Ok(Token { inner: self.inner.clone(), serial })
    }

    /// Snapshots the set of currently outstanding tokens. The tracker
    /// completes once every token issued before this call is returned.
    pub fn start_tracker(&self) -> TokenTracker {
        let state = self.inner.state.lock();
        TokenTracker { inner: self.inner.clone(), cutoff: state.next_serial }
    }

    /// Refuses new tokens and blocks until every outstanding token has
    /// been returned.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.shut_down = true;
        while !state.outstanding.is_empty() {
            self.inner.returned.wait(&mut state);
        }
    }

    pub fn outstanding_count(&self) -> usize {
        self.inner.state.lock().outstanding.len()
    }
}

/// A reader credential. Returning it (dropping) wakes any tracker
/// waiting on its generation.
pub struct Token {
    inner: Arc<TokenInner>,
    serial: u64,
}

impl Token {
    pub fn serial(&self) -> u64 {
        self.serial
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.outstanding.remove(&self.serial);
        self.inner.returned.notify_all();
    }
}

/// Completion gate over the tokens that were outstanding when the
/// tracker was started. Tokens issued later do not delay it.
pub struct TokenTracker {
    inner: Arc<TokenInner>,
    cutoff: u64,
}

impl TokenTracker {
    /// True once every tracked token has been returned.
    pub fn is_complete(&self) -> bool {
        let state = self.inner.state.lock();
        Self::complete(&state.outstanding, self.cutoff)
    }

    /// Blocks until every tracked token has been returned.
    pub fn wait_for_completion(&self) {
        let mut state = self.inner.state.lock();
        while !Self::complete(&state.outstanding, self.cutoff) {
            self.inner.returned.wait(&mut state);
        }
    }

    fn complete(outstanding: &BTreeSet<u64>, cutoff: u64) -> bool {
        outstanding.first().is_none_or(|&oldest| oldest >= cutoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_tracker_completes_when_tokens_return() {
        let manager = TokenManager::new();
        let token = manager.request_token().unwrap();
        let tracker = manager.start_tracker();
        assert!(!tracker.is_complete());

        drop(token);
        assert!(tracker.is_complete());
        tracker.wait_for_completion();
    }

    #[test]
    fn test_tracker_ignores_later_tokens() {
        let manager = TokenManager::new();
        let before = manager.request_token().unwrap();
        let tracker = manager.start_tracker();
        let after = manager.request_token().unwrap();

        drop(before);
        assert!(tracker.is_complete());
        drop(after);
    }

    #[test]
    fn test_empty_snapshot_is_complete() {
        let manager = TokenManager::new();
        let tracker = manager.start_tracker();
        assert!(tracker.is_complete());
    }

    #[test]
    fn test_wait_blocks_until_return() {
        let manager = TokenManager::new();
        let token = manager.request_token().unwrap();
        let tracker = manager.start_tracker();

        let dropper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            drop(token);
        });
        tracker.wait_for_completion();
        dropper.join().unwrap();
        assert_eq!(manager.outstanding_count(), 0);
    }

    #[test]
    fn test_shutdown_refuses_new_tokens() {
        let manager = TokenManager::new();
        manager.shutdown();
        assert!(matches!(manager.request_token(), Err(Error::ShutDown)));
    }

    #[test]
    fn test_shutdown_waits_for_drain() {
        let manager = TokenManager::new();
        let token = manager.request_token().unwrap();
        let other = manager.clone();
        let shutter = thread::spawn(move || other.shutdown());

        thread::sleep(Duration::from_millis(50));
        assert!(!shutter.is_finished());
        drop(token);
        shutter.join().unwrap();
    }
}
