//! Cancellable background work owned by asynchronous stages.

use std::io;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Cooperative cancellation flag that background loops poll or sleep on.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake up every sleeper.
    pub fn cancel(&self) {
        let (flag, cond) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for `timeout` unless cancelled first.
    ///
    /// Returns `true` when the token was cancelled.
    pub fn sleep(&self, timeout: Duration) -> bool {
        let (flag, cond) = &*self.inner;
        // A timeout past the end of the clock means waiting for cancellation only.
        let deadline = Instant::now().checked_add(timeout);
        let mut cancelled = flag.lock().unwrap_or_else(PoisonError::into_inner);
        while !*cancelled {
            let Some(deadline) = deadline else {
                cancelled = cond.wait(cancelled).unwrap_or_else(PoisonError::into_inner);
                continue;
            };
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            cancelled = cond
                .wait_timeout(cancelled, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *cancelled
    }
}

/// A named background thread paired with its [`CancelToken`].
///
/// Cancelling does not join: the thread is expected to notice the token and return on
/// its own. Dropping the task cancels it.
pub struct BackgroundTask {
    token: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    /// Spawn `body` on a new thread named `name`.
    pub fn spawn<F>(name: &str, body: F) -> io::Result<Self>
    where
        F: FnOnce(CancelToken) + Send + 'static,
    {
        let token = CancelToken::new();
        let thread_token = token.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(thread_token))?;
        Ok(Self {
            token,
            handle: Some(handle),
        })
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_sleep_times_out_when_not_cancelled() {
        let token = CancelToken::new();
        assert!(!token.sleep(Duration::from_millis(5)));
    }

    #[test]
    fn test_unbounded_sleep_ends_on_cancel() {
        let token = CancelToken::new();
        let sleeper = token.clone();
        let handle = thread::spawn(move || sleeper.sleep(Duration::MAX));
        thread::sleep(Duration::from_millis(10));
        token.cancel();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_cancel_wakes_background_loop() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let task = BackgroundTask::spawn("ticker", move |token| {
            while !token.sleep(Duration::from_millis(1)) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        task.cancel();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !task.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(task.is_finished());
        assert!(task.token().is_cancelled());
    }
}
