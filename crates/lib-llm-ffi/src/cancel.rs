//! Cooperative cancellation.

use crossbeam::channel::{self, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Shared flag observed by a generation at every unit boundary.
///
/// Clones share the same flag. Cancelling never interrupts a native call in
/// progress by itself; the session additionally forwards the request to the
/// runtime's stop primitive when the library has one.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Cancel after `timeout` unless the returned deadline is disarmed or
    /// dropped first.
    pub fn cancel_after(&self, timeout: Duration) -> Deadline {
        let (disarm_tx, disarm_rx) = channel::bounded::<()>(0);
        let token = self.clone();
        let timer = thread::Builder::new()
            .name("llm-deadline".to_string())
            .spawn(move || {
                crossbeam::select! {
                    recv(disarm_rx) -> _ => {}
                    recv(channel::after(timeout)) -> _ => {
                        tracing::debug!(?timeout, "Deadline elapsed, cancelling");
                        token.cancel();
                    }
                }
            });
        match timer {
            Ok(timer) => Deadline {
                disarm: Some(disarm_tx),
                timer: Some(timer),
            },
            Err(e) => {
                // Without a timer thread the deadline cannot fire; fail safe.
                tracing::warn!(error = %e, "Could not start deadline timer, cancelling now");
                self.cancel();
                Deadline {
                    disarm: None,
                    timer: None,
                }
            }
        }
    }
}

/// A pending timeout created by [`CancelToken::cancel_after`].
#[derive(Debug)]
pub struct Deadline {
    disarm: Option<Sender<()>>,
    timer: Option<thread::JoinHandle<()>>,
}

impl Deadline {
    /// Stop the timer without cancelling.
    pub fn disarm(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        // Dropping the sender wakes the timer thread.
        self.disarm.take();
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_flag() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn test_deadline_fires() {
        let token = CancelToken::new();
        let _deadline = token.cancel_after(Duration::from_millis(10));
        let start = std::time::Instant::now();
        while !token.is_cancelled() && start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_disarmed_deadline_does_not_fire() {
        let token = CancelToken::new();
        let deadline = token.cancel_after(Duration::from_millis(50));
        deadline.disarm();
        thread::sleep(Duration::from_millis(100));
        assert!(!token.is_cancelled());
    }
}
