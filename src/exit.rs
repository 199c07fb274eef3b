//! Child-exit notification
//!
//! Each connection owns one background watcher whose only job is to observe
//! child exit and complete the notifier. Callers consume the result through
//! `wait_for_exit` (condvar with caller-side timeout) or `subscribe_exit`
//! (one-shot channel). Disposal suppresses the event if it has not fired.

use std::fmt;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// How the child terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// The process exited normally with the given exit code
    Exited(i32),
    /// The process was terminated by a signal (Unix only)
    #[cfg(unix)]
    Signaled(i32),
}

impl ExitStatus {
    /// Check if the process exited successfully (exit code 0)
    pub const fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Get the exit code, if the process exited normally
    pub const fn code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            #[cfg(unix)]
            Self::Signaled(_) => None,
        }
    }

    /// Get the signal that terminated the process (Unix only)
    #[cfg(unix)]
    pub const fn signal(&self) -> Option<i32> {
        match self {
            Self::Signaled(sig) => Some(*sig),
            _ => None,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {code}"),
            #[cfg(unix)]
            Self::Signaled(sig) => write!(f, "terminated by signal {sig}"),
        }
    }
}

/// Lock a mutex, recovering the guard if a panicking thread poisoned it.
/// The notifier state stays consistent across every unlock point.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct NotifierState {
    status: Option<ExitStatus>,
    /// The watcher finished, with or without a status (ECHILD leaves none)
    ended: bool,
    disposed: bool,
    subscribers: Vec<mpsc::Sender<ExitStatus>>,
}

/// One-shot completion primitive connecting the exit watcher to callers
pub(crate) struct ExitNotifier {
    state: Mutex<NotifierState>,
    cond: Condvar,
}

impl ExitNotifier {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(NotifierState {
                status: None,
                ended: false,
                disposed: false,
                subscribers: Vec::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Fire the exit event. At most the first call has any effect, and a
    /// disposed notifier ignores the call entirely.
    pub fn notify_exit(&self, status: ExitStatus) {
        let mut state = lock(&self.state);
        if state.disposed || state.status.is_some() {
            return;
        }
        state.status = Some(status);
        state.ended = true;
        for tx in state.subscribers.drain(..) {
            let _ = tx.send(status);
        }
        self.cond.notify_all();
    }

    /// Record that the watcher finished without reaping the child
    pub fn notify_ended(&self) {
        let mut state = lock(&self.state);
        state.ended = true;
        self.cond.notify_all();
    }

    /// Suppress the event and drop all subscribers. Called first during
    /// connection disposal.
    pub fn mark_disposed(&self) {
        let mut state = lock(&self.state);
        state.disposed = true;
        state.subscribers.clear();
        self.cond.notify_all();
    }

    pub fn status(&self) -> Option<ExitStatus> {
        lock(&self.state).status
    }

    pub fn has_ended(&self) -> bool {
        lock(&self.state).ended
    }

    pub fn is_disposed(&self) -> bool {
        lock(&self.state).disposed
    }

    /// Block until the event fires, the watcher gives up, or the timeout
    /// elapses. `None` waits indefinitely. Returns whether a status is
    /// available.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut state = lock(&self.state);
        match timeout {
            None => {
                while state.status.is_none() && !state.ended {
                    state = self
                        .cond
                        .wait(state)
                        .unwrap_or_else(|e| e.into_inner());
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while state.status.is_none() && !state.ended {
                    let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero()) else {
                        break;
                    };
                    state = self
                        .cond
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(|e| e.into_inner())
                        .0;
                }
            }
        }
        state.status.is_some()
    }

    /// Subscribe to the one-shot exit event. A subscription after the event
    /// fired still observes the cached status; a subscription after disposal
    /// observes a closed channel.
    pub fn subscribe(&self) -> Receiver<ExitStatus> {
        let (tx, rx) = mpsc::channel();
        let mut state = lock(&self.state);
        if state.disposed {
            return rx;
        }
        if let Some(status) = state.status {
            let _ = tx.send(status);
            return rx;
        }
        state.subscribers.push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_exit_status_accessors() {
        assert!(ExitStatus::Exited(0).success());
        assert!(!ExitStatus::Exited(1).success());
        assert_eq!(ExitStatus::Exited(3).code(), Some(3));
        #[cfg(unix)]
        {
            assert_eq!(ExitStatus::Signaled(9).code(), None);
            assert_eq!(ExitStatus::Signaled(9).signal(), Some(9));
        }
    }

    #[test]
    fn test_notify_fires_once() {
        let notifier = ExitNotifier::new();
        let rx = notifier.subscribe();
        notifier.notify_exit(ExitStatus::Exited(0));
        notifier.notify_exit(ExitStatus::Exited(7));
        assert_eq!(rx.recv().unwrap(), ExitStatus::Exited(0));
        assert!(rx.try_recv().is_err());
        assert_eq!(notifier.status(), Some(ExitStatus::Exited(0)));
    }

    #[test]
    fn test_subscribe_after_fire_sees_status() {
        let notifier = ExitNotifier::new();
        notifier.notify_exit(ExitStatus::Exited(2));
        let rx = notifier.subscribe();
        assert_eq!(rx.recv().unwrap(), ExitStatus::Exited(2));
    }

    #[test]
    fn test_disposal_suppresses_event() {
        let notifier = ExitNotifier::new();
        let rx = notifier.subscribe();
        notifier.mark_disposed();
        notifier.notify_exit(ExitStatus::Exited(0));
        assert!(rx.recv().is_err());
        assert_eq!(notifier.status(), None);
    }

    #[test]
    fn test_wait_timeout_expires() {
        let notifier = ExitNotifier::new();
        assert!(!notifier.wait(Some(Duration::from_millis(20))));
    }

    #[test]
    fn test_wait_returns_false_when_watcher_gives_up() {
        let notifier = ExitNotifier::new();
        notifier.notify_ended();
        assert!(!notifier.wait(None));
        assert!(!notifier.wait(Some(Duration::from_secs(5))));
    }

    #[test]
    fn test_wait_observes_cross_thread_notify() {
        let notifier = Arc::new(ExitNotifier::new());
        let remote = Arc::clone(&notifier);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.notify_exit(ExitStatus::Exited(0));
        });
        assert!(notifier.wait(Some(Duration::from_secs(5))));
        handle.join().unwrap();
    }
}
