//! Cooperative cancellation signal.
//!
//! A [`CancellationSignal`] is a one-way flag. Callbacks registered before the
//! signal is requested run exactly once, on the thread that requests it;
//! callbacks registered afterwards run immediately on the registering thread.
//! Dropping a [`CancellationRegistration`] unregisters its callback.

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use core_runtime::logging::log_exception;
use futures::task::AtomicWaker;

use crate::error::panic_message;

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Callbacks {
    next_id: u64,
    registered: Vec<(u64, Callback)>,
}

#[derive(Default)]
struct SignalInner {
    requested: AtomicBool,
    callbacks: Mutex<Callbacks>,
    /// Keeps a child signal linked to its parent.
    parent: Mutex<Option<CancellationRegistration>>,
}

impl SignalInner {
    fn callbacks(&self) -> MutexGuard<'_, Callbacks> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A cooperative, one-way cancellation request shared by every clone.
#[derive(Clone, Default)]
pub struct CancellationSignal {
    inner: Arc<SignalInner>,
}

impl fmt::Debug for CancellationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationSignal")
            .field("requested", &self.is_requested())
            .finish()
    }
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` once cancellation has been requested.
    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::Acquire)
    }

    /// Requests cancellation and runs every registered callback in
    /// registration order.
    ///
    /// Returns `false` if cancellation had already been requested, in which
    /// case nothing runs.
    pub fn cancel(&self) -> bool {
        let registered = {
            let mut callbacks = self.inner.callbacks();
            if self.inner.requested.swap(true, Ordering::AcqRel) {
                return false;
            }
            std::mem::take(&mut callbacks.registered)
        };

        tracing::trace!(callbacks = registered.len(), "cancellation requested");
        for (_, callback) in registered {
            run_callback(callback);
        }
        true
    }

    /// Registers `callback` to run when cancellation is requested.
    ///
    /// If it already was, the callback runs before this returns and `None` is
    /// returned.
    #[must_use = "dropping the registration unregisters the callback"]
    pub fn register<F>(&self, callback: F) -> Option<CancellationRegistration>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut callbacks = self.inner.callbacks();
            if !self.inner.requested.load(Ordering::Acquire) {
                let id = callbacks.next_id;
                callbacks.next_id += 1;
                callbacks.registered.push((id, Box::new(callback)));
                return Some(CancellationRegistration {
                    signal: Arc::downgrade(&self.inner),
                    id,
                });
            }
        }
        run_callback(Box::new(callback));
        None
    }

    /// Waits until cancellation is requested.
    pub fn cancelled(&self) -> Cancelled {
        Cancelled {
            signal: self.clone(),
            waker: Arc::new(AtomicWaker::new()),
            registration: None,
        }
    }

    /// Creates a signal that is requested whenever this one is, and can also
    /// be requested on its own without affecting this one.
    pub fn child(&self) -> CancellationSignal {
        let child = CancellationSignal::new();
        let weak_child = Arc::downgrade(&child.inner);
        let link = self.register(move || {
            if let Some(inner) = weak_child.upgrade() {
                CancellationSignal { inner }.cancel();
            }
        });
        *child
            .inner
            .parent
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = link;
        child
    }

    /// Number of callbacks still waiting for cancellation.
    pub fn registered_callbacks(&self) -> usize {
        self.inner.callbacks().registered.len()
    }
}

fn run_callback(callback: Callback) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
        log_exception(&anyhow::anyhow!(
            "cancellation callback panicked: {}",
            panic_message(payload.as_ref())
        ));
    }
}

/// A callback registered on a [`CancellationSignal`].
///
/// Dropping it unregisters the callback if it has not run yet.
pub struct CancellationRegistration {
    signal: Weak<SignalInner>,
    id: u64,
}

impl CancellationRegistration {
    /// Unregisters the callback.
    ///
    /// Returns `true` if the callback was still registered and is now
    /// guaranteed never to run, `false` if it already ran or is running.
    pub fn unregister(self) -> bool {
        self.remove()
    }

    fn remove(&self) -> bool {
        let Some(inner) = self.signal.upgrade() else {
            return false;
        };
        let removed = {
            let mut callbacks = inner.callbacks();
            callbacks
                .registered
                .iter()
                .position(|(id, _)| *id == self.id)
                .map(|index| callbacks.registered.remove(index))
        };
        // The callback is dropped outside the lock.
        removed.is_some()
    }
}

impl Drop for CancellationRegistration {
    fn drop(&mut self) {
        self.remove();
    }
}

impl fmt::Debug for CancellationRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationRegistration")
            .field("id", &self.id)
            .finish()
    }
}

/// Future returned by [`CancellationSignal::cancelled`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Cancelled {
    signal: CancellationSignal,
    waker: Arc<AtomicWaker>,
    registration: Option<CancellationRegistration>,
}

impl Future for Cancelled {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.signal.is_requested() {
            return Poll::Ready(());
        }

        this.waker.register(cx.waker());
        if this.registration.is_none() {
            let waker = Arc::clone(&this.waker);
            this.registration = this.signal.register(move || waker.wake());
        }

        if this.signal.is_requested() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = count.clone();
        (count, move || {
            handle.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_cancel_runs_callbacks_once() {
        let signal = CancellationSignal::new();
        let (count, callback) = counter();
        let _registration = signal.register(callback);

        assert!(!signal.is_requested());
        assert!(signal.cancel());
        assert!(!signal.cancel());

        assert!(signal.is_requested());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(signal.registered_callbacks(), 0);
    }

    #[test]
    fn test_register_after_cancel_runs_inline() {
        let signal = CancellationSignal::new();
        signal.cancel();

        let (count, callback) = counter();
        let registration = signal.register(callback);

        assert!(registration.is_none());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregister_prevents_callback() {
        let signal = CancellationSignal::new();
        let (count, callback) = counter();
        let registration = signal.register(callback).unwrap();

        assert!(registration.unregister());
        signal.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drop_unregisters() {
        let signal = CancellationSignal::new();
        let (count, callback) = counter();
        drop(signal.register(callback));

        assert_eq!(signal.registered_callbacks(), 0);
        signal.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unregister_after_cancel_reports_false() {
        let signal = CancellationSignal::new();
        let (_count, callback) = counter();
        let registration = signal.register(callback).unwrap();
        signal.cancel();
        assert!(!registration.unregister());
    }

    #[test]
    fn test_callbacks_run_in_registration_order() {
        let signal = CancellationSignal::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let registrations: Vec<_> = (0..3)
            .map(|i| {
                let order = order.clone();
                signal.register(move || order.lock().unwrap().push(i))
            })
            .collect();

        signal.cancel();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        drop(registrations);
    }

    #[test]
    fn test_panicking_callback_does_not_stop_others() {
        let signal = CancellationSignal::new();
        let _bad = signal.register(|| panic!("callback failure"));
        let (count, callback) = counter();
        let _good = signal.register(callback);

        assert!(signal.cancel());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_child_follows_parent() {
        let parent = CancellationSignal::new();
        let child = parent.child();

        assert!(!child.is_requested());
        parent.cancel();
        assert!(child.is_requested());
    }

    #[test]
    fn test_child_cancel_leaves_parent() {
        let parent = CancellationSignal::new();
        let child = parent.child();

        child.cancel();
        assert!(child.is_requested());
        assert!(!parent.is_requested());
    }

    #[test]
    fn test_dropped_child_unlinks() {
        let parent = CancellationSignal::new();
        let child = parent.child();
        assert_eq!(parent.registered_callbacks(), 1);

        drop(child);
        assert_eq!(parent.registered_callbacks(), 0);
    }

    #[test]
    fn test_cancelled_future_wakes() {
        let signal = CancellationSignal::new();
        let remote = signal.clone();

        let canceller = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            remote.cancel();
        });

        futures::executor::block_on(signal.cancelled());
        assert!(signal.is_requested());
        canceller.join().unwrap();
    }
}
