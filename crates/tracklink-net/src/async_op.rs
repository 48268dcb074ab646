//! Single-shot asynchronous operations.
//!
//! An [`AsyncOp`] wraps one unit of background work together with the state
//! machine that tracks it:
//!
//! ```text
//! WaitingForStart ──start()──→ Active ──work finishes──→ Completed
//!        │                       │                          │
//!        └───────────────────────┴──────dispose()───────────┴──→ Disposed
//! ```
//!
//! The work future is polled once inline by [`AsyncOp::start`]. If it is
//! already ready the operation completes before `start` returns and `start`
//! reports `false`; otherwise the future is spawned on the current tokio
//! runtime and `start` reports `true`.
//!
//! Completion subscribers are notified exactly once. The background task may
//! finish before `start` has returned, so delivery is decided by a single
//! atomic word: `start` sets an *armed* bit when it is done, completion sets
//! a *done* bit, and whichever side sees the other's bit already set performs
//! the delivery.
//!
//! There is no cancellation. Disposing an active operation only detaches it;
//! the background work still runs to completion and its outcome is dropped.
//!
//! ## Disposal policy
//!
//! Once disposed, [`AsyncOp::state`] keeps returning [`OpState::Disposed`]
//! and every other accessor fails with [`Misuse::Disposed`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::{Error, Misuse, Result};

/// Set by `start` once it no longer needs to look at the outcome.
const ARMED: u8 = 0b01;
/// Set by the completion path after the outcome is stored.
const DONE: u8 = 0b10;

/// Lifecycle state of an [`AsyncOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpState {
    /// Created, `start` not yet called.
    WaitingForStart,
    /// Work is running.
    Active,
    /// Work finished; the outcome is available.
    Completed,
    /// Terminal. Reachable from every other state.
    Disposed,
}

type Callback<T> = Box<dyn FnOnce(&AsyncOp<T>) + Send>;
type Work<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

enum Outcome<T> {
    Empty,
    Value(T),
    Failed(Arc<Error>),
    Taken,
}

struct Slot<T> {
    state: OpState,
    owner: Option<Arc<str>>,
    outcome: Outcome<T>,
    subscribers: Vec<Callback<T>>,
    delivered: bool,
}

struct Inner<T> {
    slot: Mutex<Slot<T>>,
    flags: AtomicU8,
    ready: Condvar,
    done: watch::Sender<bool>,
}

/// Handle to a single asynchronous operation producing a `T`.
///
/// Handles are cheap to clone; all clones observe the same operation.
pub struct AsyncOp<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for AsyncOp<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for AsyncOp<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.lock();
        f.debug_struct("AsyncOp")
            .field("state", &slot.state)
            .field("owner", &slot.owner)
            .field("delivered", &slot.delivered)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Default for AsyncOp<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> AsyncOp<T> {
    /// Creates an operation in the `WaitingForStart` state.
    #[must_use]
    pub fn new() -> Self {
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot {
                    state: OpState::WaitingForStart,
                    owner: None,
                    outcome: Outcome::Empty,
                    subscribers: Vec::new(),
                    delivered: false,
                }),
                flags: AtomicU8::new(0),
                ready: Condvar::new(),
                done,
            }),
        }
    }

    /// Starts the operation on behalf of `owner`.
    ///
    /// Returns `Ok(true)` if the work is still running when this returns and
    /// `Ok(false)` if it already completed inline. Either way subscribers are
    /// notified exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`Misuse::AlreadyStarted`] or [`Misuse::Disposed`] if the
    /// operation is not waiting for start, and [`Error::NoRuntime`] when
    /// called outside a tokio runtime.
    pub fn start<F>(&self, owner: impl Into<Arc<str>>, work: F) -> Result<bool>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let handle = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        {
            let mut slot = self.lock();
            match slot.state {
                OpState::WaitingForStart => {}
                OpState::Disposed => return Err(Misuse::Disposed.into()),
                OpState::Active | OpState::Completed => return Err(Misuse::AlreadyStarted.into()),
            }
            slot.state = OpState::Active;
            slot.owner = Some(owner.into());
        }

        let mut work: Work<T> = Box::pin(work);
        let mut cx = Context::from_waker(Waker::noop());
        match work.as_mut().poll(&mut cx) {
            Poll::Ready(outcome) => self.complete(outcome),
            Poll::Pending => {
                let op = self.clone();
                handle.spawn(async move {
                    let outcome = work.await;
                    op.complete(outcome);
                });
            }
        }

        let prev = self.inner.flags.fetch_or(ARMED, Ordering::AcqRel);
        if prev & DONE == 0 {
            Ok(true)
        } else {
            self.deliver();
            Ok(false)
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> OpState {
        self.lock().state
    }

    /// Returns true once the operation has completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state() == OpState::Completed
    }

    /// Returns the label of the session that started this operation.
    ///
    /// # Errors
    ///
    /// Returns [`Misuse::Disposed`] after disposal.
    pub fn owner(&self) -> Result<Option<Arc<str>>> {
        let slot = self.lock();
        if slot.state == OpState::Disposed {
            return Err(Misuse::Disposed.into());
        }
        Ok(slot.owner.clone())
    }

    /// Returns the captured failure, or `None` if the work succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`Misuse::NotCompleted`] before completion,
    /// [`Misuse::OutputTaken`] after [`take_output`](Self::take_output), and
    /// [`Misuse::Disposed`] after disposal.
    pub fn error(&self) -> Result<Option<Arc<Error>>> {
        let slot = self.lock();
        Self::check_completed(&slot)?;
        match &slot.outcome {
            Outcome::Failed(e) => Ok(Some(Arc::clone(e))),
            Outcome::Value(_) => Ok(None),
            Outcome::Taken => Err(Misuse::OutputTaken.into()),
            Outcome::Empty => Err(Misuse::NotCompleted(slot.state).into()),
        }
    }

    /// Moves the outcome out of the operation.
    ///
    /// A captured failure is returned as the original error unless a clone
    /// obtained through [`error`](Self::error) is still alive, in which case
    /// it is flattened into [`Error::Shared`].
    ///
    /// # Errors
    ///
    /// Returns the work's failure, or a usage fault under the same conditions
    /// as [`error`](Self::error).
    pub fn take_output(&self) -> Result<T> {
        let mut slot = self.lock();
        Self::check_completed(&slot)?;
        match std::mem::replace(&mut slot.outcome, Outcome::Taken) {
            Outcome::Value(value) => Ok(value),
            Outcome::Failed(e) => {
                Err(Arc::try_unwrap(e).unwrap_or_else(|shared| Error::Shared(shared.to_string())))
            }
            Outcome::Taken => Err(Misuse::OutputTaken.into()),
            Outcome::Empty => {
                slot.outcome = Outcome::Empty;
                Err(Misuse::NotCompleted(slot.state).into())
            }
        }
    }

    /// Registers a completion callback.
    ///
    /// If completion has already been delivered the callback runs immediately
    /// on the calling thread; otherwise it runs on whichever thread completes
    /// the operation.
    ///
    /// # Errors
    ///
    /// Returns [`Misuse::Disposed`] after disposal.
    pub fn on_completed<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(&Self) + Send + 'static,
    {
        {
            let mut slot = self.lock();
            if slot.state == OpState::Disposed {
                return Err(Misuse::Disposed.into());
            }
            if !slot.delivered {
                slot.subscribers.push(Box::new(callback));
                return Ok(());
            }
        }
        callback(self);
        Ok(())
    }

    /// Waits for completion without blocking the runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Misuse::NotCompleted`] if the operation was never started
    /// and [`Misuse::Disposed`] if it is disposed before or while waiting.
    pub async fn wait(&self) -> Result<()> {
        let mut done = self.inner.done.subscribe();
        self.check_waitable()?;
        done.wait_for(|done| *done)
            .await
            .map_err(|_| Error::from(Misuse::Disposed))?;
        self.check_finished()
    }

    /// Parks the calling OS thread until the operation completes.
    ///
    /// Must not be called from inside an async task.
    ///
    /// # Errors
    ///
    /// Same as [`wait`](Self::wait).
    pub fn wait_blocking(&self) -> Result<()> {
        self.check_waitable()?;
        let mut slot = self.lock();
        while !slot.delivered && slot.state != OpState::Disposed {
            slot = self
                .inner
                .ready
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(slot);
        self.check_finished()
    }

    /// Disposes the operation. Idempotent.
    ///
    /// Drops the stored outcome and pending subscribers and wakes every
    /// waiter. Background work is not interrupted.
    pub fn dispose(&self) {
        let subscribers = {
            let mut slot = self.lock();
            if slot.state == OpState::Disposed {
                return;
            }
            slot.state = OpState::Disposed;
            slot.owner = None;
            slot.outcome = Outcome::Empty;
            std::mem::take(&mut slot.subscribers)
        };
        drop(subscribers);
        self.inner.ready.notify_all();
        self.inner.done.send_replace(true);
    }

    fn complete(&self, outcome: Result<T>) {
        {
            let mut slot = self.lock();
            if slot.state != OpState::Active {
                tracing::trace!(state = ?slot.state, "discarding outcome of detached operation");
                return;
            }
            slot.state = OpState::Completed;
            slot.outcome = match outcome {
                Ok(value) => Outcome::Value(value),
                Err(e) => Outcome::Failed(Arc::new(e)),
            };
        }
        let prev = self.inner.flags.fetch_or(DONE, Ordering::AcqRel);
        if prev & ARMED != 0 {
            self.deliver();
        }
    }

    fn deliver(&self) {
        let subscribers = {
            let mut slot = self.lock();
            if slot.state != OpState::Completed || slot.delivered {
                return;
            }
            slot.delivered = true;
            std::mem::take(&mut slot.subscribers)
        };
        self.inner.ready.notify_all();
        self.inner.done.send_replace(true);
        for callback in subscribers {
            callback(self);
        }
    }

    fn check_waitable(&self) -> Result<()> {
        match self.state() {
            OpState::WaitingForStart => Err(Misuse::NotCompleted(OpState::WaitingForStart).into()),
            OpState::Disposed => Err(Misuse::Disposed.into()),
            OpState::Active | OpState::Completed => Ok(()),
        }
    }

    fn check_finished(&self) -> Result<()> {
        match self.state() {
            OpState::Completed => Ok(()),
            OpState::Disposed => Err(Misuse::Disposed.into()),
            state => Err(Misuse::NotCompleted(state).into()),
        }
    }

    fn check_completed(slot: &Slot<T>) -> Result<()> {
        match slot.state {
            OpState::Completed => Ok(()),
            OpState::Disposed => Err(Misuse::Disposed.into()),
            state => Err(Misuse::NotCompleted(state).into()),
        }
    }
}

impl<T> AsyncOp<T> {
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::needless_collect,
    clippy::similar_names
)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce(&AsyncOp<u32>) + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        (count, move |_: &AsyncOp<u32>| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_inline_completion_returns_false() {
        let op = AsyncOp::<u32>::new();
        let (count, cb) = counter();
        op.on_completed(cb).unwrap();

        let pending = op.start("test", async { Ok(7) }).unwrap();

        assert!(!pending);
        assert_eq!(op.state(), OpState::Completed);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(op.error().unwrap().is_none());
        assert_eq!(op.take_output().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_background_completion_returns_true() {
        let op = AsyncOp::<u32>::new();
        let (count, cb) = counter();
        op.on_completed(cb).unwrap();
        let (tx, rx) = oneshot::channel();

        let pending = op
            .start("test", async move { rx.await.map_err(|_| Error::ConnectionClosed) })
            .unwrap();

        assert!(pending);
        assert_eq!(op.state(), OpState::Active);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tx.send(3).unwrap();
        op.wait().await.unwrap();

        assert_eq!(op.state(), OpState::Completed);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(op.take_output().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_state_sequence_is_monotonic() {
        let op = AsyncOp::<u32>::new();
        let mut seen = vec![op.state()];
        let (tx, rx) = oneshot::channel::<u32>();

        op.start("test", async move { rx.await.map_err(|_| Error::ConnectionClosed) })
            .unwrap();
        seen.push(op.state());
        tx.send(1).unwrap();
        op.wait().await.unwrap();
        seen.push(op.state());
        op.dispose();
        seen.push(op.state());

        assert_eq!(
            seen,
            vec![
                OpState::WaitingForStart,
                OpState::Active,
                OpState::Completed,
                OpState::Disposed
            ]
        );
        let err = op.start("again", async { Ok(1) }).unwrap_err();
        assert_eq!(err.misuse(), Some(Misuse::Disposed));
        assert_eq!(op.state(), OpState::Disposed);
    }

    #[tokio::test]
    async fn test_start_twice_is_misuse() {
        let op = AsyncOp::<u32>::new();
        op.start("test", async { Ok(1) }).unwrap();
        let err = op.start("test", async { Ok(2) }).unwrap_err();
        assert_eq!(err.misuse(), Some(Misuse::AlreadyStarted));
        assert_eq!(op.take_output().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_error_before_completion_is_misuse() {
        let op = AsyncOp::<u32>::new();
        assert_eq!(
            op.error().unwrap_err().misuse(),
            Some(Misuse::NotCompleted(OpState::WaitingForStart))
        );

        let (_tx, rx) = oneshot::channel::<u32>();
        op.start("test", async move { rx.await.map_err(|_| Error::ConnectionClosed) })
            .unwrap();
        assert_eq!(
            op.error().unwrap_err().misuse(),
            Some(Misuse::NotCompleted(OpState::Active))
        );
    }

    #[tokio::test]
    async fn test_failure_is_captured() {
        let op = AsyncOp::<u32>::new();
        op.start("test", async { Err(Error::ConnectionClosed) })
            .unwrap();

        let err = op.error().unwrap().unwrap();
        assert!(matches!(*err, Error::ConnectionClosed));
        drop(err);

        assert!(matches!(op.take_output(), Err(Error::ConnectionClosed)));
        assert_eq!(
            op.error().unwrap_err().misuse(),
            Some(Misuse::OutputTaken)
        );
    }

    #[tokio::test]
    async fn test_shared_failure_is_flattened() {
        let op = AsyncOp::<u32>::new();
        op.start("test", async { Err(Error::ConnectionClosed) })
            .unwrap();
        let held = op.error().unwrap();
        assert!(matches!(op.take_output(), Err(Error::Shared(_))));
        assert!(held.is_some());
    }

    #[tokio::test]
    async fn test_late_subscriber_runs_immediately() {
        let op = AsyncOp::<u32>::new();
        op.start("test", async { Ok(1) }).unwrap();
        let (count, cb) = counter();
        op.on_completed(cb).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_consistent() {
        let op = AsyncOp::<u32>::new();
        op.start("owner-1", async { Ok(1) }).unwrap();
        assert_eq!(op.owner().unwrap().as_deref(), Some("owner-1"));

        op.dispose();
        op.dispose();

        assert_eq!(op.state(), OpState::Disposed);
        assert_eq!(op.error().unwrap_err().misuse(), Some(Misuse::Disposed));
        assert_eq!(op.take_output().unwrap_err().misuse(), Some(Misuse::Disposed));
        assert_eq!(op.owner().unwrap_err().misuse(), Some(Misuse::Disposed));
        assert_eq!(
            op.on_completed(|_| {}).unwrap_err().misuse(),
            Some(Misuse::Disposed)
        );
        assert_eq!(op.wait().await.unwrap_err().misuse(), Some(Misuse::Disposed));
    }

    #[tokio::test]
    async fn test_dispose_while_active_discards_outcome() {
        let op = AsyncOp::<u32>::new();
        let (count, cb) = counter();
        op.on_completed(cb).unwrap();
        let (tx, rx) = oneshot::channel();
        let (finished_tx, finished_rx) = oneshot::channel();

        op.start("test", async move {
            let value = rx.await.map_err(|_| Error::ConnectionClosed);
            let _ = finished_tx.send(());
            value
        })
        .unwrap();

        let waiter = {
            let op = op.clone();
            tokio::spawn(async move { op.wait().await })
        };
        tokio::task::yield_now().await;
        op.dispose();
        tx.send(9).unwrap();
        finished_rx.await.unwrap();
        tokio::task::yield_now().await;

        assert_eq!(op.state(), OpState::Disposed);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        let waited = waiter.await.unwrap();
        assert_eq!(waited.unwrap_err().misuse(), Some(Misuse::Disposed));
    }

    #[tokio::test]
    async fn test_wait_before_start_is_misuse() {
        let op = AsyncOp::<u32>::new();
        assert_eq!(
            op.wait().await.unwrap_err().misuse(),
            Some(Misuse::NotCompleted(OpState::WaitingForStart))
        );
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let op = AsyncOp::<u32>::new();
        assert!(matches!(
            op.start("test", async { Ok(1) }),
            Err(Error::NoRuntime)
        ));
        assert_eq!(op.state(), OpState::WaitingForStart);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_completion_delivers_once() {
        for round in 0..500u32 {
            let op = AsyncOp::<u32>::new();
            let (count, cb) = counter();
            op.on_completed(cb).unwrap();

            // The work hops to another worker, so completion races `start`.
            op.start("race", async move {
                tokio::task::yield_now().await;
                Ok(round)
            })
            .unwrap();

            op.wait().await.unwrap();
            // Delivery may still be finishing on the other thread.
            for _ in 0..100 {
                if count.load(Ordering::SeqCst) == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            assert_eq!(count.load(Ordering::SeqCst), 1, "round {round}");
            assert_eq!(op.take_output().unwrap(), round);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wait_blocking_from_plain_thread() {
        let op = AsyncOp::<u32>::new();
        let (tx, rx) = oneshot::channel();
        op.start("test", async move { rx.await.map_err(|_| Error::ConnectionClosed) })
            .unwrap();

        let blocked = {
            let op = op.clone();
            std::thread::spawn(move || op.wait_blocking().map(|()| op.take_output()))
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(42).unwrap();

        let output = tokio::task::spawn_blocking(move || blocked.join().unwrap())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(output, 42);
    }
}
