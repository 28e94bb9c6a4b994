//! A cancellation broadcast channel.
//!
//! An [`AbortSource`] lets one part of a program request that fibers
//! observing it stop what they are doing. Observers either poll
//! [`AbortSource::abort_requested`] at convenient points, or register a
//! [`Subscription`] to be woken when the abort fires. An abort may carry an
//! error explaining *why* the work was cancelled; observers that fail a
//! pending operation propagate that error as the cause.
//!
//! The first abort request wins: the source latches its reason and later
//! requests are no-ops. Delivery to each subscription is at-most-once, and a
//! dropped [`Subscription`] is never delivered to.
use crate::util::fmt;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::error::Error;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};

/// A broadcast channel over which one abort request may be sent to any
/// number of [`Subscription`]s.
///
/// The source's state is shared: moving an `AbortSource` does not invalidate
/// subscriptions taken from it.
pub struct AbortSource {
    inner: Rc<Inner>,
}

/// An [`AbortSource`] observer registration.
///
/// Resolves (via [`poll_aborted`](Self::poll_aborted), or by awaiting it as
/// a [`Future`]) once the source's abort is requested, yielding the carried
/// reason if the abort had one. Dropping the subscription unregisters it.
pub struct Subscription {
    inner: Rc<Inner>,
    id: u64,
}

/// The generic abort-requested marker error.
///
/// Returned by [`AbortSource::check`] when the abort carried no reason of
/// its own.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct AbortRequested(());

struct Inner {
    aborted: Cell<bool>,
    reason: RefCell<Option<Rc<dyn Error + 'static>>>,
    subscribers: RefCell<Vec<Subscriber>>,
    next_id: Cell<u64>,
}

struct Subscriber {
    id: u64,
    waker: Option<Waker>,
}

// === impl AbortSource ===

impl AbortSource {
    /// Returns a new `AbortSource` with no abort requested.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(Inner {
                aborted: Cell::new(false),
                reason: RefCell::new(None),
                subscribers: RefCell::new(Vec::new()),
                next_id: Cell::new(0),
            }),
        }
    }

    /// Registers an observer to be woken when the abort is requested.
    ///
    /// Returns [`None`] if the abort was already requested; the caller has
    /// observed the abort synchronously and there is nothing left to wait
    /// for.
    #[must_use]
    pub fn subscribe(&self) -> Option<Subscription> {
        if self.inner.aborted.get() {
            return None;
        }
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        self.inner
            .subscribers
            .borrow_mut()
            .push(Subscriber { id, waker: None });
        trace!(id, "AbortSource::subscribe");
        Some(Subscription {
            inner: self.inner.clone(),
            id,
        })
    }

    /// Requests an abort, waking every registered subscription.
    ///
    /// Only the first request has any effect.
    pub fn request_abort(&self) {
        self.request_abort_inner(None);
    }

    /// Requests an abort carrying `reason`, waking every registered
    /// subscription.
    ///
    /// Observers that fail a pending operation on behalf of this abort
    /// propagate `reason` as the failure's cause. Only the first request has
    /// any effect; a reason supplied by a later request is discarded.
    pub fn request_abort_with(&self, reason: impl Error + 'static) {
        self.request_abort_inner(Some(Rc::new(reason)));
    }

    fn request_abort_inner(&self, reason: Option<Rc<dyn Error + 'static>>) {
        if self.inner.aborted.get() {
            return;
        }
        self.inner.aborted.set(true);
        *self.inner.reason.borrow_mut() = reason;
        // take the subscriber list before waking: a woken task may run
        // inline and re-borrow it.
        let subscribers = core::mem::take(&mut *self.inner.subscribers.borrow_mut());
        trace!(subscribers = subscribers.len(), "AbortSource::request_abort");
        for subscriber in subscribers {
            if let Some(waker) = subscriber.waker {
                waker.wake();
            }
        }
    }

    /// Returns `true` if an abort has been requested.
    #[must_use]
    pub fn abort_requested(&self) -> bool {
        self.inner.aborted.get()
    }

    /// Returns the reason carried by the abort request, if an abort was
    /// requested with one.
    #[must_use]
    pub fn reason(&self) -> Option<Rc<dyn Error + 'static>> {
        self.inner.reason.borrow().clone()
    }

    /// Returns an error if an abort has been requested.
    ///
    /// The error is the carried reason if the abort had one, and the generic
    /// [`AbortRequested`] marker otherwise. Useful as a cancellation point
    /// in a fiber that polls for aborts between steps.
    pub fn check(&self) -> Result<(), Rc<dyn Error + 'static>> {
        if !self.inner.aborted.get() {
            return Ok(());
        }
        Err(self
            .reason()
            .unwrap_or_else(|| Rc::new(AbortRequested(()))))
    }
}

impl Default for AbortSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AbortSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSource")
            .field("aborted", &self.inner.aborted.get())
            .field("subscribers", &self.inner.subscribers.borrow().len())
            .finish()
    }
}

// === impl Subscription ===

impl Subscription {
    /// Completes once the source's abort is requested, yielding the carried
    /// reason if any.
    ///
    /// Until then, the current task's waker is registered to be woken by the
    /// abort.
    pub fn poll_aborted(&mut self, cx: &mut Context<'_>) -> Poll<Option<Rc<dyn Error + 'static>>> {
        if self.inner.aborted.get() {
            return Poll::Ready(self.inner.reason.borrow().clone());
        }
        let mut subscribers = self.inner.subscribers.borrow_mut();
        if let Some(subscriber) = subscribers.iter_mut().find(|s| s.id == self.id) {
            match &subscriber.waker {
                Some(waker) if waker.will_wake(cx.waker()) => {}
                _ => subscriber.waker = Some(cx.waker().clone()),
            }
        } else {
            debug_assert!(false, "live subscription missing from its source");
        }
        Poll::Pending
    }
}

impl Future for Subscription {
    type Output = Option<Rc<dyn Error + 'static>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().poll_aborted(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner
            .subscribers
            .borrow_mut()
            .retain(|s| s.id != self.id);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

// === impl AbortRequested ===

impl fmt::Display for AbortRequested {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("abort requested")
    }
}

impl Error for AbortRequested {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test::{self, poll_once};
    use alloc::string::ToString;
    use futures::pin_mut;

    #[derive(Debug)]
    struct Expected;

    impl fmt::Display for Expected {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.pad("expected")
        }
    }

    impl Error for Expected {}

    #[test]
    fn notifies_subscriber() {
        let _trace = test::trace_init();
        let source = AbortSource::new();
        let sub = source.subscribe().expect("not yet aborted");
        pin_mut!(sub);
        assert!(poll_once(sub.as_mut()).is_pending());

        source.request_abort();
        assert!(source.abort_requested());
        match poll_once(sub.as_mut()) {
            Poll::Ready(None) => {}
            other => panic!("expected plain abort, got {other:?}"),
        }
        assert!(source.check().is_err());
    }

    #[test]
    fn dropped_subscription_is_unregistered() {
        let _trace = test::trace_init();
        let source = AbortSource::new();
        let sub = source.subscribe().expect("not yet aborted");
        drop(sub);
        assert_eq!(source.inner.subscribers.borrow().len(), 0);
        source.request_abort();
    }

    #[test]
    fn rejects_subscription_after_abort() {
        let _trace = test::trace_init();
        let source = AbortSource::new();
        source.request_abort();
        assert!(source.subscribe().is_none());
    }

    #[test]
    fn carries_reason() {
        let _trace = test::trace_init();
        let source = AbortSource::new();
        let sub = source.subscribe().expect("not yet aborted");
        pin_mut!(sub);
        assert!(poll_once(sub.as_mut()).is_pending());

        source.request_abort_with(Expected);
        match poll_once(sub.as_mut()) {
            Poll::Ready(Some(reason)) => assert_eq!(reason.to_string(), "expected"),
            other => panic!("expected carried reason, got {other:?}"),
        }
        assert_eq!(source.check().unwrap_err().to_string(), "expected");
    }

    #[test]
    fn first_request_wins() {
        let _trace = test::trace_init();
        let source = AbortSource::new();
        source.request_abort_with(Expected);
        source.request_abort();
        assert_eq!(source.check().unwrap_err().to_string(), "expected");
    }

    #[test]
    fn subscriptions_survive_source_moves() {
        let _trace = test::trace_init();
        let source = AbortSource::new();
        let sub = source.subscribe().expect("not yet aborted");
        pin_mut!(sub);
        assert!(poll_once(sub.as_mut()).is_pending());

        let moved = source;
        moved.request_abort();
        assert!(poll_once(sub.as_mut()).is_ready());
    }

    #[test]
    fn check_without_reason_is_the_marker() {
        let source = AbortSource::new();
        assert!(source.check().is_ok());
        source.request_abort();
        assert_eq!(source.check().unwrap_err().to_string(), "abort requested");
    }
}
