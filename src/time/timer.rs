//! A one-shot timeout service for a single-threaded cooperative runtime.
//!
//! The [`Timer`] tracks pending [`Sleep`] futures on an intrusive list. The
//! runtime's event loop is responsible for driving it: call
//! [`Timer::turn`] whenever time may have advanced (e.g. on each loop
//! iteration, or after the deadline returned by [`Timer::next_deadline`]),
//! and every `Sleep` whose deadline has passed is completed and its task
//! woken.
//!
//! Sleep storage lives inside the `Sleep` future itself, so arming a timeout
//! never allocates, and dropping the future is cancellation.
use super::{Clock, Duration, Instant};
use crate::util::{fmt, WakeBatch};
use cordyceps::{
    list::{self, List},
    Linked,
};
use core::cell::{Cell, RefCell};
use core::future::Future;
use core::marker::PhantomPinned;
use core::pin::Pin;
use core::ptr::{self, NonNull};
use core::task::{Context, Poll, Waker};
use pin_project::{pin_project, pinned_drop};

/// A service that completes [`Sleep`] futures when their deadlines pass.
///
/// A `Timer` does nothing on its own: something must [turn](Self::turn) it.
/// In an event-loop runtime this is typically done once per loop iteration,
/// sleeping the underlying OS primitive until the
/// [`next_deadline`](Self::next_deadline) when idle. Tests drive it manually.
pub struct Timer {
    clock: Clock,
    entries: RefCell<List<Entry>>,
    pending: Cell<usize>,
}

/// A [`Future`] that completes when a [`Timer`] reaches its deadline.
///
/// Returned by [`Timer::sleep`] and [`Timer::sleep_until`]. Dropping a
/// `Sleep` before it completes cancels the timeout.
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Sleep<'timer> {
    timer: &'timer Timer,
    #[pin]
    entry: Entry,
}

struct Entry {
    /// Intrusive linked list pointers.
    ///
    /// # Safety
    ///
    /// The entry may only be linked into the list of the [`Timer`] borrowed
    /// by its owning [`Sleep`], and is only mutated through that list while
    /// its `RefCell` is borrowed.
    links: list::Links<Entry>,
    deadline: Instant,
    waker: RefCell<Option<Waker>>,
    state: Cell<EntryState>,

    // This type is !Unpin due to the heuristic from:
    // <https://github.com/rust-lang/rust/pull/82834>
    _pin: PhantomPinned,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum EntryState {
    /// Not yet linked into a timer's list.
    Unregistered,
    /// Linked into the timer's list, waiting to fire.
    Registered,
    /// Fired (or found to be past due); unlinked.
    Fired,
}

// === impl Timer ===

impl Timer {
    /// Returns a new `Timer` driven by the given [`Clock`].
    #[must_use]
    pub const fn new(clock: Clock) -> Self {
        Self {
            clock,
            entries: RefCell::new(List::new()),
            pending: Cell::new(0),
        }
    }

    /// Borrows the [`Clock`] definition this timer was constructed with.
    #[must_use]
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Returns the current time according to this timer's [`Clock`].
    #[must_use]
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Returns a [`Sleep`] future completing `duration` from now.
    ///
    /// If `now + duration` is not representable, the sleep never completes.
    pub fn sleep(&self, duration: Duration) -> Sleep<'_> {
        let deadline = self.now().checked_add(duration).unwrap_or(Instant::MAX);
        self.sleep_until(deadline)
    }

    /// Returns a [`Sleep`] future completing once this timer has been
    /// [turned](Self::turn) at or past `deadline`.
    ///
    /// A deadline that has already passed completes on first poll. A deadline
    /// of [`Instant::MAX`] never completes.
    pub fn sleep_until(&self, deadline: Instant) -> Sleep<'_> {
        Sleep {
            timer: self,
            entry: Entry {
                links: list::Links::new(),
                deadline,
                waker: RefCell::new(None),
                state: Cell::new(EntryState::Unregistered),
                _pin: PhantomPinned,
            },
        }
    }

    /// Fires every pending sleep whose deadline is at or before the current
    /// time, waking the tasks that await them.
    ///
    /// Returns the number of sleeps fired.
    pub fn turn(&self) -> usize {
        let mut fired = 0;
        loop {
            let now = self.now();
            let mut batch = WakeBatch::new();
            let mut more = false;
            {
                let mut entries = self.entries.borrow_mut();
                // Pop every entry; due ones fire, the rest collect on a
                // scratch list that is spliced back before the borrow is
                // released, so the list is always consistent when wakers run.
                let mut not_due = List::<Entry>::new();
                while let Some(ptr) = entries.pop_front() {
                    let entry = unsafe { ptr.as_ref() };
                    if entry.deadline > now {
                        not_due.push_back(ptr);
                        continue;
                    }
                    entry.state.set(EntryState::Fired);
                    self.pending.set(self.pending.get() - 1);
                    fired += 1;
                    let waker = entry.waker.borrow_mut().take();
                    if let Some(waker) = waker {
                        if !batch.add_waker(waker) {
                            more = true;
                            break;
                        }
                    }
                }
                while let Some(ptr) = not_due.pop_front() {
                    entries.push_back(ptr);
                }
            }
            batch.wake_all();
            if !more {
                break;
            }
        }
        trace!(fired, "Timer::turn");
        fired
    }

    /// Returns the earliest pending deadline, if any sleeps are registered.
    ///
    /// An event loop can use this to decide how long to block for before the
    /// next [`turn`](Self::turn) is needed.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut entries = self.entries.borrow_mut();
        let mut next: Option<Instant> = None;
        let mut scratch = List::<Entry>::new();
        while let Some(ptr) = entries.pop_front() {
            // safety: the entry was linked in our list, so it is owned by a
            // live, pinned `Sleep`.
            let deadline = unsafe { ptr.as_ref() }.deadline;
            next = Some(match next {
                Some(next) if next <= deadline => next,
                _ => deadline,
            });
            scratch.push_back(ptr);
        }
        while let Some(ptr) = scratch.pop_front() {
            entries.push_back(ptr);
        }
        next
    }

    /// Returns the number of sleeps currently registered with this timer.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.get()
    }

    fn register(&self, entry: Pin<&Entry>) {
        debug_assert_eq!(entry.state.get(), EntryState::Unregistered);
        let ptr = NonNull::from(entry.get_ref());
        self.entries.borrow_mut().push_back(ptr);
        self.pending.set(self.pending.get() + 1);
        entry.state.set(EntryState::Registered);
        trace!(entry = ?fmt::ptr(ptr), deadline = %entry.deadline, "Timer::register");
    }

    fn cancel(&self, entry: Pin<&Entry>) {
        debug_assert_eq!(entry.state.get(), EntryState::Registered);
        let ptr = NonNull::from(entry.get_ref());
        unsafe {
            // safety: the entry was linked into this timer's list and nothing
            // else has unlinked it (its state is still `Registered`).
            self.entries.borrow_mut().remove(ptr);
        }
        self.pending.set(self.pending.get() - 1);
        trace!(entry = ?fmt::ptr(ptr), "Timer::cancel");
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("clock", &self.clock.name())
            .field("pending", &self.pending.get())
            .finish()
    }
}

// === impl Sleep ===

impl Sleep<'_> {
    /// Returns the [`Instant`] at which this sleep completes.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.entry.deadline
    }
}

impl Future for Sleep<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let entry = this.entry.as_ref();
        match entry.state.get() {
            EntryState::Fired => Poll::Ready(()),
            EntryState::Unregistered => {
                if this.timer.now() >= entry.deadline {
                    entry.state.set(EntryState::Fired);
                    return Poll::Ready(());
                }
                *entry.waker.borrow_mut() = Some(cx.waker().clone());
                this.timer.register(entry);
                Poll::Pending
            }
            EntryState::Registered => {
                if this.timer.now() >= entry.deadline {
                    // past due, but the timer has not been turned yet; fire
                    // ourselves instead of waiting for the turn.
                    this.timer.cancel(entry);
                    entry.state.set(EntryState::Fired);
                    return Poll::Ready(());
                }
                let mut waker = entry.waker.borrow_mut();
                match &*waker {
                    Some(current) if current.will_wake(cx.waker()) => {}
                    _ => *waker = Some(cx.waker().clone()),
                }
                Poll::Pending
            }
        }
    }
}

#[pinned_drop]
impl PinnedDrop for Sleep<'_> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        let entry = this.entry.as_ref();
        if entry.state.get() == EntryState::Registered {
            this.timer.cancel(entry);
        }
    }
}

impl fmt::Debug for Sleep<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sleep")
            .field("deadline", &self.entry.deadline)
            .field("state", &self.entry.state.get())
            .finish()
    }
}

// === impl Entry ===

unsafe impl Linked<list::Links<Entry>> for Entry {
    type Handle = NonNull<Entry>;

    fn into_ptr(r: Self::Handle) -> NonNull<Self> {
        r
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        ptr
    }

    unsafe fn links(target: NonNull<Self>) -> NonNull<list::Links<Entry>> {
        // Safety: using `ptr::addr_of_mut!` avoids creating a temporary
        // reference, which stacked borrows dislikes.
        let links = ptr::addr_of_mut!((*target.as_ptr()).links);
        // Safety: since the `target` pointer is `NonNull`, pointers to its
        // members are also not null.
        NonNull::new_unchecked(links)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test::{self, poll_once};
    use futures::pin_mut;

    #[test]
    fn sleep_fires_on_turn() {
        let _trace = test::trace_init();
        test::TestClock::reset();
        let timer = Timer::new(test::TestClock::clock());

        let sleep = timer.sleep(Duration::from_millis(10));
        pin_mut!(sleep);
        assert!(poll_once(sleep.as_mut()).is_pending());
        assert_eq!(timer.pending(), 1);

        test::TestClock::advance_ms(5);
        assert_eq!(timer.turn(), 0);
        assert!(poll_once(sleep.as_mut()).is_pending());

        test::TestClock::advance_ms(5);
        assert_eq!(timer.turn(), 1);
        assert_eq!(timer.pending(), 0);
        assert!(poll_once(sleep.as_mut()).is_ready());
    }

    #[test]
    fn past_deadline_completes_immediately() {
        let _trace = test::trace_init();
        test::TestClock::reset();
        let timer = Timer::new(test::TestClock::clock());

        test::TestClock::advance_ms(100);
        let sleep = timer.sleep_until(timer.now() - Duration::from_millis(1));
        pin_mut!(sleep);
        assert!(poll_once(sleep.as_mut()).is_ready());
        assert_eq!(timer.pending(), 0);
    }

    #[test]
    fn drop_cancels() {
        let _trace = test::trace_init();
        test::TestClock::reset();
        let timer = Timer::new(test::TestClock::clock());

        {
            let sleep = timer.sleep(Duration::from_millis(10));
            pin_mut!(sleep);
            assert!(poll_once(sleep.as_mut()).is_pending());
            assert_eq!(timer.pending(), 1);
        }
        assert_eq!(timer.pending(), 0);

        test::TestClock::advance_ms(20);
        assert_eq!(timer.turn(), 0);
    }

    #[test]
    fn fires_only_due_sleeps() {
        let _trace = test::trace_init();
        test::TestClock::reset();
        let timer = Timer::new(test::TestClock::clock());

        let short = timer.sleep(Duration::from_millis(5));
        let long = timer.sleep(Duration::from_millis(50));
        pin_mut!(short);
        pin_mut!(long);
        assert!(poll_once(short.as_mut()).is_pending());
        assert!(poll_once(long.as_mut()).is_pending());
        assert_eq!(timer.next_deadline(), Some(short.deadline()));

        test::TestClock::advance_ms(10);
        assert_eq!(timer.turn(), 1);
        assert!(poll_once(short.as_mut()).is_ready());
        assert!(poll_once(long.as_mut()).is_pending());
        assert_eq!(timer.next_deadline(), Some(long.deadline()));

        test::TestClock::advance_ms(40);
        assert_eq!(timer.turn(), 1);
        assert!(poll_once(long.as_mut()).is_ready());
        assert_eq!(timer.next_deadline(), None);
    }

    #[test]
    fn poll_past_due_fires_without_turn() {
        let _trace = test::trace_init();
        test::TestClock::reset();
        let timer = Timer::new(test::TestClock::clock());

        let sleep = timer.sleep(Duration::from_millis(5));
        pin_mut!(sleep);
        assert!(poll_once(sleep.as_mut()).is_pending());

        test::TestClock::advance_ms(5);
        // the timer has not been turned, but the deadline has passed.
        assert!(poll_once(sleep.as_mut()).is_ready());
        assert_eq!(timer.pending(), 0);
    }
}
