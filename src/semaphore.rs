//! An asynchronous [counting semaphore] for a single-threaded cooperative
//! runtime.
//!
//! A semaphore arbitrates access to a counter of abstract, interchangeable
//! *units* among any number of awaiting fibers. See the [`Semaphore`] type's
//! documentation for details.
//!
//! [counting semaphore]: https://en.wikipedia.org/wiki/Semaphore_(programming)
use crate::abort::AbortSource;
use crate::error::{
    DefaultErrorFactory, ErrorFactory, NamedErrorFactory, WaitError, WaitErrorKind, WaitResult,
};
use crate::time::{Duration, Instant, Sleep, Timer};
use crate::util::{fmt, WakeBatch};
use alloc::rc::Rc;
use cordyceps::{
    list::{self, List},
    Linked,
};
use core::cell::{Cell, RefCell};
use core::error::Error;
use core::future::Future;
use core::marker::PhantomPinned;
use core::mem;
use core::pin::Pin;
use core::ptr::{self, NonNull};
use core::task::{Context, Poll, Waker};
use pin_project::{pin_project, pinned_drop};

mod units;
pub use self::units::{OwnedUnits, Units};


/// An asynchronous [counting semaphore] for a single-threaded cooperative
/// runtime.
///
/// A `Semaphore` governs a counter of abstract *units*. Fibers [`wait`] for a
/// number of units, deducting them from the counter when they are granted,
/// and deposit them back with [`signal`]. More conveniently, the units can be
/// held in a [`Units`] guard acquired with [`get_units`], which returns them
/// automatically when dropped. Starting the counter at 1 makes the semaphore
/// an unlocked mutex; starting it at `n` bounds concurrency at `n`; starting
/// it at 0 makes a completion counter.
///
/// # Fairness
///
/// Waits are serviced strictly in arrival order. If the oldest waiter
/// requests more units than are currently available, *no* later waiter is
/// served, even if its own request could be satisfied; otherwise a fiber
/// asking for many units could be starved forever by a stream of small
/// requests. When one [`signal`] satisfies several waiters, their tasks are
/// woken in arrival order, though the runtime may interleave their
/// continuations arbitrarily.
///
/// # Failure
///
/// A semaphore can be permanently marked failed with [`broken`], which fails
/// every pending and future wait with a terminal error. Timed
/// ([`wait_until`]) and abortable ([`wait_abortable`]) waits fail just their
/// own wait. The concrete error values for all three failure kinds come from
/// the semaphore's [`ErrorFactory`] type parameter; the default factory
/// produces the generic errors, and [`NamedErrorFactory`] stamps a name into
/// the messages.
///
/// # Single-threaded
///
/// All state is kept in [`Cell`]s and [`RefCell`]s: a `Semaphore` is `!Sync`
/// by construction, and everything that touches it (waits, handles, signals)
/// must happen on its own execution context. No locks are taken anywhere.
///
/// # Examples
///
/// Bounding concurrency:
///
/// ```
/// use fiber_sync::Semaphore;
/// use futures::executor::LocalPool;
/// use futures::task::LocalSpawnExt;
/// use std::rc::Rc;
///
/// let mut pool = LocalPool::new();
/// let spawner = pool.spawner();
///
/// // Allow 4 fibers to run concurrently at a time.
/// let semaphore = Rc::new(Semaphore::new(4));
///
/// for _ in 0..8 {
///     let semaphore = semaphore.clone();
///     spawner.spawn_local(async move {
///         // Acquire units from the semaphore, returning a guard that
///         // releases them back to the semaphore when dropped. If all 4
///         // units are taken, this fiber yields until another releases.
///         let _units = semaphore
///             .get_units(1)
///             .await
///             .expect("semaphore is not broken");
///         // do some work...
///     }).unwrap();
/// }
/// pool.run();
/// # assert_eq!(semaphore.current(), 4);
/// ```
///
/// [counting semaphore]: https://en.wikipedia.org/wiki/Semaphore_(programming)
/// [`wait`]: Semaphore::wait
/// [`signal`]: Semaphore::signal
/// [`get_units`]: Semaphore::get_units
/// [`broken`]: Semaphore::broken
/// [`wait_until`]: Semaphore::wait_until
/// [`wait_abortable`]: Semaphore::wait_abortable
pub struct Semaphore<F: ErrorFactory = DefaultErrorFactory> {
    /// The number of units currently available.
    ///
    /// Signed: [`consume`](Self::consume) may drive it negative. Pinned to 0
    /// once the semaphore is broken.
    count: Cell<isize>,

    /// The terminal error, once [`broken`](Self::broken) has latched one.
    broken: RefCell<Option<WaitError>>,

    /// The queue of waiters, oldest at the back.
    ///
    /// # Safety
    ///
    /// The `RefCell` must be mutably borrowed when manipulating the linked
    /// list, OR when manipulating waiter nodes that may be linked into it. A
    /// node whose state says it is not linked may be touched without the
    /// borrow.
    queue: RefCell<List<Waiter>>,

    /// Number of waiters currently linked into `queue`.
    waiters: Cell<usize>,

    /// Units held by live [`Units`]/[`OwnedUnits`] handles, for leak
    /// diagnostics.
    outstanding: Cell<usize>,

    factory: F,
}

/// A `Semaphore` whose errors carry a name, for telling failures from
/// different semaphores apart. See [`NamedErrorFactory`].
pub type NamedSemaphore = Semaphore<NamedErrorFactory>;

/// The future returned by [`Semaphore::wait`] and its timed and abortable
/// variants.
///
/// Completes with `Ok(())` once the requested units have been deducted from
/// the semaphore's counter. The caller is then responsible for eventually
/// [`signal`](Semaphore::signal)ing them back; for a guard that does this
/// automatically, use [`Semaphore::get_units`] instead.
///
/// # Notes
///
/// This future is `!Unpin`, as it is unsafe to [`core::mem::forget`] a
/// `Wait` future once it has been polled: its waiter node may be linked into
/// the semaphore's queue. Dropping it is always safe and removes the waiter.
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Wait<'sem, F: ErrorFactory = DefaultErrorFactory> {
    semaphore: &'sem Semaphore<F>,
    units: usize,
    #[pin]
    sleep: Option<Sleep<'sem>>,
    abort: Option<AbortWait>,
    #[pin]
    waiter: Waiter,
}

/// The future returned by [`Semaphore::get_units`] and its timed and
/// abortable variants. Completes with a [`Units`] guard.
#[pin_project]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct GetUnits<'sem, F: ErrorFactory = DefaultErrorFactory> {
    #[pin]
    wait: Wait<'sem, F>,
}

/// The future returned by [`Semaphore::get_units_owned`]. Completes with an
/// [`OwnedUnits`] guard valid for the `'static` lifetime.
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct GetUnitsOwned<F: ErrorFactory = DefaultErrorFactory> {
    semaphore: Rc<Semaphore<F>>,
    units: usize,
    #[pin]
    waiter: Waiter,
}

/// A waiter node, embedded in an acquire future and linked into the
/// semaphore's queue while the wait is pending.
#[derive(Debug)]
struct Waiter {
    /// Intrusive linked list pointers.
    ///
    /// # Safety
    ///
    /// Only mutated through the owning semaphore's queue while its `RefCell`
    /// is mutably borrowed.
    links: list::Links<Waiter>,

    /// The number of units this waiter needs.
    requested: usize,

    /// The wake half of the waiting task's completion.
    waker: RefCell<Option<Waker>>,

    state: RefCell<State>,

    // This type is !Unpin due to the heuristic from:
    // <https://github.com/rust-lang/rust/pull/82834>
    _pin: PhantomPinned,
}

/// A waiter's lifecycle.
///
/// The transition out of `Queued` unlinks the node from the queue and
/// happens exactly once, no matter how many of the wakeup paths (signal,
/// timer, abort, broken, drop) race for it; whichever runs first wins and
/// the rest observe the already-transitioned state.
#[derive(Debug)]
enum State {
    /// Created, not yet linked into the queue.
    Unqueued,
    /// Linked into the queue, waiting to be granted.
    Queued,
    /// The wake loop assigned this waiter its units and unlinked it; the
    /// grant has not yet been observed by a poll.
    Granted,
    /// The broken drain failed this waiter and unlinked it; the error has
    /// not yet been observed by a poll.
    Failed(WaitError),
    /// The future observed its completion (or was cancelled); nothing more
    /// will happen.
    Finished,
}

/// The abort half of a [`Semaphore::wait_abortable`] wait.
#[derive(Debug)]
enum AbortWait {
    Subscribed(crate::abort::Subscription),
    /// The source had already aborted when the wait was created.
    AlreadyAborted(Option<Rc<dyn Error + 'static>>),
}

// === impl Semaphore ===

impl Semaphore {
    /// Returns a new `Semaphore` with `units` units in its counter.
    ///
    /// E.g., starting it at 1 is suitable for use as an unlocked mutex.
    ///
    /// # Panics
    ///
    /// If `units` is greater than [`MAX_UNITS`](Self::MAX_UNITS).
    #[must_use]
    pub const fn new(units: usize) -> Self {
        Self::new_with_factory(units, DefaultErrorFactory)
    }
}

impl<F: ErrorFactory> Semaphore<F> {
    /// The maximum number of units a `Semaphore` may hold: the largest
    /// positive value of the signed counter.
    pub const MAX_UNITS: usize = isize::MAX as usize;

    /// Returns a new `Semaphore` with `units` units available, using the
    /// provided [`ErrorFactory`] to construct the errors delivered on
    /// timeout, abort, and [`broken`](Self::broken).
    ///
    /// # Panics
    ///
    /// If `units` is greater than [`MAX_UNITS`](Self::MAX_UNITS).
    #[must_use]
    pub const fn new_with_factory(units: usize, factory: F) -> Self {
        assert!(
            units <= Self::MAX_UNITS,
            "a semaphore may not hold more than Semaphore::MAX_UNITS units",
        );
        Self {
            count: Cell::new(units as isize),
            broken: RefCell::new(None),
            queue: RefCell::new(List::new()),
            waiters: Cell::new(0),
            outstanding: Cell::new(0),
            factory,
        }
    }

    /// Returns the number of units currently available, or 0 if the counter
    /// is negative or the semaphore is [broken](Self::broken).
    ///
    /// Does not take waiters into account.
    #[must_use]
    pub fn current(&self) -> usize {
        self.count.get().max(0) as usize
    }

    /// Returns the counter verbatim.
    ///
    /// Unlike [`current`](Self::current) this accounts for units taken with
    /// [`consume`](Self::consume), and may therefore be negative.
    #[must_use]
    pub fn available_units(&self) -> isize {
        self.count.get()
    }

    /// Returns the number of waiters currently queued.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.waiters.get()
    }

    /// Returns `true` if the semaphore has been [broken](Self::broken).
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.broken.borrow().is_some()
    }

    /// Waits until at least `units` units are available, then deducts them
    /// from the counter.
    ///
    /// The units must eventually be returned with
    /// [`signal`](Self::signal)`(units)`; for a guard that does so
    /// automatically, use [`get_units`](Self::get_units).
    ///
    /// A wait for 0 units always completes immediately, without looking at
    /// the queue.
    ///
    /// # Returns
    ///
    /// The [`Wait`] future completes with
    ///
    /// - `Ok(())` once the units have been deducted;
    /// - `Err(e)` with the semaphore's terminal error if it is (or becomes)
    ///   [broken](Self::broken).
    ///
    /// # Cancellation
    ///
    /// Dropping the future removes the waiter from the queue. If it had
    /// already been granted its units but the grant was never observed by a
    /// poll, the units are signaled back.
    pub fn wait(&self, units: usize) -> Wait<'_, F> {
        Wait {
            semaphore: self,
            units,
            sleep: None,
            abort: None,
            waiter: Waiter::new(units),
        }
    }

    /// As [`wait`](Self::wait), but fails with the factory's timeout error
    /// if `deadline` passes first.
    ///
    /// The timeout is driven by `timer`: it fires when the timer is
    /// [turned](Timer::turn) at or past the deadline (or when the wait is
    /// polled past it). A deadline at or before `timer.now()` fails on first
    /// poll without ever enqueueing, and a deadline of [`Instant::MAX`] is
    /// equivalent to an untimed wait.
    pub fn wait_until<'sem>(
        &'sem self,
        timer: &'sem Timer,
        deadline: Instant,
        units: usize,
    ) -> Wait<'sem, F> {
        let sleep = (deadline < Instant::MAX).then(|| timer.sleep_until(deadline));
        Wait {
            semaphore: self,
            units,
            sleep,
            abort: None,
            waiter: Waiter::new(units),
        }
    }

    /// As [`wait_until`](Self::wait_until), with the deadline given as a
    /// duration from now.
    pub fn wait_for<'sem>(
        &'sem self,
        timer: &'sem Timer,
        duration: Duration,
        units: usize,
    ) -> Wait<'sem, F> {
        let deadline = timer.now().checked_add(duration).unwrap_or(Instant::MAX);
        self.wait_until(timer, deadline, units)
    }

    /// As [`wait`](Self::wait), but fails if `source` requests an abort
    /// first.
    ///
    /// The failure is the abort's carried reason if it has one, else the
    /// semaphore's terminal error if it broke in the same round, else the
    /// factory's aborted error. An abort already requested when the wait is
    /// created fails on first poll without ever enqueueing.
    pub fn wait_abortable(&self, source: &AbortSource, units: usize) -> Wait<'_, F> {
        Wait {
            semaphore: self,
            units,
            sleep: None,
            abort: Some(AbortWait::new(source)),
            waiter: Waiter::new(units),
        }
    }

    /// Waits until at least `units` units are available and returns them in
    /// a [`Units`] guard that signals them back to this semaphore when
    /// dropped.
    pub fn get_units(&self, units: usize) -> GetUnits<'_, F> {
        GetUnits {
            wait: self.wait(units),
        }
    }

    /// As [`get_units`](Self::get_units), failing with the factory's
    /// timeout error if `deadline` passes first. See
    /// [`wait_until`](Self::wait_until).
    pub fn get_units_until<'sem>(
        &'sem self,
        timer: &'sem Timer,
        deadline: Instant,
        units: usize,
    ) -> GetUnits<'sem, F> {
        GetUnits {
            wait: self.wait_until(timer, deadline, units),
        }
    }

    /// As [`get_units_until`](Self::get_units_until), with the deadline
    /// given as a duration from now.
    pub fn get_units_for<'sem>(
        &'sem self,
        timer: &'sem Timer,
        duration: Duration,
        units: usize,
    ) -> GetUnits<'sem, F> {
        GetUnits {
            wait: self.wait_for(timer, duration, units),
        }
    }

    /// As [`get_units`](Self::get_units), failing if `source` requests an
    /// abort first. See [`wait_abortable`](Self::wait_abortable).
    pub fn get_units_abortable(&self, source: &AbortSource, units: usize) -> GetUnits<'_, F> {
        GetUnits {
            wait: self.wait_abortable(source, units),
        }
    }

    /// As [`get_units`](Self::get_units), but for a semaphore shared in an
    /// [`Rc`], returning an [`OwnedUnits`] guard valid for the `'static`
    /// lifetime.
    ///
    /// Only the untimed variant exists: the timed and abortable futures
    /// borrow the driving [`Timer`], which would defeat the purpose. Wrap
    /// the returned future externally if a bound is needed.
    pub fn get_units_owned(self: &Rc<Self>, units: usize) -> GetUnitsOwned<F> {
        GetUnitsOwned {
            semaphore: self.clone(),
            units,
            waiter: Waiter::new(units),
        }
    }

    /// As [`try_get_units`](Self::try_get_units), but for a semaphore
    /// shared in an [`Rc`], returning an [`OwnedUnits`] guard.
    #[must_use]
    pub fn try_get_units_owned(self: &Rc<Self>, units: usize) -> Option<OwnedUnits<F>> {
        self.try_wait(units)
            .then(|| OwnedUnits::grant(self.clone(), units))
    }

    /// Attempts to deduct `units` from the counter without waiting.
    ///
    /// Succeeds only under the same gating as a synchronous
    /// [`wait`](Self::wait): sufficient units available *and* no fiber
    /// already waiting. Useful for opportunistic work that is not worth
    /// queueing for.
    ///
    /// # Returns
    ///
    /// `true` if the counter had sufficient units and was decremented.
    pub fn try_wait(&self, units: usize) -> bool {
        if units == 0 {
            return true;
        }
        if self.may_proceed(units) {
            self.count.set(self.count.get() - units as isize);
            trace!(units, count = self.count.get(), "Semaphore::try_wait -> acquired");
            true
        } else {
            trace!(units, count = self.count.get(), "Semaphore::try_wait -> insufficient");
            false
        }
    }

    /// Attempts to take `units` into a [`Units`] guard without waiting.
    ///
    /// Returns [`None`] under the same conditions that
    /// [`try_wait`](Self::try_wait) returns `false`.
    #[must_use]
    pub fn try_get_units(&self, units: usize) -> Option<Units<'_, F>> {
        self.try_wait(units).then(|| Units::grant(self, units))
    }

    /// Deducts `units` from the counter immediately, without gating and
    /// without waking anyone; the counter may go negative.
    ///
    /// No-op if the semaphore is [broken](Self::broken).
    pub fn consume(&self, units: usize) {
        if self.is_broken() {
            trace!(units, "Semaphore::consume -> broken; doing nothing");
            return;
        }
        self.count.set(self.count.get() - units as isize);
        trace!(units, count = self.count.get(), "Semaphore::consume");
    }

    /// [`consume`](Self::consume)s `units` and returns a [`Units`] guard
    /// that will repay the loan when dropped.
    ///
    /// Dropping the guard restores the counter to its pre-`consume_units`
    /// value (and runs the wake loop, possibly serving queued waiters).
    pub fn consume_units(&self, units: usize) -> Units<'_, F> {
        self.consume(units);
        Units::grant(self, units)
    }

    /// Deposits `units` units into the counter, then serves queued waiters
    /// in arrival order for as long as the front of the queue is
    /// satisfiable.
    ///
    /// Woken waiters have their units deducted here, before this call
    /// returns; their task continuations run whenever the runtime next polls
    /// them. No-op if the semaphore is [broken](Self::broken).
    ///
    /// Overflowing the counter past [`MAX_UNITS`](Self::MAX_UNITS) is a
    /// caller contract violation; the addition is unchecked in release
    /// builds.
    pub fn signal(&self, units: usize) {
        if units == 0 {
            return;
        }
        if self.is_broken() {
            trace!(units, "Semaphore::signal -> broken; doing nothing");
            return;
        }
        self.count.set(self.count.get() + units as isize);
        trace!(units, count = self.count.get(), "Semaphore::signal");
        self.wake_ready();
    }

    /// Marks the semaphore permanently failed with the factory's broken
    /// error.
    ///
    /// Every queued waiter fails with the error immediately, the counter is
    /// pinned at 0, and every future wait fails with the same error.
    /// [`signal`](Self::signal) and [`consume`](Self::consume) become
    /// no-ops. This is the way to unstick every fiber blocked on a semaphore
    /// whose underlying resource has failed.
    pub fn broken(&self) {
        self.break_with(self.factory.broken());
    }

    /// As [`broken`](Self::broken), failing waiters with `error` (wrapped
    /// as the cause of a broken-semaphore error) instead of the factory's.
    pub fn broken_with(&self, error: impl Error + 'static) {
        self.break_with(WaitError::with_cause(WaitErrorKind::Broken, Rc::new(error)));
    }

    fn break_with(&self, error: WaitError) {
        trace!(%error, waiters = self.waiters.get(), "Semaphore::broken");
        *self.broken.borrow_mut() = Some(error.clone());
        self.count.set(0);
        loop {
            let mut batch = WakeBatch::new();
            let mut drained = true;
            {
                let mut queue = self.queue.borrow_mut();
                while let Some(ptr) = queue.pop_back() {
                    self.waiters.set(self.waiters.get() - 1);
                    // safety: the node was linked in our queue, so it is owned
                    // by a live, pinned acquire future.
                    let waiter = unsafe { ptr.as_ref() };
                    *waiter.state.borrow_mut() = State::Failed(error.clone());
                    let waker = waiter.waker.borrow_mut().take();
                    if let Some(waker) = waker {
                        if !batch.add_waker(waker) {
                            drained = false;
                            break;
                        }
                    }
                }
            }
            batch.wake_all();
            if drained {
                break;
            }
        }
    }

    /// Reserves storage for `additional` queued waiters.
    ///
    /// Waiter storage is embedded in the acquire futures themselves, so
    /// enqueueing can never fail to allocate and there is nothing to
    /// reserve; this is a no-op.
    pub fn ensure_space_for_waiters(&self, additional: usize) {
        let _ = additional;
    }

    /// Acquires `units`, runs `f`, awaits the future it returns, and
    /// releases the units, whichever way the future completes.
    ///
    /// The units are held in a guard across the `.await`, so they are
    /// returned even if the future is cancelled or panics.
    ///
    /// ```
    /// use fiber_sync::Semaphore;
    ///
    /// # futures::executor::block_on(async {
    /// let semaphore = Semaphore::new(3);
    /// let sum = semaphore
    ///     .with_units(2, || async { 1 + 1 })
    ///     .await
    ///     .expect("semaphore is not broken");
    /// assert_eq!(sum, 2);
    /// assert_eq!(semaphore.current(), 3);
    /// # });
    /// ```
    pub async fn with_units<T, Fut>(&self, units: usize, f: impl FnOnce() -> Fut) -> WaitResult<T>
    where
        Fut: Future<Output = T>,
    {
        let _units = self.get_units(units).await?;
        Ok(f().await)
    }

    /// As [`with_units`](Self::with_units), failing with the factory's
    /// timeout error if the units cannot be acquired by `deadline`.
    ///
    /// The deadline bounds the *acquisition*, not the execution of `f`.
    pub async fn with_units_until<T, Fut>(
        &self,
        timer: &Timer,
        deadline: Instant,
        units: usize,
        f: impl FnOnce() -> Fut,
    ) -> WaitResult<T>
    where
        Fut: Future<Output = T>,
    {
        let _units = self.get_units_until(timer, deadline, units).await?;
        Ok(f().await)
    }

    /// As [`with_units_until`](Self::with_units_until), with the deadline
    /// given as a duration from now.
    pub async fn with_units_for<T, Fut>(
        &self,
        timer: &Timer,
        duration: Duration,
        units: usize,
        f: impl FnOnce() -> Fut,
    ) -> WaitResult<T>
    where
        Fut: Future<Output = T>,
    {
        let _units = self.get_units_for(timer, duration, units).await?;
        Ok(f().await)
    }

    fn has_available(&self, units: usize) -> bool {
        let count = self.count.get();
        count >= 0 && count as usize >= units
    }

    fn may_proceed(&self, units: usize) -> bool {
        self.has_available(units) && self.waiters.get() == 0
    }

    /// Serves the front of the queue for as long as it is satisfiable.
    fn wake_ready(&self) {
        loop {
            let mut batch = WakeBatch::new();
            let mut done = true;
            {
                let mut queue = self.queue.borrow_mut();
                loop {
                    // oldest waiter is at the back.
                    let requested = match queue.back() {
                        Some(waiter) => waiter.requested,
                        None => break,
                    };
                    if !self.has_available(requested) {
                        // head-of-line blocking: the front waiter gates
                        // everyone behind it, whatever they requested.
                        break;
                    }
                    if !batch.can_add_waker() {
                        done = false;
                        break;
                    }
                    let ptr = queue.pop_back().expect("queue was just non-empty");
                    self.count.set(self.count.get() - requested as isize);
                    self.waiters.set(self.waiters.get() - 1);
                    // safety: the node was linked in our queue, so it is owned
                    // by a live, pinned acquire future.
                    let waiter = unsafe { ptr.as_ref() };
                    *waiter.state.borrow_mut() = State::Granted;
                    trace!(
                        waiter = ?fmt::ptr(ptr),
                        requested,
                        count = self.count.get(),
                        "Semaphore::wake_ready -> granted"
                    );
                    let waker = waiter.waker.borrow_mut().take();
                    if let Some(waker) = waker {
                        batch.add_waker(waker);
                    }
                }
            }
            // queue borrow released: a woken task that runs inline may
            // re-enter the semaphore freely.
            batch.wake_all();
            if done {
                break;
            }
        }
    }

    fn poll_wait(
        &self,
        waiter: Pin<&mut Waiter>,
        units: usize,
        sleep: Option<Pin<&mut Sleep<'_>>>,
        abort: Option<&mut AbortWait>,
        cx: &mut Context<'_>,
    ) -> Poll<WaitResult<()>> {
        let waiter = waiter.into_ref();
        trace!(waiter = ?fmt::ptr(NonNull::from(waiter.get_ref())), units, "Semaphore::poll_wait");

        // dispatch on anything that already completed this waiter. the
        // borrow must end before the match re-borrows in the fall-through
        // arm, so bind the replaced state first.
        let prev = mem::replace(&mut *waiter.state.borrow_mut(), State::Finished);
        match prev {
            State::Granted => return Poll::Ready(Ok(())),
            State::Failed(error) => return Poll::Ready(Err(error)),
            State::Finished => panic!("acquire future polled after completion"),
            prev => *waiter.state.borrow_mut() = prev,
        }
        let queued = matches!(&*waiter.state.borrow(), State::Queued);

        if !queued {
            // a zero-unit wait never interacts with the queue, broken or not.
            if units == 0 {
                *waiter.state.borrow_mut() = State::Finished;
                return Poll::Ready(Ok(()));
            }
            if self.may_proceed(units) {
                self.count.set(self.count.get() - units as isize);
                *waiter.state.borrow_mut() = State::Finished;
                trace!(units, count = self.count.get(), "Semaphore::poll_wait -> ready");
                return Poll::Ready(Ok(()));
            }
            if let Some(error) = self.broken.borrow().clone() {
                *waiter.state.borrow_mut() = State::Finished;
                return Poll::Ready(Err(error));
            }
        }

        // cancellation sources fire only while the grant has not happened.
        if let Some(sleep) = sleep {
            if sleep.poll(cx).is_ready() {
                self.cancel_waiter(waiter);
                trace!(units, "Semaphore::poll_wait -> timed out");
                return Poll::Ready(Err(self.factory.timeout()));
            }
        }
        if let Some(abort) = abort {
            if let Poll::Ready(reason) = abort.poll(cx) {
                self.cancel_waiter(waiter);
                trace!(units, "Semaphore::poll_wait -> aborted");
                let error = match reason {
                    Some(cause) => WaitError::with_cause(WaitErrorKind::Aborted, cause),
                    None => match self.broken.borrow().clone() {
                        Some(error) => error,
                        None => self.factory.aborted(),
                    },
                };
                return Poll::Ready(Err(error));
            }
        }

        // we will wait: register the polling task's waker, and enqueue the
        // node if this is its first pending poll.
        {
            let mut waker = waiter.waker.borrow_mut();
            match &*waker {
                Some(current) if current.will_wake(cx.waker()) => {}
                _ => *waker = Some(cx.waker().clone()),
            }
        }
        if !queued {
            let ptr = NonNull::from(waiter.get_ref());
            self.queue.borrow_mut().push_front(ptr);
            self.waiters.set(self.waiters.get() + 1);
            *waiter.state.borrow_mut() = State::Queued;
            trace!(waiter = ?fmt::ptr(ptr), units, "Semaphore::poll_wait -> enqueued");
        }
        Poll::Pending
    }

    /// Fails a waiter out of the queue on a timeout or abort.
    fn cancel_waiter(&self, waiter: Pin<&Waiter>) {
        let mut state = waiter.state.borrow_mut();
        if matches!(&*state, State::Queued) {
            let ptr = NonNull::from(waiter.get_ref());
            unsafe {
                // safety: state `Queued` means the node is linked in our
                // queue and nothing else has unlinked it.
                self.queue.borrow_mut().remove(ptr);
            }
            self.waiters.set(self.waiters.get() - 1);
        }
        *state = State::Finished;
    }

    /// Drop an acquire future.
    ///
    /// Factored out onto `Semaphore` because the same code runs when
    /// dropping a [`Wait`] or a [`GetUnitsOwned`] future.
    fn drop_wait(&self, waiter: Pin<&Waiter>, units: usize) {
        let state = mem::replace(&mut *waiter.state.borrow_mut(), State::Finished);
        match state {
            State::Queued => {
                let ptr = NonNull::from(waiter.get_ref());
                unsafe {
                    // safety: state `Queued` means the node is linked in our
                    // queue and nothing else has unlinked it.
                    self.queue.borrow_mut().remove(ptr);
                }
                self.waiters.set(self.waiters.get() - 1);
                trace!(waiter = ?fmt::ptr(ptr), "drop_wait -> dequeued");
            }
            State::Granted => {
                // the wake loop assigned units that no poll ever observed;
                // return them so waiters behind us are not starved.
                trace!(units, "drop_wait -> returning unobserved grant");
                self.signal(units);
            }
            _ => {}
        }
    }

    /// Registers `units` as held by a newly created handle.
    fn track_granted(&self, units: usize) {
        self.outstanding.set(self.outstanding.get() + units);
    }

    /// Returns `units` from a handle: unregisters them and signals.
    fn return_granted(&self, units: usize) {
        self.forget_granted(units);
        self.signal(units);
    }

    /// Unregisters `units` without signaling (handle `release`).
    fn forget_granted(&self, units: usize) {
        debug_assert!(self.outstanding.get() >= units);
        self.outstanding.set(self.outstanding.get() - units);
    }
}

impl<F: ErrorFactory> Drop for Semaphore<F> {
    fn drop(&mut self) {
        // reachable only by `mem::forget`ing a handle: live handles borrow
        // the semaphore or keep it alive through an `Rc`.
        debug_assert_eq!(
            self.outstanding.get(),
            0,
            "semaphore dropped while granted units are still outstanding",
        );
    }
}

impl<F: ErrorFactory> fmt::Debug for Semaphore<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("count", &self.count.get())
            .field("waiters", &self.waiters.get())
            .field("broken", &fmt::opt(&self.broken.borrow()).or_else("None"))
            .field("outstanding", &self.outstanding.get())
            .finish()
    }
}

// === impl Wait ===

impl<F: ErrorFactory> Future for Wait<'_, F> {
    type Output = WaitResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        this.semaphore.poll_wait(
            this.waiter,
            *this.units,
            this.sleep.as_pin_mut(),
            this.abort.as_mut(),
            cx,
        )
    }
}

#[pinned_drop]
impl<F: ErrorFactory> PinnedDrop for Wait<'_, F> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        this.semaphore.drop_wait(this.waiter.into_ref(), *this.units);
    }
}

impl<F: ErrorFactory> fmt::Debug for Wait<'_, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wait")
            .field("units", &self.units)
            .field("waiter", &self.waiter.state.borrow())
            .finish_non_exhaustive()
    }
}

// === impl GetUnits ===

impl<'sem, F: ErrorFactory> Future for GetUnits<'sem, F> {
    type Output = WaitResult<Units<'sem, F>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let semaphore = self.wait.semaphore;
        let units = self.wait.units;
        self.project()
            .wait
            .poll(cx)
            .map_ok(|()| Units::grant(semaphore, units))
    }
}

impl<F: ErrorFactory> fmt::Debug for GetUnits<'_, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GetUnits").field("wait", &self.wait).finish()
    }
}

// === impl GetUnitsOwned ===

impl<F: ErrorFactory> Future for GetUnitsOwned<F> {
    type Output = WaitResult<OwnedUnits<F>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        this.semaphore
            .poll_wait(this.waiter, *this.units, None, None, cx)
            .map_ok(|()| OwnedUnits::grant(this.semaphore.clone(), *this.units))
    }
}

#[pinned_drop]
impl<F: ErrorFactory> PinnedDrop for GetUnitsOwned<F> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        this.semaphore.drop_wait(this.waiter.into_ref(), *this.units);
    }
}

impl<F: ErrorFactory> fmt::Debug for GetUnitsOwned<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GetUnitsOwned")
            .field("units", &self.units)
            .field("waiter", &self.waiter.state.borrow())
            .finish_non_exhaustive()
    }
}

// === impl Waiter ===

impl Waiter {
    fn new(requested: usize) -> Self {
        debug_assert!(
            requested <= Semaphore::<DefaultErrorFactory>::MAX_UNITS,
            "cannot wait for more units than a semaphore can hold",
        );
        Self {
            links: list::Links::new(),
            requested,
            waker: RefCell::new(None),
            state: RefCell::new(State::Unqueued),
            _pin: PhantomPinned,
        }
    }
}

unsafe impl Linked<list::Links<Waiter>> for Waiter {
    type Handle = NonNull<Waiter>;

    fn into_ptr(r: Self::Handle) -> NonNull<Self> {
        r
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        ptr
    }

    unsafe fn links(target: NonNull<Self>) -> NonNull<list::Links<Waiter>> {
        // Safety: using `ptr::addr_of_mut!` avoids creating a temporary
        // reference, which stacked borrows dislikes.
        let links = ptr::addr_of_mut!((*target.as_ptr()).links);
        // Safety: since the `target` pointer is `NonNull`, pointers to its
        // members are also not null.
        NonNull::new_unchecked(links)
    }
}

// === impl AbortWait ===

impl AbortWait {
    fn new(source: &AbortSource) -> Self {
        match source.subscribe() {
            Some(subscription) => Self::Subscribed(subscription),
            None => Self::AlreadyAborted(source.reason()),
        }
    }

    fn poll(&mut self, cx: &mut Context<'_>) -> Poll<Option<Rc<dyn Error + 'static>>> {
        match self {
            Self::Subscribed(subscription) => subscription.poll_aborted(cx),
            Self::AlreadyAborted(reason) => Poll::Ready(reason.clone()),
        }
    }
}
