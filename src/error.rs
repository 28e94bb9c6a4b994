//! Error types produced by failed waits and misused unit handles.
//!
//! Every asynchronous acquire operation on a [`Semaphore`] fails with a
//! [`WaitError`], a cheaply cloneable value carrying one of three
//! [kinds](WaitErrorKind): the wait timed out, the wait was aborted, or the
//! semaphore was permanently [broken]. Which concrete error values are
//! produced is decided by the semaphore's [`ErrorFactory`], so applications
//! can attach context (see [`NamedErrorFactory`]) without the semaphore
//! knowing about it.
//!
//! [`Semaphore`]: crate::Semaphore
//! [broken]: crate::Semaphore::broken
use crate::util::fmt;
use alloc::rc::Rc;
use core::error::Error;

/// The kind of failure delivered to a waiter.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum WaitErrorKind {
    /// The wait's deadline elapsed before enough units became available.
    TimedOut,
    /// An [`AbortSource`](crate::abort::AbortSource) fired before enough
    /// units became available.
    Aborted,
    /// The semaphore was marked [broken](crate::Semaphore::broken); all
    /// pending and future waits fail.
    Broken,
}

/// An error completing a [`Semaphore`](crate::Semaphore) wait.
///
/// `WaitError`s are cheap to clone: a single broken-semaphore error is
/// delivered to every queued waiter and to every wait that starts afterwards.
#[derive(Clone, Debug)]
pub struct WaitError {
    kind: WaitErrorKind,
    message: Option<Rc<str>>,
    cause: Option<Rc<dyn Error + 'static>>,
}

/// The result of waiting on a [`Semaphore`](crate::Semaphore).
pub type WaitResult<T> = Result<T, WaitError>;

/// Produces the error values delivered by a semaphore's failure paths.
///
/// All three methods have defaults returning the generic error of the
/// matching kind, so a factory only overrides the failures it wants to
/// dress up. Factory methods return plain values and cannot themselves
/// fail, so a misbehaving factory cannot disturb the semaphore's
/// bookkeeping.
pub trait ErrorFactory {
    /// The error delivered when a wait's deadline elapses.
    fn timeout(&self) -> WaitError {
        WaitError::timed_out()
    }

    /// The error delivered to waiters when the semaphore is
    /// [broken](crate::Semaphore::broken) without an explicit error.
    fn broken(&self) -> WaitError {
        WaitError::broken()
    }

    /// The error delivered when a wait is aborted and the abort carried no
    /// reason of its own.
    fn aborted(&self) -> WaitError {
        WaitError::aborted()
    }
}

/// The default [`ErrorFactory`], producing the generic error for each kind.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DefaultErrorFactory;

/// An [`ErrorFactory`] that adds a semaphore name to every error message.
///
/// Useful when many semaphores guard different resources and a failure needs
/// to say which one it came from:
///
/// ```
/// use fiber_sync::{NamedSemaphore, NamedErrorFactory};
///
/// let sem = NamedSemaphore::new_with_factory(
///     0,
///     NamedErrorFactory::new("file-open-limit"),
/// );
/// sem.broken();
/// ```
#[derive(Clone, Debug)]
pub struct NamedErrorFactory {
    name: Rc<str>,
}

/// Error returned by [`Units`](crate::Units) operations asked to give up
/// more units than the handle holds.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NotEnoughUnits {
    requested: usize,
    held: usize,
}

// === impl WaitError ===

impl WaitError {
    /// Returns the generic timed-out error.
    #[must_use]
    pub fn timed_out() -> Self {
        Self::new(WaitErrorKind::TimedOut)
    }

    /// Returns the generic aborted error.
    #[must_use]
    pub fn aborted() -> Self {
        Self::new(WaitErrorKind::Aborted)
    }

    /// Returns the generic broken-semaphore error.
    #[must_use]
    pub fn broken() -> Self {
        Self::new(WaitErrorKind::Broken)
    }

    /// Returns an error of `kind` with a custom message.
    #[must_use]
    pub fn with_message(kind: WaitErrorKind, message: impl Into<Rc<str>>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::new(kind)
        }
    }

    /// Returns an error of `kind` wrapping an underlying cause.
    ///
    /// The cause is shared, so the same `WaitError` may be delivered to any
    /// number of waiters.
    #[must_use]
    pub fn with_cause(kind: WaitErrorKind, cause: Rc<dyn Error + 'static>) -> Self {
        Self {
            cause: Some(cause),
            ..Self::new(kind)
        }
    }

    fn new(kind: WaitErrorKind) -> Self {
        Self {
            kind,
            message: None,
            cause: None,
        }
    }

    /// Returns the kind of failure this error describes.
    #[must_use]
    pub fn kind(&self) -> WaitErrorKind {
        self.kind
    }

    /// Returns `true` if this error was produced by a deadline elapsing.
    #[must_use]
    pub fn is_timed_out(&self) -> bool {
        self.kind == WaitErrorKind::TimedOut
    }

    /// Returns `true` if this error was produced by an abort.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.kind == WaitErrorKind::Aborted
    }

    /// Returns `true` if this error was produced by breaking the semaphore.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.kind == WaitErrorKind::Broken
    }

    /// Returns the underlying cause, if one was attached.
    #[must_use]
    pub fn cause(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_deref()
    }

    fn default_message(&self) -> &'static str {
        match self.kind {
            WaitErrorKind::TimedOut => "semaphore timed out",
            WaitErrorKind::Aborted => "semaphore wait aborted",
            WaitErrorKind::Broken => "semaphore broken",
        }
    }
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref message) = self.message {
            return f.pad(message);
        }
        if let Some(ref cause) = self.cause {
            return fmt::Display::fmt(cause, f);
        }
        f.pad(self.default_message())
    }
}

impl Error for WaitError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_deref()
    }
}

// === impl DefaultErrorFactory ===

impl ErrorFactory for DefaultErrorFactory {}

// === impl NamedErrorFactory ===

impl NamedErrorFactory {
    /// Returns a factory stamping `name` into every error it produces.
    #[must_use]
    pub fn new(name: impl Into<Rc<str>>) -> Self {
        Self { name: name.into() }
    }

    /// Returns the semaphore name carried by this factory.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl ErrorFactory for NamedErrorFactory {
    fn timeout(&self) -> WaitError {
        WaitError::with_message(
            WaitErrorKind::TimedOut,
            alloc::format!("semaphore '{}' timed out", self.name),
        )
    }

    fn broken(&self) -> WaitError {
        WaitError::with_message(
            WaitErrorKind::Broken,
            alloc::format!("semaphore '{}' broken", self.name),
        )
    }

    fn aborted(&self) -> WaitError {
        WaitError::with_message(
            WaitErrorKind::Aborted,
            alloc::format!("semaphore '{}' wait aborted", self.name),
        )
    }
}

// === impl NotEnoughUnits ===

impl NotEnoughUnits {
    pub(crate) fn new(requested: usize, held: usize) -> Self {
        debug_assert!(requested > held);
        Self { requested, held }
    }

    /// The number of units the operation asked for.
    #[must_use]
    pub fn requested(&self) -> usize {
        self.requested
    }

    /// The number of units the handle actually held.
    #[must_use]
    pub fn held(&self) -> usize {
        self.held
    }
}

impl fmt::Display for NotEnoughUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot take {} units from a handle holding {}",
            self.requested, self.held
        )
    }
}

impl Error for NotEnoughUnits {}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn default_messages() {
        assert_eq!(WaitError::timed_out().to_string(), "semaphore timed out");
        assert_eq!(WaitError::broken().to_string(), "semaphore broken");
        assert_eq!(WaitError::aborted().to_string(), "semaphore wait aborted");
    }

    #[test]
    fn kinds() {
        assert!(WaitError::timed_out().is_timed_out());
        assert!(WaitError::aborted().is_aborted());
        assert!(WaitError::broken().is_broken());
        assert_eq!(WaitError::broken().kind(), WaitErrorKind::Broken);
    }

    #[test]
    fn cause_is_displayed_and_sourced() {
        let cause: Rc<dyn Error> = Rc::new(NotEnoughUnits::new(3, 1));
        let err = WaitError::with_cause(WaitErrorKind::Broken, cause);
        assert_eq!(
            err.to_string(),
            "cannot take 3 units from a handle holding 1"
        );
        assert!(err.cause().is_some());
        assert!(Error::source(&err).is_some());
    }

    #[test]
    fn named_factory_mentions_the_name() {
        let factory = NamedErrorFactory::new("disk-io");
        assert_eq!(factory.timeout().to_string(), "semaphore 'disk-io' timed out");
        assert_eq!(factory.broken().to_string(), "semaphore 'disk-io' broken");
        assert_eq!(
            factory.aborted().to_string(),
            "semaphore 'disk-io' wait aborted"
        );
        assert!(factory.timeout().is_timed_out());
    }

    #[test]
    fn default_factory_uses_generic_errors() {
        let factory = DefaultErrorFactory;
        assert!(factory.timeout().is_timed_out());
        assert!(factory.broken().is_broken());
        assert!(factory.aborted().is_aborted());
    }
}
